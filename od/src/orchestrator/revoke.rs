//! License revocation signalling
//!
//! A processor that revokes the device license announces it through a
//! [`RevokeSender`] before the host goes down, and waits for the answer. In
//! embedded deployments the credentials the resumed flow will need are
//! stashed and the task is parked in `REVOKING` before that answer is sent,
//! so the parked state is on disk by the time the processor carries on.

use std::sync::Weak;
use taskstore::{ErrorUpdate, TaskStatus};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use super::Orchestrator;
use crate::config::DeploymentMode;
use crate::error::OnboardResult;
use crate::secrets::{PRIMARY_SECRET_ID, SECONDARY_SECRET_ID};
use crate::state::StateError;

pub const REVOKING_LICENSE: &str = "revoking license";

#[derive(Debug, Clone, PartialEq)]
pub struct RevokeEvent {
    pub task_id: String,
    /// License manager credential
    pub primary: String,
    /// Device credential the license manager uses
    pub secondary: String,
}

/// A revoke event and where its outcome goes
#[derive(Debug)]
pub(super) struct RevokeRequest {
    event: RevokeEvent,
    reply: oneshot::Sender<OnboardResult<bool>>,
}

/// Handle for announcing a license revocation to the orchestrator
#[derive(Debug, Clone)]
pub struct RevokeSender {
    tx: mpsc::Sender<RevokeRequest>,
}

impl RevokeSender {
    /// Announce a revocation and wait until it has been recorded
    ///
    /// `Ok(true)` once the task is parked and persisted, `Ok(false)` when the
    /// deployment ignores revocations.
    pub async fn revoke(&self, event: RevokeEvent) -> OnboardResult<bool> {
        debug!(task_id = %event.task_id, "RevokeSender::revoke: called");
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(RevokeRequest { event, reply })
            .await
            .map_err(|_| StateError::ChannelError)?;
        rx.await.map_err(|_| StateError::ChannelError)?
    }
}

pub(super) fn channel(size: usize) -> (RevokeSender, mpsc::Receiver<RevokeRequest>) {
    let (tx, rx) = mpsc::channel(size);
    (RevokeSender { tx }, rx)
}

/// Serve revoke requests until the orchestrator is gone
pub(super) async fn listen(orchestrator: Weak<Orchestrator>, mut rx: mpsc::Receiver<RevokeRequest>) {
    debug!("revoke::listen: called");
    while let Some(RevokeRequest { event, reply }) = rx.recv().await {
        let Some(orchestrator) = orchestrator.upgrade() else {
            let _ = reply.send(Err(StateError::ChannelError.into()));
            break;
        };
        let task_id = event.task_id.clone();
        let outcome = orchestrator.handle_revoke(event).await;
        if let Err(e) = &outcome {
            warn!(%task_id, error = %e, "Failed to handle license revocation");
        }
        let _ = reply.send(outcome);
    }
    debug!("revoke::listen: channel closed, exiting");
}

impl Orchestrator {
    /// Stash credentials and park the task; returns whether the event applied
    pub async fn handle_revoke(&self, event: RevokeEvent) -> OnboardResult<bool> {
        debug!(task_id = %event.task_id, "handle_revoke: called");
        if self.config.deployment != DeploymentMode::Embedded {
            info!(task_id = %event.task_id, deployment = %self.config.deployment, "Ignoring license revocation outside embedded deployment");
            return Ok(false);
        }

        let vault = &self.collaborators.vault;
        vault.stash(PRIMARY_SECRET_ID, &event.primary).await?;
        vault.stash(SECONDARY_SECRET_ID, &event.secondary).await?;

        self.state
            .update_result(
                &event.task_id,
                Some(202),
                Some(TaskStatus::Revoking),
                Some(REVOKING_LICENSE),
                ErrorUpdate::Keep,
            )
            .await?;
        // recovery only resumes what made it to disk
        self.state.persist().await?;
        info!(task_id = %event.task_id, "License revocation in progress, expecting restart");
        Ok(true)
    }

    /// Whether a revocation parked the task during processing
    pub(super) async fn is_revoking(&self, task_id: &str) -> OnboardResult<bool> {
        let task = self.state.get_task(task_id).await?;
        Ok(task.result.status == Some(TaskStatus::Revoking))
    }
}
