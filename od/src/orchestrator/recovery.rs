//! Start-up recovery
//!
//! Only the embedded deployment restarts mid-task: a device reboot or a
//! license revocation takes this process down with it. On the way back up the
//! most recent task tells us which of the two happened.

use std::sync::Arc;
use taskstore::{ErrorUpdate, TaskStatus};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use super::Orchestrator;
use super::flow::PROCESSING;
use super::workflow::{Responder, Workflow};
use crate::config::DeploymentMode;
use crate::declaration::{Envelope, inject_license_credentials, strip_revoke};
use crate::error::OnboardResult;
use crate::reboot::SUCCESS;
use crate::secrets::{PRIMARY_SECRET_ID, SECONDARY_SECRET_ID};

pub const RESUME_FAILED: &str = "failed to resume after license revocation";

/// What start-up recovery did
#[derive(Debug)]
pub enum Recovery {
    /// Nothing to recover
    Nothing,
    /// A task waiting on reboot was marked complete
    RebootCompleted { task_id: String },
    /// A task interrupted by revocation is being resumed in the background
    Resuming { task_id: String, handle: JoinHandle<()> },
}

impl Orchestrator {
    /// Finish or resume the task a restart interrupted
    ///
    /// Returns as soon as start-up may proceed; a revoke resume keeps running
    /// on the returned handle.
    pub async fn recover(self: &Arc<Self>) -> OnboardResult<Recovery> {
        debug!("recover: called");
        if self.config.deployment != DeploymentMode::Embedded {
            return Ok(Recovery::Nothing);
        }
        let Some(task) = self.state.most_recent_task().await? else {
            return Ok(Recovery::Nothing);
        };

        match task.result.status {
            Some(TaskStatus::Rebooting) => {
                info!(task_id = %task.id, "Reboot finished while we were down, completing task");
                self.state.set_reboot_required(&task.id, false).await?;
                self.state
                    .update_result(&task.id, Some(200), Some(TaskStatus::Ok), Some(SUCCESS), ErrorUpdate::Keep)
                    .await?;
                self.persist().await;
                Ok(Recovery::RebootCompleted { task_id: task.id })
            }
            Some(TaskStatus::Revoking) => {
                info!(task_id = %task.id, "Resuming task after license revocation");
                let this = Arc::clone(self);
                let task_id = task.id.clone();
                let handle = tokio::spawn(async move { this.resume_after_revoke(task_id).await });
                Ok(Recovery::Resuming {
                    task_id: task.id,
                    handle,
                })
            }
            status => {
                debug!(?status, "recover: most recent task needs nothing");
                Ok(Recovery::Nothing)
            }
        }
    }

    async fn resume_after_revoke(self: Arc<Self>, task_id: String) {
        let workflow = match self.prepare_resume(&task_id).await {
            Ok(workflow) => workflow,
            Err(e) if e.is_fatal() => {
                error!(%task_id, error = %e, "Resume aborted");
                return;
            }
            Err(e) => {
                if let Err(e) = self.fail(&task_id, RESUME_FAILED, &e).await {
                    error!(%task_id, error = %e, "Cannot record resume failure");
                }
                return;
            }
        };
        self.run(workflow, Responder::detached()).await;
    }

    /// Rebuild the declaration the revoke interrupted
    ///
    /// The stored declaration is masked, so credentials the license objects
    /// still need come back from the vault. Stashes are deleted once read.
    async fn prepare_resume(&self, task_id: &str) -> OnboardResult<Workflow> {
        debug!(%task_id, "prepare_resume: called");
        self.state
            .update_result(task_id, Some(202), Some(TaskStatus::Running), Some(PROCESSING), ErrorUpdate::Keep)
            .await?;
        let task = self.state.get_task(task_id).await?;

        let mut envelope = Envelope::from_value(task.internal_declaration.clone())?;
        let needs = strip_revoke(&mut envelope.declaration);

        let vault = &self.collaborators.vault;
        let primary = match needs.primary {
            true => Some(vault.recover(PRIMARY_SECRET_ID).await?),
            false => None,
        };
        let secondary = match needs.secondary {
            true => Some(vault.recover(SECONDARY_SECRET_ID).await?),
            false => None,
        };
        vault.delete(PRIMARY_SECRET_ID).await?;
        vault.delete(SECONDARY_SECRET_ID).await?;

        // stored copy loses the revoke instruction; credentials are masked again
        self.state.set_declaration(task_id, &envelope.to_value()).await?;
        self.persist().await;

        inject_license_credentials(&mut envelope.declaration, primary.as_deref(), secondary.as_deref());
        Ok(Workflow::new(task_id, envelope, task.request_options))
    }
}
