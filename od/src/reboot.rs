//! Reboot coordination
//!
//! After configuration is applied, the task either ends `OK` or moves to
//! `REBOOTING`. A reboot is then triggered and awaited, unless this process
//! runs on the device itself: in that case the reboot restarts us and
//! start-up recovery finishes the task.

use std::time::Duration;
use taskstore::{ErrorUpdate, TaskStatus};
use tracing::{debug, info, warn};

use crate::config::{DeploymentMode, RebootConfig};
use crate::device::{Device, DeviceError};
use crate::error::OnboardResult;
use crate::state::StateManager;

pub const SUCCESS: &str = "success";
pub const REBOOT_REQUIRED: &str = "reboot required";
pub const REBOOT_FAILED: &str = "reboot failed";

/// What `reboot_if_required` ended up doing
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RebootOutcome {
    /// No reboot was pending
    NotRequired,
    /// Reboot triggered; completion is left to start-up recovery
    Deferred,
    /// Device came back; task is `OK`
    Completed,
    /// Reboot or readiness failed; task is `ERROR`
    Failed,
}

pub struct RebootCoordinator {
    state: StateManager,
    mode: DeploymentMode,
    settings: RebootConfig,
}

impl RebootCoordinator {
    pub fn new(state: StateManager, mode: DeploymentMode, settings: RebootConfig) -> Self {
        Self { state, mode, settings }
    }

    /// Record the post-configuration outcome
    ///
    /// `200/OK` when no reboot is needed, otherwise the flag is set and the
    /// task moves to `202/REBOOTING`.
    pub async fn ensure_post_state(&self, task_id: &str, device: &dyn Device) -> OnboardResult<bool> {
        debug!(%task_id, "ensure_post_state: called");
        let flagged = self.state.get_task(task_id).await?.reboot_required;
        let required = flagged || device.reboot_required().await?;

        if required {
            info!(%task_id, "Reboot required");
            self.state.set_reboot_required(task_id, true).await?;
            self.state
                .update_result(task_id, Some(202), Some(TaskStatus::Rebooting), Some(REBOOT_REQUIRED), ErrorUpdate::Keep)
                .await?;
        } else {
            self.state
                .update_result(task_id, Some(200), Some(TaskStatus::Ok), Some(SUCCESS), ErrorUpdate::Keep)
                .await?;
        }
        self.persist().await;
        Ok(required)
    }

    /// Reboot the device if the task is flagged and wait for it to return
    pub async fn reboot_if_required(&self, task_id: &str, device: &dyn Device) -> OnboardResult<RebootOutcome> {
        debug!(%task_id, "reboot_if_required: called");
        if !self.state.get_task(task_id).await?.reboot_required {
            return Ok(RebootOutcome::NotRequired);
        }

        info!(%task_id, "Rebooting device");
        if let Err(e) = device.reboot().await {
            self.fail(task_id, &e).await?;
            return Ok(RebootOutcome::Failed);
        }

        if self.mode == DeploymentMode::Embedded {
            info!(%task_id, "Reboot will restart this process, deferring completion to start-up");
            return Ok(RebootOutcome::Deferred);
        }

        tokio::time::sleep(Duration::from_millis(self.settings.settle_delay_ms)).await;

        match self.wait_ready(device).await {
            Ok(()) => {
                info!(%task_id, "Device ready after reboot");
                self.state.set_reboot_required(task_id, false).await?;
                self.state
                    .update_result(task_id, Some(200), Some(TaskStatus::Ok), Some(SUCCESS), ErrorUpdate::Keep)
                    .await?;
                self.persist().await;
                Ok(RebootOutcome::Completed)
            }
            Err(e) => {
                self.fail(task_id, &e).await?;
                Ok(RebootOutcome::Failed)
            }
        }
    }

    async fn wait_ready(&self, device: &dyn Device) -> Result<(), DeviceError> {
        let interval = Duration::from_millis(self.settings.probe_interval_ms);
        let attempts = self.settings.probe_attempts.max(1);
        let mut last_error = DeviceError::NotReady("no readiness probe was made".to_string());

        for attempt in 1..=attempts {
            if attempt > 1 {
                tokio::time::sleep(interval).await;
            }
            match device.ready().await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    debug!(attempt, error = %e, "wait_ready: device not ready");
                    last_error = e;
                }
            }
        }
        Err(last_error)
    }

    async fn fail(&self, task_id: &str, error: &DeviceError) -> OnboardResult<()> {
        warn!(%task_id, error = %error, "Reboot failed");
        self.state
            .update_result(
                task_id,
                Some(500),
                Some(TaskStatus::Error),
                Some(REBOOT_FAILED),
                ErrorUpdate::one(error.to_string()),
            )
            .await?;
        self.persist().await;
        Ok(())
    }

    async fn persist(&self) {
        if let Err(e) = self.state.persist().await {
            warn!(error = %e, "Failed to persist task state");
        }
    }
}
