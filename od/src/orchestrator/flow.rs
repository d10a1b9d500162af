//! Main onboarding flow

use serde_json::Value;
use std::sync::Arc;
use taskstore::{ErrorUpdate, RequestOptions, TaskStatus};
use tracing::{debug, error, info, warn};

use super::Orchestrator;
use super::workflow::{Responder, Workflow};
use crate::account::AccountSetup;
use crate::declaration::{BAD_DECLARATION, BODY_FORMAT, Envelope, parse_body, wrap};
use crate::delegation::DelegationPoller;
use crate::device::{Device, DeviceError};
use crate::error::{OnboardError, OnboardResult};
use crate::processor::ProcessContext;
use crate::reboot::SUCCESS;
use crate::view::TaskView;

pub const PROCESSING: &str = "processing";
pub const ACCOUNT_SETUP_FAILED: &str = "failed to set up initial account";
pub const DEVICE_INIT_FAILED: &str = "failed to initialize device";
pub const SNAPSHOT_FAILED: &str = "failed to read current configuration";
pub const POST_STATE_FAILED: &str = "failed to determine reboot state";
pub const DELEGATION_FAILED: &str = "remote processing failed";
pub const ROLLED_BACK: &str = "rolled back";
pub const ROLLBACK_FAILED: &str = "rollback failed";

/// Code recorded after a successful rollback
///
/// A 400 from the processor is reported as 422: the request was well formed,
/// the device rejected it.
fn rollback_code(failure: &OnboardError) -> u16 {
    match failure.code() {
        400 => 422,
        code => code,
    }
}

impl Orchestrator {
    /// Create a task for a request body and run it
    ///
    /// Resolves with the response the caller should get: immediately for
    /// rejected bodies and async requests, otherwise once the workflow is
    /// done. The workflow keeps running after an early response.
    pub async fn submit(self: &Arc<Self>, body: &[u8], options: RequestOptions) -> OnboardResult<TaskView> {
        debug!(len = body.len(), from_peer = options.from_peer, "submit: called");
        let task_id = self.state.add_task().await?;
        self.state.set_request_options(&task_id, options.clone()).await?;

        let Some(envelope) = self.accept(&task_id, body).await? else {
            return self.view(&task_id).await;
        };

        let (mut responder, response) = Responder::channel();
        if envelope.is_async {
            responder.respond(self.view(&task_id).await?);
        }

        let workflow = Workflow::new(task_id.clone(), envelope, options);
        tokio::spawn(Arc::clone(self).run(workflow, responder));

        match response.await {
            Ok(view) => Ok(view),
            Err(_) => self.view(&task_id).await,
        }
    }

    /// Parse, wrap, validate and record the declaration
    ///
    /// `None` when the body was rejected; the task then already holds the
    /// 400 result.
    async fn accept(&self, task_id: &str, body: &[u8]) -> OnboardResult<Option<Envelope>> {
        let parsed = match parse_body(body) {
            Ok(parsed) => parsed,
            Err(e) => {
                debug!(%task_id, error = %e, "accept: unparsable body");
                self.reject(task_id, vec![BODY_FORMAT.to_string()]).await?;
                return Ok(None);
            }
        };

        let wrapped = wrap(parsed);
        if let Err(errors) = self.collaborators.validator.validate(&wrapped) {
            info!(%task_id, count = errors.len(), "Declaration failed validation");
            self.reject(task_id, errors).await?;
            return Ok(None);
        }
        let envelope = match Envelope::from_value(wrapped.clone()) {
            Ok(envelope) => envelope,
            Err(e) => {
                self.reject(task_id, vec![e.to_string()]).await?;
                return Ok(None);
            }
        };

        self.state.set_declaration(task_id, &wrapped).await?;
        self.state
            .update_result(task_id, Some(202), Some(TaskStatus::Running), Some(PROCESSING), ErrorUpdate::Keep)
            .await?;
        self.persist().await;
        info!(%task_id, "Task accepted");
        Ok(Some(envelope))
    }

    async fn reject(&self, task_id: &str, errors: Vec<String>) -> OnboardResult<()> {
        self.state
            .update_result(
                task_id,
                Some(400),
                Some(TaskStatus::Error),
                Some(BAD_DECLARATION),
                ErrorUpdate::list(errors),
            )
            .await?;
        self.persist().await;
        Ok(())
    }

    /// Drive a workflow to its end, answer the caller and fire the webhook
    pub(super) async fn run(self: Arc<Self>, mut workflow: Workflow, mut responder: Responder) {
        let task_id = workflow.task_id.clone();
        debug!(%task_id, "run: called");

        if let Err(e) = self.onboard(&mut workflow, &mut responder).await {
            error!(%task_id, error = %e, "Workflow aborted");
        }

        let view = match self.view(&task_id).await {
            Ok(view) => view,
            Err(e) => {
                error!(%task_id, error = %e, "Cannot read final task state");
                return;
            }
        };
        info!(%task_id, code = ?view.result.code, status = ?view.result.status, "Workflow finished");

        responder.respond(view.clone());
        self.notify(&workflow, &view).await;
    }

    /// Steps after acceptance: pointers, account setup, then delegation or direct processing
    pub(super) async fn onboard(&self, workflow: &mut Workflow, responder: &mut Responder) -> OnboardResult<()> {
        debug!(task_id = %workflow.task_id, "onboard: called");
        workflow.envelope.resolve_pointers();
        workflow.conn = workflow.envelope.connection_info();

        let setup = AccountSetup::new(self.collaborators.devices.as_ref(), self.collaborators.shell.as_ref());
        match setup.run(workflow.conn.clone(), &mut workflow.envelope.declaration).await {
            Ok(conn) => workflow.conn = conn,
            Err(e) => {
                let err = OnboardError::Account(e.to_string());
                return self.fail(&workflow.task_id, ACCOUNT_SETUP_FAILED, &err).await;
            }
        }

        if let Some(poller) = &self.delegation
            && !workflow.options.from_peer
        {
            return self.delegate(workflow, poller).await;
        }
        self.apply(workflow, responder).await
    }

    /// Hand the declaration to the peer, then snapshot the device for audit
    async fn delegate(&self, workflow: &Workflow, poller: &DelegationPoller) -> OnboardResult<()> {
        let task_id = workflow.task_id.clone();
        info!(%task_id, "Delegating to remote processor");

        match poller.run(&task_id, &workflow.envelope.to_value()).await {
            Ok(()) => {
                self.state
                    .update_result(&task_id, Some(200), Some(TaskStatus::Ok), Some(SUCCESS), ErrorUpdate::Keep)
                    .await?;
                self.persist().await;
            }
            Err(e) => {
                self.fail(&task_id, DELEGATION_FAILED, &OnboardError::Delegation(e)).await?;
            }
        }

        let device = match self.acquire_device(workflow).await {
            Ok(device) => device,
            Err(e) => {
                warn!(%task_id, error = %e, "No device handle for audit snapshot");
                return Ok(());
            }
        };
        match self.capture_snapshot(&task_id, device.as_ref()).await {
            Ok(_) => Ok(()),
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                warn!(%task_id, error = %e, "Audit snapshot failed");
                Ok(())
            }
        }
    }

    /// Apply the declaration to the device, rolling back on failure
    async fn apply(&self, workflow: &mut Workflow, responder: &mut Responder) -> OnboardResult<()> {
        let task_id = workflow.task_id.clone();

        let device = match self.acquire_device(workflow).await {
            Ok(device) => device,
            Err(e) => {
                let err = OnboardError::DeviceInit {
                    code: e.code(),
                    message: e.to_string(),
                };
                return self.fail(&task_id, DEVICE_INIT_FAILED, &err).await;
            }
        };

        match self.capture_snapshot(&task_id, device.as_ref()).await {
            Ok(snapshot) => workflow.snapshot = Some(snapshot),
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => return self.fail(&task_id, SNAPSHOT_FAILED, &e).await,
        }

        let ctx = self.context(&task_id).await?;
        match self.process(&task_id, device.as_ref(), &workflow.envelope, &ctx).await {
            Ok(()) => {}
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => return self.roll_back(workflow, device.as_ref(), &ctx, e).await,
        }

        if self.is_revoking(&task_id).await? {
            info!(%task_id, "License revoked during processing, leaving task for start-up recovery");
            return Ok(());
        }

        match self.reboot.ensure_post_state(&task_id, device.as_ref()).await {
            Ok(_) => {}
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => return self.fail(&task_id, POST_STATE_FAILED, &e).await,
        }

        if !workflow.envelope.is_async {
            responder.respond(self.view(&task_id).await?);
        }

        self.reboot.reboot_if_required(&task_id, device.as_ref()).await?;
        Ok(())
    }

    /// Run the processor and save the running configuration
    async fn process(
        &self,
        task_id: &str,
        device: &dyn Device,
        envelope: &Envelope,
        ctx: &ProcessContext,
    ) -> OnboardResult<()> {
        debug!(%task_id, "process: called");
        let outcome = self
            .collaborators
            .processor
            .process(device, &envelope.declaration, ctx)
            .await?;

        self.state.set_rollback_info(task_id, outcome.rollback_info).await?;
        self.state.add_warnings(task_id, outcome.warnings).await?;
        if outcome.reboot_required {
            self.state.set_reboot_required(task_id, true).await?;
        }

        device.save_config().await?;
        info!(%task_id, "Declaration applied and saved");
        Ok(())
    }

    /// Re-apply the configuration captured before processing
    async fn roll_back(
        &self,
        workflow: &Workflow,
        device: &dyn Device,
        ctx: &ProcessContext,
        failure: OnboardError,
    ) -> OnboardResult<()> {
        let task_id = workflow.task_id.as_str();
        let original = failure.to_string();
        warn!(%task_id, error = %original, "Processing failed, rolling back");

        self.state
            .update_result(
                task_id,
                Some(202),
                Some(TaskStatus::RollingBack),
                Some(&original),
                ErrorUpdate::Keep,
            )
            .await?;
        self.persist().await;

        let target = workflow.snapshot.clone().unwrap_or(Value::Null);
        let rolled_back: OnboardResult<()> = async {
            let current = self.capture_snapshot(task_id, device).await?;
            self.collaborators
                .processor
                .rollback(device, &target, &current, ctx)
                .await?;
            Ok(())
        }
        .await;

        match rolled_back {
            Ok(()) => {
                info!(%task_id, "Rollback complete");
                self.state
                    .update_result(
                        task_id,
                        Some(rollback_code(&failure)),
                        Some(TaskStatus::Error),
                        Some(ROLLED_BACK),
                        ErrorUpdate::one(original),
                    )
                    .await?;
            }
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                let rollback = e.to_string();
                error!(%task_id, %original, %rollback, "Rollback failed");
                self.state
                    .update_result(
                        task_id,
                        Some(500),
                        Some(TaskStatus::Error),
                        Some(ROLLBACK_FAILED),
                        ErrorUpdate::list(vec![original, rollback]),
                    )
                    .await?;
            }
        }
        self.persist().await;
        Ok(())
    }

    async fn acquire_device(&self, workflow: &Workflow) -> Result<Arc<dyn Device>, DeviceError> {
        self.devices
            .acquire(
                &workflow.task_id,
                workflow.options.correlation_id.as_deref(),
                &workflow.conn,
                self.collaborators.devices.as_ref(),
            )
            .await
    }

    /// Read and record the device's current configuration
    async fn capture_snapshot(&self, task_id: &str, device: &dyn Device) -> OnboardResult<Value> {
        debug!(%task_id, "capture_snapshot: called");
        let config = self.collaborators.config_manager.current_config(device).await?;
        let config_id = device.config_id().await?;
        self.state.record_snapshot(task_id, &config_id, config.clone()).await?;
        self.persist().await;
        Ok(config)
    }

    async fn context(&self, task_id: &str) -> OnboardResult<ProcessContext> {
        Ok(ProcessContext {
            task: self.state.get_task(task_id).await?,
            revoke: self.revoke_tx.clone(),
        })
    }

    /// Record a terminal failure
    pub(super) async fn fail(&self, task_id: &str, message: &str, err: &OnboardError) -> OnboardResult<()> {
        warn!(%task_id, %message, error = %err, "Task failed");
        self.state
            .update_result(
                task_id,
                Some(err.code()),
                Some(TaskStatus::Error),
                Some(message),
                ErrorUpdate::one(err.to_string()),
            )
            .await?;
        self.persist().await;
        Ok(())
    }

    pub(super) async fn view(&self, task_id: &str) -> OnboardResult<TaskView> {
        let task = self.state.get_task(task_id).await?;
        Ok(TaskView::from(&task))
    }

    async fn notify(&self, workflow: &Workflow, view: &TaskView) {
        let Some(url) = workflow.envelope.webhook.as_deref() else {
            return;
        };
        debug!(task_id = %view.id, %url, "notify: sending webhook");
        if let Err(e) = self.collaborators.notifier.notify(url, view).await {
            warn!(task_id = %view.id, %url, error = %e, "Webhook delivery failed");
        }
    }
}
