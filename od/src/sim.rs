//! Simulated collaborators
//!
//! In-memory stand-ins for the device transport, the declaration processor,
//! the secret vault and the peer processor. The test suites script them to
//! drive the orchestrator down every branch. Only built for tests and with the
//! `sim` feature, where `od serve --simulate` runs on them.

use async_trait::async_trait;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;

use crate::delegation::{DelegationError, PeerMethod, PeerRequest, PeerResponse, RequestSender, STATUS_FAILED};
use crate::device::{ConnectionInfo, Device, DeviceError, DeviceProvider, ShellRunner};
use crate::orchestrator::{Collaborators, RevokeEvent};
use crate::processor::{BasicValidator, ConfigManager, DeclarationProcessor, ProcessContext, ProcessError, ProcessOutcome};
use crate::secrets::{SecretError, SecretVault};
use crate::view::TaskView;
use crate::webhook::{Notifier, WebhookError};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// How a simulated device answers a root password change
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RootPasswordCheck {
    #[default]
    Accept,
    Mismatch,
    Fail,
}

#[derive(Default)]
struct DeviceState {
    reboot_required: bool,
    failing_ready: u32,
    fail_save: bool,
    fail_reboot_check: bool,
    root_check: RootPasswordCheck,
    reboots: usize,
    ready_probes: usize,
    saves: usize,
    passwords: Vec<(String, String)>,
}

/// Device whose clones share one state
#[derive(Clone)]
pub struct SimDevice {
    id: String,
    state: Arc<Mutex<DeviceState>>,
}

impl SimDevice {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            state: Arc::new(Mutex::new(DeviceState::default())),
        }
    }

    pub fn set_reboot_required(&self, required: bool) {
        lock(&self.state).reboot_required = required;
    }

    /// The next `count` readiness probes fail
    pub fn fail_next_ready(&self, count: u32) {
        lock(&self.state).failing_ready = count;
    }

    pub fn fail_save(&self, fail: bool) {
        lock(&self.state).fail_save = fail;
    }

    /// Asking whether a reboot is needed fails
    pub fn fail_reboot_check(&self, fail: bool) {
        lock(&self.state).fail_reboot_check = fail;
    }

    pub fn set_root_check(&self, check: RootPasswordCheck) {
        lock(&self.state).root_check = check;
    }

    pub fn reboot_count(&self) -> usize {
        lock(&self.state).reboots
    }

    pub fn ready_count(&self) -> usize {
        lock(&self.state).ready_probes
    }

    pub fn save_count(&self) -> usize {
        lock(&self.state).saves
    }

    /// `(username, password)` pairs in the order they were set
    pub fn passwords_set(&self) -> Vec<(String, String)> {
        lock(&self.state).passwords.clone()
    }
}

#[async_trait]
impl Device for SimDevice {
    async fn config_id(&self) -> Result<String, DeviceError> {
        Ok(self.id.clone())
    }

    async fn ready(&self) -> Result<(), DeviceError> {
        let mut state = lock(&self.state);
        state.ready_probes += 1;
        if state.failing_ready > 0 {
            state.failing_ready -= 1;
            return Err(DeviceError::NotReady("services starting".to_string()));
        }
        Ok(())
    }

    async fn save_config(&self) -> Result<(), DeviceError> {
        let mut state = lock(&self.state);
        state.saves += 1;
        if state.fail_save {
            return Err(DeviceError::Request {
                code: 500,
                message: "save failed".to_string(),
            });
        }
        Ok(())
    }

    async fn reboot_required(&self) -> Result<bool, DeviceError> {
        let state = lock(&self.state);
        if state.fail_reboot_check {
            return Err(DeviceError::Request {
                code: 503,
                message: "reboot status unavailable".to_string(),
            });
        }
        Ok(state.reboot_required)
    }

    async fn reboot(&self) -> Result<(), DeviceError> {
        debug!(id = %self.id, "SimDevice::reboot: called");
        let mut state = lock(&self.state);
        state.reboots += 1;
        state.reboot_required = false;
        Ok(())
    }

    async fn set_password(&self, username: &str, password: &str) -> Result<(), DeviceError> {
        lock(&self.state)
            .passwords
            .push((username.to_string(), password.to_string()));
        Ok(())
    }

    async fn change_root_password(&self, _old: &str, _new: &str) -> Result<(), DeviceError> {
        match lock(&self.state).root_check {
            RootPasswordCheck::Accept => Ok(()),
            RootPasswordCheck::Mismatch => Err(DeviceError::CredentialMismatch),
            RootPasswordCheck::Fail => Err(DeviceError::Request {
                code: 503,
                message: "authentication service unavailable".to_string(),
            }),
        }
    }
}

/// Hands out handles to one [`SimDevice`]
pub struct SimDeviceProvider {
    device: SimDevice,
    connects: AtomicUsize,
    failure: Mutex<Option<DeviceError>>,
}

impl SimDeviceProvider {
    pub fn new(device: SimDevice) -> Self {
        Self {
            device,
            connects: AtomicUsize::new(0),
            failure: Mutex::new(None),
        }
    }

    /// Every connect from now on fails with `error`
    pub fn fail_connect(&self, error: DeviceError) {
        *lock(&self.failure) = Some(error);
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn device(&self) -> &SimDevice {
        &self.device
    }
}

#[async_trait]
impl DeviceProvider for SimDeviceProvider {
    async fn connect(&self, conn: &ConnectionInfo) -> Result<Arc<dyn Device>, DeviceError> {
        debug!(host = %conn.host, "SimDeviceProvider::connect: called");
        self.connects.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = lock(&self.failure).clone() {
            return Err(error);
        }
        Ok(Arc::new(self.device.clone()))
    }
}

/// Records shell password changes
#[derive(Default)]
pub struct SimShell {
    calls: Mutex<Vec<(String, String)>>,
}

impl SimShell {
    pub fn calls(&self) -> Vec<(String, String)> {
        lock(&self.calls).clone()
    }
}

#[async_trait]
impl ShellRunner for SimShell {
    async fn set_password(&self, _conn: &ConnectionInfo, username: &str, password: &str) -> Result<(), DeviceError> {
        lock(&self.calls).push((username.to_string(), password.to_string()));
        Ok(())
    }
}

#[derive(Default)]
struct ProcessorState {
    process_failure: Option<ProcessError>,
    rollback_failure: Option<ProcessError>,
    reboot: bool,
    revoke: Option<(String, String)>,
    declarations: Vec<Value>,
    rollback_targets: Vec<Value>,
}

/// Accepts every declaration unless told otherwise
#[derive(Default)]
pub struct SimProcessor {
    state: Mutex<ProcessorState>,
}

impl SimProcessor {
    /// The next processing run fails with `error`
    pub fn fail_next_process(&self, error: ProcessError) {
        lock(&self.state).process_failure = Some(error);
    }

    /// Every rollback fails with `error`
    pub fn fail_rollback(&self, error: ProcessError) {
        lock(&self.state).rollback_failure = Some(error);
    }

    /// Processing runs report that a reboot is needed
    pub fn require_reboot(&self, reboot: bool) {
        lock(&self.state).reboot = reboot;
    }

    /// Processing runs announce a license revocation with these credentials
    pub fn revoke_on_process(&self, primary: impl Into<String>, secondary: impl Into<String>) {
        lock(&self.state).revoke = Some((primary.into(), secondary.into()));
    }

    pub fn process_count(&self) -> usize {
        lock(&self.state).declarations.len()
    }

    /// Declarations processing runs were given, unmasked
    pub fn declarations(&self) -> Vec<Value> {
        lock(&self.state).declarations.clone()
    }

    /// Configurations rollbacks were asked to restore
    pub fn rollback_targets(&self) -> Vec<Value> {
        lock(&self.state).rollback_targets.clone()
    }
}

#[async_trait]
impl DeclarationProcessor for SimProcessor {
    async fn process(
        &self,
        device: &dyn Device,
        declaration: &Value,
        ctx: &ProcessContext,
    ) -> Result<ProcessOutcome, ProcessError> {
        debug!(task_id = %ctx.task.id, "SimProcessor::process: called");
        let (failure, reboot, revoke) = {
            let mut state = lock(&self.state);
            state.declarations.push(declaration.clone());
            (state.process_failure.take(), state.reboot, state.revoke.clone())
        };

        if let Some((primary, secondary)) = revoke {
            let event = RevokeEvent {
                task_id: ctx.task.id.clone(),
                primary,
                secondary,
            };
            ctx.revoke
                .revoke(event)
                .await
                .map_err(|e| ProcessError::new(format!("license revocation not recorded: {}", e)))?;
        }
        if let Some(failure) = failure {
            return Err(failure);
        }

        let config_id = device.config_id().await.map_err(|e| ProcessError::new(e.to_string()))?;
        Ok(ProcessOutcome {
            reboot_required: reboot,
            rollback_info: json!({ "device": config_id, "schemaVersion": declaration.get("schemaVersion") }),
            warnings: Vec::new(),
        })
    }

    async fn rollback(
        &self,
        _device: &dyn Device,
        target: &Value,
        _current: &Value,
        ctx: &ProcessContext,
    ) -> Result<(), ProcessError> {
        debug!(task_id = %ctx.task.id, "SimProcessor::rollback: called");
        let mut state = lock(&self.state);
        state.rollback_targets.push(target.clone());
        match &state.rollback_failure {
            Some(failure) => Err(failure.clone()),
            None => Ok(()),
        }
    }
}

/// Serves a fixed configuration
pub struct SimConfigManager {
    config: Mutex<Value>,
    failure: Mutex<Option<ProcessError>>,
}

impl Default for SimConfigManager {
    fn default() -> Self {
        Self {
            config: Mutex::new(json!({ "hostname": "sim.localdomain" })),
            failure: Mutex::new(None),
        }
    }
}

impl SimConfigManager {
    pub fn set_config(&self, config: Value) {
        *lock(&self.config) = config;
    }

    /// Every read from now on fails with `error`
    pub fn fail_reads(&self, error: ProcessError) {
        *lock(&self.failure) = Some(error);
    }
}

#[async_trait]
impl ConfigManager for SimConfigManager {
    async fn current_config(&self, _device: &dyn Device) -> Result<Value, ProcessError> {
        if let Some(error) = lock(&self.failure).clone() {
            return Err(error);
        }
        Ok(lock(&self.config).clone())
    }
}

/// Keeps secrets in memory, unencrypted
#[derive(Default)]
pub struct SimVault {
    secrets: Mutex<HashMap<String, String>>,
}

impl SimVault {
    pub fn get(&self, id: &str) -> Option<String> {
        lock(&self.secrets).get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        lock(&self.secrets).contains_key(id)
    }
}

#[async_trait]
impl SecretVault for SimVault {
    async fn stash(&self, id: &str, secret: &str) -> Result<(), SecretError> {
        lock(&self.secrets).insert(id.to_string(), secret.to_string());
        Ok(())
    }

    async fn recover(&self, id: &str) -> Result<String, SecretError> {
        self.get(id).ok_or_else(|| SecretError::NotFound(id.to_string()))
    }

    async fn delete(&self, id: &str) -> Result<(), SecretError> {
        lock(&self.secrets).remove(id);
        Ok(())
    }
}

#[derive(Default)]
struct SenderState {
    requests: Vec<PeerRequest>,
    polls: usize,
    answered: usize,
    failing_polls: u32,
    fail_submit: bool,
    error_message: Option<String>,
}

/// Peer processor that answers status polls from a script
///
/// The last scripted status repeats once the script runs out.
pub struct ScriptedSender {
    remote_id: String,
    statuses: Vec<String>,
    state: Mutex<SenderState>,
}

impl ScriptedSender {
    pub fn with_statuses(remote_id: impl Into<String>, statuses: &[&str]) -> Self {
        Self {
            remote_id: remote_id.into(),
            statuses: statuses.iter().map(|s| s.to_string()).collect(),
            state: Mutex::new(SenderState::default()),
        }
    }

    /// `errorMessage` reported alongside a `FAILED` status
    pub fn set_error_message(&self, message: impl Into<String>) {
        lock(&self.state).error_message = Some(message.into());
    }

    /// The next `count` polls fail in transport
    pub fn fail_next_polls(&self, count: u32) {
        lock(&self.state).failing_polls = count;
    }

    pub fn fail_submit(&self) {
        lock(&self.state).fail_submit = true;
    }

    /// Status polls made, including failed ones
    pub fn poll_count(&self) -> usize {
        lock(&self.state).polls
    }

    pub fn requests(&self) -> Vec<PeerRequest> {
        lock(&self.state).requests.clone()
    }
}

#[async_trait]
impl RequestSender for ScriptedSender {
    async fn send(&self, request: PeerRequest) -> Result<PeerResponse, DelegationError> {
        let mut state = lock(&self.state);
        state.requests.push(request.clone());

        match request.method {
            PeerMethod::Post => {
                if state.fail_submit {
                    return Err(DelegationError::Transport("connection refused".to_string()));
                }
                Ok(PeerResponse {
                    status: 202,
                    body: json!({ "id": self.remote_id }),
                })
            }
            PeerMethod::Get => {
                state.polls += 1;
                if state.failing_polls > 0 {
                    state.failing_polls -= 1;
                    return Err(DelegationError::Transport("connection reset".to_string()));
                }
                let index = state.answered.min(self.statuses.len().saturating_sub(1));
                state.answered += 1;
                let status = self.statuses.get(index).cloned().unwrap_or_default();

                let mut body = json!({ "id": self.remote_id, "status": status });
                if status == STATUS_FAILED
                    && let Some(message) = &state.error_message
                {
                    body["errorMessage"] = Value::String(message.clone());
                }
                Ok(PeerResponse { status: 200, body })
            }
        }
    }
}

/// Records webhook deliveries
#[derive(Default)]
pub struct RecordingNotifier {
    deliveries: Mutex<Vec<(String, TaskView)>>,
}

impl RecordingNotifier {
    pub fn deliveries(&self) -> Vec<(String, TaskView)> {
        lock(&self.deliveries).clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, url: &str, view: &TaskView) -> Result<(), WebhookError> {
        lock(&self.deliveries).push((url.to_string(), view.clone()));
        Ok(())
    }
}

/// Handles to the simulated collaborators behind a [`Collaborators`] set
pub struct SimHarness {
    pub device: SimDevice,
    pub devices: Arc<SimDeviceProvider>,
    pub processor: Arc<SimProcessor>,
    pub config_manager: Arc<SimConfigManager>,
    pub shell: Arc<SimShell>,
    pub vault: Arc<SimVault>,
    pub notifier: Arc<RecordingNotifier>,
}

impl SimHarness {
    pub fn new(device_id: &str) -> Self {
        let device = SimDevice::new(device_id);
        Self {
            devices: Arc::new(SimDeviceProvider::new(device.clone())),
            device,
            processor: Arc::new(SimProcessor::default()),
            config_manager: Arc::new(SimConfigManager::default()),
            shell: Arc::new(SimShell::default()),
            vault: Arc::new(SimVault::default()),
            notifier: Arc::new(RecordingNotifier::default()),
        }
    }

    /// Collaborator set over these simulations, with an optional peer
    pub fn collaborators(&self, peer: Option<Arc<dyn RequestSender>>) -> Collaborators {
        Collaborators {
            validator: Arc::new(BasicValidator),
            processor: self.processor.clone(),
            config_manager: self.config_manager.clone(),
            devices: self.devices.clone(),
            shell: self.shell.clone(),
            vault: self.vault.clone(),
            peer,
            notifier: self.notifier.clone(),
        }
    }
}

impl Collaborators {
    /// Fully simulated collaborator set
    pub fn simulated() -> Self {
        SimHarness::new("sim-device").collaborators(None)
    }
}
