//! StateManager - actor that owns the task ledger
//!
//! Processes commands via channels so concurrent workflows never touch the
//! ledger directly. Write-back to storage happens outside the actor on a
//! snapshot, with bounded retry.

use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use taskstore::{DoState, ErrorUpdate, RequestOptions, StatePersistence, Task, TaskStatus};
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::config::StorageConfig;

use super::messages::{StateCommand, StateError, StateResponse};

/// Event broadcast when a task result changes
#[derive(Debug, Clone, PartialEq)]
pub enum StateEvent {
    ResultUpdated {
        id: String,
        code: Option<u16>,
        status: Option<TaskStatus>,
    },
}

/// Handle to send commands to the StateManager
#[derive(Clone)]
pub struct StateManager {
    tx: mpsc::Sender<StateCommand>,
    /// Broadcast sender for result change notifications
    event_tx: broadcast::Sender<StateEvent>,
    persistence: Arc<dyn StatePersistence>,
    settings: StorageConfig,
}

impl StateManager {
    /// Spawn a new StateManager actor around an already loaded ledger
    pub fn spawn(state: DoState, persistence: Arc<dyn StatePersistence>, settings: StorageConfig) -> Self {
        debug!(task_count = state.tasks.len(), "spawn: called");
        let (tx, rx) = mpsc::channel(256);
        let (event_tx, _) = broadcast::channel(64);

        tokio::spawn(actor_loop(state, rx));

        info!("StateManager spawned");

        Self {
            tx,
            event_tx,
            persistence,
            settings,
        }
    }

    /// Load persisted state, upgrading older layouts, and spawn the actor
    pub async fn load(persistence: Arc<dyn StatePersistence>, settings: StorageConfig) -> StateResponse<Self> {
        debug!("load: called");
        let state = match persistence.load().await? {
            Some(raw) => DoState::upgrade(raw),
            None => {
                info!("No persisted state, starting empty");
                DoState::default()
            }
        };
        info!(task_count = state.tasks.len(), "Loaded task ledger");
        Ok(Self::spawn(state, persistence, settings))
    }

    /// Subscribe to result change events
    pub fn subscribe_events(&self) -> broadcast::Receiver<StateEvent> {
        self.event_tx.subscribe()
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> StateCommand) -> StateResponse<T> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx.send(make(reply_tx)).await.map_err(|_| StateError::ChannelError)?;
        reply_rx.await.map_err(|_| StateError::ChannelError)
    }

    // === Task lifecycle ===

    /// Create a new task and make it the most recent one
    pub async fn add_task(&self) -> StateResponse<String> {
        debug!("add_task: called");
        self.request(|reply| StateCommand::AddTask { reply }).await
    }

    pub async fn get_task(&self, id: &str) -> StateResponse<Task> {
        debug!(%id, "get_task: called");
        self.request(|reply| StateCommand::GetTask {
            id: id.to_string(),
            reply,
        })
        .await?
    }

    /// All tasks, oldest update first
    pub async fn list_tasks(&self) -> StateResponse<Vec<Task>> {
        debug!("list_tasks: called");
        self.request(|reply| StateCommand::ListTasks { reply }).await
    }

    pub async fn most_recent_task(&self) -> StateResponse<Option<Task>> {
        debug!("most_recent_task: called");
        self.request(|reply| StateCommand::MostRecentTask { reply }).await
    }

    // === Task fields ===

    /// Record a result change and broadcast it
    pub async fn update_result(
        &self,
        id: &str,
        code: Option<u16>,
        status: Option<TaskStatus>,
        message: Option<&str>,
        errors: ErrorUpdate,
    ) -> StateResponse<()> {
        debug!(%id, ?code, ?status, ?message, "update_result: called");
        self.request(|reply| StateCommand::UpdateResult {
            id: id.to_string(),
            code,
            status,
            message: message.map(str::to_string),
            errors,
            reply,
        })
        .await??;

        let _ = self.event_tx.send(StateEvent::ResultUpdated {
            id: id.to_string(),
            code,
            status,
        });
        Ok(())
    }

    pub async fn add_warnings(&self, id: &str, warnings: Vec<String>) -> StateResponse<()> {
        debug!(%id, count = warnings.len(), "add_warnings: called");
        self.request(|reply| StateCommand::AddWarnings {
            id: id.to_string(),
            warnings,
            reply,
        })
        .await?
    }

    /// Store a masked copy of the declaration on the task
    pub async fn set_declaration(&self, id: &str, declaration: &Value) -> StateResponse<()> {
        debug!(%id, "set_declaration: called");
        self.request(|reply| StateCommand::SetDeclaration {
            id: id.to_string(),
            declaration: declaration.clone(),
            reply,
        })
        .await?
    }

    pub async fn set_reboot_required(&self, id: &str, required: bool) -> StateResponse<()> {
        debug!(%id, required, "set_reboot_required: called");
        self.request(|reply| StateCommand::SetRebootRequired {
            id: id.to_string(),
            required,
            reply,
        })
        .await?
    }

    pub async fn set_request_options(&self, id: &str, options: RequestOptions) -> StateResponse<()> {
        debug!(%id, method = %options.method, "set_request_options: called");
        self.request(|reply| StateCommand::SetRequestOptions {
            id: id.to_string(),
            options,
            reply,
        })
        .await?
    }

    pub async fn set_rollback_info(&self, id: &str, info: Value) -> StateResponse<()> {
        debug!(%id, "set_rollback_info: called");
        self.request(|reply| StateCommand::SetRollbackInfo {
            id: id.to_string(),
            info,
            reply,
        })
        .await?
    }

    // === Configuration snapshots ===

    /// Record a device configuration snapshot for a task
    ///
    /// Becomes the task's current config. The first snapshot seen for a
    /// device is kept as that device's original config, which the task also
    /// references.
    pub async fn record_snapshot(&self, id: &str, config_id: &str, config: Value) -> StateResponse<()> {
        debug!(%id, %config_id, "record_snapshot: called");
        self.request(|reply| StateCommand::RecordSnapshot {
            id: id.to_string(),
            config_id: config_id.to_string(),
            config,
            reply,
        })
        .await?
    }

    /// All device snapshots, sorted by device id
    pub async fn list_original_configs(&self) -> StateResponse<Vec<(String, Value)>> {
        debug!("list_original_configs: called");
        self.request(|reply| StateCommand::ListOriginalConfigs { reply }).await
    }

    pub async fn get_original_config(&self, config_id: &str) -> StateResponse<Option<Value>> {
        debug!(%config_id, "get_original_config: called");
        self.request(|reply| StateCommand::GetOriginalConfig {
            config_id: config_id.to_string(),
            reply,
        })
        .await
    }

    /// Delete a device snapshot; false when there was none
    pub async fn delete_original_config(&self, config_id: &str) -> StateResponse<bool> {
        debug!(%config_id, "delete_original_config: called");
        self.request(|reply| StateCommand::DeleteOriginalConfig {
            config_id: config_id.to_string(),
            reply,
        })
        .await
    }

    pub async fn snapshot(&self) -> StateResponse<DoState> {
        self.request(|reply| StateCommand::Snapshot { reply }).await
    }

    // === Persistence ===

    /// Write the ledger back to storage
    ///
    /// Retries with exponential backoff. There is no mutual exclusion between
    /// callers; the last successful save wins.
    pub async fn persist(&self) -> StateResponse<()> {
        debug!("persist: called");
        let state = self.snapshot().await?;
        let attempts = self.settings.save_retries.max(1);

        let mut last_error = String::new();
        for attempt in 0..attempts {
            if attempt > 0 {
                let backoff = backoff_ms(self.settings.save_backoff_ms, attempt);
                debug!(attempt, backoff_ms = backoff, "persist: retrying after backoff");
                tokio::time::sleep(Duration::from_millis(backoff)).await;
            }
            match self.persistence.save(&state).await {
                Ok(()) => {
                    debug!(attempt, "persist: saved");
                    return Ok(());
                }
                Err(e) => {
                    warn!(attempt, error = %e, "persist: save failed");
                    last_error = e.to_string();
                }
            }
        }

        Err(StateError::Persistence {
            attempts,
            message: last_error,
        })
    }
}

/// Upper bound on a single write-back delay
const MAX_BACKOFF_MS: u64 = 60_000;

/// Delay before retry number `attempt` (1-based): doubles from `base_ms`, capped
fn backoff_ms(base_ms: u64, attempt: u32) -> u64 {
    let factor = 1u64.checked_shl(attempt.saturating_sub(1)).unwrap_or(u64::MAX);
    base_ms.saturating_mul(factor).min(MAX_BACKOFF_MS)
}

/// Main actor loop - processes commands sequentially
async fn actor_loop(mut state: DoState, mut rx: mpsc::Receiver<StateCommand>) {
    debug!("actor_loop: called");

    while let Some(cmd) = rx.recv().await {
        match cmd {
            StateCommand::AddTask { reply } => {
                let id = state.add_task();
                debug!(%id, "actor_loop: AddTask command");
                let _ = reply.send(id);
            }

            StateCommand::GetTask { id, reply } => {
                debug!(%id, "actor_loop: GetTask command");
                let _ = reply.send(state.task(&id).cloned().map_err(StateError::from));
            }

            StateCommand::ListTasks { reply } => {
                debug!("actor_loop: ListTasks command");
                let mut tasks: Vec<Task> = state.tasks.values().cloned().collect();
                tasks.sort_by(|a, b| a.last_update.cmp(&b.last_update).then_with(|| a.id.cmp(&b.id)));
                let _ = reply.send(tasks);
            }

            StateCommand::MostRecentTask { reply } => {
                debug!("actor_loop: MostRecentTask command");
                let _ = reply.send(state.most_recent_task().cloned());
            }

            StateCommand::UpdateResult {
                id,
                code,
                status,
                message,
                errors,
                reply,
            } => {
                debug!(%id, "actor_loop: UpdateResult command");
                let result = state.update_result(&id, code, status, message.as_deref(), errors);
                let _ = reply.send(result.map_err(StateError::from));
            }

            StateCommand::AddWarnings { id, warnings, reply } => {
                debug!(%id, "actor_loop: AddWarnings command");
                let _ = reply.send(state.add_warnings(&id, warnings).map_err(StateError::from));
            }

            StateCommand::SetDeclaration { id, declaration, reply } => {
                debug!(%id, "actor_loop: SetDeclaration command");
                let _ = reply.send(state.set_declaration(&id, &declaration).map_err(StateError::from));
            }

            StateCommand::SetRebootRequired { id, required, reply } => {
                debug!(%id, required, "actor_loop: SetRebootRequired command");
                let _ = reply.send(state.set_reboot_required(&id, required).map_err(StateError::from));
            }

            StateCommand::SetRequestOptions { id, options, reply } => {
                debug!(%id, "actor_loop: SetRequestOptions command");
                let _ = reply.send(state.set_request_options(&id, options).map_err(StateError::from));
            }

            StateCommand::SetRollbackInfo { id, info, reply } => {
                debug!(%id, "actor_loop: SetRollbackInfo command");
                let _ = reply.send(state.set_rollback_info(&id, info).map_err(StateError::from));
            }

            StateCommand::RecordSnapshot {
                id,
                config_id,
                config,
                reply,
            } => {
                debug!(%id, %config_id, "actor_loop: RecordSnapshot command");
                let _ = reply.send(record_snapshot(&mut state, &id, &config_id, &config));
            }

            StateCommand::ListOriginalConfigs { reply } => {
                debug!("actor_loop: ListOriginalConfigs command");
                let configs = state
                    .original_config_ids()
                    .into_iter()
                    .filter_map(|config_id| {
                        state
                            .get_original_config_by_config_id(&config_id)
                            .map(|config| (config_id, config))
                    })
                    .collect();
                let _ = reply.send(configs);
            }

            StateCommand::GetOriginalConfig { config_id, reply } => {
                debug!(%config_id, "actor_loop: GetOriginalConfig command");
                let _ = reply.send(state.get_original_config_by_config_id(&config_id));
            }

            StateCommand::DeleteOriginalConfig { config_id, reply } => {
                debug!(%config_id, "actor_loop: DeleteOriginalConfig command");
                let _ = reply.send(state.delete_original_config_by_config_id(&config_id));
            }

            StateCommand::Snapshot { reply } => {
                let _ = reply.send(state.clone());
            }
        }
    }

    debug!("actor_loop: channel closed, exiting");
}

fn record_snapshot(state: &mut DoState, id: &str, config_id: &str, config: &Value) -> StateResponse<()> {
    state.set_current_config(id, config)?;
    let original = match state.get_original_config_by_config_id(config_id) {
        Some(original) => original,
        None => {
            info!(%config_id, "record_snapshot: first snapshot for device");
            state.set_original_config_by_config_id(config_id, config);
            config.clone()
        }
    };
    state.set_original_config_by_task_id(id, &original)?;
    Ok(())
}
