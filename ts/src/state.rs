//! DoState - the task ledger aggregate
//!
//! All operations are synchronous and in-memory; persistence is layered on
//! top through [`crate::StatePersistence`].

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use tracing::{debug, info, warn};

use crate::error::{StoreError, StoreResult};
use crate::mask;
use crate::task::{RequestOptions, Task, TaskStatus};
use crate::{RETENTION_MS, generate_id, now_ms};

/// How `update_result` treats the error list
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ErrorUpdate {
    /// Leave the list untouched
    #[default]
    Keep,
    /// Empty the list
    Clear,
    /// Append these messages in order
    Append(Vec<String>),
}

impl ErrorUpdate {
    /// Append a single message
    pub fn one(message: impl Into<String>) -> Self {
        Self::Append(vec![message.into()])
    }

    /// Append a list; an empty list clears, matching the store's null semantics
    pub fn list(messages: Vec<String>) -> Self {
        if messages.is_empty() {
            Self::Clear
        } else {
            Self::Append(messages)
        }
    }
}

/// The task ledger plus the device-keyed original configuration ledger
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DoState {
    #[serde(default)]
    pub tasks: HashMap<String, Task>,

    /// Id of the most recently created task, empty when there is none
    #[serde(default)]
    pub most_recent_task: String,

    #[serde(default)]
    pub original_config: HashMap<String, Value>,
}

impl DoState {
    /// Upgrade a loaded state object into the current layout
    ///
    /// A state without a `tasks` map predates the task model: the whole
    /// object becomes a single task with a fresh id. Never fails; input that
    /// is not an object yields an empty state, and individual tasks that do
    /// not parse are dropped.
    pub fn upgrade(value: Value) -> Self {
        debug!("DoState::upgrade: called");
        let Value::Object(mut map) = value else {
            warn!("DoState::upgrade: state is not an object, starting empty");
            return Self::default();
        };

        let original_config = match map.remove("originalConfig") {
            Some(Value::Object(configs)) if map.contains_key("tasks") => configs.into_iter().collect(),
            Some(other) if !map.contains_key("tasks") => {
                // legacy per-task snapshot; it belongs to the synthesized task
                map.insert("originalConfig".to_string(), other);
                HashMap::new()
            }
            _ => HashMap::new(),
        };

        if !map.contains_key("tasks") {
            let id = generate_id();
            info!(%id, "DoState::upgrade: converting legacy state into a single task");
            let task = Task::from_legacy(id.clone(), now_ms(), map);
            let mut tasks = HashMap::new();
            tasks.insert(id.clone(), task);
            return Self {
                tasks,
                most_recent_task: id,
                original_config,
            };
        }

        let mut tasks = HashMap::new();
        if let Some(Value::Object(entries)) = map.remove("tasks") {
            for (id, raw) in entries {
                match serde_json::from_value::<Task>(raw) {
                    Ok(task) => {
                        tasks.insert(id, task);
                    }
                    Err(e) => warn!(%id, error = %e, "DoState::upgrade: dropping unparsable task"),
                }
            }
        }

        let most_recent_task = map
            .remove("mostRecentTask")
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_default();

        Self {
            tasks,
            most_recent_task,
            original_config,
        }
    }

    // === Task lifecycle ===

    /// Create a new empty task, make it most recent, evict expired tasks
    pub fn add_task(&mut self) -> String {
        self.add_task_at(now_ms())
    }

    /// `add_task` with an explicit clock
    pub fn add_task_at(&mut self, now_ms: i64) -> String {
        let id = generate_id();
        debug!(%id, "add_task: called");
        self.evict_expired(now_ms);
        self.tasks.insert(id.clone(), Task::new(id.clone(), now_ms));
        self.most_recent_task = id.clone();
        id
    }

    fn evict_expired(&mut self, now_ms: i64) {
        let before = self.tasks.len();
        self.tasks.retain(|_, task| now_ms - task.last_update <= RETENTION_MS);
        let evicted = before - self.tasks.len();
        if evicted > 0 {
            info!(evicted, "evict_expired: removed tasks past retention");
        }
    }

    pub fn task(&self, id: &str) -> StoreResult<&Task> {
        self.tasks.get(id).ok_or_else(|| StoreError::TaskNotFound(id.to_string()))
    }

    fn task_mut(&mut self, id: &str) -> StoreResult<&mut Task> {
        let task = self
            .tasks
            .get_mut(id)
            .ok_or_else(|| StoreError::TaskNotFound(id.to_string()))?;
        task.last_update = now_ms();
        Ok(task)
    }

    /// All task ids
    pub fn task_ids(&self) -> Vec<String> {
        self.tasks.keys().cloned().collect()
    }

    /// The most recently created task, if it still exists
    pub fn most_recent_task(&self) -> Option<&Task> {
        if self.most_recent_task.is_empty() {
            return None;
        }
        self.tasks.get(&self.most_recent_task)
    }

    pub fn get_last_update(&self, id: &str) -> StoreResult<i64> {
        Ok(self.task(id)?.last_update)
    }

    // === Result ===

    /// Record a result change
    ///
    /// `code`, `status` and `message` overwrite only when given; errors follow
    /// the [`ErrorUpdate`] rule. The task's `lastUpdate` is always bumped.
    pub fn update_result(
        &mut self,
        id: &str,
        code: Option<u16>,
        status: Option<TaskStatus>,
        message: Option<&str>,
        errors: ErrorUpdate,
    ) -> StoreResult<()> {
        debug!(%id, ?code, ?status, ?message, "update_result: called");
        let task = self.task_mut(id)?;
        if let Some(code) = code {
            task.result.code = Some(code);
        }
        if let Some(status) = status {
            task.result.status = Some(status);
        }
        if let Some(message) = message.filter(|m| !m.is_empty()) {
            task.result.message = Some(message.to_string());
        }
        match errors {
            ErrorUpdate::Keep => {}
            ErrorUpdate::Clear => task.result.errors.clear(),
            ErrorUpdate::Append(list) => task.result.errors.extend(list),
        }
        Ok(())
    }

    pub fn get_code(&self, id: &str) -> StoreResult<Option<u16>> {
        Ok(self.task(id)?.result.code)
    }

    pub fn set_code(&mut self, id: &str, code: u16) -> StoreResult<()> {
        self.task_mut(id)?.result.code = Some(code);
        Ok(())
    }

    pub fn get_message(&self, id: &str) -> StoreResult<Option<String>> {
        Ok(self.task(id)?.result.message.clone())
    }

    pub fn set_message(&mut self, id: &str, message: impl Into<String>) -> StoreResult<()> {
        self.task_mut(id)?.result.message = Some(message.into());
        Ok(())
    }

    pub fn get_status(&self, id: &str) -> StoreResult<Option<TaskStatus>> {
        Ok(self.task(id)?.result.status)
    }

    pub fn set_status(&mut self, id: &str, status: TaskStatus) -> StoreResult<()> {
        self.task_mut(id)?.result.status = Some(status);
        Ok(())
    }

    pub fn get_errors(&self, id: &str) -> StoreResult<Vec<String>> {
        Ok(self.task(id)?.result.errors.clone())
    }

    /// Replace the error list; `None` clears it in place
    pub fn set_errors(&mut self, id: &str, errors: Option<Vec<String>>) -> StoreResult<()> {
        let task = self.task_mut(id)?;
        match errors {
            Some(list) => task.result.errors = list,
            None => task.result.errors.clear(),
        }
        Ok(())
    }

    pub fn add_warnings(&mut self, id: &str, warnings: Vec<String>) -> StoreResult<()> {
        if warnings.is_empty() {
            return Ok(());
        }
        self.task_mut(id)?.result.warnings.extend(warnings);
        Ok(())
    }

    // === Declaration and options ===

    pub fn get_declaration(&self, id: &str) -> StoreResult<Value> {
        Ok(self.task(id)?.internal_declaration.clone())
    }

    /// Store a masked deep copy of `declaration`
    pub fn set_declaration(&mut self, id: &str, declaration: &Value) -> StoreResult<()> {
        let masked = mask::mask(declaration);
        self.task_mut(id)?.internal_declaration = masked;
        Ok(())
    }

    pub fn get_reboot_required(&self, id: &str) -> StoreResult<bool> {
        Ok(self.task(id)?.reboot_required)
    }

    pub fn set_reboot_required(&mut self, id: &str, required: bool) -> StoreResult<()> {
        self.task_mut(id)?.reboot_required = required;
        Ok(())
    }

    pub fn get_request_options(&self, id: &str) -> StoreResult<RequestOptions> {
        Ok(self.task(id)?.request_options.clone())
    }

    pub fn set_request_options(&mut self, id: &str, options: RequestOptions) -> StoreResult<()> {
        self.task_mut(id)?.request_options = options;
        Ok(())
    }

    pub fn get_rollback_info(&self, id: &str) -> StoreResult<Value> {
        Ok(self.task(id)?.rollback_info.clone())
    }

    /// Store rollback data; empty values are ignored
    pub fn set_rollback_info(&mut self, id: &str, info: Value) -> StoreResult<()> {
        if is_empty_value(&info) {
            // still a task-scoped call: an unknown id is an error
            self.task(id)?;
            return Ok(());
        }
        self.task_mut(id)?.rollback_info = info;
        Ok(())
    }

    // === Configuration snapshots ===

    pub fn get_current_config(&self, id: &str) -> StoreResult<Value> {
        Ok(self.task(id)?.current_config.clone())
    }

    pub fn set_current_config(&mut self, id: &str, config: &Value) -> StoreResult<()> {
        self.task_mut(id)?.current_config = config.clone();
        Ok(())
    }

    pub fn get_original_config_by_task_id(&self, id: &str) -> StoreResult<Value> {
        Ok(self.task(id)?.original_config.clone())
    }

    pub fn set_original_config_by_task_id(&mut self, id: &str, config: &Value) -> StoreResult<()> {
        self.task_mut(id)?.original_config = config.clone();
        Ok(())
    }

    /// Snapshot for a device; `None` when absent
    pub fn get_original_config_by_config_id(&self, config_id: &str) -> Option<Value> {
        self.original_config.get(config_id).cloned()
    }

    pub fn set_original_config_by_config_id(&mut self, config_id: &str, config: &Value) {
        debug!(%config_id, "set_original_config_by_config_id: called");
        self.original_config.insert(config_id.to_string(), config.clone());
    }

    /// Remove a device snapshot; returns whether it existed
    pub fn delete_original_config_by_config_id(&mut self, config_id: &str) -> bool {
        debug!(%config_id, "delete_original_config_by_config_id: called");
        self.original_config.remove(config_id).is_some()
    }

    pub fn original_config_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.original_config.keys().cloned().collect();
        ids.sort();
        ids
    }
}

fn is_empty_value(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Object(map) => map.is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::String(s) => s.is_empty(),
        _ => false,
    }
}
