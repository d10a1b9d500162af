//! Task record types

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// Task status as reported in `result.status`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    /// Declaration accepted and being applied
    Running,
    /// Applied; waiting for the device to come back from a reboot
    Rebooting,
    /// Apply failed; restoring the previous configuration
    RollingBack,
    /// License revocation in flight; process restart expected
    Revoking,
    /// Terminal success
    Ok,
    /// Terminal failure
    Error,
}

impl TaskStatus {
    /// Terminal statuses end a workflow
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Ok | Self::Error)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Running => "RUNNING",
            Self::Rebooting => "REBOOTING",
            Self::RollingBack => "ROLLING_BACK",
            Self::Revoking => "REVOKING",
            Self::Ok => "OK",
            Self::Error => "ERROR",
        };
        write!(f, "{}", s)
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "RUNNING" => Ok(Self::Running),
            "REBOOTING" => Ok(Self::Rebooting),
            "ROLLING_BACK" => Ok(Self::RollingBack),
            "REVOKING" => Ok(Self::Revoking),
            "OK" => Ok(Self::Ok),
            "ERROR" => Ok(Self::Error),
            other => Err(format!("unknown task status: {}", other)),
        }
    }
}

/// Outcome fields of a task
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskResult {
    pub code: Option<u16>,
    pub status: Option<TaskStatus>,
    pub message: Option<String>,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl TaskResult {
    /// True when nothing has been recorded yet
    pub fn is_empty(&self) -> bool {
        self.code.is_none()
            && self.status.is_none()
            && self.message.is_none()
            && self.errors.is_empty()
            && self.warnings.is_empty()
    }
}

/// How the request that created a task was made
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RequestOptions {
    /// HTTP method of the originating request
    pub method: String,
    /// Query parameters of the originating request
    pub query: BTreeMap<String, String>,
    /// Request was issued by the peer processing service
    pub from_peer: bool,
    /// Correlation id supplied by the peer for handle reuse
    pub correlation_id: Option<String>,
}

/// One onboarding attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: String,

    #[serde(default)]
    pub last_update: i64,

    #[serde(default)]
    pub result: TaskResult,

    /// Masked copy of the submitted declaration
    #[serde(default)]
    pub internal_declaration: Value,

    #[serde(default)]
    pub current_config: Value,

    #[serde(default)]
    pub original_config: Value,

    #[serde(default)]
    pub reboot_required: bool,

    #[serde(default)]
    pub request_options: RequestOptions,

    #[serde(default)]
    pub rollback_info: Value,

    /// Fields carried over from older state layouts
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Task {
    /// Create an empty task
    pub fn new(id: impl Into<String>, now_ms: i64) -> Self {
        Self {
            id: id.into(),
            last_update: now_ms,
            result: TaskResult::default(),
            internal_declaration: Value::Null,
            current_config: Value::Null,
            original_config: Value::Null,
            reboot_required: false,
            request_options: RequestOptions::default(),
            rollback_info: Value::Null,
            extra: Map::new(),
        }
    }

    /// Build a task out of a pre-task-model state object
    ///
    /// Known fields are parsed one at a time so a malformed field never loses
    /// the rest of the object. A known field that does not parse is kept in
    /// `extra` under a `legacy` prefixed key, since its own name would be
    /// serialized twice next to the typed field.
    pub fn from_legacy(id: impl Into<String>, now_ms: i64, mut legacy: Map<String, Value>) -> Self {
        let id = id.into();
        debug!(%id, field_count = legacy.len(), "Task::from_legacy: called");
        let mut task = Self::new(id, now_ms);

        if let Some(v) = legacy.remove("result") {
            match serde_json::from_value::<TaskResult>(v.clone()) {
                Ok(result) => task.result = result,
                Err(e) => {
                    warn!(error = %e, "Task::from_legacy: keeping unparsable result as extra field");
                    legacy.insert(legacy_key("result"), v);
                }
            }
        }
        if let Some(v) = legacy.remove("internalDeclaration") {
            task.internal_declaration = v;
        }
        if let Some(v) = legacy.remove("currentConfig") {
            task.current_config = v;
        }
        if let Some(v) = legacy.remove("originalConfig") {
            task.original_config = v;
        }
        if let Some(v) = legacy.remove("rebootRequired") {
            match v.as_bool() {
                Some(b) => task.reboot_required = b,
                None => {
                    warn!(value = %v, "Task::from_legacy: keeping non-boolean rebootRequired as extra field");
                    legacy.insert(legacy_key("rebootRequired"), v);
                }
            }
        }
        if let Some(v) = legacy.remove("requestOptions") {
            match serde_json::from_value::<RequestOptions>(v.clone()) {
                Ok(opts) => task.request_options = opts,
                Err(e) => {
                    warn!(error = %e, "Task::from_legacy: keeping unparsable requestOptions as extra field");
                    legacy.insert(legacy_key("requestOptions"), v);
                }
            }
        }
        if let Some(v) = legacy.remove("rollbackInfo") {
            task.rollback_info = v;
        }
        // A legacy id or timestamp would collide with the generated ones
        legacy.remove("id");
        legacy.remove("lastUpdate");

        task.extra = legacy;
        task
    }
}

/// `result` -> `legacyResult`
fn legacy_key(field: &str) -> String {
    let mut chars = field.chars();
    match chars.next() {
        Some(first) => format!("legacy{}{}", first.to_ascii_uppercase(), chars.as_str()),
        None => "legacy".to_string(),
    }
}
