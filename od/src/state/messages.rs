//! State manager messages
//!
//! Commands and responses for the actor pattern.

use serde_json::Value;
use taskstore::{DoState, ErrorUpdate, RequestOptions, StoreError, Task, TaskStatus};
use thiserror::Error;
use tokio::sync::oneshot;

/// Errors from state operations
#[derive(Debug, Error)]
pub enum StateError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Persistence failed after {attempts} attempts: {message}")]
    Persistence { attempts: u32, message: String },

    #[error("Channel error")]
    ChannelError,
}

/// Response from state operations
pub type StateResponse<T> = Result<T, StateError>;

/// Commands sent to the StateManager actor
#[derive(Debug)]
pub enum StateCommand {
    // Task lifecycle
    AddTask {
        reply: oneshot::Sender<String>,
    },
    GetTask {
        id: String,
        reply: oneshot::Sender<StateResponse<Task>>,
    },
    ListTasks {
        reply: oneshot::Sender<Vec<Task>>,
    },
    MostRecentTask {
        reply: oneshot::Sender<Option<Task>>,
    },

    // Task fields
    UpdateResult {
        id: String,
        code: Option<u16>,
        status: Option<TaskStatus>,
        message: Option<String>,
        errors: ErrorUpdate,
        reply: oneshot::Sender<StateResponse<()>>,
    },
    AddWarnings {
        id: String,
        warnings: Vec<String>,
        reply: oneshot::Sender<StateResponse<()>>,
    },
    SetDeclaration {
        id: String,
        declaration: Value,
        reply: oneshot::Sender<StateResponse<()>>,
    },
    SetRebootRequired {
        id: String,
        required: bool,
        reply: oneshot::Sender<StateResponse<()>>,
    },
    SetRequestOptions {
        id: String,
        options: RequestOptions,
        reply: oneshot::Sender<StateResponse<()>>,
    },
    SetRollbackInfo {
        id: String,
        info: Value,
        reply: oneshot::Sender<StateResponse<()>>,
    },

    // Configuration snapshots
    RecordSnapshot {
        id: String,
        config_id: String,
        config: Value,
        reply: oneshot::Sender<StateResponse<()>>,
    },
    ListOriginalConfigs {
        reply: oneshot::Sender<Vec<(String, Value)>>,
    },
    GetOriginalConfig {
        config_id: String,
        reply: oneshot::Sender<Option<Value>>,
    },
    DeleteOriginalConfig {
        config_id: String,
        reply: oneshot::Sender<bool>,
    },

    /// Full copy of the ledger, for write-back
    Snapshot {
        reply: oneshot::Sender<DoState>,
    },
}
