//! TaskStore error types

use thiserror::Error;

/// Errors from task store operations
#[derive(Debug, Error)]
pub enum StoreError {
    /// A task-scoped operation named an id the ledger does not hold.
    /// Callers treat this as a defect, never as a task outcome.
    #[error("task {0} does not exist")]
    TaskNotFound(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Storage error: {0}")]
    Storage(String),
}

pub type StoreResult<T> = Result<T, StoreError>;
