//! TaskStore - onboarding task ledger
//!
//! Keeps one record per onboarding attempt plus a separate ledger of original
//! device configuration snapshots keyed by device id. Declarations are masked
//! before they are stored, old tasks are evicted lazily, and state written by
//! the pre-task versions of the store is upgraded on load.
//!
//! # Persisted layout
//!
//! ```text
//! {
//!   "tasks":          { "<id>": Task, ... },
//!   "mostRecentTask": "<id>",
//!   "originalConfig": { "<deviceId>": <snapshot>, ... }
//! }
//! ```
//!
//! # Example
//!
//! ```
//! use taskstore::{DoState, ErrorUpdate, TaskStatus};
//!
//! let mut state = DoState::default();
//! let id = state.add_task();
//! state
//!     .update_result(&id, Some(202), Some(TaskStatus::Running), Some("processing"), ErrorUpdate::Keep)
//!     .unwrap();
//! assert_eq!(state.get_status(&id).unwrap(), Some(TaskStatus::Running));
//! ```

mod error;
pub mod mask;
mod persistence;
mod state;
mod task;

pub use error::{StoreError, StoreResult};
pub use mask::MaskRules;
pub use persistence::{FileStorage, MemoryStorage, StatePersistence};
pub use state::{DoState, ErrorUpdate};
pub use task::{RequestOptions, Task, TaskResult, TaskStatus};

/// Tasks untouched for longer than this are evicted on the next `add_task`
pub const RETENTION_MS: i64 = 7 * 24 * 3600 * 1000;

/// Current time as Unix milliseconds
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Generate a new task id
pub fn generate_id() -> String {
    uuid::Uuid::now_v7().to_string()
}
