//! State management with actor pattern
//!
//! StateManager owns the task ledger and processes messages via channels,
//! providing safe shared access from concurrent workflows.

mod manager;
mod messages;

pub use manager::{StateEvent, StateManager};
pub use messages::{StateCommand, StateError, StateResponse};
