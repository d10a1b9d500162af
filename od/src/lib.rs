//! onboard - declarative device onboarding daemon
//!
//! A caller posts a declaration describing how a managed device should end
//! up. Each declaration becomes a task in the [`taskstore`] ledger and runs
//! through one asynchronous workflow: validate, set up the initial account,
//! apply, roll back on failure, reboot if needed. In manager deployments the
//! apply step is delegated to a peer processor instead.
//!
//! # Core Concepts
//!
//! - **Ledger first**: every status change is written to the task before the
//!   next step starts, so a restart can pick up where the last run stopped
//! - **Collaborators behind traits**: device transport, declaration
//!   processing and secret storage are supplied by the host
//! - **One response per request**: sync callers wait for the post-apply
//!   state, async callers get `202` immediately
//!
//! # Modules
//!
//! - [`orchestrator`] - Main flow, rollback, start-up recovery, license revocation
//! - [`delegation`] - Submit and poll a peer processor
//! - [`reboot`] - Post-apply state and reboot coordination
//! - [`account`] - Initial account password rotation
//! - [`state`] - Actor owning the task ledger
//! - [`api`] - Request surface and HTTP binding
//! - [`config`] - Configuration types and loading
//! - `sim` - Simulated collaborators (`sim` feature)

pub mod account;
pub mod api;
pub mod cli;
pub mod config;
pub mod declaration;
pub mod delegation;
pub mod device;
pub mod error;
pub mod orchestrator;
pub mod processor;
pub mod reboot;
pub mod secrets;
#[cfg(any(test, feature = "sim"))]
pub mod sim;
pub mod state;
pub mod view;
pub mod webhook;

// Re-export commonly used types
pub use config::{Config, DeploymentMode};
pub use error::{OnboardError, OnboardResult};
pub use orchestrator::{Collaborators, Orchestrator, Recovery, RevokeEvent, RevokeSender};
pub use state::{StateEvent, StateManager};
pub use view::TaskView;
