//! Device seam
//!
//! The transport to the managed device lives outside this crate. The
//! orchestrator only sees these traits; [`DeviceRegistry`] caches handles per
//! task.

mod registry;

pub use registry::DeviceRegistry;

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;

/// Where and how to reach a device
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConnectionInfo {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub ssh_key_path: Option<String>,
    pub tokens: Option<Value>,
}

/// Errors reported by device collaborators
#[derive(Debug, Clone, Error, PartialEq)]
pub enum DeviceError {
    /// The device answered with an error status
    #[error("{message}")]
    Request { code: u16, message: String },

    /// Credential change rejected because the old password did not match
    #[error("old password did not match")]
    CredentialMismatch,

    #[error("device is not ready: {0}")]
    NotReady(String),

    #[error("shell command failed: {0}")]
    Shell(String),
}

impl DeviceError {
    /// Device-reported code, 500 when the device reported none
    pub fn code(&self) -> u16 {
        match self {
            Self::Request { code, .. } => *code,
            _ => 500,
        }
    }
}

/// An authenticated handle to one device
#[async_trait]
pub trait Device: Send + Sync {
    /// Stable identifier used to key configuration snapshots
    async fn config_id(&self) -> Result<String, DeviceError>;

    /// Readiness probe
    async fn ready(&self) -> Result<(), DeviceError>;

    /// Persist the running configuration
    async fn save_config(&self) -> Result<(), DeviceError>;

    /// Whether pending changes need a reboot to take effect
    async fn reboot_required(&self) -> Result<bool, DeviceError>;

    async fn reboot(&self) -> Result<(), DeviceError>;

    /// Set the password of a local account
    async fn set_password(&self, username: &str, password: &str) -> Result<(), DeviceError>;

    /// Change the root password; fails with `CredentialMismatch` when `old` is wrong
    async fn change_root_password(&self, old: &str, new: &str) -> Result<(), DeviceError>;
}

/// Opens authenticated device handles
#[async_trait]
pub trait DeviceProvider: Send + Sync {
    async fn connect(&self, conn: &ConnectionInfo) -> Result<Arc<dyn Device>, DeviceError>;
}

/// Runs account commands over a shell session authenticated with a key
#[async_trait]
pub trait ShellRunner: Send + Sync {
    async fn set_password(&self, conn: &ConnectionInfo, username: &str, password: &str) -> Result<(), DeviceError>;
}
