//! Encrypted credential stash
//!
//! Credentials that must survive a process restart are handed to a vault
//! which encrypts them at rest. The cipher is not this crate's concern.

use async_trait::async_trait;
use thiserror::Error;

/// Stash id of the license manager credential kept across a revoke restart
pub const PRIMARY_SECRET_ID: &str = "onboard-revoke-primary";

/// Stash id of the device credential kept across a revoke restart
pub const SECONDARY_SECRET_ID: &str = "onboard-revoke-secondary";

#[derive(Debug, Clone, Error, PartialEq)]
pub enum SecretError {
    #[error("secret {0} not found")]
    NotFound(String),

    #[error("encryption failed: {0}")]
    Encrypt(String),

    #[error("decryption failed: {0}")]
    Decrypt(String),
}

#[async_trait]
pub trait SecretVault: Send + Sync {
    /// Encrypt `secret` and keep it under `id`
    async fn stash(&self, id: &str, secret: &str) -> Result<(), SecretError>;

    /// Decrypt the secret kept under `id`
    async fn recover(&self, id: &str) -> Result<String, SecretError>;

    /// Drop the secret kept under `id`; missing ids are not an error
    async fn delete(&self, id: &str) -> Result<(), SecretError>;
}
