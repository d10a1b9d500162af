//! Onboard daemon configuration types and loading

use eyre::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

/// Where this service runs relative to the device it configures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeploymentMode {
    /// Separate host configuring a remote device
    #[default]
    Standalone,
    /// Runs on the device itself; a device reboot restarts this process
    Embedded,
    /// Manager node that delegates declarations to a peer processor
    Manager,
}

impl std::fmt::Display for DeploymentMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Standalone => write!(f, "standalone"),
            Self::Embedded => write!(f, "embedded"),
            Self::Manager => write!(f, "manager"),
        }
    }
}

/// Main onboard configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Deployment mode
    pub deployment: DeploymentMode,

    /// Log level (TRACE, DEBUG, INFO, WARN, ERROR)
    #[serde(rename = "log-level")]
    pub log_level: Option<String>,

    /// HTTP server configuration
    pub server: ServerConfig,

    /// Task ledger storage
    pub storage: StorageConfig,

    /// Remote delegation (manager mode)
    pub delegation: DelegationConfig,

    /// Reboot recovery
    pub reboot: RebootConfig,

    /// Device handle cache
    pub devices: DevicesConfig,

    /// Webhook delivery
    pub webhook: WebhookConfig,
}

impl Config {
    /// Load configuration with fallback chain
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        // If explicit config path provided, try to load it
        if let Some(path) = config_path {
            return Self::load_from_file(path).context(format!("Failed to load config from {}", path.display()));
        }

        // Try project-local config: ./onboard.yml
        let local_config = PathBuf::from("onboard.yml");
        if local_config.exists() {
            match Self::load_from_file(&local_config) {
                Ok(config) => return Ok(config),
                Err(e) => {
                    tracing::warn!("Failed to load config from {}: {}", local_config.display(), e);
                }
            }
        }

        // Try user config: ~/.config/onboard/onboard.yml
        if let Some(config_dir) = dirs::config_dir() {
            let user_config = config_dir.join("onboard").join("onboard.yml");
            if user_config.exists() {
                match Self::load_from_file(&user_config) {
                    Ok(config) => return Ok(config),
                    Err(e) => {
                        tracing::warn!("Failed to load config from {}: {}", user_config.display(), e);
                    }
                }
            }
        }

        tracing::info!("No config file found, using defaults");
        Ok(Self::default())
    }

    /// Read only the log level, before logging is set up
    pub fn load_log_level(config_path: Option<&PathBuf>) -> Option<String> {
        Self::load(config_path).ok().and_then(|c| c.log_level)
    }

    fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path).context("Failed to read config file")?;

        let config: Self = serde_yaml::from_str(&content).context("Failed to parse config file")?;

        tracing::info!("Loaded config from: {}", path.as_ref().display());
        Ok(config)
    }

    /// Check settings that would otherwise fail late
    pub fn validate(&self) -> Result<()> {
        if self.deployment == DeploymentMode::Manager && self.delegation.url.is_none() {
            return Err(eyre::eyre!("Manager deployment requires delegation.url"));
        }
        if self.delegation.max_attempts == 0 {
            return Err(eyre::eyre!("delegation.max-attempts must be at least 1"));
        }
        if self.reboot.probe_attempts == 0 {
            return Err(eyre::eyre!("reboot.probe-attempts must be at least 1"));
        }
        Ok(())
    }
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen address
    pub listen: SocketAddr,

    /// Path prefix of the request surface
    #[serde(rename = "base-path")]
    pub base_path: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([127, 0, 0, 1], 8105)),
            base_path: "/onboard".to_string(),
        }
    }
}

/// Task ledger storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Path of the persisted state file
    #[serde(rename = "state-file")]
    pub state_file: PathBuf,

    /// Write-back attempts before giving up on one save
    #[serde(rename = "save-retries")]
    pub save_retries: u32,

    /// Initial backoff between write-back attempts in milliseconds (doubles per attempt)
    #[serde(rename = "save-backoff-ms")]
    pub save_backoff_ms: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        // Use XDG data directory (~/.local/share/onboard on Linux)
        let state_file = dirs::data_dir()
            .map(|d| d.join("onboard"))
            .unwrap_or_else(|| PathBuf::from(".onboard"))
            .join("state.json");

        Self {
            state_file,
            save_retries: 5,
            save_backoff_ms: 100,
        }
    }
}

/// Remote delegation configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DelegationConfig {
    /// Base URL of the peer processor
    pub url: Option<String>,

    /// Path receiving submissions
    #[serde(rename = "submit-path")]
    pub submit_path: String,

    /// Path prefix for status polls; the remote id is appended
    #[serde(rename = "status-path")]
    pub status_path: String,

    /// Delay between status polls in milliseconds
    #[serde(rename = "poll-interval-ms")]
    pub poll_interval_ms: u64,

    /// Maximum number of status polls; the default outlasts the peer's own timeout
    #[serde(rename = "max-attempts")]
    pub max_attempts: u32,

    /// Per-request timeout in milliseconds
    #[serde(rename = "timeout-ms")]
    pub timeout_ms: u64,
}

impl Default for DelegationConfig {
    fn default() -> Self {
        Self {
            url: None,
            submit_path: "/tasks".to_string(),
            status_path: "/tasks".to_string(),
            poll_interval_ms: 5000,
            max_attempts: 384,
            timeout_ms: 60_000,
        }
    }
}

/// Reboot recovery configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RebootConfig {
    /// Wait after triggering a reboot before probing readiness, in milliseconds
    #[serde(rename = "settle-delay-ms")]
    pub settle_delay_ms: u64,

    /// Delay between readiness probes in milliseconds
    #[serde(rename = "probe-interval-ms")]
    pub probe_interval_ms: u64,

    /// Readiness probes before the reboot is declared failed
    #[serde(rename = "probe-attempts")]
    pub probe_attempts: u32,
}

impl Default for RebootConfig {
    fn default() -> Self {
        Self {
            settle_delay_ms: 10_000,
            probe_interval_ms: 10_000,
            probe_attempts: 90,
        }
    }
}

/// Device handle cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DevicesConfig {
    /// Cached handles before the oldest is dropped
    #[serde(rename = "max-cached")]
    pub max_cached: usize,
}

impl Default for DevicesConfig {
    fn default() -> Self {
        Self { max_cached: 64 }
    }
}

/// Webhook delivery configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebhookConfig {
    /// Request timeout in milliseconds
    #[serde(rename = "timeout-ms")]
    pub timeout_ms: u64,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self { timeout_ms: 10_000 }
    }
}
