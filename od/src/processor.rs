//! Declaration validation and processing seams
//!
//! Turning a declaration into device configuration is done by collaborators
//! behind these traits. [`BasicValidator`] is a structural check for hosts
//! without a schema validator.

use async_trait::async_trait;
use serde_json::Value;
use taskstore::Task;
use thiserror::Error;

use crate::device::Device;
use crate::orchestrator::RevokeSender;

/// Checks a wrapped envelope before any task processing
pub trait Validator: Send + Sync {
    /// `Err` carries the list of validation errors
    fn validate(&self, envelope: &Value) -> Result<(), Vec<String>>;
}

/// Structural validation: envelope class, declaration class, schema version
#[derive(Debug, Clone, Default)]
pub struct BasicValidator;

impl Validator for BasicValidator {
    fn validate(&self, envelope: &Value) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();
        if envelope.get("class").and_then(Value::as_str) != Some("DO") {
            errors.push("envelope class must be \"DO\"".to_string());
        }
        match envelope.get("declaration") {
            Some(Value::Object(declaration)) => {
                if declaration.get("class").and_then(Value::as_str) != Some("Device") {
                    errors.push("declaration class must be \"Device\"".to_string());
                }
                if !declaration.get("schemaVersion").is_some_and(Value::is_string) {
                    errors.push("declaration requires a schemaVersion string".to_string());
                }
            }
            _ => errors.push("declaration must be an object".to_string()),
        }
        if let Some(async_flag) = envelope.get("async")
            && !async_flag.is_boolean()
        {
            errors.push("async must be a boolean".to_string());
        }
        if errors.is_empty() { Ok(()) } else { Err(errors) }
    }
}

/// Failure reported by the declaration processor
#[derive(Debug, Clone, Error, PartialEq)]
#[error("{message}")]
pub struct ProcessError {
    /// Result code the processor attached, if any
    pub code: Option<u16>,
    pub message: String,
}

impl ProcessError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            code: None,
            message: message.into(),
        }
    }

    pub fn with_code(code: u16, message: impl Into<String>) -> Self {
        Self {
            code: Some(code),
            message: message.into(),
        }
    }
}

/// What a successful processing run reports back
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProcessOutcome {
    /// Applied changes need a reboot
    pub reboot_required: bool,
    /// Data the processor needs to undo this run
    pub rollback_info: Value,
    pub warnings: Vec<String>,
}

/// Task context handed to the processor
#[derive(Debug, Clone)]
pub struct ProcessContext {
    /// Task record as of the start of processing
    pub task: Task,
    /// Where to announce a license revocation that will restart the host
    pub revoke: RevokeSender,
}

/// Applies declarations to a device
#[async_trait]
pub trait DeclarationProcessor: Send + Sync {
    async fn process(
        &self,
        device: &dyn Device,
        declaration: &Value,
        ctx: &ProcessContext,
    ) -> Result<ProcessOutcome, ProcessError>;

    /// Re-apply `target`, the configuration captured before the failed run
    async fn rollback(
        &self,
        device: &dyn Device,
        target: &Value,
        current: &Value,
        ctx: &ProcessContext,
    ) -> Result<(), ProcessError>;
}

/// Reads the device's current configuration
#[async_trait]
pub trait ConfigManager: Send + Sync {
    async fn current_config(&self, device: &dyn Device) -> Result<Value, ProcessError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_basic_validator_accepts_minimal_envelope() {
        let envelope = json!({
            "class": "DO",
            "declaration": {"class": "Device", "schemaVersion": "1.0.0"}
        });
        assert!(BasicValidator.validate(&envelope).is_ok());
    }

    #[test]
    fn test_basic_validator_reports_all_errors() {
        let envelope = json!({
            "class": "DO",
            "declaration": {"class": "Tenant"},
            "async": "yes"
        });
        let errors = BasicValidator.validate(&envelope).unwrap_err();
        assert_eq!(errors.len(), 3);
        assert!(errors[0].contains("Device"));
    }

    #[test]
    fn test_process_error_display() {
        assert_eq!(ProcessError::with_code(422, "bad vlan").to_string(), "bad vlan");
        assert_eq!(ProcessError::new("boom").code, None);
    }
}
