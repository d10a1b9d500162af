//! Workflow error type
//!
//! Collaborator failures are caught in the orchestrator and written into the
//! task result; only state errors (an unknown task id, a dead state actor)
//! escape a workflow.

use thiserror::Error;

use crate::delegation::DelegationError;
use crate::device::DeviceError;
use crate::processor::ProcessError;
use crate::secrets::SecretError;
use crate::state::StateError;

#[derive(Debug, Error)]
pub enum OnboardError {
    /// Request body is not a JSON object
    #[error("bad declaration: {0}")]
    BadDeclaration(String),

    #[error("failed to initialize device: {message}")]
    DeviceInit { code: u16, message: String },

    #[error("device error: {0}")]
    Device(#[from] DeviceError),

    #[error("{0}")]
    Processing(#[from] ProcessError),

    #[error("delegation error: {0}")]
    Delegation(#[from] DelegationError),

    #[error("account setup failed: {0}")]
    Account(String),

    #[error("secret error: {0}")]
    Secret(#[from] SecretError),

    #[error("state error: {0}")]
    State(#[from] StateError),
}

impl OnboardError {
    /// Result code this error maps to when recorded on a task
    pub fn code(&self) -> u16 {
        match self {
            Self::BadDeclaration(_) => 400,
            Self::DeviceInit { code, .. } => *code,
            Self::Device(e) => e.code(),
            Self::Processing(e) => e.code.unwrap_or(500),
            Self::Delegation(e) => e.code(),
            Self::Account(_) | Self::Secret(_) | Self::State(_) => 500,
        }
    }

    /// Whether this error signals a defect in the caller rather than a task failure
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::State(_))
    }
}

pub type OnboardResult<T> = Result<T, OnboardError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes() {
        assert_eq!(OnboardError::BadDeclaration("x".into()).code(), 400);
        assert_eq!(
            OnboardError::DeviceInit {
                code: 401,
                message: "unauthorized".into()
            }
            .code(),
            401
        );
        assert_eq!(OnboardError::Account("nope".into()).code(), 500);
        assert_eq!(OnboardError::Processing(ProcessError::new("boom")).code(), 500);
        assert_eq!(OnboardError::Processing(ProcessError::with_code(400, "bad")).code(), 400);
    }

    #[test]
    fn test_only_state_errors_are_fatal() {
        assert!(OnboardError::State(StateError::ChannelError).is_fatal());
        assert!(!OnboardError::Account("x".into()).is_fatal());
    }
}
