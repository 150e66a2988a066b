//! Error types for the verification engine

use thiserror::Error;

use crate::config::ConfigError;

/// Main verification error type
#[derive(Error, Debug, Clone)]
pub enum VerificationError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Usage limit exceeded: {0}")]
    UsageLimitExceeded(String),

    #[error("Failed to load signature {signature_id}: {reason}")]
    SignatureLoad {
        signature_id: String,
        reason: String,
    },

    #[error("Signature {signature_id} failed during execution: {reason}")]
    SignatureExecution {
        signature_id: String,
        reason: String,
    },

    #[error("Failed to parse verifier output: {0}")]
    Parse(String),

    #[error("Failed to merge signature verdicts: {0}")]
    InternalMerge(String),
}

impl VerificationError {
    /// Transport-level failures, including the hosted backend quota error.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            VerificationError::Transport(_) | VerificationError::UsageLimitExceeded(_)
        )
    }
}

impl From<ConfigError> for VerificationError {
    fn from(err: ConfigError) -> Self {
        VerificationError::Configuration(err.to_string())
    }
}

/// Result alias used throughout the engine
pub type VerificationResult<T> = Result<T, VerificationError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_errors_become_configuration_errors() {
        let err: VerificationError = ConfigError::MissingRequired {
            key: "llm.api_key".to_string(),
        }
        .into();
        assert!(matches!(err, VerificationError::Configuration(_)));
        assert!(err.to_string().contains("llm.api_key"));
    }

    #[test]
    fn quota_errors_count_as_transport() {
        assert!(VerificationError::UsageLimitExceeded("402".into()).is_transport());
        assert!(VerificationError::Transport("timeout".into()).is_transport());
        assert!(!VerificationError::Parse("x".into()).is_transport());
    }
}
