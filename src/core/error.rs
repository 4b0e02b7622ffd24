//! Error taxonomy.
//!
//! `EngineError` covers failures detected before an execution record exists
//! and is returned to the caller. `StepError` covers failures inside a run;
//! those are captured into a failed step result and never returned as `Err`.

use std::time::Duration;

use thiserror::Error;

use crate::domain::{StepErrorKind, StepResult};

/// Pre-flight and infrastructure errors
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("User '{user_id}' is not authorized to execute pipeline '{pipeline_id}'")]
    Unauthorized { user_id: String, pipeline_id: String },

    #[error("Pipeline not found: {pipeline_id}")]
    PipelineNotFound { pipeline_id: String },

    #[error("Validation failed for step '{step_name}' ({step_id}): {}", errors.join("; "))]
    Validation {
        step_id: String,
        step_name: String,
        errors: Vec<String>,
    },

    #[error("Invalid execution input: {0}")]
    InvalidInput(String),

    #[error("Persistence error: {0:#}")]
    Persistence(#[from] anyhow::Error),
}

/// Convenience alias for engine results
pub type EngineResult<T, E = EngineError> = std::result::Result<T, E>;

/// Failures captured inside a run
#[derive(Debug, Clone, Error)]
pub enum StepError {
    #[error("Validation failed: {}", errors.join("; "))]
    Validation { errors: Vec<String> },

    #[error("Step '{step_id}' execution error: {message}")]
    Execution { step_id: String, message: String },

    #[error("Authentication with provider '{provider}' failed: {message}")]
    ProviderAuthentication { provider: String, message: String },

    #[error("Provider '{provider}' rate limit exceeded{}", retry_hint(retry_after))]
    ProviderRateLimit {
        provider: String,
        retry_after: Option<Duration>,
    },

    #[error("Provider '{provider}' error: {message}")]
    Provider { provider: String, message: String },

    #[error("Step '{step_id}' timed out after {timeout_seconds}s")]
    Timeout { step_id: String, timeout_seconds: u64 },

    #[error("Execution cancelled")]
    Cancelled,
}

fn retry_hint(retry_after: &Option<Duration>) -> String {
    match retry_after {
        Some(delay) => format!(" (retry after {}s)", delay.as_secs()),
        None => String::new(),
    }
}

impl StepError {
    /// Single-message validation failure
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            errors: vec![message.into()],
        }
    }

    pub fn execution(step_id: impl Into<String>, message: impl ToString) -> Self {
        Self::Execution {
            step_id: step_id.into(),
            message: message.to_string(),
        }
    }

    /// Serializable classification
    pub fn kind(&self) -> StepErrorKind {
        match self {
            Self::Validation { .. } => StepErrorKind::Validation,
            Self::Execution { .. } => StepErrorKind::Execution,
            Self::ProviderAuthentication { .. } => StepErrorKind::ProviderAuthentication,
            Self::ProviderRateLimit { retry_after, .. } => StepErrorKind::ProviderRateLimit {
                retry_after_seconds: retry_after.map(|d| d.as_secs()),
            },
            Self::Provider { .. } => StepErrorKind::Provider,
            Self::Timeout { .. } => StepErrorKind::Timeout,
            Self::Cancelled => StepErrorKind::Cancelled,
        }
    }
}

impl From<StepError> for StepResult {
    fn from(error: StepError) -> Self {
        StepResult::failure(error.kind(), error.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_message_lists_errors() {
        let err = EngineError::Validation {
            step_id: "s1".to_string(),
            step_name: "Summarize".to_string(),
            errors: vec!["model_id is required".to_string(), "prompt is required".to_string()],
        };
        assert_eq!(
            err.to_string(),
            "Validation failed for step 'Summarize' (s1): model_id is required; prompt is required"
        );
    }

    #[test]
    fn test_rate_limit_kind_keeps_hint() {
        let err = StepError::ProviderRateLimit {
            provider: "openai".to_string(),
            retry_after: Some(Duration::from_secs(30)),
        };
        assert!(err.to_string().contains("retry after 30s"));

        let result: StepResult = err.into();
        assert!(!result.success);
        assert_eq!(
            result.error_kind,
            Some(StepErrorKind::ProviderRateLimit {
                retry_after_seconds: Some(30)
            })
        );
    }
}
