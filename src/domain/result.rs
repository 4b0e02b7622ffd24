//! Step results.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Keys checked, in order, when picking a step's primary output
const PRIMARY_OUTPUT_KEYS: [&str; 3] = ["response", "result", "content"];

/// Failure classification carried by a failed result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum StepErrorKind {
    Validation,
    Execution,
    ProviderAuthentication,
    ProviderRateLimit { retry_after_seconds: Option<u64> },
    Provider,
    Timeout,
    Cancelled,
}

impl StepErrorKind {
    /// Whether a retry could plausibly succeed
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            Self::Validation | Self::ProviderAuthentication | Self::Cancelled
        )
    }
}

/// Outcome of a single step execution.
///
/// `error` is present exactly when `success` is false.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    pub success: bool,
    pub output: Value,
    pub error: Option<String>,
    pub error_kind: Option<StepErrorKind>,
    pub execution_time_ms: u64,
    pub cost: f64,
    pub tokens_used: u64,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl StepResult {
    /// Successful result with the given output
    pub fn success(output: Value) -> Self {
        Self {
            success: true,
            output,
            error: None,
            error_kind: None,
            execution_time_ms: 0,
            cost: 0.0,
            tokens_used: 0,
            metadata: Map::new(),
        }
    }

    /// Failed result
    pub fn failure(kind: StepErrorKind, error: impl Into<String>) -> Self {
        Self {
            success: false,
            output: Value::Null,
            error: Some(error.into()),
            error_kind: Some(kind),
            execution_time_ms: 0,
            cost: 0.0,
            tokens_used: 0,
            metadata: Map::new(),
        }
    }

    pub fn with_usage(mut self, tokens_used: u64, cost: f64) -> Self {
        self.tokens_used = tokens_used;
        self.cost = cost;
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    pub fn with_execution_time(mut self, execution_time_ms: u64) -> Self {
        self.execution_time_ms = execution_time_ms;
        self
    }

    /// The value a caller most likely wants from this step
    pub fn primary_output(&self) -> &Value {
        if let Value::Object(map) = &self.output {
            for key in PRIMARY_OUTPUT_KEYS {
                if let Some(value) = map.get(key) {
                    return value;
                }
            }
        }
        &self.output
    }

    /// Error text, empty for successful results
    pub fn error_message(&self) -> &str {
        self.error.as_deref().unwrap_or_default()
    }
}
