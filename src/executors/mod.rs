//! Step executors.
//!
//! Every step type has one executor. Executors read their typed parameters
//! from the step's resolved inputs and always return a `StepResult`; internal
//! failures become failed results instead of errors.

pub mod api;
pub mod code;
pub mod condition;
pub mod file;
pub mod prompt;
pub mod transform;

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

use crate::adapters::{CostTracker, CredentialResolver, PricingTable, ProviderGateway};
use crate::core::error::StepError;
use crate::core::safety::SafetyLimits;
use crate::domain::{ExecutionContext, Step, StepResult};

pub use api::ApiExecutor;
pub use code::CodeExecutor;
pub use condition::ConditionExecutor;
pub use file::FileExecutor;
pub use prompt::PromptExecutor;
pub use transform::TransformExecutor;

/// Trait implemented by every step type
#[async_trait]
pub trait StepExecutor: Send + Sync {
    /// Type tag this executor handles
    fn step_type(&self) -> &str;

    /// Static checks against the step definition, empty when valid
    fn validate(&self, _step: &Step) -> Vec<String> {
        Vec::new()
    }

    /// Run the step with its resolved inputs
    async fn execute(
        &self,
        step: &Step,
        inputs: &Map<String, Value>,
        context: &ExecutionContext,
        dry_run: bool,
    ) -> StepResult;
}

/// Collaborators needed by the built-in executors
#[derive(Clone)]
pub struct ExecutorDeps {
    pub gateway: Arc<dyn ProviderGateway>,
    pub credentials: Arc<dyn CredentialResolver>,
    pub cost_tracker: Arc<dyn CostTracker>,
    pub pricing: PricingTable,
    pub workspace_root: PathBuf,
    pub limits: SafetyLimits,
    pub http: reqwest::Client,
}

/// The six built-in executors
pub fn builtin_executors(deps: &ExecutorDeps) -> Vec<Arc<dyn StepExecutor>> {
    vec![
        Arc::new(PromptExecutor::new(
            deps.gateway.clone(),
            deps.credentials.clone(),
            deps.cost_tracker.clone(),
            deps.pricing.clone(),
        )),
        Arc::new(TransformExecutor),
        Arc::new(CodeExecutor::default()),
        Arc::new(FileExecutor::new(deps.workspace_root.clone(), deps.limits.clone())),
        Arc::new(ApiExecutor::new(deps.http.clone())),
        Arc::new(ConditionExecutor),
    ]
}

/// Deserialize typed parameters from resolved inputs
pub(crate) fn params<T: DeserializeOwned>(inputs: &Map<String, Value>) -> Result<T, StepError> {
    serde_json::from_value(Value::Object(inputs.clone()))
        .map_err(|e| StepError::validation(format!("Invalid step parameters: {}", e)))
}

/// Error unless `key` is statically configured or mapped
pub(crate) fn require_input(step: &Step, key: &str, errors: &mut Vec<String>) {
    if !step.provides_input(key) {
        errors.push(format!("{} is required", key));
    }
}

/// Error when a statically configured `key` is not a string
pub(crate) fn expect_string_config(step: &Step, key: &str, errors: &mut Vec<String>) {
    if let Some(value) = step.config.get(key) {
        if !value.is_string() {
            errors.push(format!("{} must be a string", key));
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use serde_json::{Map, Value};
    use uuid::Uuid;

    use crate::domain::{ExecutionContext, ExecutionMetadata};

    pub fn context() -> ExecutionContext {
        ExecutionContext::new(
            Map::new(),
            ExecutionMetadata {
                execution_id: Uuid::new_v4(),
                pipeline_id: "pipeline".to_string(),
                user_id: "user".to_string(),
            },
            1,
        )
    }

    pub fn inputs(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap_or_default()
    }
}
