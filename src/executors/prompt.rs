//! Model invocation step.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tracing::{debug, instrument, warn};

use super::{expect_string_config, params, require_input, StepExecutor};
use crate::adapters::{
    CostTracker, CredentialRequest, CredentialResolver, GenerationParams, Message, PricingTable,
    ProviderError, ProviderGateway, UsageRecord,
};
use crate::core::error::StepError;
use crate::core::interpolate::interpolate;
use crate::domain::{ExecutionContext, Step, StepResult};

const DRY_RUN_PREVIEW_CHARS: usize = 80;

#[derive(Debug, Deserialize)]
struct PromptParams {
    model_id: String,
    prompt: String,
    #[serde(default)]
    system_prompt: Option<String>,
    #[serde(default)]
    provider: Option<String>,
    #[serde(default)]
    temperature: Option<f64>,
    #[serde(default)]
    max_tokens: Option<u64>,
}

/// Executor for `prompt` steps
pub struct PromptExecutor {
    gateway: Arc<dyn ProviderGateway>,
    credentials: Arc<dyn CredentialResolver>,
    cost_tracker: Arc<dyn CostTracker>,
    pricing: PricingTable,
}

impl PromptExecutor {
    pub fn new(
        gateway: Arc<dyn ProviderGateway>,
        credentials: Arc<dyn CredentialResolver>,
        cost_tracker: Arc<dyn CostTracker>,
        pricing: PricingTable,
    ) -> Self {
        Self {
            gateway,
            credentials,
            cost_tracker,
            pricing,
        }
    }

    async fn run(
        &self,
        step: &Step,
        inputs: &Map<String, Value>,
        context: &ExecutionContext,
        dry_run: bool,
    ) -> Result<StepResult, StepError> {
        check_required(inputs)?;
        let params: PromptParams = params(inputs)?;

        let mut vars = context.variables();
        for (key, value) in inputs {
            vars.insert(key.clone(), value.clone());
        }
        let prompt = interpolate(&params.prompt, &vars);
        let system_prompt = params.system_prompt.as_deref().map(|s| interpolate(s, &vars));
        let provider = params
            .provider
            .clone()
            .unwrap_or_else(|| infer_provider(&params.model_id).to_string());

        let mut messages = Vec::new();
        if let Some(system) = system_prompt.filter(|s| !s.is_empty()) {
            messages.push(Message::system(system));
        }
        messages.push(Message::user(prompt));

        if dry_run {
            return Ok(self.simulate(&provider, &params, &messages));
        }

        let request = CredentialRequest {
            provider: &provider,
            user_id: context.user_id(),
            step_config: inputs,
        };
        let credentials = self
            .credentials
            .resolve(&request)
            .await
            .map_err(|e| StepError::execution(&step.id, format!("Credential lookup failed: {:#}", e)))?
            .ok_or_else(|| StepError::ProviderAuthentication {
                provider: provider.clone(),
                message: "no credentials configured".to_string(),
            })?;

        let generation_params = GenerationParams {
            model: params.model_id.clone(),
            temperature: params.temperature,
            max_tokens: params.max_tokens,
        };

        let generation = self
            .gateway
            .generate(&provider, &credentials, &messages, &generation_params)
            .await
            .map_err(|e| classify(&provider, e))?;

        let usage = generation.usage;
        let record = UsageRecord {
            provider: provider.clone(),
            model: params.model_id.clone(),
            input_tokens: usage.prompt_tokens,
            output_tokens: usage.completion_tokens,
            user_id: context.user_id().to_string(),
            pipeline_id: context.pipeline_id().to_string(),
            execution_id: context.execution_id(),
        };
        let cost = match self.cost_tracker.record_usage(record).await {
            Ok(cost) => cost,
            Err(e) => {
                warn!(step = %step.id, error = %e, "Failed to record usage, using local pricing");
                self.pricing
                    .cost(&params.model_id, usage.prompt_tokens, usage.completion_tokens)
            }
        };

        debug!(step = %step.id, tokens = usage.total(), cost, "Generation complete");

        Ok(StepResult::success(json!({
            "response": generation.content,
            "model": params.model_id,
            "provider": provider,
            "usage": {
                "prompt_tokens": usage.prompt_tokens,
                "completion_tokens": usage.completion_tokens,
                "total_tokens": usage.total(),
            },
        }))
        .with_usage(usage.total(), cost))
    }

    /// Deterministic result with estimated usage, no provider involved
    fn simulate(&self, provider: &str, params: &PromptParams, messages: &[Message]) -> StepResult {
        let input_chars: usize = messages.iter().map(|m| m.content.chars().count()).sum();
        let input_tokens = estimate_tokens(input_chars).max(1);
        let output_tokens = params.max_tokens.unwrap_or(input_tokens).min(input_tokens);
        let cost = self.pricing.cost(&params.model_id, input_tokens, output_tokens);

        let preview: String = messages
            .last()
            .map(|m| m.content.chars().take(DRY_RUN_PREVIEW_CHARS).collect())
            .unwrap_or_default();

        StepResult::success(json!({
            "response": format!("[dry run] {}: {}", params.model_id, preview),
            "model": params.model_id,
            "provider": provider,
            "usage": {
                "prompt_tokens": input_tokens,
                "completion_tokens": output_tokens,
                "total_tokens": input_tokens + output_tokens,
            },
            "dry_run": true,
        }))
        .with_usage(input_tokens + output_tokens, cost)
        .with_metadata("dry_run", json!(true))
    }
}

#[async_trait]
impl StepExecutor for PromptExecutor {
    fn step_type(&self) -> &str {
        "prompt"
    }

    fn validate(&self, step: &Step) -> Vec<String> {
        let mut errors = Vec::new();
        require_input(step, "model_id", &mut errors);
        require_input(step, "prompt", &mut errors);
        expect_string_config(step, "model_id", &mut errors);
        expect_string_config(step, "prompt", &mut errors);
        expect_string_config(step, "system_prompt", &mut errors);

        let mapped = |key: &str| step.input_mapping.contains_key(key);
        for key in ["model_id", "prompt"] {
            if !mapped(key) && step.config.get(key).and_then(Value::as_str) == Some("") {
                errors.push(format!("{} must not be empty", key));
            }
        }

        errors
    }

    #[instrument(skip(self, step, inputs, context), fields(step = %step.id))]
    async fn execute(
        &self,
        step: &Step,
        inputs: &Map<String, Value>,
        context: &ExecutionContext,
        dry_run: bool,
    ) -> StepResult {
        self.run(step, inputs, context, dry_run)
            .await
            .unwrap_or_else(StepResult::from)
    }
}

/// Resolved-input checks for the two required parameters
fn check_required(inputs: &Map<String, Value>) -> Result<(), StepError> {
    let mut errors = Vec::new();
    for key in ["model_id", "prompt"] {
        match inputs.get(key) {
            Some(Value::String(s)) if !s.trim().is_empty() => {}
            Some(Value::String(_)) => errors.push(format!("{} must not be empty", key)),
            Some(_) => errors.push(format!("{} must be a string", key)),
            None => errors.push(format!("{} is required", key)),
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(StepError::Validation { errors })
    }
}

/// Provider implied by a model id
pub fn infer_provider(model_id: &str) -> &'static str {
    let model = model_id.to_ascii_lowercase();
    if model.starts_with("claude") {
        "anthropic"
    } else {
        "openai"
    }
}

/// Rough token estimate (~4 characters per token)
pub fn estimate_tokens(chars: usize) -> u64 {
    chars.div_ceil(4) as u64
}

fn classify(provider: &str, error: ProviderError) -> StepError {
    let provider = provider.to_string();
    match error {
        ProviderError::Authentication { message } => {
            StepError::ProviderAuthentication { provider, message }
        }
        ProviderError::RateLimit { retry_after } => {
            StepError::ProviderRateLimit { provider, retry_after }
        }
        ProviderError::Provider { message } => StepError::Provider { provider, message },
    }
}
