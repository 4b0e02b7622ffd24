//! Outbound HTTP request step.

use std::collections::BTreeMap;

use async_trait::async_trait;
use reqwest::Method;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tracing::{debug, instrument};

use super::{expect_string_config, params, require_input, StepExecutor};
use crate::core::error::StepError;
use crate::core::interpolate::interpolate;
use crate::domain::{ExecutionContext, Step, StepResult};

/// Characters of an error body kept in failure messages
const ERROR_BODY_PREVIEW: usize = 200;

#[derive(Debug, Deserialize)]
struct ApiParams {
    url: String,
    #[serde(default = "default_method")]
    method: String,
    #[serde(default)]
    headers: BTreeMap<String, String>,
    #[serde(default)]
    body: Option<Value>,
}

fn default_method() -> String {
    "GET".to_string()
}

/// Executor for `api` steps
pub struct ApiExecutor {
    client: reqwest::Client,
}

impl Default for ApiExecutor {
    fn default() -> Self {
        Self::new(reqwest::Client::new())
    }
}

impl ApiExecutor {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }

    async fn run(
        &self,
        step: &Step,
        inputs: &Map<String, Value>,
        context: &ExecutionContext,
        dry_run: bool,
    ) -> Result<StepResult, StepError> {
        let params: ApiParams = params(inputs)?;

        let mut vars = context.variables();
        for (key, value) in inputs {
            vars.insert(key.clone(), value.clone());
        }
        let url = interpolate(&params.url, &vars);
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(StepError::validation(format!("url '{}' must be http(s)", url)));
        }

        let method = Method::from_bytes(params.method.to_uppercase().as_bytes())
            .map_err(|_| StepError::validation(format!("invalid method '{}'", params.method)))?;

        if dry_run {
            return Ok(StepResult::success(json!({
                "result": null,
                "status": 0,
                "method": method.as_str(),
                "url": url,
                "dry_run": true,
            })));
        }

        let mut request = self.client.request(method.clone(), &url);
        for (name, value) in &params.headers {
            request = request.header(name.as_str(), interpolate(value, &vars));
        }
        if let Some(ref body) = params.body {
            request = request.json(body);
        }

        let response = request
            .send()
            .await
            .map_err(|e| StepError::execution(&step.id, format!("{} {} failed: {}", method, url, e)))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| StepError::execution(&step.id, format!("Failed to read response: {}", e)))?;

        debug!(step = %step.id, %method, %url, status = status.as_u16(), "Request complete");

        if !status.is_success() {
            let preview: String = text.chars().take(ERROR_BODY_PREVIEW).collect();
            return Err(StepError::execution(
                &step.id,
                format!("{} {} returned HTTP {}: {}", method, url, status.as_u16(), preview),
            ));
        }

        let result = serde_json::from_str::<Value>(&text).unwrap_or(Value::String(text));

        Ok(StepResult::success(json!({
            "result": result,
            "status": status.as_u16(),
        })))
    }
}

#[async_trait]
impl StepExecutor for ApiExecutor {
    fn step_type(&self) -> &str {
        "api"
    }

    fn validate(&self, step: &Step) -> Vec<String> {
        let mut errors = Vec::new();
        require_input(step, "url", &mut errors);
        expect_string_config(step, "url", &mut errors);
        expect_string_config(step, "method", &mut errors);

        if let Some(method) = step.config.get("method").and_then(Value::as_str) {
            if Method::from_bytes(method.to_uppercase().as_bytes()).is_err() {
                errors.push(format!("invalid method '{}'", method));
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
