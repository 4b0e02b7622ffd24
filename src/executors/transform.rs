//! Pure data transforms.
//!
//! The output depends only on `data` and `transform_type` (plus the
//! type-specific parameter such as `path` or `template`), so repeating a
//! transform with the same inputs always yields the same result.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Map, Value};

use super::{expect_string_config, params, require_input, StepExecutor};
use crate::core::error::StepError;
use crate::core::interpolate::{interpolate, stringify};
use crate::core::resolver::get_path;
use crate::domain::{ExecutionContext, Step, StepResult};

/// Supported `transform_type` values
pub const TRANSFORM_TYPES: [&str; 10] = [
    "wrap",
    "json",
    "stringify",
    "parse",
    "uppercase",
    "lowercase",
    "trim",
    "extract",
    "template",
    "passthrough",
];

#[derive(Debug, Deserialize)]
struct TransformParams {
    #[serde(default)]
    data: Value,
    transform_type: String,
    #[serde(default)]
    key: Option<String>,
    #[serde(default)]
    path: Option<String>,
    #[serde(default)]
    template: Option<String>,
}

/// Executor for `transform` steps
pub struct TransformExecutor;

impl TransformExecutor {
    fn run(&self, inputs: &Map<String, Value>) -> Result<Value, StepError> {
        if !inputs.contains_key("data") {
            return Err(StepError::validation("data is required"));
        }
        let params: TransformParams = params(inputs)?;
        apply(&params)
    }
}

#[async_trait]
impl StepExecutor for TransformExecutor {
    fn step_type(&self) -> &str {
        "transform"
    }

    fn validate(&self, step: &Step) -> Vec<String> {
        let mut errors = Vec::new();
        require_input(step, "data", &mut errors);
        require_input(step, "transform_type", &mut errors);
        expect_string_config(step, "transform_type", &mut errors);

        if let Some(kind) = step.config.get("transform_type").and_then(Value::as_str) {
            if !TRANSFORM_TYPES.contains(&kind) {
                errors.push(format!("unknown transform_type '{}'", kind));
            }
            if kind == "extract" && !step.provides_input("path") {
                errors.push("extract requires path".to_string());
            }
            if kind == "template" && !step.provides_input("template") {
                errors.push("template requires template".to_string());
            }
        }

        errors
    }

    async fn execute(
        &self,
        _step: &Step,
        inputs: &Map<String, Value>,
        _context: &ExecutionContext,
        _dry_run: bool,
    ) -> StepResult {
        match self.run(inputs) {
            Ok(result) => StepResult::success(json!({ "result": result })),
            Err(e) => e.into(),
        }
    }
}

fn apply(params: &TransformParams) -> Result<Value, StepError> {
    let data = &params.data;

    match params.transform_type.as_str() {
        "wrap" | "json" => Ok(wrap(data, params.key.as_deref().unwrap_or("value"))),
        "stringify" => Ok(Value::String(stringify(data))),
        "parse" => {
            let text = expect_str(data, "parse")?;
            serde_json::from_str(text)
                .map_err(|e| StepError::validation(format!("data is not valid JSON: {}", e)))
        }
        "uppercase" => Ok(Value::String(expect_str(data, "uppercase")?.to_uppercase())),
        "lowercase" => Ok(Value::String(expect_str(data, "lowercase")?.to_lowercase())),
        "trim" => Ok(Value::String(expect_str(data, "trim")?.trim().to_string())),
        "extract" => {
            let path = params
                .path
                .as_deref()
                .ok_or_else(|| StepError::validation("extract requires path"))?;
            Ok(get_path(data, path).cloned().unwrap_or(Value::Null))
        }
        "template" => {
            let template = params
                .template
                .as_deref()
                .ok_or_else(|| StepError::validation("template requires template"))?;
            let vars = match data {
                Value::Object(map) => map.clone(),
                other => {
                    let mut vars = Map::new();
                    vars.insert("data".to_string(), other.clone());
                    vars
                }
            };
            Ok(Value::String(interpolate(template, &vars)))
        }
        "passthrough" => Ok(data.clone()),
        other => Err(StepError::validation(format!("unknown transform_type '{}'", other))),
    }
}

/// Objects pass through; JSON-object strings are parsed; anything else is
/// placed under `key`
fn wrap(data: &Value, key: &str) -> Value {
    if let Value::Object(_) = data {
        return data.clone();
    }
    if let Some(Value::Object(parsed)) = data.as_str().and_then(|s| serde_json::from_str::<Value>(s).ok()) {
        return Value::Object(parsed);
    }

    let mut record = Map::new();
    record.insert(key.to_string(), data.clone());
    Value::Object(record)
}

fn expect_str<'a>(data: &'a Value, transform: &str) -> Result<&'a str, StepError> {
    data.as_str()
        .ok_or_else(|| StepError::validation(format!("{} expects string data", transform)))
}
