//! Condition step: evaluates a comparison and reports the outcome.
//!
//! With `require: true` a false outcome fails the step, which stops the
//! pipeline; otherwise the outcome is just another output value.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Map, Value};

use super::{params, require_input, StepExecutor};
use crate::core::error::StepError;
use crate::domain::{ExecutionContext, Step, StepResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
enum Operator {
    Equals,
    NotEquals,
    Contains,
    GreaterThan,
    LessThan,
    Exists,
    #[default]
    Truthy,
}

#[derive(Debug, Deserialize)]
struct ConditionParams {
    #[serde(default, alias = "left")]
    value: Value,
    #[serde(default)]
    operator: Operator,
    #[serde(default, alias = "right")]
    compare: Value,
    #[serde(default)]
    require: bool,
}

/// Executor for `condition` steps
pub struct ConditionExecutor;

impl ConditionExecutor {
    fn run(&self, inputs: &Map<String, Value>) -> Result<StepResult, StepError> {
        let params: ConditionParams = params(inputs)?;
        let outcome = evaluate(params.operator, &params.value, &params.compare)?;

        if params.require && !outcome {
            return Err(StepError::validation(format!(
                "required condition {:?} was not met",
                params.operator
            )));
        }

        Ok(StepResult::success(json!({
            "result": outcome,
            "branch": if outcome { "true" } else { "false" },
        })))
    }
}

#[async_trait]
impl StepExecutor for ConditionExecutor {
    fn step_type(&self) -> &str {
        "condition"
    }

    fn validate(&self, step: &Step) -> Vec<String> {
        let mut errors = Vec::new();
        if !step.provides_input("left") {
            require_input(step, "value", &mut errors);
        }

        if let Some(operator) = step.config.get("operator") {
            if serde_json::from_value::<Operator>(operator.clone()).is_err() {
                errors.push(format!("unknown operator {}", operator));
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
        self.run(inputs).unwrap_or_else(StepResult::from)
    }
}

fn evaluate(operator: Operator, value: &Value, compare: &Value) -> Result<bool, StepError> {
    Ok(match operator {
        Operator::Equals => loosely_equal(value, compare),
        Operator::NotEquals => !loosely_equal(value, compare),
        Operator::Exists => !value.is_null(),
        Operator::Truthy => is_truthy(value),
        Operator::Contains => match (value, compare) {
            (Value::String(haystack), Value::String(needle)) => haystack.contains(needle.as_str()),
            (Value::Array(items), needle) => items.iter().any(|item| loosely_equal(item, needle)),
            (Value::Object(map), Value::String(key)) => map.contains_key(key),
            _ => false,
        },
        Operator::GreaterThan | Operator::LessThan => {
            let ordering = match (value, compare) {
                (Value::String(a), Value::String(b)) => a.cmp(b),
                _ => {
                    let (a, b) = value
                        .as_f64()
                        .zip(compare.as_f64())
                        .ok_or_else(|| StepError::validation("ordering comparison needs two numbers or two strings"))?;
                    a.partial_cmp(&b).unwrap_or(std::cmp::Ordering::Equal)
                }
            };
            if operator == Operator::GreaterThan {
                ordering.is_gt()
            } else {
                ordering.is_lt()
            }
        }
    })
}

/// Numbers compare by value so that `1` equals `1.0`
fn loosely_equal(a: &Value, b: &Value) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}
