//! Code step executor.
//!
//! Runs a snippet through an interpreter subprocess (`sh -c <code>` by
//! default). The step's resolved inputs are piped to stdin as JSON; stdout is
//! parsed as JSON when possible, otherwise returned as trimmed text.

use std::process::Stdio;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, instrument};

use super::{expect_string_config, params, require_input, StepExecutor};
use crate::core::error::StepError;
use crate::domain::{ExecutionContext, Step, StepResult};

const DEFAULT_INTERPRETER: &str = "sh";

#[derive(Debug, Deserialize)]
struct CodeParams {
    code: String,
    #[serde(default)]
    interpreter: Option<String>,
}

/// Executor for `code` steps
pub struct CodeExecutor {
    /// Interpreters steps may select
    allowed_interpreters: Vec<String>,
}

impl Default for CodeExecutor {
    fn default() -> Self {
        Self::with_interpreters(["sh", "bash", "python3", "node"])
    }
}

impl CodeExecutor {
    /// Restrict steps to the given interpreters
    pub fn with_interpreters<I, S>(interpreters: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            allowed_interpreters: interpreters.into_iter().map(Into::into).collect(),
        }
    }

    async fn run(
        &self,
        step: &Step,
        inputs: &Map<String, Value>,
        context: &ExecutionContext,
        dry_run: bool,
    ) -> Result<StepResult, StepError> {
        let params: CodeParams = params(inputs)?;
        let interpreter = params.interpreter.as_deref().unwrap_or(DEFAULT_INTERPRETER);

        if !self.allowed_interpreters.iter().any(|i| i == interpreter) {
            return Err(StepError::validation(format!(
                "interpreter '{}' is not allowed",
                interpreter
            )));
        }

        if dry_run {
            return Ok(StepResult::success(json!({"result": null, "dry_run": true})));
        }

        let mut payload = inputs.clone();
        payload.remove("code");
        let stdin_json = serde_json::to_vec(&payload)
            .map_err(|e| StepError::execution(&step.id, format!("Failed to encode inputs: {}", e)))?;

        let mut child = Command::new(interpreter)
            .arg(eval_flag(interpreter))
            .arg(&params.code)
            .env("PIPEWRIGHT_EXECUTION_ID", context.execution_id().to_string())
            .env("PIPEWRIGHT_STEP_ID", &step.id)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                StepError::execution(&step.id, format!("Failed to spawn '{}': {}", interpreter, e))
            })?;

        // stdin is fed while stdout/stderr drain, or a filter like `cat` blocks on a full pipe
        let stdin = child.stdin.take();
        let step_id = step.id.as_str();
        let feed = async move {
            if let Some(mut stdin) = stdin {
                // A script that never reads stdin closes the pipe early
                if let Err(e) = stdin.write_all(&stdin_json).await {
                    debug!(step = %step_id, error = %e, "Interpreter did not consume stdin");
                }
                // dropping stdin signals EOF
            }
        };

        let ((), output) = tokio::join!(feed, child.wait_with_output());
        let output = output
            .map_err(|e| StepError::execution(&step.id, format!("Failed to wait for interpreter: {}", e)))?;

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        let exit_code = output.status.code().unwrap_or(-1);

        if !output.status.success() {
            return Err(StepError::execution(
                &step.id,
                format!("'{}' exited with code {}: {}", interpreter, exit_code, stderr),
            ));
        }

        let trimmed = stdout.trim();
        let result = serde_json::from_str::<Value>(trimmed)
            .unwrap_or_else(|_| Value::String(trimmed.to_string()));

        Ok(StepResult::success(json!({
            "result": result,
            "stdout": stdout,
            "stderr": stderr,
            "exit_code": exit_code,
        })))
    }
}

#[async_trait]
impl StepExecutor for CodeExecutor {
    fn step_type(&self) -> &str {
        "code"
    }

    fn validate(&self, step: &Step) -> Vec<String> {
        let mut errors = Vec::new();
        require_input(step, "code", &mut errors);
        expect_string_config(step, "code", &mut errors);

        if let Some(interpreter) = step.config.get("interpreter").and_then(Value::as_str) {
            if !self.allowed_interpreters.iter().any(|i| i == interpreter) {
                errors.push(format!("interpreter '{}' is not allowed", interpreter));
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

fn eval_flag(interpreter: &str) -> &'static str {
    match interpreter {
        "node" => "-e",
        _ => "-c",
    }
}
