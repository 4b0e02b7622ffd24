//! Workspace file operations.
//!
//! Paths are relative to the workspace root. Absolute paths, `..` segments
//! and denylisted paths are rejected. Writes go through a temporary file in
//! the target directory and are renamed into place.

use std::io::Write;
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::{debug, instrument};

use super::{expect_string_config, params, require_input, StepExecutor};
use crate::core::error::StepError;
use crate::core::interpolate::stringify;
use crate::core::safety::SafetyLimits;
use crate::domain::{ExecutionContext, Step, StepResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
enum FileOperation {
    Read,
    Write,
    Append,
    Exists,
    List,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
enum FileFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Deserialize)]
struct FileParams {
    operation: FileOperation,
    path: String,
    #[serde(default)]
    content: Value,
    #[serde(default)]
    format: FileFormat,
}

/// Executor for `file` steps
pub struct FileExecutor {
    root: PathBuf,
    limits: SafetyLimits,
}

impl FileExecutor {
    pub fn new(root: impl Into<PathBuf>, limits: SafetyLimits) -> Self {
        Self {
            root: root.into(),
            limits,
        }
    }

    /// Resolve a workspace-relative path, rejecting escapes and denylisted names
    fn resolve(&self, relative: &str) -> Result<PathBuf, StepError> {
        let path = Path::new(relative);
        if relative.trim().is_empty() {
            return Err(StepError::validation("path must not be empty"));
        }

        for component in path.components() {
            match component {
                Component::Normal(_) | Component::CurDir => {}
                _ => {
                    return Err(StepError::validation(format!(
                        "path '{}' must stay inside the workspace",
                        relative
                    )))
                }
            }
        }

        self.limits
            .validate_path(relative)
            .map_err(|e| StepError::validation(e.to_string()))?;

        Ok(self.root.join(path))
    }

    async fn run(
        &self,
        step: &Step,
        inputs: &Map<String, Value>,
        dry_run: bool,
    ) -> Result<StepResult, StepError> {
        let params: FileParams = params(inputs)?;
        let target = self.resolve(&params.path)?;
        let io_error = |action: &str, e: std::io::Error| {
            StepError::execution(&step.id, format!("Failed to {} '{}': {}", action, params.path, e))
        };

        let result = match params.operation {
            FileOperation::Read => {
                let content = fs::read_to_string(&target)
                    .await
                    .map_err(|e| io_error("read", e))?;
                match params.format {
                    FileFormat::Text => Value::String(content),
                    FileFormat::Json => serde_json::from_str(&content).map_err(|e| {
                        StepError::execution(&step.id, format!("'{}' is not valid JSON: {}", params.path, e))
                    })?,
                }
            }
            FileOperation::Exists => Value::Bool(fs::try_exists(&target).await.unwrap_or(false)),
            FileOperation::List => {
                let mut entries = fs::read_dir(&target).await.map_err(|e| io_error("list", e))?;
                let mut names = Vec::new();
                while let Some(entry) = entries.next_entry().await.map_err(|e| io_error("list", e))? {
                    if let Some(name) = entry.file_name().to_str() {
                        names.push(name.to_string());
                    }
                }
                names.sort();
                json!(names)
            }
            FileOperation::Write | FileOperation::Append if dry_run => {
                return Ok(StepResult::success(json!({
                    "result": null,
                    "path": params.path,
                    "dry_run": true,
                })));
            }
            FileOperation::Write => {
                let bytes = render(&params.content, params.format);
                let written = bytes.len();
                write_atomic(target, bytes)
                    .await
                    .map_err(|e| StepError::execution(&step.id, format!("Failed to write '{}': {:#}", params.path, e)))?;
                json!(written)
            }
            FileOperation::Append => {
                if let Some(parent) = target.parent() {
                    fs::create_dir_all(parent).await.map_err(|e| io_error("create", e))?;
                }
                let bytes = render(&params.content, params.format);
                let mut file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&target)
                    .await
                    .map_err(|e| io_error("open", e))?;
                file.write_all(&bytes).await.map_err(|e| io_error("append", e))?;
                file.flush().await.map_err(|e| io_error("flush", e))?;
                json!(bytes.len())
            }
        };

        debug!(step = %step.id, operation = ?params.operation, path = %params.path, "File operation complete");

        Ok(StepResult::success(json!({
            "result": result,
            "path": params.path,
        })))
    }
}

#[async_trait]
impl StepExecutor for FileExecutor {
    fn step_type(&self) -> &str {
        "file"
    }

    fn validate(&self, step: &Step) -> Vec<String> {
        let mut errors = Vec::new();
        require_input(step, "operation", &mut errors);
        require_input(step, "path", &mut errors);
        expect_string_config(step, "path", &mut errors);

        if let Some(operation) = step.config.get("operation") {
            if serde_json::from_value::<FileOperation>(operation.clone()).is_err() {
                errors.push(format!("unknown operation {}", operation));
            }
        }
        if let Some(path) = step.config.get("path").and_then(Value::as_str) {
            if let Err(e) = self.resolve(path) {
                errors.push(e.to_string());
            }
        }

        errors
    }

    #[instrument(skip(self, step, inputs, _context), fields(step = %step.id))]
    async fn execute(
        &self,
        step: &Step,
        inputs: &Map<String, Value>,
        _context: &ExecutionContext,
        dry_run: bool,
    ) -> StepResult {
        self.run(step, inputs, dry_run)
            .await
            .unwrap_or_else(StepResult::from)
    }
}

fn render(content: &Value, format: FileFormat) -> Vec<u8> {
    match (content, format) {
        (Value::String(s), FileFormat::Text) => s.clone().into_bytes(),
        (other, FileFormat::Json) => serde_json::to_vec_pretty(other).unwrap_or_default(),
        (other, FileFormat::Text) => stringify(other).into_bytes(),
    }
}

/// Write via a sibling temp file so readers never see a partial file
async fn write_atomic(target: PathBuf, bytes: Vec<u8>) -> anyhow::Result<()> {
    tokio::task::spawn_blocking(move || -> anyhow::Result<()> {
        let dir = target
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        std::fs::create_dir_all(&dir)?;

        let mut temp = tempfile::NamedTempFile::new_in(&dir)?;
        temp.write_all(&bytes)?;
        temp.as_file().sync_all()?;
        temp.persist(&target)?;
        Ok(())
    })
    .await?
}
