//! Execution context threaded through a single run.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Identity of a run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionMetadata {
    pub execution_id: Uuid,
    pub pipeline_id: String,
    pub user_id: String,
}

/// State bag for one pipeline execution.
///
/// `input` is fixed at creation. `output` accumulates step results and can
/// only be changed from inside the crate, by the orchestrator, after a step
/// has succeeded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionContext {
    input: Map<String, Value>,
    output: Map<String, Value>,
    pub metadata: ExecutionMetadata,
    pub step_index: usize,
    pub total_steps: usize,
    pub started_at: DateTime<Utc>,
}

impl ExecutionContext {
    /// Create a context seeded with caller input
    pub fn new(input: Map<String, Value>, metadata: ExecutionMetadata, total_steps: usize) -> Self {
        Self {
            input,
            output: Map::new(),
            metadata,
            step_index: 0,
            total_steps,
            started_at: Utc::now(),
        }
    }

    /// Caller-supplied parameters
    pub fn input(&self) -> &Map<String, Value> {
        &self.input
    }

    /// Output accumulated so far
    pub fn output(&self) -> &Map<String, Value> {
        &self.output
    }

    pub fn execution_id(&self) -> Uuid {
        self.metadata.execution_id
    }

    pub fn user_id(&self) -> &str {
        &self.metadata.user_id
    }

    pub fn pipeline_id(&self) -> &str {
        &self.metadata.pipeline_id
    }

    /// Flat variable namespace for interpolation: input, then output on top
    pub fn variables(&self) -> Map<String, Value> {
        let mut vars = self.input.clone();
        for (key, value) in &self.output {
            vars.insert(key.clone(), value.clone());
        }
        vars
    }

    /// Set a single output key
    pub(crate) fn set_output(&mut self, key: impl Into<String>, value: Value) {
        self.output.insert(key.into(), value);
    }

    /// Merge every key of `values` into the output, overwriting duplicates
    pub(crate) fn merge_output(&mut self, values: &Map<String, Value>) {
        for (key, value) in values {
            self.output.insert(key.clone(), value.clone());
        }
    }

    /// Consume the context, returning the accumulated output
    pub(crate) fn into_output(self) -> Map<String, Value> {
        self.output
    }
}
