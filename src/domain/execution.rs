//! Execution records and their reconstruction from events.
//!
//! A `PipelineExecutionRecord` represents one run of a pipeline; each step
//! that was dispatched gets a `StepExecutionRecord`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use super::events::{Event, EventPayload};

/// Status of a pipeline or step execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    /// Not yet started
    #[default]
    Pending,

    /// Currently executing
    Running,

    /// Completed successfully
    Completed,

    /// Failed (with error)
    Failed,

    /// Stopped between steps at the caller's request
    Cancelled,
}

impl ExecutionStatus {
    /// Whether no further transitions can happen
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// Aggregated results of a run
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ExecutionResults {
    /// Accumulated context output
    pub output: Map<String, Value>,

    /// Primary output of the last step (null unless the run completed)
    pub final_output: Value,

    pub total_cost: f64,
    pub total_tokens: u64,
    pub steps_completed: usize,
}

/// A pipeline execution run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineExecutionRecord {
    /// Unique identifier for this execution
    pub id: Uuid,

    pub pipeline_id: String,
    pub user_id: String,
    pub status: ExecutionStatus,

    /// Whether providers were bypassed
    #[serde(default)]
    pub dry_run: bool,

    /// Caller-supplied input
    #[serde(default)]
    pub input: Map<String, Value>,

    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub results: Option<ExecutionResults>,
    pub error: Option<String>,
}

impl PipelineExecutionRecord {
    /// Create a record in the running state
    pub fn start(
        id: Uuid,
        pipeline_id: impl Into<String>,
        user_id: impl Into<String>,
        input: Map<String, Value>,
        dry_run: bool,
    ) -> Self {
        Self {
            id,
            pipeline_id: pipeline_id.into(),
            user_id: user_id.into(),
            status: ExecutionStatus::Running,
            dry_run,
            input,
            started_at: Utc::now(),
            completed_at: None,
            results: None,
            error: None,
        }
    }

    /// Move to a terminal state
    pub fn finish(
        &mut self,
        status: ExecutionStatus,
        results: Option<ExecutionResults>,
        error: Option<String>,
        at: DateTime<Utc>,
    ) {
        self.status = status;
        self.results = results;
        self.error = error;
        self.completed_at = Some(at);
    }

    /// Accumulated output, empty if none was recorded
    pub fn output(&self) -> Map<String, Value> {
        self.results
            .as_ref()
            .map(|r| r.output.clone())
            .unwrap_or_default()
    }

    pub fn is_finished(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Per-step measurements
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct StepMetrics {
    pub execution_time_ms: u64,
    pub cost: f64,
    pub tokens_used: u64,
    pub attempts: u32,
}

/// Record of one step's execution within a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepExecutionRecord {
    pub id: Uuid,
    pub execution_id: Uuid,
    pub step_id: String,
    pub step_name: String,
    pub status: ExecutionStatus,

    /// Resolved inputs snapshot
    pub inputs: Map<String, Value>,

    pub outputs: Option<Value>,
    pub error: Option<String>,
    pub metrics: StepMetrics,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl StepExecutionRecord {
    /// Create a running step record
    pub fn start(
        execution_id: Uuid,
        step_id: impl Into<String>,
        step_name: impl Into<String>,
        inputs: Map<String, Value>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            execution_id,
            step_id: step_id.into(),
            step_name: step_name.into(),
            status: ExecutionStatus::Running,
            inputs,
            outputs: None,
            error: None,
            metrics: StepMetrics::default(),
            started_at: Utc::now(),
            completed_at: None,
        }
    }

    /// Move to a terminal state
    pub fn finish(
        &mut self,
        status: ExecutionStatus,
        outputs: Option<Value>,
        error: Option<String>,
        metrics: StepMetrics,
        at: DateTime<Utc>,
    ) {
        self.status = status;
        self.outputs = outputs;
        self.error = error;
        self.metrics = metrics;
        self.completed_at = Some(at);
    }
}

/// An execution with its step records, rebuilt from the event log
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionHistory {
    pub execution: PipelineExecutionRecord,
    pub steps: Vec<StepExecutionRecord>,
}

impl ExecutionHistory {
    /// Reconstruct execution state from a sequence of events.
    ///
    /// Returns `None` when the log does not start with the creation event.
    pub fn from_events(events: &[Event]) -> Option<Self> {
        let first = events.first()?;
        let EventPayload::ExecutionCreated { execution } = &first.payload else {
            return None;
        };

        let mut history = Self {
            execution: execution.clone(),
            steps: Vec::new(),
        };

        for event in &events[1..] {
            history.apply_event(event);
        }

        Some(history)
    }

    /// Apply a single event to update state
    pub fn apply_event(&mut self, event: &Event) {
        match &event.payload {
            EventPayload::ExecutionCreated { execution } => {
                self.execution = execution.clone();
            }
            EventPayload::ExecutionCompleted {
                status,
                results,
                error,
            } => {
                self.execution
                    .finish(*status, results.clone(), error.clone(), event.timestamp);
            }
            EventPayload::StepStarted { step } => {
                self.steps.push(step.clone());
            }
            EventPayload::StepCompleted {
                step_execution_id,
                status,
                outputs,
                error,
                metrics,
            } => {
                if let Some(step) = self.steps.iter_mut().find(|s| s.id == *step_execution_id) {
                    step.finish(
                        *status,
                        outputs.clone(),
                        error.clone(),
                        metrics.clone(),
                        event.timestamp,
                    );
                }
            }
        }
    }
}
