//! Event types for the execution log.
//!
//! Execution history is recorded as immutable events in an append-only log;
//! records are rebuilt by replaying them (see `ExecutionHistory`).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::execution::{
    ExecutionResults, ExecutionStatus, PipelineExecutionRecord, StepExecutionRecord, StepMetrics,
};

/// A single event in the append-only log
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Unique identifier for this event
    pub id: Uuid,

    /// When this event occurred (ISO 8601)
    pub timestamp: DateTime<Utc>,

    /// The execution this event belongs to
    pub execution_id: Uuid,

    /// Human-readable summary (NO secrets)
    pub payload_summary: String,

    /// State change carried by the event
    #[serde(flatten)]
    pub payload: EventPayload,
}

/// State changes that can be logged
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum EventPayload {
    /// Execution record created in the running state
    ExecutionCreated { execution: PipelineExecutionRecord },

    /// Execution reached a terminal state
    ExecutionCompleted {
        status: ExecutionStatus,
        results: Option<ExecutionResults>,
        error: Option<String>,
    },

    /// Step record created in the running state
    StepStarted { step: StepExecutionRecord },

    /// Step reached a terminal state
    StepCompleted {
        step_execution_id: Uuid,
        status: ExecutionStatus,
        outputs: Option<Value>,
        error: Option<String>,
        metrics: StepMetrics,
    },
}

/// Discriminant of `EventPayload`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    ExecutionCreated,
    ExecutionCompleted,
    StepStarted,
    StepCompleted,
}

impl Event {
    fn new(execution_id: Uuid, payload_summary: String, payload: EventPayload) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            execution_id,
            payload_summary,
            payload,
        }
    }

    pub fn execution_created(execution: &PipelineExecutionRecord) -> Self {
        Self::new(
            execution.id,
            format!("Pipeline '{}' started by '{}'", execution.pipeline_id, execution.user_id),
            EventPayload::ExecutionCreated {
                execution: execution.clone(),
            },
        )
    }

    pub fn execution_completed(
        execution_id: Uuid,
        status: ExecutionStatus,
        results: Option<ExecutionResults>,
        error: Option<String>,
    ) -> Self {
        Self::new(
            execution_id,
            format!("Execution finished: {:?}", status),
            EventPayload::ExecutionCompleted {
                status,
                results,
                error,
            },
        )
    }

    pub fn step_started(step: &StepExecutionRecord) -> Self {
        Self::new(
            step.execution_id,
            format!("Step '{}' started", step.step_name),
            EventPayload::StepStarted { step: step.clone() },
        )
    }

    pub fn step_completed(
        execution_id: Uuid,
        step_execution_id: Uuid,
        status: ExecutionStatus,
        outputs: Option<Value>,
        error: Option<String>,
        metrics: StepMetrics,
    ) -> Self {
        Self::new(
            execution_id,
            format!(
                "Step {} finished: {:?} in {}ms",
                step_execution_id, status, metrics.execution_time_ms
            ),
            EventPayload::StepCompleted {
                step_execution_id,
                status,
                outputs,
                error,
                metrics,
            },
        )
    }

    /// Type of this event
    pub fn event_type(&self) -> EventType {
        match self.payload {
            EventPayload::ExecutionCreated { .. } => EventType::ExecutionCreated,
            EventPayload::ExecutionCompleted { .. } => EventType::ExecutionCompleted,
            EventPayload::StepStarted { .. } => EventType::StepStarted,
            EventPayload::StepCompleted { .. } => EventType::StepCompleted,
        }
    }
}
