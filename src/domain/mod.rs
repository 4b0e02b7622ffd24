//! Domain types for the pipewright engine.
//!
//! This module contains the core data structures:
//! - Pipeline: Definitions, steps and input sources
//! - Context: State threaded through one execution
//! - Result: Outcome of a single step
//! - Execution: Run and step records, rebuilt from events
//! - Document: Portable exchange format

pub mod context;
pub mod document;
pub mod events;
pub mod execution;
pub mod pipeline;
pub mod result;

// Re-export commonly used types
pub use context::{ExecutionContext, ExecutionMetadata};
pub use document::{PipelineDocument, FORMAT_VERSION};
pub use events::{Event, EventPayload, EventType};
pub use execution::{
    ExecutionHistory, ExecutionResults, ExecutionStatus, PipelineExecutionRecord,
    StepExecutionRecord, StepMetrics,
};
pub use pipeline::{
    ContextSource, PipelineDefinition, RetryPolicy, SourceSpec, Step, StepType, Visibility,
};
pub use result::{StepErrorKind, StepResult};
