//! pipewright - multi-step pipeline execution engine
//!
//! Runs user-defined pipelines: ordered sequences of typed steps (LLM
//! prompts, data transforms, code, file operations, HTTP calls and
//! conditions) sharing one execution context.
//!
//! # Architecture
//!
//! - Each step reads its inputs from the context through input mappings and
//!   writes its output back, either mapped or merged
//! - Steps run strictly in `order`; the first failure stops the run
//! - Execution history is recorded as an append-only event log and replayed
//!   into execution records
//!
//! # Modules
//!
//! - `domain`: Data structures (pipelines, steps, context, records, events)
//! - `core`: Orchestration logic (engine, registry, resolver, stores, safety)
//! - `executors`: The built-in step types
//! - `adapters`: External collaborators (LLM providers, credentials, cost)
//! - `config`: Layered configuration
//! - `cli`: Command-line interface
//!
//! # Usage
//!
//! ```bash
//! # Store a pipeline
//! pipewright import research.yaml
//!
//! # Run it
//! pipewright run research --user alice -p topic=rust
//!
//! # Inspect the execution
//! pipewright status <execution-id>
//! ```

pub mod adapters;
pub mod cli;
pub mod config;
pub mod core;
pub mod domain;
pub mod executors;

// Re-export main types at crate root for convenience
pub use core::{
    CancellationToken, EngineError, ExecutionRequest, ExecutorRegistry, FileStore, MemoryStore,
    PipelineExecutor, PipelineStore,
};
pub use domain::{
    ExecutionStatus, PipelineDefinition, PipelineDocument, PipelineExecutionRecord, Step,
    StepResult, StepType,
};
pub use executors::StepExecutor;
