//! Core orchestration logic.
//!
//! This module contains:
//! - Orchestrator: the `PipelineExecutor` engine
//! - Registry: step type -> executor table
//! - Resolver and interpolation: how steps see the execution context
//! - Store: persistence trait with in-memory and file-backed implementations
//! - Safety: limits and enforcement
//! - Error: the engine and step error taxonomy

pub mod error;
pub mod file_store;
pub mod interpolate;
pub mod orchestrator;
pub mod registry;
pub mod resolver;
pub mod safety;
pub mod store;

// Re-export commonly used types
pub use error::{EngineError, EngineResult, StepError};
pub use file_store::FileStore;
pub use interpolate::{interpolate, interpolate_value};
pub use orchestrator::{CancellationToken, ExecutionRequest, PipelineExecutor};
pub use registry::ExecutorRegistry;
pub use resolver::{get_path, resolve_inputs};
pub use safety::{SafetyLimits, SafetyTracker, SafetyViolation};
pub use store::{MemoryStore, PipelineStore};
