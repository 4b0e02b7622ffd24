//! Persistence interface and in-memory implementation.
//!
//! The engine never touches storage directly; everything goes through
//! `PipelineStore`. `MemoryStore` backs tests and ephemeral runs, and
//! `FileStore` (see `file_store`) persists to disk.

use std::collections::HashMap;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::domain::{
    ExecutionHistory, ExecutionResults, ExecutionStatus, PipelineDefinition,
    PipelineExecutionRecord, Step, StepExecutionRecord, StepMetrics,
};

/// Storage for pipeline definitions and execution history
#[async_trait]
pub trait PipelineStore: Send + Sync {
    /// Load a pipeline definition, `None` when it does not exist
    async fn load_pipeline(&self, pipeline_id: &str) -> Result<Option<PipelineDefinition>>;

    /// Enabled steps of a pipeline, in storage order
    async fn load_enabled_steps(&self, pipeline_id: &str) -> Result<Vec<Step>>;

    /// Create or replace a pipeline definition
    async fn save_pipeline(&self, pipeline: &PipelineDefinition) -> Result<()>;

    /// Persist a new execution record
    async fn create_execution(&self, execution: &PipelineExecutionRecord) -> Result<()>;

    /// Move an execution to a terminal state
    async fn complete_execution(
        &self,
        execution_id: Uuid,
        status: ExecutionStatus,
        results: Option<&ExecutionResults>,
        error: Option<&str>,
    ) -> Result<()>;

    /// Persist a new step execution record
    async fn create_step_execution(&self, step: &StepExecutionRecord) -> Result<()>;

    /// Move a step execution to a terminal state
    #[allow(clippy::too_many_arguments)]
    async fn complete_step_execution(
        &self,
        execution_id: Uuid,
        step_execution_id: Uuid,
        status: ExecutionStatus,
        outputs: Option<&Value>,
        error: Option<&str>,
        metrics: &StepMetrics,
    ) -> Result<()>;

    /// Execution with its step records
    async fn get_execution(&self, execution_id: Uuid) -> Result<Option<ExecutionHistory>>;

    /// Most recent executions first
    async fn list_executions(&self, limit: usize) -> Result<Vec<PipelineExecutionRecord>>;

    /// Step records of an execution, in creation order
    async fn list_step_executions(&self, execution_id: Uuid) -> Result<Vec<StepExecutionRecord>> {
        Ok(self
            .get_execution(execution_id)
            .await?
            .map(|history| history.steps)
            .unwrap_or_default())
    }
}

/// In-memory store
#[derive(Default)]
pub struct MemoryStore {
    pipelines: RwLock<HashMap<String, PipelineDefinition>>,
    executions: RwLock<HashMap<Uuid, ExecutionHistory>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store seeded with pipelines
    pub fn with_pipelines(pipelines: impl IntoIterator<Item = PipelineDefinition>) -> Self {
        let pipelines = pipelines
            .into_iter()
            .map(|pipeline| (pipeline.id.clone(), pipeline))
            .collect();
        Self {
            pipelines: RwLock::new(pipelines),
            executions: RwLock::default(),
        }
    }

    /// Number of stored executions
    pub async fn execution_count(&self) -> usize {
        self.executions.read().await.len()
    }
}

#[async_trait]
impl PipelineStore for MemoryStore {
    async fn load_pipeline(&self, pipeline_id: &str) -> Result<Option<PipelineDefinition>> {
        Ok(self.pipelines.read().await.get(pipeline_id).cloned())
    }

    async fn load_enabled_steps(&self, pipeline_id: &str) -> Result<Vec<Step>> {
        Ok(self
            .pipelines
            .read()
            .await
            .get(pipeline_id)
            .map(|p| p.steps.iter().filter(|s| s.enabled).cloned().collect())
            .unwrap_or_default())
    }

    async fn save_pipeline(&self, pipeline: &PipelineDefinition) -> Result<()> {
        self.pipelines
            .write()
            .await
            .insert(pipeline.id.clone(), pipeline.clone());
        Ok(())
    }

    async fn create_execution(&self, execution: &PipelineExecutionRecord) -> Result<()> {
        let mut executions = self.executions.write().await;
        if executions.contains_key(&execution.id) {
            anyhow::bail!("Execution {} already exists", execution.id);
        }
        executions.insert(
            execution.id,
            ExecutionHistory {
                execution: execution.clone(),
                steps: Vec::new(),
            },
        );
        Ok(())
    }

    async fn complete_execution(
        &self,
        execution_id: Uuid,
        status: ExecutionStatus,
        results: Option<&ExecutionResults>,
        error: Option<&str>,
    ) -> Result<()> {
        let mut executions = self.executions.write().await;
        let history = executions
            .get_mut(&execution_id)
            .with_context(|| format!("Execution {} not found", execution_id))?;
        history.execution.finish(
            status,
            results.cloned(),
            error.map(str::to_string),
            chrono::Utc::now(),
        );
        Ok(())
    }

    async fn create_step_execution(&self, step: &StepExecutionRecord) -> Result<()> {
        let mut executions = self.executions.write().await;
        let history = executions
            .get_mut(&step.execution_id)
            .with_context(|| format!("Execution {} not found", step.execution_id))?;
        history.steps.push(step.clone());
        Ok(())
    }

    async fn complete_step_execution(
        &self,
        execution_id: Uuid,
        step_execution_id: Uuid,
        status: ExecutionStatus,
        outputs: Option<&Value>,
        error: Option<&str>,
        metrics: &StepMetrics,
    ) -> Result<()> {
        let mut executions = self.executions.write().await;
        let step = executions
            .get_mut(&execution_id)
            .and_then(|h| h.steps.iter_mut().find(|s| s.id == step_execution_id))
            .with_context(|| format!("Step execution {} not found", step_execution_id))?;
        step.finish(
            status,
            outputs.cloned(),
            error.map(str::to_string),
            metrics.clone(),
            chrono::Utc::now(),
        );
        Ok(())
    }

    async fn get_execution(&self, execution_id: Uuid) -> Result<Option<ExecutionHistory>> {
        Ok(self.executions.read().await.get(&execution_id).cloned())
    }

    async fn list_executions(&self, limit: usize) -> Result<Vec<PipelineExecutionRecord>> {
        let mut records: Vec<PipelineExecutionRecord> = self
            .executions
            .read()
            .await
            .values()
            .map(|h| h.execution.clone())
            .collect();
        records.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        records.truncate(limit);
        Ok(records)
    }
}
