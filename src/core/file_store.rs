//! File-based store.
//!
//! Layout under the home directory:
//!
//! ```text
//! pipelines/<pipeline_id>.yaml        exchange document
//! executions/<execution_id>/events.jsonl
//! ```
//!
//! Execution history is an append-only JSONL event log; records are rebuilt
//! by replaying it.

use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::debug;
use uuid::Uuid;

use super::store::PipelineStore;
use crate::domain::{
    Event, ExecutionHistory, ExecutionResults, ExecutionStatus, PipelineDefinition,
    PipelineDocument, PipelineExecutionRecord, Step, StepExecutionRecord, StepMetrics,
};

const EVENTS_FILE: &str = "events.jsonl";

/// Store backed by YAML documents and JSONL event logs
pub struct FileStore {
    pipelines_dir: PathBuf,
    executions_dir: PathBuf,
}

impl FileStore {
    /// Store rooted at `home`
    pub fn new(home: impl AsRef<Path>) -> Self {
        let home = home.as_ref();
        Self::with_dirs(home.join("pipelines"), home.join("executions"))
    }

    pub fn with_dirs(pipelines_dir: impl Into<PathBuf>, executions_dir: impl Into<PathBuf>) -> Self {
        Self {
            pipelines_dir: pipelines_dir.into(),
            executions_dir: executions_dir.into(),
        }
    }

    /// Store at the configured directories
    pub fn open_default() -> Result<Self> {
        Ok(Self::with_dirs(
            crate::config::pipelines_dir()?,
            crate::config::executions_dir()?,
        ))
    }

    pub fn pipelines_dir(&self) -> &Path {
        &self.pipelines_dir
    }

    pub fn executions_dir(&self) -> &Path {
        &self.executions_dir
    }

    /// Path of a pipeline document; ids that would leave the directory are rejected
    fn pipeline_path(&self, pipeline_id: &str) -> Result<PathBuf> {
        if pipeline_id.is_empty()
            || pipeline_id.contains(['/', '\\'])
            || pipeline_id.starts_with('.')
        {
            anyhow::bail!("Invalid pipeline id for file storage: '{}'", pipeline_id);
        }
        Ok(self.pipelines_dir.join(format!("{}.yaml", pipeline_id)))
    }

    /// Path to the event log of an execution
    pub fn events_path(&self, execution_id: Uuid) -> PathBuf {
        self.executions_dir
            .join(execution_id.to_string())
            .join(EVENTS_FILE)
    }

    /// Append an event to its execution's log
    pub async fn append(&self, event: &Event) -> Result<()> {
        let path = self.events_path(event.execution_id);
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)
                .await
                .with_context(|| format!("Failed to create execution directory: {}", dir.display()))?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .with_context(|| format!("Failed to open events file: {}", path.display()))?;

        let mut line = serde_json::to_string(event).context("Failed to serialize event")?;
        line.push('\n');
        file.write_all(line.as_bytes())
            .await
            .context("Failed to write event")?;
        file.flush().await.context("Failed to flush event")?;

        debug!(execution_id = %event.execution_id, event = ?event.event_type(), "Event appended");
        Ok(())
    }

    /// Replay all events of an execution in order
    pub async fn replay(&self, execution_id: Uuid) -> Result<Vec<Event>> {
        let path = self.events_path(execution_id);
        if !fs::try_exists(&path).await.unwrap_or(false) {
            return Ok(Vec::new());
        }

        let file = File::open(&path)
            .await
            .with_context(|| format!("Failed to open events file: {}", path.display()))?;

        let mut lines = BufReader::new(file).lines();
        let mut events = Vec::new();

        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            let event: Event = serde_json::from_str(&line)
                .with_context(|| format!("Failed to parse event: {}", line))?;
            events.push(event);
        }

        Ok(events)
    }

    /// Execution ids with a log directory
    pub async fn list_execution_ids(&self) -> Result<Vec<Uuid>> {
        let mut ids = Vec::new();
        if !fs::try_exists(&self.executions_dir).await.unwrap_or(false) {
            return Ok(ids);
        }

        let mut entries = fs::read_dir(&self.executions_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                if let Some(id) = entry.file_name().to_str().and_then(|n| Uuid::parse_str(n).ok()) {
                    ids.push(id);
                }
            }
        }

        Ok(ids)
    }

    /// Ids of stored pipelines, sorted
    pub async fn list_pipelines(&self) -> Result<Vec<String>> {
        let mut ids = Vec::new();
        if !fs::try_exists(&self.pipelines_dir).await.unwrap_or(false) {
            return Ok(ids);
        }

        let mut entries = fs::read_dir(&self.pipelines_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            if let Some(name) = entry.file_name().to_str() {
                if let Some(id) = name.strip_suffix(".yaml") {
                    ids.push(id.to_string());
                }
            }
        }

        ids.sort();
        Ok(ids)
    }
}

#[async_trait]
impl PipelineStore for FileStore {
    async fn load_pipeline(&self, pipeline_id: &str) -> Result<Option<PipelineDefinition>> {
        let path = self.pipeline_path(pipeline_id)?;
        if !fs::try_exists(&path).await.unwrap_or(false) {
            return Ok(None);
        }

        let content = fs::read_to_string(&path)
            .await
            .with_context(|| format!("Failed to read pipeline: {}", path.display()))?;
        let pipeline = PipelineDocument::from_yaml(&content)
            .and_then(PipelineDocument::into_definition)
            .with_context(|| format!("Invalid pipeline document: {}", path.display()))?;

        Ok(Some(pipeline))
    }

    async fn load_enabled_steps(&self, pipeline_id: &str) -> Result<Vec<Step>> {
        Ok(self
            .load_pipeline(pipeline_id)
            .await?
            .map(|p| p.steps.into_iter().filter(|s| s.enabled).collect())
            .unwrap_or_default())
    }

    async fn save_pipeline(&self, pipeline: &PipelineDefinition) -> Result<()> {
        let path = self.pipeline_path(&pipeline.id)?;
        let yaml = PipelineDocument::from_definition(pipeline).to_yaml()?;

        let dir = self.pipelines_dir.clone();
        tokio::task::spawn_blocking(move || -> Result<()> {
            std::fs::create_dir_all(&dir)
                .with_context(|| format!("Failed to create pipelines directory: {}", dir.display()))?;
            let mut temp = tempfile::NamedTempFile::new_in(&dir)?;
            temp.write_all(yaml.as_bytes())?;
            temp.persist(&path)
                .with_context(|| format!("Failed to write pipeline: {}", path.display()))?;
            Ok(())
        })
        .await??;

        debug!(pipeline_id = %pipeline.id, "Pipeline saved");
        Ok(())
    }

    async fn create_execution(&self, execution: &PipelineExecutionRecord) -> Result<()> {
        if fs::try_exists(self.events_path(execution.id)).await.unwrap_or(false) {
            anyhow::bail!("Execution {} already exists", execution.id);
        }
        self.append(&Event::execution_created(execution)).await
    }

    async fn complete_execution(
        &self,
        execution_id: Uuid,
        status: ExecutionStatus,
        results: Option<&ExecutionResults>,
        error: Option<&str>,
    ) -> Result<()> {
        self.append(&Event::execution_completed(
            execution_id,
            status,
            results.cloned(),
            error.map(str::to_string),
        ))
        .await
    }

    async fn create_step_execution(&self, step: &StepExecutionRecord) -> Result<()> {
        self.append(&Event::step_started(step)).await
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
        self.append(&Event::step_completed(
            execution_id,
            step_execution_id,
            status,
            outputs.cloned(),
            error.map(str::to_string),
            metrics.clone(),
        ))
        .await
    }

    async fn get_execution(&self, execution_id: Uuid) -> Result<Option<ExecutionHistory>> {
        let events = self.replay(execution_id).await?;
        Ok(ExecutionHistory::from_events(&events))
    }

    async fn list_executions(&self, limit: usize) -> Result<Vec<PipelineExecutionRecord>> {
        let mut records = Vec::new();
        for id in self.list_execution_ids().await? {
            if let Some(history) = self.get_execution(id).await? {
                records.push(history.execution);
            }
        }

        records.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        records.truncate(limit);
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Map;
    use tempfile::TempDir;

    #[test]
    fn test_pipeline_path_rejects_traversal() {
        let store = FileStore::new("/tmp/pipewright");
        assert!(store.pipeline_path("../etc/passwd").is_err());
        assert!(store.pipeline_path(".hidden").is_err());
        assert!(store.pipeline_path("").is_err());
        assert!(store
            .pipeline_path("daily-report")
            .unwrap()
            .ends_with("pipelines/daily-report.yaml"));
    }

    #[tokio::test]
    async fn test_event_replay_order() {
        let temp = TempDir::new().unwrap();
        let store = FileStore::new(temp.path());
        let execution = PipelineExecutionRecord::start(Uuid::new_v4(), "p", "u", Map::new(), false);

        store.create_execution(&execution).await.unwrap();
        for i in 0..5 {
            let step = StepExecutionRecord::start(execution.id, format!("step{}", i), "S", Map::new());
            store.create_step_execution(&step).await.unwrap();
        }

        let events = store.replay(execution.id).await.unwrap();
        assert_eq!(events.len(), 6);

        let history = store.get_execution(execution.id).await.unwrap().unwrap();
        let ids: Vec<&str> = history.steps.iter().map(|s| s.step_id.as_str()).collect();
        assert_eq!(ids, vec!["step0", "step1", "step2", "step3", "step4"]);
    }

    #[tokio::test]
    async fn test_missing_execution_is_none() {
        let temp = TempDir::new().unwrap();
        let store = FileStore::new(temp.path());
        assert!(store.get_execution(Uuid::new_v4()).await.unwrap().is_none());
        assert!(store.list_executions(10).await.unwrap().is_empty());
    }
}
