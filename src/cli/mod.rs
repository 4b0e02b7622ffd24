//! Command-line interface for pipewright.
//!
//! Provides commands for running pipelines, validating and exchanging
//! pipeline documents, and inspecting execution history.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use serde_json::{Map, Value};
use tracing::warn;
use uuid::Uuid;

use crate::adapters::{CredentialChain, InMemoryCostTracker, UserCredentialStore};
use crate::config::{self, ResolvedConfig};
use crate::core::{
    CancellationToken, ExecutionRequest, ExecutorRegistry, FileStore, PipelineExecutor,
    PipelineStore,
};
use crate::domain::{ExecutionStatus, PipelineDefinition, PipelineDocument};
use crate::executors::ExecutorDeps;

/// pipewright - multi-step pipeline execution engine
#[derive(Parser, Debug)]
#[command(name = "pipewright")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a stored pipeline
    Run {
        /// Pipeline id
        pipeline_id: String,

        /// User the run is executed as
        #[arg(short, long, env = "PIPEWRIGHT_USER")]
        user: String,

        /// JSON object file with the execution input
        #[arg(short, long)]
        input_file: Option<PathBuf>,

        /// Input parameter as key=value (value parsed as JSON when possible)
        #[arg(short, long = "param", value_name = "KEY=VALUE")]
        params: Vec<String>,

        /// Estimate instead of calling providers; skip writes
        #[arg(long)]
        dry_run: bool,
    },

    /// Validate a pipeline document without storing it
    Validate {
        /// YAML or JSON document
        file: PathBuf,
    },

    /// Store a pipeline from a document
    Import {
        /// YAML or JSON document
        file: PathBuf,
    },

    /// Write a stored pipeline as a document
    Export {
        /// Pipeline id
        pipeline_id: String,

        /// Output file (stdout if not provided)
        #[arg(short, long)]
        output: Option<PathBuf>,

        #[arg(short, long, value_enum, default_value = "yaml")]
        format: DocumentFormat,
    },

    /// List stored pipelines
    Pipelines,

    /// Show an execution and its steps
    Status {
        /// Execution ID (UUID)
        execution_id: String,
    },

    /// List recent executions
    Runs {
        /// Maximum number of executions to show
        #[arg(short, long, default_value = "10")]
        limit: usize,
    },

    /// Show resolved configuration
    Config,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum DocumentFormat {
    Yaml,
    Json,
}

impl Cli {
    /// Execute the CLI command
    pub async fn execute(self) -> Result<()> {
        match self.command {
            Commands::Run {
                pipeline_id,
                user,
                input_file,
                params,
                dry_run,
            } => run_pipeline(&pipeline_id, &user, input_file, &params, dry_run).await,
            Commands::Validate { file } => validate_document(&file).await,
            Commands::Import { file } => import_document(&file).await,
            Commands::Export {
                pipeline_id,
                output,
                format,
            } => export_document(&pipeline_id, output, format).await,
            Commands::Pipelines => list_pipelines().await,
            Commands::Status { execution_id } => show_status(&execution_id).await,
            Commands::Runs { limit } => list_runs(limit).await,
            Commands::Config => show_config(),
        }
    }
}

/// Wire the engine from configuration
fn build_engine(cfg: &ResolvedConfig) -> PipelineExecutor {
    let store = Arc::new(FileStore::with_dirs(cfg.pipelines_dir(), cfg.executions_dir()));
    let pricing = cfg.pricing_table();

    let deps = ExecutorDeps {
        gateway: Arc::new(cfg.provider_gateway()),
        credentials: Arc::new(CredentialChain::standard(Arc::new(UserCredentialStore::new()))),
        cost_tracker: Arc::new(InMemoryCostTracker::new(pricing.clone())),
        pricing,
        workspace_root: cfg.workspace.clone(),
        limits: cfg.safety.clone(),
        http: reqwest::Client::new(),
    };

    PipelineExecutor::new(store, ExecutorRegistry::with_defaults(&deps))
        .with_limits(cfg.safety.clone())
}

/// Run a pipeline with the given input
async fn run_pipeline(
    pipeline_id: &str,
    user_id: &str,
    input_file: Option<PathBuf>,
    params: &[String],
    dry_run: bool,
) -> Result<()> {
    let mut input = match input_file {
        Some(path) => read_input_file(&path)?,
        None => Map::new(),
    };
    for param in params {
        let (key, value) = parse_param(param)?;
        input.insert(key, value);
    }

    let engine = build_engine(config::config()?);

    let token = CancellationToken::new();
    let ctrl_c = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, cancelling after the current step");
            ctrl_c.cancel();
        }
    });

    let request = ExecutionRequest::new(pipeline_id, user_id, input)
        .dry_run(dry_run)
        .with_cancellation(token);
    let record = engine.execute(request).await?;

    match record.status {
        ExecutionStatus::Completed => {
            if let Some(results) = &record.results {
                println!("{}", render_value(&results.final_output));
                eprintln!(
                    "\n[Execution {} completed: {} steps, {} tokens, ${:.4}]",
                    record.id, results.steps_completed, results.total_tokens, results.total_cost
                );
            }
        }
        ExecutionStatus::Cancelled => {
            eprintln!("\n[Execution {} cancelled]", record.id);
            std::process::exit(130);
        }
        _ => {
            eprintln!(
                "\n[Execution {} failed: {}]",
                record.id,
                record.error.as_deref().unwrap_or("unknown error")
            );
            std::process::exit(1);
        }
    }

    Ok(())
}

fn read_input_file(path: &Path) -> Result<Map<String, Value>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read input file: {}", path.display()))?;
    let value: Value = serde_json::from_str(&content)
        .with_context(|| format!("Input file is not valid JSON: {}", path.display()))?;

    match value {
        Value::Object(map) => Ok(map),
        _ => anyhow::bail!("Input file must contain a JSON object: {}", path.display()),
    }
}

/// Parse `key=value`; the value is JSON when it parses, a string otherwise
fn parse_param(param: &str) -> Result<(String, Value)> {
    let (key, raw) = param
        .split_once('=')
        .with_context(|| format!("Invalid parameter '{}', expected KEY=VALUE", param))?;
    let key = key.trim();
    if key.is_empty() {
        anyhow::bail!("Invalid parameter '{}', key is empty", param);
    }

    let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
    Ok((key.to_string(), value))
}

fn render_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => serde_json::to_string_pretty(other).unwrap_or_default(),
    }
}

fn read_document(path: &Path) -> Result<PipelineDefinition> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read pipeline document: {}", path.display()))?;
    PipelineDocument::parse(&content)
        .and_then(PipelineDocument::into_definition)
        .with_context(|| format!("Invalid pipeline document: {}", path.display()))
}

/// Validate a document against the registered executors
async fn validate_document(path: &Path) -> Result<()> {
    let pipeline = read_document(path)?;
    let engine = build_engine(config::config()?);
    let steps = engine.validate_definition(&pipeline)?;

    println!("Pipeline '{}' is valid", pipeline.id);
    for (index, step) in steps.iter().enumerate() {
        println!("  {}. {} [{}] ({})", index + 1, step.name, step.step_type, step.id);
    }

    Ok(())
}

/// Validate and store a document
async fn import_document(path: &Path) -> Result<()> {
    let pipeline = read_document(path)?;
    let engine = build_engine(config::config()?);
    engine.validate_definition(&pipeline)?;

    engine.store().save_pipeline(&pipeline).await?;

    let checksum = PipelineDocument::from_definition(&pipeline).checksum()?;
    println!("Imported pipeline '{}' ({} steps)", pipeline.id, pipeline.steps.len());
    println!("Checksum: {}", checksum);
    Ok(())
}

async fn export_document(pipeline_id: &str, output: Option<PathBuf>, format: DocumentFormat) -> Result<()> {
    let store = FileStore::open_default()?;
    let pipeline = store
        .load_pipeline(pipeline_id)
        .await?
        .with_context(|| format!("Pipeline not found: {}", pipeline_id))?;

    let document = PipelineDocument::from_definition(&pipeline);
    let content = match format {
        DocumentFormat::Yaml => document.to_yaml()?,
        DocumentFormat::Json => document.to_json()?,
    };

    match output {
        Some(path) => {
            std::fs::write(&path, &content)
                .with_context(|| format!("Failed to write document: {}", path.display()))?;
            eprintln!("Exported '{}' to {} (checksum {})", pipeline_id, path.display(), document.checksum()?);
        }
        None => print!("{}", content),
    }

    Ok(())
}

async fn list_pipelines() -> Result<()> {
    let store = FileStore::open_default()?;
    let ids = store.list_pipelines().await?;

    if ids.is_empty() {
        println!("No pipelines found. Use 'pipewright import <file>' to add one.");
        return Ok(());
    }

    println!("{:<30} {:<30} {:<10} {:<6}", "ID", "NAME", "VISIBILITY", "STEPS");
    println!("{}", "-".repeat(80));
    for id in ids {
        if let Some(pipeline) = store.load_pipeline(&id).await? {
            println!(
                "{:<30} {:<30} {:<10} {:<6}",
                pipeline.id,
                pipeline.name,
                format!("{:?}", pipeline.visibility).to_lowercase(),
                pipeline.steps.len()
            );
        }
    }

    Ok(())
}

/// Show the status of an execution
async fn show_status(execution_id: &str) -> Result<()> {
    let execution_id = Uuid::parse_str(execution_id)
        .with_context(|| format!("Invalid execution ID: {}", execution_id))?;

    let store = FileStore::open_default()?;
    let history = store
        .get_execution(execution_id)
        .await?
        .with_context(|| format!("Execution not found: {}", execution_id))?;
    let execution = &history.execution;

    println!("Execution ID: {}", execution.id);
    println!("Pipeline: {}", execution.pipeline_id);
    println!("User: {}", execution.user_id);
    println!("Status: {:?}", execution.status);
    println!("Dry run: {}", execution.dry_run);
    println!("Started: {}", execution.started_at);
    if let Some(completed) = execution.completed_at {
        println!("Completed: {}", completed);
    }
    if let Some(ref error) = execution.error {
        println!("Error: {}", error);
    }
    if let Some(ref results) = execution.results {
        println!(
            "Totals: {} steps, {} tokens, ${:.4}",
            results.steps_completed, results.total_tokens, results.total_cost
        );
    }

    println!("\nSteps:");
    for step in &history.steps {
        println!(
            "  {:<24} {:<10?} {:>6}ms  attempts={}",
            step.step_name, step.status, step.metrics.execution_time_ms, step.metrics.attempts
        );
        if let Some(ref error) = step.error {
            println!("    error: {}", error);
        }
    }

    Ok(())
}

/// List recent executions
async fn list_runs(limit: usize) -> Result<()> {
    let store = FileStore::open_default()?;
    let executions = store.list_executions(limit).await?;

    if executions.is_empty() {
        println!("No executions found");
        return Ok(());
    }

    println!("{:<38} {:<24} {:<11} {:<20}", "EXECUTION ID", "PIPELINE", "STATUS", "STARTED");
    println!("{}", "-".repeat(95));

    for execution in executions {
        println!(
            "{:<38} {:<24} {:<11} {:<20}",
            execution.id,
            execution.pipeline_id,
            format!("{:?}", execution.status).to_lowercase(),
            execution.started_at.format("%Y-%m-%d %H:%M:%S")
        );
    }

    Ok(())
}

fn show_config() -> Result<()> {
    let cfg = config::reload_config()?;

    println!(
        "Config file: {}",
        cfg.config_file
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "(none - using defaults)".to_string())
    );
    println!();
    println!("Paths:");
    println!("  home:       {}", cfg.home.display());
    println!("  pipelines:  {}", cfg.pipelines_dir().display());
    println!("  executions: {}", cfg.executions_dir().display());
    println!("  workspace:  {}", cfg.workspace.display());
    println!();
    println!("Safety:");
    println!("  max_steps:            {}", cfg.safety.max_steps);
    println!("  max_input_bytes:      {}", cfg.safety.max_input_bytes);
    println!("  max_output_bytes:     {}", cfg.safety.max_output_bytes);
    println!("  step_timeout_seconds: {}", cfg.safety.step_timeout_seconds);
    println!("  run_timeout_seconds:  {}", cfg.safety.run_timeout_seconds);

    if !cfg.providers.is_empty() {
        println!();
        println!("Providers:");
        for (name, provider) in &cfg.providers {
            println!(
                "  {}: {}",
                name,
                provider.base_url.as_deref().unwrap_or("(default endpoint)")
            );
        }
    }

    if !cfg.pricing.is_empty() {
        println!();
        println!("Pricing overrides (USD per 1k tokens):");
        for (model, price) in &cfg.pricing {
            println!("  {}: in {} / out {}", model, price.input_per_1k, price.output_per_1k);
        }
    }

    Ok(())
}
