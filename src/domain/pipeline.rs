//! Pipeline definitions.
//!
//! A pipeline is an owned, ordered list of typed steps. Each step carries
//! its own config, a declarative input mapping that pulls values out of the
//! execution context, and an optional output mapping that decides which keys
//! the step contributes back.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A complete pipeline definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineDefinition {
    /// Stable identifier (used by the CLI and persistence)
    pub id: String,

    /// Human-readable name
    pub name: String,

    /// Free-form description
    #[serde(default)]
    pub description: String,

    /// Tags for grouping pipelines
    #[serde(default)]
    pub tags: Vec<String>,

    /// User that owns the pipeline
    pub owner_id: String,

    /// Who may execute the pipeline
    #[serde(default)]
    pub visibility: Visibility,

    /// Steps, in any order; execution order is decided by `Step::order`
    #[serde(default)]
    pub steps: Vec<Step>,
}

impl PipelineDefinition {
    /// Parse a pipeline from YAML content
    pub fn from_yaml(content: &str) -> Result<Self> {
        serde_yaml::from_str(content).context("Failed to parse pipeline YAML")
    }

    /// Structural validation (ids, names, uniqueness)
    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            anyhow::bail!("Pipeline id cannot be empty");
        }

        if self.name.trim().is_empty() {
            anyhow::bail!("Pipeline name cannot be empty");
        }

        let mut seen = HashSet::new();
        for (i, step) in self.steps.iter().enumerate() {
            if step.id.trim().is_empty() {
                anyhow::bail!("Step {} has an empty id", i);
            }
            if step.name.trim().is_empty() {
                anyhow::bail!("Step '{}' has an empty name", step.id);
            }
            if !seen.insert(step.id.as_str()) {
                anyhow::bail!("Duplicate step id '{}'", step.id);
            }
        }

        Ok(())
    }

    /// Whether `user_id` may execute this pipeline
    pub fn is_accessible_by(&self, user_id: &str) -> bool {
        self.visibility == Visibility::Public || self.owner_id == user_id
    }

    /// Enabled steps in execution order
    pub fn enabled_steps(&self) -> Vec<Step> {
        let mut steps: Vec<Step> = self.steps.iter().filter(|s| s.enabled).cloned().collect();
        steps.sort_by_key(|s| s.order);
        steps
    }
}

/// Pipeline visibility
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Visibility {
    /// Anyone may execute
    Public,

    /// Only the owner may execute
    #[default]
    Private,
}

/// A single step in a pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    /// Step id (unique within pipeline)
    pub id: String,

    /// Display name, used in error messages
    pub name: String,

    /// Step type tag, selects the executor
    #[serde(rename = "type")]
    pub step_type: StepType,

    /// Position in the execution sequence (ascending)
    #[serde(default)]
    pub order: i64,

    /// Static parameters, also the defaults for resolved inputs
    #[serde(default)]
    pub config: Map<String, Value>,

    /// Target input key -> where to read the value from
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub input_mapping: BTreeMap<String, SourceSpec>,

    /// Context key -> path into the executor output.
    /// When absent the whole output object is merged into the context.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_mapping: Option<BTreeMap<String, String>>,

    /// Disabled steps are skipped entirely
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Override timeout for this step, in seconds (engine default when not set)
    #[serde(
        default,
        rename = "timeout",
        alias = "timeout_seconds",
        skip_serializing_if = "Option::is_none"
    )]
    pub timeout_seconds: Option<u64>,

    /// Retry policy for this step
    #[serde(default, rename = "retry_config", alias = "retry_policy")]
    pub retry_policy: RetryPolicy,
}

fn default_enabled() -> bool {
    true
}

impl Step {
    /// Create an enabled step with empty config and mappings
    pub fn new(id: impl Into<String>, step_type: StepType, order: i64) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            step_type,
            order,
            config: Map::new(),
            input_mapping: BTreeMap::new(),
            output_mapping: None,
            enabled: true,
            timeout_seconds: None,
            retry_policy: RetryPolicy::default(),
        }
    }

    /// Set the display name
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Set a config value
    pub fn with_config(mut self, key: impl Into<String>, value: Value) -> Self {
        self.config.insert(key.into(), value);
        self
    }

    /// Add an input mapping
    pub fn with_input(mut self, target: impl Into<String>, source: SourceSpec) -> Self {
        self.input_mapping.insert(target.into(), source);
        self
    }

    /// Add an output mapping entry
    pub fn with_output(mut self, context_key: impl Into<String>, output_path: impl Into<String>) -> Self {
        self.output_mapping
            .get_or_insert_with(BTreeMap::new)
            .insert(context_key.into(), output_path.into());
        self
    }

    /// Set the step timeout
    pub fn with_timeout(mut self, seconds: u64) -> Self {
        self.timeout_seconds = Some(seconds);
        self
    }

    /// Set the retry policy
    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    /// Disable the step
    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// Get the effective timeout for this step
    pub fn timeout(&self, default_seconds: u64) -> Duration {
        Duration::from_secs(self.timeout_seconds.unwrap_or(default_seconds))
    }

    /// Whether the step provides `key`, either statically or via a mapping
    pub fn provides_input(&self, key: &str) -> bool {
        self.config.contains_key(key) || self.input_mapping.contains_key(key)
    }
}

/// Step type tag.
///
/// Serialized as a plain string. Unknown tags are kept as `Custom` so that
/// executors registered at runtime can be addressed from YAML.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum StepType {
    /// Model invocation
    Prompt,
    /// Pure data transform
    Transform,
    /// Interpreter subprocess
    Code,
    /// Workspace file operation
    File,
    /// Outbound HTTP request
    Api,
    /// Boolean check / guard
    Condition,
    /// Any other registered type
    Custom(String),
}

impl StepType {
    /// Tag used for registry lookup
    pub fn as_str(&self) -> &str {
        match self {
            Self::Prompt => "prompt",
            Self::Transform => "transform",
            Self::Code => "code",
            Self::File => "file",
            Self::Api => "api",
            Self::Condition => "condition",
            Self::Custom(tag) => tag,
        }
    }
}

impl From<String> for StepType {
    fn from(tag: String) -> Self {
        match tag.as_str() {
            "prompt" => Self::Prompt,
            "transform" => Self::Transform,
            "code" => Self::Code,
            "file" => Self::File,
            "api" => Self::Api,
            "condition" => Self::Condition,
            _ => Self::Custom(tag),
        }
    }
}

impl From<&str> for StepType {
    fn from(tag: &str) -> Self {
        Self::from(tag.to_string())
    }
}

impl From<StepType> for String {
    fn from(step_type: StepType) -> Self {
        step_type.as_str().to_string()
    }
}

impl fmt::Display for StepType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where an input value is read from
///
/// Supports two YAML formats:
/// - Plain path: `summary: analysis.text` (reads from the context output)
/// - Explicit source: `topic: { source: input, path: topic }`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SourceSpec {
    /// Dotted path into the accumulated context output
    Path(String),

    /// Dotted path into an explicit source
    Sourced { source: ContextSource, path: String },
}

impl SourceSpec {
    /// Source this specifier reads from
    pub fn source(&self) -> ContextSource {
        match self {
            Self::Path(_) => ContextSource::Output,
            Self::Sourced { source, .. } => *source,
        }
    }

    /// Dotted path within the source
    pub fn path(&self) -> &str {
        match self {
            Self::Path(path) => path,
            Self::Sourced { path, .. } => path,
        }
    }

    /// Shorthand for an explicit source
    pub fn from_source(source: ContextSource, path: impl Into<String>) -> Self {
        Self::Sourced {
            source,
            path: path.into(),
        }
    }
}

impl From<&str> for SourceSpec {
    fn from(path: &str) -> Self {
        Self::Path(path.to_string())
    }
}

/// Source namespaces available to input mappings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextSource {
    /// Caller-supplied execution input
    Input,

    /// Output accumulated from prior steps
    #[default]
    Output,

    /// The step's own config
    Config,
}

/// Retry policy for failed steps
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including first try)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Initial delay between retries in milliseconds
    #[serde(default = "default_initial_delay")]
    pub initial_delay_ms: u64,

    /// Maximum delay between retries in milliseconds
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,

    /// Backoff multiplier (delay *= multiplier after each retry)
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
}

fn default_max_attempts() -> u32 {
    1
}
fn default_initial_delay() -> u64 {
    1000
}
fn default_max_delay() -> u64 {
    30000
}
fn default_backoff_multiplier() -> f64 {
    2.0
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay(),
            max_delay_ms: default_max_delay(),
            backoff_multiplier: default_backoff_multiplier(),
        }
    }
}

impl RetryPolicy {
    /// Policy with `max_attempts` and the given initial delay
    pub fn attempts(max_attempts: u32, initial_delay_ms: u64) -> Self {
        Self {
            max_attempts,
            initial_delay_ms,
            ..Default::default()
        }
    }

    /// Calculate delay for a specific attempt (1-indexed)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::from_millis(self.initial_delay_ms.min(self.max_delay_ms));
        }

        let delay = self.initial_delay_ms as f64
            * self.backoff_multiplier.powi((attempt - 1) as i32);

        let capped = delay.min(self.max_delay_ms as f64) as u64;
        Duration::from_millis(capped)
    }

    /// Check if we should retry based on attempt count
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}
