//! Shared fixtures for integration tests.

#![allow(dead_code)]

use std::path::Path;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Map, Value};

use pipewright::adapters::{
    CredentialChain, Credentials, Generation, GenerationParams, InMemoryCostTracker, Message,
    PricingTable, ProviderError, ProviderGateway, TokenUsage, UserCredentialStore,
};
use pipewright::core::{ExecutorRegistry, MemoryStore, PipelineExecutor, SafetyLimits};
use pipewright::domain::{
    ExecutionContext, PipelineDefinition, Step, StepErrorKind, StepResult, StepType, Visibility,
};
use pipewright::executors::{ExecutorDeps, StepExecutor};

/// Gateway that answers every call with a canned response and counts calls
pub struct MockGateway {
    calls: AtomicUsize,
    response: String,
}

impl MockGateway {
    pub fn new(response: impl Into<String>) -> Self {
        Self {
            calls: AtomicUsize::new(0),
            response: response.into(),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProviderGateway for MockGateway {
    async fn generate(
        &self,
        _provider: &str,
        _credentials: &Credentials,
        messages: &[Message],
        _params: &GenerationParams,
    ) -> Result<Generation, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let prompt = messages.last().map(|m| m.content.clone()).unwrap_or_default();
        Ok(Generation {
            content: format!("{} ({})", self.response, prompt),
            usage: TokenUsage {
                prompt_tokens: 10,
                completion_tokens: 5,
            },
        })
    }
}

/// Returns its resolved inputs as output, or `inputs.output` when present
pub struct EchoExecutor;

#[async_trait]
impl StepExecutor for EchoExecutor {
    fn step_type(&self) -> &str {
        "echo"
    }

    async fn execute(
        &self,
        _step: &Step,
        inputs: &Map<String, Value>,
        _context: &ExecutionContext,
        _dry_run: bool,
    ) -> StepResult {
        let output = inputs
            .get("output")
            .cloned()
            .unwrap_or_else(|| Value::Object(inputs.clone()));
        StepResult::success(output)
    }
}

/// Always fails with an execution error
pub struct FailingExecutor;

#[async_trait]
impl StepExecutor for FailingExecutor {
    fn step_type(&self) -> &str {
        "fail"
    }

    async fn execute(
        &self,
        _step: &Step,
        _inputs: &Map<String, Value>,
        _context: &ExecutionContext,
        _dry_run: bool,
    ) -> StepResult {
        StepResult::failure(StepErrorKind::Execution, "boom")
    }
}

/// Panics on every call
pub struct PanickingExecutor;

#[async_trait]
impl StepExecutor for PanickingExecutor {
    fn step_type(&self) -> &str {
        "panic"
    }

    async fn execute(
        &self,
        _step: &Step,
        _inputs: &Map<String, Value>,
        _context: &ExecutionContext,
        _dry_run: bool,
    ) -> StepResult {
        panic!("executor exploded");
    }
}

/// Sleeps before succeeding
pub struct SlowExecutor(pub Duration);

#[async_trait]
impl StepExecutor for SlowExecutor {
    fn step_type(&self) -> &str {
        "slow"
    }

    async fn execute(
        &self,
        _step: &Step,
        _inputs: &Map<String, Value>,
        _context: &ExecutionContext,
        _dry_run: bool,
    ) -> StepResult {
        tokio::time::sleep(self.0).await;
        StepResult::success(json!({"result": "late"}))
    }
}

/// Fails with the given kind until `failures` calls have been made
pub struct FlakyExecutor {
    failures: u32,
    kind: StepErrorKind,
    calls: AtomicU32,
}

impl FlakyExecutor {
    pub fn new(failures: u32, kind: StepErrorKind) -> Self {
        Self {
            failures,
            kind,
            calls: AtomicU32::new(0),
        }
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StepExecutor for FlakyExecutor {
    fn step_type(&self) -> &str {
        "flaky"
    }

    async fn execute(
        &self,
        _step: &Step,
        _inputs: &Map<String, Value>,
        _context: &ExecutionContext,
        _dry_run: bool,
    ) -> StepResult {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call <= self.failures {
            StepResult::failure(self.kind.clone(), format!("attempt {} failed", call))
        } else {
            StepResult::success(json!({"result": call}))
        }
    }
}

/// Pipeline owned by `alice`
pub fn pipeline(id: &str, visibility: Visibility, steps: Vec<Step>) -> PipelineDefinition {
    PipelineDefinition {
        id: id.to_string(),
        name: format!("{} pipeline", id),
        description: String::new(),
        tags: Vec::new(),
        owner_id: "alice".to_string(),
        visibility,
        steps,
    }
}

/// Step of type `echo` returning `output`
pub fn echo(id: &str, order: i64, output: Value) -> Step {
    Step::new(id, StepType::from("echo"), order).with_config("output", output)
}

pub fn step_of(id: &str, step_type: &str, order: i64) -> Step {
    Step::new(id, StepType::from(step_type), order)
}

/// Executor deps using `gateway` and a credential store with an openai key for alice
pub async fn deps(gateway: Arc<dyn ProviderGateway>, workspace: &Path) -> ExecutorDeps {
    let users = Arc::new(UserCredentialStore::new());
    users
        .insert("alice", "openai", Credentials::new("sk-test"))
        .await;

    ExecutorDeps {
        gateway,
        credentials: Arc::new(CredentialChain::new().with(users)),
        cost_tracker: Arc::new(InMemoryCostTracker::default()),
        pricing: PricingTable::default(),
        workspace_root: workspace.to_path_buf(),
        limits: SafetyLimits::default(),
        http: reqwest::Client::new(),
    }
}

/// Built-in executors plus every test executor above
pub fn registry(deps: &ExecutorDeps) -> ExecutorRegistry {
    let mut registry = ExecutorRegistry::with_defaults(deps);
    registry.register("echo", Arc::new(EchoExecutor));
    registry.register("fail", Arc::new(FailingExecutor));
    registry.register("panic", Arc::new(PanickingExecutor));
    registry.register("slow", Arc::new(SlowExecutor(Duration::from_secs(5))));
    registry
}

/// Engine over a memory store seeded with `pipelines`
pub async fn engine(
    gateway: Arc<MockGateway>,
    pipelines: Vec<PipelineDefinition>,
) -> (PipelineExecutor, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::with_pipelines(pipelines));
    let deps = deps(gateway, &std::env::temp_dir()).await;
    let engine = PipelineExecutor::new(store.clone(), registry(&deps));
    (engine, store)
}

/// JSON object literal to map
pub fn object(value: Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap_or_default()
}
