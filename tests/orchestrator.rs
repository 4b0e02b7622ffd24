//! Pipeline Executor Integration Tests
//!
//! End-to-end runs through `PipelineExecutor` against an in-memory store.

mod common;

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tokio_test::{assert_err, assert_ok};

use uuid::Uuid;

use common::{deps, echo, engine, object, pipeline, registry, step_of, FlakyExecutor, MockGateway};
use pipewright::core::{
    CancellationToken, EngineError, ExecutionRequest, MemoryStore, PipelineExecutor,
    PipelineStore, SafetyLimits,
};
use pipewright::domain::{
    ExecutionContext, ExecutionHistory, ExecutionResults, ExecutionStatus, PipelineDefinition,
    PipelineExecutionRecord, RetryPolicy, SourceSpec, Step, StepErrorKind, StepExecutionRecord,
    StepMetrics, StepResult, StepType, Visibility,
};
use pipewright::executors::StepExecutor;

fn request(pipeline_id: &str, user_id: &str) -> ExecutionRequest {
    ExecutionRequest::new(pipeline_id, user_id, Map::new())
}

#[tokio::test]
async fn test_failure_stops_run_and_keeps_prior_output() {
    let (engine, store) = engine(
        Arc::new(MockGateway::new("ok")),
        vec![pipeline(
            "p",
            Visibility::Private,
            vec![
                echo("first", 1, json!({"a": 1})),
                step_of("second", "fail", 2),
                echo("third", 3, json!({"c": 3})),
            ],
        )],
    )
    .await;

    let record = assert_ok!(engine.execute(request("p", "alice")).await);

    assert_eq!(record.status, ExecutionStatus::Failed);
    assert_eq!(record.error.as_deref(), Some("Step 'second' failed: boom"));
    assert_eq!(record.output(), object(json!({"a": 1})));
    assert!(record.completed_at.is_some());

    let steps = store.list_step_executions(record.id).await.unwrap();
    assert_eq!(steps.len(), 2);
    assert_eq!(steps[0].status, ExecutionStatus::Completed);
    assert_eq!(steps[1].status, ExecutionStatus::Failed);
    assert_eq!(steps[1].error.as_deref(), Some("boom"));

    let stored = store.get_execution(record.id).await.unwrap().unwrap();
    assert_eq!(stored.execution.status, ExecutionStatus::Failed);
}

#[tokio::test]
async fn test_input_mapping_reads_nested_paths() {
    let consumer = step_of("consumer", "echo", 2)
        .with_config("keep", json!("default"))
        .with_input("x", SourceSpec::from("a.b"))
        .with_input("keep", SourceSpec::from("absent.path"))
        .with_input("missing", SourceSpec::from("nope.x"));

    let (engine, store) = engine(
        Arc::new(MockGateway::new("ok")),
        vec![pipeline(
            "p",
            Visibility::Private,
            vec![echo("producer", 1, json!({"a": {"b": 5}})), consumer],
        )],
    )
    .await;

    let record = engine.execute(request("p", "alice")).await.unwrap();
    assert_eq!(record.status, ExecutionStatus::Completed);

    let steps = store.list_step_executions(record.id).await.unwrap();
    assert_eq!(steps[1].inputs, object(json!({"x": 5, "keep": "default"})));
    assert!(!record.output().contains_key("missing"));
}

#[tokio::test]
async fn test_input_mapping_sources() {
    let consumer = step_of("consumer", "echo", 1)
        .with_config("model", json!("m1"))
        .with_input(
            "name",
            SourceSpec::from_source(pipewright::domain::ContextSource::Input, "user.name"),
        )
        .with_input(
            "model_copy",
            SourceSpec::from_source(pipewright::domain::ContextSource::Config, "model"),
        );

    let (engine, _store) = engine(
        Arc::new(MockGateway::new("ok")),
        vec![pipeline("p", Visibility::Private, vec![consumer])],
    )
    .await;

    let input = object(json!({"user": {"name": "Ada"}}));
    let record = engine
        .execute(ExecutionRequest::new("p", "alice", input))
        .await
        .unwrap();

    let output = record.output();
    assert_eq!(output["name"], json!("Ada"));
    assert_eq!(output["model_copy"], json!("m1"));
}

#[tokio::test]
async fn test_output_mapping_versus_merge() {
    let mapped = echo("mapped", 1, json!({"text": "hi", "extra": 1, "meta": {"lang": "en"}}))
        .with_output("summary", "text")
        .with_output("lang", "meta.lang")
        .with_output("absent", "not.there");
    let merged = echo("merged", 2, json!({"x": 1, "y": 2}));
    let scalar = echo("count", 3, json!(42));

    let (engine, _store) = engine(
        Arc::new(MockGateway::new("ok")),
        vec![pipeline("p", Visibility::Private, vec![mapped, merged, scalar])],
    )
    .await;

    let record = engine.execute(request("p", "alice")).await.unwrap();
    assert_eq!(
        record.output(),
        object(json!({"summary": "hi", "lang": "en", "x": 1, "y": 2, "count": 42}))
    );
    assert_eq!(record.results.as_ref().unwrap().final_output, json!(42));
}

#[tokio::test]
async fn test_authorization() {
    let (engine, store) = engine(
        Arc::new(MockGateway::new("ok")),
        vec![
            pipeline("private", Visibility::Private, vec![echo("s", 1, json!({}))]),
            pipeline("public", Visibility::Public, vec![echo("s", 1, json!({}))]),
        ],
    )
    .await;

    let err = assert_err!(engine.execute(request("private", "bob")).await);
    assert!(matches!(err, EngineError::Unauthorized { ref user_id, .. } if user_id == "bob"));
    assert_eq!(store.execution_count().await, 0);

    let owner = engine.execute(request("private", "alice")).await.unwrap();
    assert_eq!(owner.status, ExecutionStatus::Completed);

    let anyone = engine.execute(request("public", "bob")).await.unwrap();
    assert_eq!(anyone.status, ExecutionStatus::Completed);
    assert_eq!(store.execution_count().await, 2);
}

#[tokio::test]
async fn test_missing_pipeline_creates_no_record() {
    let (engine, store) = engine(Arc::new(MockGateway::new("ok")), vec![]).await;

    let err = assert_err!(engine.execute(request("ghost", "alice")).await);
    assert!(matches!(err, EngineError::PipelineNotFound { .. }));
    assert_eq!(store.execution_count().await, 0);
}

#[tokio::test]
async fn test_preflight_validation_errors() {
    let unknown = step_of("mystery", "teleport", 1);
    let incomplete = Step::new("ask", StepType::Prompt, 1).with_config("model_id", json!("gpt-4o"));

    let (engine, store) = engine(
        Arc::new(MockGateway::new("ok")),
        vec![
            pipeline("unknown", Visibility::Private, vec![echo("ok", 0, json!({})), unknown]),
            pipeline("incomplete", Visibility::Private, vec![incomplete]),
        ],
    )
    .await;

    match engine.execute(request("unknown", "alice")).await {
        Err(EngineError::Validation { step_id, errors, .. }) => {
            assert_eq!(step_id, "mystery");
            assert!(errors[0].contains("teleport"));
        }
        other => panic!("expected validation error, got {:?}", other.map(|r| r.status)),
    }

    let err = assert_err!(engine.execute(request("incomplete", "alice")).await);
    assert_eq!(
        err.to_string(),
        "Validation failed for step 'ask' (ask): prompt is required"
    );
    assert_eq!(store.execution_count().await, 0);
}

#[tokio::test]
async fn test_oversized_input_rejected() {
    let (engine, store) = engine(
        Arc::new(MockGateway::new("ok")),
        vec![pipeline("p", Visibility::Private, vec![echo("s", 1, json!({}))])],
    )
    .await;
    let engine = engine.with_limits(SafetyLimits {
        max_input_bytes: 16,
        ..Default::default()
    });

    let input = object(json!({"text": "this input is far too long"}));
    let err = assert_err!(engine.execute(ExecutionRequest::new("p", "alice", input)).await);
    assert!(matches!(err, EngineError::InvalidInput(_)));
    assert_eq!(store.execution_count().await, 0);
}

#[tokio::test]
async fn test_dry_run_never_calls_gateway() {
    let gateway = Arc::new(MockGateway::new("live"));
    let prompt = Step::new("ask", StepType::Prompt, 1)
        .with_config("model_id", json!("gpt-4o"))
        .with_config("prompt", json!("Summarize {{topic}}"));

    let (engine, _store) = engine(
        gateway.clone(),
        vec![pipeline("p", Visibility::Private, vec![prompt])],
    )
    .await;

    let input = object(json!({"topic": "rust"}));
    let record = engine
        .execute(ExecutionRequest::new("p", "alice", input).dry_run(true))
        .await
        .unwrap();

    assert_eq!(record.status, ExecutionStatus::Completed);
    assert!(record.dry_run);
    assert_eq!(gateway.calls(), 0);

    let results = record.results.unwrap();
    assert!(results.total_cost > 0.0);
    assert!(results.total_tokens > 0);
    assert_eq!(
        results.final_output,
        json!("[dry run] gpt-4o: Summarize rust")
    );
}

#[tokio::test]
async fn test_prompt_interpolation_and_usage() {
    let gateway = Arc::new(MockGateway::new("answer"));
    let prompt = Step::new("ask", StepType::Prompt, 1)
        .with_config("model_id", json!("gpt-4o"))
        .with_config("prompt", json!("Hello {{ name }}, {{missing}}"))
        .with_output("reply", "response");

    let (engine, _store) = engine(
        gateway.clone(),
        vec![pipeline("p", Visibility::Private, vec![prompt])],
    )
    .await;

    let input = object(json!({"name": "Ada"}));
    let record = engine
        .execute(ExecutionRequest::new("p", "alice", input))
        .await
        .unwrap();

    assert_eq!(record.status, ExecutionStatus::Completed, "{:?}", record.error);
    assert_eq!(gateway.calls(), 1);
    assert_eq!(record.output()["reply"], json!("answer (Hello Ada, {{missing}})"));

    let results = record.results.unwrap();
    assert_eq!(results.total_tokens, 15);
    assert!(results.total_cost > 0.0);
}

#[tokio::test]
async fn test_missing_credentials_fail_step() {
    let prompt = Step::new("ask", StepType::Prompt, 1)
        .with_config("model_id", json!("claude-3-5-sonnet"))
        .with_config("prompt", json!("hi"));

    let (engine, _store) = engine(
        Arc::new(MockGateway::new("unused")),
        vec![pipeline("p", Visibility::Private, vec![prompt])],
    )
    .await;

    let record = engine.execute(request("p", "alice")).await.unwrap();
    assert_eq!(record.status, ExecutionStatus::Failed);
    assert!(record.error.unwrap().contains("anthropic"));
}

#[tokio::test]
async fn test_steps_run_in_order_field_order() {
    let (engine, store) = engine(
        Arc::new(MockGateway::new("ok")),
        vec![pipeline(
            "p",
            Visibility::Private,
            vec![
                echo("third", 30, json!({"last": "third"})),
                echo("first", 10, json!({"last": "first"})),
                echo("skipped", 15, json!({"last": "skipped"})).disabled(),
                echo("second", 20, json!({"last": "second"})),
            ],
        )],
    )
    .await;

    let record = engine.execute(request("p", "alice")).await.unwrap();
    assert_eq!(record.output()["last"], json!("third"));

    let steps = store.list_step_executions(record.id).await.unwrap();
    let ids: Vec<&str> = steps.iter().map(|s| s.step_id.as_str()).collect();
    assert_eq!(ids, vec!["first", "second", "third"]);
    assert_eq!(record.results.unwrap().steps_completed, 3);
}

#[tokio::test]
async fn test_step_timeout_is_failure() {
    let (engine, store) = engine(
        Arc::new(MockGateway::new("ok")),
        vec![pipeline(
            "p",
            Visibility::Private,
            vec![step_of("sleepy", "slow", 1).with_timeout(1)],
        )],
    )
    .await;

    let record = engine.execute(request("p", "alice")).await.unwrap();
    assert_eq!(record.status, ExecutionStatus::Failed);
    assert_eq!(
        record.error.as_deref(),
        Some("Step 'sleepy' failed: Step 'sleepy' timed out after 1s")
    );

    let steps = store.list_step_executions(record.id).await.unwrap();
    assert_eq!(steps[0].status, ExecutionStatus::Failed);
}

#[tokio::test]
async fn test_panicking_executor_is_contained() {
    let (engine, _store) = engine(
        Arc::new(MockGateway::new("ok")),
        vec![
            pipeline("boom", Visibility::Private, vec![step_of("bad", "panic", 1)]),
            pipeline("fine", Visibility::Private, vec![echo("good", 1, json!({"ok": true}))]),
        ],
    )
    .await;

    let record = engine.execute(request("boom", "alice")).await.unwrap();
    assert_eq!(record.status, ExecutionStatus::Failed);
    assert!(record.error.unwrap().contains("executor panicked: executor exploded"));

    let next = engine.execute(request("fine", "alice")).await.unwrap();
    assert_eq!(next.status, ExecutionStatus::Completed);
}

/// Cancels the shared token when run
struct CancellingExecutor(CancellationToken);

#[async_trait]
impl StepExecutor for CancellingExecutor {
    fn step_type(&self) -> &str {
        "cancel"
    }

    async fn execute(
        &self,
        _step: &Step,
        _inputs: &Map<String, Value>,
        _context: &ExecutionContext,
        _dry_run: bool,
    ) -> StepResult {
        self.0.cancel();
        StepResult::success(json!({"cancelled_by": "step"}))
    }
}

#[tokio::test]
async fn test_cancellation_between_steps() {
    let token = CancellationToken::new();
    let (mut engine, store) = engine(
        Arc::new(MockGateway::new("ok")),
        vec![pipeline(
            "p",
            Visibility::Private,
            vec![
                echo("first", 1, json!({"a": 1})),
                step_of("stop", "cancel", 2),
                echo("never", 3, json!({"c": 3})),
            ],
        )],
    )
    .await;
    engine.register("cancel", Arc::new(CancellingExecutor(token.clone())));

    let record = engine
        .execute(request("p", "alice").with_cancellation(token))
        .await
        .unwrap();

    assert_eq!(record.status, ExecutionStatus::Cancelled);
    assert_eq!(
        record.output(),
        object(json!({"a": 1, "cancelled_by": "step"}))
    );
    assert_eq!(store.list_step_executions(record.id).await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_retry_then_success_records_attempts() {
    let flaky = Arc::new(FlakyExecutor::new(1, StepErrorKind::Execution));
    let (mut engine, store) = engine(
        Arc::new(MockGateway::new("ok")),
        vec![pipeline(
            "p",
            Visibility::Private,
            vec![step_of("wobbly", "flaky", 1).with_retry(RetryPolicy::attempts(3, 10))],
        )],
    )
    .await;
    engine.register("flaky", flaky.clone());

    let record = engine.execute(request("p", "alice")).await.unwrap();
    assert_eq!(record.status, ExecutionStatus::Completed);
    assert_eq!(flaky.calls(), 2);

    let steps = store.list_step_executions(record.id).await.unwrap();
    assert_eq!(steps.len(), 1);
    assert_eq!(steps[0].metrics.attempts, 2);
}

#[tokio::test]
async fn test_validation_failures_are_not_retried() {
    let flaky = Arc::new(FlakyExecutor::new(5, StepErrorKind::Validation));
    let (mut engine, store) = engine(
        Arc::new(MockGateway::new("ok")),
        vec![pipeline(
            "p",
            Visibility::Private,
            vec![step_of("strict", "flaky", 1).with_retry(RetryPolicy::attempts(3, 10))],
        )],
    )
    .await;
    engine.register("flaky", flaky.clone());

    let record = engine.execute(request("p", "alice")).await.unwrap();
    assert_eq!(record.status, ExecutionStatus::Failed);
    assert_eq!(flaky.calls(), 1);
    assert_eq!(
        store.list_step_executions(record.id).await.unwrap()[0].metrics.attempts,
        1
    );
}

#[tokio::test]
async fn test_default_policy_does_not_retry() {
    let flaky = Arc::new(FlakyExecutor::new(1, StepErrorKind::Execution));
    let (mut engine, _store) = engine(
        Arc::new(MockGateway::new("ok")),
        vec![pipeline("p", Visibility::Private, vec![step_of("once", "flaky", 1)])],
    )
    .await;
    engine.register("flaky", flaky.clone());

    let record = engine.execute(request("p", "alice")).await.unwrap();
    assert_eq!(record.status, ExecutionStatus::Failed);
    assert_eq!(flaky.calls(), 1);
}

#[tokio::test]
async fn test_oversized_output_fails_step() {
    let (engine, _store) = engine(
        Arc::new(MockGateway::new("ok")),
        vec![pipeline(
            "p",
            Visibility::Private,
            vec![echo("big", 1, json!({"blob": "x".repeat(64)}))],
        )],
    )
    .await;
    let engine = engine.with_limits(SafetyLimits {
        max_output_bytes: 32,
        ..Default::default()
    });

    let record = engine.execute(request("p", "alice")).await.unwrap();
    assert_eq!(record.status, ExecutionStatus::Failed);
    assert!(record.output().is_empty());
}

#[tokio::test]
async fn test_builtin_steps_chain_through_context() {
    let parse = Step::new("parse", StepType::Transform, 1)
        .with_config("transform_type", json!("parse"))
        .with_input("data", SourceSpec::from_source(pipewright::domain::ContextSource::Input, "raw"))
        .with_output("parsed", "result");
    let check = Step::new("check", StepType::Condition, 2)
        .with_config("operator", json!("greater_than"))
        .with_config("compare", json!(10))
        .with_config("require", json!(true))
        .with_input("value", SourceSpec::from("parsed.score"));
    let shout = Step::new("shout", StepType::Transform, 3)
        .with_config("transform_type", json!("uppercase"))
        .with_input("data", SourceSpec::from("parsed.name"));

    let (engine, _store) = engine(
        Arc::new(MockGateway::new("ok")),
        vec![pipeline("p", Visibility::Private, vec![parse, check, shout])],
    )
    .await;

    let passing = object(json!({"raw": "{\"name\": \"ada\", \"score\": 42}"}));
    let record = engine
        .execute(ExecutionRequest::new("p", "alice", passing))
        .await
        .unwrap();
    assert_eq!(record.status, ExecutionStatus::Completed, "{:?}", record.error);
    assert_eq!(record.results.unwrap().final_output, json!("ADA"));

    let failing = object(json!({"raw": "{\"name\": \"bob\", \"score\": 3}"}));
    let record = engine
        .execute(ExecutionRequest::new("p", "alice", failing))
        .await
        .unwrap();
    assert_eq!(record.status, ExecutionStatus::Failed);
    assert!(record.error.unwrap().starts_with("Step 'check' failed"));
}

#[tokio::test]
async fn test_rate_limited_step_is_retried() {
    let flaky = Arc::new(FlakyExecutor::new(
        1,
        StepErrorKind::ProviderRateLimit {
            retry_after_seconds: Some(0),
        },
    ));
    let (mut engine, store) = engine(
        Arc::new(MockGateway::new("ok")),
        vec![pipeline(
            "p",
            Visibility::Private,
            vec![step_of("limited", "flaky", 1).with_retry(RetryPolicy::attempts(3, 0))],
        )],
    )
    .await;
    engine.register("flaky", flaky.clone());

    let record = engine.execute(request("p", "alice")).await.unwrap();
    assert_eq!(record.status, ExecutionStatus::Completed, "{:?}", record.error);
    assert_eq!(flaky.calls(), 2);
    assert_eq!(
        store.list_step_executions(record.id).await.unwrap()[0].metrics.attempts,
        2
    );
}

#[tokio::test]
async fn test_authentication_failures_are_not_retried() {
    let flaky = Arc::new(FlakyExecutor::new(5, StepErrorKind::ProviderAuthentication));
    let (mut engine, store) = engine(
        Arc::new(MockGateway::new("ok")),
        vec![pipeline(
            "p",
            Visibility::Private,
            vec![step_of("denied", "flaky", 1).with_retry(RetryPolicy::attempts(3, 0))],
        )],
    )
    .await;
    engine.register("flaky", flaky.clone());

    let record = engine.execute(request("p", "alice")).await.unwrap();
    assert_eq!(record.status, ExecutionStatus::Failed);
    assert_eq!(flaky.calls(), 1);
    assert_eq!(
        store.list_step_executions(record.id).await.unwrap()[0].metrics.attempts,
        1
    );
}

#[tokio::test]
async fn test_inline_api_key_not_persisted() {
    let prompt = Step::new("ask", StepType::Prompt, 1)
        .with_config("model_id", json!("gpt-4o"))
        .with_config("prompt", json!("hi"))
        .with_config("api_key", json!("sk-SECRET"));

    let (engine, store) = engine(
        Arc::new(MockGateway::new("answer")),
        vec![pipeline("p", Visibility::Private, vec![prompt])],
    )
    .await;

    let record = engine.execute(request("p", "alice")).await.unwrap();
    assert_eq!(record.status, ExecutionStatus::Completed, "{:?}", record.error);

    let steps = store.list_step_executions(record.id).await.unwrap();
    assert_eq!(steps[0].inputs["api_key"], json!("[REDACTED]"));
    assert_eq!(steps[0].inputs["prompt"], json!("hi"));
    assert!(!serde_json::to_string(&steps[0]).unwrap().contains("sk-SECRET"));
}

/// Memory store whose step writes always fail
struct BrokenStepStore(MemoryStore);

#[async_trait]
impl PipelineStore for BrokenStepStore {
    async fn load_pipeline(&self, pipeline_id: &str) -> anyhow::Result<Option<PipelineDefinition>> {
        self.0.load_pipeline(pipeline_id).await
    }

    async fn load_enabled_steps(&self, pipeline_id: &str) -> anyhow::Result<Vec<Step>> {
        self.0.load_enabled_steps(pipeline_id).await
    }

    async fn save_pipeline(&self, pipeline: &PipelineDefinition) -> anyhow::Result<()> {
        self.0.save_pipeline(pipeline).await
    }

    async fn create_execution(&self, execution: &PipelineExecutionRecord) -> anyhow::Result<()> {
        self.0.create_execution(execution).await
    }

    async fn complete_execution(
        &self,
        execution_id: Uuid,
        status: ExecutionStatus,
        results: Option<&ExecutionResults>,
        error: Option<&str>,
    ) -> anyhow::Result<()> {
        self.0
            .complete_execution(execution_id, status, results, error)
            .await
    }

    async fn create_step_execution(&self, _step: &StepExecutionRecord) -> anyhow::Result<()> {
        anyhow::bail!("disk full")
    }

    async fn complete_step_execution(
        &self,
        execution_id: Uuid,
        step_execution_id: Uuid,
        status: ExecutionStatus,
        outputs: Option<&Value>,
        error: Option<&str>,
        metrics: &StepMetrics,
    ) -> anyhow::Result<()> {
        self.0
            .complete_step_execution(
                execution_id,
                step_execution_id,
                status,
                outputs,
                error,
                metrics,
            )
            .await
    }

    async fn get_execution(&self, execution_id: Uuid) -> anyhow::Result<Option<ExecutionHistory>> {
        self.0.get_execution(execution_id).await
    }

    async fn list_executions(&self, limit: usize) -> anyhow::Result<Vec<PipelineExecutionRecord>> {
        self.0.list_executions(limit).await
    }
}

#[tokio::test]
async fn test_store_failure_marks_execution_failed() {
    let store = Arc::new(BrokenStepStore(MemoryStore::with_pipelines([pipeline(
        "p",
        Visibility::Private,
        vec![echo("first", 1, json!({"a": 1}))],
    )])));
    let deps = deps(Arc::new(MockGateway::new("ok")), &std::env::temp_dir()).await;
    let engine = PipelineExecutor::new(store.clone(), registry(&deps));

    let err = assert_err!(engine.execute(request("p", "alice")).await);
    assert!(matches!(err, EngineError::Persistence(_)));
    assert!(err.to_string().contains("disk full"));

    let executions = assert_ok!(store.list_executions(10).await);
    assert_eq!(executions.len(), 1);
    assert_eq!(executions[0].status, ExecutionStatus::Failed);
    assert!(executions[0].error.as_deref().unwrap().contains("disk full"));
}
