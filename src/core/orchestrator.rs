//! Main orchestrator for pipeline execution.
//!
//! Loads and authorizes a pipeline, validates every step up front, then runs
//! the enabled steps strictly in `order`. Each step runs on its own task
//! under a timeout with the step's retry policy. The first failure stops the
//! run; the execution record reflects the outcome either way.

use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{Map, Value};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::error::{EngineError, EngineResult, StepError};
use super::registry::ExecutorRegistry;
use super::resolver::{get_path, resolve_inputs};
use super::safety::{SafetyLimits, SafetyTracker};
use super::store::PipelineStore;
use crate::domain::{
    ExecutionContext, ExecutionHistory, ExecutionMetadata, ExecutionResults, ExecutionStatus,
    PipelineDefinition, PipelineExecutionRecord, RetryPolicy, Step, StepErrorKind,
    StepExecutionRecord, StepMetrics, StepResult,
};
use crate::executors::StepExecutor;

/// Cooperative cancellation flag, checked between steps
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation; the current step finishes first
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Parameters of a single run
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub pipeline_id: String,
    pub user_id: String,
    pub input: Map<String, Value>,
    pub dry_run: bool,
    cancellation: Option<CancellationToken>,
}

impl ExecutionRequest {
    pub fn new(
        pipeline_id: impl Into<String>,
        user_id: impl Into<String>,
        input: Map<String, Value>,
    ) -> Self {
        Self {
            pipeline_id: pipeline_id.into(),
            user_id: user_id.into(),
            input,
            dry_run: false,
            cancellation: None,
        }
    }

    /// Bypass providers and side-effecting operations
    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// Attach a cancellation handle
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }

    fn is_cancelled(&self) -> bool {
        self.cancellation
            .as_ref()
            .is_some_and(CancellationToken::is_cancelled)
    }
}

/// A validated step paired with the executor that will run it
struct PlannedStep {
    step: Step,
    executor: Arc<dyn StepExecutor>,
}

/// Running totals for a run
#[derive(Default)]
struct RunTotals {
    cost: f64,
    tokens: u64,
    steps_completed: usize,
}

/// Pipeline execution engine
pub struct PipelineExecutor {
    store: Arc<dyn PipelineStore>,
    registry: ExecutorRegistry,
    limits: SafetyLimits,
}

impl PipelineExecutor {
    /// Engine with default safety limits
    pub fn new(store: Arc<dyn PipelineStore>, registry: ExecutorRegistry) -> Self {
        Self {
            store,
            registry,
            limits: SafetyLimits::default(),
        }
    }

    pub fn with_limits(mut self, limits: SafetyLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Register an executor for a step type, replacing any existing one
    pub fn register(
        &mut self,
        step_type: impl Into<String>,
        executor: Arc<dyn StepExecutor>,
    ) -> Option<Arc<dyn StepExecutor>> {
        self.registry.register(step_type, executor)
    }

    pub fn registry(&self) -> &ExecutorRegistry {
        &self.registry
    }

    pub fn store(&self) -> &Arc<dyn PipelineStore> {
        &self.store
    }

    pub fn limits(&self) -> &SafetyLimits {
        &self.limits
    }

    /// Execute a pipeline.
    ///
    /// Lookup, authorization and validation failures return `Err` and leave
    /// no execution record. Once the record exists, step failures come back
    /// as `Ok` with a `failed` status.
    #[instrument(
        skip(self, request),
        fields(
            pipeline_id = %request.pipeline_id,
            user_id = %request.user_id,
            dry_run = request.dry_run,
            execution_id = tracing::field::Empty,
        )
    )]
    pub async fn execute(&self, request: ExecutionRequest) -> EngineResult<PipelineExecutionRecord> {
        let pipeline = self.load_pipeline(&request.pipeline_id).await?;

        if !pipeline.is_accessible_by(&request.user_id) {
            warn!("User not authorized for pipeline");
            return Err(EngineError::Unauthorized {
                user_id: request.user_id.clone(),
                pipeline_id: pipeline.id.clone(),
            });
        }

        let steps = self.store.load_enabled_steps(&pipeline.id).await?;
        let plan = self.plan(steps)?;

        self.limits
            .validate_input(&Value::Object(request.input.clone()))
            .map_err(|e| EngineError::InvalidInput(e.to_string()))?;

        let execution_id = Uuid::new_v4();
        tracing::Span::current().record("execution_id", tracing::field::display(execution_id));

        let record = PipelineExecutionRecord::start(
            execution_id,
            &pipeline.id,
            &request.user_id,
            request.input.clone(),
            request.dry_run,
        );
        self.store.create_execution(&record).await?;
        info!(steps = plan.len(), "Starting pipeline execution");

        let metadata = ExecutionMetadata {
            execution_id,
            pipeline_id: pipeline.id.clone(),
            user_id: request.user_id.clone(),
        };
        let context = ExecutionContext::new(request.input.clone(), metadata, plan.len());

        match self.run_steps(record, context, &plan, &request).await {
            Err(EngineError::Persistence(e)) => {
                // the record would otherwise stay `running`
                let message = format!("Persistence error: {:#}", e);
                if let Err(finalize_err) = self
                    .store
                    .complete_execution(execution_id, ExecutionStatus::Failed, None, Some(&message))
                    .await
                {
                    warn!(error = %finalize_err, "Could not mark execution as failed");
                }
                error!(error = %message, "Execution aborted by store failure");
                Err(EngineError::Persistence(e))
            }
            other => other,
        }
    }

    /// Run every planned step, then finalize the record
    async fn run_steps(
        &self,
        record: PipelineExecutionRecord,
        mut context: ExecutionContext,
        plan: &[PlannedStep],
        request: &ExecutionRequest,
    ) -> EngineResult<PipelineExecutionRecord> {
        let mut tracker = SafetyTracker::new();
        let mut totals = RunTotals::default();
        let mut final_output = Value::Null;

        for (index, planned) in plan.iter().enumerate() {
            let step = &planned.step;
            context.step_index = index;

            if request.is_cancelled() {
                info!(next_step = %step.id, "Execution cancelled");
                let message = StepError::Cancelled.to_string();
                return self
                    .finalize(record, ExecutionStatus::Cancelled, context, totals, Value::Null, Some(message))
                    .await;
            }

            if let Err(violation) = self.limits.check(&tracker) {
                error!(step = %step.id, %violation, "Safety limit reached");
                let message = format!("Safety limit reached before step '{}': {}", step.name, violation);
                return self
                    .finalize(record, ExecutionStatus::Failed, context, totals, Value::Null, Some(message))
                    .await;
            }

            let inputs = resolve_inputs(step, &context);
            let step_record = StepExecutionRecord::start(
                record.id,
                &step.id,
                &step.name,
                redact_secrets(&inputs),
            );
            self.store.create_step_execution(&step_record).await?;

            let (result, attempts) = self
                .run_with_retry(
                    step,
                    &planned.executor,
                    &inputs,
                    &context,
                    request.dry_run,
                    &tracker,
                )
                .await;
            let result = self.enforce_output_limit(step, result);

            let metrics = StepMetrics {
                execution_time_ms: result.execution_time_ms,
                cost: result.cost,
                tokens_used: result.tokens_used,
                attempts,
            };

            if !result.success {
                let error = result.error_message().to_string();
                self.store
                    .complete_step_execution(
                        record.id,
                        step_record.id,
                        ExecutionStatus::Failed,
                        None,
                        Some(&error),
                        &metrics,
                    )
                    .await?;

                error!(step = %step.id, attempts, error = %error, "Step failed");
                let message = format!("Step '{}' failed: {}", step.name, error);
                return self
                    .finalize(record, ExecutionStatus::Failed, context, totals, Value::Null, Some(message))
                    .await;
            }

            totals.cost += result.cost;
            totals.tokens += result.tokens_used;
            totals.steps_completed += 1;
            tracker.record_step(&result.output);
            apply_output(step, &result.output, &mut context);
            final_output = result.primary_output().clone();

            self.store
                .complete_step_execution(
                    record.id,
                    step_record.id,
                    ExecutionStatus::Completed,
                    Some(&result.output),
                    None,
                    &metrics,
                )
                .await?;

            debug!(
                step = %step.id,
                attempts,
                duration_ms = result.execution_time_ms,
                tokens = result.tokens_used,
                "Step completed"
            );
        }

        self.finalize(record, ExecutionStatus::Completed, context, totals, final_output, None)
            .await
    }

    /// Execute a step, retrying retryable failures per its policy.
    /// Returns the last result and the number of attempts made.
    async fn run_with_retry(
        &self,
        step: &Step,
        executor: &Arc<dyn StepExecutor>,
        inputs: &Map<String, Value>,
        context: &ExecutionContext,
        dry_run: bool,
        tracker: &SafetyTracker,
    ) -> (StepResult, u32) {
        let policy = &step.retry_policy;
        let run_budget = Duration::from_secs(self.limits.run_timeout_seconds);
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            let result = self.dispatch(step, executor, inputs, context, dry_run).await;
            if result.success {
                return (result, attempt);
            }

            let retryable = result
                .error_kind
                .as_ref()
                .map_or(true, StepErrorKind::is_retryable);
            if !retryable || !policy.should_retry(attempt) {
                return (result, attempt);
            }

            let remaining = run_budget.saturating_sub(tracker.started_at.elapsed());
            let delay = retry_delay(policy, result.error_kind.as_ref(), attempt).min(remaining);

            warn!(
                step = %step.id,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %result.error_message(),
                "Step failed, retrying"
            );
            tokio::time::sleep(delay).await;
        }
    }

    /// Run one attempt on its own task, bounded by the step timeout.
    /// Panics and timeouts become failed results.
    async fn dispatch(
        &self,
        step: &Step,
        executor: &Arc<dyn StepExecutor>,
        inputs: &Map<String, Value>,
        context: &ExecutionContext,
        dry_run: bool,
    ) -> StepResult {
        let timeout = step.timeout(self.limits.step_timeout_seconds);
        let started = Instant::now();

        let mut handle = {
            let executor = Arc::clone(executor);
            let step = step.clone();
            let inputs = inputs.clone();
            let context = context.clone();
            tokio::spawn(async move { executor.execute(&step, &inputs, &context, dry_run).await })
        };

        let result = match tokio::time::timeout(timeout, &mut handle).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_error)) => {
                let message = if join_error.is_panic() {
                    format!("executor panicked: {}", panic_message(join_error.into_panic()))
                } else {
                    "executor task was cancelled".to_string()
                };
                StepError::execution(&step.id, message).into()
            }
            Err(_) => {
                handle.abort();
                StepError::Timeout {
                    step_id: step.id.clone(),
                    timeout_seconds: timeout.as_secs(),
                }
                .into()
            }
        };

        if result.execution_time_ms == 0 {
            result.with_execution_time(started.elapsed().as_millis() as u64)
        } else {
            result
        }
    }

    fn enforce_output_limit(&self, step: &Step, result: StepResult) -> StepResult {
        if !result.success {
            return result;
        }
        match self.limits.validate_output(&result.output) {
            Ok(()) => result,
            Err(violation) => {
                let failed: StepResult = StepError::execution(&step.id, violation).into();
                failed
                    .with_usage(result.tokens_used, result.cost)
                    .with_execution_time(result.execution_time_ms)
            }
        }
    }

    /// Persist the terminal state and return the finished record
    async fn finalize(
        &self,
        mut record: PipelineExecutionRecord,
        status: ExecutionStatus,
        context: ExecutionContext,
        totals: RunTotals,
        final_output: Value,
        error: Option<String>,
    ) -> EngineResult<PipelineExecutionRecord> {
        let results = ExecutionResults {
            output: context.into_output(),
            final_output,
            total_cost: totals.cost,
            total_tokens: totals.tokens,
            steps_completed: totals.steps_completed,
        };

        self.store
            .complete_execution(record.id, status, Some(&results), error.as_deref())
            .await?;

        match status {
            ExecutionStatus::Completed => info!(
                steps = results.steps_completed,
                cost = results.total_cost,
                tokens = results.total_tokens,
                "Pipeline execution completed"
            ),
            _ => warn!(?status, error = ?error, "Pipeline execution did not complete"),
        }

        record.finish(status, Some(results), error, chrono::Utc::now());
        Ok(record)
    }

    /// Run the pre-flight checks for a stored pipeline without executing it.
    /// Returns the steps in execution order.
    #[instrument(skip(self))]
    pub async fn validate_pipeline(&self, pipeline_id: &str) -> EngineResult<Vec<Step>> {
        let pipeline = self.load_pipeline(pipeline_id).await?;
        let steps = self.store.load_enabled_steps(&pipeline.id).await?;
        Ok(self.plan(steps)?.into_iter().map(|p| p.step).collect())
    }

    /// Pre-flight checks for a definition that is not stored
    pub fn validate_definition(&self, pipeline: &PipelineDefinition) -> EngineResult<Vec<Step>> {
        pipeline
            .validate()
            .map_err(|e| EngineError::InvalidInput(format!("{:#}", e)))?;
        Ok(self
            .plan(pipeline.steps.clone())?
            .into_iter()
            .map(|p| p.step)
            .collect())
    }

    /// Execution with its step records
    pub async fn get_execution(&self, execution_id: Uuid) -> EngineResult<Option<ExecutionHistory>> {
        Ok(self.store.get_execution(execution_id).await?)
    }

    /// Most recent executions first
    pub async fn list_executions(&self, limit: usize) -> EngineResult<Vec<PipelineExecutionRecord>> {
        Ok(self.store.list_executions(limit).await?)
    }

    async fn load_pipeline(&self, pipeline_id: &str) -> EngineResult<PipelineDefinition> {
        self.store
            .load_pipeline(pipeline_id)
            .await?
            .ok_or_else(|| EngineError::PipelineNotFound {
                pipeline_id: pipeline_id.to_string(),
            })
    }

    /// Order the enabled steps and validate each against its executor
    fn plan(&self, mut steps: Vec<Step>) -> EngineResult<Vec<PlannedStep>> {
        steps.retain(|s| s.enabled);
        // stable: equal orders keep storage order
        steps.sort_by_key(|s| s.order);

        if let Err(violation) = self.limits.validate_step_count(steps.len()) {
            let first_over = &steps[self.limits.max_steps as usize];
            return Err(EngineError::Validation {
                step_id: first_over.id.clone(),
                step_name: first_over.name.clone(),
                errors: vec![violation.to_string()],
            });
        }

        steps
            .into_iter()
            .map(|step| {
                let Some(executor) = self.registry.get(step.step_type.as_str()) else {
                    return Err(EngineError::Validation {
                        errors: vec![format!("Unknown step type '{}'", step.step_type)],
                        step_id: step.id,
                        step_name: step.name,
                    });
                };

                let errors = executor.validate(&step);
                if !errors.is_empty() {
                    return Err(EngineError::Validation {
                        step_id: step.id,
                        step_name: step.name,
                        errors,
                    });
                }

                Ok(PlannedStep { step, executor })
            })
            .collect()
    }
}

/// Write a successful step's output into the context.
///
/// With a mapping, each context key takes the value at its path in the
/// output and missing paths are skipped. Without one, object outputs are
/// merged key by key and anything else is stored under the step id.
fn apply_output(step: &Step, output: &Value, context: &mut ExecutionContext) {
    match (&step.output_mapping, output) {
        (Some(mapping), _) => {
            for (key, path) in mapping {
                match get_path(output, path) {
                    Some(value) => context.set_output(key.clone(), value.clone()),
                    None => debug!(step = %step.id, %key, %path, "Output path not found"),
                }
            }
        }
        (None, Value::Object(values)) => context.merge_output(values),
        (None, other) => context.set_output(step.id.clone(), other.clone()),
    }
}

/// Wait before the next attempt. A rate-limit hint replaces the backoff
/// delay but never exceeds the policy's `max_delay_ms`.
fn retry_delay(policy: &RetryPolicy, kind: Option<&StepErrorKind>, attempt: u32) -> Duration {
    match kind {
        Some(StepErrorKind::ProviderRateLimit {
            retry_after_seconds: Some(seconds),
        }) => Duration::from_secs(*seconds).min(Duration::from_millis(policy.max_delay_ms)),
        _ => policy.delay_for_attempt(attempt),
    }
}

const SECRET_KEYS: &[&str] = &["api_key", "apikey", "access_token", "token", "password", "secret"];

/// Copy of resolved inputs safe to persist; credential values are masked
fn redact_secrets(inputs: &Map<String, Value>) -> Map<String, Value> {
    inputs
        .iter()
        .map(|(key, value)| {
            if SECRET_KEYS.contains(&key.to_ascii_lowercase().as_str()) {
                (key.clone(), Value::String("[REDACTED]".to_string()))
            } else {
                (key.clone(), value.clone())
            }
        })
        .collect()
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
