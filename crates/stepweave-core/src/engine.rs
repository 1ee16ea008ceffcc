//! Workflow engine: sequential entries, parallel groups, conditions, retries.
//!
//! # Execution flow
//!
//! 1. Resolve the workflow's sequence (static ids or the dynamic resolver).
//! 2. With `prefer_cache`, check the result cache; an unexpired hit is
//!    returned without running any step.
//! 3. Create a fresh `ExecutionContext` and walk the entries in order:
//!    - step: evaluate its condition, run it under its retry policy, store
//!      the output and make it the new running data;
//!    - group: evaluate member conditions, fan the remaining members out on a
//!      `JoinSet`, join, store `{member: output}` under the group id and merge
//!      it into the running data.
//! 4. Append the execution record, cache the final output on success.
//!
//! Every run that gets past workflow lookup ends in exactly one appended
//! record, including runs whose sequence fails to resolve. Cache and trace
//! failures are logged and never fail a run.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use stepweave_types::config::EngineConfig;
use stepweave_types::event::ExecutionEvent;
use stepweave_types::execution::ExecutionRecord;
use stepweave_types::workflow::SequenceEntry;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::context::{CallerContext, ExecutionContext};
use crate::event::EventBus;
use crate::expression::{ExpressionError, WorkflowEvaluator};
use crate::registry::{RegistryError, WorkflowRegistry};
use crate::repository::{ResultCache, TraceSink};
use crate::retry::{RetryHandler, RetryPolicy};
use crate::step::{StepContext, StepError};
use crate::trace::{RunTrace, TraceRecorder};

/// Default deadline for one step attempt (5 minutes).
pub const DEFAULT_ATTEMPT_TIMEOUT_SECS: u64 = 300;

/// Default lifetime of a cached workflow output (1 hour).
pub const DEFAULT_CACHE_TTL_SECS: u64 = 3_600;

// ---------------------------------------------------------------------------
// Options and outcome
// ---------------------------------------------------------------------------

/// Per-call execution options.
#[derive(Debug, Clone, Default)]
pub struct ExecuteOptions {
    /// Return an unexpired cached output instead of running the workflow.
    pub prefer_cache: bool,
    /// Caller-owned token; cancelling it cancels the run.
    pub cancel: Option<CancellationToken>,
}

impl ExecuteOptions {
    pub fn prefer_cache() -> Self {
        Self {
            prefer_cache: true,
            cancel: None,
        }
    }

    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }
}

/// Detailed result of a workflow run.
#[derive(Debug, Clone)]
pub struct ExecutionOutcome {
    pub execution_id: Uuid,
    /// Final running data.
    pub output: Value,
    /// Outputs by step or group id. Empty for cache hits.
    pub results: HashMap<String, Value>,
    /// The appended execution record. `None` for cache hits.
    pub record: Option<ExecutionRecord>,
    pub from_cache: bool,
}

// ---------------------------------------------------------------------------
// ExecutionError
// ---------------------------------------------------------------------------

/// Errors returned by a workflow run.
#[derive(Debug, thiserror::Error)]
pub enum ExecutionError {
    #[error("unknown workflow '{0}'")]
    UnknownWorkflow(String),

    #[error("unknown step '{0}'")]
    UnknownStep(String),

    #[error("resolver for workflow '{workflow_id}' failed: {message}")]
    Resolver { workflow_id: String, message: String },

    #[error("step '{step_id}' failed after {attempts} attempt(s): {source}")]
    StepExecution {
        step_id: String,
        attempts: u32,
        source: StepError,
    },

    #[error("group '{group_id}' failed: step '{step_id}' failed after {attempts} attempt(s): {source}")]
    GroupExecution {
        group_id: String,
        step_id: String,
        attempts: u32,
        source: StepError,
    },

    #[error("condition for step '{step_id}' could not be evaluated: {source}")]
    Condition {
        step_id: String,
        source: ExpressionError,
    },

    #[error("workflow execution cancelled")]
    Cancelled,

    #[error(transparent)]
    Registry(RegistryError),
}

impl From<RegistryError> for ExecutionError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::UnknownWorkflow(id) => ExecutionError::UnknownWorkflow(id),
            RegistryError::UnknownStep(id) => ExecutionError::UnknownStep(id),
            RegistryError::Resolver {
                workflow_id,
                message,
            } => ExecutionError::Resolver {
                workflow_id,
                message,
            },
            other => ExecutionError::Registry(other),
        }
    }
}

impl ExecutionError {
    /// The step or group the error names, if any.
    pub fn failing_entry(&self) -> Option<&str> {
        match self {
            ExecutionError::StepExecution { step_id, .. }
            | ExecutionError::Condition { step_id, .. } => Some(step_id),
            ExecutionError::GroupExecution { group_id, .. } => Some(group_id),
            ExecutionError::UnknownStep(id) => Some(id),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// WorkflowEngine
// ---------------------------------------------------------------------------

/// Executes registered workflows.
///
/// Generic over the cache and trace backends. The engine holds no per-run
/// state besides the cancellation tokens of in-flight runs.
pub struct WorkflowEngine<C: ResultCache, S: TraceSink> {
    registry: Arc<WorkflowRegistry>,
    cache: Arc<C>,
    recorder: TraceRecorder<S>,
    evaluator: WorkflowEvaluator,
    event_bus: EventBus,
    default_retry: RetryPolicy,
    cache_ttl: Duration,
    attempt_timeout: Duration,
    /// Cancellation tokens keyed by execution id.
    cancellation_tokens: DashMap<Uuid, CancellationToken>,
}

impl<C: ResultCache + 'static, S: TraceSink + 'static> WorkflowEngine<C, S> {
    pub fn new(registry: Arc<WorkflowRegistry>, cache: Arc<C>, sink: Arc<S>) -> Self {
        Self {
            registry,
            cache,
            recorder: TraceRecorder::new(sink),
            evaluator: WorkflowEvaluator::new(),
            event_bus: EventBus::default(),
            default_retry: RetryPolicy::default(),
            cache_ttl: Duration::from_secs(DEFAULT_CACHE_TTL_SECS),
            attempt_timeout: Duration::from_secs(DEFAULT_ATTEMPT_TIMEOUT_SECS),
            cancellation_tokens: DashMap::new(),
        }
    }

    /// Apply the retry, cache and execution sections of `config.toml`.
    pub fn with_config(self, config: &EngineConfig) -> Self {
        self.with_default_retry(RetryPolicy::from_settings(&config.default_retry))
            .with_cache_ttl(Duration::from_secs(config.cache.ttl_secs))
            .with_attempt_timeout(Duration::from_secs(config.execution.attempt_timeout_secs))
            .with_event_bus(EventBus::new(config.execution.event_capacity))
    }

    /// Policy for steps without `configure_retry`.
    pub fn with_default_retry(mut self, policy: RetryPolicy) -> Self {
        self.default_retry = policy;
        self
    }

    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = ttl;
        self
    }

    pub fn with_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = timeout;
        self
    }

    pub fn with_event_bus(mut self, event_bus: EventBus) -> Self {
        self.event_bus = event_bus;
        self
    }

    pub fn registry(&self) -> &Arc<WorkflowRegistry> {
        &self.registry
    }

    pub fn cache(&self) -> &Arc<C> {
        &self.cache
    }

    pub fn trace_sink(&self) -> &Arc<S> {
        self.recorder.sink()
    }

    pub fn list_workflows(&self) -> Vec<String> {
        self.registry.list_workflows()
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<ExecutionEvent> {
        self.event_bus.subscribe()
    }

    /// Cancel an in-flight run. Returns `false` if no such run is active.
    pub fn cancel(&self, execution_id: Uuid) -> bool {
        match self.cancellation_tokens.get(&execution_id) {
            Some(token) => {
                token.cancel();
                tracing::info!(execution_id = %execution_id, "workflow cancellation requested");
                true
            }
            None => false,
        }
    }

    /// Execute a workflow and return its final output.
    pub async fn execute_workflow(
        &self,
        workflow_id: &str,
        input: Value,
        caller_context: CallerContext,
        options: ExecuteOptions,
    ) -> Result<Value, ExecutionError> {
        self.run_workflow(workflow_id, input, caller_context, options)
            .await
            .map(|outcome| outcome.output)
    }

    /// Execute a workflow and return the detailed outcome.
    pub async fn run_workflow(
        &self,
        workflow_id: &str,
        input: Value,
        caller_context: CallerContext,
        options: ExecuteOptions,
    ) -> Result<ExecutionOutcome, ExecutionError> {
        let execution_id = Uuid::now_v7();
        let entries = match self.registry.resolve_sequence(workflow_id, &input, &caller_context) {
            Ok(entries) => entries,
            Err(RegistryError::UnknownWorkflow(id)) => return Err(ExecutionError::UnknownWorkflow(id)),
            Err(e) => {
                let error = ExecutionError::from(e);
                self.fail_run(execution_id, workflow_id, RunTrace::new(execution_id, workflow_id), &error)
                    .await;
                return Err(error);
            }
        };

        let key = cache_key(workflow_id, &input);
        if options.prefer_cache {
            match self.cache.get(&key).await {
                Ok(Some(output)) => {
                    tracing::info!(workflow = workflow_id, key = key.as_str(), "serving cached workflow output");
                    self.event_bus.publish(ExecutionEvent::CacheHit {
                        workflow_id: workflow_id.to_string(),
                        key,
                    });
                    return Ok(ExecutionOutcome {
                        execution_id,
                        output,
                        results: Default::default(),
                        record: None,
                        from_cache: true,
                    });
                }
                Ok(None) => {}
                Err(e) => tracing::warn!(
                    workflow = workflow_id,
                    error = %e,
                    "result cache read failed, executing workflow"
                ),
            }
        }

        let token = match &options.cancel {
            Some(parent) => parent.child_token(),
            None => CancellationToken::new(),
        };
        self.cancellation_tokens.insert(execution_id, token.clone());
        let _active = ActiveRun {
            tokens: &self.cancellation_tokens,
            execution_id,
        };

        self.event_bus.publish(ExecutionEvent::RunStarted {
            execution_id,
            workflow_id: workflow_id.to_string(),
            entries: entries.len(),
        });
        tracing::info!(
            execution_id = %execution_id,
            workflow = workflow_id,
            entries = entries.len(),
            "starting workflow execution"
        );

        let run_start = Instant::now();
        let mut ctx = ExecutionContext::new(workflow_id, execution_id, input.clone(), caller_context);
        let mut trace = RunTrace::new(execution_id, workflow_id);

        let result = self
            .run_entries(&entries, input, &mut ctx, &mut trace, &token)
            .await;

        match result {
            Ok(output) => {
                let record = self.recorder.finish(trace, None).await;

                if let Err(e) = self.cache.set(&key, &output, self.cache_ttl).await {
                    tracing::warn!(
                        execution_id = %execution_id,
                        workflow = workflow_id,
                        error = %e,
                        "failed to cache workflow output"
                    );
                }

                let duration_ms = run_start.elapsed().as_millis() as u64;
                self.event_bus.publish(ExecutionEvent::RunCompleted {
                    execution_id,
                    workflow_id: workflow_id.to_string(),
                    duration_ms,
                    steps_completed: record.succeeded_steps().len() as u32,
                });
                tracing::info!(
                    execution_id = %execution_id,
                    workflow = workflow_id,
                    duration_ms,
                    "workflow completed"
                );

                Ok(ExecutionOutcome {
                    execution_id,
                    output,
                    results: ctx.into_results(),
                    record: Some(record),
                    from_cache: false,
                })
            }
            Err(e) => {
                self.fail_run(execution_id, workflow_id, trace, &e).await;
                Err(e)
            }
        }
    }

    /// Append an error record for a failed run and announce the failure.
    async fn fail_run(&self, execution_id: Uuid, workflow_id: &str, trace: RunTrace, error: &ExecutionError) {
        let message = error.to_string();
        self.recorder.finish(trace, Some(message.clone())).await;

        self.event_bus.publish(ExecutionEvent::RunFailed {
            execution_id,
            workflow_id: workflow_id.to_string(),
            error: message,
        });
        tracing::warn!(
            execution_id = %execution_id,
            workflow = workflow_id,
            error = %error,
            "workflow failed"
        );
    }

    async fn run_entries(
        &self,
        entries: &[SequenceEntry],
        input: Value,
        ctx: &mut ExecutionContext,
        trace: &mut RunTrace,
        token: &CancellationToken,
    ) -> Result<Value, ExecutionError> {
        let mut current = input;

        for entry in entries {
            if token.is_cancelled() {
                return Err(ExecutionError::Cancelled);
            }

            tracing::debug!(execution_id = %ctx.execution_id(), entry = %entry, "processing entry");

            match entry {
                SequenceEntry::Step(step_id) => {
                    if let Some(output) = self.run_step(step_id, &current, ctx, trace, token).await? {
                        ctx.record_result(step_id, output.clone());
                        current = output;
                    }
                }
                SequenceEntry::Group(group_id) => {
                    if let Some(combined) = self.run_group(group_id, &current, ctx, trace, token).await? {
                        ctx.record_result(group_id, Value::Object(combined.clone()));
                        current = merge_group_output(current, combined);
                    }
                }
            }
        }

        Ok(current)
    }

    /// Runs one step entry. `None` means the step was skipped.
    async fn run_step(
        &self,
        step_id: &str,
        current: &Value,
        ctx: &ExecutionContext,
        trace: &mut RunTrace,
        token: &CancellationToken,
    ) -> Result<Option<Value>, ExecutionError> {
        let step = self
            .registry
            .step(step_id)
            .ok_or_else(|| ExecutionError::UnknownStep(step_id.to_string()))?;

        if !self.should_run(step_id, None, current, ctx, trace).await? {
            return Ok(None);
        }

        let policy = self
            .registry
            .retry_policy(step_id)
            .unwrap_or_else(|| self.default_retry.clone());
        let step_ctx = StepContext {
            view: ctx.view(),
            step_id: step_id.to_string(),
            group_id: None,
            attempt: 0,
            cancel: token.clone(),
        };

        let outcome = RetryHandler::run(
            &step,
            &policy,
            current,
            &step_ctx,
            self.attempt_timeout,
            &self.event_bus,
        )
        .await;
        trace.record_attempts(outcome.traces);

        match outcome.result {
            Ok(output) => Ok(Some(output)),
            Err(StepError::Cancelled) if token.is_cancelled() => Err(ExecutionError::Cancelled),
            Err(source) => Err(ExecutionError::StepExecution {
                step_id: step_id.to_string(),
                attempts: outcome.attempts,
                source,
            }),
        }
    }

    /// Runs one parallel group entry. `None` means every member was skipped.
    async fn run_group(
        &self,
        group_id: &str,
        current: &Value,
        ctx: &ExecutionContext,
        trace: &mut RunTrace,
        token: &CancellationToken,
    ) -> Result<Option<Map<String, Value>>, ExecutionError> {
        let members = self
            .registry
            .group_members(group_id)
            .ok_or_else(|| ExecutionError::UnknownStep(group_id.to_string()))?;
        let execution_id = ctx.execution_id();
        let view = ctx.view();
        let group_start = Instant::now();

        let mut runnable = Vec::with_capacity(members.len());
        for member_id in members {
            let step = self
                .registry
                .step(&member_id)
                .ok_or_else(|| ExecutionError::UnknownStep(member_id.clone()))?;
            if !self
                .should_run(&member_id, Some(group_id), current, ctx, trace)
                .await?
            {
                continue;
            }
            let policy = self
                .registry
                .retry_policy(&member_id)
                .unwrap_or_else(|| self.default_retry.clone());
            runnable.push((member_id, step, policy));
        }

        if runnable.is_empty() {
            tracing::debug!(execution_id = %execution_id, group_id, "all group members skipped");
            return Ok(None);
        }

        self.event_bus.publish(ExecutionEvent::GroupStarted {
            execution_id,
            group_id: group_id.to_string(),
            members: runnable.iter().map(|(id, _, _)| id.clone()).collect(),
        });

        let group_token = token.child_token();
        let mut join_set = JoinSet::new();
        let mut task_members: HashMap<tokio::task::Id, String> = HashMap::new();

        for (member_id, step, policy) in runnable {
            let step_ctx = StepContext {
                view: view.clone(),
                step_id: member_id.clone(),
                group_id: Some(group_id.to_string()),
                attempt: 0,
                cancel: group_token.clone(),
            };
            let input = current.clone();
            let timeout = self.attempt_timeout;
            let event_bus = self.event_bus.clone();

            let task_member = member_id.clone();
            let handle = join_set.spawn(async move {
                let outcome =
                    RetryHandler::run(&step, &policy, &input, &step_ctx, timeout, &event_bus).await;
                (member_id, outcome)
            });
            task_members.insert(handle.id(), task_member);
        }

        let mut combined = Map::new();
        let mut failure: Option<ExecutionError> = None;

        while let Some(joined) = join_set.join_next_with_id().await {
            let error = match joined {
                Ok((_, (member_id, outcome))) => {
                    trace.record_attempts(outcome.traces);
                    match outcome.result {
                        Ok(output) => {
                            combined.insert(member_id, output);
                            continue;
                        }
                        Err(source) => ExecutionError::GroupExecution {
                            group_id: group_id.to_string(),
                            step_id: member_id,
                            attempts: outcome.attempts,
                            source,
                        },
                    }
                }
                Err(join_err) => ExecutionError::GroupExecution {
                    group_id: group_id.to_string(),
                    step_id: task_members
                        .remove(&join_err.id())
                        .unwrap_or_else(|| group_id.to_string()),
                    attempts: 0,
                    source: StepError::Failed(format!("group member task failed: {join_err}")),
                },
            };

            // The first member to fail decides the group error; the rest are
            // cancelled and drained so their traces are kept.
            if failure.is_none() {
                group_token.cancel();
                failure = Some(error);
            }
        }

        if let Some(error) = failure {
            if token.is_cancelled() {
                return Err(ExecutionError::Cancelled);
            }
            return Err(error);
        }

        self.event_bus.publish(ExecutionEvent::GroupCompleted {
            execution_id,
            group_id: group_id.to_string(),
            duration_ms: group_start.elapsed().as_millis() as u64,
        });

        Ok(Some(combined))
    }

    /// Evaluate a step's condition; records the skip when it is false.
    async fn should_run(
        &self,
        step_id: &str,
        group_id: Option<&str>,
        current: &Value,
        ctx: &ExecutionContext,
        trace: &mut RunTrace,
    ) -> Result<bool, ExecutionError> {
        let Some(condition) = self.registry.condition(step_id) else {
            return Ok(true);
        };

        let run = condition
            .evaluate(current, &ctx.view(), &self.evaluator)
            .await
            .map_err(|source| ExecutionError::Condition {
                step_id: step_id.to_string(),
                source,
            })?;

        if !run {
            tracing::debug!(execution_id = %ctx.execution_id(), step_id, "condition false, skipping step");
            trace.record_skipped(step_id, group_id);
            self.event_bus.publish(ExecutionEvent::StepSkipped {
                execution_id: ctx.execution_id(),
                step_id: step_id.to_string(),
                group_id: group_id.map(str::to_string),
            });
        }

        Ok(run)
    }
}

/// Removes a run's cancellation token when the run ends, including by panic.
struct ActiveRun<'a> {
    tokens: &'a DashMap<Uuid, CancellationToken>,
    execution_id: Uuid,
}

impl Drop for ActiveRun<'_> {
    fn drop(&mut self) {
        self.tokens.remove(&self.execution_id);
    }
}

/// Cache key for a workflow invocation: hex SHA-256 of the workflow id and
/// the serialized input.
pub fn cache_key(workflow_id: &str, input: &Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(workflow_id.as_bytes());
    hasher.update([0u8]);
    hasher.update(input.to_string().as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Merge a group's combined output into the running data.
///
/// Objects are merged shallowly (group keys win); any other value is replaced.
fn merge_group_output(current: Value, combined: Map<String, Value>) -> Value {
    match current {
        Value::Object(mut base) => {
            base.extend(combined);
            Value::Object(base)
        }
        _ => Value::Object(combined),
    }
}
