//! Retry policies and the stateless retry handler.
//!
//! A step attempt either succeeds, or fails and is tested against the step's
//! [`RetryPredicate`]. Retryable failures sleep an exponentially growing delay
//! and try again until `max_retries + 1` attempts were made. Every attempt
//! produces a `StepTrace`. The run's cancellation token interrupts both
//! attempts and backoff sleeps.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures_util::FutureExt;
use rand::Rng;
use serde_json::Value;
use stepweave_types::event::ExecutionEvent;
use stepweave_types::execution::{StepStatus, StepTrace};
use stepweave_types::workflow::RetrySettings;

use crate::event::EventBus;
use crate::step::{BoxStep, StepContext, StepError, StepResult};

/// Error signatures treated as transient: connection resets, timeouts,
/// 429/5xx statuses and rate-limit markers.
pub const TRANSIENT_ERROR_SIGNATURES: &[&str] = &[
    "econnreset",
    "econnrefused",
    "etimedout",
    "connection reset",
    "connection refused",
    "broken pipe",
    "timed out",
    "timeout",
    "status 429",
    "status 500",
    "status 502",
    "status 503",
    "status 504",
    "rate limit",
    "too many requests",
];

// ---------------------------------------------------------------------------
// RetryPredicate
// ---------------------------------------------------------------------------

/// Decides whether a failed attempt may be retried.
///
/// `StepError::Cancelled` is never retryable, whatever the variant.
#[derive(Clone, Default)]
pub enum RetryPredicate {
    #[default]
    Always,
    /// Retry when the error text contains one of the signatures
    /// (case-insensitive). An empty list retries everything.
    Signatures(Vec<String>),
    Custom(Arc<dyn Fn(&StepError) -> bool + Send + Sync>),
}

impl RetryPredicate {
    /// Retry only errors matching [`TRANSIENT_ERROR_SIGNATURES`].
    pub fn transient() -> Self {
        RetryPredicate::Signatures(
            TRANSIENT_ERROR_SIGNATURES
                .iter()
                .map(|s| s.to_string())
                .collect(),
        )
    }

    pub fn custom<F>(predicate: F) -> Self
    where
        F: Fn(&StepError) -> bool + Send + Sync + 'static,
    {
        RetryPredicate::Custom(Arc::new(predicate))
    }

    pub fn matches(&self, error: &StepError) -> bool {
        if error.is_cancelled() {
            return false;
        }
        match self {
            RetryPredicate::Always => true,
            RetryPredicate::Signatures(signatures) if signatures.is_empty() => true,
            RetryPredicate::Signatures(signatures) => {
                let text = error.to_string().to_lowercase();
                signatures
                    .iter()
                    .any(|sig| text.contains(&sig.to_lowercase()))
            }
            RetryPredicate::Custom(predicate) => predicate(error),
        }
    }
}

impl std::fmt::Debug for RetryPredicate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RetryPredicate::Always => f.write_str("Always"),
            RetryPredicate::Signatures(s) => f.debug_tuple("Signatures").field(s).finish(),
            RetryPredicate::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

// ---------------------------------------------------------------------------
// RetryPolicy
// ---------------------------------------------------------------------------

/// Retry schedule and predicate for one step.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub backoff_factor: f64,
    pub max_delay: Duration,
    /// Scale each delay by a uniform factor in `[0.8, 1.2)`.
    pub jitter: bool,
    /// Per-attempt deadline; `None` uses the engine default.
    pub attempt_timeout: Option<Duration>,
    pub predicate: RetryPredicate,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_settings(&RetrySettings::default())
    }
}

impl RetryPolicy {
    /// Build a policy from serializable settings.
    ///
    /// `retryable_errors` becomes a signature predicate; an empty list keeps
    /// the retry-everything behaviour.
    pub fn from_settings(settings: &RetrySettings) -> Self {
        Self {
            max_retries: settings.max_retries,
            initial_delay: Duration::from_millis(settings.initial_delay_ms),
            backoff_factor: settings.backoff_factor,
            max_delay: Duration::from_millis(settings.max_delay_ms),
            jitter: settings.jitter,
            attempt_timeout: None,
            predicate: if settings.retryable_errors.is_empty() {
                RetryPredicate::Always
            } else {
                RetryPredicate::Signatures(settings.retryable_errors.clone())
            },
        }
    }

    /// A policy that makes exactly one attempt.
    pub fn no_retry() -> Self {
        Self::default().with_max_retries(0)
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn with_backoff_factor(mut self, factor: f64) -> Self {
        self.backoff_factor = factor;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn with_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = Some(timeout);
        self
    }

    pub fn with_predicate(mut self, predicate: RetryPredicate) -> Self {
        self.predicate = predicate;
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Delay before retry number `retry` (1-based).
    ///
    /// `initial_delay * backoff_factor^(retry - 1)`, capped at `max_delay`,
    /// then scaled by jitter when enabled.
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(i32::MAX as u32) as i32;
        let base_ms = self.initial_delay.as_millis() as f64 * self.backoff_factor.max(0.0).powi(exponent);
        let capped_ms = base_ms.min(self.max_delay.as_millis() as f64);

        let delay_ms = if self.jitter {
            capped_ms * rand::rng().random_range(0.8..1.2)
        } else {
            capped_ms
        };

        Duration::from_millis(delay_ms.max(0.0) as u64)
    }
}

// ---------------------------------------------------------------------------
// RetryHandler
// ---------------------------------------------------------------------------

/// Result of running a step under its retry policy.
#[derive(Debug)]
pub struct RetryOutcome {
    pub result: Result<Value, StepError>,
    pub attempts: u32,
    pub traces: Vec<StepTrace>,
}

/// Stateless retry handler; all configuration is passed in.
pub struct RetryHandler;

impl RetryHandler {
    /// Whether another attempt should follow failed attempt `attempt` (1-based).
    pub fn should_retry(policy: &RetryPolicy, attempt: u32, error: &StepError) -> bool {
        attempt < policy.max_attempts() && policy.predicate.matches(error)
    }

    /// Run `step` until it succeeds, fails non-retryably, exhausts its
    /// attempts, or the context's cancellation token fires.
    ///
    /// `default_timeout` bounds each attempt when the policy sets no
    /// deadline of its own.
    pub async fn run(
        step: &BoxStep,
        policy: &RetryPolicy,
        input: &Value,
        ctx: &StepContext,
        default_timeout: Duration,
        events: &EventBus,
    ) -> RetryOutcome {
        let execution_id = ctx.execution_id();
        let deadline = policy.attempt_timeout.unwrap_or(default_timeout);
        let run_start = Instant::now();
        let mut traces = Vec::new();
        let mut attempt = 0;

        loop {
            attempt += 1;
            let attempt_ctx = ctx.for_attempt(attempt);

            events.publish(ExecutionEvent::StepStarted {
                execution_id,
                step_id: ctx.step_id.clone(),
                group_id: ctx.group_id.clone(),
                attempt,
            });

            let started_at = Utc::now();
            let result = tokio::select! {
                biased;
                _ = ctx.cancel.cancelled() => Err(StepError::Cancelled),
                res = tokio::time::timeout(deadline, guarded_attempt(step, input.clone(), attempt_ctx)) => {
                    res.unwrap_or(Err(StepError::Timeout(deadline)))
                }
            };

            traces.push(StepTrace {
                step_id: ctx.step_id.clone(),
                group_id: ctx.group_id.clone(),
                attempt,
                started_at,
                completed_at: Utc::now(),
                status: if result.is_ok() {
                    StepStatus::Success
                } else {
                    StepStatus::Error
                },
                error: result.as_ref().err().map(ToString::to_string),
            });

            let error = match result {
                Ok(output) => {
                    events.publish(ExecutionEvent::StepCompleted {
                        execution_id,
                        step_id: ctx.step_id.clone(),
                        attempts: attempt,
                        duration_ms: run_start.elapsed().as_millis() as u64,
                    });
                    return RetryOutcome {
                        result: Ok(output),
                        attempts: attempt,
                        traces,
                    };
                }
                Err(error) => error,
            };

            if !Self::should_retry(policy, attempt, &error) {
                tracing::warn!(
                    execution_id = %execution_id,
                    step_id = ctx.step_id.as_str(),
                    attempts = attempt,
                    error = %error,
                    "step failed"
                );
                events.publish(ExecutionEvent::StepFailed {
                    execution_id,
                    step_id: ctx.step_id.clone(),
                    attempts: attempt,
                    error: error.to_string(),
                });
                return RetryOutcome {
                    result: Err(error),
                    attempts: attempt,
                    traces,
                };
            }

            let delay = policy.delay_for_retry(attempt);
            tracing::debug!(
                execution_id = %execution_id,
                step_id = ctx.step_id.as_str(),
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "retrying step"
            );
            events.publish(ExecutionEvent::StepRetrying {
                execution_id,
                step_id: ctx.step_id.clone(),
                attempt,
                delay_ms: delay.as_millis() as u64,
                error: error.to_string(),
            });

            tokio::select! {
                biased;
                _ = ctx.cancel.cancelled() => {
                    return RetryOutcome {
                        result: Err(StepError::Cancelled),
                        attempts: attempt,
                        traces,
                    };
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}

/// Runs one attempt, turning a panic inside the step into a failed attempt.
async fn guarded_attempt(step: &BoxStep, input: Value, ctx: StepContext) -> StepResult {
    AssertUnwindSafe(step.run(input, ctx))
        .catch_unwind()
        .await
        .unwrap_or_else(|payload| {
            Err(StepError::Failed(format!("step panicked: {}", panic_message(payload.as_ref()))))
        })
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "non-string panic payload"
    }
}
