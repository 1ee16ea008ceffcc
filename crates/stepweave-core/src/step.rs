//! Step abstraction.
//!
//! A step is a named unit of async work: it takes the running data value plus
//! a [`StepContext`] and returns new data. Implementors use native async fn
//! in traits; [`BoxStep`] provides the type-erased handle the registry stores.
//!
//! Dynamic dispatch follows the blanket-impl pattern:
//! 1. `Step` uses RPITIT and is not object safe
//! 2. `StepDyn` is the object-safe twin with boxed futures
//! 3. `BoxStep` wraps `Arc<dyn StepDyn>` and delegates

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::context::{CallerContext, ContextView};

// ---------------------------------------------------------------------------
// StepError
// ---------------------------------------------------------------------------

/// Error returned by a step attempt.
///
/// The `Display` text is what retry signatures are matched against.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StepError {
    #[error("{0}")]
    Failed(String),

    /// HTTP-like failure status from a downstream service.
    #[error("status {code}: {message}")]
    Status { code: u16, message: String },

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("attempt timed out after {}ms", .0.as_millis())]
    Timeout(Duration),

    #[error("cancelled")]
    Cancelled,
}

impl StepError {
    pub fn failed(message: impl Into<String>) -> Self {
        StepError::Failed(message.into())
    }

    pub fn status(code: u16, message: impl Into<String>) -> Self {
        StepError::Status {
            code,
            message: message.into(),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, StepError::Cancelled)
    }
}

impl From<anyhow::Error> for StepError {
    fn from(err: anyhow::Error) -> Self {
        StepError::Failed(format!("{err:#}"))
    }
}

impl From<serde_json::Error> for StepError {
    fn from(err: serde_json::Error) -> Self {
        StepError::Failed(format!("invalid step data: {err}"))
    }
}

pub type StepResult = Result<Value, StepError>;

// ---------------------------------------------------------------------------
// StepContext
// ---------------------------------------------------------------------------

/// What a running step can see about its invocation.
#[derive(Debug, Clone)]
pub struct StepContext {
    /// Snapshot of the run as it stood when the step (or its group) started.
    pub view: ContextView,
    pub step_id: String,
    pub group_id: Option<String>,
    /// 1-based attempt number.
    pub attempt: u32,
    pub cancel: CancellationToken,
}

impl StepContext {
    pub fn workflow_id(&self) -> &str {
        &self.view.workflow_id
    }

    pub fn execution_id(&self) -> Uuid {
        self.view.execution_id
    }

    /// Output of an earlier step or group in this run.
    pub fn result(&self, id: &str) -> Option<&Value> {
        self.view.result(id)
    }

    pub fn caller_context(&self) -> &CallerContext {
        &self.view.caller_context
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub(crate) fn for_attempt(&self, attempt: u32) -> Self {
        Self {
            attempt,
            ..self.clone()
        }
    }
}

// ---------------------------------------------------------------------------
// Step traits
// ---------------------------------------------------------------------------

/// A unit of async work registered under an id.
pub trait Step: Send + Sync {
    fn run(
        &self,
        input: Value,
        ctx: StepContext,
    ) -> impl Future<Output = StepResult> + Send;
}

/// Object-safe version of [`Step`] with boxed futures.
pub trait StepDyn: Send + Sync {
    fn run_boxed<'a>(
        &'a self,
        input: Value,
        ctx: StepContext,
    ) -> Pin<Box<dyn Future<Output = StepResult> + Send + 'a>>;
}

impl<T: Step> StepDyn for T {
    fn run_boxed<'a>(
        &'a self,
        input: Value,
        ctx: StepContext,
    ) -> Pin<Box<dyn Future<Output = StepResult> + Send + 'a>> {
        Box::pin(self.run(input, ctx))
    }
}

/// Type-erased, cheaply clonable step handle.
#[derive(Clone)]
pub struct BoxStep {
    inner: Arc<dyn StepDyn>,
}

impl BoxStep {
    pub fn new<T: Step + 'static>(step: T) -> Self {
        Self {
            inner: Arc::new(step),
        }
    }

    pub async fn run(&self, input: Value, ctx: StepContext) -> StepResult {
        self.inner.run_boxed(input, ctx).await
    }
}

impl std::fmt::Debug for BoxStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoxStep").finish_non_exhaustive()
    }
}

/// Adapter that turns an async closure into a [`Step`].
pub struct FnStep<F> {
    f: F,
}

impl<F, Fut> Step for FnStep<F>
where
    F: Fn(Value, StepContext) -> Fut + Send + Sync,
    Fut: Future<Output = StepResult> + Send,
{
    fn run(
        &self,
        input: Value,
        ctx: StepContext,
    ) -> impl Future<Output = StepResult> + Send {
        (self.f)(input, ctx)
    }
}

/// Box an async closure as a step.
pub fn step_fn<F, Fut>(f: F) -> BoxStep
where
    F: Fn(Value, StepContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = StepResult> + Send + 'static,
{
    BoxStep::new(FnStep { f })
}
