//! Workflow orchestration core for stepweave.
//!
//! Steps are registered by id, grouped into parallel groups, and sequenced
//! into static or dynamic workflows. The engine walks a resolved sequence,
//! applying conditions and retry policies, and reports every run to a trace
//! sink. Storage is reached only through the traits in `repository`; the
//! infrastructure layer (stepweave-infra) implements them.

pub mod condition;
pub mod context;
pub mod engine;
pub mod event;
pub mod expression;
pub mod mapping;
pub mod registry;
pub mod repository;
pub mod retry;
pub mod step;
pub mod trace;

pub use condition::Condition;
pub use context::{CallerContext, ContextView, ExecutionContext};
pub use engine::{ExecuteOptions, ExecutionError, ExecutionOutcome, WorkflowEngine};
pub use registry::{RegistryError, WorkflowRegistry};
pub use retry::{RetryPolicy, RetryPredicate};
pub use step::{step_fn, BoxStep, Step, StepContext, StepError};
