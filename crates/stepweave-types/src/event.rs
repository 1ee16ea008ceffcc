//! Event types for the execution event bus.
//!
//! `ExecutionEvent` is broadcast while workflows run. All variants are
//! Clone + Send + Sync for use with tokio broadcast channels.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Events emitted during workflow execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExecutionEvent {
    /// A run resolved its sequence and started executing.
    RunStarted {
        execution_id: Uuid,
        workflow_id: String,
        entries: usize,
    },

    /// A `prefer_cache` run was answered from the result cache.
    CacheHit { workflow_id: String, key: String },

    /// A step attempt started.
    StepStarted {
        execution_id: Uuid,
        step_id: String,
        group_id: Option<String>,
        attempt: u32,
    },

    /// A step attempt failed and will be retried after `delay_ms`.
    StepRetrying {
        execution_id: Uuid,
        step_id: String,
        attempt: u32,
        delay_ms: u64,
        error: String,
    },

    /// A step's condition evaluated to false.
    StepSkipped {
        execution_id: Uuid,
        step_id: String,
        group_id: Option<String>,
    },

    /// A step completed successfully.
    StepCompleted {
        execution_id: Uuid,
        step_id: String,
        attempts: u32,
        duration_ms: u64,
    },

    /// A step failed after exhausting its retry policy.
    StepFailed {
        execution_id: Uuid,
        step_id: String,
        attempts: u32,
        error: String,
    },

    /// A parallel group fanned out.
    GroupStarted {
        execution_id: Uuid,
        group_id: String,
        members: Vec<String>,
    },

    /// A parallel group joined successfully.
    GroupCompleted {
        execution_id: Uuid,
        group_id: String,
        duration_ms: u64,
    },

    /// A run completed successfully.
    RunCompleted {
        execution_id: Uuid,
        workflow_id: String,
        duration_ms: u64,
        steps_completed: u32,
    },

    /// A run failed.
    RunFailed {
        execution_id: Uuid,
        workflow_id: String,
        error: String,
    },
}

impl ExecutionEvent {
    /// Returns the execution id from variants that carry one.
    pub fn execution_id(&self) -> Option<Uuid> {
        match self {
            ExecutionEvent::CacheHit { .. } => None,
            ExecutionEvent::RunStarted { execution_id, .. }
            | ExecutionEvent::StepStarted { execution_id, .. }
            | ExecutionEvent::StepRetrying { execution_id, .. }
            | ExecutionEvent::StepSkipped { execution_id, .. }
            | ExecutionEvent::StepCompleted { execution_id, .. }
            | ExecutionEvent::StepFailed { execution_id, .. }
            | ExecutionEvent::GroupStarted { execution_id, .. }
            | ExecutionEvent::GroupCompleted { execution_id, .. }
            | ExecutionEvent::RunCompleted { execution_id, .. }
            | ExecutionEvent::RunFailed { execution_id, .. } => Some(*execution_id),
        }
    }
}
