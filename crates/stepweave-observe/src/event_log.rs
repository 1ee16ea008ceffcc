//! Execution event logger.
//!
//! Subscribes to the engine's event bus and re-emits every
//! [`ExecutionEvent`] as a structured `debug` event under the
//! `stepweave::events` target. Enable with
//! `RUST_LOG=stepweave::events=debug`.

use stepweave_types::event::ExecutionEvent;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

pub const EVENT_TARGET: &str = "stepweave::events";

/// Forward events until the bus closes.
pub fn spawn_event_logger(mut rx: broadcast::Receiver<ExecutionEvent>) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => log_event(&event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!(skipped = n, "event logger lagged, skipping {n} events");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

/// Emit one event as a structured log line.
pub fn log_event(event: &ExecutionEvent) {
    match event {
        ExecutionEvent::RunStarted {
            execution_id,
            workflow_id,
            entries,
        } => tracing::debug!(target: EVENT_TARGET, %execution_id, workflow = %workflow_id, entries, "run started"),
        ExecutionEvent::CacheHit { workflow_id, key } => {
            tracing::debug!(target: EVENT_TARGET, workflow = %workflow_id, key = %key, "served from cache")
        }
        ExecutionEvent::StepStarted {
            execution_id,
            step_id,
            group_id,
            attempt,
        } => tracing::debug!(target: EVENT_TARGET,
            %execution_id,
            step_id = %step_id,
            group = group_id.as_deref().unwrap_or("-"),
            attempt,
            "step started"
        ),
        ExecutionEvent::StepRetrying {
            execution_id,
            step_id,
            attempt,
            delay_ms,
            error,
        } => tracing::debug!(target: EVENT_TARGET,
            %execution_id,
            step_id = %step_id,
            attempt,
            delay_ms,
            error = %error,
            "step retrying"
        ),
        ExecutionEvent::StepSkipped {
            execution_id,
            step_id,
            group_id,
        } => tracing::debug!(target: EVENT_TARGET,
            %execution_id,
            step_id = %step_id,
            group = group_id.as_deref().unwrap_or("-"),
            "step skipped"
        ),
        ExecutionEvent::StepCompleted {
            execution_id,
            step_id,
            attempts,
            duration_ms,
        } => tracing::debug!(target: EVENT_TARGET, %execution_id, step_id = %step_id, attempts, duration_ms, "step completed"),
        ExecutionEvent::StepFailed {
            execution_id,
            step_id,
            attempts,
            error,
        } => tracing::debug!(target: EVENT_TARGET, %execution_id, step_id = %step_id, attempts, error = %error, "step failed"),
        ExecutionEvent::GroupStarted {
            execution_id,
            group_id,
            members,
        } => tracing::debug!(target: EVENT_TARGET, %execution_id, group = %group_id, members = members.len(), "group started"),
        ExecutionEvent::GroupCompleted {
            execution_id,
            group_id,
            duration_ms,
        } => tracing::debug!(target: EVENT_TARGET, %execution_id, group = %group_id, duration_ms, "group completed"),
        ExecutionEvent::RunCompleted {
            execution_id,
            workflow_id,
            duration_ms,
            steps_completed,
        } => tracing::debug!(target: EVENT_TARGET,
            %execution_id,
            workflow = %workflow_id,
            duration_ms,
            steps_completed,
            "run completed"
        ),
        ExecutionEvent::RunFailed {
            execution_id,
            workflow_id,
            error,
        } => tracing::debug!(target: EVENT_TARGET, %execution_id, workflow = %workflow_id, error = %error, "run failed"),
    }
}
