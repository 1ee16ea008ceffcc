//! Execution trace recording.
//!
//! A [`RunTrace`] accumulates step traces in memory while a run progresses;
//! [`TraceRecorder::finish`] seals it into an `ExecutionRecord` and appends
//! it to the sink exactly once. Sink failures are logged and swallowed so a
//! broken audit backend never fails a run.

use std::sync::Arc;

use chrono::Utc;
use stepweave_types::execution::{ExecutionRecord, RunStatus, StepTrace};
use uuid::Uuid;

use crate::repository::TraceSink;

/// In-progress trace for one run.
#[derive(Debug, Clone)]
pub struct RunTrace {
    record: ExecutionRecord,
}

impl RunTrace {
    pub fn new(execution_id: Uuid, workflow_id: &str) -> Self {
        Self {
            record: ExecutionRecord {
                execution_id,
                workflow_id: workflow_id.to_string(),
                started_at: Utc::now(),
                completed_at: None,
                steps: Vec::new(),
                status: RunStatus::Running,
                error: None,
            },
        }
    }

    /// Append the per-attempt traces of one step.
    pub fn record_attempts(&mut self, traces: Vec<StepTrace>) {
        self.record.steps.extend(traces);
    }

    pub fn record_skipped(&mut self, step_id: &str, group_id: Option<&str>) {
        self.record.steps.push(StepTrace::skipped(step_id, group_id));
    }

    pub fn steps(&self) -> &[StepTrace] {
        &self.record.steps
    }

    fn seal(mut self, error: Option<String>) -> ExecutionRecord {
        self.record.completed_at = Some(Utc::now());
        self.record.status = if error.is_some() {
            RunStatus::Error
        } else {
            RunStatus::Success
        };
        self.record.error = error;
        self.record
    }
}

/// Writes finished run traces to a [`TraceSink`].
///
/// Generic over `S: TraceSink` so it works with any backend.
pub struct TraceRecorder<S: TraceSink> {
    sink: Arc<S>,
}

impl<S: TraceSink> TraceRecorder<S> {
    pub fn new(sink: Arc<S>) -> Self {
        Self { sink }
    }

    pub fn sink(&self) -> &Arc<S> {
        &self.sink
    }

    /// Seal the trace with its final status and append it to the sink.
    ///
    /// `error` is `None` for a successful run.
    pub async fn finish(&self, trace: RunTrace, error: Option<String>) -> ExecutionRecord {
        let record = trace.seal(error);

        match self.sink.append(&record).await {
            Ok(()) => tracing::debug!(
                execution_id = %record.execution_id,
                workflow = record.workflow_id.as_str(),
                status = record.status.as_str(),
                steps = record.steps.len(),
                "appended execution record"
            ),
            Err(e) => tracing::warn!(
                execution_id = %record.execution_id,
                workflow = record.workflow_id.as_str(),
                error = %e,
                "failed to append execution record"
            ),
        }

        record
    }
}

impl<S: TraceSink> Clone for TraceRecorder<S> {
    fn clone(&self) -> Self {
        Self {
            sink: Arc::clone(&self.sink),
        }
    }
}
