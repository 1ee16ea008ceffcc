//! Execution tracking types: per-run records, per-attempt step traces, and
//! cached workflow outputs.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::RepositoryError;

// ---------------------------------------------------------------------------
// Statuses
// ---------------------------------------------------------------------------

/// Overall status of a workflow run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Success,
    Error,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Success => "success",
            RunStatus::Error => "error",
        }
    }
}

impl std::str::FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(RunStatus::Running),
            "success" => Ok(RunStatus::Success),
            "error" => Ok(RunStatus::Error),
            other => Err(format!("invalid run status: '{other}'")),
        }
    }
}

/// Outcome of one step attempt (or of a skipped step).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Success,
    Error,
    Skipped,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepStatus::Success => "success",
            StepStatus::Error => "error",
            StepStatus::Skipped => "skipped",
        }
    }
}

impl std::str::FromStr for StepStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(StepStatus::Success),
            "error" => Ok(StepStatus::Error),
            "skipped" => Ok(StepStatus::Skipped),
            other => Err(format!("invalid step status: '{other}'")),
        }
    }
}

// ---------------------------------------------------------------------------
// StepTrace
// ---------------------------------------------------------------------------

/// One entry of a run's per-step trace.
///
/// Every attempt of a step produces its own entry; a skipped step produces a
/// single entry with `attempt == 0`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepTrace {
    pub step_id: String,
    /// Parallel group the step ran in, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<String>,
    /// 1-based attempt number (0 for skipped steps).
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub status: StepStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StepTrace {
    /// Trace entry for a step whose condition evaluated to false.
    pub fn skipped(step_id: &str, group_id: Option<&str>) -> Self {
        let now = Utc::now();
        Self {
            step_id: step_id.to_string(),
            group_id: group_id.map(str::to_string),
            attempt: 0,
            started_at: now,
            completed_at: now,
            status: StepStatus::Skipped,
            error: None,
        }
    }

    /// Wall-clock duration of the attempt in milliseconds.
    pub fn duration_ms(&self) -> i64 {
        (self.completed_at - self.started_at).num_milliseconds()
    }
}

// ---------------------------------------------------------------------------
// ExecutionRecord
// ---------------------------------------------------------------------------

/// Append-only trace of one workflow run.
///
/// Built in memory while the run progresses and written to the trace sink
/// exactly once, after the run finishes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub execution_id: Uuid,
    pub workflow_id: String,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub steps: Vec<StepTrace>,
    pub status: RunStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ExecutionRecord {
    /// Steps that finished successfully, in trace order (retries collapse).
    pub fn succeeded_steps(&self) -> Vec<&str> {
        self.steps
            .iter()
            .filter(|t| t.status == StepStatus::Success)
            .map(|t| t.step_id.as_str())
            .collect()
    }

    /// Steps recorded as skipped.
    pub fn skipped_steps(&self) -> Vec<&str> {
        self.steps
            .iter()
            .filter(|t| t.status == StepStatus::Skipped)
            .map(|t| t.step_id.as_str())
            .collect()
    }

    /// Number of attempts recorded for a step.
    pub fn attempts_for(&self, step_id: &str) -> usize {
        self.steps
            .iter()
            .filter(|t| t.step_id == step_id && t.status != StepStatus::Skipped)
            .count()
    }
}

// ---------------------------------------------------------------------------
// CacheEntry
// ---------------------------------------------------------------------------

/// A cached final workflow output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: String,
    pub value: serde_json::Value,
    pub expires_at: DateTime<Utc>,
}

impl CacheEntry {
    pub fn is_expired(&self) -> bool {
        self.expires_at <= Utc::now()
    }

    /// Expiry instant for an entry written at `now` with lifetime `ttl`.
    ///
    /// Fails with `Conflict` when the instant is outside chrono's range.
    pub fn expiry_from(now: DateTime<Utc>, ttl: Duration) -> Result<DateTime<Utc>, RepositoryError> {
        chrono::Duration::from_std(ttl)
            .ok()
            .and_then(|ttl| now.checked_add_signed(ttl))
            .ok_or_else(|| RepositoryError::Conflict(format!("invalid ttl: {}s", ttl.as_secs())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    fn trace(step_id: &str, attempt: u32, status: StepStatus) -> StepTrace {
        let now = Utc::now();
        StepTrace {
            step_id: step_id.to_string(),
            group_id: None,
            attempt,
            started_at: now,
            completed_at: now,
            status,
            error: None,
        }
    }

    #[test]
    fn status_strings_parse_back() {
        for status in [RunStatus::Running, RunStatus::Success, RunStatus::Error] {
            assert_eq!(status.as_str().parse::<RunStatus>().unwrap(), status);
        }
        for status in [StepStatus::Success, StepStatus::Error, StepStatus::Skipped] {
            assert_eq!(status.as_str().parse::<StepStatus>().unwrap(), status);
        }
        assert!("paused".parse::<RunStatus>().is_err());
    }

    #[test]
    fn record_summaries() {
        let record = ExecutionRecord {
            execution_id: Uuid::now_v7(),
            workflow_id: "research".to_string(),
            started_at: Utc::now(),
            completed_at: Some(Utc::now()),
            steps: vec![
                trace("fetch", 1, StepStatus::Error),
                trace("fetch", 2, StepStatus::Success),
                StepTrace::skipped("notify", None),
            ],
            status: RunStatus::Success,
            error: None,
        };

        assert_eq!(record.succeeded_steps(), vec!["fetch"]);
        assert_eq!(record.skipped_steps(), vec!["notify"]);
        assert_eq!(record.attempts_for("fetch"), 2);
        assert_eq!(record.attempts_for("notify"), 0);
    }

    #[test]
    fn skipped_trace_has_zero_attempt() {
        let t = StepTrace::skipped("b", Some("g"));
        assert_eq!(t.attempt, 0);
        assert_eq!(t.group_id.as_deref(), Some("g"));
        assert_eq!(t.status, StepStatus::Skipped);
        assert_eq!(t.duration_ms(), 0);
    }

    #[test]
    fn cache_entry_expiry() {
        let live = CacheEntry {
            key: "k".to_string(),
            value: serde_json::json!(1),
            expires_at: Utc::now() + ChronoDuration::seconds(60),
        };
        let stale = CacheEntry {
            expires_at: Utc::now() - ChronoDuration::seconds(1),
            ..live.clone()
        };
        assert!(!live.is_expired());
        assert!(stale.is_expired());
    }

    #[test]
    fn expiry_rejects_out_of_range_ttl() {
        let now = Utc::now();
        assert_eq!(
            CacheEntry::expiry_from(now, Duration::from_secs(60)).unwrap(),
            now + ChronoDuration::seconds(60)
        );
        assert!(matches!(
            CacheEntry::expiry_from(now, Duration::from_secs(9_000_000_000_000)),
            Err(RepositoryError::Conflict(_))
        ));
        assert!(CacheEntry::expiry_from(now, Duration::MAX).is_err());
    }
}
