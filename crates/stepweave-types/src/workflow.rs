//! Workflow shape types for stepweave.
//!
//! A workflow is an ordered sequence of entries, each naming either a single
//! step or a parallel group. Retry settings are the serializable half of a
//! retry policy (the predicate lives in `stepweave-core`).

use std::fmt;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Sequence entries
// ---------------------------------------------------------------------------

/// One entry of a workflow sequence.
///
/// Steps and parallel groups share one id namespace in raw sequences; an
/// entry carries the resolved kind so the engine never has to guess.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum SequenceEntry {
    /// Run a single registered step.
    Step(String),
    /// Fan out a registered parallel group.
    Group(String),
}

impl SequenceEntry {
    /// The step or group id this entry names.
    pub fn id(&self) -> &str {
        match self {
            SequenceEntry::Step(id) | SequenceEntry::Group(id) => id,
        }
    }

    pub fn is_group(&self) -> bool {
        matches!(self, SequenceEntry::Group(_))
    }
}

impl fmt::Display for SequenceEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SequenceEntry::Step(id) => write!(f, "step '{id}'"),
            SequenceEntry::Group(id) => write!(f, "group '{id}'"),
        }
    }
}

/// Whether a registered workflow has a fixed or a runtime-resolved sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowKind {
    Static,
    Dynamic,
}

/// Listing entry for a registered workflow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowSummary {
    pub id: String,
    pub kind: WorkflowKind,
    /// Raw sequence for static workflows; empty for dynamic ones.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sequence: Vec<String>,
}

// ---------------------------------------------------------------------------
// Retry settings
// ---------------------------------------------------------------------------

/// Serializable retry settings.
///
/// Loaded from `config.toml` (`[default_retry]`) to build the process-wide
/// default policy, and usable as a starting point for per-step policies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrySettings {
    /// Retries after the first attempt (total attempts = `max_retries + 1`).
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Delay before the first retry, in milliseconds.
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    /// Multiplier applied to the delay after every retry.
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,
    /// Upper bound for a single backoff delay, in milliseconds.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Scale each delay by a uniform factor in `[0.8, 1.2)`.
    #[serde(default)]
    pub jitter: bool,
    /// Error signatures that are retryable. Empty means every error is.
    #[serde(default)]
    pub retryable_errors: Vec<String>,
}

fn default_max_retries() -> u32 {
    3
}

fn default_initial_delay_ms() -> u64 {
    1_000
}

fn default_backoff_factor() -> f64 {
    2.0
}

fn default_max_delay_ms() -> u64 {
    60_000
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_delay_ms: default_initial_delay_ms(),
            backoff_factor: default_backoff_factor(),
            max_delay_ms: default_max_delay_ms(),
            jitter: false,
            retryable_errors: Vec::new(),
        }
    }
}
