//! Repository trait definitions (ports).
//!
//! The engine reaches storage only through these traits. The infrastructure
//! layer (stepweave-infra) implements them with SQLite and the filesystem;
//! `memory` holds in-process implementations.
//!
//! Uses native async fn in traits (Rust 2024 edition, no async_trait macro).

pub mod memory;

use std::time::Duration;

use stepweave_types::error::RepositoryError;
use stepweave_types::execution::ExecutionRecord;

/// TTL cache of final workflow outputs, keyed by workflow id and input.
pub trait ResultCache: Send + Sync {
    /// Fetch an unexpired value. Expired entries read as `None`.
    fn get(
        &self,
        key: &str,
    ) -> impl std::future::Future<Output = Result<Option<serde_json::Value>, RepositoryError>> + Send;

    /// Store a value for `ttl`, replacing any previous entry.
    fn set(
        &self,
        key: &str,
        value: &serde_json::Value,
        ttl: Duration,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;
}

/// Append-only sink for finished execution records.
pub trait TraceSink: Send + Sync {
    fn append(
        &self,
        record: &ExecutionRecord,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;
}
