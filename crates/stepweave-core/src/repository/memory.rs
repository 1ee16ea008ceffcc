//! In-process cache and trace implementations.

use std::sync::Mutex;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use serde_json::Value;
use stepweave_types::error::RepositoryError;
use stepweave_types::execution::{CacheEntry, ExecutionRecord};
use uuid::Uuid;

use super::{ResultCache, TraceSink};

/// DashMap-backed result cache with lazy expiry.
#[derive(Debug, Default)]
pub struct MemoryResultCache {
    entries: DashMap<String, CacheEntry>,
}

impl MemoryResultCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl ResultCache for MemoryResultCache {
    async fn get(&self, key: &str) -> Result<Option<Value>, RepositoryError> {
        if let Some(entry) = self.entries.get(key)
            && !entry.is_expired()
        {
            return Ok(Some(entry.value.clone()));
        }
        // Only drop the entry if it is still expired; a concurrent `set` may
        // have replaced it since the read.
        self.entries.remove_if(key, |_, entry| entry.is_expired());
        Ok(None)
    }

    async fn set(&self, key: &str, value: &Value, ttl: Duration) -> Result<(), RepositoryError> {
        let expires_at = CacheEntry::expiry_from(Utc::now(), ttl)?;
        self.entries.insert(
            key.to_string(),
            CacheEntry {
                key: key.to_string(),
                value: value.clone(),
                expires_at,
            },
        );
        Ok(())
    }
}

/// Cache that never hits and discards writes.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopResultCache;

impl ResultCache for NoopResultCache {
    async fn get(&self, _key: &str) -> Result<Option<Value>, RepositoryError> {
        Ok(None)
    }

    async fn set(&self, _key: &str, _value: &Value, _ttl: Duration) -> Result<(), RepositoryError> {
        Ok(())
    }
}

/// Keeps every appended record in memory, in append order.
#[derive(Debug, Default)]
pub struct MemoryTraceSink {
    records: Mutex<Vec<ExecutionRecord>>,
}

impl MemoryTraceSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<ExecutionRecord> {
        self.records
            .lock()
            .map(|records| records.clone())
            .unwrap_or_default()
    }

    pub fn get(&self, execution_id: Uuid) -> Option<ExecutionRecord> {
        self.records()
            .into_iter()
            .find(|r| r.execution_id == execution_id)
    }
}

impl TraceSink for MemoryTraceSink {
    async fn append(&self, record: &ExecutionRecord) -> Result<(), RepositoryError> {
        self.records
            .lock()
            .map_err(|_| RepositoryError::Conflict("trace sink lock poisoned".to_string()))?
            .push(record.clone());
        Ok(())
    }
}
