//! Application state wiring the engine to its storage backends.
//!
//! The engine is generic over its cache and trace sink; AppState pins it to
//! [`CacheStore`] (chosen by `cache.backend` in `config.toml`) and the SQLite
//! trace sink, which also backs the `history` and `trace` commands.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use stepweave_core::WorkflowEngine;
use stepweave_core::WorkflowRegistry;
use stepweave_core::repository::ResultCache;
use stepweave_core::repository::memory::MemoryResultCache;
use stepweave_infra::filesystem::cache::FileResultCache;
use stepweave_infra::filesystem::{cache_dir, database_url};
use stepweave_infra::sqlite::cache::SqliteResultCache;
use stepweave_infra::sqlite::pool::DatabasePool;
use stepweave_infra::sqlite::trace::SqliteTraceSink;
use stepweave_types::config::{CacheBackend, EngineConfig};
use stepweave_types::error::RepositoryError;

use crate::catalog::register_demo_catalog;

pub type Engine = WorkflowEngine<CacheStore, SqliteTraceSink>;

/// Result cache selected at startup.
pub enum CacheStore {
    Sqlite(SqliteResultCache),
    File(FileResultCache),
    Memory(MemoryResultCache),
}

impl CacheStore {
    pub fn backend(&self) -> CacheBackend {
        match self {
            CacheStore::Sqlite(_) => CacheBackend::Sqlite,
            CacheStore::File(_) => CacheBackend::File,
            CacheStore::Memory(_) => CacheBackend::Memory,
        }
    }

    /// Remove expired entries where the backend supports it eagerly.
    pub async fn purge_expired(&self) -> Result<Option<u64>, RepositoryError> {
        match self {
            CacheStore::Sqlite(cache) => cache.purge_expired().await.map(Some),
            CacheStore::File(_) | CacheStore::Memory(_) => Ok(None),
        }
    }
}

impl ResultCache for CacheStore {
    async fn get(&self, key: &str) -> Result<Option<Value>, RepositoryError> {
        match self {
            CacheStore::Sqlite(cache) => cache.get(key).await,
            CacheStore::File(cache) => cache.get(key).await,
            CacheStore::Memory(cache) => cache.get(key).await,
        }
    }

    async fn set(&self, key: &str, value: &Value, ttl: Duration) -> Result<(), RepositoryError> {
        match self {
            CacheStore::Sqlite(cache) => cache.set(key, value, ttl).await,
            CacheStore::File(cache) => cache.set(key, value, ttl).await,
            CacheStore::Memory(cache) => cache.set(key, value, ttl).await,
        }
    }
}

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<Engine>,
    pub config: EngineConfig,
    pub data_dir: PathBuf,
}

impl AppState {
    /// Open the database, pick the cache backend and register the demo catalog.
    pub async fn init(data_dir: PathBuf, config: EngineConfig) -> anyhow::Result<Self> {
        tokio::fs::create_dir_all(&data_dir).await?;

        let db_pool = DatabasePool::new(&database_url(&data_dir)).await?;

        let cache = match config.cache.backend {
            CacheBackend::Sqlite => CacheStore::Sqlite(SqliteResultCache::new(db_pool.clone())),
            CacheBackend::File => CacheStore::File(FileResultCache::new(cache_dir(&data_dir))),
            CacheBackend::Memory => CacheStore::Memory(MemoryResultCache::new()),
        };
        let sink = SqliteTraceSink::new(db_pool.clone());

        let registry = Arc::new(WorkflowRegistry::new());
        register_demo_catalog(&registry)?;

        let engine = WorkflowEngine::new(registry, Arc::new(cache), Arc::new(sink)).with_config(&config);
        tracing::debug!(
            data_dir = %data_dir.display(),
            cache = ?config.cache.backend,
            "application state initialized"
        );

        Ok(Self {
            engine: Arc::new(engine),
            config,
            data_dir,
        })
    }

    pub fn traces(&self) -> &SqliteTraceSink {
        self.engine.trace_sink()
    }
}
