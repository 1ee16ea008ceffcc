//! SQLite result cache.
//!
//! Implements `ResultCache` over the `result_cache` table. Values are stored
//! as JSON text; expired rows read as absent and are removed by
//! [`SqliteResultCache::purge_expired`].

use std::time::Duration;

use chrono::Utc;
use sqlx::Row;
use stepweave_core::repository::ResultCache;
use stepweave_types::error::RepositoryError;
use stepweave_types::execution::CacheEntry;

use super::pool::DatabasePool;
use super::{format_datetime, query_error};

pub struct SqliteResultCache {
    pool: DatabasePool,
}

impl SqliteResultCache {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }

    /// Delete expired rows. Returns how many were removed.
    pub async fn purge_expired(&self) -> Result<u64, RepositoryError> {
        let result = sqlx::query("DELETE FROM result_cache WHERE expires_at <= ?")
            .bind(format_datetime(&Utc::now()))
            .execute(&self.pool.writer)
            .await
            .map_err(query_error)?;

        if result.rows_affected() > 0 {
            tracing::debug!(removed = result.rows_affected(), "purged expired cache entries");
        }
        Ok(result.rows_affected())
    }
}

impl ResultCache for SqliteResultCache {
    async fn get(&self, key: &str) -> Result<Option<serde_json::Value>, RepositoryError> {
        let row = sqlx::query("SELECT value FROM result_cache WHERE key = ? AND expires_at > ?")
            .bind(key)
            .bind(format_datetime(&Utc::now()))
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(query_error)?;

        let Some(row) = row else {
            return Ok(None);
        };
        let value: String = row.try_get("value").map_err(query_error)?;
        serde_json::from_str(&value)
            .map(Some)
            .map_err(|e| RepositoryError::Query(format!("invalid cached JSON: {e}")))
    }

    async fn set(
        &self,
        key: &str,
        value: &serde_json::Value,
        ttl: Duration,
    ) -> Result<(), RepositoryError> {
        let now = Utc::now();
        let expires_at = CacheEntry::expiry_from(now, ttl)?;
        let value = serde_json::to_string(value).map_err(|e| RepositoryError::Query(e.to_string()))?;

        sqlx::query(
            r#"INSERT INTO result_cache (key, value, expires_at, created_at)
               VALUES (?, ?, ?, ?)
               ON CONFLICT(key) DO UPDATE SET
                   value = excluded.value,
                   expires_at = excluded.expires_at,
                   created_at = excluded.created_at"#,
        )
        .bind(key)
        .bind(&value)
        .bind(format_datetime(&expires_at))
        .bind(format_datetime(&now))
        .execute(&self.pool.writer)
        .await
        .map_err(query_error)?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sqlite::pool::tests::test_pool;
    use serde_json::json;

    #[tokio::test]
    async fn set_then_get() {
        let cache = SqliteResultCache::new(test_pool().await);

        assert!(cache.get("k").await.unwrap().is_none());
        cache
            .set("k", &json!({ "verdict": "buy", "score": 8.5 }), Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(
            cache.get("k").await.unwrap(),
            Some(json!({ "verdict": "buy", "score": 8.5 }))
        );
    }

    #[tokio::test]
    async fn out_of_range_ttl_is_rejected() {
        let cache = SqliteResultCache::new(test_pool().await);
        let err = cache
            .set("k", &json!(1), Duration::from_secs(9_000_000_000_000))
            .await
            .unwrap_err();

        assert!(matches!(err, RepositoryError::Conflict(_)));
        assert_eq!(cache.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn set_replaces_existing_value() {
        let cache = SqliteResultCache::new(test_pool().await);
        cache.set("k", &json!(1), Duration::from_secs(60)).await.unwrap();
        cache.set("k", &json!(2), Duration::from_secs(60)).await.unwrap();
        assert_eq!(cache.get("k").await.unwrap(), Some(json!(2)));
    }

    #[tokio::test]
    async fn expired_entries_read_as_absent_and_purge() {
        let cache = SqliteResultCache::new(test_pool().await);
        cache.set("old", &json!(1), Duration::ZERO).await.unwrap();
        cache.set("live", &json!(2), Duration::from_secs(60)).await.unwrap();

        assert!(cache.get("old").await.unwrap().is_none());
        assert_eq!(cache.purge_expired().await.unwrap(), 1);
        assert_eq!(cache.get("live").await.unwrap(), Some(json!(2)));
    }
}
