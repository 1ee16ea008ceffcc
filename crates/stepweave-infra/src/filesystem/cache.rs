//! File-per-key result cache.
//!
//! Each entry is a JSON-serialized [`CacheEntry`] at `{dir}/{key}.json`.
//! Writes go through a uniquely named temp file and a rename, so readers never
//! see a partial entry. Expired files read as absent and are removed lazily.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use stepweave_core::repository::ResultCache;
use stepweave_types::error::RepositoryError;
use stepweave_types::execution::CacheEntry;
use uuid::Uuid;

pub struct FileResultCache {
    dir: PathBuf,
}

impl FileResultCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn entry_path(&self, key: &str) -> Result<PathBuf, RepositoryError> {
        let valid = !key.is_empty()
            && key
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(RepositoryError::Query(format!("invalid cache key: '{key}'")));
        }
        Ok(self.dir.join(format!("{key}.json")))
    }

    async fn remove_quietly(path: &Path) {
        if let Err(e) = tokio::fs::remove_file(path).await
            && e.kind() != std::io::ErrorKind::NotFound
        {
            tracing::warn!(path = %path.display(), error = %e, "failed to remove cache file");
        }
    }
}

impl ResultCache for FileResultCache {
    async fn get(&self, key: &str) -> Result<Option<Value>, RepositoryError> {
        let path = self.entry_path(key)?;

        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(RepositoryError::Io(e.to_string())),
        };

        let entry: CacheEntry = match serde_json::from_str(&content) {
            Ok(entry) => entry,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "discarding corrupt cache file");
                Self::remove_quietly(&path).await;
                return Ok(None);
            }
        };

        if entry.is_expired() {
            Self::remove_quietly(&path).await;
            return Ok(None);
        }
        Ok(Some(entry.value))
    }

    async fn set(&self, key: &str, value: &Value, ttl: Duration) -> Result<(), RepositoryError> {
        let path = self.entry_path(key)?;
        let entry = CacheEntry {
            key: key.to_string(),
            value: value.clone(),
            expires_at: CacheEntry::expiry_from(Utc::now(), ttl)?,
        };
        let json = serde_json::to_vec(&entry)
            .map_err(|e| RepositoryError::Query(format!("failed to serialize cache entry: {e}")))?;

        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| RepositoryError::Io(e.to_string()))?;

        // Per-write temp name; concurrent writers of one key each rename
        // their own file and the last rename wins.
        let tmp = self.dir.join(format!("{key}.{}.tmp", Uuid::now_v7()));
        if let Err(e) = tokio::fs::write(&tmp, json).await {
            Self::remove_quietly(&tmp).await;
            return Err(RepositoryError::Io(e.to_string()));
        }
        if let Err(e) = tokio::fs::rename(&tmp, &path).await {
            Self::remove_quietly(&tmp).await;
            return Err(RepositoryError::Io(e.to_string()));
        }
        Ok(())
    }
}
