//! Filesystem adapters for stepweave.
//!
//! Data directory layout and a file-per-key result cache.
//!
//! ```text
//! ~/.stepweave/
//!   config.toml
//!   stepweave.db
//!   cache/<key>.json
//! ```

pub mod cache;

use std::path::{Path, PathBuf};

/// Resolve the data directory from environment or platform defaults.
///
/// Priority:
/// 1. `STEPWEAVE_DATA_DIR` environment variable
/// 2. `~/.stepweave`
/// 3. `.stepweave` in the current directory
pub fn resolve_data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("STEPWEAVE_DATA_DIR") {
        return PathBuf::from(dir);
    }

    if let Some(home) = dirs::home_dir() {
        return home.join(".stepweave");
    }

    PathBuf::from(".stepweave")
}

/// SQLite URL for the database inside `data_dir`, created on first open.
pub fn database_url(data_dir: &Path) -> String {
    format!("sqlite://{}?mode=rwc", data_dir.join("stepweave.db").display())
}

/// Directory used by [`cache::FileResultCache`].
pub fn cache_dir(data_dir: &Path) -> PathBuf {
    data_dir.join("cache")
}
