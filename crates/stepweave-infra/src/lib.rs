//! Infrastructure layer for stepweave.
//!
//! Implements the storage ports defined in `stepweave-core`: SQLite result
//! cache and execution trace sink, a file-per-key result cache, plus data
//! directory resolution and `config.toml` loading.

pub mod config;
pub mod filesystem;
pub mod sqlite;
