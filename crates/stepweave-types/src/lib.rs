//! Shared domain types for stepweave.
//!
//! This crate contains the serializable types used across the workflow core:
//! sequence entries, retry settings, execution records, execution events,
//! engine configuration, and the repository error type.
//!
//! Zero infrastructure dependencies -- only serde, uuid, chrono, thiserror.

pub mod config;
pub mod error;
pub mod event;
pub mod execution;
pub mod workflow;
