//! Observability for stepweave: tracing subscriber setup and a logger that
//! turns execution events into structured log lines.

pub mod event_log;
pub mod tracing_setup;
