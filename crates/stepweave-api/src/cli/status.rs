//! `status` and `purge-cache` commands.

use anyhow::{Result, anyhow};
use console::style;
use stepweave_infra::filesystem::database_url;

use crate::state::AppState;

/// Show where data lives and the effective configuration.
pub async fn status(state: &AppState, json: bool) -> Result<()> {
    let config = &state.config;
    let workflows = state.engine.list_workflows();
    let recent = state
        .traces()
        .list_records(None, 1)
        .await
        .map_err(|e| anyhow!("Failed to query execution records: {e}"))?;

    if json {
        let status = serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "data_dir": state.data_dir.display().to_string(),
            "database": database_url(&state.data_dir),
            "workflows": workflows,
            "last_run": recent.first().map(|r| r.execution_id.to_string()),
            "config": config,
        });
        println!("{}", serde_json::to_string_pretty(&status)?);
        return Ok(());
    }

    println!();
    println!("  {} stepweave v{}", style("*").bold(), env!("CARGO_PKG_VERSION"));
    println!();

    println!("  {}", style("── Workflows ──").dim());
    println!("  Registered: {}", style(workflows.len()).bold());
    if let Some(last) = recent.first() {
        println!(
            "  Last run:   {} ({}, {})",
            style(super::short_id(&last.execution_id)).cyan(),
            last.workflow_id,
            last.status.as_str()
        );
    }
    println!();

    println!("  {}", style("── Engine ──").dim());
    println!(
        "  Default retry:   {} retries, {}ms initial delay, x{} backoff",
        config.default_retry.max_retries,
        config.default_retry.initial_delay_ms,
        config.default_retry.backoff_factor
    );
    println!("  Attempt timeout: {}s", config.execution.attempt_timeout_secs);
    println!(
        "  Result cache:    {:?}, ttl {}s",
        state.engine.cache().backend(),
        config.cache.ttl_secs
    );
    println!();

    println!("  {}", style("── System ──").dim());
    println!("  Data dir: {}", style(state.data_dir.display()).dim());
    println!("  Database: {}", style("SQLite (WAL mode)").dim());
    println!();
    Ok(())
}

pub async fn purge_cache(state: &AppState, json: bool) -> Result<()> {
    let removed = state
        .engine
        .cache()
        .purge_expired()
        .await
        .map_err(|e| anyhow!("Failed to purge result cache: {e}"))?;

    if json {
        println!("{}", serde_json::json!({ "removed": removed }));
        return Ok(());
    }

    match removed {
        Some(n) => println!("  {} Removed {n} expired cache entries", style("*").green().bold()),
        None => println!(
            "  The {:?} cache expires entries on read; nothing to purge.",
            state.engine.cache().backend()
        ),
    }
    Ok(())
}
