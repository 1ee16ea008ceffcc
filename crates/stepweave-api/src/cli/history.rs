//! `history` and `trace` commands over the SQLite trace sink.

use anyhow::{Context, Result, anyhow};
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;
use stepweave_types::execution::ExecutionRecord;
use uuid::Uuid;

use super::{run_status_cell, short_id, step_status_cell};
use crate::state::AppState;

// ---------------------------------------------------------------------------
// History
// ---------------------------------------------------------------------------

pub async fn history(state: &AppState, workflow: Option<&str>, limit: u32, json: bool) -> Result<()> {
    let records = state
        .traces()
        .list_records(workflow, limit)
        .await
        .map_err(|e| anyhow!("Failed to list execution records: {e}"))?;

    if json {
        let out: Vec<_> = records
            .iter()
            .map(|r| {
                serde_json::json!({
                    "execution_id": r.execution_id.to_string(),
                    "workflow_id": r.workflow_id,
                    "status": r.status.as_str(),
                    "steps": r.steps.len(),
                    "started_at": r.started_at.to_rfc3339(),
                    "completed_at": r.completed_at.map(|t| t.to_rfc3339()),
                    "error": r.error,
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    if records.is_empty() {
        println!();
        match workflow {
            Some(id) => println!("  No runs recorded for workflow '{id}'."),
            None => println!("  No runs recorded yet."),
        }
        println!("  Start one with: {}", style("stepweave run <workflow>").dim());
        println!();
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Run ID").fg(Color::Cyan),
            Cell::new("Workflow"),
            Cell::new("Status"),
            Cell::new("Steps"),
            Cell::new("Started"),
            Cell::new("Duration"),
            Cell::new("Error"),
        ]);

    for r in &records {
        let error = r
            .error
            .as_ref()
            .map(|e| e.chars().take(40).collect::<String>())
            .unwrap_or_else(|| "-".to_string());

        table.add_row(vec![
            Cell::new(short_id(&r.execution_id)),
            Cell::new(&r.workflow_id),
            run_status_cell(r.status),
            Cell::new(r.steps.len()),
            Cell::new(r.started_at.format("%Y-%m-%d %H:%M:%S").to_string()),
            Cell::new(format_duration(r)),
            Cell::new(error),
        ]);
    }

    println!();
    println!("{table}");
    println!();
    Ok(())
}

// ---------------------------------------------------------------------------
// Trace
// ---------------------------------------------------------------------------

pub async fn trace(state: &AppState, execution_id: &str, json: bool) -> Result<()> {
    let id: Uuid = execution_id
        .parse()
        .with_context(|| format!("'{execution_id}' is not a valid execution id"))?;

    let record = state
        .traces()
        .get_record(&id)
        .await
        .map_err(|e| anyhow!("Failed to load execution record: {e}"))?
        .ok_or_else(|| anyhow!("No execution record found for '{execution_id}'"))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&record)?);
        return Ok(());
    }

    println!();
    println!(
        "  {} {} ({})",
        style("Run").bold(),
        style(record.execution_id).cyan(),
        record.workflow_id
    );
    println!("  Status:   {}", record.status.as_str());
    println!("  Started:  {}", record.started_at.format("%Y-%m-%d %H:%M:%S%.3f"));
    println!("  Duration: {}", format_duration(&record));
    if let Some(err) = &record.error {
        println!("  Error:    {}", style(err).red());
    }

    if record.steps.is_empty() {
        println!();
        println!("  No steps were executed.");
        println!();
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("#").fg(Color::Cyan),
            Cell::new("Step"),
            Cell::new("Group"),
            Cell::new("Attempt"),
            Cell::new("Status"),
            Cell::new("Duration"),
            Cell::new("Error"),
        ]);

    for (i, s) in record.steps.iter().enumerate() {
        table.add_row(vec![
            Cell::new(i + 1),
            Cell::new(&s.step_id),
            Cell::new(s.group_id.as_deref().unwrap_or("-")),
            Cell::new(s.attempt),
            step_status_cell(s.status),
            Cell::new(format!("{}ms", s.duration_ms())),
            Cell::new(s.error.as_deref().unwrap_or("-")),
        ]);
    }

    println!();
    println!("{table}");
    println!();
    Ok(())
}

fn format_duration(record: &ExecutionRecord) -> String {
    match record.completed_at {
        Some(done) => format!("{}ms", (done - record.started_at).num_milliseconds()),
        None => "-".to_string(),
    }
}
