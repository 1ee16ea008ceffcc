//! `list` and `run` commands.

use anyhow::{Context, Result, bail};
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;
use serde_json::Value;
use stepweave_core::{CallerContext, ExecuteOptions};
use stepweave_observe::event_log::spawn_event_logger;
use stepweave_types::workflow::WorkflowKind;
use tokio_util::sync::CancellationToken;

use super::{print_error_line, short_id, step_status_cell};
use crate::state::AppState;

// ---------------------------------------------------------------------------
// List
// ---------------------------------------------------------------------------

pub fn list_workflows(state: &AppState, json: bool) -> Result<()> {
    let registry = state.engine.registry();
    let summaries = registry.workflow_summaries();

    if json {
        println!("{}", serde_json::to_string_pretty(&summaries)?);
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Workflow").fg(Color::Cyan),
            Cell::new("Kind"),
            Cell::new("Sequence"),
        ]);

    for summary in &summaries {
        let (kind, sequence) = match summary.kind {
            WorkflowKind::Static => {
                let entries: Vec<String> = summary
                    .sequence
                    .iter()
                    .map(|id| match registry.group_members(id) {
                        Some(members) => format!("{id}[{}]", members.join(" | ")),
                        None => id.clone(),
                    })
                    .collect();
                ("static", entries.join(" → "))
            }
            WorkflowKind::Dynamic => ("dynamic", "resolved from input".to_string()),
        };
        table.add_row(vec![Cell::new(&summary.id), Cell::new(kind), Cell::new(sequence)]);
    }

    println!();
    println!("{table}");
    println!();
    Ok(())
}

// ---------------------------------------------------------------------------
// Run
// ---------------------------------------------------------------------------

pub async fn run_workflow(
    state: &AppState,
    workflow: &str,
    input: Option<&str>,
    context: Option<&str>,
    prefer_cache: bool,
    json: bool,
    quiet: bool,
) -> Result<()> {
    let input = parse_input(input)?;
    let caller_context = parse_context(context)?;

    let cancel = CancellationToken::new();
    let ctrl_c = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("interrupt received, cancelling run");
                cancel.cancel();
            }
        })
    };
    let logger = spawn_event_logger(state.engine.subscribe());

    let options = ExecuteOptions {
        prefer_cache,
        cancel: Some(cancel),
    };
    let result = state
        .engine
        .run_workflow(workflow, input, caller_context, options)
        .await;

    ctrl_c.abort();
    logger.abort();

    let outcome = match result {
        Ok(outcome) => outcome,
        Err(err) => {
            if !json && !quiet {
                print_error_line(&err.to_string());
                if let Some(entry) = err.failing_entry() {
                    eprintln!("  Failing entry: {}", style(entry).cyan());
                }
                eprintln!(
                    "  Inspect with: {}",
                    style(format!("stepweave history --workflow {workflow}")).dim()
                );
            }
            return Err(anyhow::Error::new(err).context(format!("workflow '{workflow}' failed")));
        }
    };

    if json {
        let out = serde_json::json!({
            "execution_id": outcome.execution_id.to_string(),
            "from_cache": outcome.from_cache,
            "output": outcome.output,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }
    if quiet {
        println!("{}", serde_json::to_string(&outcome.output)?);
        return Ok(());
    }

    println!();
    if outcome.from_cache {
        println!(
            "  {} Workflow '{}' served from cache",
            style("*").green().bold(),
            style(workflow).cyan()
        );
    } else {
        println!(
            "  {} Workflow '{}' completed (run {})",
            style("*").green().bold(),
            style(workflow).cyan(),
            style(short_id(&outcome.execution_id)).dim()
        );
    }

    if let Some(record) = &outcome.record {
        let mut table = Table::new();
        table
            .load_preset(presets::UTF8_FULL_CONDENSED)
            .set_content_arrangement(ContentArrangement::Dynamic)
            .set_header(vec![
                Cell::new("Step").fg(Color::Cyan),
                Cell::new("Group"),
                Cell::new("Attempt"),
                Cell::new("Status"),
                Cell::new("Duration"),
            ]);
        for step in &record.steps {
            table.add_row(vec![
                Cell::new(&step.step_id),
                Cell::new(step.group_id.as_deref().unwrap_or("-")),
                Cell::new(step.attempt),
                step_status_cell(step.status),
                Cell::new(format!("{}ms", step.duration_ms())),
            ]);
        }
        println!();
        println!("{table}");
    }

    println!();
    println!("{}", serde_json::to_string_pretty(&outcome.output)?);
    println!();
    Ok(())
}

fn parse_input(raw: Option<&str>) -> Result<Value> {
    match raw {
        Some(raw) => serde_json::from_str(raw).context("--input is not valid JSON"),
        None => Ok(Value::Object(Default::default())),
    }
}

fn parse_context(raw: Option<&str>) -> Result<CallerContext> {
    let Some(raw) = raw else {
        return Ok(CallerContext::new());
    };
    match serde_json::from_str(raw).context("--context is not valid JSON")? {
        Value::Object(map) => Ok(map),
        other => bail!("--context must be a JSON object, got {other}"),
    }
}
