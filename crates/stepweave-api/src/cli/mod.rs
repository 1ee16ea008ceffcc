//! CLI command definitions for the `stepweave` binary.

pub mod history;
pub mod status;
pub mod workflow;

use clap::{Parser, Subcommand};
use clap_complete::Shell;
use comfy_table::Cell;
use console::style;
use stepweave_types::execution::{RunStatus, StepStatus};

/// Run and inspect stepweave workflows.
#[derive(Parser)]
#[command(name = "stepweave", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Output machine-readable JSON instead of styled text.
    #[arg(long, global = true)]
    pub json: bool,

    /// Suppress all output except errors.
    #[arg(long, global = true)]
    pub quiet: bool,

    /// Detailed output (-v for verbose, -vv for debug/trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// List registered workflows.
    #[command(alias = "ls")]
    List,

    /// Run a workflow.
    Run {
        /// Workflow id.
        workflow: String,

        /// Initial data as JSON (default: `{}`).
        #[arg(long)]
        input: Option<String>,

        /// Caller context as a JSON object, visible to steps and conditions.
        #[arg(long)]
        context: Option<String>,

        /// Return an unexpired cached output instead of running.
        #[arg(long)]
        prefer_cache: bool,
    },

    /// Show recent execution records.
    History {
        /// Only runs of this workflow.
        #[arg(long)]
        workflow: Option<String>,

        /// Maximum number of runs to display.
        #[arg(long, default_value = "20")]
        limit: u32,
    },

    /// Show the per-step trace of one run.
    Trace {
        /// Execution id (UUID).
        execution_id: String,
    },

    /// Show data directory, configuration and database status.
    Status,

    /// Remove expired entries from the result cache.
    #[command(name = "purge-cache")]
    PurgeCache,

    /// Generate shell completions.
    Completions {
        /// Target shell.
        shell: Shell,
    },
}

/// Filter directive for the verbosity flags; `None` keeps the configured level.
pub fn verbosity_filter(quiet: bool, verbose: u8) -> Option<&'static str> {
    match verbose {
        0 if quiet => Some("error"),
        0 => None,
        1 => Some("info,stepweave::events=debug"),
        _ => Some("trace"),
    }
}

pub(crate) fn short_id(id: &uuid::Uuid) -> String {
    id.to_string().chars().take(8).collect()
}

pub(crate) fn run_status_cell(status: RunStatus) -> Cell {
    match status {
        RunStatus::Success => Cell::new("success").fg(comfy_table::Color::Green),
        RunStatus::Error => Cell::new("error").fg(comfy_table::Color::Red),
        RunStatus::Running => Cell::new("running").fg(comfy_table::Color::Yellow),
    }
}

pub(crate) fn step_status_cell(status: StepStatus) -> Cell {
    match status {
        StepStatus::Success => Cell::new("success").fg(comfy_table::Color::Green),
        StepStatus::Error => Cell::new("error").fg(comfy_table::Color::Red),
        StepStatus::Skipped => Cell::new("skipped").fg(comfy_table::Color::DarkGrey),
    }
}

pub(crate) fn print_error_line(message: &str) {
    eprintln!("  {} {}", style("✗").red().bold(), style(message).red());
}
