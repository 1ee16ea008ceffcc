//! stepweave CLI entry point.
//!
//! Binary name: `stepweave`
//!
//! Loads `config.toml`, sets up tracing, opens the data directory and
//! dispatches to the command handlers.

mod catalog;
mod cli;
mod state;

use clap::Parser;
use clap_complete::generate;
use stepweave_infra::config::load_engine_config;
use stepweave_infra::filesystem::resolve_data_dir;
use stepweave_observe::tracing_setup::{init_tracing, shutdown_tracing};

use cli::{Cli, Commands};
use state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Shell completions don't need app state
    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = <Cli as clap::CommandFactory>::command();
        generate(*shell, &mut cmd, "stepweave", &mut std::io::stdout());
        return Ok(());
    }

    let data_dir = resolve_data_dir();
    let config = load_engine_config(&data_dir).await;

    init_tracing(&config.logging, cli::verbosity_filter(cli.quiet, cli.verbose))
        .map_err(|e| anyhow::anyhow!("failed to initialize tracing: {e}"))?;

    let state = AppState::init(data_dir, config).await?;

    let result = match cli.command {
        Commands::List => cli::workflow::list_workflows(&state, cli.json),
        Commands::Run {
            workflow,
            input,
            context,
            prefer_cache,
        } => {
            cli::workflow::run_workflow(
                &state,
                &workflow,
                input.as_deref(),
                context.as_deref(),
                prefer_cache,
                cli.json,
                cli.quiet,
            )
            .await
        }
        Commands::History { workflow, limit } => {
            cli::history::history(&state, workflow.as_deref(), limit, cli.json).await
        }
        Commands::Trace { execution_id } => cli::history::trace(&state, &execution_id, cli.json).await,
        Commands::Status => cli::status::status(&state, cli.json).await,
        Commands::PurgeCache => cli::status::purge_cache(&state, cli.json).await,
        Commands::Completions { .. } => Ok(()),
    };

    shutdown_tracing();
    result
}
