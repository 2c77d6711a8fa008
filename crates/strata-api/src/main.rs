//! Strata inspection CLI entry point.
//!
//! Binary name: `strata`
//!
//! Parses CLI arguments, opens the provenance store, then dispatches to the
//! matching read-only command.

mod cli;
mod state;

use clap::Parser;
use clap_complete::generate;

use cli::{Cli, Commands, NodeCommand, ProcessCommand};
use state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if !cli.quiet {
        strata_observe::tracing_setup::init_tracing(cli.verbose, cli.otel)
            .map_err(|e| anyhow::anyhow!("failed to initialize tracing: {e}"))?;
    }

    // Shell completions don't need the store
    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = <Cli as clap::CommandFactory>::command();
        generate(*shell, &mut cmd, "strata", &mut std::io::stdout());
        return Ok(());
    }

    let result = run(cli).await;
    strata_observe::tracing_setup::shutdown_tracing();
    result
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let state = AppState::init().await?;

    match cli.command {
        Commands::Status => cli::status::status(&state, cli.json).await?,

        Commands::Process { action } => match action {
            ProcessCommand::List {
                status,
                kind,
                limit,
            } => {
                cli::process::list_processes(&state, status, kind, limit, cli.json).await?;
            }
            ProcessCommand::Show { id } => {
                cli::process::show_process(&state, &id, cli.json).await?;
            }
        },

        Commands::Node { action } => match action {
            NodeCommand::Show { id } => cli::node::show_node(&state, &id, cli.json).await?,
        },

        Commands::Graph { id, depth, walk } => {
            cli::graph::show_graph(&state, &id, depth, walk, cli.json).await?;
        }

        Commands::Config => cli::config::show_config(&state, cli.json)?,

        Commands::Completions { .. } => unreachable!("handled above"),
    }

    Ok(())
}
