//! CLI command definitions for the `strata` binary.
//!
//! Every command is read-only: it inspects the provenance graph and process
//! records that engines have written to the store.

pub mod config;
pub mod graph;
pub mod node;
pub mod process;
pub mod status;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use strata_core::provenance::Walk;
use strata_types::node::NodeId;

/// Inspect Strata provenance and process state.
#[derive(Parser)]
#[command(name = "strata", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Output machine-readable JSON instead of styled text.
    #[arg(long, global = true)]
    pub json: bool,

    /// Suppress all output except errors.
    #[arg(long, global = true)]
    pub quiet: bool,

    /// Detailed logging (-v info, -vv debug, -vvv trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Export tracing spans through OpenTelemetry (stdout exporter).
    #[arg(long, global = true)]
    pub otel: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Store summary: node and process counts.
    Status,

    /// Inspect process records.
    Process {
        #[command(subcommand)]
        action: ProcessCommand,
    },

    /// Inspect graph nodes.
    Node {
        #[command(subcommand)]
        action: NodeCommand,
    },

    /// Render the provenance graph around a node.
    Graph {
        /// Node UUID to start from.
        id: String,

        /// How many edges to follow.
        #[arg(long, default_value = "3")]
        depth: usize,

        /// Which direction to walk.
        #[arg(long, value_enum, default_value = "descendants")]
        walk: WalkArg,
    },

    /// Show the effective configuration.
    Config,

    /// Generate shell completions.
    Completions {
        /// Shell to generate completions for.
        shell: Shell,
    },
}

#[derive(Subcommand)]
pub enum ProcessCommand {
    /// List process records, oldest first.
    #[command(alias = "ls")]
    List {
        /// Only records in this status (created, running, waiting, finished, failed).
        #[arg(long)]
        status: Option<String>,

        /// Only records of this kind (function, chain, calculation).
        #[arg(long)]
        kind: Option<String>,

        /// Maximum number of records to display.
        #[arg(long, default_value = "50")]
        limit: u32,
    },

    /// Show one process: record, context, inputs, and outputs.
    Show {
        /// Process UUID.
        id: String,
    },
}

#[derive(Subcommand)]
pub enum NodeCommand {
    /// Show a node and its edges.
    Show {
        /// Node UUID.
        id: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum WalkArg {
    Ancestors,
    Descendants,
    Both,
}

impl From<WalkArg> for Walk {
    fn from(arg: WalkArg) -> Self {
        match arg {
            WalkArg::Ancestors => Walk::Ancestors,
            WalkArg::Descendants => Walk::Descendants,
            WalkArg::Both => Walk::Both,
        }
    }
}

/// Parse a node id argument.
pub fn parse_node_id(input: &str) -> anyhow::Result<NodeId> {
    input
        .trim()
        .parse::<NodeId>()
        .with_context(|| format!("'{input}' is not a valid node id"))
}

/// Shorten long JSON values for table cells.
pub fn preview(value: &serde_json::Value, max_chars: usize) -> String {
    let text = value.to_string();
    if text.chars().count() <= max_chars {
        return text;
    }
    let mut short: String = text.chars().take(max_chars.saturating_sub(3)).collect();
    short.push_str("...");
    short
}
