//! Eco Allocator operator CLI
//!
//! Works offline over the files the engine persists: the hash-chained decision
//! log, the inventory snapshot and the energy telemetry log.

mod commands;
mod config;
mod output;

use anyhow::Result;
use clap::{Parser, Subcommand};
use commands::{config as config_cmd, decisions, energy, inventory};
use std::path::PathBuf;

/// Eco Allocator CLI
#[derive(Parser)]
#[command(name = "ecoctl")]
#[command(author, version, about = "Inspect the energy-aware allocation engine's persisted state", long_about = None)]
pub struct Cli {
    /// Engine state directory (decision log and snapshot)
    #[arg(long, global = true, env = "ECO_STATE_DIR")]
    pub state_dir: Option<PathBuf>,

    /// Service configuration file; its persistence settings locate the state
    #[arg(long, global = true, env = "ECO_CONFIG")]
    pub config: Option<PathBuf>,

    /// Output format
    #[arg(long, short, global = true, default_value = "table")]
    pub format: output::OutputFormat,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Allocation decisions
    #[command(subcommand)]
    Decisions(DecisionsCommands),

    /// Instances and allocation lifecycles from the last snapshot
    Inventory,

    /// Latest energy reading of one instance
    Energy {
        /// Instance ID
        instance_id: String,

        /// Energy telemetry log (JSON lines)
        #[arg(long)]
        telemetry: PathBuf,
    },

    /// Aggregated sustainability view of one region
    Sustainability {
        /// Region name
        region: String,

        /// Energy telemetry log (JSON lines)
        #[arg(long)]
        telemetry: PathBuf,
    },

    /// Configuration tools
    #[command(subcommand)]
    Config(ConfigCommands),
}

#[derive(Subcommand)]
pub enum DecisionsCommands {
    /// List recorded decisions
    List {
        /// Only this outcome (accepted, deferred, rejected, failed)
        #[arg(long)]
        outcome: Option<String>,

        /// Only decisions for this request ID
        #[arg(long)]
        request: Option<String>,

        /// Show at most this many (most recent)
        #[arg(long)]
        limit: Option<usize>,
    },

    /// Verify the decision log hash chain
    Verify,
}

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Load and validate an engine configuration
    Check {
        /// Configuration file (defaults to --config)
        file: Option<PathBuf>,
    },
}

fn main() {
    let cli = Cli::parse();

    if let Err(e) = run(cli) {
        output::print_error(&format!("{:#}", e));
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    let format = cli.format;
    match cli.command {
        Commands::Decisions(cmd) => {
            let paths = config::StatePaths::resolve(cli.state_dir.as_deref(), cli.config.as_deref())?;
            match cmd {
                DecisionsCommands::List {
                    outcome,
                    request,
                    limit,
                } => decisions::list(&paths, outcome.as_deref(), request.as_deref(), limit, format),
                DecisionsCommands::Verify => decisions::verify(&paths, format),
            }
        }
        Commands::Inventory => {
            let paths = config::StatePaths::resolve(cli.state_dir.as_deref(), cli.config.as_deref())?;
            inventory::show(&paths, format)
        }
        Commands::Energy {
            instance_id,
            telemetry,
        } => energy::instance(&telemetry, &instance_id, format),
        Commands::Sustainability { region, telemetry } => {
            let engine = match &cli.config {
                Some(path) => config::load_engine_config(path)?,
                None => Default::default(),
            };
            energy::sustainability(&telemetry, &region, &engine, format)
        }
        Commands::Config(ConfigCommands::Check { file }) => {
            config_cmd::check(file.as_deref().or(cli.config.as_deref()), format)
        }
    }
}
