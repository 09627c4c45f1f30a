//! # csp-cli
//!
//! Operator command-line interface for the CSP gateway.
//!
//! - `csp ledger verify/tail`: check and inspect the hash-chained receipt ledger
//! - `csp classify`: show how an action would be classified
//! - `csp law-change validate`: check a recorded law-change episode
//! - `csp config`: print the effective gateway configuration

mod commands;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use csp_gateway::GatewayConfig;
use tracing_subscriber::EnvFilter;

/// CSP gateway CLI: audit receipts and review policy changes.
#[derive(Parser)]
#[command(name = "csp", version, about)]
struct Cli {
    /// Project root directory (defaults to current directory).
    #[arg(long, default_value = ".")]
    project_root: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Inspect the receipt ledger.
    Ledger {
        #[command(subcommand)]
        command: commands::ledger::LedgerCommands,
    },
    /// Classify a proposed tool action without recording anything.
    Classify(commands::classify::ClassifyArgs),
    /// Review law-change episodes.
    LawChange {
        #[command(subcommand)]
        command: commands::law_change::LawChangeCommands,
    },
    /// Print the effective configuration as JSON.
    Config,
}

fn main() -> anyhow::Result<()> {
    // Logs go to stderr so command output on stdout stays machine-readable.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("csp_gateway=warn".parse()?)
                .add_directive("csp_cli=info".parse()?),
        )
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    let cli = Cli::parse();
    let project_root = cli.project_root.canonicalize().unwrap_or(cli.project_root);
    let config = GatewayConfig::load_for_project(&project_root)?;

    match &cli.command {
        Commands::Ledger { command } => commands::ledger::execute(command, &config),
        Commands::Classify(args) => commands::classify::execute(args, &config),
        Commands::LawChange { command } => commands::law_change::execute(command, &config),
        Commands::Config => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
    }
}
