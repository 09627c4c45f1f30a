// law_change.rs — Law-change subcommands: validate.

use std::path::PathBuf;

use clap::Subcommand;
use csp_gateway::GatewayConfig;
use csp_ledger::JsonlReceiptStore;
use csp_policy::{Environment, LawChangeValidator};

#[derive(Subcommand)]
pub enum LawChangeCommands {
    /// Check whether a recorded law-change episode would be admitted.
    Validate {
        /// Episode holding the five law-change receipts.
        episode: String,
        /// Path to the ledger (defaults to ledger_path from the configuration).
        #[arg(long)]
        ledger: Option<PathBuf>,
        /// Override the configured environment (development, staging, production).
        #[arg(long)]
        environment: Option<Environment>,
        /// Environment variable holding the HMAC secret for signature checks.
        #[arg(long)]
        hmac_secret_env: Option<String>,
    },
}

pub fn execute(cmd: &LawChangeCommands, config: &GatewayConfig) -> anyhow::Result<()> {
    match cmd {
        LawChangeCommands::Validate {
            episode,
            ledger,
            environment,
            hmac_secret_env,
        } => {
            let path = ledger.clone().unwrap_or_else(|| config.ledger_path.clone());
            if !path.exists() {
                anyhow::bail!("no ledger found at {}", path.display());
            }
            let receipts: Vec<_> = JsonlReceiptStore::read_path(&path)?
                .into_iter()
                .filter(|r| &r.episode_id == episode)
                .collect();
            let verifier = super::hmac_verifier(config, hmac_secret_env.as_deref())?;
            let validator = LawChangeValidator::new(config.tier, verifier);
            let environment = environment.unwrap_or(config.environment);

            tracing::info!(
                %episode,
                receipts = receipts.len(),
                environment = ?environment,
                "validating law-change episode"
            );
            match validator.admit(&receipts, environment) {
                Ok(admission) if admission.is_provisional() => {
                    println!("PROVISIONAL: {}", admission.change());
                    println!("  proposal: {}", admission.proposal_id());
                    for warning in admission.warnings() {
                        println!("  warning:  {}", warning);
                    }
                }
                Ok(admission) => {
                    println!("ADMITTED: {}", admission.change());
                    println!("  proposal: {}", admission.proposal_id());
                }
                Err(e) => {
                    println!("REJECTED: {}", e);
                    anyhow::bail!("law-change episode {} was not admitted", episode);
                }
            }
        }
    }

    Ok(())
}
