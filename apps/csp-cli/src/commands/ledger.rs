// ledger.rs — Ledger subcommands: verify, tail.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use clap::Subcommand;
use csp_gateway::GatewayConfig;
use csp_ledger::{verify_chain, ChainReport, JsonlReceiptStore, Receipt, VerifyOptions};

#[derive(Subcommand)]
pub enum LedgerCommands {
    /// Verify every episode's hash chain (and signatures, given a key).
    Verify {
        /// Path to the ledger (defaults to ledger_path from the configuration).
        #[arg(long)]
        ledger: Option<PathBuf>,
        /// Only verify this episode.
        #[arg(long)]
        episode: Option<String>,
        /// Environment variable holding the HMAC secret for signature checks.
        #[arg(long)]
        hmac_secret_env: Option<String>,
    },
    /// Show the most recent receipts.
    Tail {
        /// Path to the ledger (defaults to ledger_path from the configuration).
        #[arg(long)]
        ledger: Option<PathBuf>,
        /// Only show this episode.
        #[arg(long)]
        episode: Option<String>,
        /// Number of receipts to show.
        #[arg(short, default_value = "10")]
        n: usize,
    },
}

pub fn execute(cmd: &LedgerCommands, config: &GatewayConfig) -> anyhow::Result<()> {
    match cmd {
        LedgerCommands::Verify {
            ledger,
            episode,
            hmac_secret_env,
        } => {
            let path = ledger.clone().unwrap_or_else(|| config.ledger_path.clone());
            let receipts = match read_ledger(&path)? {
                Some(receipts) => receipts,
                None => return Ok(()),
            };
            let verifier = super::hmac_verifier(config, hmac_secret_env.as_deref())?;
            let options = VerifyOptions::for_tier(config.tier, verifier.as_deref());

            let mut broken = 0;
            for (episode_id, chain) in group_by_episode(&receipts, episode.as_deref()) {
                let report = verify_chain(&chain, &options);
                print_report(&episode_id, &report);
                if !report.is_valid() {
                    broken += 1;
                }
            }
            tracing::info!(
                ledger = %path.display(),
                receipts = receipts.len(),
                broken,
                "ledger verification finished"
            );
            if broken > 0 {
                println!();
                println!("Receipts at or after a break point must not be trusted.");
                anyhow::bail!("{} episode(s) failed verification", broken);
            }
        }

        LedgerCommands::Tail { ledger, episode, n } => {
            let path = ledger.clone().unwrap_or_else(|| config.ledger_path.clone());
            let receipts = match read_ledger(&path)? {
                Some(receipts) => receipts,
                None => return Ok(()),
            };
            let selected: Vec<&Receipt> = receipts
                .iter()
                .filter(|r| episode.as_deref().map_or(true, |e| r.episode_id == e))
                .collect();
            let start = selected.len().saturating_sub(*n);
            let recent = &selected[start..];

            if recent.is_empty() {
                println!("No receipts.");
                return Ok(());
            }

            println!(
                "{:<26} {:<20} {:>5} {:<22} HASH",
                "RECORDED", "EPISODE", "SEQ", "KIND"
            );
            println!("{}", "-".repeat(100));
            for receipt in recent {
                println!(
                    "{:<26} {:<20} {:>5} {:<22} {}{}",
                    receipt.recorded_at.format("%Y-%m-%d %H:%M:%S%.3f"),
                    receipt.episode_id,
                    receipt.sequence,
                    receipt.kind.as_str(),
                    &receipt.hash[..16.min(receipt.hash.len())],
                    if receipt.signature.is_some() { " (signed)" } else { "" },
                );
            }
        }
    }

    Ok(())
}

fn read_ledger(path: &Path) -> anyhow::Result<Option<Vec<Receipt>>> {
    if !path.exists() {
        println!("No ledger found at {}", path.display());
        return Ok(None);
    }
    Ok(Some(JsonlReceiptStore::read_path(path)?))
}

/// Receipts grouped per episode in ledger order, optionally for one episode.
fn group_by_episode(receipts: &[Receipt], only: Option<&str>) -> BTreeMap<String, Vec<Receipt>> {
    let mut episodes: BTreeMap<String, Vec<Receipt>> = BTreeMap::new();
    for receipt in receipts {
        if only.map_or(true, |e| receipt.episode_id == e) {
            episodes
                .entry(receipt.episode_id.clone())
                .or_default()
                .push(receipt.clone());
        }
    }
    episodes
}

fn print_report(episode_id: &str, report: &ChainReport) {
    match &report.break_at {
        None => println!(
            "{}: {} receipt(s), chain intact ({} signature(s) checked, {} unchecked)",
            episode_id, report.total, report.signatures_checked, report.signatures_unchecked
        ),
        Some(b) => {
            println!("{}: INTEGRITY VIOLATION at receipt {}", episode_id, b.index);
            println!("  receipt_id: {}", b.receipt_id);
            println!("  reason:     {}", b.reason);
            println!("  trusted:    first {} of {}", report.trusted_len, report.total);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use csp_ledger::{ConformanceTier, ReceiptKind, ReceiptLedger, Temporal};
    use std::sync::Arc;

    #[test]
    fn groups_keep_ledger_order_per_episode() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("receipts.jsonl");
        let store = Arc::new(JsonlReceiptStore::open(&path).unwrap());
        let ledger = ReceiptLedger::open(store, ConformanceTier::Standard, None).unwrap();
        for episode in ["b", "a", "b"] {
            ledger
                .append(
                    episode,
                    ReceiptKind::AgentAction,
                    serde_json::json!({"n": 1}),
                    Temporal::observed_now(),
                )
                .unwrap();
        }

        let receipts = read_ledger(&path).unwrap().unwrap();
        let groups = group_by_episode(&receipts, None);
        assert_eq!(groups.keys().collect::<Vec<_>>(), vec!["a", "b"]);
        assert_eq!(groups["b"].len(), 2);
        assert_eq!(groups["b"][1].prev_hash, groups["b"][0].hash);
        assert!(verify_chain(&groups["b"], &VerifyOptions::default()).is_valid());

        let only_a = group_by_episode(&receipts, Some("a"));
        assert_eq!(only_a.len(), 1);
    }

    #[test]
    fn missing_ledger_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(read_ledger(&dir.path().join("absent.jsonl")).unwrap().is_none());
    }
}
