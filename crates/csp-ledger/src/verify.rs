// verify.rs — Chain verification for audit and replay.
//
// Verification is read-only. It walks an episode in order and stops at the
// first receipt it cannot trust; that receipt and everything after it are
// reported as untrusted, because every later link was computed from a value
// that can no longer be relied on.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::hasher::GENESIS_HASH;
use crate::receipt::Receipt;
use crate::signer::{decode_signature, Verifier};
use crate::tier::ConformanceTier;

/// Why a chain stopped being trustworthy.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum BreakReason {
    EpisodeMismatch { expected: String, found: String },
    SequenceGap { expected: u64, found: u64 },
    PrevHashMismatch { expected: String, found: String },
    HashMismatch { stored: String, computed: String },
    Unhashable { detail: String },
    MissingSignature,
    MalformedSignature,
    BadSignature { key_id: String },
    /// A signature is present but no verifier was supplied while signatures are mandatory.
    UnverifiableSignature { key_id: String },
    MissingTriTemporal,
    TemporalViolation { detail: String },
    TimestampRegression { previous: String, found: String },
}

impl std::fmt::Display for BreakReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BreakReason::EpisodeMismatch { expected, found } => {
                write!(f, "episode mismatch: expected '{}', found '{}'", expected, found)
            }
            BreakReason::SequenceGap { expected, found } => {
                write!(f, "sequence gap: expected {}, found {}", expected, found)
            }
            BreakReason::PrevHashMismatch { expected, found } => {
                write!(f, "prev_hash mismatch: expected {}, found {}", expected, found)
            }
            BreakReason::HashMismatch { stored, computed } => {
                write!(f, "hash mismatch: stored {}, computed {}", stored, computed)
            }
            BreakReason::Unhashable { detail } => write!(f, "cannot hash receipt: {}", detail),
            BreakReason::MissingSignature => write!(f, "signature required but missing"),
            BreakReason::MalformedSignature => write!(f, "signature is not valid base64"),
            BreakReason::BadSignature { key_id } => {
                write!(f, "signature does not verify under key '{}'", key_id)
            }
            BreakReason::UnverifiableSignature { key_id } => {
                write!(f, "no verifier available for key '{}'", key_id)
            }
            BreakReason::MissingTriTemporal => write!(f, "tri-temporal fields required but missing"),
            BreakReason::TemporalViolation { detail } => write!(f, "{}", detail),
            BreakReason::TimestampRegression { previous, found } => {
                write!(f, "recorded_at went backwards: {} then {}", previous, found)
            }
        }
    }
}

/// The first untrusted receipt in a chain.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChainBreak {
    /// Index within the verified slice.
    pub index: usize,
    pub receipt_id: Uuid,
    pub reason: BreakReason,
}

/// Result of verifying one chain.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChainReport {
    pub total: usize,
    /// Number of leading receipts that verified. Everything at or past this index is untrusted.
    pub trusted_len: usize,
    pub break_at: Option<ChainBreak>,
    pub signatures_checked: usize,
    /// Signatures present but not checked because no verifier was supplied.
    pub signatures_unchecked: usize,
}

impl ChainReport {
    pub fn is_valid(&self) -> bool {
        self.break_at.is_none()
    }
}

/// What a verification pass demands.
#[derive(Clone, Copy, Default)]
pub struct VerifyOptions<'a> {
    pub verifier: Option<&'a dyn Verifier>,
    pub require_signatures: bool,
    pub require_tri_temporal: bool,
}

impl<'a> VerifyOptions<'a> {
    /// The requirements of a conformance tier.
    pub fn for_tier(tier: ConformanceTier, verifier: Option<&'a dyn Verifier>) -> Self {
        Self {
            verifier,
            require_signatures: tier.requires_signatures(),
            require_tri_temporal: tier.requires_tri_temporal(),
        }
    }
}

/// Verify a full episode chain, which must start at the genesis link.
pub fn verify_chain(receipts: &[Receipt], options: &VerifyOptions<'_>) -> ChainReport {
    let mut report = ChainReport {
        total: receipts.len(),
        trusted_len: 0,
        break_at: None,
        signatures_checked: 0,
        signatures_unchecked: 0,
    };

    let episode_id = match receipts.first() {
        Some(first) => first.episode_id.as_str(),
        None => return report,
    };

    for (index, receipt) in receipts.iter().enumerate() {
        let previous = index.checked_sub(1).map(|i| &receipts[i]);
        if let Err(reason) = check_receipt(receipt, index, previous, episode_id, options, &mut report)
        {
            tracing::warn!(
                episode_id = %episode_id,
                index,
                receipt_id = %receipt.receipt_id,
                %reason,
                "receipt chain broken"
            );
            report.break_at = Some(ChainBreak {
                index,
                receipt_id: receipt.receipt_id,
                reason,
            });
            return report;
        }
        report.trusted_len = index + 1;
    }

    report
}

fn check_receipt(
    receipt: &Receipt,
    index: usize,
    previous: Option<&Receipt>,
    episode_id: &str,
    options: &VerifyOptions<'_>,
    report: &mut ChainReport,
) -> Result<(), BreakReason> {
    if receipt.episode_id != episode_id {
        return Err(BreakReason::EpisodeMismatch {
            expected: episode_id.to_string(),
            found: receipt.episode_id.clone(),
        });
    }

    if receipt.sequence != index as u64 {
        return Err(BreakReason::SequenceGap {
            expected: index as u64,
            found: receipt.sequence,
        });
    }

    let expected_prev = previous.map_or(GENESIS_HASH, |p| p.hash.as_str());
    if receipt.prev_hash != expected_prev {
        return Err(BreakReason::PrevHashMismatch {
            expected: expected_prev.to_string(),
            found: receipt.prev_hash.clone(),
        });
    }

    let computed = receipt.compute_hash().map_err(|e| BreakReason::Unhashable {
        detail: e.to_string(),
    })?;
    if computed != receipt.hash {
        return Err(BreakReason::HashMismatch {
            stored: receipt.hash.clone(),
            computed,
        });
    }

    match (&receipt.signature, options.verifier) {
        (Some(sig), Some(verifier)) => {
            let bytes = decode_signature(&sig.value).ok_or(BreakReason::MalformedSignature)?;
            if !verifier.verify(&sig.key_id, sig.algorithm, receipt.hash.as_bytes(), &bytes) {
                return Err(BreakReason::BadSignature {
                    key_id: sig.key_id.clone(),
                });
            }
            report.signatures_checked += 1;
        }
        (Some(sig), None) => {
            if options.require_signatures {
                return Err(BreakReason::UnverifiableSignature {
                    key_id: sig.key_id.clone(),
                });
            }
            report.signatures_unchecked += 1;
        }
        (None, _) if options.require_signatures => return Err(BreakReason::MissingSignature),
        (None, _) => {}
    }

    if options.require_tri_temporal && !receipt.has_tri_temporal() {
        return Err(BreakReason::MissingTriTemporal);
    }
    receipt
        .check_temporal()
        .map_err(|e| BreakReason::TemporalViolation {
            detail: e.to_string(),
        })?;

    if let Some(prev) = previous {
        if receipt.recorded_at < prev.recorded_at {
            return Err(BreakReason::TimestampRegression {
                previous: prev.recorded_at.to_rfc3339(),
                found: receipt.recorded_at.to_rfc3339(),
            });
        }
    }

    Ok(())
}
