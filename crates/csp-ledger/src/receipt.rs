// receipt.rs — Receipt data model.
//
// Every protocol event (attempt, plan, verdict, execution, refusal,
// override, anchor, law-change stage) is recorded as a Receipt. Receipts
// within one episode form a chain: each carries the `prev_hash` of the
// receipt before it, and its own `hash` over the canonical form of every
// other field. The signature, when present, signs that hash.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::LedgerError;
use crate::hasher;
use crate::signer::SignatureAlgorithm;

/// What kind of protocol event a receipt records.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ReceiptKind {
    /// A tool action was permitted (before execution) or executed (after).
    AgentAction,
    /// A tool action was refused.
    Refusal,
    /// A plan was created for HIGH/CRITICAL steps.
    ToolPlan,
    /// The Guardian returned a verdict bound to a plan hash.
    GuardianVerdict,
    /// An operator overrode a refusal.
    EmergencyOverride,
    /// A batch of receipts was anchored to an external service.
    Anchor,
    // Law-change episode, in the only order they may appear.
    InvariantViolation,
    SelfRepairProposal,
    SandboxRun,
    CouncilDecision,
    SelfRepairOutcome,
}

impl ReceiptKind {
    /// The fixed order of a law-change episode.
    pub const LAW_CHANGE_SEQUENCE: [ReceiptKind; 5] = [
        ReceiptKind::InvariantViolation,
        ReceiptKind::SelfRepairProposal,
        ReceiptKind::SandboxRun,
        ReceiptKind::CouncilDecision,
        ReceiptKind::SelfRepairOutcome,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ReceiptKind::AgentAction => "agent_action",
            ReceiptKind::Refusal => "refusal",
            ReceiptKind::ToolPlan => "tool_plan",
            ReceiptKind::GuardianVerdict => "guardian_verdict",
            ReceiptKind::EmergencyOverride => "emergency_override",
            ReceiptKind::Anchor => "anchor",
            ReceiptKind::InvariantViolation => "invariant_violation",
            ReceiptKind::SelfRepairProposal => "self_repair_proposal",
            ReceiptKind::SandboxRun => "sandbox_run",
            ReceiptKind::CouncilDecision => "council_decision",
            ReceiptKind::SelfRepairOutcome => "self_repair_outcome",
        }
    }

    pub fn is_law_change(self) -> bool {
        Self::LAW_CHANGE_SEQUENCE.contains(&self)
    }
}

impl std::fmt::Display for ReceiptKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The interval during which the recorded fact is true in the world.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ValidTime {
    pub start: DateTime<Utc>,
    pub end: Option<DateTime<Utc>>,
}

/// Caller-supplied timestamps for an append. `recorded_at` is always set by
/// the ledger itself.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Temporal {
    pub valid_time: Option<ValidTime>,
    pub observed_at: Option<DateTime<Utc>>,
}

impl Temporal {
    /// No tri-temporal information (accepted below Court-Grade).
    pub fn none() -> Self {
        Self::default()
    }

    /// The fact became true and was observed right now.
    pub fn observed_now() -> Self {
        Self::observed_at(Utc::now())
    }

    /// The fact became true and was observed at `at`.
    pub fn observed_at(at: DateTime<Utc>) -> Self {
        Self {
            valid_time: Some(ValidTime {
                start: at,
                end: None,
            }),
            observed_at: Some(at),
        }
    }

    /// Override the valid-time interval (builder pattern).
    pub fn with_valid_time(mut self, start: DateTime<Utc>, end: Option<DateTime<Utc>>) -> Self {
        self.valid_time = Some(ValidTime { start, end });
        self
    }
}

/// A signature over a receipt's hash, produced by an injected signer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReceiptSignature {
    /// Opaque handle of the key that signed (never the key itself).
    pub key_id: String,
    pub algorithm: SignatureAlgorithm,
    /// Base64 (standard alphabet) signature bytes.
    pub value: String,
}

/// A single ledger receipt — one line in the JSONL store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Receipt {
    pub receipt_id: Uuid,
    /// Chain this receipt belongs to.
    pub episode_id: String,
    /// Position within the episode, starting at 0.
    pub sequence: u64,
    pub kind: ReceiptKind,
    /// Kind-specific body.
    pub payload: serde_json::Value,
    /// `hash` of the previous receipt in the episode, or [`hasher::GENESIS_HASH`].
    pub prev_hash: String,
    /// SHA-256 over the canonical form of every field except `hash` and `signature`.
    pub hash: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<ReceiptSignature>,
    #[serde(default)]
    pub valid_time: Option<ValidTime>,
    #[serde(default)]
    pub observed_at: Option<DateTime<Utc>>,
    pub recorded_at: DateTime<Utc>,
}

/// The hashed portion of a receipt.
#[derive(Serialize)]
struct ReceiptBody<'a> {
    receipt_id: &'a Uuid,
    episode_id: &'a str,
    sequence: u64,
    kind: ReceiptKind,
    payload: &'a serde_json::Value,
    prev_hash: &'a str,
    valid_time: &'a Option<ValidTime>,
    observed_at: &'a Option<DateTime<Utc>>,
    recorded_at: &'a DateTime<Utc>,
}

impl Receipt {
    /// Recompute this receipt's hash from its current field values.
    pub fn compute_hash(&self) -> Result<String, LedgerError> {
        hasher::canonical_hash(&ReceiptBody {
            receipt_id: &self.receipt_id,
            episode_id: &self.episode_id,
            sequence: self.sequence,
            kind: self.kind,
            payload: &self.payload,
            prev_hash: &self.prev_hash,
            valid_time: &self.valid_time,
            observed_at: &self.observed_at,
            recorded_at: &self.recorded_at,
        })
    }

    /// Check `valid_time.start <= observed_at <= recorded_at` for whichever
    /// fields are present.
    pub fn check_temporal(&self) -> Result<(), LedgerError> {
        check_temporal(self.valid_time.as_ref(), self.observed_at, self.recorded_at)
    }

    /// Whether both optional tri-temporal fields are present.
    pub fn has_tri_temporal(&self) -> bool {
        self.valid_time.is_some() && self.observed_at.is_some()
    }

    /// Decode the payload into a typed struct.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, LedgerError> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }
}

pub(crate) fn check_temporal(
    valid_time: Option<&ValidTime>,
    observed_at: Option<DateTime<Utc>>,
    recorded_at: DateTime<Utc>,
) -> Result<(), LedgerError> {
    if let Some(valid) = valid_time {
        if let Some(end) = valid.end {
            if end < valid.start {
                return Err(LedgerError::TemporalInvariantViolation {
                    detail: format!("valid_time.end {} precedes start {}", end, valid.start),
                });
            }
        }
        let upper = observed_at.unwrap_or(recorded_at);
        if valid.start > upper {
            return Err(LedgerError::TemporalInvariantViolation {
                detail: format!(
                    "valid_time.start {} is after observed/recorded time {}",
                    valid.start, upper
                ),
            });
        }
    }
    if let Some(observed) = observed_at {
        if observed > recorded_at {
            return Err(LedgerError::TemporalInvariantViolation {
                detail: format!(
                    "observed_at {} is after recorded_at {}",
                    observed, recorded_at
                ),
            });
        }
    }
    Ok(())
}
