// receipts.rs — Typed receipt payloads.
//
// The ledger stores payloads as JSON values. These structs are the shapes the
// gateway writes and the auditor reads back with `Receipt::payload_as`. Each
// implements `ReceiptPayload` so the kind and the shape cannot drift apart.

use std::fmt;

use csp_ledger::{LedgerError, Receipt, ReceiptKind, ReceiptLedger, Temporal};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::capability::DenyReason;
use crate::guardian::Verdict;
use crate::plan::{PlanHash, ToolPlan};
use crate::risk::{RiskLevel, ToolAction};

/// A payload type bound to exactly one receipt kind.
pub trait ReceiptPayload: Serialize {
    const KIND: ReceiptKind;
}

/// Append a typed payload under its own kind.
pub fn record<P: ReceiptPayload>(
    ledger: &ReceiptLedger,
    episode_id: &str,
    payload: &P,
    temporal: Temporal,
) -> Result<Receipt, LedgerError> {
    ledger.append_record(episode_id, P::KIND, payload, temporal)
}

/// Why an action was refused. Serialized in snake_case.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefusalCode {
    NoPlan,
    NoVerdict,
    VerdictDeny,
    VerdictEscalated,
    ScopeMismatch,
    PlanHashMismatch,
    PlanExpired,
    AuthorizationPending,
    TokenSignatureInvalid,
    TokenExpired,
    TokenPrincipalMismatch,
    TokenScopeMismatch,
    TokenReplay,
    TokenRevoked,
    TokenReplayStoreUnavailable,
}

impl RefusalCode {
    pub fn as_str(self) -> &'static str {
        match self {
            RefusalCode::NoPlan => "no_plan",
            RefusalCode::NoVerdict => "no_verdict",
            RefusalCode::VerdictDeny => "verdict_deny",
            RefusalCode::VerdictEscalated => "verdict_escalated",
            RefusalCode::ScopeMismatch => "scope_mismatch",
            RefusalCode::PlanHashMismatch => "plan_hash_mismatch",
            RefusalCode::PlanExpired => "plan_expired",
            RefusalCode::AuthorizationPending => "authorization_pending",
            RefusalCode::TokenSignatureInvalid => "token_signature_invalid",
            RefusalCode::TokenExpired => "token_expired",
            RefusalCode::TokenPrincipalMismatch => "token_principal_mismatch",
            RefusalCode::TokenScopeMismatch => "token_scope_mismatch",
            RefusalCode::TokenReplay => "token_replay",
            RefusalCode::TokenRevoked => "token_revoked",
            RefusalCode::TokenReplayStoreUnavailable => "token_replay_store_unavailable",
        }
    }
}

impl fmt::Display for RefusalCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<DenyReason> for RefusalCode {
    fn from(reason: DenyReason) -> Self {
        match reason {
            DenyReason::SignatureInvalid => RefusalCode::TokenSignatureInvalid,
            DenyReason::Expired => RefusalCode::TokenExpired,
            DenyReason::PrincipalMismatch => RefusalCode::TokenPrincipalMismatch,
            DenyReason::ScopeMismatch => RefusalCode::TokenScopeMismatch,
            DenyReason::Replay => RefusalCode::TokenReplay,
            DenyReason::Revoked => RefusalCode::TokenRevoked,
            DenyReason::ReplayStoreUnavailable => RefusalCode::TokenReplayStoreUnavailable,
        }
    }
}

/// How a permitted action got its permission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "path", rename_all = "snake_case")]
pub enum DecisionPath {
    /// LOW/MEDIUM, or below the tier's authorization threshold.
    Unplanned,
    Plan {
        plan_id: Uuid,
        plan_hash: PlanHash,
        step_index: usize,
    },
    Token {
        token_id: String,
    },
    EmergencyOverride {
        override_receipt: String,
    },
}

/// An action was permitted (`executed: false`) or ran (`executed: true`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentActionPayload {
    pub permit_id: Uuid,
    pub action: ToolAction,
    pub classification: RiskLevel,
    pub matched_patterns: Vec<String>,
    pub decision_path: DecisionPath,
    pub executed: bool,
    /// Tool-reported result, recorded with the execution receipt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<serde_json::Value>,
}

impl ReceiptPayload for AgentActionPayload {
    const KIND: ReceiptKind = ReceiptKind::AgentAction;
}

/// An action was refused.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefusalPayload {
    pub action: ToolAction,
    pub classification: RiskLevel,
    pub matched_patterns: Vec<String>,
    pub reason_code: RefusalCode,
    /// Neutral description of the rule that applied.
    pub citation: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub safer_alternative: Option<String>,
}

impl ReceiptPayload for RefusalPayload {
    const KIND: ReceiptKind = ReceiptKind::Refusal;
}

impl ReceiptPayload for ToolPlan {
    const KIND: ReceiptKind = ReceiptKind::ToolPlan;
}

/// A Guardian verdict, bound to the plan hash it was given.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuardianVerdictPayload {
    pub plan_id: Uuid,
    pub plan_hash: PlanHash,
    pub verdict: Verdict,
    pub rationale: String,
    /// Set when this verdict resolved an earlier ESCALATE.
    #[serde(default)]
    pub escalation_resolution: bool,
}

impl ReceiptPayload for GuardianVerdictPayload {
    const KIND: ReceiptKind = ReceiptKind::GuardianVerdict;
}

/// An operator overrode a refusal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmergencyOverridePayload {
    /// Hash of the Refusal receipt being overridden.
    pub action_ref: String,
    pub action: ToolAction,
    pub justification: String,
    pub operator: String,
}

impl ReceiptPayload for EmergencyOverridePayload {
    const KIND: ReceiptKind = ReceiptKind::EmergencyOverride;
}
