// lawchange.rs — Governed changes to the enforcement rules.
//
// The default-deny set can only shrink (and only be amended) through a
// law-change episode: five receipts, recorded as their own ledger episode,
// in exactly this order:
//
//   InvariantViolation → SelfRepairProposal → SandboxRun → CouncilDecision → SelfRepairOutcome
//
// An episode that is incomplete, out of order, unlinked, unsigned (at
// Court-Grade), or internally inconsistent is treated as never having
// happened. The only thing that can apply a rule change is a
// `LawChangeAdmission`, and the only way to obtain one is through
// `LawChangeValidator`.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use csp_ledger::{
    canonical_hash, verify_chain, ChainBreak, ConformanceTier, LedgerError, Receipt, ReceiptKind,
    Verifier, VerifyOptions,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::pattern::PatternSpec;
use crate::receipts::ReceiptPayload;

/// Deployment environment. Only Development accepts provisional law changes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Environment {
    Development,
    Staging,
    #[default]
    Production,
}

impl FromStr for Environment {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "development" | "dev" => Ok(Environment::Development),
            "staging" => Ok(Environment::Staging),
            "production" | "prod" => Ok(Environment::Production),
            other => Err(format!("unknown environment '{}'", other)),
        }
    }
}

/// A proposed modification of the default-deny set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum RuleChange {
    AddDefaultPattern { pattern: PatternSpec },
    RemoveDefaultPattern { id: String },
}

impl RuleChange {
    /// Canonical hash of the change, quoted by the outcome receipt.
    pub fn digest(&self) -> Result<String, LedgerError> {
        canonical_hash(self)
    }
}

impl fmt::Display for RuleChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuleChange::AddDefaultPattern { pattern } => {
                write!(f, "add default pattern '{}'", pattern.id)
            }
            RuleChange::RemoveDefaultPattern { id } => write!(f, "remove default pattern '{}'", id),
        }
    }
}

// Stage payloads. Every stage names the proposal it belongs to.

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvariantViolationPayload {
    pub proposal_id: String,
    /// Which invariant was found wanting (e.g. a pattern id).
    pub invariant: String,
    pub evidence: String,
}

impl ReceiptPayload for InvariantViolationPayload {
    const KIND: ReceiptKind = ReceiptKind::InvariantViolation;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelfRepairProposalPayload {
    pub proposal_id: String,
    pub change: RuleChange,
    pub rationale: String,
    pub proposed_by: String,
}

impl ReceiptPayload for SelfRepairProposalPayload {
    const KIND: ReceiptKind = ReceiptKind::SelfRepairProposal;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxRunPayload {
    pub proposal_id: String,
    pub passed: bool,
    pub report: String,
}

impl ReceiptPayload for SandboxRunPayload {
    const KIND: ReceiptKind = ReceiptKind::SandboxRun;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CouncilDecisionPayload {
    pub proposal_id: String,
    pub approved: bool,
    pub members: Vec<String>,
    pub rationale: String,
}

impl ReceiptPayload for CouncilDecisionPayload {
    const KIND: ReceiptKind = ReceiptKind::CouncilDecision;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelfRepairOutcomePayload {
    pub proposal_id: String,
    /// `RuleChange::digest` of the proposed change.
    pub change_digest: String,
    pub applied_by: String,
}

impl ReceiptPayload for SelfRepairOutcomePayload {
    const KIND: ReceiptKind = ReceiptKind::SelfRepairOutcome;
}

/// Why a law-change episode is not admissible.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LawChangeError {
    #[error("a law-change episode has exactly 5 receipts, found {found}")]
    WrongLength { found: usize },

    #[error("receipt {index} is {found}, expected {expected}")]
    OutOfOrder {
        index: usize,
        expected: ReceiptKind,
        found: ReceiptKind,
    },

    #[error("episode chain broken at receipt {}: {}", .0.index, .0.reason)]
    ChainBroken(ChainBreak),

    #[error("observed_at goes backwards at receipt {index}")]
    TimestampRegression { index: usize },

    #[error("receipt {index} ({kind}) has a malformed payload: {reason}")]
    MalformedPayload {
        index: usize,
        kind: ReceiptKind,
        reason: String,
    },

    #[error("receipt {index} belongs to proposal '{found}', expected '{expected}'")]
    ProposalMismatch {
        index: usize,
        expected: String,
        found: String,
    },

    #[error("sandbox run did not pass")]
    SandboxFailed,

    #[error("council did not approve the change")]
    NotApproved,

    #[error("outcome digest {found} does not match the proposed change {expected}")]
    DigestMismatch { expected: String, found: String },
}

/// Proof that a rule change went through a valid law-change episode.
///
/// Fields are private: only `LawChangeValidator` constructs admissions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LawChangeAdmission {
    episode_id: String,
    proposal_id: String,
    change: RuleChange,
    provisional: bool,
    warnings: Vec<String>,
}

impl LawChangeAdmission {
    pub fn episode_id(&self) -> &str {
        &self.episode_id
    }

    pub fn proposal_id(&self) -> &str {
        &self.proposal_id
    }

    pub fn change(&self) -> &RuleChange {
        &self.change
    }

    /// Admitted despite an invalid episode (development only).
    pub fn is_provisional(&self) -> bool {
        self.provisional
    }

    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }
}

/// Validates law-change episodes.
pub struct LawChangeValidator {
    tier: ConformanceTier,
    verifier: Option<Arc<dyn Verifier>>,
}

impl LawChangeValidator {
    pub fn new(tier: ConformanceTier, verifier: Option<Arc<dyn Verifier>>) -> Self {
        Self { tier, verifier }
    }

    /// Validate a complete episode. Success yields a binding admission.
    pub fn validate_episode(
        &self,
        receipts: &[Receipt],
    ) -> Result<LawChangeAdmission, LawChangeError> {
        if receipts.len() != ReceiptKind::LAW_CHANGE_SEQUENCE.len() {
            return Err(LawChangeError::WrongLength {
                found: receipts.len(),
            });
        }
        for (index, (receipt, expected)) in receipts
            .iter()
            .zip(ReceiptKind::LAW_CHANGE_SEQUENCE)
            .enumerate()
        {
            if receipt.kind != expected {
                return Err(LawChangeError::OutOfOrder {
                    index,
                    expected,
                    found: receipt.kind,
                });
            }
        }

        // Linkage, hashes, signatures, tri-temporal, recorded_at order.
        let options = VerifyOptions::for_tier(self.tier, self.verifier.as_deref());
        let report = verify_chain(receipts, &options);
        if let Some(broken) = report.break_at {
            return Err(LawChangeError::ChainBroken(broken));
        }
        for (index, pair) in receipts.windows(2).enumerate() {
            if let (Some(before), Some(after)) = (pair[0].observed_at, pair[1].observed_at) {
                if after < before {
                    return Err(LawChangeError::TimestampRegression { index: index + 1 });
                }
            }
        }

        let violation: InvariantViolationPayload = payload(receipts, 0)?;
        let proposal: SelfRepairProposalPayload = payload(receipts, 1)?;
        let sandbox: SandboxRunPayload = payload(receipts, 2)?;
        let council: CouncilDecisionPayload = payload(receipts, 3)?;
        let outcome: SelfRepairOutcomePayload = payload(receipts, 4)?;

        let expected = &proposal.proposal_id;
        for (index, found) in [
            (0, &violation.proposal_id),
            (2, &sandbox.proposal_id),
            (3, &council.proposal_id),
            (4, &outcome.proposal_id),
        ] {
            if found != expected {
                return Err(LawChangeError::ProposalMismatch {
                    index,
                    expected: expected.clone(),
                    found: found.clone(),
                });
            }
        }

        if !sandbox.passed {
            return Err(LawChangeError::SandboxFailed);
        }
        if !council.approved {
            return Err(LawChangeError::NotApproved);
        }

        let digest = proposal
            .change
            .digest()
            .map_err(|e| LawChangeError::MalformedPayload {
                index: 1,
                kind: ReceiptKind::SelfRepairProposal,
                reason: e.to_string(),
            })?;
        if outcome.change_digest != digest {
            return Err(LawChangeError::DigestMismatch {
                expected: digest,
                found: outcome.change_digest,
            });
        }

        Ok(LawChangeAdmission {
            episode_id: receipts[0].episode_id.clone(),
            proposal_id: proposal.proposal_id,
            change: proposal.change,
            provisional: false,
            warnings: Vec::new(),
        })
    }

    /// Admit a change in `environment`. Outside Development an invalid
    /// episode is rejected outright. In Development, an invalid episode that
    /// still carries a readable proposal is admitted provisionally.
    pub fn admit(
        &self,
        receipts: &[Receipt],
        environment: Environment,
    ) -> Result<LawChangeAdmission, LawChangeError> {
        let error = match self.validate_episode(receipts) {
            Ok(admission) => {
                tracing::info!(
                    proposal_id = %admission.proposal_id,
                    change = %admission.change,
                    "law change admitted"
                );
                return Ok(admission);
            }
            Err(error) => error,
        };

        if environment != Environment::Development {
            tracing::warn!(?environment, %error, "law change rejected");
            return Err(error);
        }

        let proposal = receipts
            .iter()
            .find(|r| r.kind == ReceiptKind::SelfRepairProposal)
            .and_then(|r| r.payload_as::<SelfRepairProposalPayload>().ok());
        match proposal {
            Some(proposal) => {
                tracing::warn!(
                    proposal_id = %proposal.proposal_id,
                    %error,
                    "law change admitted provisionally in development"
                );
                Ok(LawChangeAdmission {
                    episode_id: receipts
                        .first()
                        .map(|r| r.episode_id.clone())
                        .unwrap_or_default(),
                    proposal_id: proposal.proposal_id,
                    change: proposal.change,
                    provisional: true,
                    warnings: vec![error.to_string()],
                })
            }
            None => Err(error),
        }
    }
}

fn payload<T: DeserializeOwned>(receipts: &[Receipt], index: usize) -> Result<T, LawChangeError> {
    receipts[index]
        .payload_as()
        .map_err(|e| LawChangeError::MalformedPayload {
            index,
            kind: receipts[index].kind,
            reason: e.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::receipts::record;
    use csp_ledger::{HmacKeyring, MemoryReceiptStore, ReceiptLedger, Temporal};

    fn remove_pipe_to_shell() -> RuleChange {
        RuleChange::RemoveDefaultPattern {
            id: "pipe_to_shell".to_string(),
        }
    }

    fn record_episode(ledger: &ReceiptLedger, episode: &str, approved: bool) -> Vec<Receipt> {
        record_episode_at(ledger, episode, approved, &|_| Temporal::observed_now())
    }

    fn record_episode_at(
        ledger: &ReceiptLedger,
        episode: &str,
        approved: bool,
        temporal: &dyn Fn(usize) -> Temporal,
    ) -> Vec<Receipt> {
        let change = remove_pipe_to_shell();
        let id = "prop-1".to_string();
        let mut stage = 0;
        let mut t = || {
            stage += 1;
            temporal(stage - 1)
        };
        record(
            ledger,
            episode,
            &InvariantViolationPayload {
                proposal_id: id.clone(),
                invariant: "pipe_to_shell".to_string(),
                evidence: "blocks the vetted installer".to_string(),
            },
            t(),
        )
        .unwrap();
        record(
            ledger,
            episode,
            &SelfRepairProposalPayload {
                proposal_id: id.clone(),
                change: change.clone(),
                rationale: "installer is pinned and checksummed".to_string(),
                proposed_by: "repair-agent".to_string(),
            },
            t(),
        )
        .unwrap();
        record(
            ledger,
            episode,
            &SandboxRunPayload {
                proposal_id: id.clone(),
                passed: true,
                report: "42 scenarios passed".to_string(),
            },
            t(),
        )
        .unwrap();
        record(
            ledger,
            episode,
            &CouncilDecisionPayload {
                proposal_id: id.clone(),
                approved,
                members: vec!["alice".to_string(), "bob".to_string()],
                rationale: "reviewed".to_string(),
            },
            t(),
        )
        .unwrap();
        record(
            ledger,
            episode,
            &SelfRepairOutcomePayload {
                proposal_id: id,
                change_digest: change.digest().unwrap(),
                applied_by: "operator".to_string(),
            },
            t(),
        )
        .unwrap();
        ledger.episode(episode).unwrap()
    }

    fn standard() -> (ReceiptLedger, LawChangeValidator) {
        (
            ReceiptLedger::in_memory(ConformanceTier::Standard).unwrap(),
            LawChangeValidator::new(ConformanceTier::Standard, None),
        )
    }

    #[test]
    fn complete_episode_is_admitted() {
        let (ledger, validator) = standard();
        let receipts = record_episode(&ledger, "law-1", true);
        let admission = validator.validate_episode(&receipts).unwrap();
        assert_eq!(admission.proposal_id(), "prop-1");
        assert_eq!(admission.change(), &remove_pipe_to_shell());
        assert!(!admission.is_provisional());
    }

    #[test]
    fn missing_receipt_is_rejected() {
        let (ledger, validator) = standard();
        let receipts = record_episode(&ledger, "law-1", true);
        let partial = &receipts[..4];
        assert_eq!(
            validator.validate_episode(partial).unwrap_err(),
            LawChangeError::WrongLength { found: 4 }
        );
    }

    #[test]
    fn reordered_episode_is_rejected() {
        let (ledger, validator) = standard();
        let mut receipts = record_episode(&ledger, "law-1", true);
        receipts.swap(2, 3);
        assert!(matches!(
            validator.validate_episode(&receipts),
            Err(LawChangeError::OutOfOrder { index: 2, .. })
        ));
    }

    #[test]
    fn out_of_order_timestamp_is_rejected() {
        let (ledger, validator) = standard();
        let base = chrono::Utc::now() - chrono::Duration::minutes(10);
        // The council's observation predates the sandbox run it decided on.
        let receipts = record_episode_at(&ledger, "law-1", true, &|stage| {
            let minutes = if stage == 3 { 1 } else { stage as i64 + 1 };
            Temporal::observed_at(base + chrono::Duration::minutes(minutes))
        });
        assert_eq!(
            validator.validate_episode(&receipts).unwrap_err(),
            LawChangeError::TimestampRegression { index: 3 }
        );
    }

    #[test]
    fn edited_receipt_breaks_the_episode() {
        let (ledger, validator) = standard();
        let mut receipts = record_episode(&ledger, "law-1", true);
        receipts[3].recorded_at = receipts[2].recorded_at - chrono::Duration::seconds(10);
        assert!(matches!(
            validator.validate_episode(&receipts),
            Err(LawChangeError::ChainBroken(ref b)) if b.index == 3
        ));
    }

    #[test]
    fn rejected_council_blocks_admission() {
        let (ledger, validator) = standard();
        let receipts = record_episode(&ledger, "law-1", false);
        assert_eq!(
            validator.validate_episode(&receipts).unwrap_err(),
            LawChangeError::NotApproved
        );
        assert!(validator.admit(&receipts, Environment::Production).is_err());
        let provisional = validator.admit(&receipts, Environment::Development).unwrap();
        assert!(provisional.is_provisional());
        assert_eq!(provisional.warnings().len(), 1);
    }

    #[test]
    fn court_grade_requires_signatures() {
        let keys = Arc::new(HmacKeyring::new("council-key", b"council-secret"));
        let signed = ReceiptLedger::open(
            Arc::new(MemoryReceiptStore::new()),
            ConformanceTier::CourtGrade,
            Some(keys.clone()),
        )
        .unwrap();
        let receipts = record_episode(&signed, "law-1", true);
        let validator = LawChangeValidator::new(ConformanceTier::CourtGrade, Some(keys));
        assert!(validator.validate_episode(&receipts).is_ok());

        let (unsigned_ledger, _) = standard();
        let unsigned = record_episode(&unsigned_ledger, "law-2", true);
        assert!(matches!(
            validator.validate_episode(&unsigned),
            Err(LawChangeError::ChainBroken(_))
        ));
    }

    #[test]
    fn outcome_must_quote_the_proposed_change() {
        let ledger = ReceiptLedger::in_memory(ConformanceTier::Standard).unwrap();
        let validator = LawChangeValidator::new(ConformanceTier::Standard, None);
        let t = Temporal::observed_now;
        let id = "prop-9".to_string();
        record(
            &ledger,
            "law-9",
            &InvariantViolationPayload {
                proposal_id: id.clone(),
                invariant: "x".to_string(),
                evidence: "y".to_string(),
            },
            t(),
        )
        .unwrap();
        record(
            &ledger,
            "law-9",
            &SelfRepairProposalPayload {
                proposal_id: id.clone(),
                change: remove_pipe_to_shell(),
                rationale: "r".to_string(),
                proposed_by: "p".to_string(),
            },
            t(),
        )
        .unwrap();
        record(
            &ledger,
            "law-9",
            &SandboxRunPayload {
                proposal_id: id.clone(),
                passed: true,
                report: "ok".to_string(),
            },
            t(),
        )
        .unwrap();
        record(
            &ledger,
            "law-9",
            &CouncilDecisionPayload {
                proposal_id: id.clone(),
                approved: true,
                members: vec![],
                rationale: "ok".to_string(),
            },
            t(),
        )
        .unwrap();
        let swapped = RuleChange::RemoveDefaultPattern {
            id: "recursive_root_delete".to_string(),
        };
        record(
            &ledger,
            "law-9",
            &SelfRepairOutcomePayload {
                proposal_id: id,
                change_digest: swapped.digest().unwrap(),
                applied_by: "operator".to_string(),
            },
            t(),
        )
        .unwrap();

        let receipts = ledger.episode("law-9").unwrap();
        assert!(matches!(
            validator.validate_episode(&receipts),
            Err(LawChangeError::DigestMismatch { .. })
        ));
    }
}
