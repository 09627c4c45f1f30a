// error.rs — Error types for the policy subsystem.
//
// These are configuration and infrastructure errors. Authorization failures
// (no plan, DENY, scope mismatch, bad token) are not errors: they surface as
// refusal codes so the gateway can record them as Refusal receipts.

use csp_ledger::LedgerError;
use thiserror::Error;

/// Errors that can occur during policy operations.
#[derive(Debug, Error)]
pub enum PolicyError {
    /// A configuration change would weaken a default-deny rule.
    #[error("policy_violation: {detail}")]
    PolicyViolation { detail: String },

    /// A plan was submitted with missing or out-of-range steps.
    #[error("invalid_plan: {reason}")]
    InvalidPlan { reason: String },

    /// A pattern with this id is already registered.
    #[error("pattern '{id}' is already registered")]
    DuplicatePattern { id: String },

    /// A pattern's regular expression failed to compile.
    #[error("invalid pattern '{id}': {reason}")]
    InvalidPattern { id: String, reason: String },

    /// No pattern with this id is registered.
    #[error("unknown pattern '{id}'")]
    UnknownPattern { id: String },

    /// The plan does not exist, was superseded, or expired.
    #[error("plan '{plan_id}' not found")]
    PlanNotFound { plan_id: String },

    /// An escalation resolution was given for a plan that is not escalated.
    #[error("plan '{plan_id}' has no unresolved escalation")]
    NotEscalated { plan_id: String },

    /// The consumed-token store could not be read or written.
    #[error("replay store unavailable: {reason}")]
    ReplayStoreUnavailable { reason: String },

    /// The receipt ledger refused or failed a write.
    #[error(transparent)]
    Ledger(#[from] LedgerError),

    /// A lock guarding shared policy state was poisoned by a panicking thread.
    #[error("policy state lock poisoned")]
    LockPoisoned,
}
