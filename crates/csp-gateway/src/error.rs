// error.rs — Error types for the gateway.
//
// A GatewayError means the operation itself failed. Refusals are not errors:
// they come back as `Decision::Refused` with a receipt already written.

use std::path::PathBuf;

use csp_ledger::LedgerError;
use csp_policy::{LawChangeError, PolicyError};
use thiserror::Error;

/// Errors that can occur during gateway operations.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// The configuration file is missing, unreadable, or malformed.
    #[error("invalid configuration at {path}: {reason}")]
    Config { path: PathBuf, reason: String },

    /// A policy component rejected its configuration or failed internally.
    #[error("policy error: {0}")]
    Policy(#[from] PolicyError),

    /// The ledger could not durably record a receipt. The operation did not happen.
    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),

    /// A law-change episode was not admitted.
    #[error("law change rejected: {0}")]
    LawChange(#[from] LawChangeError),

    /// An emergency override request is incomplete or does not reference a refusal.
    #[error("invalid emergency override: {0}")]
    InvalidOverride(String),

    /// Token operations need a verifier, and this gateway was built without one.
    #[error("capability tokens are not enabled on this gateway")]
    TokensDisabled,

    /// Shared gateway state was poisoned by a panicking thread.
    #[error("gateway state lock poisoned")]
    LockPoisoned,
}
