// error.rs — Error types for the receipt ledger.
//
// Uses `thiserror` to derive the standard Rust `Error` trait automatically.
// Each variant maps to a specific failure mode in the ledger pipeline.

use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur during ledger operations.
#[derive(Debug, Error)]
pub enum LedgerError {
    /// Failed to open or create the backing receipt file.
    #[error("failed to open receipt store at {path}: {source}")]
    OpenFailed {
        path: PathBuf,
        source: std::io::Error,
    },

    /// The durable write did not complete. The receipt is NOT recorded.
    #[error("durable write failed: {0}")]
    WriteFailed(#[from] std::io::Error),

    /// An earlier write failed and could not be rolled back, so the store
    /// accepts no further receipts.
    #[error("receipt store at {path} is unusable after a failed write")]
    StoreFailed { path: PathBuf },

    /// Failed to serialize or deserialize a receipt (malformed JSON).
    #[error("serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// A stored line could not be parsed back into a receipt.
    #[error("corrupt receipt store entry at line {line}: {reason}")]
    CorruptStore { line: usize, reason: String },

    /// The tri-temporal ordering `valid_time.start <= observed_at <= recorded_at` does not hold.
    #[error("temporal_invariant_violation: {detail}")]
    TemporalInvariantViolation { detail: String },

    /// The conformance tier requires tri-temporal fields that were not supplied.
    #[error("tri-temporal fields are required at tier {tier}: missing {field}")]
    MissingTemporalField { tier: String, field: String },

    /// The conformance tier requires signatures but no signer is configured.
    #[error("tier {tier} requires a receipt signer")]
    SignerRequired { tier: String },

    /// The signing capability refused or failed to sign.
    #[error("signing failed with key '{key_id}': {reason}")]
    SigningFailed { key_id: String, reason: String },

    /// Key material handed to a signer or verifier could not be parsed.
    #[error("invalid key material for '{key_id}': {reason}")]
    InvalidKey { key_id: String, reason: String },

    /// The external anchor service could not produce a proof.
    #[error("anchor service '{service}' failed: {reason}")]
    AnchorFailed { service: String, reason: String },

    /// The receipt store's lock was poisoned by a panicking writer.
    #[error("receipt store lock poisoned")]
    LockPoisoned,
}
