//! # csp-ledger
//!
//! Tamper-evident receipt ledger for the CSP gateway.
//!
//! Every protocol event (attempt, plan, verdict, execution, refusal,
//! override, law-change stage) is recorded as a [`Receipt`]. Receipts are
//! canonicalized, hash-chained per episode, optionally signed through an
//! injected [`Signer`], and written through a durable [`ReceiptStore`]
//! before `append` returns. [`verify_chain`] recomputes the whole chain and
//! reports the first receipt that can no longer be trusted.
//!
//! ## Quick Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use csp_ledger::{ConformanceTier, JsonlReceiptStore, ReceiptKind, ReceiptLedger, Temporal};
//!
//! let store = Arc::new(JsonlReceiptStore::open("/tmp/receipts.jsonl").unwrap());
//! let ledger = ReceiptLedger::open(store, ConformanceTier::Standard, None).unwrap();
//! ledger
//!     .append("episode-1", ReceiptKind::AgentAction, serde_json::json!({"tool": "shell"}), Temporal::observed_now())
//!     .unwrap();
//! assert!(ledger.verify_episode("episode-1", None).unwrap().is_valid());
//! ```

pub mod error;
pub mod hasher;
pub mod ledger;
pub mod receipt;
pub mod signer;
pub mod store;
pub mod tier;
pub mod verify;

pub use error::LedgerError;
pub use hasher::{canonical_hash, canonical_json, merkle_root, GENESIS_HASH};
pub use ledger::{AnchorPayload, AnchorService, ReceiptLedger};
pub use receipt::{Receipt, ReceiptKind, ReceiptSignature, Temporal, ValidTime};
pub use signer::{
    Ed25519Signer, Ed25519Verifier, HmacKeyring, SignatureAlgorithm, Signer, Verifier,
};
pub use store::{JsonlReceiptStore, MemoryReceiptStore, ReceiptStore};
pub use tier::ConformanceTier;
pub use verify::{verify_chain, BreakReason, ChainBreak, ChainReport, VerifyOptions};
