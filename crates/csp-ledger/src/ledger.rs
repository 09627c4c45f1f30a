// ledger.rs — The receipt ledger.
//
// The ledger is the sole owner of receipts. `append` links the new receipt to
// the episode's current tail, hashes it, signs it when a signer is
// configured, and writes it through the durable store before returning.
// Appends are serialized behind one lock, so every episode's chain is
// extended in strict causal order and two writers can never both extend the
// same tail.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::LedgerError;
use crate::hasher::{self, GENESIS_HASH};
use crate::receipt::{check_temporal, Receipt, ReceiptKind, ReceiptSignature, Temporal};
use crate::signer::{encode_signature, Signer, Verifier};
use crate::store::{MemoryReceiptStore, ReceiptStore};
use crate::tier::ConformanceTier;
use crate::verify::{verify_chain, ChainReport, VerifyOptions};

/// Body of an Anchor receipt.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AnchorPayload {
    pub anchor_service: String,
    pub proof: String,
    pub covered_receipt_ids: Vec<Uuid>,
    pub merkle_root: String,
}

/// An external service that timestamps or notarizes a Merkle root.
pub trait AnchorService: Send + Sync {
    fn name(&self) -> &str;

    /// Submit `merkle_root` and return the service's proof of inclusion.
    fn anchor(&self, merkle_root: &str) -> Result<String, LedgerError>;
}

struct ChainTail {
    hash: String,
    next_sequence: u64,
    last_recorded_at: DateTime<Utc>,
}

/// Hash-chained, optionally signed, durably persisted receipt ledger.
pub struct ReceiptLedger {
    store: Arc<dyn ReceiptStore>,
    signer: Option<Arc<dyn Signer>>,
    tier: ConformanceTier,
    tails: Mutex<HashMap<String, ChainTail>>,
}

impl ReceiptLedger {
    /// Open a ledger over a store, recovering each episode's tail from what
    /// the store already holds.
    pub fn open(
        store: Arc<dyn ReceiptStore>,
        tier: ConformanceTier,
        signer: Option<Arc<dyn Signer>>,
    ) -> Result<Self, LedgerError> {
        if tier.requires_signatures() && signer.is_none() {
            return Err(LedgerError::SignerRequired {
                tier: tier.to_string(),
            });
        }

        let mut tails = HashMap::new();
        let existing = store.read_all()?;
        for receipt in &existing {
            tails.insert(
                receipt.episode_id.clone(),
                ChainTail {
                    hash: receipt.hash.clone(),
                    next_sequence: receipt.sequence + 1,
                    last_recorded_at: receipt.recorded_at,
                },
            );
        }

        tracing::info!(
            tier = %tier,
            receipts = existing.len(),
            episodes = tails.len(),
            signed = signer.is_some(),
            "receipt ledger opened"
        );

        Ok(Self {
            store,
            signer,
            tier,
            tails: Mutex::new(tails),
        })
    }

    /// An unsigned ledger over an in-memory store.
    pub fn in_memory(tier: ConformanceTier) -> Result<Self, LedgerError> {
        Self::open(Arc::new(MemoryReceiptStore::new()), tier, None)
    }

    pub fn tier(&self) -> ConformanceTier {
        self.tier
    }

    /// Append a receipt to `episode_id` and return it once it is durable.
    ///
    /// Callers must not treat the event as recorded until this returns Ok.
    pub fn append(
        &self,
        episode_id: &str,
        kind: ReceiptKind,
        payload: serde_json::Value,
        temporal: Temporal,
    ) -> Result<Receipt, LedgerError> {
        if self.tier.requires_tri_temporal() {
            if temporal.valid_time.is_none() {
                return Err(LedgerError::MissingTemporalField {
                    tier: self.tier.to_string(),
                    field: "valid_time".to_string(),
                });
            }
            if temporal.observed_at.is_none() {
                return Err(LedgerError::MissingTemporalField {
                    tier: self.tier.to_string(),
                    field: "observed_at".to_string(),
                });
            }
        }

        let mut tails = self.tails.lock().map_err(|_| LedgerError::LockPoisoned)?;

        let now = Utc::now();
        let (prev_hash, sequence, recorded_at) = match tails.get(episode_id) {
            // recorded_at never decreases within an episode, even if the wall clock steps back.
            Some(tail) => (
                tail.hash.clone(),
                tail.next_sequence,
                now.max(tail.last_recorded_at),
            ),
            None => (GENESIS_HASH.to_string(), 0, now),
        };

        check_temporal(temporal.valid_time.as_ref(), temporal.observed_at, recorded_at)?;

        let mut receipt = Receipt {
            receipt_id: Uuid::new_v4(),
            episode_id: episode_id.to_string(),
            sequence,
            kind,
            payload,
            prev_hash,
            hash: String::new(),
            signature: None,
            valid_time: temporal.valid_time,
            observed_at: temporal.observed_at,
            recorded_at,
        };
        receipt.hash = receipt.compute_hash()?;

        if let Some(signer) = &self.signer {
            let signature = signer.sign(receipt.hash.as_bytes())?;
            receipt.signature = Some(ReceiptSignature {
                key_id: signer.key_id().to_string(),
                algorithm: signer.algorithm(),
                value: encode_signature(&signature),
            });
        }

        // Durable write first; the tail only advances once the receipt exists.
        self.store.append(&receipt)?;
        tails.insert(
            episode_id.to_string(),
            ChainTail {
                hash: receipt.hash.clone(),
                next_sequence: sequence + 1,
                last_recorded_at: recorded_at,
            },
        );

        tracing::debug!(
            episode_id = %episode_id,
            sequence,
            kind = %kind,
            hash = %receipt.hash,
            "receipt appended"
        );

        Ok(receipt)
    }

    /// Serialize a typed payload and append it.
    pub fn append_record<T: Serialize + ?Sized>(
        &self,
        episode_id: &str,
        kind: ReceiptKind,
        payload: &T,
        temporal: Temporal,
    ) -> Result<Receipt, LedgerError> {
        let value = serde_json::to_value(payload)?;
        self.append(episode_id, kind, value, temporal)
    }

    /// Every receipt in the store, across episodes, in append order.
    pub fn receipts(&self) -> Result<Vec<Receipt>, LedgerError> {
        self.store.read_all()
    }

    /// All receipts of one episode, in chain order.
    pub fn episode(&self, episode_id: &str) -> Result<Vec<Receipt>, LedgerError> {
        self.store.read_episode(episode_id)
    }

    /// Look up a receipt by hash within an episode.
    pub fn find(&self, episode_id: &str, hash: &str) -> Result<Option<Receipt>, LedgerError> {
        Ok(self
            .episode(episode_id)?
            .into_iter()
            .find(|r| r.hash == hash))
    }

    /// Hash of the last receipt in an episode, if it has any.
    pub fn tail_hash(&self, episode_id: &str) -> Result<Option<String>, LedgerError> {
        let tails = self.tails.lock().map_err(|_| LedgerError::LockPoisoned)?;
        Ok(tails.get(episode_id).map(|t| t.hash.clone()))
    }

    /// Verify an episode with this ledger's tier requirements.
    pub fn verify_episode(
        &self,
        episode_id: &str,
        verifier: Option<&dyn Verifier>,
    ) -> Result<ChainReport, LedgerError> {
        let receipts = self.episode(episode_id)?;
        Ok(verify_chain(
            &receipts,
            &VerifyOptions::for_tier(self.tier, verifier),
        ))
    }

    /// Anchor every receipt currently in an episode: compute their Merkle
    /// root, obtain a proof from the anchor service, and record an Anchor
    /// receipt naming exactly the receipts covered.
    pub fn anchor(
        &self,
        episode_id: &str,
        service: &dyn AnchorService,
        temporal: Temporal,
    ) -> Result<Receipt, LedgerError> {
        let receipts = self.episode(episode_id)?;
        let hashes: Vec<String> = receipts.iter().map(|r| r.hash.clone()).collect();
        let merkle_root = hasher::merkle_root(&hashes);
        let proof = service.anchor(&merkle_root)?;

        tracing::info!(
            episode_id = %episode_id,
            covered = receipts.len(),
            service = service.name(),
            %merkle_root,
            "episode anchored"
        );

        let payload = AnchorPayload {
            anchor_service: service.name().to_string(),
            proof,
            covered_receipt_ids: receipts.iter().map(|r| r.receipt_id).collect(),
            merkle_root,
        };
        self.append_record(episode_id, ReceiptKind::Anchor, &payload, temporal)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signer::HmacKeyring;
    use crate::store::JsonlReceiptStore;
    use crate::verify::BreakReason;
    use chrono::Duration;
    use serde_json::json;
    use tempfile::tempdir;

    struct FixedAnchor;

    impl AnchorService for FixedAnchor {
        fn name(&self) -> &str {
            "test-notary"
        }

        fn anchor(&self, merkle_root: &str) -> Result<String, LedgerError> {
            Ok(format!("proof-of-{}", merkle_root))
        }
    }

    struct FailingStore;

    impl ReceiptStore for FailingStore {
        fn append(&self, _receipt: &Receipt) -> Result<(), LedgerError> {
            Err(LedgerError::WriteFailed(std::io::Error::other("disk full")))
        }

        fn read_all(&self) -> Result<Vec<Receipt>, LedgerError> {
            Ok(Vec::new())
        }
    }

    fn append_n(ledger: &ReceiptLedger, episode: &str, n: usize) -> Vec<Receipt> {
        (0..n)
            .map(|i| {
                ledger
                    .append(
                        episode,
                        ReceiptKind::AgentAction,
                        json!({"step": i}),
                        Temporal::observed_now(),
                    )
                    .unwrap()
            })
            .collect()
    }

    #[test]
    fn first_receipt_links_to_genesis() {
        let ledger = ReceiptLedger::in_memory(ConformanceTier::Standard).unwrap();
        let receipts = append_n(&ledger, "ep", 1);
        assert_eq!(receipts[0].prev_hash, GENESIS_HASH);
        assert_eq!(receipts[0].sequence, 0);
    }

    #[test]
    fn episodes_chain_independently() {
        let ledger = ReceiptLedger::in_memory(ConformanceTier::Standard).unwrap();
        let a = append_n(&ledger, "a", 2);
        let b = append_n(&ledger, "b", 1);
        assert_eq!(a[1].prev_hash, a[0].hash);
        assert_eq!(b[0].prev_hash, GENESIS_HASH);
        assert!(ledger.verify_episode("a", None).unwrap().is_valid());
        assert!(ledger.verify_episode("b", None).unwrap().is_valid());
    }

    #[test]
    fn tampering_breaks_chain_from_that_receipt_onward() {
        let ledger = ReceiptLedger::in_memory(ConformanceTier::Standard).unwrap();
        let mut receipts = append_n(&ledger, "ep", 5);
        receipts[2].payload = json!({"step": 99});

        let report = verify_chain(&receipts, &VerifyOptions::default());
        assert!(!report.is_valid());
        assert_eq!(report.trusted_len, 2);
        let broken = report.break_at.unwrap();
        assert_eq!(broken.index, 2);
        assert!(matches!(broken.reason, BreakReason::HashMismatch { .. }));
    }

    #[test]
    fn rehashed_tamper_is_caught_at_next_link() {
        let ledger = ReceiptLedger::in_memory(ConformanceTier::Standard).unwrap();
        let mut receipts = append_n(&ledger, "ep", 3);
        receipts[1].payload = json!({"step": "forged"});
        receipts[1].hash = receipts[1].compute_hash().unwrap();

        let report = verify_chain(&receipts, &VerifyOptions::default());
        assert_eq!(report.trusted_len, 2);
        assert!(matches!(
            report.break_at.unwrap().reason,
            BreakReason::PrevHashMismatch { .. }
        ));
    }

    #[test]
    fn signed_chain_verifies_and_forged_signature_fails() {
        let keyring = Arc::new(HmacKeyring::new("ledger-key", b"ledger-secret"));
        let ledger = ReceiptLedger::open(
            Arc::new(MemoryReceiptStore::new()),
            ConformanceTier::CourtGrade,
            Some(keyring.clone()),
        )
        .unwrap();
        let mut receipts = append_n(&ledger, "ep", 3);

        let options = VerifyOptions::for_tier(ConformanceTier::CourtGrade, Some(keyring.as_ref()));
        let report = verify_chain(&receipts, &options);
        assert!(report.is_valid());
        assert_eq!(report.signatures_checked, 3);

        let other = HmacKeyring::new("ledger-key", b"attacker-secret");
        let forged = other.sign(receipts[1].hash.as_bytes()).unwrap();
        receipts[1].signature.as_mut().unwrap().value = encode_signature(&forged);
        let report = verify_chain(&receipts, &options);
        assert_eq!(report.trusted_len, 1);
        assert!(matches!(
            report.break_at.unwrap().reason,
            BreakReason::BadSignature { .. }
        ));
    }

    #[test]
    fn court_grade_requires_signer() {
        let result = ReceiptLedger::open(
            Arc::new(MemoryReceiptStore::new()),
            ConformanceTier::CourtGrade,
            None,
        );
        assert!(matches!(result, Err(LedgerError::SignerRequired { .. })));
    }

    #[test]
    fn court_grade_requires_tri_temporal_fields() {
        let ledger = ReceiptLedger::open(
            Arc::new(MemoryReceiptStore::new()),
            ConformanceTier::CourtGrade,
            Some(Arc::new(HmacKeyring::new("k", b"s"))),
        )
        .unwrap();
        let result = ledger.append("ep", ReceiptKind::AgentAction, json!({}), Temporal::none());
        assert!(matches!(result, Err(LedgerError::MissingTemporalField { .. })));
    }

    #[test]
    fn observed_in_the_future_is_rejected() {
        let ledger = ReceiptLedger::in_memory(ConformanceTier::Standard).unwrap();
        let future = Utc::now() + Duration::hours(1);
        let result = ledger.append(
            "ep",
            ReceiptKind::AgentAction,
            json!({}),
            Temporal::observed_at(future),
        );
        assert!(matches!(
            result,
            Err(LedgerError::TemporalInvariantViolation { .. })
        ));
        // Nothing was written.
        assert!(ledger.episode("ep").unwrap().is_empty());
    }

    #[test]
    fn failed_durable_write_does_not_advance_tail() {
        let ledger =
            ReceiptLedger::open(Arc::new(FailingStore), ConformanceTier::Standard, None).unwrap();
        let result = ledger.append("ep", ReceiptKind::AgentAction, json!({}), Temporal::none());
        assert!(matches!(result, Err(LedgerError::WriteFailed(_))));
        assert!(ledger.tail_hash("ep").unwrap().is_none());
    }

    #[test]
    fn reopen_continues_chain() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("receipts.jsonl");

        {
            let store = Arc::new(JsonlReceiptStore::open(&path).unwrap());
            let ledger = ReceiptLedger::open(store, ConformanceTier::Standard, None).unwrap();
            append_n(&ledger, "ep", 2);
        }

        let store = Arc::new(JsonlReceiptStore::open(&path).unwrap());
        let ledger = ReceiptLedger::open(store, ConformanceTier::Standard, None).unwrap();
        let next = append_n(&ledger, "ep", 1);
        assert_eq!(next[0].sequence, 2);
        assert!(ledger.verify_episode("ep", None).unwrap().is_valid());
        assert_eq!(ledger.episode("ep").unwrap().len(), 3);
    }

    #[test]
    fn concurrent_appends_keep_one_linear_chain() {
        let ledger = Arc::new(ReceiptLedger::in_memory(ConformanceTier::Standard).unwrap());
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let ledger = Arc::clone(&ledger);
                std::thread::spawn(move || {
                    for i in 0..10 {
                        ledger
                            .append(
                                "shared",
                                ReceiptKind::AgentAction,
                                json!({"thread": t, "i": i}),
                                Temporal::none(),
                            )
                            .unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let report = ledger.verify_episode("shared", None).unwrap();
        assert!(report.is_valid());
        assert_eq!(report.total, 80);
    }

    #[test]
    fn anchor_covers_existing_receipts() {
        let ledger = ReceiptLedger::in_memory(ConformanceTier::Standard).unwrap();
        let receipts = append_n(&ledger, "ep", 3);
        let anchor = ledger
            .anchor("ep", &FixedAnchor, Temporal::observed_now())
            .unwrap();

        let payload: AnchorPayload = anchor.payload_as().unwrap();
        assert_eq!(payload.covered_receipt_ids.len(), 3);
        assert_eq!(payload.covered_receipt_ids[0], receipts[0].receipt_id);
        let hashes: Vec<String> = receipts.iter().map(|r| r.hash.clone()).collect();
        assert_eq!(payload.merkle_root, hasher::merkle_root(&hashes));
        assert!(payload.proof.starts_with("proof-of-"));
        assert_eq!(anchor.kind, ReceiptKind::Anchor);
    }
}
