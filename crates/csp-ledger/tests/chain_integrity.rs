// Integration test: tampering with a persisted JSONL ledger is detected from
// the edited receipt onward, and nothing before it loses trust.

use std::sync::Arc;

use csp_ledger::{
    verify_chain, BreakReason, ConformanceTier, HmacKeyring, JsonlReceiptStore, ReceiptKind,
    ReceiptLedger, Temporal, VerifyOptions,
};
use serde_json::json;

fn write_episode(path: &std::path::Path, keyring: Arc<HmacKeyring>) {
    let store = Arc::new(JsonlReceiptStore::open(path).unwrap());
    let ledger = ReceiptLedger::open(store, ConformanceTier::CourtGrade, Some(keyring)).unwrap();
    for amount in [10, 20, 30, 40] {
        ledger
            .append(
                "ep-1",
                ReceiptKind::AgentAction,
                json!({"amount": amount}),
                Temporal::observed_now(),
            )
            .unwrap();
    }
}

#[test]
fn edited_line_breaks_trust_from_that_receipt() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("receipts.jsonl");
    let keyring = Arc::new(HmacKeyring::new("ledger-key", b"ledger secret"));
    write_episode(&path, Arc::clone(&keyring));

    let options = VerifyOptions::for_tier(ConformanceTier::CourtGrade, Some(keyring.as_ref()));
    let intact = JsonlReceiptStore::read_path(&path).unwrap();
    let report = verify_chain(&intact, &options);
    assert!(report.is_valid());
    assert_eq!(report.signatures_checked, 4);

    let content = std::fs::read_to_string(&path).unwrap();
    assert!(content.contains("\"amount\":30"));
    std::fs::write(&path, content.replace("\"amount\":30", "\"amount\":31")).unwrap();

    let tampered = JsonlReceiptStore::read_path(&path).unwrap();
    let report = verify_chain(&tampered, &options);
    assert_eq!(report.trusted_len, 2);
    let broken = report.break_at.unwrap();
    assert_eq!(broken.index, 2);
    assert!(matches!(broken.reason, BreakReason::HashMismatch { .. }));
}

#[test]
fn unsigned_receipts_fail_court_grade_verification() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("receipts.jsonl");
    let store = Arc::new(JsonlReceiptStore::open(&path).unwrap());
    let ledger = ReceiptLedger::open(store, ConformanceTier::Standard, None).unwrap();
    ledger
        .append(
            "ep-1",
            ReceiptKind::Refusal,
            json!({"reason_code": "no_plan"}),
            Temporal::observed_now(),
        )
        .unwrap();

    let receipts = JsonlReceiptStore::read_path(&path).unwrap();
    assert!(verify_chain(&receipts, &VerifyOptions::default()).is_valid());

    let keyring = HmacKeyring::new("ledger-key", b"ledger secret");
    let strict = VerifyOptions::for_tier(ConformanceTier::CourtGrade, Some(&keyring));
    let report = verify_chain(&receipts, &strict);
    assert_eq!(report.trusted_len, 0);
    assert!(matches!(
        report.break_at.unwrap().reason,
        BreakReason::MissingSignature
    ));
}
