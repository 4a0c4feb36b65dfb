//! Scenario: rerunning EOD with an unchanged upstream response is a no-op.
//!
//! # Invariant under test
//! The duplicate gate — keyed by the canonical content hash — must stop a
//! second load of economically identical content regardless of position
//! order, decimal scale, or fetch time.
//!
//! The gate mirrors the semantics of `plk_db::hashes::hash_seen_since`:
//! - First sighting of a hash → load proceeds, hash recorded.
//! - Any later sighting within the window → COMPLETED_NOOP, no new batch.
//!
//! All tests are pure in-process; no DB or network required.

use plk_eod::canonical_content_hash;
use plk_testkit::{bd, IdempotencyGate, SnapshotFixture};

#[test]
fn identical_rerun_is_stopped_by_the_hash_gate() {
    let mut gate = IdempotencyGate::new();

    let first = SnapshotFixture::new(1001, bd(2025, 1, 15))
        .with_position(2001, "100", "150.00")
        .with_position(2002, "50", "400.00")
        .build();

    // First load: gate admits, batch would be created.
    assert!(gate.admit(&canonical_content_hash(&first)));

    // Unchanged upstream response: same hash, gate refuses.
    let rerun = SnapshotFixture::new(1001, bd(2025, 1, 15))
        .with_position(2001, "100", "150.00")
        .with_position(2002, "50", "400.00")
        .build();
    assert!(
        !gate.admit(&canonical_content_hash(&rerun)),
        "identical snapshot must be a no-op"
    );
}

#[test]
fn position_order_and_scale_do_not_defeat_the_gate() {
    let mut gate = IdempotencyGate::new();

    let first = SnapshotFixture::new(1001, bd(2025, 1, 15))
        .with_position(2001, "100", "150.00")
        .with_position(2002, "50", "400.00")
        .build();
    assert!(gate.admit(&canonical_content_hash(&first)));

    // Upstream reordered its lines and dropped trailing zeros.
    let reordered = SnapshotFixture::new(1001, bd(2025, 1, 15))
        .with_position(2002, "50.0", "400")
        .with_position(2001, "100.000", "150")
        .build();
    assert!(
        !gate.admit(&canonical_content_hash(&reordered)),
        "canonicalization must make order and scale irrelevant"
    );
}

#[test]
fn changed_content_passes_the_gate() {
    let mut gate = IdempotencyGate::new();

    let first = SnapshotFixture::new(1001, bd(2025, 1, 15))
        .with_position(2001, "100", "150.00")
        .build();
    assert!(gate.admit(&canonical_content_hash(&first)));

    // One share more: a genuinely new snapshot must load.
    let changed = SnapshotFixture::new(1001, bd(2025, 1, 15))
        .with_position(2001, "101", "150.00")
        .build();
    assert!(gate.admit(&canonical_content_hash(&changed)));
}

#[test]
fn gates_are_per_account_by_construction() {
    // Hashes are compared within one account's history; two accounts with
    // identical content use separate registries.
    let mut gate_a = IdempotencyGate::new();
    let mut gate_b = IdempotencyGate::new();

    let content = SnapshotFixture::new(1001, bd(2025, 1, 15))
        .with_position(2001, "100", "150.00")
        .build();
    let hash = canonical_content_hash(&content);

    assert!(gate_a.admit(&hash));
    assert!(gate_b.admit(&hash), "account B must not see account A's hash");
}
