//! Scenario: an intraday event replayed with the same external_ref_id does
//! not change state, while distinct refs each apply exactly once.
//!
//! The gate mirrors `plk_db::insert_transaction_deduped`; the position math
//! is the production `weighted_average_cost`. Pure in-process.

use plk_store::weighted_average_cost;
use plk_testkit::{buy_event, dec, sell_event, IdempotencyGate};
use rust_decimal::Decimal;

/// In-memory stand-in for one position's open version.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Position {
    quantity: Decimal,
    avg_cost: Decimal,
}

impl Position {
    fn apply(&mut self, delta: Decimal, price: Decimal) {
        self.avg_cost = weighted_average_cost(self.quantity, self.avg_cost, delta, price);
        self.quantity += delta;
    }
}

fn apply_if_new(
    gate: &mut IdempotencyGate,
    position: &mut Position,
    event: &plk_schemas::IntradayEvent,
) -> bool {
    if gate.admit(&event.external_ref_id) {
        position.apply(event.signed_delta(), event.price);
        true
    } else {
        false
    }
}

#[test]
fn replay_with_same_ref_id_is_silent() {
    let mut gate = IdempotencyGate::new();
    let mut position = Position {
        quantity: dec("100"),
        avg_cost: dec("150"),
    };

    let e1 = buy_event(1001, 2001, "10", "160.00", "E1");

    assert!(apply_if_new(&mut gate, &mut position, &e1));
    assert_eq!(position.quantity, dec("110"));
    assert_eq!(position.avg_cost, dec("150.90909091"));

    let after_first = position.clone();

    // Same E1 again: no change, no error.
    assert!(!apply_if_new(&mut gate, &mut position, &e1));
    assert_eq!(position, after_first, "replay must not move the position");
}

#[test]
fn distinct_refs_each_apply_once() {
    let mut gate = IdempotencyGate::new();
    let mut position = Position {
        quantity: Decimal::ZERO,
        avg_cost: Decimal::ZERO,
    };

    let events = [
        buy_event(1001, 2001, "10", "100", "F-1"),
        buy_event(1001, 2001, "10", "110", "F-2"),
        sell_event(1001, 2001, "5", "120", "F-3"),
    ];

    for e in &events {
        assert!(apply_if_new(&mut gate, &mut position, e));
    }
    assert_eq!(position.quantity, dec("15"));

    let snapshot = position.clone();

    // Full replay in the same order: nothing moves.
    for e in &events {
        assert!(!apply_if_new(&mut gate, &mut position, e));
    }
    assert_eq!(position, snapshot);
}

#[test]
fn same_economics_different_ref_applies_twice() {
    // The gate is keyed on external_ref_id, not content: two genuinely
    // distinct trades with identical economics must both apply.
    let mut gate = IdempotencyGate::new();
    let mut position = Position {
        quantity: Decimal::ZERO,
        avg_cost: Decimal::ZERO,
    };

    apply_if_new(&mut gate, &mut position, &buy_event(1001, 2001, "10", "100", "A"));
    apply_if_new(&mut gate, &mut position, &buy_event(1001, 2001, "10", "100", "B"));

    assert_eq!(position.quantity, dec("20"));
}
