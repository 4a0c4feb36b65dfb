//! Weighted-average cost arithmetic.
//!
//! Pure decimal math, no I/O. The rule for a delta applied to an existing
//! position:
//!
//! - if `q_old + delta = 0`, the average cost is preserved (the flat position
//!   keeps its cost basis so a later re-entry restores normal averaging);
//! - otherwise `avg_new = (q_old * avg_old + delta * price) / (q_old + delta)`.
//!
//! Results are rounded to 8 decimal places, the storage scale.

use rust_decimal::Decimal;

pub const COST_SCALE: u32 = 8;

/// New average cost after applying a signed `delta` at `price`.
pub fn weighted_average_cost(
    q_old: Decimal,
    avg_old: Decimal,
    delta: Decimal,
    price: Decimal,
) -> Decimal {
    let q_new = q_old + delta;
    if q_new.is_zero() {
        return avg_old;
    }
    ((q_old * avg_old + delta * price) / q_new).round_dp(COST_SCALE)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dec(s: &str) -> Decimal {
        s.parse().unwrap()
    }

    #[test]
    fn buy_into_existing_position_averages_up() {
        // 100 @ 150, BUY 10 @ 160 -> 16600 / 110 = 150.909090...
        let avg = weighted_average_cost(dec("100"), dec("150"), dec("10"), dec("160"));
        assert_eq!(avg, dec("150.90909091"));
    }

    #[test]
    fn first_lot_takes_event_price() {
        let avg = weighted_average_cost(Decimal::ZERO, Decimal::ZERO, dec("10"), dec("160"));
        assert_eq!(avg, dec("160"));
    }

    #[test]
    fn flat_position_preserves_cost_basis() {
        // SELL the full position: quantity hits zero, avg cost is retained.
        let avg = weighted_average_cost(dec("100"), dec("150"), dec("-100"), dec("175"));
        assert_eq!(avg, dec("150"));
    }

    #[test]
    fn reentry_after_flat_uses_event_price() {
        let flat = weighted_average_cost(dec("100"), dec("150"), dec("-100"), dec("175"));
        let reentry = weighted_average_cost(Decimal::ZERO, flat, dec("20"), dec("180"));
        assert_eq!(reentry, dec("180"));
    }

    #[test]
    fn sell_at_average_cost_leaves_average_unchanged() {
        let avg = weighted_average_cost(dec("100"), dec("150"), dec("-40"), dec("150"));
        assert_eq!(avg, dec("150"));
    }

    #[test]
    fn short_position_averages_symmetrically() {
        // Short 50 @ 400, short 50 more @ 420 -> -41000 / -100 = 410.
        let avg = weighted_average_cost(dec("-50"), dec("400"), dec("-50"), dec("420"));
        assert_eq!(avg, dec("410"));
    }

    #[test]
    fn result_is_rounded_to_storage_scale() {
        // (3 * 1 + 1 * 2) / 4 = 1.25 exactly; (1 * 1 + 2 * 2) / 3 repeats.
        let avg = weighted_average_cost(dec("1"), dec("1"), dec("2"), dec("2"));
        assert_eq!(avg, dec("1.66666667"));
    }
}
