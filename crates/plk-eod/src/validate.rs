//! Snapshot validation.
//!
//! Structural checks produce errors (the run fails); business checks produce
//! warnings that only fail the run in strict mode.

use plk_config::ValidationConfig;
use plk_db::PositionRow;
use plk_schemas::AccountSnapshot;
use rust_decimal::Decimal;
use std::collections::HashMap;

/// Maximum fractional digits accepted for quantity/price fields.
const MAX_SCALE: u32 = 8;

#[derive(Debug, Default, Clone)]
pub struct ValidationReport {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationReport {
    /// Does the report fail the run under the given strictness?
    pub fn fails(&self, strict_mode: bool) -> bool {
        !self.errors.is_empty() || (strict_mode && !self.warnings.is_empty())
    }
}

/// Validate a snapshot against the config thresholds and the prior ACTIVE
/// batch (for suspicious-change detection). `prior` may be empty for a
/// first-ever load.
pub fn validate_snapshot(
    snapshot: &AccountSnapshot,
    prior: &[PositionRow],
    cfg: &ValidationConfig,
) -> ValidationReport {
    let mut report = ValidationReport::default();

    // Structural checks.
    if snapshot.account_id <= 0 {
        report.errors.push("account_id must be positive".into());
    }
    for (idx, p) in snapshot.positions.iter().enumerate() {
        if p.product_id <= 0 {
            report
                .errors
                .push(format!("position[{idx}]: product_id must be positive"));
        }
        for (field, value) in [
            ("quantity", p.quantity),
            ("avg_cost_price", p.avg_cost_price),
        ] {
            if value.normalize().scale() > MAX_SCALE {
                report.errors.push(format!(
                    "position[{idx}]: {field} scale {} exceeds {MAX_SCALE}",
                    value.normalize().scale()
                ));
            }
        }
        if p.avg_cost_price < Decimal::ZERO {
            report
                .errors
                .push(format!("position[{idx}]: negative avg_cost_price"));
        }
    }

    if snapshot.positions.is_empty() {
        report.warnings.push("snapshot carries no positions".into());
        return report;
    }

    // Zero-price ratio.
    let zero_priced = snapshot
        .positions
        .iter()
        .filter(|p| p.avg_cost_price.is_zero())
        .count();
    let zero_pct = zero_priced * 100 / snapshot.positions.len();
    if zero_pct > cfg.zero_price_threshold_pct as usize {
        report.warnings.push(format!(
            "{zero_pct}% of positions are zero-priced (threshold {}%)",
            cfg.zero_price_threshold_pct
        ));
    }

    // Suspicious per-position quantity change vs the prior ACTIVE batch.
    let prior_qty: HashMap<i64, Decimal> =
        prior.iter().map(|p| (p.product_id, p.quantity)).collect();
    let threshold = Decimal::from(cfg.suspicious_change_pct);
    for p in &snapshot.positions {
        let Some(old) = prior_qty.get(&p.product_id) else {
            continue;
        };
        if old.is_zero() {
            continue;
        }
        let change_pct = ((p.quantity - old) / old).abs() * Decimal::ONE_HUNDRED;
        if change_pct > threshold {
            report.warnings.push(format!(
                "product {}: quantity moved {:.2}% vs prior ACTIVE (threshold {}%)",
                p.product_id, change_pct, cfg.suspicious_change_pct
            ));
        }
    }

    report
}
