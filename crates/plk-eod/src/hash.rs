//! Canonical snapshot content hash.
//!
//! Canonical form: one line per position, sorted by product id, decimals
//! normalized (trailing zeros stripped) so `1.50` and `1.500` fingerprint
//! identically. No timestamps, no reference data — two snapshots with the
//! same economic content hash the same regardless of when they were fetched.

use plk_schemas::AccountSnapshot;
use sha2::{Digest, Sha256};

pub fn canonical_content_hash(snapshot: &AccountSnapshot) -> String {
    let mut positions: Vec<_> = snapshot.positions.iter().collect();
    positions.sort_by_key(|p| p.product_id);

    let mut hasher = Sha256::new();
    for p in positions {
        let line = format!(
            "{}|{}|{}|{}|{}\n",
            p.product_id,
            p.quantity.normalize(),
            p.avg_cost_price.normalize(),
            p.cost_local.normalize(),
            p.mv_base.normalize()
        );
        hasher.update(line.as_bytes());
    }
    hex::encode(hasher.finalize())
}
