//! Active-batch lookup cache.
//!
//! Intraday events resolve the account's ACTIVE batch on every event; the
//! lookup is cached with a 5-minute TTL and explicitly evicted whenever a
//! promotion or rollback changes the answer.

use cached::proc_macro::cached;
use sqlx::PgPool;

/// TTL for the active-batch cache in seconds.
pub const ACTIVE_BATCH_TTL_SECONDS: u64 = 300;

/// Resolve the current ACTIVE batch id for an account, cached.
///
/// Errors are not cached (`result = true`), so a transient DB failure does
/// not pin a miss for the whole TTL.
#[cached(
    time = 300,
    key = "i64",
    convert = r#"{ account_id }"#,
    result = true
)]
pub async fn active_batch_id_cached(pool: PgPool, account_id: i64) -> Result<Option<i64>, String> {
    tracing::debug!(account_id, "[cache] resolving active batch from database");
    let batch = plk_db::fetch_active_batch(&pool, account_id)
        .await
        .map_err(|e| format!("fetch_active_batch failed: {e}"))?;
    Ok(batch.map(|b| b.batch_id))
}

/// Drop the cached entry for an account after a promote/rollback.
pub async fn evict_active_batch(account_id: i64) {
    use cached::Cached;
    ACTIVE_BATCH_ID_CACHED
        .lock()
        .await
        .cache_remove(&account_id);
}

/// TTL for ticker resolution: products change rarely.
pub const TICKER_TTL_SECONDS: u64 = 1800;

/// Resolve a product id from its ticker, cached for 30 minutes.
#[cached(
    time = 1800,
    key = "String",
    convert = r#"{ ticker.clone() }"#,
    result = true
)]
pub async fn product_id_by_ticker_cached(
    pool: PgPool,
    ticker: String,
) -> Result<Option<i64>, String> {
    tracing::debug!(%ticker, "[cache] resolving ticker from database");
    plk_db::resolve_product_by_ticker(&pool, &ticker)
        .await
        .map_err(|e| format!("resolve_product_by_ticker failed: {e}"))
}

/// Drop the cached resolution for a ticker after its product was upserted.
pub async fn evict_ticker(ticker: &str) {
    use cached::Cached;
    PRODUCT_ID_BY_TICKER_CACHED
        .lock()
        .await
        .cache_remove(&ticker.to_string());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ttl_constant_matches_resource_model() {
        assert_eq!(ACTIVE_BATCH_TTL_SECONDS, 300);
    }
}
