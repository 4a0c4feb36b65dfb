//! Snapshot content-hash registry for duplicate detection.

use anyhow::{Context, Result};
use chrono::NaiveDate;
use rust_decimal::Decimal;
use sqlx::{PgExecutor, Row};

#[derive(Debug, Clone)]
pub struct SnapshotHashRow {
    pub account_id: i64,
    pub business_date: NaiveDate,
    pub content_hash: String,
    pub position_count: i32,
    pub total_quantity: Decimal,
    pub total_market_value: Decimal,
}

/// Record (or refresh) the hash for a promoted snapshot.
pub async fn upsert_snapshot_hash<'e>(ex: impl PgExecutor<'e>, h: &SnapshotHashRow) -> Result<()> {
    sqlx::query(
        r#"
        insert into snapshot_hashes (
          account_id, business_date, content_hash,
          position_count, total_quantity, total_market_value
        ) values ($1, $2, $3, $4, $5, $6)
        on conflict (account_id, business_date) do update
            set content_hash       = excluded.content_hash,
                position_count     = excluded.position_count,
                total_quantity     = excluded.total_quantity,
                total_market_value = excluded.total_market_value
        "#,
    )
    .bind(h.account_id)
    .bind(h.business_date)
    .bind(&h.content_hash)
    .bind(h.position_count)
    .bind(h.total_quantity)
    .bind(h.total_market_value)
    .execute(ex)
    .await
    .context("upsert_snapshot_hash failed")?;

    Ok(())
}

/// True when the same content hash was recorded for this account on or after
/// `since` (the 7-day duplicate-detection window).
pub async fn hash_seen_since<'e>(
    ex: impl PgExecutor<'e>,
    account_id: i64,
    content_hash: &str,
    since: NaiveDate,
) -> Result<bool> {
    let row: Option<(i64,)> = sqlx::query_as(
        r#"
        select 1::bigint
        from snapshot_hashes
        where account_id = $1
          and content_hash = $2
          and business_date >= $3
        limit 1
        "#,
    )
    .bind(account_id)
    .bind(content_hash)
    .bind(since)
    .fetch_optional(ex)
    .await
    .context("hash_seen_since failed")?;

    Ok(row.is_some())
}

pub async fn fetch_snapshot_hash<'e>(
    ex: impl PgExecutor<'e>,
    account_id: i64,
    business_date: NaiveDate,
) -> Result<Option<SnapshotHashRow>> {
    let row = sqlx::query(
        r#"
        select account_id, business_date, content_hash,
               position_count, total_quantity, total_market_value
        from snapshot_hashes
        where account_id = $1 and business_date = $2
        "#,
    )
    .bind(account_id)
    .bind(business_date)
    .fetch_optional(ex)
    .await
    .context("fetch_snapshot_hash failed")?;

    let Some(row) = row else { return Ok(None) };

    Ok(Some(SnapshotHashRow {
        account_id: row.try_get("account_id")?,
        business_date: row.try_get("business_date")?,
        content_hash: row.try_get("content_hash")?,
        position_count: row.try_get("position_count")?,
        total_quantity: row.try_get("total_quantity")?,
        total_market_value: row.try_get("total_market_value")?,
    }))
}
