//! Account batch queries: allocation, lookup, and status transitions.
//!
//! The promote/rollback transactions live in `plk-store`; this module only
//! provides the statements they compose. Status guards are written into the
//! WHERE clause so a stale caller updates zero rows instead of corrupting a
//! batch that moved on.

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use plk_schemas::BatchStatus;
use sqlx::{PgExecutor, Row};

#[derive(Debug, Clone)]
pub struct BatchRow {
    pub account_id: i64,
    pub batch_id: i64,
    pub business_date: NaiveDate,
    pub status: BatchStatus,
    pub position_count: i32,
    pub error_message: Option<String>,
    pub source: String,
    pub created_at_utc: DateTime<Utc>,
    pub activated_at_utc: Option<DateTime<Utc>>,
    pub archived_at_utc: Option<DateTime<Utc>>,
}

fn map_batch(row: &sqlx::postgres::PgRow) -> Result<BatchRow> {
    Ok(BatchRow {
        account_id: row.try_get("account_id")?,
        batch_id: row.try_get("batch_id")?,
        business_date: row.try_get("business_date")?,
        status: BatchStatus::parse(&row.try_get::<String, _>("status")?)?,
        position_count: row.try_get("position_count")?,
        error_message: row.try_get("error_message")?,
        source: row.try_get("source")?,
        created_at_utc: row.try_get("created_at_utc")?,
        activated_at_utc: row.try_get("activated_at_utc")?,
        archived_at_utc: row.try_get("archived_at_utc")?,
    })
}

const BATCH_COLUMNS: &str = "account_id, batch_id, business_date, status, position_count, \
                             error_message, source, created_at_utc, activated_at_utc, archived_at_utc";

/// Allocate the next batch id for an account and insert the STAGING row.
///
/// Callers hold the per-account EOD lock, so max+1 cannot race for the same
/// account; the primary key rejects it anyway if a rogue writer slips in.
pub async fn allocate_batch<'e>(
    ex: impl PgExecutor<'e>,
    account_id: i64,
    business_date: NaiveDate,
    source: &str,
) -> Result<i64> {
    let row = sqlx::query(
        r#"
        insert into account_batches (account_id, batch_id, business_date, status, source)
        select $1, coalesce(max(batch_id), 0) + 1, $2, 'STAGING', $3
        from account_batches
        where account_id = $1
        returning batch_id
        "#,
    )
    .bind(account_id)
    .bind(business_date)
    .bind(source)
    .fetch_one(ex)
    .await
    .context("allocate_batch failed")?;

    Ok(row.try_get("batch_id")?)
}

pub async fn fetch_batch<'e>(
    ex: impl PgExecutor<'e>,
    account_id: i64,
    batch_id: i64,
) -> Result<Option<BatchRow>> {
    let row = sqlx::query(&format!(
        "select {BATCH_COLUMNS} from account_batches where account_id = $1 and batch_id = $2"
    ))
    .bind(account_id)
    .bind(batch_id)
    .fetch_optional(ex)
    .await
    .context("fetch_batch failed")?;

    row.as_ref().map(map_batch).transpose()
}

/// The ACTIVE batch for a specific business date, if any.
pub async fn fetch_active_batch_for_date<'e>(
    ex: impl PgExecutor<'e>,
    account_id: i64,
    business_date: NaiveDate,
) -> Result<Option<BatchRow>> {
    let row = sqlx::query(&format!(
        r#"
        select {BATCH_COLUMNS}
        from account_batches
        where account_id = $1 and business_date = $2 and status = 'ACTIVE'
        "#
    ))
    .bind(account_id)
    .bind(business_date)
    .fetch_optional(ex)
    .await
    .context("fetch_active_batch_for_date failed")?;

    row.as_ref().map(map_batch).transpose()
}

/// The account's current ACTIVE batch across dates (most recent business
/// date wins). This is what intraday events mutate.
pub async fn fetch_active_batch<'e>(
    ex: impl PgExecutor<'e>,
    account_id: i64,
) -> Result<Option<BatchRow>> {
    let row = sqlx::query(&format!(
        r#"
        select {BATCH_COLUMNS}
        from account_batches
        where account_id = $1 and status = 'ACTIVE'
        order by business_date desc
        limit 1
        "#
    ))
    .bind(account_id)
    .fetch_optional(ex)
    .await
    .context("fetch_active_batch failed")?;

    row.as_ref().map(map_batch).transpose()
}

pub async fn list_batches_for_account<'e>(
    ex: impl PgExecutor<'e>,
    account_id: i64,
    limit: i64,
) -> Result<Vec<BatchRow>> {
    let rows = sqlx::query(&format!(
        r#"
        select {BATCH_COLUMNS}
        from account_batches
        where account_id = $1
        order by batch_id desc
        limit $2
        "#
    ))
    .bind(account_id)
    .bind(limit)
    .fetch_all(ex)
    .await
    .context("list_batches_for_account failed")?;

    rows.iter().map(map_batch).collect()
}

/// STAGING -> FAILED with the failure message. Returns false if the batch was
/// not in STAGING (it already moved on; the caller lost its lease).
pub async fn mark_batch_failed<'e>(
    ex: impl PgExecutor<'e>,
    account_id: i64,
    batch_id: i64,
    error_message: &str,
) -> Result<bool> {
    let row: Option<(i64,)> = sqlx::query_as(
        r#"
        update account_batches
           set status        = 'FAILED',
               error_message = $3
         where account_id = $1
           and batch_id = $2
           and status = 'STAGING'
        returning batch_id
        "#,
    )
    .bind(account_id)
    .bind(batch_id)
    .bind(error_message)
    .fetch_optional(ex)
    .await
    .context("mark_batch_failed failed")?;

    Ok(row.is_some())
}

/// Conditional status transition with prior-state guard, used by the store's
/// promote/rollback transactions. Returns true if exactly this transition
/// was applied.
pub async fn transition_batch<'e>(
    ex: impl PgExecutor<'e>,
    account_id: i64,
    batch_id: i64,
    from: BatchStatus,
    to: BatchStatus,
) -> Result<bool> {
    anyhow::ensure!(
        from.can_transition(to),
        "illegal batch transition {} -> {}",
        from.as_str(),
        to.as_str()
    );

    let row: Option<(i64,)> = sqlx::query_as(
        r#"
        update account_batches
           set status           = $4,
               activated_at_utc = case when $4 = 'ACTIVE' then now() else activated_at_utc end,
               archived_at_utc  = case when $4 = 'ARCHIVED' then now() else archived_at_utc end
         where account_id = $1
           and batch_id = $2
           and status = $3
        returning batch_id
        "#,
    )
    .bind(account_id)
    .bind(batch_id)
    .bind(from.as_str())
    .bind(to.as_str())
    .fetch_optional(ex)
    .await
    .context("transition_batch failed")?;

    Ok(row.is_some())
}

/// Most recently archived batch for (account, date) — the rollback target.
pub async fn fetch_latest_archived<'e>(
    ex: impl PgExecutor<'e>,
    account_id: i64,
    business_date: NaiveDate,
) -> Result<Option<BatchRow>> {
    let row = sqlx::query(&format!(
        r#"
        select {BATCH_COLUMNS}
        from account_batches
        where account_id = $1 and business_date = $2 and status = 'ARCHIVED'
        order by archived_at_utc desc nulls last, batch_id desc
        limit 1
        "#
    ))
    .bind(account_id)
    .bind(business_date)
    .fetch_optional(ex)
    .await
    .context("fetch_latest_archived failed")?;

    row.as_ref().map(map_batch).transpose()
}

/// Stamp the staged row count after bulk insert completes.
pub async fn set_position_count<'e>(
    ex: impl PgExecutor<'e>,
    account_id: i64,
    batch_id: i64,
    position_count: i32,
) -> Result<()> {
    sqlx::query(
        r#"
        update account_batches
           set position_count = $3
         where account_id = $1 and batch_id = $2
        "#,
    )
    .bind(account_id)
    .bind(batch_id)
    .bind(position_count)
    .execute(ex)
    .await
    .context("set_position_count failed")?;
    Ok(())
}
