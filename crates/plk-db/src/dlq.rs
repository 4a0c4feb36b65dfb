//! Dead-letter queue persistence.
//!
//! The replayer claims due PENDING entries with `FOR UPDATE SKIP LOCKED` so
//! concurrent replayers (during a leader handover window) never double-claim.
//! A claimed entry must subsequently be marked processed, rescheduled, or
//! failed by the claimer.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use plk_schemas::DlqStatus;
use serde_json::Value;
use sqlx::{PgExecutor, Row};

#[derive(Debug, Clone)]
pub struct NewDlqEntry {
    pub topic: String,
    pub msg_key: String,
    pub payload: Value,
    pub error_code: Option<String>,
    pub error_message: String,
    /// `None` parks the entry for manual replay only; `Some` schedules the
    /// first automatic retry.
    pub next_retry_at_utc: Option<DateTime<Utc>>,
    pub status: DlqStatus,
}

#[derive(Debug, Clone)]
pub struct DlqRow {
    pub dlq_id: i64,
    pub topic: String,
    pub msg_key: String,
    pub payload: Value,
    pub error_code: Option<String>,
    pub error_message: String,
    pub retry_count: i32,
    pub next_retry_at_utc: Option<DateTime<Utc>>,
    pub status: DlqStatus,
    pub created_at_utc: DateTime<Utc>,
    pub updated_at_utc: DateTime<Utc>,
}

fn map_dlq(row: &sqlx::postgres::PgRow) -> Result<DlqRow> {
    Ok(DlqRow {
        dlq_id: row.try_get("dlq_id")?,
        topic: row.try_get("topic")?,
        msg_key: row.try_get("msg_key")?,
        payload: row.try_get("payload")?,
        error_code: row.try_get("error_code")?,
        error_message: row.try_get("error_message")?,
        retry_count: row.try_get("retry_count")?,
        next_retry_at_utc: row.try_get("next_retry_at_utc")?,
        status: DlqStatus::parse(&row.try_get::<String, _>("status")?)?,
        created_at_utc: row.try_get("created_at_utc")?,
        updated_at_utc: row.try_get("updated_at_utc")?,
    })
}

const DLQ_COLUMNS: &str = "dlq_id, topic, msg_key, payload, error_code, error_message, \
                           retry_count, next_retry_at_utc, status, created_at_utc, updated_at_utc";

pub async fn park_entry<'e>(ex: impl PgExecutor<'e>, entry: &NewDlqEntry) -> Result<i64> {
    let row = sqlx::query(
        r#"
        insert into dlq_entries (
          topic, msg_key, payload, error_code, error_message, next_retry_at_utc, status
        ) values ($1, $2, $3, $4, $5, $6, $7)
        returning dlq_id
        "#,
    )
    .bind(&entry.topic)
    .bind(&entry.msg_key)
    .bind(&entry.payload)
    .bind(&entry.error_code)
    .bind(&entry.error_message)
    .bind(entry.next_retry_at_utc)
    .bind(entry.status.as_str())
    .fetch_one(ex)
    .await
    .context("park_entry failed")?;

    Ok(row.try_get("dlq_id")?)
}

/// Atomically claim up to `batch_size` due PENDING entries.
///
/// Claimed rows stay PENDING but get `next_retry_at_utc` pushed out by
/// `claim_ttl_secs` so a crashed claimer's work resurfaces after the TTL.
pub async fn claim_due_entries<'e>(
    ex: impl PgExecutor<'e>,
    max_retries: i32,
    batch_size: i64,
    claim_ttl_secs: i64,
) -> Result<Vec<DlqRow>> {
    let rows = sqlx::query(&format!(
        r#"
        with to_claim as (
            select dlq_id
            from dlq_entries
            where status = 'PENDING'
              and retry_count < $1
              and next_retry_at_utc is not null
              and next_retry_at_utc <= now()
            order by next_retry_at_utc asc
            limit $2
            for update skip locked
        )
        update dlq_entries
           set next_retry_at_utc = now() + make_interval(secs => $3),
               updated_at_utc    = now()
         where dlq_id in (select dlq_id from to_claim)
        returning {DLQ_COLUMNS}
        "#
    ))
    .bind(max_retries)
    .bind(batch_size)
    .bind(claim_ttl_secs as f64)
    .fetch_all(ex)
    .await
    .context("claim_due_entries failed")?;

    rows.iter().map(map_dlq).collect()
}

pub async fn mark_entry_processed<'e>(ex: impl PgExecutor<'e>, dlq_id: i64) -> Result<bool> {
    let row: Option<(i64,)> = sqlx::query_as(
        r#"
        update dlq_entries
           set status         = 'PROCESSED',
               updated_at_utc = now()
         where dlq_id = $1
           and status = 'PENDING'
        returning dlq_id
        "#,
    )
    .bind(dlq_id)
    .fetch_optional(ex)
    .await
    .context("mark_entry_processed failed")?;

    Ok(row.is_some())
}

/// Push the next attempt out without consuming retry budget (lock
/// contention and shutdown are deferrals, not failures).
pub async fn defer_entry<'e>(
    ex: impl PgExecutor<'e>,
    dlq_id: i64,
    next_retry_at: DateTime<Utc>,
) -> Result<()> {
    sqlx::query(
        r#"
        update dlq_entries
           set next_retry_at_utc = $2,
               updated_at_utc    = now()
         where dlq_id = $1
           and status = 'PENDING'
        "#,
    )
    .bind(dlq_id)
    .bind(next_retry_at)
    .execute(ex)
    .await
    .context("defer_entry failed")?;

    Ok(())
}

/// Republish attempt failed: bump retry_count and schedule the next attempt.
pub async fn reschedule_entry<'e>(
    ex: impl PgExecutor<'e>,
    dlq_id: i64,
    next_retry_at: DateTime<Utc>,
) -> Result<()> {
    sqlx::query(
        r#"
        update dlq_entries
           set retry_count       = retry_count + 1,
               next_retry_at_utc = $2,
               updated_at_utc    = now()
         where dlq_id = $1
           and status = 'PENDING'
        "#,
    )
    .bind(dlq_id)
    .bind(next_retry_at)
    .execute(ex)
    .await
    .context("reschedule_entry failed")?;

    Ok(())
}

/// Terminal failure after the retry budget (or a fatal-for-message error).
pub async fn mark_entry_failed<'e>(ex: impl PgExecutor<'e>, dlq_id: i64) -> Result<bool> {
    let row: Option<(i64,)> = sqlx::query_as(
        r#"
        update dlq_entries
           set status         = 'FAILED',
               retry_count    = retry_count + 1,
               updated_at_utc = now()
         where dlq_id = $1
           and status = 'PENDING'
        returning dlq_id
        "#,
    )
    .bind(dlq_id)
    .fetch_optional(ex)
    .await
    .context("mark_entry_failed failed")?;

    Ok(row.is_some())
}

/// Manual replay from the admin surface: reset a FAILED entry, or schedule a
/// PENDING entry that was parked without automatic retry.
pub async fn requeue_entry<'e>(ex: impl PgExecutor<'e>, dlq_id: i64) -> Result<bool> {
    let row: Option<(i64,)> = sqlx::query_as(
        r#"
        update dlq_entries
           set status            = 'PENDING',
               retry_count       = 0,
               next_retry_at_utc = now(),
               updated_at_utc    = now()
         where dlq_id = $1
           and (status = 'FAILED'
                or (status = 'PENDING' and next_retry_at_utc is null))
        returning dlq_id
        "#,
    )
    .bind(dlq_id)
    .fetch_optional(ex)
    .await
    .context("requeue_entry failed")?;

    Ok(row.is_some())
}

pub async fn fetch_entry<'e>(ex: impl PgExecutor<'e>, dlq_id: i64) -> Result<Option<DlqRow>> {
    let row = sqlx::query(&format!(
        "select {DLQ_COLUMNS} from dlq_entries where dlq_id = $1"
    ))
    .bind(dlq_id)
    .fetch_optional(ex)
    .await
    .context("fetch_entry failed")?;

    row.as_ref().map(map_dlq).transpose()
}

pub async fn list_entries<'e>(
    ex: impl PgExecutor<'e>,
    status: Option<DlqStatus>,
    limit: i64,
) -> Result<Vec<DlqRow>> {
    let rows = match status {
        Some(s) => {
            sqlx::query(&format!(
                r#"
                select {DLQ_COLUMNS}
                from dlq_entries
                where status = $1
                order by dlq_id desc
                limit $2
                "#
            ))
            .bind(s.as_str())
            .bind(limit)
            .fetch_all(ex)
            .await
        }
        None => {
            sqlx::query(&format!(
                "select {DLQ_COLUMNS} from dlq_entries order by dlq_id desc limit $1"
            ))
            .bind(limit)
            .fetch_all(ex)
            .await
        }
    }
    .context("list_entries failed")?;

    rows.iter().map(map_dlq).collect()
}

pub async fn count_pending<'e>(ex: impl PgExecutor<'e>) -> Result<i64> {
    let (n,): (i64,) =
        sqlx::query_as("select count(*)::bigint from dlq_entries where status = 'PENDING'")
            .fetch_one(ex)
            .await
            .context("count_pending failed")?;
    Ok(n)
}

/// Retention sweep: drop terminal entries older than the cutoff.
pub async fn purge_entries_before<'e>(
    ex: impl PgExecutor<'e>,
    cutoff: DateTime<Utc>,
) -> Result<u64> {
    let res = sqlx::query(
        r#"
        delete from dlq_entries
        where status in ('PROCESSED', 'FAILED')
          and updated_at_utc < $1
        "#,
    )
    .bind(cutoff)
    .execute(ex)
    .await
    .context("purge_entries_before failed")?;

    Ok(res.rows_affected())
}
