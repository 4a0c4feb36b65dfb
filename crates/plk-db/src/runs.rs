//! EOD run history.
//!
//! One row per (account, business date, attempt). The RUNNING row is written
//! before the snapshot fetch begins; the terminal update happens before the
//! per-account lock is released, so no state is lost to a crash.

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use plk_schemas::RunStatus;
use sqlx::{PgExecutor, Row};

#[derive(Debug, Clone)]
pub struct EodRunRow {
    pub account_id: i64,
    pub business_date: NaiveDate,
    pub attempt: i32,
    pub status: RunStatus,
    pub batch_id: Option<i64>,
    pub position_count: Option<i32>,
    pub error_message: Option<String>,
    pub started_at_utc: DateTime<Utc>,
    pub completed_at_utc: Option<DateTime<Utc>>,
}

fn map_run(row: &sqlx::postgres::PgRow) -> Result<EodRunRow> {
    Ok(EodRunRow {
        account_id: row.try_get("account_id")?,
        business_date: row.try_get("business_date")?,
        attempt: row.try_get("attempt")?,
        status: RunStatus::parse(&row.try_get::<String, _>("status")?)?,
        batch_id: row.try_get("batch_id")?,
        position_count: row.try_get("position_count")?,
        error_message: row.try_get("error_message")?,
        started_at_utc: row.try_get("started_at_utc")?,
        completed_at_utc: row.try_get("completed_at_utc")?,
    })
}

const RUN_COLUMNS: &str = "account_id, business_date, attempt, status, batch_id, \
                           position_count, error_message, started_at_utc, completed_at_utc";

/// Start a new attempt (max existing + 1) in RUNNING state; returns the
/// attempt number. Callers hold the per-account EOD lock.
pub async fn start_run<'e>(
    ex: impl PgExecutor<'e>,
    account_id: i64,
    business_date: NaiveDate,
) -> Result<i32> {
    let row = sqlx::query(
        r#"
        insert into eod_runs (account_id, business_date, attempt, status)
        select $1, $2, coalesce(max(attempt), 0) + 1, 'RUNNING'
        from eod_runs
        where account_id = $1 and business_date = $2
        returning attempt
        "#,
    )
    .bind(account_id)
    .bind(business_date)
    .fetch_one(ex)
    .await
    .context("start_run failed")?;

    Ok(row.try_get("attempt")?)
}

/// RUNNING -> COMPLETED or COMPLETED_NOOP.
pub async fn complete_run<'e>(
    ex: impl PgExecutor<'e>,
    account_id: i64,
    business_date: NaiveDate,
    attempt: i32,
    status: RunStatus,
    batch_id: Option<i64>,
    position_count: Option<i32>,
) -> Result<()> {
    anyhow::ensure!(
        matches!(status, RunStatus::Completed | RunStatus::CompletedNoop),
        "complete_run requires a completed status"
    );

    sqlx::query(
        r#"
        update eod_runs
           set status           = $4,
               batch_id         = $5,
               position_count   = $6,
               completed_at_utc = now()
         where account_id = $1 and business_date = $2 and attempt = $3
           and status = 'RUNNING'
        "#,
    )
    .bind(account_id)
    .bind(business_date)
    .bind(attempt)
    .bind(status.as_str())
    .bind(batch_id)
    .bind(position_count)
    .execute(ex)
    .await
    .context("complete_run failed")?;

    Ok(())
}

/// RUNNING -> FAILED with the failure message.
pub async fn fail_run<'e>(
    ex: impl PgExecutor<'e>,
    account_id: i64,
    business_date: NaiveDate,
    attempt: i32,
    error_message: &str,
) -> Result<()> {
    sqlx::query(
        r#"
        update eod_runs
           set status           = 'FAILED',
               error_message    = $4,
               completed_at_utc = now()
         where account_id = $1 and business_date = $2 and attempt = $3
           and status = 'RUNNING'
        "#,
    )
    .bind(account_id)
    .bind(business_date)
    .bind(attempt)
    .bind(error_message)
    .execute(ex)
    .await
    .context("fail_run failed")?;

    Ok(())
}

/// Latest attempt for (account, date) — the account's current EOD status.
pub async fn latest_run<'e>(
    ex: impl PgExecutor<'e>,
    account_id: i64,
    business_date: NaiveDate,
) -> Result<Option<EodRunRow>> {
    let row = sqlx::query(&format!(
        r#"
        select {RUN_COLUMNS}
        from eod_runs
        where account_id = $1 and business_date = $2
        order by attempt desc
        limit 1
        "#
    ))
    .bind(account_id)
    .bind(business_date)
    .fetch_optional(ex)
    .await
    .context("latest_run failed")?;

    row.as_ref().map(map_run).transpose()
}

pub async fn run_history<'e>(
    ex: impl PgExecutor<'e>,
    account_id: i64,
    limit: i64,
) -> Result<Vec<EodRunRow>> {
    let rows = sqlx::query(&format!(
        r#"
        select {RUN_COLUMNS}
        from eod_runs
        where account_id = $1
        order by business_date desc, attempt desc
        limit $2
        "#
    ))
    .bind(account_id)
    .bind(limit)
    .fetch_all(ex)
    .await
    .context("run_history failed")?;

    rows.iter().map(map_run).collect()
}

/// Startup recovery: RUNNING rows older than the lock lease belong to a
/// crashed process — mark them FAILED so reruns are admitted.
pub async fn fail_stale_running<'e>(
    ex: impl PgExecutor<'e>,
    older_than: DateTime<Utc>,
) -> Result<u64> {
    let res = sqlx::query(
        r#"
        update eod_runs
           set status           = 'FAILED',
               error_message    = 'recovered at startup: run was RUNNING past its lock lease',
               completed_at_utc = now()
         where status = 'RUNNING'
           and started_at_utc < $1
        "#,
    )
    .bind(older_than)
    .execute(ex)
    .await
    .context("fail_stale_running failed")?;

    Ok(res.rows_affected())
}

/// True when every active account of the client has a completed latest run
/// for the business date — the client sign-off condition.
pub async fn client_signoff_ready<'e>(
    ex: impl PgExecutor<'e>,
    client_id: i64,
    business_date: NaiveDate,
) -> Result<bool> {
    let (outstanding,): (i64,) = sqlx::query_as(
        r#"
        select count(*)::bigint
        from accounts a
        join funds f on f.fund_id = a.fund_id
        where f.client_id = $1
          and a.status = 'ACTIVE'
          and not exists (
            select 1
            from eod_runs r
            where r.account_id = a.account_id
              and r.business_date = $2
              and r.status in ('COMPLETED', 'COMPLETED_NOOP')
          )
        "#,
    )
    .bind(client_id)
    .bind(business_date)
    .fetch_one(ex)
    .await
    .context("client_signoff_ready failed")?;

    Ok(outstanding == 0)
}
