//! Bitemporal position queries.
//!
//! Mutation is never an in-place UPDATE of quantity: the open version is
//! closed (`system_to := now`) and a successor row is inserted, both inside
//! the caller's transaction. `SYSTEM_TO_INFINITY` marks the open version.

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use rust_decimal::Decimal;
use sqlx::{PgConnection, PgExecutor, Row};

/// Sentinel for the currently visible version (`systemTo = ∞`).
pub fn system_to_infinity() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(9999, 12, 31, 23, 59, 59).unwrap()
}

/// Default business-validity interval bounds.
pub fn valid_from_default() -> NaiveDate {
    NaiveDate::from_ymd_opt(1900, 1, 1).unwrap()
}

pub fn valid_to_default() -> NaiveDate {
    NaiveDate::from_ymd_opt(9999, 12, 31).unwrap()
}

#[derive(Debug, Clone)]
pub struct PositionRow {
    pub position_id: i64,
    pub account_id: i64,
    pub product_id: i64,
    pub batch_id: i64,
    pub business_date: NaiveDate,
    pub quantity: Decimal,
    pub avg_cost_price: Decimal,
    pub cost_local: Decimal,
    pub mv_base: Decimal,
    pub source: String,
    pub valid_from: NaiveDate,
    pub valid_to: NaiveDate,
    pub system_from: DateTime<Utc>,
    pub system_to: DateTime<Utc>,
}

/// A row to stage: the bitemporal columns are supplied by the insert.
#[derive(Debug, Clone)]
pub struct StagedPosition {
    pub product_id: i64,
    pub quantity: Decimal,
    pub avg_cost_price: Decimal,
    pub cost_local: Decimal,
    pub mv_base: Decimal,
}

fn map_position(row: &sqlx::postgres::PgRow) -> Result<PositionRow> {
    Ok(PositionRow {
        position_id: row.try_get("position_id")?,
        account_id: row.try_get("account_id")?,
        product_id: row.try_get("product_id")?,
        batch_id: row.try_get("batch_id")?,
        business_date: row.try_get("business_date")?,
        quantity: row.try_get("quantity")?,
        avg_cost_price: row.try_get("avg_cost_price")?,
        cost_local: row.try_get("cost_local")?,
        mv_base: row.try_get("mv_base")?,
        source: row.try_get("source")?,
        valid_from: row.try_get("valid_from")?,
        valid_to: row.try_get("valid_to")?,
        system_from: row.try_get("system_from")?,
        system_to: row.try_get("system_to")?,
    })
}

const POSITION_COLUMNS: &str = "position_id, account_id, product_id, batch_id, business_date, \
     quantity, avg_cost_price, cost_local, mv_base, source, \
     valid_from, valid_to, system_from, system_to";

// Same list qualified for joins against account_batches.
const POSITION_COLUMNS_QUALIFIED: &str =
    "p.position_id, p.account_id, p.product_id, p.batch_id, p.business_date, \
     p.quantity, p.avg_cost_price, p.cost_local, p.mv_base, p.source, \
     p.valid_from, p.valid_to, p.system_from, p.system_to";

/// Bulk-insert one chunk of staged rows inside the caller's transaction.
///
/// All rows in the chunk share account/batch/date and open bitemporal
/// intervals. All-or-nothing per chunk: any failure aborts the transaction.
pub async fn insert_staged_positions(
    conn: &mut PgConnection,
    account_id: i64,
    batch_id: i64,
    business_date: NaiveDate,
    source: &str,
    rows: &[StagedPosition],
) -> Result<u64> {
    let mut inserted = 0u64;
    for p in rows {
        sqlx::query(
            r#"
            insert into positions (
              account_id, product_id, batch_id, business_date,
              quantity, avg_cost_price, cost_local, mv_base, source,
              valid_from, valid_to, system_from, system_to
            ) values (
              $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, now(), $12
            )
            "#,
        )
        .bind(account_id)
        .bind(p.product_id)
        .bind(batch_id)
        .bind(business_date)
        .bind(p.quantity)
        .bind(p.avg_cost_price)
        .bind(p.cost_local)
        .bind(p.mv_base)
        .bind(source)
        .bind(valid_from_default())
        .bind(valid_to_default())
        .bind(system_to_infinity())
        .execute(&mut *conn)
        .await
        .context("insert_staged_positions failed")?;
        inserted += 1;
    }
    Ok(inserted)
}

/// Lock and return the open version of a position for mutation.
///
/// `FOR UPDATE` serializes concurrent writers on the same row; the per-account
/// lock should already have prevented them from getting this far.
pub async fn fetch_open_version_for_update(
    conn: &mut PgConnection,
    account_id: i64,
    product_id: i64,
    batch_id: i64,
) -> Result<Option<PositionRow>> {
    let row = sqlx::query(&format!(
        r#"
        select {POSITION_COLUMNS}
        from positions
        where account_id = $1 and product_id = $2 and batch_id = $3
          and system_to = $4
        for update
        "#
    ))
    .bind(account_id)
    .bind(product_id)
    .bind(batch_id)
    .bind(system_to_infinity())
    .fetch_optional(&mut *conn)
    .await
    .context("fetch_open_version_for_update failed")?;

    row.as_ref().map(map_position).transpose()
}

/// Close the open version at `now`. Returns false if the row was already
/// closed by someone else (lease lost; the caller must abort).
pub async fn close_open_version(
    conn: &mut PgConnection,
    position_id: i64,
    now: DateTime<Utc>,
) -> Result<bool> {
    let row: Option<(i64,)> = sqlx::query_as(
        r#"
        update positions
           set system_to = $2
         where position_id = $1
           and system_to = $3
        returning position_id
        "#,
    )
    .bind(position_id)
    .bind(now)
    .bind(system_to_infinity())
    .fetch_optional(&mut *conn)
    .await
    .context("close_open_version failed")?;

    Ok(row.is_some())
}

/// Insert a successor version with `system_from = now, system_to = ∞`.
#[allow(clippy::too_many_arguments)]
pub async fn insert_position_version(
    conn: &mut PgConnection,
    account_id: i64,
    product_id: i64,
    batch_id: i64,
    business_date: NaiveDate,
    quantity: Decimal,
    avg_cost_price: Decimal,
    cost_local: Decimal,
    mv_base: Decimal,
    source: &str,
    system_from: DateTime<Utc>,
) -> Result<i64> {
    let row = sqlx::query(
        r#"
        insert into positions (
          account_id, product_id, batch_id, business_date,
          quantity, avg_cost_price, cost_local, mv_base, source,
          valid_from, valid_to, system_from, system_to
        ) values (
          $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13
        )
        returning position_id
        "#,
    )
    .bind(account_id)
    .bind(product_id)
    .bind(batch_id)
    .bind(business_date)
    .bind(quantity)
    .bind(avg_cost_price)
    .bind(cost_local)
    .bind(mv_base)
    .bind(source)
    .bind(valid_from_default())
    .bind(valid_to_default())
    .bind(system_from)
    .bind(system_to_infinity())
    .fetch_one(&mut *conn)
    .await
    .context("insert_position_version failed")?;

    Ok(row.try_get("position_id")?)
}

/// Current user-visible state: open versions of the ACTIVE batch for the
/// business date. A STAGING batch being written concurrently is invisible
/// here by construction.
pub async fn read_active_positions<'e>(
    ex: impl PgExecutor<'e>,
    account_id: i64,
    business_date: NaiveDate,
) -> Result<Vec<PositionRow>> {
    let rows = sqlx::query(&format!(
        r#"
        select {POSITION_COLUMNS_QUALIFIED}
        from positions p
        join account_batches b
          on b.account_id = p.account_id and b.batch_id = p.batch_id
        where p.account_id = $1
          and b.business_date = $2
          and b.status = 'ACTIVE'
          and p.system_to = $3
        order by p.product_id
        "#
    ))
    .bind(account_id)
    .bind(business_date)
    .bind(system_to_infinity())
    .fetch_all(ex)
    .await
    .context("read_active_positions failed")?;

    rows.iter().map(map_position).collect()
}

/// Historical view: rows knowable at `ts` (`system_from <= ts < system_to`).
pub async fn read_positions_as_of<'e>(
    ex: impl PgExecutor<'e>,
    account_id: i64,
    ts: DateTime<Utc>,
) -> Result<Vec<PositionRow>> {
    let rows = sqlx::query(&format!(
        r#"
        select {POSITION_COLUMNS}
        from positions
        where account_id = $1
          and system_from <= $2
          and system_to > $2
        order by product_id, batch_id
        "#
    ))
    .bind(account_id)
    .bind(ts)
    .fetch_all(ex)
    .await
    .context("read_positions_as_of failed")?;

    rows.iter().map(map_position).collect()
}

/// Open versions of a specific batch (used to compare against a prior ACTIVE
/// batch during validation and to verify rollback round-trips).
pub async fn read_batch_positions<'e>(
    ex: impl PgExecutor<'e>,
    account_id: i64,
    batch_id: i64,
) -> Result<Vec<PositionRow>> {
    let rows = sqlx::query(&format!(
        r#"
        select {POSITION_COLUMNS}
        from positions
        where account_id = $1 and batch_id = $2 and system_to = $3
        order by product_id
        "#
    ))
    .bind(account_id)
    .bind(batch_id)
    .bind(system_to_infinity())
    .fetch_all(ex)
    .await
    .context("read_batch_positions failed")?;

    rows.iter().map(map_position).collect()
}

/// Move pre-cutoff rows of ARCHIVED batches into `positions_archive`,
/// skipping month-end business dates. Insert + delete in the caller's
/// transaction; rerunning with the same cutoff moves nothing.
pub async fn archive_positions_before(
    conn: &mut PgConnection,
    cutoff: NaiveDate,
) -> Result<u64> {
    sqlx::query(
        r#"
        insert into positions_archive (
          position_id, account_id, product_id, batch_id, business_date,
          quantity, avg_cost_price, cost_local, mv_base, source,
          valid_from, valid_to, system_from, system_to
        )
        select p.position_id, p.account_id, p.product_id, p.batch_id, p.business_date,
               p.quantity, p.avg_cost_price, p.cost_local, p.mv_base, p.source,
               p.valid_from, p.valid_to, p.system_from, p.system_to
        from positions p
        join account_batches b
          on b.account_id = p.account_id and b.batch_id = p.batch_id
        where b.status = 'ARCHIVED'
          and p.business_date < $1
          and p.business_date <> (date_trunc('month', p.business_date::timestamp)
                                  + interval '1 month - 1 day')::date
        on conflict (position_id) do nothing
        "#,
    )
    .bind(cutoff)
    .execute(&mut *conn)
    .await
    .context("archive copy failed")?;

    let deleted = sqlx::query(
        r#"
        delete from positions p
        using account_batches b
        where b.account_id = p.account_id
          and b.batch_id = p.batch_id
          and b.status = 'ARCHIVED'
          and p.business_date < $1
          and p.position_id in (select position_id from positions_archive)
        "#,
    )
    .bind(cutoff)
    .execute(&mut *conn)
    .await
    .context("archive delete failed")?;

    Ok(deleted.rows_affected())
}
