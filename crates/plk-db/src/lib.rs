//! PostgreSQL access layer for PositionKeep.
//!
//! All SQL lives in this crate. Callers get plain async functions over a
//! `PgPool` (or, for steps composed into a caller-owned transaction, any
//! `PgExecutor`). Row structs are mapped by hand with `try_get`; idempotent
//! writes use `ON CONFLICT`; queue claims use `FOR UPDATE SKIP LOCKED`.

use anyhow::{Context, Result};
use sqlx::{postgres::PgPoolOptions, PgPool};

pub mod alerts;
pub mod batches;
pub mod dlq;
pub mod hashes;
pub mod locks;
pub mod positions;
pub mod reference;
pub mod runs;
pub mod transactions;

pub use alerts::{raise_alert, recent_alerts, AlertRow};
pub use batches::{
    allocate_batch, fetch_active_batch, fetch_active_batch_for_date, fetch_batch,
    fetch_latest_archived, list_batches_for_account, mark_batch_failed, set_position_count,
    transition_batch, BatchRow,
};
pub use dlq::{
    claim_due_entries, count_pending, defer_entry, fetch_entry, list_entries, mark_entry_failed,
    mark_entry_processed, park_entry, purge_entries_before, requeue_entry,
    reschedule_entry, DlqRow, NewDlqEntry,
};
pub use hashes::{fetch_snapshot_hash, hash_seen_since, upsert_snapshot_hash, SnapshotHashRow};
pub use locks::{extend_lock, release_lock, try_acquire_lock};
pub use positions::{
    archive_positions_before, close_open_version, fetch_open_version_for_update,
    insert_position_version, insert_staged_positions, read_active_positions,
    read_batch_positions, read_positions_as_of, system_to_infinity, PositionRow, StagedPosition,
};
pub use reference::{
    resolve_product_by_ticker, upsert_account, upsert_client, upsert_fund, upsert_product,
};
pub use runs::{
    client_signoff_ready, complete_run, fail_run, fail_stale_running, latest_run, run_history,
    start_run, EodRunRow,
};
pub use transactions::{
    fetch_transaction_by_external_ref, insert_transaction_deduped, NewTransaction, TransactionRow,
};

pub const ENV_DB_URL: &str = "PLK_DATABASE_URL";

/// Connect to Postgres using PLK_DATABASE_URL.
///
/// Pool sizing per the resource model: parallel EOD + parallel intraday +
/// replayer + admin, bounded; callers pass the computed size.
pub async fn connect_from_env(max_connections: u32) -> Result<PgPool> {
    let url = std::env::var(ENV_DB_URL).with_context(|| format!("missing env var {ENV_DB_URL}"))?;

    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(&url)
        .await
        .context("failed to connect to Postgres")?;

    Ok(pool)
}

/// Test helper used by integration tests:
/// - Connect using PLK_DATABASE_URL
/// - Ensure migrations are applied
pub async fn testkit_db_pool() -> Result<PgPool> {
    let pool = connect_from_env(10).await?;
    migrate(&pool).await?;
    Ok(pool)
}

/// Run embedded SQLx migrations.
pub async fn migrate(pool: &PgPool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .context("db migrate failed")?;
    Ok(())
}

/// Simple status query (connectivity + schema presence).
pub async fn status(pool: &PgPool) -> Result<DbStatus> {
    let (one,): (i32,) = sqlx::query_as::<_, (i32,)>("select 1")
        .fetch_one(pool)
        .await
        .context("status connectivity query failed")?;
    let ok = one == 1;

    let (exists,): (bool,) = sqlx::query_as::<_, (bool,)>(
        r#"
        select exists (
            select 1
            from information_schema.tables
            where table_schema='public' and table_name='account_batches'
        )
        "#,
    )
    .fetch_one(pool)
    .await
    .context("status table-exists query failed")?;

    Ok(DbStatus {
        ok,
        has_batches_table: exists,
    })
}

#[derive(Debug, Clone)]
pub struct DbStatus {
    pub ok: bool,
    pub has_batches_table: bool,
}

/// Detect a Postgres unique constraint violation by name.
pub fn is_unique_constraint_violation(err: &sqlx::Error, constraint: &str) -> bool {
    match err {
        sqlx::Error::Database(db_err) => {
            db_err.constraint() == Some(constraint)
                || (db_err.code().as_deref() == Some("23505")
                    && db_err.constraint() == Some(constraint))
        }
        _ => false,
    }
}

/// Detect any unique violation (SQLSTATE 23505) regardless of constraint.
pub fn is_any_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db_err) if db_err.code().as_deref() == Some("23505"))
}
