//! Named distributed locks with bounded leases.
//!
//! Acquire is insert-or-seize: the upsert only wins when the existing lease
//! has expired. Release is conditional on ownership — a `false` return means
//! the lease was seized by another owner while we held it, and the caller
//! must treat its work as aborted.

use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::PgExecutor;
use std::time::Duration;
use uuid::Uuid;

/// Try to acquire `name` for `lease`. Returns true when this owner now holds
/// the lock. No waiting happens here; callers poll with their own bound.
///
/// Not re-entrant: a name already leased is refused even to its own owner
/// (the EOD/intraday exclusion depends on this). Use [`extend_lock`] to
/// lengthen a held lease.
pub async fn try_acquire_lock<'e>(
    ex: impl PgExecutor<'e>,
    name: &str,
    owner_id: Uuid,
    lease: Duration,
) -> Result<bool> {
    let now = Utc::now();
    let until = now + chrono::Duration::from_std(lease).context("lease out of range")?;

    let row: Option<(String,)> = sqlx::query_as(
        r#"
        insert into distributed_locks (name, owner_id, locked_at_utc, lock_until_utc)
        values ($1, $2, $3, $4)
        on conflict (name) do update
            set owner_id       = excluded.owner_id,
                locked_at_utc  = excluded.locked_at_utc,
                lock_until_utc = excluded.lock_until_utc
            where distributed_locks.lock_until_utc <= $3
        returning name
        "#,
    )
    .bind(name)
    .bind(owner_id)
    .bind(now)
    .bind(until)
    .fetch_optional(ex)
    .await
    .context("try_acquire_lock failed")?;

    Ok(row.is_some())
}

/// Release if still owned. Ok(true) = released; Ok(false) = the lease had
/// already been seized (lost ownership).
pub async fn release_lock<'e>(ex: impl PgExecutor<'e>, name: &str, owner_id: Uuid) -> Result<bool> {
    let row: Option<(String,)> = sqlx::query_as(
        r#"
        delete from distributed_locks
        where name = $1 and owner_id = $2
        returning name
        "#,
    )
    .bind(name)
    .bind(owner_id)
    .fetch_optional(ex)
    .await
    .context("release_lock failed")?;

    Ok(row.is_some())
}

/// Extend a held lease. Ok(false) = no longer the owner.
pub async fn extend_lock<'e>(
    ex: impl PgExecutor<'e>,
    name: &str,
    owner_id: Uuid,
    lease: Duration,
) -> Result<bool> {
    let until = Utc::now() + chrono::Duration::from_std(lease).context("lease out of range")?;

    let row: Option<(String,)> = sqlx::query_as(
        r#"
        update distributed_locks
           set lock_until_utc = $3
         where name = $1 and owner_id = $2
        returning name
        "#,
    )
    .bind(name)
    .bind(owner_id)
    .bind(until)
    .fetch_optional(ex)
    .await
    .context("extend_lock failed")?;

    Ok(row.is_some())
}
