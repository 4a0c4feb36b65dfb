//! Bitemporal position store.
//!
//! The transactional primitives shared by both pipelines. Every operation
//! either commits whole or leaves no trace; the at-most-one-ACTIVE and
//! open-version invariants are guarded both here (status-checked UPDATEs)
//! and by partial unique indexes in the schema.
//!
//! Callers are expected to hold the per-account lock before invoking any
//! writer operation; the store itself does not acquire locks.

use anyhow::{bail, Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use sqlx::PgPool;

pub mod cache;
pub mod costing;

pub use cache::{active_batch_id_cached, evict_active_batch};
pub use costing::weighted_average_cost;
pub use plk_db::{BatchRow, PositionRow, StagedPosition};

use plk_schemas::BatchStatus;

/// Outcome of applying one intraday delta.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedDelta {
    pub batch_id: i64,
    pub new_quantity: Decimal,
    pub new_avg_cost: Decimal,
}

#[derive(Clone)]
pub struct PositionStore {
    pool: PgPool,
}

impl PositionStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Allocate the next batch for an account and insert it in STAGING.
    pub async fn create_batch(
        &self,
        account_id: i64,
        business_date: NaiveDate,
        source: &str,
    ) -> Result<i64> {
        plk_db::allocate_batch(&self.pool, account_id, business_date, source).await
    }

    /// Bulk-insert staged rows, chunked; each chunk is one transaction
    /// (all-or-nothing per chunk). Never touches any ACTIVE batch: the rows
    /// land in the STAGING batch and stay invisible until promotion.
    pub async fn insert_positions_to_staging(
        &self,
        account_id: i64,
        batch_id: i64,
        business_date: NaiveDate,
        source: &str,
        rows: &[StagedPosition],
        chunk_size: usize,
    ) -> Result<u64> {
        let chunk_size = chunk_size.max(1);
        let mut total = 0u64;

        for chunk in rows.chunks(chunk_size) {
            let mut tx = self.pool.begin().await.context("begin staging chunk tx")?;
            total += plk_db::insert_staged_positions(
                &mut tx,
                account_id,
                batch_id,
                business_date,
                source,
                chunk,
            )
            .await?;
            tx.commit().await.context("commit staging chunk tx")?;
        }

        plk_db::set_position_count(&self.pool, account_id, batch_id, total as i32).await?;
        Ok(total)
    }

    /// Blue/green swap in a single transaction: the current ACTIVE batch for
    /// the date (if any) becomes ARCHIVED, the given STAGING batch becomes
    /// ACTIVE. Readers observe entirely the old batch or entirely the new.
    pub async fn promote_batch(
        &self,
        account_id: i64,
        business_date: NaiveDate,
        batch_id: i64,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await.context("begin promote tx")?;

        if let Some(active) =
            plk_db::fetch_active_batch_for_date(&mut *tx, account_id, business_date).await?
        {
            let archived = plk_db::transition_batch(
                &mut *tx,
                account_id,
                active.batch_id,
                BatchStatus::Active,
                BatchStatus::Archived,
            )
            .await?;
            if !archived {
                bail!(
                    "promote aborted: batch {} of account {} left ACTIVE concurrently",
                    active.batch_id,
                    account_id
                );
            }
        }

        let activated = plk_db::transition_batch(
            &mut *tx,
            account_id,
            batch_id,
            BatchStatus::Staging,
            BatchStatus::Active,
        )
        .await?;
        if !activated {
            bail!(
                "promote aborted: batch {} of account {} is not in STAGING",
                batch_id,
                account_id
            );
        }

        tx.commit().await.context("commit promote tx")?;
        cache::evict_active_batch(account_id).await;
        Ok(())
    }

    /// Revert the latest promotion for (account, date). Returns false — with
    /// no state change — when there is no archived predecessor to restore.
    pub async fn rollback_batch(&self, account_id: i64, business_date: NaiveDate) -> Result<bool> {
        let mut tx = self.pool.begin().await.context("begin rollback tx")?;

        let Some(active) =
            plk_db::fetch_active_batch_for_date(&mut *tx, account_id, business_date).await?
        else {
            return Ok(false);
        };
        let Some(predecessor) =
            plk_db::fetch_latest_archived(&mut *tx, account_id, business_date).await?
        else {
            return Ok(false);
        };

        let rolled = plk_db::transition_batch(
            &mut *tx,
            account_id,
            active.batch_id,
            BatchStatus::Active,
            BatchStatus::RolledBack,
        )
        .await?;
        let restored = plk_db::transition_batch(
            &mut *tx,
            account_id,
            predecessor.batch_id,
            BatchStatus::Archived,
            BatchStatus::Active,
        )
        .await?;
        if !rolled || !restored {
            bail!(
                "rollback aborted for account {}: concurrent status change",
                account_id
            );
        }

        tx.commit().await.context("commit rollback tx")?;
        cache::evict_active_batch(account_id).await;
        Ok(true)
    }

    /// Close-old / insert-new in one transaction. With no existing open
    /// version the delta starts a fresh position from zero quantity.
    #[allow(clippy::too_many_arguments)]
    pub async fn apply_bitemporal_delta(
        &self,
        account_id: i64,
        product_id: i64,
        batch_id: i64,
        business_date: NaiveDate,
        delta: Decimal,
        price: Decimal,
        event_time: DateTime<Utc>,
    ) -> Result<AppliedDelta> {
        let mut tx = self.pool.begin().await.context("begin delta tx")?;
        let now = Utc::now();

        let current =
            plk_db::fetch_open_version_for_update(&mut tx, account_id, product_id, batch_id)
                .await?;

        let (q_old, avg_old) = match &current {
            Some(row) => (row.quantity, row.avg_cost_price),
            None => (Decimal::ZERO, Decimal::ZERO),
        };

        if let Some(row) = &current {
            let closed = plk_db::close_open_version(&mut tx, row.position_id, now).await?;
            if !closed {
                // The open version vanished between the locked read and the
                // update: our lease must have been seized. Abort.
                bail!(
                    "bitemporal close lost the open version for account {} product {}",
                    account_id,
                    product_id
                );
            }
        }

        let new_quantity = q_old + delta;
        let new_avg_cost = costing::weighted_average_cost(q_old, avg_old, delta, price);
        let cost_local = (new_quantity * new_avg_cost).round_dp(costing::COST_SCALE);
        let mv_base = (new_quantity * price).round_dp(costing::COST_SCALE);

        plk_db::insert_position_version(
            &mut tx,
            account_id,
            product_id,
            batch_id,
            business_date,
            new_quantity,
            new_avg_cost,
            cost_local,
            mv_base,
            "INTRADAY",
            now,
        )
        .await?;

        tx.commit().await.context("commit delta tx")?;

        tracing::debug!(
            account_id,
            product_id,
            batch_id,
            %delta,
            %new_quantity,
            %event_time,
            "applied bitemporal delta"
        );

        Ok(AppliedDelta {
            batch_id,
            new_quantity,
            new_avg_cost,
        })
    }

    /// Current user-visible state for (account, date).
    pub async fn read_active_positions(
        &self,
        account_id: i64,
        business_date: NaiveDate,
    ) -> Result<Vec<PositionRow>> {
        plk_db::read_active_positions(&self.pool, account_id, business_date).await
    }

    /// The view visible at `ts` (`system_from <= ts < system_to`).
    pub async fn read_positions_as_of(
        &self,
        account_id: i64,
        ts: DateTime<Utc>,
    ) -> Result<Vec<PositionRow>> {
        plk_db::read_positions_as_of(&self.pool, account_id, ts).await
    }

    /// Open versions of one batch, for validation against the prior ACTIVE.
    pub async fn read_batch_positions(
        &self,
        account_id: i64,
        batch_id: i64,
    ) -> Result<Vec<PositionRow>> {
        plk_db::read_batch_positions(&self.pool, account_id, batch_id).await
    }

    /// The account's current ACTIVE batch id, via the TTL cache.
    pub async fn active_batch_id(&self, account_id: i64) -> Result<Option<i64>> {
        cache::active_batch_id_cached(self.pool.clone(), account_id)
            .await
            .map_err(|e| anyhow::anyhow!(e))
    }

    /// Ticker → product id, via the 30-minute reference cache.
    pub async fn resolve_product_by_ticker(&self, ticker: &str) -> Result<Option<i64>> {
        cache::product_id_by_ticker_cached(self.pool.clone(), ticker.to_string())
            .await
            .map_err(|e| anyhow::anyhow!(e))
    }

    /// Move pre-cutoff rows of ARCHIVED batches (keeping month-end snapshots)
    /// into the archive table. Idempotent; rerunning moves nothing new.
    pub async fn archive(&self, cutoff: NaiveDate) -> Result<u64> {
        let mut tx = self.pool.begin().await.context("begin archive tx")?;

        let moved = plk_db::archive_positions_before(&mut tx, cutoff).await?;
        sqlx::query(
            r#"
            insert into archive_runs (cutoff_date, moved_count, completed_at_utc)
            values ($1, $2, now())
            "#,
        )
        .bind(cutoff)
        .bind(moved as i64)
        .execute(&mut *tx)
        .await
        .context("record archive run failed")?;

        tx.commit().await.context("commit archive tx")?;
        tracing::info!(moved, %cutoff, "archival pass complete");
        Ok(moved)
    }
}
