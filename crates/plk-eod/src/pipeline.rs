//! The blue/green EOD run.
//!
//! Failure discipline: the run row is written RUNNING before the fetch, a
//! terminal state is persisted before the locks are released, and a failed
//! run marks only its own STAGING batch — the previously ACTIVE batch is
//! never touched by a failure path.

use chrono::{Duration as ChronoDuration, NaiveDate};
use plk_config::LoaderConfig;
use plk_fabric::lock::{eod_lock_name, intraday_lock_name};
use plk_fabric::{
    retry_with_backoff, CircuitBreaker, DistributedLock, DrainState, LockGuard, MessageBus,
    RetrySchedule,
};
use plk_schemas::{
    AccountSnapshot, ClientSignoffEvent, EodTrigger, LoaderError, RunStatus, Topic,
};
use plk_store::{PositionStore, StagedPosition};
use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;

use crate::hash::canonical_content_hash;
use crate::upstream::SnapshotSource;
use crate::validate::validate_snapshot;

/// Duplicate-detection window: identical content within the last 7 days for
/// the same account is a no-op.
const DUPLICATE_WINDOW_DAYS: i64 = 7;

/// Bounded wait for the per-account locks; EOD fails fast on contention.
const LOCK_WAIT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EodOutcome {
    Completed { batch_id: i64, position_count: usize },
    /// Identical snapshot already loaded; no batch created.
    Noop,
}

pub struct EodPipeline {
    store: PositionStore,
    source: Arc<dyn SnapshotSource>,
    locks: DistributedLock,
    bus: MessageBus,
    drain: DrainState,
    breaker: CircuitBreaker,
    config: Arc<LoaderConfig>,
    retry: RetrySchedule,
    lock_lease: Duration,
}

impl EodPipeline {
    pub fn new(
        store: PositionStore,
        source: Arc<dyn SnapshotSource>,
        locks: DistributedLock,
        bus: MessageBus,
        drain: DrainState,
        config: Arc<LoaderConfig>,
    ) -> Self {
        let breaker = CircuitBreaker::new(
            "upstream",
            config.circuit_breaker.upstream.failure_rate_pct,
            config.circuit_breaker.upstream.window,
            config.circuit_breaker.upstream.cooldown(),
            config.circuit_breaker.upstream.half_open_probes,
        );
        let retry = RetrySchedule {
            max_attempts: config.retry.max_attempts,
            initial_delay: Duration::from_millis(config.retry.initial_delay_ms),
            max_delay: Duration::from_millis(config.retry.max_delay_ms),
            multiplier: config.retry.multiplier,
        };
        Self {
            store,
            source,
            locks,
            bus,
            drain,
            breaker,
            config,
            retry,
            lock_lease: plk_fabric::lock::DEFAULT_LEASE,
        }
    }

    fn pool(&self) -> &PgPool {
        self.store.pool()
    }

    /// Admission checks shared by the stream consumer and the admin rerun.
    fn admit(&self, account_id: i64) -> Result<(), LoaderError> {
        if self.drain.is_shutting_down() {
            return Err(LoaderError::ShuttingDown);
        }
        if !self.config.features.eod_enabled {
            return Err(LoaderError::NotAdmitted {
                account_id,
                reason: "eod pipeline is disabled".into(),
            });
        }
        if !self.config.features.admits(account_id) {
            return Err(LoaderError::NotAdmitted {
                account_id,
                reason: "account is disabled or outside the pilot set".into(),
            });
        }
        Ok(())
    }

    /// Run EOD for one (account, business date).
    ///
    /// EOD excludes intraday for the whole run by holding both per-account
    /// locks. Terminal run state is persisted before the locks are released.
    pub async fn run(&self, trigger: &EodTrigger) -> Result<EodOutcome, LoaderError> {
        let account_id = trigger.account_id;
        let business_date = trigger.business_date;

        self.admit(account_id)?;
        let _guard = self
            .drain
            .enter()
            .ok_or(LoaderError::ShuttingDown)?;

        let eod_guard = self
            .locks
            .acquire(&eod_lock_name(account_id), self.lock_lease, LOCK_WAIT)
            .await?;
        let intraday_guard = match self
            .locks
            .acquire(&intraday_lock_name(account_id), self.lock_lease, LOCK_WAIT)
            .await
        {
            Ok(g) => g,
            Err(e) => {
                let _ = self.locks.release(&eod_guard).await;
                return Err(e);
            }
        };

        let attempt = match plk_db::start_run(self.pool(), account_id, business_date).await {
            Ok(attempt) => attempt,
            Err(e) => {
                self.release_both(&eod_guard, &intraday_guard).await;
                return Err(LoaderError::Db(e.into()));
            }
        };

        tracing::info!(account_id, %business_date, attempt, "eod run started");

        let outcome = self.run_locked(account_id, business_date).await;

        // Terminal state first, locks after. The terminal write itself is
        // best-effort on the failure path: the error the caller routes to
        // the DLQ takes precedence.
        let outcome = match outcome {
            Ok(EodOutcome::Completed {
                batch_id,
                position_count,
            }) => plk_db::complete_run(
                self.pool(),
                account_id,
                business_date,
                attempt,
                RunStatus::Completed,
                Some(batch_id),
                Some(position_count as i32),
            )
            .await
            .map_err(|e| LoaderError::Db(e.into()))
            .map(|_| EodOutcome::Completed {
                batch_id,
                position_count,
            }),
            Ok(EodOutcome::Noop) => plk_db::complete_run(
                self.pool(),
                account_id,
                business_date,
                attempt,
                RunStatus::CompletedNoop,
                None,
                None,
            )
            .await
            .map_err(|e| LoaderError::Db(e.into()))
            .map(|_| EodOutcome::Noop),
            Err(e) => {
                if let Err(mark_err) = plk_db::fail_run(
                    self.pool(),
                    account_id,
                    business_date,
                    attempt,
                    &e.to_string(),
                )
                .await
                {
                    tracing::error!(account_id, error = %mark_err, "failed to persist FAILED run state");
                }
                Err(e)
            }
        };

        self.release_both(&eod_guard, &intraday_guard).await;

        if outcome.is_ok() {
            self.emit_signoff_if_last(account_id, business_date).await;
        }

        outcome
    }

    async fn release_both(&self, eod: &LockGuard, intraday: &LockGuard) {
        for guard in [intraday, eod] {
            if let Err(e) = self.locks.release(guard).await {
                // A seized lease after terminal-state persistence is only
                // worth an alarm; the run result already stands in the DB.
                tracing::warn!(lock = %guard.name, error = %e, "lock release reported lost lease");
            }
        }
    }

    /// Steps 4–10: everything that runs under both locks.
    async fn run_locked(
        &self,
        account_id: i64,
        business_date: NaiveDate,
    ) -> Result<EodOutcome, LoaderError> {
        // Fetch with breaker + bounded retry.
        let snapshot = retry_with_backoff(&self.retry, || {
            let source = Arc::clone(&self.source);
            let breaker = self.breaker.clone();
            async move {
                breaker
                    .execute(move || async move { source.fetch(account_id, business_date).await })
                    .await
            }
        })
        .await?;

        if snapshot.account_id != account_id {
            return Err(LoaderError::Malformed(format!(
                "snapshot is for account {}, trigger was for {}",
                snapshot.account_id, account_id
            )));
        }

        self.reconcile_reference_data(&snapshot).await?;

        // Duplicate detection over the canonical content hash.
        let content_hash = canonical_content_hash(&snapshot);
        if self.config.features.duplicate_detection {
            let since = business_date - ChronoDuration::days(DUPLICATE_WINDOW_DAYS);
            let seen = plk_db::hash_seen_since(self.pool(), account_id, &content_hash, since)
                .await
                .map_err(|e| LoaderError::Db(e.into()))?;
            if seen {
                tracing::info!(account_id, %business_date, "identical snapshot within window; no-op");
                return Ok(EodOutcome::Noop);
            }
        }

        // Allocate and stage.
        let batch_id = self
            .store
            .create_batch(account_id, business_date, "EOD")
            .await
            .map_err(|e| LoaderError::Db(e.into()))?;

        let staged = self
            .stage_and_validate(&snapshot, account_id, business_date, batch_id)
            .await;

        let position_count = match staged {
            Ok(n) => n,
            Err(e) => {
                // The STAGING batch is ours alone; mark it FAILED and leave
                // the ACTIVE batch untouched.
                let _ = plk_db::mark_batch_failed(
                    self.pool(),
                    account_id,
                    batch_id,
                    &e.to_string(),
                )
                .await;
                return Err(e);
            }
        };

        // Atomic swap, then record the fingerprint.
        self.store
            .promote_batch(account_id, business_date, batch_id)
            .await
            .map_err(|e| LoaderError::Db(e.into()))?;

        plk_db::upsert_snapshot_hash(
            self.pool(),
            &plk_db::SnapshotHashRow {
                account_id,
                business_date,
                content_hash,
                position_count: position_count as i32,
                total_quantity: snapshot.total_quantity(),
                total_market_value: snapshot.total_market_value(),
            },
        )
        .await
        .map_err(|e| LoaderError::Db(e.into()))?;

        tracing::info!(account_id, %business_date, batch_id, position_count, "eod batch promoted");

        Ok(EodOutcome::Completed {
            batch_id,
            position_count,
        })
    }

    async fn stage_and_validate(
        &self,
        snapshot: &AccountSnapshot,
        account_id: i64,
        business_date: NaiveDate,
        batch_id: i64,
    ) -> Result<usize, LoaderError> {
        let rows: Vec<StagedPosition> = snapshot
            .positions
            .iter()
            .map(|p| StagedPosition {
                product_id: p.product_id,
                quantity: p.quantity,
                avg_cost_price: p.avg_cost_price,
                cost_local: p.cost_local,
                mv_base: p.mv_base,
            })
            .collect();

        self.store
            .insert_positions_to_staging(
                account_id,
                batch_id,
                business_date,
                "EOD",
                &rows,
                self.config.batch_size,
            )
            .await
            .map_err(|e| LoaderError::Db(e.into()))?;

        if self.config.features.validation_enabled {
            // Compare against whatever the account currently exposes to
            // readers, whichever business date that batch carries.
            let prior = match plk_db::fetch_active_batch(self.pool(), account_id)
                .await
                .map_err(|e| LoaderError::Db(e.into()))?
            {
                Some(active) => self
                    .store
                    .read_batch_positions(account_id, active.batch_id)
                    .await
                    .map_err(|e| LoaderError::Db(e.into()))?,
                None => Vec::new(),
            };

            let report = validate_snapshot(snapshot, &prior, &self.config.validation);
            for w in &report.warnings {
                tracing::warn!(account_id, batch_id, warning = %w, "eod validation warning");
            }
            if report.fails(self.config.validation.strict_mode) {
                let detail = if report.errors.is_empty() {
                    format!("strict mode: {}", report.warnings.join("; "))
                } else {
                    report.errors.join("; ")
                };
                return Err(LoaderError::ValidationFailed(detail));
            }
        }

        Ok(rows.len())
    }

    async fn reconcile_reference_data(
        &self,
        snapshot: &AccountSnapshot,
    ) -> Result<(), LoaderError> {
        let pool = self.pool();
        plk_db::upsert_client(pool, &snapshot.client)
            .await
            .map_err(|e| LoaderError::Db(e.into()))?;
        plk_db::upsert_fund(pool, &snapshot.fund)
            .await
            .map_err(|e| LoaderError::Db(e.into()))?;
        plk_db::upsert_account(pool, &snapshot.account)
            .await
            .map_err(|e| LoaderError::Db(e.into()))?;
        for product in &snapshot.products {
            plk_db::upsert_product(pool, product)
                .await
                .map_err(|e| LoaderError::Db(e.into()))?;
            plk_store::cache::evict_ticker(&product.ticker).await;
        }
        Ok(())
    }

    /// Emit CLIENT_REPORTING_SIGNOFF when this account was the last
    /// outstanding one for its client on the business date.
    async fn emit_signoff_if_last(&self, account_id: i64, business_date: NaiveDate) {
        let client_id = match self.client_of_account(account_id).await {
            Ok(Some(id)) => id,
            Ok(None) => return,
            Err(e) => {
                tracing::warn!(account_id, error = %e, "signoff check failed");
                return;
            }
        };

        match plk_db::client_signoff_ready(self.pool(), client_id, business_date).await {
            Ok(true) => {
                self.bus.publish_event(
                    Topic::ClientReportingSignoff,
                    client_id.to_string(),
                    &ClientSignoffEvent {
                        client_id,
                        business_date,
                    },
                );
                tracing::info!(client_id, %business_date, "client reporting sign-off emitted");
            }
            Ok(false) => {}
            Err(e) => tracing::warn!(client_id, error = %e, "signoff readiness query failed"),
        }
    }

    async fn client_of_account(&self, account_id: i64) -> anyhow::Result<Option<i64>> {
        let row: Option<(i64,)> = sqlx::query_as(
            r#"
            select f.client_id
            from accounts a
            join funds f on f.fund_id = a.fund_id
            where a.account_id = $1
            "#,
        )
        .bind(account_id)
        .fetch_optional(self.pool())
        .await?;
        Ok(row.map(|(id,)| id))
    }

    /// Admin rollback: revert the latest promotion for (account, date),
    /// under both per-account locks.
    pub async fn rollback(
        &self,
        account_id: i64,
        business_date: NaiveDate,
    ) -> Result<bool, LoaderError> {
        let eod_guard = self
            .locks
            .acquire(&eod_lock_name(account_id), self.lock_lease, LOCK_WAIT)
            .await?;
        let intraday_guard = match self
            .locks
            .acquire(&intraday_lock_name(account_id), self.lock_lease, LOCK_WAIT)
            .await
        {
            Ok(g) => g,
            Err(e) => {
                let _ = self.locks.release(&eod_guard).await;
                return Err(e);
            }
        };

        let result = self
            .store
            .rollback_batch(account_id, business_date)
            .await
            .map_err(|e| LoaderError::Db(e.into()));

        self.release_both(&eod_guard, &intraday_guard).await;
        result
    }
}
