//! Single-event application.

use plk_config::LoaderConfig;
use plk_fabric::lock::intraday_lock_name;
use plk_fabric::{DistributedLock, DrainState, MessageBus};
use plk_schemas::{IntradayEvent, LoaderError, PositionChangeEvent, Topic};
use plk_store::PositionStore;
use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;

/// Intraday locks are short-lived: the lease covers one event application,
/// and the wait bound is small because EOD holding the lock means the whole
/// batch should defer, not camp on the lock.
const LOCK_LEASE: Duration = Duration::from_secs(60);
const LOCK_WAIT: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IntradayOutcome {
    Applied {
        batch_id: i64,
        new_quantity: rust_decimal::Decimal,
    },
    /// external_ref_id already recorded; nothing changed.
    Duplicate,
}

pub struct IntradayPipeline {
    store: PositionStore,
    locks: DistributedLock,
    bus: MessageBus,
    drain: DrainState,
    config: Arc<LoaderConfig>,
}

impl IntradayPipeline {
    pub fn new(
        store: PositionStore,
        locks: DistributedLock,
        bus: MessageBus,
        drain: DrainState,
        config: Arc<LoaderConfig>,
    ) -> Self {
        Self {
            store,
            locks,
            bus,
            drain,
            config,
        }
    }

    fn pool(&self) -> &PgPool {
        self.store.pool()
    }

    fn admit(&self, event: &IntradayEvent) -> Result<(), LoaderError> {
        if self.drain.is_shutting_down() {
            return Err(LoaderError::ShuttingDown);
        }
        if !self.config.features.intraday_enabled {
            return Err(LoaderError::NotAdmitted {
                account_id: event.account_id,
                reason: "intraday pipeline is disabled".into(),
            });
        }
        if self
            .config
            .features
            .disabled_accounts
            .contains(&event.account_id)
        {
            return Err(LoaderError::NotAdmitted {
                account_id: event.account_id,
                reason: "account is disabled".into(),
            });
        }
        Ok(())
    }

    /// Apply one event. Callers (the dispatcher) are responsible for
    /// per-account ordering; this method is safe to call concurrently for
    /// different accounts.
    pub async fn apply_event(&self, event: &IntradayEvent) -> Result<IntradayOutcome, LoaderError> {
        self.admit(event)?;
        let _guard = self.drain.enter().ok_or(LoaderError::ShuttingDown)?;

        let lock_guard = self
            .locks
            .acquire(
                &intraday_lock_name(event.account_id),
                LOCK_LEASE,
                LOCK_WAIT,
            )
            .await?;

        let result = self.apply_locked(event).await;

        if let Err(e) = self.locks.release(&lock_guard).await {
            tracing::warn!(account_id = event.account_id, error = %e, "intraday lock release reported lost lease");
        }

        result
    }

    async fn apply_locked(&self, event: &IntradayEvent) -> Result<IntradayOutcome, LoaderError> {
        // Idempotency: a recorded external_ref_id makes this a no-op, but a
        // replay with different economics is a poisoned message.
        if let Some(existing) =
            plk_db::fetch_transaction_by_external_ref(self.pool(), &event.external_ref_id)
                .await
                .map_err(|e| LoaderError::Db(e.into()))?
        {
            let same = existing.account_id == event.account_id
                && existing.quantity == event.quantity
                && existing.price == event.price;
            return if same {
                tracing::debug!(external_ref_id = %event.external_ref_id, "duplicate intraday event skipped");
                Ok(IntradayOutcome::Duplicate)
            } else {
                Err(LoaderError::ConflictingReplay {
                    external_ref_id: event.external_ref_id.clone(),
                })
            };
        }

        // Resolve the product (30-minute reference cache).
        let product_id = match (event.product_id, &event.ticker) {
            (Some(id), _) => id,
            (None, Some(ticker)) => self
                .store
                .resolve_product_by_ticker(ticker)
                .await
                .map_err(|e| LoaderError::Db(e.into()))?
                .ok_or_else(|| LoaderError::UnknownTicker {
                    ticker: ticker.clone(),
                })?,
            (None, None) => {
                return Err(LoaderError::Malformed(
                    "event carries neither product_id nor ticker".into(),
                ))
            }
        };

        // Locate the ACTIVE batch.
        let batch_id = self
            .store
            .active_batch_id(event.account_id)
            .await
            .map_err(|e| LoaderError::Db(e.into()))?
            .ok_or(LoaderError::NoActiveBatch {
                account_id: event.account_id,
            })?;

        let batch = plk_db::fetch_batch(self.pool(), event.account_id, batch_id)
            .await
            .map_err(|e| LoaderError::Db(e.into()))?
            .ok_or(LoaderError::NoActiveBatch {
                account_id: event.account_id,
            })?;

        // Bitemporal mutation.
        let applied = self
            .store
            .apply_bitemporal_delta(
                event.account_id,
                product_id,
                batch_id,
                batch.business_date,
                event.signed_delta(),
                event.price,
                event.event_time,
            )
            .await
            .map_err(|e| LoaderError::Db(e.into()))?;

        // Record the transaction under the idempotency key.
        let inserted = plk_db::insert_transaction_deduped(
            self.pool(),
            &plk_db::NewTransaction {
                account_id: event.account_id,
                product_id,
                txn_type: event.side.as_str().to_string(),
                trade_date: batch.business_date,
                quantity: event.quantity,
                price: event.price,
                external_ref_id: event.external_ref_id.clone(),
            },
        )
        .await
        .map_err(|e| LoaderError::Db(e.into()))?;
        if !inserted {
            // Under the per-account lock this cannot race; a false here means
            // the key appeared between our check and now.
            tracing::warn!(
                external_ref_id = %event.external_ref_id,
                "transaction already recorded after mutation; check lock discipline"
            );
        }

        // Notify downstream consumers.
        self.bus.publish_event(
            Topic::PositionChangeEvents,
            event.account_id.to_string(),
            &PositionChangeEvent {
                account_id: event.account_id,
                product_id,
                new_quantity: applied.new_quantity,
                event_time: event.event_time,
            },
        );

        tracing::debug!(
            account_id = event.account_id,
            product_id,
            batch_id,
            new_quantity = %applied.new_quantity,
            "intraday event applied"
        );

        Ok(IntradayOutcome::Applied {
            batch_id,
            new_quantity: applied.new_quantity,
        })
    }
}
