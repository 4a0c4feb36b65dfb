//! Per-account and leader-election locks.
//!
//! Thin ergonomic layer over `plk_db::locks`: bounded-wait acquisition with
//! polling, lease extension, and loss detection on release. The guard does
//! not auto-release on drop — release is an async, failure-reporting
//! operation and the pipelines must observe a seized lease (it means their
//! work has to be treated as aborted).

use anyhow::Result;
use plk_schemas::LoaderError;
use sqlx::PgPool;
use std::time::Duration;
use uuid::Uuid;

/// Default lease: 10 minutes (`lockAtMostFor`).
pub const DEFAULT_LEASE: Duration = Duration::from_secs(600);

const POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Clone)]
pub struct DistributedLock {
    pool: PgPool,
    owner_id: Uuid,
}

/// A held lease. `name` and `owner_id` identify it for extend/release.
#[derive(Debug, Clone)]
pub struct LockGuard {
    pub name: String,
    pub owner_id: Uuid,
}

impl DistributedLock {
    /// Each process gets one owner id; all its leases share it.
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            owner_id: Uuid::new_v4(),
        }
    }

    pub fn owner_id(&self) -> Uuid {
        self.owner_id
    }

    /// Acquire `name` within `max_wait`, polling. Fails fast with
    /// [`LoaderError::LockUnavailable`] when the bound is exceeded.
    pub async fn acquire(
        &self,
        name: &str,
        lease: Duration,
        max_wait: Duration,
    ) -> Result<LockGuard, LoaderError> {
        let deadline = tokio::time::Instant::now() + max_wait;

        loop {
            let acquired = plk_db::try_acquire_lock(&self.pool, name, self.owner_id, lease)
                .await
                .map_err(|e| LoaderError::Db(e.into()))?;

            if acquired {
                return Ok(LockGuard {
                    name: name.to_string(),
                    owner_id: self.owner_id,
                });
            }

            if tokio::time::Instant::now() >= deadline {
                return Err(LoaderError::LockUnavailable {
                    name: name.to_string(),
                    waited_ms: max_wait.as_millis() as u64,
                });
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    /// Single non-blocking attempt.
    pub async fn try_acquire(
        &self,
        name: &str,
        lease: Duration,
    ) -> Result<Option<LockGuard>, LoaderError> {
        let acquired = plk_db::try_acquire_lock(&self.pool, name, self.owner_id, lease)
            .await
            .map_err(|e| LoaderError::Db(e.into()))?;

        Ok(acquired.then(|| LockGuard {
            name: name.to_string(),
            owner_id: self.owner_id,
        }))
    }

    /// Release a held lease. Returns [`LoaderError::LeaseLost`] if another
    /// owner seized it while we held it — callers must treat their work as
    /// aborted, not merely log and move on.
    pub async fn release(&self, guard: &LockGuard) -> Result<(), LoaderError> {
        let released = plk_db::release_lock(&self.pool, &guard.name, guard.owner_id)
            .await
            .map_err(|e| LoaderError::Db(e.into()))?;

        if released {
            Ok(())
        } else {
            Err(LoaderError::LeaseLost {
                name: guard.name.clone(),
            })
        }
    }

    /// Extend a held lease mid-run (long EOD loads heartbeat this).
    pub async fn extend(&self, guard: &LockGuard, lease: Duration) -> Result<(), LoaderError> {
        let extended = plk_db::extend_lock(&self.pool, &guard.name, guard.owner_id, lease)
            .await
            .map_err(|e| LoaderError::Db(e.into()))?;

        if extended {
            Ok(())
        } else {
            Err(LoaderError::LeaseLost {
                name: guard.name.clone(),
            })
        }
    }
}

/// Lock name for the EOD pipeline's per-account serialization.
pub fn eod_lock_name(account_id: i64) -> String {
    format!("eod:{account_id}")
}

/// Lock name for the intraday pipeline's per-account serialization.
pub fn intraday_lock_name(account_id: i64) -> String {
    format!("intraday:{account_id}")
}

/// Leader-election lock for the DLQ replayer.
pub const DLQ_REPLAYER_LOCK: &str = "dlq-replayer";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_names_are_stable() {
        assert_eq!(eod_lock_name(1001), "eod:1001");
        assert_eq!(intraday_lock_name(1001), "intraday:1001");
        assert_eq!(DLQ_REPLAYER_LOCK, "dlq-replayer");
    }
}
