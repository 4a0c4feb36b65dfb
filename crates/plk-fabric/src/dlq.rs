//! Dead-letter parking and replay.
//!
//! [`DlqWriter`] is the single entry point pipelines use to park failed
//! work; the error kind decides the parked state:
//!
//! - transient / consistency / capacity → PENDING with an automatic first
//!   retry scheduled;
//! - recoverable data errors → PENDING for manual replay only, plus an alert;
//! - fatal errors → FAILED immediately, plus an alert, never retried.
//!
//! [`DlqReplayer`] is leader-elected via the `dlq-replayer` lock. The leader
//! claims due entries and redrives each through the originating pipeline's
//! handler; success marks PROCESSED, failure reschedules with exponential
//! backoff until the retry budget is spent, then FAILED + alert.

use anyhow::Result;
use chrono::Utc;
use plk_schemas::{ErrorKind, LoaderError};
use serde_json::{json, Value};
use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;

use crate::drain::DrainState;
use crate::lock::{DistributedLock, DLQ_REPLAYER_LOCK};

/// Exponential backoff for replay attempt `retry_count` (1-based after the
/// first failure), capped at one hour.
pub fn backoff_schedule(initial: Duration, retry_count: i32) -> Duration {
    const CAP: Duration = Duration::from_secs(3600);
    let shift = retry_count.clamp(0, 20) as u32;
    initial
        .checked_mul(2u32.saturating_pow(shift))
        .unwrap_or(CAP)
        .min(CAP)
}

#[derive(Clone)]
pub struct DlqWriter {
    pool: PgPool,
    initial_backoff: Duration,
}

impl DlqWriter {
    pub fn new(pool: PgPool, initial_backoff: Duration) -> Self {
        Self {
            pool,
            initial_backoff,
        }
    }

    /// Park a failed message according to its error kind.
    pub async fn park(
        &self,
        topic: &str,
        key: &str,
        payload: Value,
        err: &LoaderError,
    ) -> Result<i64> {
        let kind = err.kind();
        let (status, next_retry) = if kind.dlq_immediately_failed() {
            (plk_schemas::DlqStatus::Failed, None)
        } else if kind.is_transient() || kind == ErrorKind::Capacity {
            (
                plk_schemas::DlqStatus::Pending,
                Some(Utc::now() + chrono::Duration::from_std(self.initial_backoff)?),
            )
        } else {
            // Recoverable data error: parked for manual replay only.
            (plk_schemas::DlqStatus::Pending, None)
        };

        let dlq_id = plk_db::park_entry(
            &self.pool,
            &plk_db::NewDlqEntry {
                topic: topic.to_string(),
                msg_key: key.to_string(),
                payload,
                error_code: Some(err.code().to_string()),
                error_message: err.to_string(),
                next_retry_at_utc: next_retry,
                status,
            },
        )
        .await?;

        tracing::warn!(
            topic,
            key,
            dlq_id,
            code = err.code(),
            status = status.as_str(),
            "message parked in DLQ"
        );

        // Anything that will not retry automatically needs eyes on it.
        if next_retry.is_none() {
            plk_db::raise_alert(
                &self.pool,
                "dlq",
                err.code(),
                &format!("message on {topic} parked without automatic retry: {err}"),
                Some(json!({ "dlq_id": dlq_id, "key": key })),
            )
            .await?;
        }

        Ok(dlq_id)
    }

    /// Park with an explicit short deferral (intraday lock contention: the
    /// event is deferred, not failed).
    pub async fn park_deferred(
        &self,
        topic: &str,
        key: &str,
        payload: Value,
        err: &LoaderError,
        retry_in: Duration,
    ) -> Result<i64> {
        let dlq_id = plk_db::park_entry(
            &self.pool,
            &plk_db::NewDlqEntry {
                topic: topic.to_string(),
                msg_key: key.to_string(),
                payload,
                error_code: Some(err.code().to_string()),
                error_message: err.to_string(),
                next_retry_at_utc: Some(Utc::now() + chrono::Duration::from_std(retry_in)?),
                status: plk_schemas::DlqStatus::Pending,
            },
        )
        .await?;

        tracing::debug!(topic, key, dlq_id, retry_in_ms = retry_in.as_millis() as u64, "message deferred via DLQ");
        Ok(dlq_id)
    }
}

/// Redrive target: the replayer hands each claimed entry back to the
/// pipeline that owns the topic.
#[async_trait::async_trait]
pub trait DlqReplayHandler: Send + Sync {
    async fn handle(&self, topic: &str, key: &str, payload: &Value) -> Result<(), LoaderError>;
}

pub struct DlqReplayer {
    pool: PgPool,
    lock: DistributedLock,
    handler: Arc<dyn DlqReplayHandler>,
    max_retries: i32,
    initial_backoff: Duration,
    retention: Duration,
    claim_batch: i64,
}

/// Lease for one replay pass; also the claim TTL that lets entries claimed
/// by a crashed leader resurface.
const REPLAY_LEASE: Duration = Duration::from_secs(300);

impl DlqReplayer {
    pub fn new(
        pool: PgPool,
        lock: DistributedLock,
        handler: Arc<dyn DlqReplayHandler>,
        max_retries: i32,
        initial_backoff: Duration,
        retention: Duration,
    ) -> Self {
        Self {
            pool,
            lock,
            handler,
            max_retries,
            initial_backoff,
            retention,
            claim_batch: 50,
        }
    }

    /// One leader-elected pass. Returns the number of entries redriven, or
    /// `None` when another instance holds leadership.
    pub async fn run_once(&self) -> Result<Option<usize>> {
        let Some(guard) = self.lock.try_acquire(DLQ_REPLAYER_LOCK, REPLAY_LEASE).await? else {
            return Ok(None);
        };

        let result = self.redrive_due().await;

        // Leader also owns the retention sweep for terminal entries.
        if let Ok(retention) = chrono::Duration::from_std(self.retention) {
            match plk_db::purge_entries_before(&self.pool, Utc::now() - retention).await {
                Ok(purged) if purged > 0 => {
                    tracing::info!(purged, "DLQ retention sweep removed terminal entries")
                }
                Ok(_) => {}
                Err(e) => tracing::warn!(error = %e, "DLQ retention sweep failed"),
            }
        }

        match self.lock.release(&guard).await {
            Ok(()) => {}
            Err(LoaderError::LeaseLost { .. }) => {
                // Another leader took over mid-pass; our claims carry a TTL
                // so any half-done work resurfaces there.
                tracing::warn!("dlq-replayer lease lost mid-pass");
            }
            Err(e) => return Err(e.into()),
        }

        result.map(Some)
    }

    async fn redrive_due(&self) -> Result<usize> {
        let entries = plk_db::claim_due_entries(
            &self.pool,
            self.max_retries,
            self.claim_batch,
            REPLAY_LEASE.as_secs() as i64,
        )
        .await?;

        let mut redriven = 0usize;
        for entry in entries {
            match self
                .handler
                .handle(&entry.topic, &entry.msg_key, &entry.payload)
                .await
            {
                Ok(()) => {
                    plk_db::mark_entry_processed(&self.pool, entry.dlq_id).await?;
                    tracing::info!(dlq_id = entry.dlq_id, topic = %entry.topic, "DLQ entry replayed");
                }
                Err(
                    e @ (LoaderError::LockUnavailable { .. } | LoaderError::ShuttingDown),
                ) => {
                    // Deferral, not failure: the account is busy (EOD holds
                    // the lock) or we are draining. No budget consumed.
                    let next = Utc::now() + chrono::Duration::seconds(5);
                    plk_db::defer_entry(&self.pool, entry.dlq_id, next).await?;
                    tracing::debug!(dlq_id = entry.dlq_id, error = %e, "DLQ entry deferred");
                }
                Err(e) => {
                    let attempts_done = entry.retry_count + 1;
                    if attempts_done >= self.max_retries || e.kind().dlq_immediately_failed() {
                        plk_db::mark_entry_failed(&self.pool, entry.dlq_id).await?;
                        plk_db::raise_alert(
                            &self.pool,
                            "dlq-replayer",
                            "DLQ_EXHAUSTED",
                            &format!(
                                "entry {} on {} failed after {} attempts: {}",
                                entry.dlq_id, entry.topic, attempts_done, e
                            ),
                            Some(json!({ "dlq_id": entry.dlq_id, "key": entry.msg_key })),
                        )
                        .await?;
                    } else {
                        let delay = backoff_schedule(self.initial_backoff, attempts_done);
                        let next = Utc::now() + chrono::Duration::from_std(delay)?;
                        plk_db::reschedule_entry(&self.pool, entry.dlq_id, next).await?;
                        tracing::debug!(
                            dlq_id = entry.dlq_id,
                            retry_count = attempts_done,
                            delay_secs = delay.as_secs(),
                            "DLQ entry rescheduled"
                        );
                    }
                }
            }
            redriven += 1;
        }
        Ok(redriven)
    }

    /// Background loop for the daemon: poll, replay when leader, stop on
    /// shutdown.
    pub async fn run_loop(&self, interval: Duration, drain: DrainState) {
        loop {
            if drain.is_shutting_down() {
                tracing::info!("dlq-replayer stopping: shutdown in progress");
                return;
            }
            match self.run_once().await {
                Ok(Some(n)) if n > 0 => {
                    tracing::info!(redriven = n, "dlq-replayer pass complete")
                }
                Ok(_) => {}
                Err(e) => tracing::error!(error = %e, "dlq-replayer pass failed"),
            }
            tokio::time::sleep(interval).await;
        }
    }
}
