//! Bounded in-pipeline retry with exponential backoff.
//!
//! Only transient error kinds are retried; everything else surfaces to the
//! pipeline boundary on the first failure. When the budget is exhausted the
//! last error is returned and the caller decides DLQ routing.

use plk_schemas::LoaderError;
use std::time::Duration;
use tokio::time::sleep;

/// Retry schedule: attempt `n` (0-based) sleeps
/// `min(initial * multiplier^n, max)` before the next try.
#[derive(Debug, Clone)]
pub struct RetrySchedule {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
}

impl Default for RetrySchedule {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(5),
            multiplier: 2.0,
        }
    }
}

impl RetrySchedule {
    /// Delay before retry number `attempt` (0-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.powi(attempt as i32);
        let millis = (self.initial_delay.as_millis() as f64 * factor) as u64;
        Duration::from_millis(millis).min(self.max_delay)
    }
}

/// Run `f` until success, a non-transient error, or the attempt budget is
/// spent. `max_attempts` counts total invocations, not just retries.
pub async fn retry_with_backoff<F, Fut, T>(
    schedule: &RetrySchedule,
    mut f: F,
) -> Result<T, LoaderError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, LoaderError>>,
{
    let attempts = schedule.max_attempts.max(1);

    for attempt in 0..attempts {
        match f().await {
            Ok(v) => return Ok(v),
            Err(e) if e.is_transient() && attempt + 1 < attempts => {
                let delay = schedule.delay_for(attempt);
                tracing::debug!(
                    attempt = attempt + 1,
                    of = attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "transient failure; backing off"
                );
                sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
    unreachable!("loop returns on the final attempt");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn schedule() -> RetrySchedule {
        RetrySchedule {
            max_attempts: 3,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(8),
            multiplier: 2.0,
        }
    }

    #[tokio::test]
    async fn succeeds_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let out = retry_with_backoff(&schedule(), || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(LoaderError::Upstream("timeout".into()))
                } else {
                    Ok(n)
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(out, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_budget() {
        let calls = AtomicU32::new(0);
        let err = retry_with_backoff(&schedule(), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err::<u32, _>(LoaderError::Upstream("timeout".into())) }
        })
        .await
        .unwrap_err();
        assert!(err.is_transient());
        assert_eq!(calls.load(Ordering::SeqCst), 3, "budget counts invocations");
    }

    #[tokio::test]
    async fn non_transient_error_fails_immediately() {
        let calls = AtomicU32::new(0);
        let err = retry_with_backoff(&schedule(), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err::<u32, _>(LoaderError::Malformed("bad payload".into())) }
        })
        .await
        .unwrap_err();
        assert!(!err.is_transient());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let s = schedule();
        assert_eq!(s.delay_for(0), Duration::from_millis(1));
        assert_eq!(s.delay_for(1), Duration::from_millis(2));
        assert_eq!(s.delay_for(2), Duration::from_millis(4));
        assert_eq!(s.delay_for(3), Duration::from_millis(8));
        assert_eq!(s.delay_for(10), Duration::from_millis(8), "capped at max");
    }
}
