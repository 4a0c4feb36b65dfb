//! Graceful drain.
//!
//! One process-wide [`DrainState`]: the shutdown flag has a single writer
//! (the signal handler), consumers read it at admission, and every pipeline
//! invocation brackets itself with a [`DrainGuard`] so shutdown can wait for
//! in-flight work with a bound.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

#[derive(Clone, Default)]
pub struct DrainState {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    shutting_down: AtomicBool,
    in_flight: AtomicI64,
    idle: Notify,
}

/// RAII bracket around one pipeline invocation.
pub struct DrainGuard {
    inner: Arc<Inner>,
}

impl DrainState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.shutting_down.load(Ordering::SeqCst)
    }

    /// Flip the flag. New work is refused from this point on.
    pub fn begin_shutdown(&self) {
        self.inner.shutting_down.store(true, Ordering::SeqCst);
        // Wake a drain waiter even if nothing was in flight.
        self.inner.idle.notify_waiters();
    }

    /// Count one invocation in. Returns `None` when shutting down — the
    /// caller must refuse the work.
    pub fn enter(&self) -> Option<DrainGuard> {
        if self.is_shutting_down() {
            return None;
        }
        self.inner.in_flight.fetch_add(1, Ordering::SeqCst);
        // Late check: a shutdown racing the increment sees the count and
        // waits for this guard like any other.
        Some(DrainGuard {
            inner: Arc::clone(&self.inner),
        })
    }

    pub fn in_flight(&self) -> i64 {
        self.inner.in_flight.load(Ordering::SeqCst)
    }

    /// Wait up to `timeout` for in-flight work to finish. Returns true when
    /// everything drained, false on timeout.
    pub async fn wait_for_drain(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.in_flight() == 0 {
                return true;
            }
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return false;
            }
            let _ = tokio::time::timeout(remaining, self.inner.idle.notified()).await;
        }
    }
}

impl Drop for DrainGuard {
    fn drop(&mut self) {
        let prev = self.inner.in_flight.fetch_sub(1, Ordering::SeqCst);
        if prev <= 1 {
            self.inner.idle.notify_waiters();
        }
    }
}
