//! Circuit breaker per external dependency.
//!
//! CLOSED → OPEN when the failure rate over a sliding window of the last N
//! outcomes reaches the threshold. OPEN rejects calls until the cooldown
//! elapses, then HALF_OPEN admits a bounded number of probes: all probes
//! succeeding closes the circuit, any probe failing reopens it.

use plk_schemas::LoaderError;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
struct BreakerInner {
    state: BreakerState,
    /// Rolling outcome window, true = failure.
    window: VecDeque<bool>,
    opened_at: Option<Instant>,
    probes_in_flight: u32,
    probe_successes: u32,
}

/// Sliding-window failure-rate breaker. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct CircuitBreaker {
    name: String,
    failure_rate_pct: u32,
    window_size: usize,
    cooldown: Duration,
    half_open_probes: u32,
    inner: Arc<RwLock<BreakerInner>>,
}

impl CircuitBreaker {
    pub fn new(
        name: impl Into<String>,
        failure_rate_pct: u32,
        window_size: usize,
        cooldown: Duration,
        half_open_probes: u32,
    ) -> Self {
        Self {
            name: name.into(),
            failure_rate_pct,
            window_size: window_size.max(1),
            cooldown,
            half_open_probes: half_open_probes.max(1),
            inner: Arc::new(RwLock::new(BreakerInner {
                state: BreakerState::Closed,
                window: VecDeque::new(),
                opened_at: None,
                probes_in_flight: 0,
                probe_successes: 0,
            })),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn state(&self) -> BreakerState {
        self.inner.read().await.state
    }

    /// Run `operation` under breaker protection.
    ///
    /// Returns [`LoaderError::BreakerOpen`] without invoking the operation
    /// when the circuit is open (or the half-open probe budget is taken).
    pub async fn execute<F, Fut, T>(&self, operation: F) -> Result<T, LoaderError>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T, LoaderError>>,
    {
        self.admit().await?;

        match operation().await {
            Ok(v) => {
                self.record(false).await;
                Ok(v)
            }
            Err(e) => {
                self.record(true).await;
                Err(e)
            }
        }
    }

    /// Admission check: may transition OPEN → HALF_OPEN after the cooldown.
    async fn admit(&self) -> Result<(), LoaderError> {
        let mut inner = self.inner.write().await;
        match inner.state {
            BreakerState::Closed => Ok(()),
            BreakerState::Open => {
                let elapsed = inner
                    .opened_at
                    .map(|t| t.elapsed() >= self.cooldown)
                    .unwrap_or(true);
                if elapsed {
                    inner.state = BreakerState::HalfOpen;
                    inner.probes_in_flight = 1;
                    inner.probe_successes = 0;
                    tracing::info!(breaker = %self.name, "cooldown elapsed; half-open probe admitted");
                    Ok(())
                } else {
                    Err(LoaderError::BreakerOpen {
                        name: self.name.clone(),
                    })
                }
            }
            BreakerState::HalfOpen => {
                if inner.probes_in_flight < self.half_open_probes {
                    inner.probes_in_flight += 1;
                    Ok(())
                } else {
                    Err(LoaderError::BreakerOpen {
                        name: self.name.clone(),
                    })
                }
            }
        }
    }

    async fn record(&self, failure: bool) {
        let mut inner = self.inner.write().await;
        match inner.state {
            BreakerState::Closed => {
                inner.window.push_back(failure);
                while inner.window.len() > self.window_size {
                    inner.window.pop_front();
                }
                if inner.window.len() == self.window_size {
                    let failures = inner.window.iter().filter(|f| **f).count();
                    let rate_pct = failures * 100 / self.window_size;
                    if rate_pct >= self.failure_rate_pct as usize {
                        inner.state = BreakerState::Open;
                        inner.opened_at = Some(Instant::now());
                        inner.window.clear();
                        tracing::warn!(
                            breaker = %self.name,
                            failures,
                            window = self.window_size,
                            "failure rate threshold reached; circuit open"
                        );
                    }
                }
            }
            BreakerState::HalfOpen => {
                inner.probes_in_flight = inner.probes_in_flight.saturating_sub(1);
                if failure {
                    inner.state = BreakerState::Open;
                    inner.opened_at = Some(Instant::now());
                    inner.probe_successes = 0;
                    tracing::warn!(breaker = %self.name, "half-open probe failed; circuit reopened");
                } else {
                    inner.probe_successes += 1;
                    if inner.probe_successes >= self.half_open_probes {
                        inner.state = BreakerState::Closed;
                        inner.opened_at = None;
                        inner.window.clear();
                        tracing::info!(breaker = %self.name, "probes succeeded; circuit closed");
                    }
                }
            }
            // A late completion from before the circuit opened; the window
            // was cleared, nothing to record.
            BreakerState::Open => {}
        }
    }
}
