//! Scenario: the upstream returns HTTP 500 repeatedly; the fetch is retried
//! within its budget, the final error is still transient (so the trigger is
//! parked retryable), and a recovered upstream succeeds on replay.
//!
//! Pure in-process: the scripted source plays the upstream, the production
//! retry schedule and breaker do the rest.

use plk_eod::SnapshotSource;
use plk_fabric::{retry_with_backoff, CircuitBreaker, RetrySchedule};
use plk_testkit::{bd, FlakySnapshotSource, SnapshotFixture};
use std::sync::Arc;
use std::time::Duration;

fn fast_schedule(max_attempts: u32) -> RetrySchedule {
    RetrySchedule {
        max_attempts,
        initial_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(4),
        multiplier: 2.0,
    }
}

fn snapshot() -> plk_schemas::AccountSnapshot {
    SnapshotFixture::new(1001, bd(2025, 1, 15))
        .with_position(2001, "100", "150.00")
        .build()
}

#[tokio::test]
async fn persistent_500s_exhaust_the_budget_and_stay_retryable() {
    let source = Arc::new(FlakySnapshotSource::new(snapshot(), u32::MAX));

    let err = retry_with_backoff(&fast_schedule(3), || {
        let source = Arc::clone(&source);
        async move { source.fetch(1001, bd(2025, 1, 15)).await }
    })
    .await
    .unwrap_err();

    assert_eq!(source.calls(), 3, "budget counts invocations");
    assert!(
        err.is_transient(),
        "an exhausted transient failure parks as retryable, not FAILED"
    );
}

#[tokio::test]
async fn recovery_within_budget_succeeds() {
    let source = Arc::new(FlakySnapshotSource::new(snapshot(), 2));

    let snap = retry_with_backoff(&fast_schedule(3), || {
        let source = Arc::clone(&source);
        async move { source.fetch(1001, bd(2025, 1, 15)).await }
    })
    .await
    .unwrap();

    assert_eq!(source.calls(), 3);
    assert_eq!(snap.positions.len(), 1);
}

#[tokio::test]
async fn breaker_opens_under_sustained_upstream_failure() {
    // Production tuning for the upstream dependency: 50% of the last 10.
    let breaker = CircuitBreaker::new("upstream", 50, 10, Duration::from_secs(30), 2);
    let source = Arc::new(FlakySnapshotSource::new(snapshot(), u32::MAX));

    let mut breaker_refusals = 0;
    for _ in 0..12 {
        let result = breaker
            .execute(|| {
                let source = Arc::clone(&source);
                async move { source.fetch(1001, bd(2025, 1, 15)).await }
            })
            .await;
        if matches!(result, Err(plk_schemas::LoaderError::BreakerOpen { .. })) {
            breaker_refusals += 1;
        }
    }

    assert_eq!(
        breaker.state().await,
        plk_fabric::BreakerState::Open,
        "sustained failure must open the circuit"
    );
    assert!(breaker_refusals >= 2, "open circuit must refuse without calling");
    assert!(
        source.calls() <= 10,
        "refused calls never reach the upstream (got {})",
        source.calls()
    );
}
