//! Batch consumer and group-by-account dispatcher.
//!
//! Events are consumed in batches (cap ~100), grouped by account, and each
//! group is applied sequentially in event-time order while groups run in
//! parallel. Ordering is guaranteed within an account only.

use plk_fabric::{DlqWriter, DrainState, MessageBus};
use plk_schemas::{IntradayEvent, LoaderError, Topic};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;

/// Batch consumption cap.
const BATCH_CAP: usize = 100;

/// Deferral for events that hit EOD's lock: near-future retry via the DLQ.
const LOCK_DEFER_RETRY: Duration = Duration::from_secs(5);

const IDLE_POLL: Duration = Duration::from_secs(1);

/// Group a batch by account, each group sorted by event time (stable, so
/// equal timestamps keep arrival order). BTreeMap gives deterministic group
/// iteration, which keeps tests and logs stable.
pub fn group_by_account(events: Vec<IntradayEvent>) -> BTreeMap<i64, Vec<IntradayEvent>> {
    let mut groups: BTreeMap<i64, Vec<IntradayEvent>> = BTreeMap::new();
    for event in events {
        groups.entry(event.account_id).or_default().push(event);
    }
    for group in groups.values_mut() {
        group.sort_by_key(|e| e.event_time);
    }
    groups
}

pub async fn run_intraday_consumer(
    pipeline: Arc<super::IntradayPipeline>,
    bus: MessageBus,
    dlq: DlqWriter,
    drain: DrainState,
) {
    let mut rx = bus.subscribe(Topic::Intraday.as_str());
    tracing::info!(batch_cap = BATCH_CAP, "intraday consumer started");

    loop {
        if drain.is_shutting_down() {
            break;
        }

        let batch = match tokio::time::timeout(IDLE_POLL, rx.recv_batch(BATCH_CAP)).await {
            Ok(batch) if batch.is_empty() => break, // bus gone
            Ok(batch) => batch,
            Err(_) => continue,
        };

        // Parse up front; malformed records go straight to the DLQ.
        let mut events = Vec::with_capacity(batch.len());
        for msg in batch {
            match serde_json::from_value::<IntradayEvent>(msg.payload.clone()) {
                Ok(event) => events.push(event),
                Err(e) => {
                    let err = LoaderError::Malformed(format!("intraday event did not parse: {e}"));
                    if let Err(park_err) = dlq
                        .park(Topic::Intraday.as_str(), &msg.key, msg.payload, &err)
                        .await
                    {
                        tracing::error!(error = %park_err, "failed to park malformed intraday event");
                    }
                }
            }
        }

        // Groups in parallel, each group strictly sequential. The batch is
        // only considered consumed once every group has finished.
        let mut tasks: JoinSet<()> = JoinSet::new();
        for (account_id, group) in group_by_account(events) {
            let pipeline = Arc::clone(&pipeline);
            let dlq = dlq.clone();
            tasks.spawn(async move {
                apply_group(&pipeline, &dlq, account_id, group).await;
            });
        }
        while tasks.join_next().await.is_some() {}
    }

    tracing::info!("intraday consumer stopped");
}

async fn apply_group(
    pipeline: &super::IntradayPipeline,
    dlq: &DlqWriter,
    account_id: i64,
    group: Vec<IntradayEvent>,
) {
    for event in group {
        match pipeline.apply_event(&event).await {
            Ok(_) => {}
            Err(err) => {
                let payload = match serde_json::to_value(&event) {
                    Ok(p) => p,
                    Err(e) => {
                        tracing::error!(account_id, error = %e, "event re-serialization failed");
                        continue;
                    }
                };
                let key = account_id.to_string();
                let result = match &err {
                    // EOD holds the account: defer the event, don't fail it.
                    LoaderError::LockUnavailable { .. } | LoaderError::ShuttingDown => {
                        dlq.park_deferred(
                            Topic::Intraday.as_str(),
                            &key,
                            payload,
                            &err,
                            LOCK_DEFER_RETRY,
                        )
                        .await
                    }
                    _ => dlq.park(Topic::Intraday.as_str(), &key, payload, &err).await,
                };
                if let Err(park_err) = result {
                    tracing::error!(account_id, error = %park_err, "failed to park intraday event");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use plk_schemas::Side;
    use uuid::Uuid;

    fn event(account_id: i64, refid: &str, ts_secs: i64) -> IntradayEvent {
        IntradayEvent {
            correlation_id: Uuid::new_v4(),
            account_id,
            product_id: Some(2001),
            ticker: None,
            side: Side::Buy,
            quantity: "10".parse().unwrap(),
            price: "100".parse().unwrap(),
            external_ref_id: refid.into(),
            event_time: Utc.timestamp_opt(ts_secs, 0).unwrap(),
        }
    }

    #[test]
    fn groups_split_by_account() {
        let groups = group_by_account(vec![
            event(1001, "a", 10),
            event(1002, "b", 11),
            event(1001, "c", 12),
        ]);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[&1001].len(), 2);
        assert_eq!(groups[&1002].len(), 1);
    }

    #[test]
    fn within_group_events_sort_by_event_time() {
        let groups = group_by_account(vec![
            event(1001, "late", 30),
            event(1001, "early", 10),
            event(1001, "mid", 20),
        ]);
        let refs: Vec<_> = groups[&1001]
            .iter()
            .map(|e| e.external_ref_id.as_str())
            .collect();
        assert_eq!(refs, vec!["early", "mid", "late"]);
    }

    #[test]
    fn equal_timestamps_keep_arrival_order() {
        let groups = group_by_account(vec![
            event(1001, "first", 10),
            event(1001, "second", 10),
            event(1001, "third", 10),
        ]);
        let refs: Vec<_> = groups[&1001]
            .iter()
            .map(|e| e.external_ref_id.as_str())
            .collect();
        assert_eq!(refs, vec!["first", "second", "third"], "sort must be stable");
    }

    #[test]
    fn cross_account_order_is_unconstrained_but_deterministic() {
        let groups = group_by_account(vec![event(1002, "b", 1), event(1001, "a", 2)]);
        let accounts: Vec<_> = groups.keys().copied().collect();
        assert_eq!(accounts, vec![1001, 1002]);
    }
}
