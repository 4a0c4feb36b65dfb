//! Scenario: the group-by-account dispatcher applies events in event-time
//! order within an account even when groups run concurrently, and offers no
//! ordering across accounts.

use plk_intraday::group_by_account;
use plk_testkit::buy_event;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::task::JoinSet;

fn event_at(account_id: i64, refid: &str, ts_secs: i64) -> plk_schemas::IntradayEvent {
    let mut e = buy_event(account_id, 2001, "1", "100", refid);
    e.event_time = plk_testkit::ts(ts_secs);
    e
}

#[tokio::test]
async fn per_account_order_survives_concurrent_group_execution() {
    // Interleaved arrivals across three accounts, out of event-time order
    // within each account.
    let batch = vec![
        event_at(3, "c2", 20),
        event_at(1, "a3", 30),
        event_at(2, "b1", 10),
        event_at(1, "a1", 10),
        event_at(3, "c1", 10),
        event_at(2, "b2", 20),
        event_at(1, "a2", 20),
    ];

    let groups = group_by_account(batch);
    let applied: Arc<Mutex<HashMap<i64, Vec<String>>>> = Arc::new(Mutex::new(HashMap::new()));

    // Groups in parallel, each group sequential — the dispatcher's discipline.
    let mut tasks = JoinSet::new();
    for (account_id, group) in groups {
        let applied = Arc::clone(&applied);
        tasks.spawn(async move {
            for event in group {
                // Yield between events so concurrent groups interleave.
                tokio::task::yield_now().await;
                applied
                    .lock()
                    .unwrap()
                    .entry(account_id)
                    .or_default()
                    .push(event.external_ref_id);
            }
        });
    }
    while tasks.join_next().await.is_some() {}

    let applied = applied.lock().unwrap();
    assert_eq!(applied[&1], vec!["a1", "a2", "a3"]);
    assert_eq!(applied[&2], vec!["b1", "b2"]);
    assert_eq!(applied[&3], vec!["c1", "c2"]);
}

#[tokio::test]
async fn all_events_of_a_batch_are_applied_exactly_once() {
    let batch: Vec<_> = (0..100)
        .map(|i| event_at(i % 7, &format!("e{i}"), i))
        .collect();

    let groups = group_by_account(batch);
    let total: usize = groups.values().map(Vec::len).sum();
    assert_eq!(total, 100, "grouping must neither drop nor duplicate events");

    // Each group's refs stay unique.
    for group in groups.values() {
        let mut refs: Vec<_> = group.iter().map(|e| e.external_ref_id.clone()).collect();
        refs.sort();
        refs.dedup();
        assert_eq!(refs.len(), group.len());
    }
}
