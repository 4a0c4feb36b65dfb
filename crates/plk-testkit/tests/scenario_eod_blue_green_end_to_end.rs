//! End-to-end EOD + intraday scenarios against a live database:
//!
//! 1. Happy path: trigger → ACTIVE batch with both positions readable.
//! 2. Intraday BUY after EOD: quantity 110, weighted cost 150.90909091.
//! 3. Idempotent replay of the same external_ref_id: silent no-op.
//! 4. Duplicate snapshot rerun: COMPLETED_NOOP, no new batch.
//! 5. Intraday with no ACTIVE batch: NO_ACTIVE_BATCH error code.
//!
//! Requires PLK_DATABASE_URL; ignored by default.

use plk_eod::{EodOutcome, EodPipeline};
use plk_fabric::{DistributedLock, DrainState, MessageBus};
use plk_intraday::{IntradayOutcome, IntradayPipeline};
use plk_schemas::{EodTrigger, Topic};
use plk_store::PositionStore;
use plk_testkit::{bd, buy_event, dec, ScriptedSnapshotSource, SnapshotFixture};
use sqlx::PgPool;
use std::sync::Arc;

async fn pool() -> PgPool {
    plk_db::testkit_db_pool()
        .await
        .expect("DB tests require PLK_DATABASE_URL; run with -- --include-ignored")
}

fn fresh_account_id() -> i64 {
    700_000_000 + chrono::Utc::now().timestamp_subsec_micros() as i64
}

struct Harness {
    store: PositionStore,
    eod: EodPipeline,
    intraday: IntradayPipeline,
    bus: MessageBus,
}

fn harness(pool: PgPool, snapshots: Vec<plk_schemas::AccountSnapshot>) -> Harness {
    let config = Arc::new(plk_config::LoaderConfig::default());
    let store = PositionStore::new(pool.clone());
    let locks = DistributedLock::new(pool.clone());
    let bus = MessageBus::new();
    let drain = DrainState::new();
    let source = Arc::new(ScriptedSnapshotSource::new(snapshots));

    let eod = EodPipeline::new(
        store.clone(),
        source,
        locks.clone(),
        bus.clone(),
        drain.clone(),
        Arc::clone(&config),
    );
    let intraday = IntradayPipeline::new(
        store.clone(),
        locks,
        bus.clone(),
        drain,
        config,
    );

    Harness {
        store,
        eod,
        intraday,
        bus,
    }
}

async fn cleanup(pool: &PgPool, account_id: i64) {
    let client_id = account_id;
    let fund_id = account_id;
    for (sql, id) in [
        ("delete from transactions where account_id = $1", account_id),
        ("delete from positions where account_id = $1", account_id),
        ("delete from account_batches where account_id = $1", account_id),
        ("delete from eod_runs where account_id = $1", account_id),
        ("delete from snapshot_hashes where account_id = $1", account_id),
        ("delete from accounts where account_id = $1", account_id),
        ("delete from funds where fund_id = $1", fund_id),
        ("delete from clients where client_id = $1", client_id),
    ] {
        sqlx::query(sql).bind(id).execute(pool).await.unwrap();
    }
}

#[tokio::test]
#[ignore = "requires PLK_DATABASE_URL; run with -- --include-ignored"]
async fn eod_happy_path_then_intraday_then_replays() {
    let pool = pool().await;
    let account_id = fresh_account_id();
    let date = bd(2025, 1, 15);

    let snapshot = SnapshotFixture::new(account_id, date)
        .with_position(2001, "100", "150.00")
        .with_position(2002, "50", "400.00")
        .build();
    let h = harness(pool.clone(), vec![snapshot]);

    let mut signoff_rx = h.bus.subscribe(Topic::ClientReportingSignoff.as_str());

    // --- Scenario 1: happy path ---
    let trigger = EodTrigger {
        account_id,
        business_date: date,
    };
    let outcome = h.eod.run(&trigger).await.unwrap();
    let EodOutcome::Completed {
        batch_id,
        position_count,
    } = outcome
    else {
        panic!("first load must complete, got {outcome:?}");
    };
    assert_eq!(position_count, 2);

    let batch = plk_db::fetch_batch(&pool, account_id, batch_id)
        .await
        .unwrap()
        .expect("batch row exists");
    assert_eq!(batch.status, plk_schemas::BatchStatus::Active);
    assert_eq!(batch.position_count, 2);

    let visible = h.store.read_active_positions(account_id, date).await.unwrap();
    assert_eq!(visible.len(), 2);
    assert_eq!(visible[0].product_id, 2001);
    assert_eq!(visible[0].quantity, dec("100"));
    assert_eq!(visible[1].product_id, 2002);

    // This was the client's only outstanding account: sign-off fires.
    let signoff = signoff_rx.recv().await.expect("signoff event");
    assert_eq!(signoff.payload["client_id"], account_id);

    // --- Scenario 2: intraday BUY after EOD ---
    let e1 = {
        let mut e = buy_event(account_id, 2001, "10", "160.00", &format!("E1-{account_id}"));
        e.event_time = chrono::Utc::now();
        e
    };
    let applied = h.intraday.apply_event(&e1).await.unwrap();
    let IntradayOutcome::Applied { new_quantity, .. } = &applied else {
        panic!("first application must apply, got {applied:?}");
    };
    assert_eq!(*new_quantity, dec("110"));

    let visible = h.store.read_active_positions(account_id, date).await.unwrap();
    let p2001 = visible.iter().find(|p| p.product_id == 2001).unwrap();
    assert_eq!(p2001.quantity, dec("110"));
    assert_eq!(p2001.avg_cost_price, dec("150.90909091"));

    let recorded = plk_db::fetch_transaction_by_external_ref(&pool, &e1.external_ref_id)
        .await
        .unwrap();
    assert!(recorded.is_some(), "transaction row must exist");

    // --- Scenario 3: idempotent replay of E1 ---
    let replay = h.intraday.apply_event(&e1).await.unwrap();
    assert_eq!(replay, IntradayOutcome::Duplicate);

    let visible = h.store.read_active_positions(account_id, date).await.unwrap();
    let p2001 = visible.iter().find(|p| p.product_id == 2001).unwrap();
    assert_eq!(p2001.quantity, dec("110"), "replay must not move the position");

    // --- Scenario 5: duplicate snapshot rerun is a no-op ---
    let batches_before = plk_db::list_batches_for_account(&pool, account_id, 100)
        .await
        .unwrap()
        .len();
    let rerun = h.eod.run(&trigger).await.unwrap();
    assert_eq!(rerun, EodOutcome::Noop);

    let batches_after = plk_db::list_batches_for_account(&pool, account_id, 100)
        .await
        .unwrap()
        .len();
    assert_eq!(batches_after, batches_before, "no-op must not create a batch");

    let run = plk_db::latest_run(&pool, account_id, date).await.unwrap().unwrap();
    assert_eq!(run.status, plk_schemas::RunStatus::CompletedNoop);

    cleanup(&pool, account_id).await;
}

#[tokio::test]
#[ignore = "requires PLK_DATABASE_URL; run with -- --include-ignored"]
async fn second_distinct_snapshot_archives_the_first() {
    let pool = pool().await;
    let account_id = fresh_account_id();
    let date = bd(2025, 1, 15);

    let day_one = SnapshotFixture::new(account_id, date)
        .with_position(2001, "100", "150.00")
        .build();
    let day_one_corrected = SnapshotFixture::new(account_id, date)
        .with_position(2001, "120", "151.00")
        .build();
    let h = harness(pool.clone(), vec![day_one, day_one_corrected]);

    let trigger = EodTrigger {
        account_id,
        business_date: date,
    };

    let EodOutcome::Completed { batch_id: b1, .. } = h.eod.run(&trigger).await.unwrap() else {
        panic!("first load must complete");
    };
    let EodOutcome::Completed { batch_id: b2, .. } = h.eod.run(&trigger).await.unwrap() else {
        panic!("corrected load must complete");
    };
    assert!(b2 > b1, "batch ids are strictly increasing per account");

    let first = plk_db::fetch_batch(&pool, account_id, b1).await.unwrap().unwrap();
    let second = plk_db::fetch_batch(&pool, account_id, b2).await.unwrap().unwrap();
    assert_eq!(first.status, plk_schemas::BatchStatus::Archived);
    assert!(first.archived_at_utc.is_some());
    assert_eq!(second.status, plk_schemas::BatchStatus::Active);

    let visible = h.store.read_active_positions(account_id, date).await.unwrap();
    assert_eq!(visible.len(), 1);
    assert_eq!(visible[0].quantity, dec("120"));

    cleanup(&pool, account_id).await;
}

#[tokio::test]
#[ignore = "requires PLK_DATABASE_URL; run with -- --include-ignored"]
async fn intraday_without_active_batch_reports_no_active_batch() {
    let pool = pool().await;
    let account_id = fresh_account_id();

    let placeholder = SnapshotFixture::new(account_id, bd(2025, 1, 15)).build();
    let h = harness(pool.clone(), vec![placeholder]);

    let event = buy_event(account_id, 2001, "10", "100", &format!("NAB-{account_id}"));
    let err = h.intraday.apply_event(&event).await.unwrap_err();

    assert_eq!(err.code(), plk_schemas::error::NO_ACTIVE_BATCH);

    cleanup(&pool, account_id).await;
}

#[tokio::test]
#[ignore = "requires PLK_DATABASE_URL; run with -- --include-ignored"]
async fn quantity_to_exactly_zero_retains_cost_basis() {
    let pool = pool().await;
    let account_id = fresh_account_id();
    let date = bd(2025, 1, 15);

    let snapshot = SnapshotFixture::new(account_id, date)
        .with_position(2001, "100", "150.00")
        .build();
    let h = harness(pool.clone(), vec![snapshot]);

    let trigger = EodTrigger {
        account_id,
        business_date: date,
    };
    h.eod.run(&trigger).await.unwrap();

    // Sell the whole position.
    let sell = {
        let mut e = plk_testkit::sell_event(account_id, 2001, "100", "175.00", &format!("Z1-{account_id}"));
        e.event_time = chrono::Utc::now();
        e
    };
    h.intraday.apply_event(&sell).await.unwrap();

    let visible = h.store.read_active_positions(account_id, date).await.unwrap();
    let flat = visible.iter().find(|p| p.product_id == 2001).unwrap();
    assert_eq!(flat.quantity, dec("0"), "flat position stays as a zero row");
    assert_eq!(flat.avg_cost_price, dec("150.00"), "cost basis retained at zero");

    // A later BUY restores normal weighted averaging from the event price.
    let rebuy = {
        let mut e = buy_event(account_id, 2001, "20", "180.00", &format!("Z2-{account_id}"));
        e.event_time = chrono::Utc::now();
        e
    };
    h.intraday.apply_event(&rebuy).await.unwrap();

    let visible = h.store.read_active_positions(account_id, date).await.unwrap();
    let restored = visible.iter().find(|p| p.product_id == 2001).unwrap();
    assert_eq!(restored.quantity, dec("20"));
    assert_eq!(restored.avg_cost_price, dec("180.00"));

    cleanup(&pool, account_id).await;
}
