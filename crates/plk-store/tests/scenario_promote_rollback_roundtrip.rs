//! Scenario: promote then rollback returns the readable state to the exact
//! positions visible before promotion, and the blue/green swap never leaves
//! readers a mixed view.
//!
//! Requires a live PostgreSQL instance reachable via PLK_DATABASE_URL.
//! Each test uses its own account id derived from the current time and
//! deletes its rows at the end, so reruns against a shared DB stay clean.

use chrono::NaiveDate;
use plk_schemas::{AccountRef, ClientRef, FundRef, ProductRef};
use plk_store::{PositionStore, StagedPosition};
use sqlx::PgPool;

async fn pool() -> PgPool {
    plk_db::testkit_db_pool()
        .await
        .expect("DB tests require PLK_DATABASE_URL; run with -- --include-ignored")
}

fn bd() -> NaiveDate {
    NaiveDate::from_ymd_opt(2025, 1, 15).unwrap()
}

fn fresh_account_id() -> i64 {
    // Unique per invocation; high range keeps clear of real reference data.
    800_000_000 + chrono::Utc::now().timestamp_subsec_micros() as i64
}

async fn seed_reference(pool: &PgPool, account_id: i64) {
    plk_db::upsert_client(
        pool,
        &ClientRef {
            client_id: account_id,
            name: "Roundtrip Test".into(),
            status: "ACTIVE".into(),
        },
    )
    .await
    .unwrap();
    plk_db::upsert_fund(
        pool,
        &FundRef {
            fund_id: account_id,
            client_id: account_id,
            base_currency: "USD".into(),
        },
    )
    .await
    .unwrap();
    plk_db::upsert_account(
        pool,
        &AccountRef {
            account_id,
            fund_id: account_id,
            account_number: format!("RT-{account_id}"),
            base_currency: "USD".into(),
            status: "ACTIVE".into(),
        },
    )
    .await
    .unwrap();
    for product_id in [2001, 2002] {
        plk_db::upsert_product(
            pool,
            &ProductRef {
                product_id,
                ticker: format!("TKR{product_id}"),
                asset_class: "EQUITY".into(),
                issue_ccy: "USD".into(),
                settle_ccy: "USD".into(),
            },
        )
        .await
        .unwrap();
    }
}

async fn cleanup(pool: &PgPool, account_id: i64) {
    for sql in [
        "delete from positions where account_id = $1",
        "delete from account_batches where account_id = $1",
        "delete from accounts where account_id = $1",
        "delete from funds where fund_id = $1",
        "delete from clients where client_id = $1",
    ] {
        sqlx::query(sql).bind(account_id).execute(pool).await.unwrap();
    }
}

fn staged(product_id: i64, qty: &str, price: &str) -> StagedPosition {
    let quantity: rust_decimal::Decimal = qty.parse().unwrap();
    let avg_cost_price: rust_decimal::Decimal = price.parse().unwrap();
    StagedPosition {
        product_id,
        quantity,
        avg_cost_price,
        cost_local: (quantity * avg_cost_price).round_dp(8),
        mv_base: (quantity * avg_cost_price).round_dp(8),
    }
}

async fn load_batch(store: &PositionStore, account_id: i64, rows: Vec<StagedPosition>) -> i64 {
    let batch_id = store.create_batch(account_id, bd(), "EOD").await.unwrap();
    store
        .insert_positions_to_staging(account_id, batch_id, bd(), "EOD", &rows, 500)
        .await
        .unwrap();
    store.promote_batch(account_id, bd(), batch_id).await.unwrap();
    batch_id
}

#[tokio::test]
#[ignore = "requires PLK_DATABASE_URL; run with -- --include-ignored"]
async fn promote_then_rollback_restores_prior_view() {
    let pool = pool().await;
    let store = PositionStore::new(pool.clone());
    let account_id = fresh_account_id();
    seed_reference(&pool, account_id).await;

    // First-ever snapshot: batch 1, promoted, nothing archived.
    let b1 = load_batch(
        &store,
        account_id,
        vec![staged(2001, "100", "150.00"), staged(2002, "50", "400.00")],
    )
    .await;
    assert_eq!(b1, 1);

    let before = store.read_active_positions(account_id, bd()).await.unwrap();
    assert_eq!(before.len(), 2);

    // Second snapshot supersedes the first.
    let b2 = load_batch(&store, account_id, vec![staged(2001, "120", "152.00")]).await;
    assert_eq!(b2, 2);

    let after = store.read_active_positions(account_id, bd()).await.unwrap();
    assert_eq!(after.len(), 1);
    assert_eq!(after[0].batch_id, b2);

    // Rollback restores batch 1 exactly.
    let rolled = store.rollback_batch(account_id, bd()).await.unwrap();
    assert!(rolled);

    let restored = store.read_active_positions(account_id, bd()).await.unwrap();
    let key = |rows: &[plk_store::PositionRow]| {
        rows.iter()
            .map(|p| (p.product_id, p.quantity, p.avg_cost_price))
            .collect::<Vec<_>>()
    };
    assert_eq!(key(&restored), key(&before), "rollback must restore the prior view");

    cleanup(&pool, account_id).await;
}

#[tokio::test]
#[ignore = "requires PLK_DATABASE_URL; run with -- --include-ignored"]
async fn rollback_without_predecessor_returns_false() {
    let pool = pool().await;
    let store = PositionStore::new(pool.clone());
    let account_id = fresh_account_id();
    seed_reference(&pool, account_id).await;

    load_batch(&store, account_id, vec![staged(2001, "10", "99.00")]).await;

    let rolled = store.rollback_batch(account_id, bd()).await.unwrap();
    assert!(!rolled, "first-ever batch has no archived predecessor");

    // The active batch must be untouched by the refused rollback.
    let view = store.read_active_positions(account_id, bd()).await.unwrap();
    assert_eq!(view.len(), 1);

    cleanup(&pool, account_id).await;
}

#[tokio::test]
#[ignore = "requires PLK_DATABASE_URL; run with -- --include-ignored"]
async fn staging_rows_are_invisible_until_promotion() {
    let pool = pool().await;
    let store = PositionStore::new(pool.clone());
    let account_id = fresh_account_id();
    seed_reference(&pool, account_id).await;

    let batch_id = store.create_batch(account_id, bd(), "EOD").await.unwrap();
    store
        .insert_positions_to_staging(
            account_id,
            batch_id,
            bd(),
            "EOD",
            &[staged(2001, "100", "150.00")],
            500,
        )
        .await
        .unwrap();

    let visible = store.read_active_positions(account_id, bd()).await.unwrap();
    assert!(visible.is_empty(), "STAGING rows must not be readable");

    store.promote_batch(account_id, bd(), batch_id).await.unwrap();
    let visible = store.read_active_positions(account_id, bd()).await.unwrap();
    assert_eq!(visible.len(), 1);

    cleanup(&pool, account_id).await;
}

#[tokio::test]
#[ignore = "requires PLK_DATABASE_URL; run with -- --include-ignored"]
async fn bitemporal_delta_keeps_intervals_disjoint() {
    let pool = pool().await;
    let store = PositionStore::new(pool.clone());
    let account_id = fresh_account_id();
    seed_reference(&pool, account_id).await;

    let batch_id = load_batch(&store, account_id, vec![staged(2001, "100", "150.00")]).await;

    let before_mutation = chrono::Utc::now();

    let applied = store
        .apply_bitemporal_delta(
            account_id,
            2001,
            batch_id,
            bd(),
            "10".parse().unwrap(),
            "160.00".parse().unwrap(),
            chrono::Utc::now(),
        )
        .await
        .unwrap();
    assert_eq!(applied.new_quantity, "110".parse().unwrap());
    assert_eq!(applied.new_avg_cost, "150.90909091".parse().unwrap());

    // Exactly one open version; the closed one ends where the new one starts.
    let versions: Vec<(chrono::DateTime<chrono::Utc>, chrono::DateTime<chrono::Utc>)> =
        sqlx::query_as(
            "select system_from, system_to from positions \
             where account_id = $1 and product_id = 2001 and batch_id = $2 \
             order by system_from",
        )
        .bind(account_id)
        .bind(batch_id)
        .fetch_all(&pool)
        .await
        .unwrap();
    assert_eq!(versions.len(), 2);
    assert_eq!(versions[0].1, versions[1].0, "system intervals must be contiguous");
    assert_eq!(versions[1].1, plk_db::system_to_infinity());

    // AS OF before the mutation still sees the original quantity.
    let historical = store
        .read_positions_as_of(account_id, before_mutation)
        .await
        .unwrap();
    let original: Vec<_> = historical
        .iter()
        .filter(|p| p.product_id == 2001 && p.batch_id == batch_id)
        .collect();
    assert_eq!(original.len(), 1);
    assert_eq!(original[0].quantity, "100".parse().unwrap());

    cleanup(&pool, account_id).await;
}
