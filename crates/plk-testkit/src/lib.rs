//! Shared fixtures for scenario tests.
//!
//! Builders for snapshots and intraday events, a scripted snapshot source,
//! and pure in-process mirrors of the DB idempotency contracts (so scenario
//! tests can run without a live database, the same way the reliability rules
//! behave in production).

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use plk_eod::SnapshotSource;
use plk_schemas::{
    AccountRef, AccountSnapshot, ClientRef, FundRef, IntradayEvent, LoaderError, ProductRef, Side,
    SnapshotPosition,
};
use rust_decimal::Decimal;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use uuid::Uuid;

pub fn dec(s: &str) -> Decimal {
    s.parse().expect("test decimal literal")
}

pub fn bd(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).expect("test date literal")
}

pub fn ts(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).unwrap()
}

// ---------------------------------------------------------------------------
// Snapshot builder
// ---------------------------------------------------------------------------

pub struct SnapshotFixture {
    snapshot: AccountSnapshot,
}

impl SnapshotFixture {
    pub fn new(account_id: i64, business_date: NaiveDate) -> Self {
        // One client and fund per account keeps concurrent tests isolated
        // (sign-off readiness is a per-client query).
        let client_id = account_id;
        let fund_id = account_id;
        Self {
            snapshot: AccountSnapshot {
                account_id,
                business_date,
                client: ClientRef {
                    client_id,
                    name: format!("Client {client_id}"),
                    status: "ACTIVE".into(),
                },
                fund: FundRef {
                    fund_id,
                    client_id,
                    base_currency: "USD".into(),
                },
                account: AccountRef {
                    account_id,
                    fund_id,
                    account_number: format!("ACC-{account_id}"),
                    base_currency: "USD".into(),
                    status: "ACTIVE".into(),
                },
                products: vec![],
                positions: vec![],
            },
        }
    }

    pub fn with_position(mut self, product_id: i64, qty: &str, price: &str) -> Self {
        let quantity = dec(qty);
        let avg_cost_price = dec(price);
        self.snapshot.products.push(ProductRef {
            product_id,
            ticker: format!("TKR{product_id}"),
            asset_class: "EQUITY".into(),
            issue_ccy: "USD".into(),
            settle_ccy: "USD".into(),
        });
        self.snapshot.positions.push(SnapshotPosition {
            product_id,
            quantity,
            avg_cost_price,
            cost_local: (quantity * avg_cost_price).round_dp(8),
            mv_base: (quantity * avg_cost_price).round_dp(8),
        });
        self
    }

    pub fn build(self) -> AccountSnapshot {
        self.snapshot
    }
}

// ---------------------------------------------------------------------------
// Intraday event builder
// ---------------------------------------------------------------------------

pub fn buy_event(account_id: i64, product_id: i64, qty: &str, price: &str, refid: &str) -> IntradayEvent {
    IntradayEvent {
        correlation_id: Uuid::new_v4(),
        account_id,
        product_id: Some(product_id),
        ticker: None,
        side: Side::Buy,
        quantity: dec(qty),
        price: dec(price),
        external_ref_id: refid.to_string(),
        event_time: Utc::now(),
    }
}

pub fn sell_event(account_id: i64, product_id: i64, qty: &str, price: &str, refid: &str) -> IntradayEvent {
    IntradayEvent {
        side: Side::Sell,
        ..buy_event(account_id, product_id, qty, price, refid)
    }
}

// ---------------------------------------------------------------------------
// Scripted snapshot source
// ---------------------------------------------------------------------------

/// Fails the first `fail_times` fetches with HTTP-500-shaped transient
/// errors, then serves `snapshot`. Counts every fetch.
pub struct FlakySnapshotSource {
    snapshot: AccountSnapshot,
    fail_times: u32,
    calls: AtomicU32,
}

impl FlakySnapshotSource {
    pub fn new(snapshot: AccountSnapshot, fail_times: u32) -> Self {
        Self {
            snapshot,
            fail_times,
            calls: AtomicU32::new(0),
        }
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SnapshotSource for FlakySnapshotSource {
    async fn fetch(
        &self,
        _account_id: i64,
        _business_date: NaiveDate,
    ) -> Result<AccountSnapshot, LoaderError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        if n < self.fail_times {
            Err(LoaderError::UpstreamStatus {
                status: 500,
                body: "upstream unavailable".into(),
            })
        } else {
            Ok(self.snapshot.clone())
        }
    }
}

/// Serves scripted snapshots in order; repeats the last one when the script
/// runs out. Lets a test rerun "the same day" with identical or changed
/// content.
pub struct ScriptedSnapshotSource {
    script: Mutex<Vec<AccountSnapshot>>,
}

impl ScriptedSnapshotSource {
    pub fn new(script: Vec<AccountSnapshot>) -> Self {
        assert!(!script.is_empty(), "script needs at least one snapshot");
        let mut script = script;
        script.reverse(); // pop from the back
        Self {
            script: Mutex::new(script),
        }
    }
}

#[async_trait]
impl SnapshotSource for ScriptedSnapshotSource {
    async fn fetch(
        &self,
        _account_id: i64,
        _business_date: NaiveDate,
    ) -> Result<AccountSnapshot, LoaderError> {
        let mut script = self.script.lock().expect("script mutex");
        if script.len() > 1 {
            Ok(script.pop().expect("non-empty script"))
        } else {
            Ok(script.last().expect("non-empty script").clone())
        }
    }
}

// ---------------------------------------------------------------------------
// In-memory idempotency gate
// ---------------------------------------------------------------------------

/// Pure mirror of `insert_transaction_deduped` / `hash_seen_since`:
/// first call for a key returns true, every later call false.
#[derive(Default)]
pub struct IdempotencyGate {
    seen: HashSet<String>,
}

impl IdempotencyGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn admit(&mut self, key: &str) -> bool {
        self.seen.insert(key.to_string())
    }
}
