//! Reference-data and snapshot DTOs.
//!
//! Quantities and monetary values are `rust_decimal::Decimal` end to end;
//! binary floats never appear in the data path. The upstream snapshot JSON
//! deserializes directly into [`AccountSnapshot`].

use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// A client as carried inside an upstream snapshot.
///
/// `client_id` is immutable once seen; reconciliation never rewrites it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientRef {
    pub client_id: i64,
    pub name: String,
    pub status: String,
}

/// A fund, owned by exactly one client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FundRef {
    pub fund_id: i64,
    pub client_id: i64,
    /// ISO-4217, three letters.
    pub base_currency: String,
}

/// A custody/margin account belonging to a fund.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountRef {
    pub account_id: i64,
    pub fund_id: i64,
    pub account_number: String,
    pub base_currency: String,
    pub status: String,
}

/// A tradable product referenced by snapshot or intraday rows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductRef {
    pub product_id: i64,
    pub ticker: String,
    pub asset_class: String,
    pub issue_ccy: String,
    pub settle_ccy: String,
}

/// One position line inside an upstream snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotPosition {
    pub product_id: i64,
    pub quantity: Decimal,
    pub avg_cost_price: Decimal,
    pub cost_local: Decimal,
    pub mv_base: Decimal,
}

/// A complete end-of-day snapshot for one account, as returned by
/// `GET /snapshots/{accountId}?date=YYYY-MM-DD`.
///
/// Reference data rides along so the loader can reconcile clients, funds,
/// accounts, and products before staging positions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountSnapshot {
    pub account_id: i64,
    pub business_date: NaiveDate,
    pub client: ClientRef,
    pub fund: FundRef,
    pub account: AccountRef,
    pub products: Vec<ProductRef>,
    pub positions: Vec<SnapshotPosition>,
}

impl AccountSnapshot {
    /// Total signed quantity across all positions.
    pub fn total_quantity(&self) -> Decimal {
        self.positions.iter().map(|p| p.quantity).sum()
    }

    /// Total market value in account base currency.
    pub fn total_market_value(&self) -> Decimal {
        self.positions.iter().map(|p| p.mv_base).sum()
    }
}
