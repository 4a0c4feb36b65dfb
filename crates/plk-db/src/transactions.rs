//! Intraday transaction journal.
//!
//! `insert_transaction_deduped` is the idempotency gate:
//! - First call for a given `external_ref_id` → returns Ok(true) → the
//!   bitemporal mutation proceeds in the same transaction.
//! - Any later call with the same key → returns Ok(false) → the event is a
//!   silent no-op.

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use sqlx::{PgExecutor, Row};

#[derive(Debug, Clone)]
pub struct NewTransaction {
    pub account_id: i64,
    pub product_id: i64,
    pub txn_type: String,
    pub trade_date: NaiveDate,
    pub quantity: Decimal,
    pub price: Decimal,
    pub external_ref_id: String,
}

#[derive(Debug, Clone)]
pub struct TransactionRow {
    pub txn_id: i64,
    pub account_id: i64,
    pub product_id: i64,
    pub txn_type: String,
    pub trade_date: NaiveDate,
    pub quantity: Decimal,
    pub price: Decimal,
    pub external_ref_id: String,
    pub created_at_utc: DateTime<Utc>,
}

/// Insert with dedupe on external_ref_id; Ok(true) iff a row was created.
pub async fn insert_transaction_deduped<'e>(
    ex: impl PgExecutor<'e>,
    txn: &NewTransaction,
) -> Result<bool> {
    let row: Option<(i64,)> = sqlx::query_as(
        r#"
        insert into transactions (
          account_id, product_id, txn_type, trade_date, quantity, price, external_ref_id
        ) values ($1, $2, $3, $4, $5, $6, $7)
        on conflict (external_ref_id) do nothing
        returning txn_id
        "#,
    )
    .bind(txn.account_id)
    .bind(txn.product_id)
    .bind(&txn.txn_type)
    .bind(txn.trade_date)
    .bind(txn.quantity)
    .bind(txn.price)
    .bind(&txn.external_ref_id)
    .fetch_optional(ex)
    .await
    .context("insert_transaction_deduped failed")?;

    Ok(row.is_some())
}

/// Fetch the recorded transaction for an idempotency key, if any. Used to
/// distinguish a benign replay from a conflicting one.
pub async fn fetch_transaction_by_external_ref<'e>(
    ex: impl PgExecutor<'e>,
    external_ref_id: &str,
) -> Result<Option<TransactionRow>> {
    let row = sqlx::query(
        r#"
        select txn_id, account_id, product_id, txn_type, trade_date,
               quantity, price, external_ref_id, created_at_utc
        from transactions
        where external_ref_id = $1
        "#,
    )
    .bind(external_ref_id)
    .fetch_optional(ex)
    .await
    .context("fetch_transaction_by_external_ref failed")?;

    let Some(row) = row else { return Ok(None) };

    Ok(Some(TransactionRow {
        txn_id: row.try_get("txn_id")?,
        account_id: row.try_get("account_id")?,
        product_id: row.try_get("product_id")?,
        txn_type: row.try_get("txn_type")?,
        trade_date: row.try_get("trade_date")?,
        quantity: row.try_get("quantity")?,
        price: row.try_get("price")?,
        external_ref_id: row.try_get("external_ref_id")?,
        created_at_utc: row.try_get("created_at_utc")?,
    }))
}
