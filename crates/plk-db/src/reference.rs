//! Reference-data reconciliation queries.
//!
//! All upserts are insert-or-update on the primary key and never rewrite
//! immutable attributes: a fund keeps its owning client, an account keeps its
//! fund and account number. Re-running reconciliation with the same snapshot
//! is a no-op.

use anyhow::{Context, Result};
use plk_schemas::{AccountRef, ClientRef, FundRef, ProductRef};
use sqlx::PgExecutor;

pub async fn upsert_client<'e>(ex: impl PgExecutor<'e>, c: &ClientRef) -> Result<()> {
    sqlx::query(
        r#"
        insert into clients (client_id, name, status)
        values ($1, $2, $3)
        on conflict (client_id) do update
            set name           = excluded.name,
                status         = excluded.status,
                updated_at_utc = now()
        "#,
    )
    .bind(c.client_id)
    .bind(&c.name)
    .bind(&c.status)
    .execute(ex)
    .await
    .context("upsert_client failed")?;
    Ok(())
}

pub async fn upsert_fund<'e>(ex: impl PgExecutor<'e>, f: &FundRef) -> Result<()> {
    // client_id is immutable: deliberately absent from the update list.
    sqlx::query(
        r#"
        insert into funds (fund_id, client_id, base_currency)
        values ($1, $2, $3)
        on conflict (fund_id) do update
            set base_currency  = excluded.base_currency,
                updated_at_utc = now()
        "#,
    )
    .bind(f.fund_id)
    .bind(f.client_id)
    .bind(&f.base_currency)
    .execute(ex)
    .await
    .context("upsert_fund failed")?;
    Ok(())
}

pub async fn upsert_account<'e>(ex: impl PgExecutor<'e>, a: &AccountRef) -> Result<()> {
    // fund_id and account_number are immutable once present.
    sqlx::query(
        r#"
        insert into accounts (account_id, fund_id, account_number, base_currency, status)
        values ($1, $2, $3, $4, $5)
        on conflict (account_id) do update
            set base_currency  = excluded.base_currency,
                status         = excluded.status,
                updated_at_utc = now()
        "#,
    )
    .bind(a.account_id)
    .bind(a.fund_id)
    .bind(&a.account_number)
    .bind(&a.base_currency)
    .bind(&a.status)
    .execute(ex)
    .await
    .context("upsert_account failed")?;
    Ok(())
}

pub async fn upsert_product<'e>(ex: impl PgExecutor<'e>, p: &ProductRef) -> Result<()> {
    sqlx::query(
        r#"
        insert into products (product_id, ticker, asset_class, issue_ccy, settle_ccy)
        values ($1, $2, $3, $4, $5)
        on conflict (product_id) do update
            set ticker         = excluded.ticker,
                asset_class    = excluded.asset_class,
                issue_ccy      = excluded.issue_ccy,
                settle_ccy     = excluded.settle_ccy,
                updated_at_utc = now()
        "#,
    )
    .bind(p.product_id)
    .bind(&p.ticker)
    .bind(&p.asset_class)
    .bind(&p.issue_ccy)
    .bind(&p.settle_ccy)
    .execute(ex)
    .await
    .context("upsert_product failed")?;
    Ok(())
}

/// Resolve a product id from its ticker. Returns `None` for unknown tickers;
/// the intraday pipeline maps that to a DLQ entry with code UNKNOWN_TICKER.
///
/// Tickers are not unique by schema (corporate actions can briefly alias);
/// the most recently updated product wins, matching upstream behavior.
pub async fn resolve_product_by_ticker<'e>(
    ex: impl PgExecutor<'e>,
    ticker: &str,
) -> Result<Option<i64>> {
    let row: Option<(i64,)> = sqlx::query_as(
        r#"
        select product_id
        from products
        where ticker = $1
        order by updated_at_utc desc
        limit 1
        "#,
    )
    .bind(ticker)
    .fetch_optional(ex)
    .await
    .context("resolve_product_by_ticker failed")?;

    Ok(row.map(|(id,)| id))
}
