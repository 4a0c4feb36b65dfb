//! Operational alerts raised by the pipelines and the DLQ replayer.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{PgExecutor, Row};

#[derive(Debug, Clone)]
pub struct AlertRow {
    pub alert_id: i64,
    pub source: String,
    pub code: String,
    pub message: String,
    pub details: Option<Value>,
    pub created_at_utc: DateTime<Utc>,
}

pub async fn raise_alert<'e>(
    ex: impl PgExecutor<'e>,
    source: &str,
    code: &str,
    message: &str,
    details: Option<Value>,
) -> Result<i64> {
    let row = sqlx::query(
        r#"
        insert into alerts (source, code, message, details)
        values ($1, $2, $3, $4)
        returning alert_id
        "#,
    )
    .bind(source)
    .bind(code)
    .bind(message)
    .bind(details)
    .fetch_one(ex)
    .await
    .context("raise_alert failed")?;

    Ok(row.try_get("alert_id")?)
}

pub async fn recent_alerts<'e>(ex: impl PgExecutor<'e>, limit: i64) -> Result<Vec<AlertRow>> {
    let rows = sqlx::query(
        r#"
        select alert_id, source, code, message, details, created_at_utc
        from alerts
        order by alert_id desc
        limit $1
        "#,
    )
    .bind(limit)
    .fetch_all(ex)
    .await
    .context("recent_alerts failed")?;

    rows.iter()
        .map(|row| {
            Ok(AlertRow {
                alert_id: row.try_get("alert_id")?,
                source: row.try_get("source")?,
                code: row.try_get("code")?,
                message: row.try_get("message")?,
                details: row.try_get("details")?,
                created_at_utc: row.try_get("created_at_utc")?,
            })
        })
        .collect()
}
