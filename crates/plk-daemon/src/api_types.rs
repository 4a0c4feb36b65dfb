//! Request/response DTOs for the admin surface.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub ok: bool,
    pub service: &'static str,
    pub version: &'static str,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub daemon_uptime_secs: u64,
    pub shutting_down: bool,
    pub in_flight: i64,
    pub dlq_pending: i64,
    pub eod_enabled: bool,
    pub intraday_enabled: bool,
}

#[derive(Debug, Deserialize)]
pub struct EodRunRequest {
    pub account_id: i64,
    pub business_date: NaiveDate,
}

#[derive(Debug, Serialize)]
pub struct EodRunResponse {
    pub outcome: String,
    pub batch_id: Option<i64>,
    pub position_count: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct RollbackRequest {
    pub account_id: i64,
    pub business_date: NaiveDate,
}

#[derive(Debug, Serialize)]
pub struct RollbackResponse {
    pub rolled_back: bool,
}

#[derive(Debug, Serialize)]
pub struct EodStatusResponse {
    pub account_id: i64,
    pub business_date: NaiveDate,
    pub attempt: i32,
    pub status: String,
    pub batch_id: Option<i64>,
    pub position_count: Option<i32>,
    pub error_message: Option<String>,
    pub started_at_utc: DateTime<Utc>,
    pub completed_at_utc: Option<DateTime<Utc>>,
}

impl From<plk_db::EodRunRow> for EodStatusResponse {
    fn from(r: plk_db::EodRunRow) -> Self {
        Self {
            account_id: r.account_id,
            business_date: r.business_date,
            attempt: r.attempt,
            status: r.status.as_str().to_string(),
            batch_id: r.batch_id,
            position_count: r.position_count,
            error_message: r.error_message,
            started_at_utc: r.started_at_utc,
            completed_at_utc: r.completed_at_utc,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct DlqEntryResponse {
    pub dlq_id: i64,
    pub topic: String,
    pub msg_key: String,
    pub error_code: Option<String>,
    pub error_message: String,
    pub retry_count: i32,
    pub status: String,
    pub next_retry_at_utc: Option<DateTime<Utc>>,
}

impl From<plk_db::DlqRow> for DlqEntryResponse {
    fn from(r: plk_db::DlqRow) -> Self {
        Self {
            dlq_id: r.dlq_id,
            topic: r.topic,
            msg_key: r.msg_key,
            error_code: r.error_code,
            error_message: r.error_message,
            retry_count: r.retry_count,
            status: r.status.as_str().to_string(),
            next_retry_at_utc: r.next_retry_at_utc,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}
