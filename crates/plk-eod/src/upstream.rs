//! Upstream snapshot service boundary.
//!
//! This module defines only the source trait and the HTTP implementation.
//! No staging logic, no validation, no persistence belongs here.

use async_trait::async_trait;
use chrono::NaiveDate;
use plk_config::UpstreamConfig;
use plk_schemas::{AccountSnapshot, LoaderError};

/// Where EOD snapshots come from. The production implementation is HTTP;
/// tests substitute scripted sources.
#[async_trait]
pub trait SnapshotSource: Send + Sync {
    async fn fetch(
        &self,
        account_id: i64,
        business_date: NaiveDate,
    ) -> Result<AccountSnapshot, LoaderError>;
}

/// `GET {base_url}/snapshots/{accountId}?date=YYYY-MM-DD` with bounded
/// connect/read timeouts.
pub struct HttpSnapshotSource {
    client: reqwest::Client,
    base_url: String,
}

impl HttpSnapshotSource {
    pub fn new(cfg: &UpstreamConfig) -> Result<Self, LoaderError> {
        let client = reqwest::Client::builder()
            .connect_timeout(cfg.connect_timeout())
            .timeout(cfg.read_timeout())
            .build()
            .map_err(|e| LoaderError::Upstream(format!("client build failed: {e}")))?;

        Ok(Self {
            client,
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl SnapshotSource for HttpSnapshotSource {
    async fn fetch(
        &self,
        account_id: i64,
        business_date: NaiveDate,
    ) -> Result<AccountSnapshot, LoaderError> {
        let url = format!(
            "{}/snapshots/{}?date={}",
            self.base_url,
            account_id,
            business_date.format("%Y-%m-%d")
        );

        let response = self
            .client
            .get(&url)
            .header(reqwest::header::ACCEPT, "application/json")
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() || e.is_connect() {
                    LoaderError::Upstream(format!("snapshot fetch timed out: {e}"))
                } else {
                    LoaderError::Upstream(format!("snapshot fetch failed: {e}"))
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(LoaderError::UpstreamStatus {
                status: status.as_u16(),
                body: body.chars().take(512).collect(),
            });
        }

        response
            .json::<AccountSnapshot>()
            .await
            .map_err(|e| LoaderError::Malformed(format!("snapshot body did not parse: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn cfg(base_url: &str) -> UpstreamConfig {
        UpstreamConfig {
            base_url: base_url.to_string(),
            connect_timeout_secs: 5,
            read_timeout_secs: 5,
        }
    }

    fn snapshot_body() -> serde_json::Value {
        json!({
            "account_id": 1001,
            "business_date": "2025-01-15",
            "client": { "client_id": 1, "name": "Alpha Capital", "status": "ACTIVE" },
            "fund": { "fund_id": 10, "client_id": 1, "base_currency": "USD" },
            "account": {
                "account_id": 1001, "fund_id": 10, "account_number": "ACC-1001",
                "base_currency": "USD", "status": "ACTIVE"
            },
            "products": [
                { "product_id": 2001, "ticker": "AAA", "asset_class": "EQUITY",
                  "issue_ccy": "USD", "settle_ccy": "USD" }
            ],
            "positions": [
                { "product_id": 2001, "quantity": "100", "avg_cost_price": "150.00",
                  "cost_local": "15000.00", "mv_base": "15000.00" }
            ]
        })
    }

    #[tokio::test]
    async fn fetch_parses_a_well_formed_snapshot() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/snapshots/1001"))
            .and(query_param("date", "2025-01-15"))
            .respond_with(ResponseTemplate::new(200).set_body_json(snapshot_body()))
            .mount(&server)
            .await;

        let source = HttpSnapshotSource::new(&cfg(&server.uri())).unwrap();
        let snap = source
            .fetch(1001, chrono::NaiveDate::from_ymd_opt(2025, 1, 15).unwrap())
            .await
            .unwrap();

        assert_eq!(snap.account_id, 1001);
        assert_eq!(snap.positions.len(), 1);
        assert_eq!(snap.positions[0].quantity, "100".parse().unwrap());
    }

    #[tokio::test]
    async fn server_error_maps_to_transient() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .mount(&server)
            .await;

        let source = HttpSnapshotSource::new(&cfg(&server.uri())).unwrap();
        let err = source
            .fetch(1001, chrono::NaiveDate::from_ymd_opt(2025, 1, 15).unwrap())
            .await
            .unwrap_err();

        assert!(matches!(err, LoaderError::UpstreamStatus { status: 500, .. }));
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn not_found_is_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404).set_body_string("no snapshot"))
            .mount(&server)
            .await;

        let source = HttpSnapshotSource::new(&cfg(&server.uri())).unwrap();
        let err = source
            .fetch(1001, chrono::NaiveDate::from_ymd_opt(2025, 1, 15).unwrap())
            .await
            .unwrap_err();

        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn unparseable_body_is_fatal() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("not json"))
            .mount(&server)
            .await;

        let source = HttpSnapshotSource::new(&cfg(&server.uri())).unwrap();
        let err = source
            .fetch(1001, chrono::NaiveDate::from_ymd_opt(2025, 1, 15).unwrap())
            .await
            .unwrap_err();

        assert!(matches!(err, LoaderError::Malformed(_)));
        assert!(err.kind().dlq_immediately_failed());
    }
}
