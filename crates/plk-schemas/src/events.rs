//! Stream event payloads and topic names.
//!
//! Topics mirror the logical streams of the upstream deployment. In-process
//! they are carried by the fabric bus; each topic also has a dead-letter
//! partition addressed via [`Topic::dead_letter_of`].

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Logical stream topics consumed and produced by the loader.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Topic {
    EodTrigger,
    Intraday,
    PositionChangeEvents,
    ClientReportingSignoff,
}

impl Topic {
    pub fn as_str(&self) -> &'static str {
        match self {
            Topic::EodTrigger => "EOD_TRIGGER",
            Topic::Intraday => "INTRADAY",
            Topic::PositionChangeEvents => "POSITION_CHANGE_EVENTS",
            Topic::ClientReportingSignoff => "CLIENT_REPORTING_SIGNOFF",
        }
    }

    /// Dead-letter partition name for this topic.
    pub fn dead_letter_of(&self) -> String {
        format!("{}.DLT", self.as_str())
    }

    pub fn parse(s: &str) -> Option<Topic> {
        match s {
            "EOD_TRIGGER" => Some(Topic::EodTrigger),
            "INTRADAY" => Some(Topic::Intraday),
            "POSITION_CHANGE_EVENTS" => Some(Topic::PositionChangeEvents),
            "CLIENT_REPORTING_SIGNOFF" => Some(Topic::ClientReportingSignoff),
            _ => None,
        }
    }
}

/// Trade direction of an intraday event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Side {
    Buy,
    Sell,
    ShortSell,
}

impl Side {
    /// Sign applied to the event quantity: BUY adds, SELL/SHORT_SELL subtract.
    pub fn sign(&self) -> i64 {
        match self {
            Side::Buy => 1,
            Side::Sell | Side::ShortSell => -1,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "BUY",
            Side::Sell => "SELL",
            Side::ShortSell => "SHORT_SELL",
        }
    }
}

/// Payload of `EOD_TRIGGER`, keyed by account id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EodTrigger {
    pub account_id: i64,
    pub business_date: NaiveDate,
}

/// Payload of `INTRADAY`, keyed by account id.
///
/// `external_ref_id` is the idempotency key: a replay with the same value is
/// a silent no-op. Exactly one of `product_id` / `ticker` must identify the
/// product; an unknown ticker routes the event to the DLQ.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntradayEvent {
    pub correlation_id: Uuid,
    pub account_id: i64,
    pub product_id: Option<i64>,
    pub ticker: Option<String>,
    pub side: Side,
    pub quantity: Decimal,
    pub price: Decimal,
    pub external_ref_id: String,
    pub event_time: DateTime<Utc>,
}

impl IntradayEvent {
    /// Signed quantity delta this event applies to the position.
    pub fn signed_delta(&self) -> Decimal {
        self.quantity * Decimal::from(self.side.sign())
    }
}

/// Payload of `POSITION_CHANGE_EVENTS`, keyed by account id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PositionChangeEvent {
    pub account_id: i64,
    pub product_id: i64,
    pub new_quantity: Decimal,
    pub event_time: DateTime<Utc>,
}

/// Payload of `CLIENT_REPORTING_SIGNOFF`, keyed by client id.
///
/// Emitted when the last outstanding account of a client completes EOD for
/// the business date.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientSignoffEvent {
    pub client_id: i64,
    pub business_date: NaiveDate,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topic_names_roundtrip() {
        for t in [
            Topic::EodTrigger,
            Topic::Intraday,
            Topic::PositionChangeEvents,
            Topic::ClientReportingSignoff,
        ] {
            assert_eq!(Topic::parse(t.as_str()), Some(t));
        }
        assert_eq!(Topic::parse("NOT_A_TOPIC"), None);
    }

    #[test]
    fn dead_letter_suffix() {
        assert_eq!(Topic::Intraday.dead_letter_of(), "INTRADAY.DLT");
    }

    #[test]
    fn side_serializes_screaming_snake() {
        assert_eq!(
            serde_json::to_string(&Side::ShortSell).unwrap(),
            "\"SHORT_SELL\""
        );
        let s: Side = serde_json::from_str("\"SELL\"").unwrap();
        assert_eq!(s, Side::Sell);
    }

    #[test]
    fn signed_delta_follows_side() {
        let mut ev = IntradayEvent {
            correlation_id: Uuid::new_v4(),
            account_id: 1001,
            product_id: Some(2001),
            ticker: None,
            side: Side::Buy,
            quantity: "10".parse().unwrap(),
            price: "160.00".parse().unwrap(),
            external_ref_id: "E1".into(),
            event_time: Utc::now(),
        };
        assert_eq!(ev.signed_delta(), "10".parse::<Decimal>().unwrap());
        ev.side = Side::Sell;
        assert_eq!(ev.signed_delta(), "-10".parse::<Decimal>().unwrap());
        ev.side = Side::ShortSell;
        assert_eq!(ev.signed_delta(), "-10".parse::<Decimal>().unwrap());
    }
}
