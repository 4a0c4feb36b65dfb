//! In-process topic bus.
//!
//! Stands in for the message broker: producers publish keyed JSON records to
//! named topics, consumers subscribe and drain. Delivery is fan-out — every
//! subscriber of a topic receives every record published after it attached.
//! Publishing to a topic with no subscribers is not an error; the record is
//! dropped (matching a broker with no consumer group attached).

use plk_schemas::Topic;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

/// One keyed record on a topic.
#[derive(Debug, Clone)]
pub struct BusMessage {
    pub topic: String,
    pub key: String,
    pub payload: Value,
}

/// Consumer handle for one subscription.
pub struct TopicReceiver {
    rx: mpsc::UnboundedReceiver<BusMessage>,
}

impl TopicReceiver {
    /// Await the next record; `None` when the bus side has gone away.
    pub async fn recv(&mut self) -> Option<BusMessage> {
        self.rx.recv().await
    }

    /// Drain up to `cap` records, waiting for at least one.
    pub async fn recv_batch(&mut self, cap: usize) -> Vec<BusMessage> {
        let mut batch = Vec::with_capacity(cap.min(64));
        let received = self.rx.recv_many(&mut batch, cap.max(1)).await;
        debug_assert_eq!(received, batch.len());
        batch
    }

    /// Non-blocking drain of whatever is queued, up to `cap`.
    pub fn try_recv_up_to(&mut self, cap: usize) -> Vec<BusMessage> {
        let mut batch = Vec::new();
        while batch.len() < cap {
            match self.rx.try_recv() {
                Ok(msg) => batch.push(msg),
                Err(_) => break,
            }
        }
        batch
    }
}

/// Cheap-to-clone bus handle; clones share the topic registry.
#[derive(Clone, Default)]
pub struct MessageBus {
    topics: Arc<Mutex<HashMap<String, Vec<mpsc::UnboundedSender<BusMessage>>>>>,
}

impl MessageBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a consumer to `topic`.
    pub fn subscribe(&self, topic: &str) -> TopicReceiver {
        let (tx, rx) = mpsc::unbounded_channel();
        self.topics
            .lock()
            .expect("bus registry poisoned")
            .entry(topic.to_string())
            .or_default()
            .push(tx);
        TopicReceiver { rx }
    }

    /// Publish a raw record. Closed subscribers are pruned on the way.
    pub fn publish(&self, topic: &str, key: impl Into<String>, payload: Value) {
        let key = key.into();
        let mut topics = self.topics.lock().expect("bus registry poisoned");
        let Some(senders) = topics.get_mut(topic) else {
            tracing::debug!(topic, "publish with no subscribers; record dropped");
            return;
        };
        senders.retain(|tx| {
            tx.send(BusMessage {
                topic: topic.to_string(),
                key: key.clone(),
                payload: payload.clone(),
            })
            .is_ok()
        });
    }

    /// Publish a typed payload to a well-known topic.
    pub fn publish_event<T: serde::Serialize>(&self, topic: Topic, key: impl Into<String>, event: &T) {
        match serde_json::to_value(event) {
            Ok(payload) => self.publish(topic.as_str(), key, payload),
            Err(e) => tracing::error!(topic = topic.as_str(), error = %e, "event serialization failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn records_reach_subscriber_in_order() {
        let bus = MessageBus::new();
        let mut rx = bus.subscribe("EOD_TRIGGER");

        bus.publish("EOD_TRIGGER", "1001", json!({"n": 1}));
        bus.publish("EOD_TRIGGER", "1001", json!({"n": 2}));

        assert_eq!(rx.recv().await.unwrap().payload["n"], 1);
        assert_eq!(rx.recv().await.unwrap().payload["n"], 2);
    }

    #[tokio::test]
    async fn batch_drain_respects_cap() {
        let bus = MessageBus::new();
        let mut rx = bus.subscribe("INTRADAY");

        for n in 0..10 {
            bus.publish("INTRADAY", "1001", json!({ "n": n }));
        }

        let batch = rx.recv_batch(4).await;
        assert_eq!(batch.len(), 4);
        let rest = rx.try_recv_up_to(100);
        assert_eq!(rest.len(), 6);
    }

    #[tokio::test]
    async fn fan_out_to_all_subscribers() {
        let bus = MessageBus::new();
        let mut a = bus.subscribe("POSITION_CHANGE_EVENTS");
        let mut b = bus.subscribe("POSITION_CHANGE_EVENTS");

        bus.publish("POSITION_CHANGE_EVENTS", "1001", json!({"q": 110}));

        assert_eq!(a.recv().await.unwrap().payload["q"], 110);
        assert_eq!(b.recv().await.unwrap().payload["q"], 110);
    }

    #[test]
    fn publish_without_subscribers_is_silent() {
        let bus = MessageBus::new();
        bus.publish("CLIENT_REPORTING_SIGNOFF", "1", json!({}));
    }
}
