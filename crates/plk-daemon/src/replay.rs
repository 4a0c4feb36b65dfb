//! DLQ redrive wiring.
//!
//! Replaying a parked message means handing it back to the pipeline that
//! owns the topic — the same code path the stream consumer runs, so all
//! idempotency and locking rules apply unchanged. Produced-stream topics
//! (sign-off, position changes) are republished onto the bus verbatim.

use async_trait::async_trait;
use plk_eod::EodPipeline;
use plk_fabric::dlq::DlqReplayHandler;
use plk_fabric::MessageBus;
use plk_intraday::IntradayPipeline;
use plk_schemas::{EodTrigger, IntradayEvent, LoaderError, Topic};
use serde_json::Value;
use std::sync::Arc;

pub struct PipelineReplayHandler {
    pub eod: Arc<EodPipeline>,
    pub intraday: Arc<IntradayPipeline>,
    pub bus: MessageBus,
}

#[async_trait]
impl DlqReplayHandler for PipelineReplayHandler {
    async fn handle(&self, topic: &str, key: &str, payload: &Value) -> Result<(), LoaderError> {
        match Topic::parse(topic) {
            Some(Topic::EodTrigger) => {
                let trigger: EodTrigger = serde_json::from_value(payload.clone())
                    .map_err(|e| LoaderError::Malformed(format!("replayed trigger: {e}")))?;
                self.eod.run(&trigger).await.map(|_| ())
            }
            Some(Topic::Intraday) => {
                let event: IntradayEvent = serde_json::from_value(payload.clone())
                    .map_err(|e| LoaderError::Malformed(format!("replayed event: {e}")))?;
                self.intraday.apply_event(&event).await.map(|_| ())
            }
            Some(other) => {
                // Produced streams: put the record back on the wire.
                self.bus.publish(other.as_str(), key, payload.clone());
                Ok(())
            }
            None => Err(LoaderError::Malformed(format!(
                "DLQ entry names unknown topic {topic}"
            ))),
        }
    }
}
