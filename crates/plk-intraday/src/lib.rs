//! Intraday update pipeline.
//!
//! Applies trade events to the ACTIVE batch of the affected account with
//! bitemporal correctness and exactly-once effective semantics: the
//! `external_ref_id` idempotency key makes replays silent no-ops, and the
//! group-by-account dispatcher keeps per-account event order.

pub mod dispatcher;
pub mod pipeline;

pub use dispatcher::{group_by_account, run_intraday_consumer};
pub use pipeline::{IntradayOutcome, IntradayPipeline};
