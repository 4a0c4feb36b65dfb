//! Reliability fabric: the cross-cutting machinery both pipelines lean on.
//!
//! - [`lock`] — named distributed locks with bounded leases over Postgres
//! - [`breaker`] — per-dependency circuit breakers (sliding failure window)
//! - [`retry`] — bounded in-pipeline retry with exponential backoff
//! - [`dlq`] — dead-letter parking and the leader-elected replayer
//! - [`drain`] — the process-wide graceful-shutdown flag and in-flight gauge
//! - [`bus`] — the in-process topic bus standing in for the message broker

pub mod breaker;
pub mod bus;
pub mod dlq;
pub mod drain;
pub mod lock;
pub mod retry;

pub use breaker::{BreakerState, CircuitBreaker};
pub use bus::{BusMessage, MessageBus, TopicReceiver};
pub use dlq::{backoff_schedule, DlqReplayer, DlqWriter};
pub use drain::{DrainGuard, DrainState};
pub use lock::{DistributedLock, LockGuard};
pub use retry::{retry_with_backoff, RetrySchedule};
