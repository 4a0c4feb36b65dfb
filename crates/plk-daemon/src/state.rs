//! Shared runtime state for plk-daemon.
//!
//! All types here are `Clone`-able (via `Arc` or copy). Handlers receive
//! `State<Arc<AppState>>` from Axum; this module owns nothing async itself.

use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use plk_config::LoaderConfig;
use plk_eod::EodPipeline;
use plk_fabric::{DistributedLock, DlqWriter, DrainState, MessageBus};
use plk_intraday::IntradayPipeline;
use plk_store::PositionStore;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use tokio::sync::broadcast;

// ---------------------------------------------------------------------------
// BusMsg — SSE event bus payload
// ---------------------------------------------------------------------------

/// Messages broadcast over the internal event bus and surfaced as SSE events.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BusMsg {
    Heartbeat { ts_millis: i64 },
    LogLine { level: String, msg: String },
}

// ---------------------------------------------------------------------------
// BuildInfo
// ---------------------------------------------------------------------------

/// Static build metadata included in health / status responses.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BuildInfo {
    pub service: &'static str,
    pub version: &'static str,
}

impl Default for BuildInfo {
    fn default() -> Self {
        Self {
            service: "plk-daemon",
            version: env!("CARGO_PKG_VERSION"),
        }
    }
}

// ---------------------------------------------------------------------------
// AppState
// ---------------------------------------------------------------------------

/// Cloneable (Arc) handle shared across all Axum handlers.
#[derive(Clone)]
pub struct AppState {
    /// Broadcast bus for SSE.
    pub sse: broadcast::Sender<BusMsg>,
    pub build: BuildInfo,
    pub pool: PgPool,
    pub config: Arc<LoaderConfig>,
    pub store: PositionStore,
    pub eod: Arc<EodPipeline>,
    pub intraday: Arc<IntradayPipeline>,
    pub bus: MessageBus,
    pub dlq: DlqWriter,
    pub drain: DrainState,
    pub locks: DistributedLock,
}

impl AppState {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        pool: PgPool,
        config: Arc<LoaderConfig>,
        store: PositionStore,
        eod: Arc<EodPipeline>,
        intraday: Arc<IntradayPipeline>,
        bus: MessageBus,
        dlq: DlqWriter,
        drain: DrainState,
        locks: DistributedLock,
    ) -> Self {
        let (sse, _rx) = broadcast::channel::<BusMsg>(1024);
        Self {
            sse,
            build: BuildInfo::default(),
            pool,
            config,
            store,
            eod,
            intraday,
            bus,
            dlq,
            drain,
            locks,
        }
    }
}

// ---------------------------------------------------------------------------
// Uptime + heartbeat
// ---------------------------------------------------------------------------

static STARTED_AT: OnceLock<Instant> = OnceLock::new();

/// Seconds since the first call (made at daemon boot).
pub fn uptime_secs() -> u64 {
    STARTED_AT.get_or_init(Instant::now).elapsed().as_secs()
}

/// Periodic heartbeat onto the SSE bus so clients can detect a hung daemon.
pub fn spawn_heartbeat(sse: broadcast::Sender<BusMsg>, every: Duration) {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(every);
        loop {
            tick.tick().await;
            let _ = sse.send(BusMsg::Heartbeat {
                ts_millis: chrono::Utc::now().timestamp_millis(),
            });
        }
    });
}
