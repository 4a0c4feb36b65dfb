//! plk-daemon entry point.
//!
//! This file is intentionally thin: it sets up tracing, loads config,
//! connects the pool, wires the pipelines and consumers, and starts the
//! HTTP server. All route handlers live in `routes.rs`; all shared state
//! types live in `state.rs`.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::Context;
use axum::http::{HeaderValue, Method};
use plk_daemon::{replay::PipelineReplayHandler, routes, state};
use plk_fabric::{DistributedLock, DlqReplayer, DlqWriter, DrainState, MessageBus};
use tower_http::{
    cors::CorsLayer,
    trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer},
};
use tracing::{info, warn, Level};

/// Bound on the shutdown drain wait.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

const REPLAY_INTERVAL: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env.local if present (dev convenience). Silent if the file does
    // not exist — production injects env vars directly.
    let _ = dotenvy::from_filename(".env.local");

    init_tracing();
    state::uptime_secs(); // pin the boot instant

    let (config, layered) = load_config()?;
    info!(config_hash = %layered.hash, "configuration loaded");
    let config = Arc::new(config);

    // Pool sized for parallel EOD + intraday + replayer + admin.
    let pool_size = (config.processing_threads * 2 + 2) as u32;
    let pool = plk_db::connect_from_env(pool_size).await?;
    plk_db::migrate(&pool).await?;

    // Startup recovery: RUNNING rows older than the lock lease belong to a
    // crashed process.
    let cutoff = chrono::Utc::now()
        - chrono::Duration::from_std(plk_fabric::lock::DEFAULT_LEASE)
            .unwrap_or_else(|_| chrono::Duration::zero());
    let recovered = plk_db::fail_stale_running(&pool, cutoff).await?;
    if recovered > 0 {
        warn!(recovered, "marked stale RUNNING eod runs as FAILED at startup");
    }

    // Fabric.
    let drain = DrainState::new();
    let bus = MessageBus::new();
    let locks = DistributedLock::new(pool.clone());
    let dlq = DlqWriter::new(
        pool.clone(),
        Duration::from_secs(config.dlq.initial_backoff_secs),
    );

    // Pipelines.
    let store = plk_store::PositionStore::new(pool.clone());
    let source = Arc::new(plk_eod::HttpSnapshotSource::new(&config.upstream)?);
    let eod = Arc::new(plk_eod::EodPipeline::new(
        store.clone(),
        source,
        locks.clone(),
        bus.clone(),
        drain.clone(),
        Arc::clone(&config),
    ));
    let intraday = Arc::new(plk_intraday::IntradayPipeline::new(
        store.clone(),
        locks.clone(),
        bus.clone(),
        drain.clone(),
        Arc::clone(&config),
    ));

    // Consumers.
    tokio::spawn(plk_eod::run_eod_consumer(
        Arc::clone(&eod),
        bus.clone(),
        dlq.clone(),
        drain.clone(),
        config.processing_threads,
    ));
    {
        let intraday = Arc::clone(&intraday);
        let bus = bus.clone();
        let dlq = dlq.clone();
        let drain = drain.clone();
        tokio::spawn(async move {
            plk_intraday::run_intraday_consumer(intraday, bus, dlq, drain).await;
        });
    }

    // Leader-elected DLQ replayer.
    let replayer = DlqReplayer::new(
        pool.clone(),
        locks.clone(),
        Arc::new(PipelineReplayHandler {
            eod: Arc::clone(&eod),
            intraday: Arc::clone(&intraday),
            bus: bus.clone(),
        }),
        config.dlq.max_retries as i32,
        Duration::from_secs(config.dlq.initial_backoff_secs),
        Duration::from_secs(u64::from(config.dlq.retention_days) * 24 * 3600),
    );
    {
        let drain = drain.clone();
        tokio::spawn(async move {
            replayer.run_loop(REPLAY_INTERVAL, drain).await;
        });
    }

    let shared = Arc::new(state::AppState::new(
        pool,
        Arc::clone(&config),
        store,
        eod,
        intraday,
        bus,
        dlq,
        drain.clone(),
        locks,
    ));

    state::spawn_heartbeat(shared.sse.clone(), Duration::from_secs(1));

    let app = routes::build_router(Arc::clone(&shared))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        .layer(cors_localhost_only());

    let addr = bind_addr_from_env().unwrap_or_else(|| SocketAddr::from(([127, 0, 0, 1], 8890)));
    info!("plk-daemon listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(drain))
        .await
        .context("server crashed")?;

    Ok(())
}

/// Signal handler: single writer of the shutdown flag. Stops admissions,
/// waits (bounded) for in-flight pipeline work, then lets the server exit.
async fn shutdown_signal(drain: DrainState) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "ctrl-c handler failed; shutting down immediately");
    }
    info!("shutdown signal received; draining in-flight work");
    drain.begin_shutdown();

    if drain.wait_for_drain(DRAIN_TIMEOUT).await {
        info!("drain complete");
    } else {
        warn!(
            in_flight = drain.in_flight(),
            "drain timeout reached; exiting with work in flight"
        );
    }
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();
}

fn load_config() -> anyhow::Result<(plk_config::LoaderConfig, plk_config::LayeredConfig)> {
    match std::env::var("PLK_CONFIG") {
        Ok(paths) => {
            let parts: Vec<&str> = paths.split(':').filter(|p| !p.is_empty()).collect();
            plk_config::load_loader_config(&parts)
        }
        Err(_) => Ok((
            plk_config::LoaderConfig::default(),
            plk_config::LayeredConfig {
                json: serde_json::json!({}),
                canonical: "{}".into(),
                hash: String::new(),
            },
        )),
    }
}

fn bind_addr_from_env() -> Option<SocketAddr> {
    std::env::var("PLK_DAEMON_ADDR").ok()?.parse().ok()
}

/// CORS: allow only localhost origins.
fn cors_localhost_only() -> CorsLayer {
    let allowed_origins = [
        "http://localhost",
        "http://127.0.0.1",
        "http://localhost:3000",
        "http://127.0.0.1:3000",
        "http://localhost:5173",
        "http://127.0.0.1:5173",
    ];

    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter_map(|o| HeaderValue::from_str(o).ok())
        .collect();

    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(tower_http::cors::Any)
}
