//! Axum router and all HTTP handlers for plk-daemon.
//!
//! `build_router` is the single entry point; `main.rs` calls it and attaches
//! middleware layers. All handlers are `pub(crate)` so scenario tests can
//! compose the router directly.

use std::{convert::Infallible, sync::Arc};

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use chrono::NaiveDate;
use futures_util::{Stream, StreamExt};
use plk_schemas::{DlqStatus, EodTrigger, LoaderError};
use serde::Deserialize;
use tokio_stream::wrappers::BroadcastStream;

use crate::api_types::{
    DlqEntryResponse, EodRunRequest, EodRunResponse, EodStatusResponse, ErrorResponse,
    HealthResponse, RollbackRequest, RollbackResponse, StatusResponse,
};
use crate::state::{uptime_secs, AppState, BusMsg};

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Build the complete application router wired to the given shared state.
///
/// Middleware layers (CORS, tracing) are **not** applied here; `main.rs`
/// attaches them after this call so tests can use the bare router.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/status", get(status_handler))
        .route("/v1/stream", get(stream))
        .route("/v1/eod/run", post(eod_run))
        .route("/v1/eod/status/:account_id", get(eod_status))
        .route("/v1/eod/history/:account_id", get(eod_history))
        .route("/v1/batches/rollback", post(batch_rollback))
        .route("/v1/dlq", get(dlq_list))
        .route("/v1/dlq/:dlq_id/requeue", post(dlq_requeue))
        .with_state(state)
}

fn loader_error_response(err: &LoaderError) -> Response {
    let status = match err.kind() {
        plk_schemas::ErrorKind::Capacity => StatusCode::SERVICE_UNAVAILABLE,
        plk_schemas::ErrorKind::Transient => StatusCode::CONFLICT,
        _ => StatusCode::UNPROCESSABLE_ENTITY,
    };
    (
        status,
        Json(ErrorResponse {
            error: err.to_string(),
            code: err.code().to_string(),
        }),
    )
        .into_response()
}

fn db_error_response(err: anyhow::Error) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ErrorResponse {
            error: err.to_string(),
            code: "DB".to_string(),
        }),
    )
        .into_response()
}

// ---------------------------------------------------------------------------
// GET /v1/health
// ---------------------------------------------------------------------------

pub(crate) async fn health(State(st): State<Arc<AppState>>) -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(HealthResponse {
            ok: true,
            service: st.build.service,
            version: st.build.version,
        }),
    )
}

// ---------------------------------------------------------------------------
// GET /v1/status
// ---------------------------------------------------------------------------

pub(crate) async fn status_handler(State(st): State<Arc<AppState>>) -> Response {
    let dlq_pending = match plk_db::count_pending(&st.pool).await {
        Ok(n) => n,
        Err(e) => return db_error_response(e),
    };

    (
        StatusCode::OK,
        Json(StatusResponse {
            daemon_uptime_secs: uptime_secs(),
            shutting_down: st.drain.is_shutting_down(),
            in_flight: st.drain.in_flight(),
            dlq_pending,
            eod_enabled: st.config.features.eod_enabled,
            intraday_enabled: st.config.features.intraday_enabled,
        }),
    )
        .into_response()
}

// ---------------------------------------------------------------------------
// GET /v1/stream — SSE
// ---------------------------------------------------------------------------

pub(crate) async fn stream(
    State(st): State<Arc<AppState>>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let rx = st.sse.subscribe();
    let stream = BroadcastStream::new(rx).filter_map(|msg| async move {
        let msg: BusMsg = msg.ok()?;
        let event = Event::default()
            .json_data(&msg)
            .unwrap_or_else(|_| Event::default().data("serialization error"));
        Some(Ok(event))
    });

    Sse::new(stream).keep_alive(KeepAlive::default())
}

// ---------------------------------------------------------------------------
// POST /v1/eod/run — admin-initiated rerun
// ---------------------------------------------------------------------------

pub(crate) async fn eod_run(
    State(st): State<Arc<AppState>>,
    Json(req): Json<EodRunRequest>,
) -> Response {
    let trigger = EodTrigger {
        account_id: req.account_id,
        business_date: req.business_date,
    };

    match st.eod.run(&trigger).await {
        Ok(plk_eod::EodOutcome::Completed {
            batch_id,
            position_count,
        }) => (
            StatusCode::OK,
            Json(EodRunResponse {
                outcome: "COMPLETED".into(),
                batch_id: Some(batch_id),
                position_count: Some(position_count),
            }),
        )
            .into_response(),
        Ok(plk_eod::EodOutcome::Noop) => (
            StatusCode::OK,
            Json(EodRunResponse {
                outcome: "COMPLETED_NOOP".into(),
                batch_id: None,
                position_count: None,
            }),
        )
            .into_response(),
        Err(e) => loader_error_response(&e),
    }
}

// ---------------------------------------------------------------------------
// GET /v1/eod/status/:account_id?date=YYYY-MM-DD
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub(crate) struct DateQuery {
    date: NaiveDate,
}

pub(crate) async fn eod_status(
    State(st): State<Arc<AppState>>,
    Path(account_id): Path<i64>,
    Query(q): Query<DateQuery>,
) -> Response {
    match plk_db::latest_run(&st.pool, account_id, q.date).await {
        Ok(Some(run)) => (StatusCode::OK, Json(EodStatusResponse::from(run))).into_response(),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(ErrorResponse {
                error: format!("no EOD run recorded for account {account_id} on {}", q.date),
                code: "NOT_FOUND".into(),
            }),
        )
            .into_response(),
        Err(e) => db_error_response(e),
    }
}

pub(crate) async fn eod_history(
    State(st): State<Arc<AppState>>,
    Path(account_id): Path<i64>,
) -> Response {
    match plk_db::run_history(&st.pool, account_id, 50).await {
        Ok(runs) => (
            StatusCode::OK,
            Json(
                runs.into_iter()
                    .map(EodStatusResponse::from)
                    .collect::<Vec<_>>(),
            ),
        )
            .into_response(),
        Err(e) => db_error_response(e),
    }
}

// ---------------------------------------------------------------------------
// POST /v1/batches/rollback
// ---------------------------------------------------------------------------

pub(crate) async fn batch_rollback(
    State(st): State<Arc<AppState>>,
    Json(req): Json<RollbackRequest>,
) -> Response {
    match st.eod.rollback(req.account_id, req.business_date).await {
        Ok(rolled_back) => (StatusCode::OK, Json(RollbackResponse { rolled_back })).into_response(),
        Err(e) => loader_error_response(&e),
    }
}

// ---------------------------------------------------------------------------
// DLQ surface
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub(crate) struct DlqListQuery {
    status: Option<String>,
}

pub(crate) async fn dlq_list(
    State(st): State<Arc<AppState>>,
    Query(q): Query<DlqListQuery>,
) -> Response {
    let status = match q.status.as_deref().map(DlqStatus::parse).transpose() {
        Ok(s) => s,
        Err(e) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(ErrorResponse {
                    error: e.to_string(),
                    code: "BAD_STATUS".into(),
                }),
            )
                .into_response()
        }
    };

    match plk_db::list_entries(&st.pool, status, 200).await {
        Ok(entries) => (
            StatusCode::OK,
            Json(
                entries
                    .into_iter()
                    .map(DlqEntryResponse::from)
                    .collect::<Vec<_>>(),
            ),
        )
            .into_response(),
        Err(e) => db_error_response(e),
    }
}

/// Put a FAILED (or manually-parked) entry back in line for the replayer.
pub(crate) async fn dlq_requeue(
    State(st): State<Arc<AppState>>,
    Path(dlq_id): Path<i64>,
) -> Response {
    match plk_db::requeue_entry(&st.pool, dlq_id).await {
        Ok(true) => StatusCode::NO_CONTENT.into_response(),
        Ok(false) => (
            StatusCode::CONFLICT,
            Json(ErrorResponse {
                error: format!("entry {dlq_id} is not eligible for replay"),
                code: "NOT_ELIGIBLE".into(),
            }),
        )
            .into_response(),
        Err(e) => db_error_response(e),
    }
}
