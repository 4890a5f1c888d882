use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};

use crate::broadcast::{sse_response, BroadcastService};
use crate::coordination::{CoordinationClient, SessionState};
use crate::error::Result;
use crate::events::consumer::{ConsumerMetrics, ConsumerMetricsSnapshot};
use crate::lock::{ExecutionLockService, LockMetadata};

#[derive(Clone)]
pub struct HttpState {
    pub node_id: String,
    pub broadcast: BroadcastService,
    pub locks: Arc<ExecutionLockService>,
    pub coordination: Arc<CoordinationClient>,
    pub consumer_metrics: Arc<ConsumerMetrics>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct StreamParams {
    subject_id: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct LockStatusResponse {
    task_id: String,
    locked: bool,
    holder: Option<LockMetadata>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct HealthResponse {
    status: &'static str,
    node_id: String,
    coordination: String,
    live_streams: usize,
    held_locks: usize,
    consumer: ConsumerMetricsSnapshot,
}

pub fn router(state: HttpState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/events/stream", get(stream_handler))
        .route("/api/events/stats", get(stats_handler))
        .route("/api/locks/:task_id", get(lock_status_handler))
        .route("/health", get(health_handler))
        .layer(cors)
        .with_state(state)
}

/// Bind the HTTP listener. A bind failure is a startup error.
pub async fn bind(addr: SocketAddr) -> Result<TcpListener> {
    let listener = TcpListener::bind(addr).await.map_err(|e| {
        tracing::error!(addr = %addr, error = %e, "Failed to bind HTTP server");
        e
    })?;
    Ok(listener)
}

pub async fn serve(listener: TcpListener, state: HttpState, shutdown: CancellationToken) {
    let addr = listener
        .local_addr()
        .map(|a| a.to_string())
        .unwrap_or_default();
    tracing::info!(addr = %addr, "Starting HTTP server");

    let app = router(state);
    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
    {
        tracing::error!(error = %e, "HTTP server failed");
    }
}

async fn stream_handler(
    State(state): State<HttpState>,
    Query(params): Query<StreamParams>,
) -> impl IntoResponse {
    match state.broadcast.register(params.subject_id.as_deref()) {
        Ok(live) => {
            tracing::info!(stream_id = live.id(), subject = %live.subject.label(), "Live stream opened");
            sse_response(live, state.broadcast.config()).into_response()
        }
        Err(e) => (StatusCode::SERVICE_UNAVAILABLE, e.to_string()).into_response(),
    }
}

async fn stats_handler(State(state): State<HttpState>) -> impl IntoResponse {
    Json(state.broadcast.stats())
}

async fn lock_status_handler(
    State(state): State<HttpState>,
    Path(task_id): Path<String>,
) -> impl IntoResponse {
    let locked = state.locks.is_locked(&task_id).await;
    let holder = if locked {
        state.locks.holder(&task_id).await
    } else {
        None
    };

    Json(LockStatusResponse {
        task_id,
        locked,
        holder,
    })
}

async fn health_handler(State(state): State<HttpState>) -> impl IntoResponse {
    let session = state.coordination.state();
    let healthy = session == SessionState::Connected;

    let body = HealthResponse {
        status: if healthy { "ok" } else { "degraded" },
        node_id: state.node_id.clone(),
        coordination: session.to_string(),
        live_streams: state.broadcast.connection_count(),
        held_locks: state.locks.held_locks().len(),
        consumer: state.consumer_metrics.snapshot(),
    };

    let code = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(body))
}
