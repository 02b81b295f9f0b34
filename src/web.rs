use axum::{
    body::Body,
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use futures_util::StreamExt;
use serde::Serialize;
use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::slot::LatestFrameSlot;
use crate::stream::{StreamBroadcaster, MJPEG_CONTENT_TYPE};
use crate::supervisor::{StatsSnapshot, SupervisorStats};

/// Web server state
#[derive(Clone)]
pub struct AppState {
    slot: Arc<LatestFrameSlot>,
    broadcaster: Arc<StreamBroadcaster>,
    stats: Arc<SupervisorStats>,
    started_at: Instant,
}

impl AppState {
    pub fn new(
        slot: Arc<LatestFrameSlot>,
        broadcaster: Arc<StreamBroadcaster>,
        stats: Arc<SupervisorStats>,
    ) -> Self {
        Self {
            slot,
            broadcaster,
            stats,
            started_at: Instant::now(),
        }
    }
}

/// `/api/status` payload
#[derive(Debug, Serialize)]
pub struct StatusResponse {
    #[serde(flatten)]
    pub stats: StatsSnapshot,
    pub failure_rate: f64,
    /// Latest published frame number, 0 before the first frame
    pub sequence: u64,
    pub last_frame_age_ms: Option<u64>,
    pub viewers: usize,
    pub uptime_seconds: u64,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(stream_handler))
        .route("/health", get(health_handler))
        .route("/api/status", get(status_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Binds `addr` and serves until `shutdown` resolves.
pub async fn run_server<F>(addr: SocketAddr, state: AppState, shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind(addr).await?;
    serve(listener, state, shutdown).await
}

/// Serves on an already bound listener.
pub async fn serve<F>(listener: TcpListener, state: AppState, shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    info!("Starting web server on http://{}", listener.local_addr()?);

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await?;

    info!("Web server stopped");
    Ok(())
}

/// MJPEG stream handler
async fn stream_handler(State(state): State<AppState>) -> Response {
    let Some(session) = state.broadcaster.session() else {
        warn!(
            viewers = state.broadcaster.viewer_count(),
            "Viewer limit reached, rejecting stream request"
        );
        return (StatusCode::SERVICE_UNAVAILABLE, "viewer limit reached").into_response();
    };

    // One chunk of buffering: the session never runs ahead of the socket
    let (tx, rx) = mpsc::channel(1);
    tokio::spawn(session.run(tx));

    let body = Body::from_stream(ReceiverStream::new(rx).map(Ok::<_, Infallible>));

    (
        [
            (header::CONTENT_TYPE, MJPEG_CONTENT_TYPE),
            (header::CACHE_CONTROL, "no-cache, no-store, must-revalidate"),
            (header::PRAGMA, "no-cache"),
        ],
        body,
    )
        .into_response()
}

/// Liveness of the HTTP process only; camera trouble never shows up here.
async fn health_handler() -> &'static str {
    "ok"
}

async fn status_handler(State(state): State<AppState>) -> Json<StatusResponse> {
    let stats = state.stats.snapshot();
    let failure_rate = stats.failure_rate();
    let last_frame_age_ms = state
        .slot
        .published_at()
        .map(|at| at.elapsed().as_millis() as u64);

    Json(StatusResponse {
        stats,
        failure_rate,
        sequence: state.slot.sequence(),
        last_frame_age_ms,
        viewers: state.broadcaster.viewer_count(),
        uptime_seconds: state.started_at.elapsed().as_secs(),
    })
}
