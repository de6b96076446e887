//! HTTP server for worker observability.
//!
//! - Health check (`/health`)
//! - Prometheus metrics (`/metrics`)

use std::net::SocketAddr;

use axum::{extract::State, http::header, response::IntoResponse, routing::get, Json, Router};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::metrics::render_prometheus;
use crate::pool::MetricsSource;

/// Create the HTTP router.
pub fn create_router(source: MetricsSource) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(metrics_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(source)
}

/// Serve the router on `listener` until `shutdown` is cancelled.
pub async fn serve(
    listener: TcpListener,
    source: MetricsSource,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    let addr: Option<SocketAddr> = listener.local_addr().ok();
    info!(addr = ?addr, "Metrics server listening");
    axum::serve(listener, create_router(source))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}

async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn metrics_handler(State(source): State<MetricsSource>) -> impl IntoResponse {
    let body = render_prometheus(&source.snapshot());
    ([(header::CONTENT_TYPE, "text/plain; version=0.0.4")], body)
}
