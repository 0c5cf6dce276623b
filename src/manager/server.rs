//! # HTTP Servers
//!
//! Two listeners, bound by `Manager::new` and served once the Manager starts:
//!
//! - probe address: `/healthz` (liveness) and `/readyz` (readiness)
//! - metrics address: `/metrics` in Prometheus text format
//!
//! Both stop when their cancellation token fires. The Manager fires it only
//! after every controller and informer has stopped.

use super::health::ProbeState;
use crate::observability::Metrics;
use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Router};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

pub fn probe_router(state: Arc<ProbeState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz_handler))
        .route("/readyz", get(readyz_handler))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

pub fn metrics_router(metrics: Arc<Metrics>) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .with_state(metrics)
}

/// Serve `app` on an already bound listener until `cancel` fires
pub async fn serve(
    name: &'static str,
    listener: TcpListener,
    app: Router,
    cancel: CancellationToken,
) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!(server = name, %addr, "HTTP server listening");
    }
    axum::serve(listener, app)
        .with_graceful_shutdown(cancel.cancelled_owned())
        .await
}

async fn metrics_handler(State(metrics): State<Arc<Metrics>>) -> impl IntoResponse {
    match metrics.encode() {
        Ok(text) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            text,
        ),
        Err(e) => {
            error!("Failed to encode metrics: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                [("content-type", "text/plain")],
                format!("Failed to encode metrics: {e}"),
            )
        }
    }
}

async fn healthz_handler(State(state): State<Arc<ProbeState>>) -> impl IntoResponse {
    let report = state.live();
    let status = if report.healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, report.body())
}

async fn readyz_handler(State(state): State<Arc<ProbeState>>) -> impl IntoResponse {
    let report = state.ready();
    let status = if report.healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, report.body())
}
