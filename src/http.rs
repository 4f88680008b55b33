//! HTTP surface: Prometheus metrics and a liveness probe.
//!
//! `GET /metrics` renders the installed Prometheus recorder; `GET /__health`
//! answers 200 once collection is running and 503 before startup and after
//! shutdown has begun.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use metrics_exporter_prometheus::PrometheusHandle;
use tokio_util::sync::CancellationToken;

#[derive(Clone)]
pub struct AppState {
    pub metrics: Option<PrometheusHandle>,
    pub collecting: Arc<AtomicBool>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/__health", get(health_handler))
        .with_state(state)
}

async fn metrics_handler(State(state): State<AppState>) -> String {
    match &state.metrics {
        Some(handle) => handle.render(),
        None => String::new(),
    }
}

async fn health_handler(State(state): State<AppState>) -> (StatusCode, &'static str) {
    if state.collecting.load(Ordering::SeqCst) {
        (StatusCode::OK, "OK\n")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "Not OK\n")
    }
}

/// Serves until the token is cancelled; the caller bounds the graceful
/// drain with its own timeout.
pub async fn serve(
    addr: SocketAddr,
    state: AppState,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(collecting: bool) -> AppState {
        AppState {
            metrics: None,
            collecting: Arc::new(AtomicBool::new(collecting)),
        }
    }

    #[tokio::test]
    async fn health_reflects_collection_state() {
        let app_state = state(false);
        let (status, _) = health_handler(State(app_state.clone())).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

        app_state.collecting.store(true, Ordering::SeqCst);
        let (status, body) = health_handler(State(app_state.clone())).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "OK\n");

        app_state.collecting.store(false, Ordering::SeqCst);
        let (status, _) = health_handler(State(app_state)).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn metrics_without_recorder_is_empty() {
        let body = metrics_handler(State(state(true))).await;
        assert!(body.is_empty());
    }
}
