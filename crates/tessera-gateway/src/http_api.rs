//! HTTP endpoints for health checks and Prometheus scraping

use crate::cursors::CursorEngine;
use crate::metrics;
use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// State shared across HTTP handlers
#[derive(Clone)]
pub struct AppState {
    pub cursors: Arc<CursorEngine>,
    /// Set once the TCP listener is accepting
    pub ready: Arc<AtomicBool>,
}

/// Readiness payload
#[derive(Debug, Serialize)]
pub struct ReadyResponse {
    pub ready: bool,
    pub open_cursors: usize,
    pub cursor_rows_served: u64,
}

/// Build the router serving `/health`, `/ready` and `/metrics`
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ready", get(ready))
        .route("/metrics", get(prometheus_metrics))
        .with_state(state)
}

/// Health check endpoint
pub async fn health() -> &'static str {
    "OK"
}

/// Ready check endpoint
pub async fn ready(State(state): State<AppState>) -> impl IntoResponse {
    let stats = state.cursors.stats();
    let ready = state.ready.load(Ordering::Acquire);
    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        status,
        Json(ReadyResponse {
            ready,
            open_cursors: stats.open_cursors,
            cursor_rows_served: stats.total_rows_served,
        }),
    )
}

/// Prometheus metrics endpoint
pub async fn prometheus_metrics() -> impl IntoResponse {
    let body = metrics::encode_metrics();
    (
        StatusCode::OK,
        [("content-type", "text/plain; charset=utf-8")],
        body,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cursors::CursorConfig;
    use crate::engine::SqliteEngine;
    use std::time::Duration;

    fn state(ready: bool) -> AppState {
        let engine = Arc::new(SqliteEngine::new(Duration::from_millis(100)));
        AppState {
            cursors: Arc::new(CursorEngine::new(engine, CursorConfig::default())),
            ready: Arc::new(AtomicBool::new(ready)),
        }
    }

    #[tokio::test]
    async fn test_health() {
        assert_eq!(health().await, "OK");
    }

    #[tokio::test]
    async fn test_ready_follows_flag() {
        let response = ready(State(state(false))).await.into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        let response = ready(State(state(true))).await.into_response();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_metrics_exposes_gateway_families() {
        metrics::init_metrics();
        metrics::SESSIONS_TOTAL.inc();
        let body = metrics::encode_metrics();
        assert!(body.contains("tessera_sessions_total"));

        let response = prometheus_metrics().await.into_response();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
