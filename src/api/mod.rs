//! Minimal HTTP surface: health check and a synchronous metrics read.
//!
//! The compliance CRUD endpoints live in other services; this gateway
//! exposes only what the real-time layer needs.

use axum::Router;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Json;
use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::app_state::AppState;

/// Health check response.
#[derive(Debug, Serialize)]
struct HealthResponse {
    status: String,
    timestamp: String,
    version: String,
    connections: usize,
}

/// `GET /health` — Service health status.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(HealthResponse {
            status: "healthy".to_string(),
            timestamp: Utc::now().to_rfc3339(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            connections: state.registry.connection_count(),
        }),
    )
}

/// Query parameters for the metrics read.
#[derive(Debug, Deserialize)]
struct MetricsQuery {
    /// Force a recomputation even when the cache is fresh.
    #[serde(default)]
    refresh: bool,
}

/// `GET /metrics/dashboard` — Current dashboard metrics snapshot.
async fn metrics_handler(
    State(state): State<AppState>,
    Query(query): Query<MetricsQuery>,
) -> impl IntoResponse {
    match state.metrics.get_metrics(query.refresh).await {
        Ok(snapshot) => (StatusCode::OK, Json(snapshot)).into_response(),
        Err(err) => {
            tracing::warn!(error = %err, "metrics read failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({
                    "error": { "message": "metrics unavailable" }
                })),
            )
                .into_response()
        }
    }
}

/// Routes mounted at the root level.
pub fn build_router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics/dashboard", get(metrics_handler))
}
