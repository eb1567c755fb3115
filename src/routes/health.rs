//! Liveness and metrics endpoints.

use axum::{Json, extract::State, response::IntoResponse};

use crate::AppState;

/// `GET /health`: liveness plus a few cheap gauges.
pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "cache_entries": state.store.len(),
        "in_flight": state.coalescer.in_flight(),
        "telemetry_dropped": state.telemetry.dropped_count(),
    }))
}

/// `GET /metrics`: Prometheus exposition.
#[cfg(feature = "prometheus")]
pub async fn prometheus_metrics() -> impl IntoResponse {
    crate::observability::metrics::render_prometheus().unwrap_or_default()
}
