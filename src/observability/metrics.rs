//! Metric recording functions for the proxy.
//!
//! All hot-path recording goes through these helpers so metric names and
//! label sets stay consistent. Metrics cover HTTP requests, cache
//! dispositions, coalescing, embedding calls, rate limiting, and telemetry
//! delivery.

#[cfg(feature = "prometheus")]
use std::sync::OnceLock;

use metrics::{counter, gauge, histogram};
#[cfg(feature = "prometheus")]
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

#[cfg(feature = "prometheus")]
static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Install the Prometheus recorder. Call once at startup.
#[cfg(feature = "prometheus")]
pub fn init_prometheus() -> Result<(), String> {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| e.to_string())?;
    PROMETHEUS_HANDLE
        .set(handle)
        .map_err(|_| "metrics recorder already installed".to_string())
}

/// Render the current metrics in Prometheus exposition format.
#[cfg(feature = "prometheus")]
pub fn render_prometheus() -> Option<String> {
    PROMETHEUS_HANDLE.get().map(|h| h.render())
}

/// Record a completed HTTP request.
pub fn record_http_request(method: &str, path: &str, status: u16, duration_secs: f64) {
    let status_class = format!("{}xx", status / 100);
    counter!(
        "watchllm_http_requests_total",
        "method" => method.to_string(),
        "path" => path.to_string(),
        "status_class" => status_class.clone()
    )
    .increment(1);
    histogram!(
        "watchllm_http_request_duration_seconds",
        "method" => method.to_string(),
        "path" => path.to_string(),
        "status_class" => status_class
    )
    .record(duration_secs);
}

/// Record a request-terminating error by kind.
pub fn record_request_error(kind: &str) {
    counter!("watchllm_request_errors_total", "kind" => kind.to_string()).increment(1);
}

/// Record a cache operation outcome.
///
/// `operation` is one of "lookup", "insert"; `outcome` is e.g. "exact_hit",
/// "semantic_hit", "miss", "bypass", "stored", "duplicate", "expired".
pub fn record_cache_operation(operation: &str, outcome: &str) {
    counter!(
        "watchllm_cache_operations_total",
        "operation" => operation.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Record a coalescer join by role ("leader" or "follower").
pub fn record_coalesce_join(role: &str) {
    counter!("watchllm_coalesce_joins_total", "role" => role.to_string()).increment(1);
}

/// Track the number of in-flight upstream requests.
pub fn record_inflight(delta: f64) {
    gauge!("watchllm_inflight_upstream").increment(delta);
}

/// Record an embedding call outcome and latency.
pub fn record_embedding_call(outcome: &str, duration_secs: f64) {
    counter!("watchllm_embedding_calls_total", "outcome" => outcome.to_string()).increment(1);
    histogram!("watchllm_embedding_call_duration_seconds").record(duration_secs);
}

/// Record a rate-limit decision ("allowed" or "rejected") for a dimension
/// ("minute" or "monthly").
pub fn record_rate_limit(dimension: &str, decision: &str) {
    counter!(
        "watchllm_rate_limit_decisions_total",
        "dimension" => dimension.to_string(),
        "decision" => decision.to_string()
    )
    .increment(1);
}

/// Record an upstream provider request.
pub fn record_provider_request(provider: &str, model: &str, status: &str, duration_secs: f64) {
    counter!(
        "watchllm_provider_requests_total",
        "provider" => provider.to_string(),
        "model" => model.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
    histogram!(
        "watchllm_provider_request_duration_seconds",
        "provider" => provider.to_string()
    )
    .record(duration_secs);
}

/// Record a streaming replay served from cache.
pub fn record_stream_replay(chunks: u64) {
    counter!("watchllm_stream_replays_total").increment(1);
    counter!("watchllm_stream_replay_chunks_total").increment(chunks);
}

/// Record telemetry delivery results.
pub fn record_telemetry_flush(written: u64, failed: u64) {
    counter!("watchllm_telemetry_events_written_total").increment(written);
    counter!("watchllm_telemetry_events_failed_total").increment(failed);
}

/// Record a telemetry event dropped due to buffer overflow.
pub fn record_telemetry_drop() {
    counter!("watchllm_telemetry_events_dropped_total").increment(1);
}
