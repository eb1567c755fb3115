//! Telemetry egress and in-process analytics aggregates.
//!
//! One structured event per terminal request. Events go through a bounded
//! lock-free buffer flushed in batches by a background worker; sink
//! failures are swallowed and counted, never surfaced to the request path.
//! The same recording call feeds the per-project aggregates behind
//! `/v1/analytics/*`.

use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use chrono::{DateTime, Utc};
use crossbeam_channel::{Receiver, Sender, TrySendError};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::{canonical::Endpoint, config::TelemetryConfig, observability::metrics};

/// One append-only usage record per completed request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageEvent {
    pub request_id: String,
    pub project_id: String,
    pub timestamp: DateTime<Utc>,
    pub endpoint: Endpoint,
    pub provider: String,
    pub model: String,
    pub tokens_in: i64,
    pub tokens_out: i64,
    pub cost_usd: f64,
    pub potential_cost_usd: f64,
    pub cached: bool,
    pub coalesced: bool,
    /// 1.0 on exact hit, measured cosine on semantic hit, absent on miss.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_similarity: Option<f64>,
    /// Served by replaying a cached streaming transcript.
    pub stream_replayed: bool,
    pub latency_ms: u64,
    /// "ok" or "error".
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<String>,
    /// The pricing quote used for costing was stale or a fallback.
    pub price_stale: bool,
}

/// Destination for usage events.
#[async_trait::async_trait]
pub trait TelemetrySink: Send + Sync {
    /// Deliver a batch. Returns how many events were accepted.
    async fn write_batch(&self, events: &[UsageEvent]) -> Result<usize, SinkError>;

    fn name(&self) -> &'static str;
}

#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("sink returned status {0}")]
    Status(u16),
}

/// HTTP sink: newline-delimited JSON POSTed to the configured URL.
pub struct HttpSink {
    http: reqwest::Client,
    url: String,
}

impl HttpSink {
    pub fn new(url: String, http: reqwest::Client) -> Self {
        Self { http, url }
    }
}

#[async_trait::async_trait]
impl TelemetrySink for HttpSink {
    async fn write_batch(&self, events: &[UsageEvent]) -> Result<usize, SinkError> {
        let mut body = Vec::new();
        for event in events {
            if let Ok(line) = serde_json::to_vec(event) {
                body.extend_from_slice(&line);
                body.push(b'\n');
            }
        }

        let response = self
            .http
            .post(&self.url)
            .header("content-type", "application/x-ndjson")
            .body(body)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(SinkError::Status(response.status().as_u16()));
        }
        Ok(events.len())
    }

    fn name(&self) -> &'static str {
        "http"
    }
}

/// Sink used when no egress is configured: events are counted and dropped.
pub struct NullSink;

#[async_trait::async_trait]
impl TelemetrySink for NullSink {
    async fn write_batch(&self, events: &[UsageEvent]) -> Result<usize, SinkError> {
        Ok(events.len())
    }

    fn name(&self) -> &'static str {
        "null"
    }
}

/// Per-project rollup served by the analytics routes.
#[derive(Debug, Default, Serialize)]
pub struct ProjectAggregate {
    pub requests: u64,
    pub cache_hits: u64,
    pub coalesced: u64,
    pub errors: u64,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub cost_microcents: u64,
    pub saved_microcents: u64,
}

#[derive(Debug, Default)]
struct AggregateCells {
    requests: AtomicU64,
    cache_hits: AtomicU64,
    coalesced: AtomicU64,
    errors: AtomicU64,
    tokens_in: AtomicU64,
    tokens_out: AtomicU64,
    cost_microcents: AtomicU64,
    saved_microcents: AtomicU64,
}

/// Event pipeline: lock-free push, background batch flush, analytics
/// aggregation, drop counting.
pub struct Telemetry {
    tx: Sender<UsageEvent>,
    rx: Receiver<UsageEvent>,
    sink: Arc<dyn TelemetrySink>,
    config: TelemetryConfig,
    aggregates: DashMap<String, AggregateCells>,
    dropped: AtomicU64,
}

impl Telemetry {
    pub fn new(config: TelemetryConfig, http: reqwest::Client) -> Arc<Self> {
        let sink: Arc<dyn TelemetrySink> = match &config.sink_url {
            Some(url) => Arc::new(HttpSink::new(url.clone(), http)),
            None => Arc::new(NullSink),
        };
        let (tx, rx) = crossbeam_channel::bounded(config.max_pending_events.max(1));

        Arc::new(Self {
            tx,
            rx,
            sink,
            config,
            aggregates: DashMap::new(),
            dropped: AtomicU64::new(0),
        })
    }

    /// Record a terminal request: update aggregates and enqueue the event.
    /// Lock-free; never blocks the request path.
    pub fn record(&self, event: UsageEvent) {
        self.aggregate(&event);

        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                metrics::record_telemetry_drop();
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                if dropped % 100 == 1 {
                    tracing::warn!(
                        dropped,
                        max_pending = self.config.max_pending_events,
                        "Telemetry buffer overflow, dropping events"
                    );
                }
            }
            Err(TrySendError::Disconnected(_)) => {}
        }
    }

    fn aggregate(&self, event: &UsageEvent) {
        let cells = self.aggregates.entry(event.project_id.clone()).or_default();
        cells.requests.fetch_add(1, Ordering::Relaxed);
        if event.cached {
            cells.cache_hits.fetch_add(1, Ordering::Relaxed);
        }
        if event.coalesced {
            cells.coalesced.fetch_add(1, Ordering::Relaxed);
        }
        if event.status != "ok" {
            cells.errors.fetch_add(1, Ordering::Relaxed);
        }
        cells
            .tokens_in
            .fetch_add(event.tokens_in.max(0) as u64, Ordering::Relaxed);
        cells
            .tokens_out
            .fetch_add(event.tokens_out.max(0) as u64, Ordering::Relaxed);

        let cost = crate::pricing::dollars_to_microcents(event.cost_usd).max(0) as u64;
        let potential = crate::pricing::dollars_to_microcents(event.potential_cost_usd).max(0) as u64;
        cells.cost_microcents.fetch_add(cost, Ordering::Relaxed);
        cells
            .saved_microcents
            .fetch_add(potential.saturating_sub(cost), Ordering::Relaxed);
    }

    /// Snapshot one project's aggregate.
    pub fn project_aggregate(&self, project_id: &str) -> Option<ProjectAggregate> {
        self.aggregates.get(project_id).map(|cells| ProjectAggregate {
            requests: cells.requests.load(Ordering::Relaxed),
            cache_hits: cells.cache_hits.load(Ordering::Relaxed),
            coalesced: cells.coalesced.load(Ordering::Relaxed),
            errors: cells.errors.load(Ordering::Relaxed),
            tokens_in: cells.tokens_in.load(Ordering::Relaxed),
            tokens_out: cells.tokens_out.load(Ordering::Relaxed),
            cost_microcents: cells.cost_microcents.load(Ordering::Relaxed),
            saved_microcents: cells.saved_microcents.load(Ordering::Relaxed),
        })
    }

    /// Snapshot every project's aggregate.
    pub fn all_aggregates(&self) -> Vec<(String, ProjectAggregate)> {
        self.aggregates
            .iter()
            .map(|kv| {
                (
                    kv.key().clone(),
                    self.project_aggregate(kv.key()).unwrap_or_default(),
                )
            })
            .collect()
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Background flush loop. Drains pending events every flush interval
    /// and on shutdown.
    pub async fn run_flush_worker(self: Arc<Self>, shutdown: CancellationToken) {
        let mut interval =
            tokio::time::interval(std::time::Duration::from_millis(self.config.flush_interval_ms.max(10)));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.flush_once().await;
                }
                _ = shutdown.cancelled() => {
                    // Final drain so a clean shutdown loses nothing.
                    self.flush_once().await;
                    return;
                }
            }
        }
    }

    async fn flush_once(&self) {
        loop {
            let mut batch = Vec::with_capacity(self.config.batch_size);
            while batch.len() < self.config.batch_size {
                match self.rx.try_recv() {
                    Ok(event) => batch.push(event),
                    Err(_) => break,
                }
            }
            if batch.is_empty() {
                return;
            }

            match self.sink.write_batch(&batch).await {
                Ok(written) => {
                    metrics::record_telemetry_flush(written as u64, 0);
                    tracing::debug!(written, sink = self.sink.name(), "Telemetry batch flushed");
                }
                Err(error) => {
                    // Swallowed per contract; the counter is the record.
                    metrics::record_telemetry_flush(0, batch.len() as u64);
                    tracing::warn!(
                        error = %error,
                        count = batch.len(),
                        sink = self.sink.name(),
                        "Telemetry flush failed, events lost"
                    );
                }
            }

            if batch.len() < self.config.batch_size {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(project: &str, cached: bool, cost: f64, potential: f64) -> UsageEvent {
        UsageEvent {
            request_id: "req-1".to_string(),
            project_id: project.to_string(),
            timestamp: Utc::now(),
            endpoint: Endpoint::Chat,
            provider: "openai".to_string(),
            model: "gpt-4o-mini".to_string(),
            tokens_in: 10,
            tokens_out: 5,
            cost_usd: cost,
            potential_cost_usd: potential,
            cached,
            coalesced: false,
            cache_similarity: cached.then_some(1.0),
            stream_replayed: false,
            latency_ms: 42,
            status: "ok".to_string(),
            error_kind: None,
            price_stale: false,
        }
    }

    fn telemetry(max_pending: usize) -> Arc<Telemetry> {
        Telemetry::new(
            TelemetryConfig {
                sink_url: None,
                max_pending_events: max_pending,
                batch_size: 10,
                flush_interval_ms: 50,
            },
            reqwest::Client::new(),
        )
    }

    #[test]
    fn aggregates_roll_up_hits_and_savings() {
        let t = telemetry(100);
        t.record(event("p1", false, 0.01, 0.01));
        t.record(event("p1", true, 0.0, 0.01));
        t.record(event("p2", false, 0.02, 0.02));

        let p1 = t.project_aggregate("p1").unwrap();
        assert_eq!(p1.requests, 2);
        assert_eq!(p1.cache_hits, 1);
        assert_eq!(p1.cost_microcents, 10_000);
        assert_eq!(p1.saved_microcents, 10_000);

        let p2 = t.project_aggregate("p2").unwrap();
        assert_eq!(p2.requests, 1);
        assert!(t.project_aggregate("p3").is_none());
    }

    #[test]
    fn overflow_drops_are_counted_not_fatal() {
        let t = telemetry(2);
        for _ in 0..5 {
            t.record(event("p1", false, 0.0, 0.0));
        }
        assert_eq!(t.dropped_count(), 3);
        // Aggregates still saw every event.
        assert_eq!(t.project_aggregate("p1").unwrap().requests, 5);
    }

    #[tokio::test]
    async fn http_sink_posts_ndjson() {
        use wiremock::{
            Mock, MockServer, ResponseTemplate,
            matchers::{body_string_contains, header, method},
        };

        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(header("content-type", "application/x-ndjson"))
            .and(body_string_contains("\"project_id\":\"p1\""))
            .respond_with(ResponseTemplate::new(202))
            .expect(1)
            .mount(&server)
            .await;

        let sink = HttpSink::new(server.uri(), reqwest::Client::new());
        let written = sink
            .write_batch(&[event("p1", false, 0.01, 0.01)])
            .await
            .unwrap();
        assert_eq!(written, 1);
    }

    #[tokio::test]
    async fn flush_worker_drains_on_shutdown() {
        let t = telemetry(100);
        t.record(event("p1", false, 0.0, 0.0));

        let shutdown = CancellationToken::new();
        shutdown.cancel();
        // A cancelled token makes the worker do one final drain and exit;
        // the NullSink accepts everything.
        t.clone().run_flush_worker(shutdown).await;
        assert_eq!(t.dropped_count(), 0);
    }

    #[test]
    fn event_serializes_with_optional_fields_elided() {
        let mut e = event("p1", false, 0.0, 0.0);
        e.cache_similarity = None;
        e.error_kind = None;

        let json = serde_json::to_value(&e).unwrap();
        assert!(json.get("cache_similarity").is_none());
        assert!(json.get("error_kind").is_none());
        assert_eq!(json["endpoint"], "chat");
    }
}
