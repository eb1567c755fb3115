//! WatchLLM: an OpenAI-compatible caching proxy for LLM providers.
//!
//! The proxy sits between applications and providers (OpenAI, Anthropic,
//! Groq, compatible gateways) and cuts spend and tail latency three ways:
//! semantically-equivalent responses are served from a cache, identical
//! in-flight requests are coalesced into one upstream call, and cached
//! streaming responses are replayed with realistic pacing so clients
//! observe no behavioral difference versus the upstream.

pub mod accounting;
pub mod api_types;
pub mod cache;
pub mod canonical;
pub mod coalesce;
pub mod config;
pub mod error;
pub mod limits;
pub mod middleware;
pub mod observability;
pub mod pricing;
pub mod providers;
pub mod registry;
pub mod routes;
pub mod streaming;
pub mod telemetry;

#[cfg(test)]
mod tests;

use std::{sync::Arc, time::Duration};

use tokio_util::{sync::CancellationToken, task::TaskTracker};

use crate::{
    cache::{CacheStore, EmbeddingClient, MemoryStore},
    coalesce::Coalescer,
    config::ProxyConfig,
    limits::RateLimiter,
    pricing::PricingTable,
    providers::ModelRouter,
    registry::StaticRegistry,
    telemetry::Telemetry,
};

/// Process-wide services, dependency-injected into every handler.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ProxyConfig>,
    /// One shared HTTP client for all outbound calls; reqwest keeps
    /// per-host connection pools internally.
    pub http: reqwest::Client,
    pub registry: Arc<StaticRegistry>,
    pub store: Arc<MemoryStore>,
    /// Absent when no embedding endpoint is configured; the proxy then
    /// runs exact-match-only.
    pub embedding: Option<Arc<EmbeddingClient>>,
    pub coalescer: Arc<Coalescer>,
    pub limiter: Arc<RateLimiter>,
    pub pricing: Arc<PricingTable>,
    pub telemetry: Arc<Telemetry>,
    pub model_router: Arc<ModelRouter>,
    /// Tracks detached upstream and maintenance tasks so graceful
    /// shutdown can wait for them.
    pub task_tracker: TaskTracker,
    pub shutdown: CancellationToken,
}

impl AppState {
    pub fn new(config: ProxyConfig) -> Result<Self, Box<dyn std::error::Error>> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()?;

        let registry = Arc::new(StaticRegistry::new(
            &config.registry,
            config.cache.ttl_secs,
            config.cache.semantic.default_threshold,
        ));

        let provider_names: Vec<String> = config.providers.keys().cloned().collect();
        let model_router = Arc::new(ModelRouter::from_config(&config.routing, &provider_names));

        let embedding = EmbeddingClient::from_config(&config.embedding, http.clone()).map(Arc::new);
        if embedding.is_none() && config.cache.semantic.enabled {
            tracing::info!(
                "No embedding endpoint configured; semantic caching disabled, exact-match only"
            );
        }

        let telemetry = Telemetry::new(config.telemetry.clone(), http.clone());

        Ok(Self {
            store: Arc::new(MemoryStore::new(config.cache.max_entries_per_project)),
            coalescer: Coalescer::new(Duration::from_secs(
                config.limits.coalesce_leader_max_age_secs,
            )),
            limiter: Arc::new(RateLimiter::new()),
            pricing: Arc::new(PricingTable::from_config(&config.pricing)),
            registry,
            model_router,
            embedding,
            telemetry,
            http,
            config: Arc::new(config),
            task_tracker: TaskTracker::new(),
            shutdown: CancellationToken::new(),
        })
    }

    /// Start the background maintenance tasks: telemetry flushing and the
    /// expired-entry sweep. Both exit on shutdown.
    pub fn spawn_background_tasks(&self) {
        self.task_tracker.spawn(
            Arc::clone(&self.telemetry).run_flush_worker(self.shutdown.clone()),
        );

        let store = Arc::clone(&self.store);
        let shutdown = self.shutdown.clone();
        let sweep_interval = Duration::from_secs(self.config.cache.sweep_interval_secs.max(1));
        self.task_tracker.spawn(async move {
            let mut interval = tokio::time::interval(sweep_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let purged = store.purge_expired();
                        if purged > 0 {
                            tracing::debug!(purged, "Swept expired cache entries");
                        }
                    }
                    _ = shutdown.cancelled() => return,
                }
            }
        });
    }

    /// Signal shutdown and wait for in-flight background tasks.
    pub async fn graceful_shutdown(&self, drain_timeout: Duration) {
        self.shutdown.cancel();
        self.task_tracker.close();
        if tokio::time::timeout(drain_timeout, self.task_tracker.wait())
            .await
            .is_err()
        {
            tracing::warn!(
                timeout_secs = drain_timeout.as_secs(),
                "Background tasks did not drain before the shutdown timeout"
            );
        }
    }
}
