//! Embedding client for semantic lookups.
//!
//! Calls the configured OpenAI-compatible embeddings endpoint with a short
//! deadline and memoizes results by prompt content hash, so retries and
//! coalesced followers never re-embed the same prompt. Every failure mode
//! (timeout, HTTP error, malformed body) degrades the request to
//! exact-match-only caching; nothing here can fail a request.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use dashmap::DashMap;
use sha2::{Digest, Sha256};

use crate::{
    api_types::embeddings::{CreateEmbeddingResponse, EmbeddingVector},
    config::EmbeddingConfig,
    observability::metrics,
};

/// Bound on memoized vectors; the memo is cleared wholesale when it fills.
const MEMO_MAX_ENTRIES: usize = 50_000;

pub struct EmbeddingClient {
    http: reqwest::Client,
    endpoint: String,
    model: String,
    dimensions: usize,
    api_key: Option<String>,
    deadline: Duration,
    memo: DashMap<[u8; 32], Arc<Vec<f32>>>,
}

impl EmbeddingClient {
    /// Build a client from config. Returns `None` when no endpoint is
    /// configured; the proxy then runs exact-match-only.
    pub fn from_config(config: &EmbeddingConfig, http: reqwest::Client) -> Option<Self> {
        if config.endpoint.is_empty() {
            return None;
        }
        Some(Self {
            http,
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            dimensions: config.dimensions,
            api_key: config.api_key.clone(),
            deadline: Duration::from_millis(config.deadline_ms),
            memo: DashMap::new(),
        })
    }

    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    /// Embed a prompt projection. `None` means the request proceeds without
    /// a vector (exact-match only).
    pub async fn embed(&self, text: &str) -> Option<Arc<Vec<f32>>> {
        if text.is_empty() {
            return None;
        }

        let key: [u8; 32] = Sha256::digest(text.as_bytes()).into();
        if let Some(cached) = self.memo.get(&key) {
            return Some(Arc::clone(cached.value()));
        }

        let start = Instant::now();
        let result = tokio::time::timeout(self.deadline, self.call_provider(text)).await;
        let duration = start.elapsed().as_secs_f64();

        let embedding = match result {
            Ok(Ok(vector)) => vector,
            Ok(Err(error)) => {
                tracing::debug!(error = %error, "Embedding call failed, degrading to exact-match");
                metrics::record_embedding_call("error", duration);
                return None;
            }
            Err(_) => {
                tracing::debug!(
                    deadline_ms = self.deadline.as_millis() as u64,
                    "Embedding call timed out, degrading to exact-match"
                );
                metrics::record_embedding_call("timeout", duration);
                return None;
            }
        };

        metrics::record_embedding_call("success", duration);

        if self.memo.len() >= MEMO_MAX_ENTRIES {
            self.memo.clear();
        }
        let shared = Arc::new(embedding);
        self.memo.insert(key, Arc::clone(&shared));
        Some(shared)
    }

    async fn call_provider(&self, text: &str) -> Result<Vec<f32>, EmbedError> {
        let url = format!("{}/embeddings", self.endpoint);
        let body = serde_json::json!({
            "model": self.model,
            "input": text,
            "dimensions": self.dimensions,
        });

        let mut request = self.http.post(&url).json(&body);
        if let Some(api_key) = &self.api_key {
            request = request.header("authorization", format!("Bearer {}", api_key));
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(EmbedError::Status(response.status().as_u16()));
        }

        let parsed: CreateEmbeddingResponse = response.json().await?;
        let data = parsed.data.into_iter().next().ok_or(EmbedError::Empty)?;

        let vector = match data.embedding {
            EmbeddingVector::Float(values) => values.into_iter().map(|v| v as f32).collect(),
            EmbeddingVector::Base64(encoded) => decode_base64_f32(&encoded)?,
        };
        Ok(vector)
    }
}

#[derive(Debug, thiserror::Error)]
enum EmbedError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("provider returned status {0}")]
    Status(u16),

    #[error("no embeddings in response")]
    Empty,

    #[error("invalid base64 embedding: {0}")]
    Base64(String),
}

/// Base64-packed little-endian f32s, the OpenAI `encoding_format: base64`
/// wire form.
fn decode_base64_f32(encoded: &str) -> Result<Vec<f32>, EmbedError> {
    use base64::Engine;

    let bytes = base64::engine::general_purpose::STANDARD
        .decode(encoded)
        .map_err(|e| EmbedError::Base64(e.to_string()))?;

    if bytes.len() % 4 != 0 {
        return Err(EmbedError::Base64("length not a multiple of 4".to_string()));
    }

    Ok(bytes
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect())
}

impl std::fmt::Debug for EmbeddingClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmbeddingClient")
            .field("endpoint", &self.endpoint)
            .field("model", &self.model)
            .field("dimensions", &self.dimensions)
            .finish()
    }
}
