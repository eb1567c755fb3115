//! Cache entry types.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::canonical::{Endpoint, Fingerprint};

/// What kind of response an entry holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseKind {
    Unary,
    Stream,
}

/// One recorded SSE chunk with the delay since the previous chunk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptChunk {
    pub delay_ms: u64,
    pub bytes: Vec<u8>,
}

/// Stored response payload.
#[derive(Debug, Clone)]
pub enum CachePayload {
    /// Complete response body.
    Unary { body: Vec<u8>, content_type: String },
    /// Fully-buffered streaming transcript in upstream order. Only complete
    /// transcripts are ever stored.
    Stream { chunks: Vec<TranscriptChunk> },
}

impl CachePayload {
    pub fn kind(&self) -> ResponseKind {
        match self {
            CachePayload::Unary { .. } => ResponseKind::Unary,
            CachePayload::Stream { .. } => ResponseKind::Stream,
        }
    }
}

/// An immutable cached response.
///
/// The embedding and payload never change after insert; only the hit
/// bookkeeping (hit_count, last_hit) is updated, best-effort, via atomics.
#[derive(Debug)]
pub struct CacheEntry {
    pub fingerprint: Fingerprint,
    pub project_id: String,
    pub endpoint: Endpoint,
    pub model: String,
    pub stored_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub payload: CachePayload,
    pub tokens_in: i64,
    pub tokens_out: i64,
    pub provider_cost_microcents: i64,
    /// Prompt embedding captured at insert time, absent when the embedding
    /// provider was unavailable (exact-match-only entry).
    pub embedding: Option<Vec<f32>>,
    hit_count: AtomicU64,
    /// Epoch milliseconds of the most recent hit, for LRU eviction.
    last_hit_ms: AtomicI64,
}

impl CacheEntry {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        fingerprint: Fingerprint,
        project_id: String,
        endpoint: Endpoint,
        model: String,
        ttl: std::time::Duration,
        payload: CachePayload,
        tokens_in: i64,
        tokens_out: i64,
        provider_cost_microcents: i64,
        embedding: Option<Vec<f32>>,
    ) -> Self {
        let now = Utc::now();
        Self {
            fingerprint,
            project_id,
            endpoint,
            model,
            stored_at: now,
            expires_at: now + chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::hours(1)),
            payload,
            tokens_in,
            tokens_out,
            provider_cost_microcents,
            embedding,
            hit_count: AtomicU64::new(0),
            last_hit_ms: AtomicI64::new(now.timestamp_millis()),
        }
    }

    /// Strict expiry check; expired entries must never be served.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }

    /// Record a hit. Best-effort: relaxed ordering is fine, the counters
    /// feed eviction and analytics, not correctness.
    pub fn record_hit(&self) {
        self.hit_count.fetch_add(1, Ordering::Relaxed);
        self.last_hit_ms
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    pub fn hit_count(&self) -> u64 {
        self.hit_count.load(Ordering::Relaxed)
    }

    pub fn last_hit_ms(&self) -> i64 {
        self.last_hit_ms.load(Ordering::Relaxed)
    }

    pub fn kind(&self) -> ResponseKind {
        self.payload.kind()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn entry(ttl: Duration) -> CacheEntry {
        CacheEntry::new(
            Fingerprint([7u8; 32]),
            "p1".into(),
            Endpoint::Chat,
            "gpt-4o-mini".into(),
            ttl,
            CachePayload::Unary {
                body: b"{}".to_vec(),
                content_type: "application/json".into(),
            },
            10,
            20,
            100,
            None,
        )
    }

    #[test]
    fn fresh_entry_is_not_expired() {
        let e = entry(Duration::from_secs(60));
        assert!(!e.is_expired(Utc::now()));
    }

    #[test]
    fn entry_expires_strictly_after_ttl() {
        let e = entry(Duration::from_secs(60));
        let after = e.expires_at + chrono::Duration::milliseconds(1);
        assert!(e.is_expired(after));
    }

    #[test]
    fn hits_accumulate() {
        let e = entry(Duration::from_secs(60));
        assert_eq!(e.hit_count(), 0);
        e.record_hit();
        e.record_hit();
        assert_eq!(e.hit_count(), 2);
    }
}
