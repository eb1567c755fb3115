//! Associative response store with exact and semantic lookup.
//!
//! Exact lookups are keyed by (project, fingerprint); semantic lookups go
//! through the cosine index, scoped to the (project, endpoint, model)
//! family. Expiry is strict and checked before similarity. Inserts are
//! idempotent on fingerprint: when an unexpired entry already exists the
//! newly-computed response is discarded and the original wins.

use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;

use super::{entry::CacheEntry, vector_index::VectorIndex};
use crate::{
    canonical::{Endpoint, Fingerprint},
    observability::metrics,
};

/// Similarity window treated as a tie; broken toward the newer entry.
const TIE_EPSILON: f64 = 1e-6;

/// Store contract: two lookups and one idempotent insert.
pub trait CacheStore: Send + Sync {
    /// Exact match by fingerprint. Never returns an expired entry.
    fn lookup_exact(&self, project_id: &str, fingerprint: &Fingerprint)
    -> Option<Arc<CacheEntry>>;

    /// Best semantic match above `threshold` within the (project, endpoint,
    /// model) family, with its measured cosine similarity.
    fn lookup_semantic(
        &self,
        project_id: &str,
        endpoint: Endpoint,
        model: &str,
        embedding: &[f32],
        threshold: f64,
    ) -> Option<(Arc<CacheEntry>, f64)>;

    /// Insert an entry. Returns false when an unexpired entry with the same
    /// fingerprint already exists (the new response is discarded).
    fn insert(&self, entry: CacheEntry) -> bool;

    /// Drop expired entries and their index vectors. Returns the number
    /// removed.
    fn purge_expired(&self) -> usize;
}

/// Single-node in-memory store.
pub struct MemoryStore {
    entries: DashMap<(String, Fingerprint), Arc<CacheEntry>>,
    index: VectorIndex,
    max_entries_per_project: usize,
}

impl MemoryStore {
    pub fn new(max_entries_per_project: usize) -> Self {
        Self {
            entries: DashMap::new(),
            index: VectorIndex::new(),
            max_entries_per_project: max_entries_per_project.max(1),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn remove_entry(&self, project_id: &str, entry: &CacheEntry) {
        self.entries
            .remove(&(project_id.to_string(), entry.fingerprint));
        self.index
            .remove(project_id, entry.endpoint, &entry.model, &entry.fingerprint);
    }

    /// Evict least-recently-hit entries for a project once it reaches the
    /// capacity bound. TTL expiry stays authoritative; this only bounds
    /// memory.
    fn evict_if_needed(&self, project_id: &str) {
        let mut owned: Vec<(Fingerprint, i64)> = self
            .entries
            .iter()
            .filter(|kv| kv.key().0 == project_id)
            .map(|kv| (kv.key().1, kv.value().last_hit_ms()))
            .collect();

        if owned.len() < self.max_entries_per_project {
            return;
        }

        owned.sort_by_key(|(_, last_hit)| *last_hit);
        let to_evict = owned.len() + 1 - self.max_entries_per_project;
        for (fingerprint, _) in owned.into_iter().take(to_evict) {
            if let Some((_, entry)) = self
                .entries
                .remove(&(project_id.to_string(), fingerprint))
            {
                self.index
                    .remove(project_id, entry.endpoint, &entry.model, &entry.fingerprint);
                metrics::record_cache_operation("insert", "evicted");
            }
        }
    }
}

impl CacheStore for MemoryStore {
    fn lookup_exact(
        &self,
        project_id: &str,
        fingerprint: &Fingerprint,
    ) -> Option<Arc<CacheEntry>> {
        let key = (project_id.to_string(), *fingerprint);
        let entry = self.entries.get(&key).map(|kv| Arc::clone(kv.value()))?;

        if entry.is_expired(Utc::now()) {
            self.remove_entry(project_id, &entry);
            metrics::record_cache_operation("lookup", "expired");
            return None;
        }

        Some(entry)
    }

    fn lookup_semantic(
        &self,
        project_id: &str,
        endpoint: Endpoint,
        model: &str,
        embedding: &[f32],
        threshold: f64,
    ) -> Option<(Arc<CacheEntry>, f64)> {
        let candidates =
            self.index
                .search(project_id, endpoint, model, embedding, threshold, TIE_EPSILON);

        for candidate in candidates {
            let key = (project_id.to_string(), candidate.fingerprint);
            let Some(entry) = self.entries.get(&key).map(|kv| Arc::clone(kv.value())) else {
                // Vector outlived its entry (eviction race); drop it.
                self.index
                    .remove(project_id, endpoint, model, &candidate.fingerprint);
                continue;
            };

            // Expiry precedes similarity: a high-cosine expired entry must
            // not be served.
            if entry.is_expired(Utc::now()) {
                self.remove_entry(project_id, &entry);
                metrics::record_cache_operation("lookup", "expired");
                continue;
            }

            return Some((entry, candidate.similarity));
        }

        None
    }

    fn insert(&self, entry: CacheEntry) -> bool {
        use dashmap::mapref::entry::Entry;

        let key = (entry.project_id.clone(), entry.fingerprint);
        self.evict_if_needed(&entry.project_id);

        match self.entries.entry(key) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_expired(Utc::now()) {
                    // Drop the stale vector first; the index insert is
                    // idempotent on fingerprint and would keep it otherwise.
                    let old = Arc::clone(occupied.get());
                    self.index
                        .remove(&old.project_id, old.endpoint, &old.model, &old.fingerprint);
                    let fresh = Arc::new(entry);
                    self.index_entry(&fresh);
                    occupied.insert(fresh);
                    metrics::record_cache_operation("insert", "replaced_expired");
                    true
                } else {
                    // Leader wins once; the duplicate is discarded.
                    metrics::record_cache_operation("insert", "duplicate");
                    false
                }
            }
            Entry::Vacant(vacant) => {
                let fresh = Arc::new(entry);
                self.index_entry(&fresh);
                vacant.insert(fresh);
                metrics::record_cache_operation("insert", "stored");
                true
            }
        }
    }

    fn purge_expired(&self) -> usize {
        let now = Utc::now();
        let expired: Vec<Arc<CacheEntry>> = self
            .entries
            .iter()
            .filter(|kv| kv.value().is_expired(now))
            .map(|kv| Arc::clone(kv.value()))
            .collect();

        for entry in &expired {
            self.remove_entry(&entry.project_id, entry);
        }
        expired.len()
    }
}

impl MemoryStore {
    fn index_entry(&self, entry: &Arc<CacheEntry>) {
        if let Some(embedding) = &entry.embedding {
            self.index.insert(
                &entry.project_id,
                entry.endpoint,
                &entry.model,
                entry.fingerprint,
                embedding.clone(),
                entry.stored_at.timestamp_millis(),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::cache::entry::CachePayload;

    fn fp(byte: u8) -> Fingerprint {
        Fingerprint([byte; 32])
    }

    fn entry_with(
        project: &str,
        fingerprint: Fingerprint,
        model: &str,
        ttl: Duration,
        embedding: Option<Vec<f32>>,
    ) -> CacheEntry {
        CacheEntry::new(
            fingerprint,
            project.to_string(),
            Endpoint::Chat,
            model.to_string(),
            ttl,
            CachePayload::Unary {
                body: b"{\"ok\":true}".to_vec(),
                content_type: "application/json".into(),
            },
            10,
            20,
            150,
            embedding,
        )
    }

    #[test]
    fn insert_then_lookup_round_trips() {
        let store = MemoryStore::new(100);
        assert!(store.insert(entry_with("p1", fp(1), "m", Duration::from_secs(60), None)));

        let found = store.lookup_exact("p1", &fp(1)).unwrap();
        assert_eq!(found.tokens_out, 20);
    }

    #[test]
    fn entries_never_cross_projects() {
        let store = MemoryStore::new(100);
        store.insert(entry_with(
            "p1",
            fp(1),
            "m",
            Duration::from_secs(60),
            Some(vec![1.0, 0.0]),
        ));

        assert!(store.lookup_exact("p2", &fp(1)).is_none());
        assert!(store
            .lookup_semantic("p2", Endpoint::Chat, "m", &[1.0, 0.0], 0.9)
            .is_none());
    }

    #[test]
    fn semantic_lookup_never_crosses_models() {
        let store = MemoryStore::new(100);
        store.insert(entry_with(
            "p1",
            fp(1),
            "gpt-4o",
            Duration::from_secs(60),
            Some(vec![1.0, 0.0]),
        ));

        assert!(store
            .lookup_semantic("p1", Endpoint::Chat, "claude-3-5-sonnet-latest", &[1.0, 0.0], 0.9)
            .is_none());
    }

    #[test]
    fn duplicate_insert_is_idempotent_and_first_wins() {
        let store = MemoryStore::new(100);
        assert!(store.insert(entry_with("p1", fp(1), "m", Duration::from_secs(60), None)));

        let mut second = entry_with("p1", fp(1), "m", Duration::from_secs(60), None);
        second.tokens_out = 999;
        assert!(!store.insert(second));

        let found = store.lookup_exact("p1", &fp(1)).unwrap();
        assert_eq!(found.tokens_out, 20);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn expired_entries_are_never_served() {
        let store = MemoryStore::new(100);
        store.insert(entry_with(
            "p1",
            fp(1),
            "m",
            Duration::from_millis(0),
            Some(vec![1.0, 0.0]),
        ));

        std::thread::sleep(Duration::from_millis(5));
        assert!(store.lookup_exact("p1", &fp(1)).is_none());
        assert!(store
            .lookup_semantic("p1", Endpoint::Chat, "m", &[1.0, 0.0], 0.5)
            .is_none());
    }

    #[test]
    fn expired_entry_can_be_replaced() {
        let store = MemoryStore::new(100);
        store.insert(entry_with("p1", fp(1), "m", Duration::from_millis(0), None));
        std::thread::sleep(Duration::from_millis(5));

        let mut fresh = entry_with("p1", fp(1), "m", Duration::from_secs(60), None);
        fresh.tokens_out = 33;
        assert!(store.insert(fresh));
        assert_eq!(store.lookup_exact("p1", &fp(1)).unwrap().tokens_out, 33);
    }

    #[test]
    fn semantic_lookup_returns_measured_similarity() {
        let store = MemoryStore::new(100);
        store.insert(entry_with(
            "p1",
            fp(1),
            "m",
            Duration::from_secs(60),
            Some(vec![1.0, 0.0]),
        ));

        let (entry, similarity) = store
            .lookup_semantic("p1", Endpoint::Chat, "m", &[1.0, 0.1], 0.9)
            .unwrap();
        assert_eq!(entry.fingerprint, fp(1));
        assert!(similarity > 0.99 && similarity < 1.0);
    }

    #[test]
    fn below_threshold_is_a_miss() {
        let store = MemoryStore::new(100);
        store.insert(entry_with(
            "p1",
            fp(1),
            "m",
            Duration::from_secs(60),
            Some(vec![1.0, 0.0]),
        ));

        assert!(store
            .lookup_semantic("p1", Endpoint::Chat, "m", &[1.0, 1.0], 0.92)
            .is_none());
    }

    #[test]
    fn capacity_eviction_is_lru_by_last_hit() {
        let store = MemoryStore::new(2);
        store.insert(entry_with("p1", fp(1), "m", Duration::from_secs(60), None));
        std::thread::sleep(Duration::from_millis(5));
        store.insert(entry_with("p1", fp(2), "m", Duration::from_secs(60), None));

        // Touch the older entry so fp(2) becomes the LRU victim.
        std::thread::sleep(Duration::from_millis(5));
        store.lookup_exact("p1", &fp(1)).unwrap().record_hit();

        store.insert(entry_with("p1", fp(3), "m", Duration::from_secs(60), None));
        assert!(store.lookup_exact("p1", &fp(1)).is_some());
        assert!(store.lookup_exact("p1", &fp(2)).is_none());
        assert!(store.lookup_exact("p1", &fp(3)).is_some());
    }

    #[test]
    fn purge_expired_sweeps_entries_and_vectors() {
        let store = MemoryStore::new(100);
        store.insert(entry_with(
            "p1",
            fp(1),
            "m",
            Duration::from_millis(0),
            Some(vec![1.0, 0.0]),
        ));
        store.insert(entry_with("p1", fp(2), "m", Duration::from_secs(60), None));

        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(store.purge_expired(), 1);
        assert_eq!(store.len(), 1);
    }
}
