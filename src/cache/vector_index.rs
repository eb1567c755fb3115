//! Brute-force cosine index over cached prompt embeddings.
//!
//! Embeddings are partitioned by (project, endpoint, model): a lookup can
//! only ever surface candidates from its own family, which keeps the
//! project- and model-isolation invariants structural rather than filtered.

use dashmap::DashMap;

use crate::canonical::{Endpoint, Fingerprint};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct FamilyKey {
    project_id: String,
    endpoint: Endpoint,
    model: String,
}

#[derive(Debug, Clone)]
struct IndexedVector {
    fingerprint: Fingerprint,
    embedding: Vec<f32>,
    stored_at_ms: i64,
}

/// A semantic search candidate.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub fingerprint: Fingerprint,
    pub similarity: f64,
    pub stored_at_ms: i64,
}

/// In-memory ANN stand-in: exhaustive cosine scan per family. Family sizes
/// are bounded by the store's per-project entry cap, which keeps scans
/// small enough for the single-node deployment this store targets.
#[derive(Debug, Default)]
pub struct VectorIndex {
    families: DashMap<FamilyKey, Vec<IndexedVector>>,
}

impl VectorIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(
        &self,
        project_id: &str,
        endpoint: Endpoint,
        model: &str,
        fingerprint: Fingerprint,
        embedding: Vec<f32>,
        stored_at_ms: i64,
    ) {
        let key = FamilyKey {
            project_id: project_id.to_string(),
            endpoint,
            model: model.to_string(),
        };
        let mut family = self.families.entry(key).or_default();
        // Idempotent on fingerprint, matching the store's insert contract.
        if family.iter().any(|v| v.fingerprint == fingerprint) {
            return;
        }
        family.push(IndexedVector {
            fingerprint,
            embedding,
            stored_at_ms,
        });
    }

    /// Return every candidate at or above `threshold`, ordered best-first.
    ///
    /// Ties within `epsilon` are broken toward the most recently stored
    /// entry. The caller re-validates each candidate against the store
    /// (the entry may have expired after the vector was indexed).
    pub fn search(
        &self,
        project_id: &str,
        endpoint: Endpoint,
        model: &str,
        query: &[f32],
        threshold: f64,
        epsilon: f64,
    ) -> Vec<Candidate> {
        let key = FamilyKey {
            project_id: project_id.to_string(),
            endpoint,
            model: model.to_string(),
        };
        let Some(family) = self.families.get(&key) else {
            return Vec::new();
        };

        let mut candidates: Vec<Candidate> = family
            .iter()
            .filter_map(|v| {
                let similarity = cosine_similarity(query, &v.embedding)?;
                (similarity >= threshold).then_some(Candidate {
                    fingerprint: v.fingerprint,
                    similarity,
                    stored_at_ms: v.stored_at_ms,
                })
            })
            .collect();

        candidates.sort_by(|a, b| {
            if (a.similarity - b.similarity).abs() <= epsilon {
                b.stored_at_ms.cmp(&a.stored_at_ms)
            } else {
                b.similarity
                    .partial_cmp(&a.similarity)
                    .unwrap_or(std::cmp::Ordering::Equal)
            }
        });
        candidates
    }

    pub fn remove(
        &self,
        project_id: &str,
        endpoint: Endpoint,
        model: &str,
        fingerprint: &Fingerprint,
    ) {
        let key = FamilyKey {
            project_id: project_id.to_string(),
            endpoint,
            model: model.to_string(),
        };
        if let Some(mut family) = self.families.get_mut(&key) {
            family.retain(|v| v.fingerprint != *fingerprint);
        }
    }
}

/// Cosine similarity of two vectors. `None` on dimension mismatch or a
/// zero-magnitude vector.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> Option<f64> {
    if a.len() != b.len() || a.is_empty() {
        return None;
    }

    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += f64::from(*x) * f64::from(*y);
        norm_a += f64::from(*x) * f64::from(*x);
        norm_b += f64::from(*y) * f64::from(*y);
    }

    if norm_a == 0.0 || norm_b == 0.0 {
        return None;
    }
    Some(dot / (norm_a.sqrt() * norm_b.sqrt()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fp(byte: u8) -> Fingerprint {
        Fingerprint([byte; 32])
    }

    #[test]
    fn cosine_of_identical_vectors_is_one() {
        let v = vec![0.5, 0.5, 0.1];
        let sim = cosine_similarity(&v, &v).unwrap();
        assert!((sim - 1.0).abs() < 1e-9);
    }

    #[test]
    fn cosine_of_orthogonal_vectors_is_zero() {
        let sim = cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).unwrap();
        assert!(sim.abs() < 1e-9);
    }

    #[test]
    fn cosine_rejects_mismatched_dimensions_and_zero_vectors() {
        assert!(cosine_similarity(&[1.0], &[1.0, 0.0]).is_none());
        assert!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]).is_none());
    }

    #[test]
    fn search_is_scoped_to_the_family() {
        let index = VectorIndex::new();
        index.insert("p1", Endpoint::Chat, "gpt-4o", fp(1), vec![1.0, 0.0], 1);
        index.insert("p2", Endpoint::Chat, "gpt-4o", fp(2), vec![1.0, 0.0], 2);
        index.insert("p1", Endpoint::Chat, "claude", fp(3), vec![1.0, 0.0], 3);

        let hits = index.search("p1", Endpoint::Chat, "gpt-4o", &[1.0, 0.0], 0.9, 1e-6);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].fingerprint, fp(1));
    }

    #[test]
    fn search_honors_the_threshold() {
        let index = VectorIndex::new();
        index.insert("p1", Endpoint::Chat, "m", fp(1), vec![1.0, 0.0], 1);

        // ~0.707 similarity
        let off_axis = [1.0, 1.0];
        assert!(index
            .search("p1", Endpoint::Chat, "m", &off_axis, 0.9, 1e-6)
            .is_empty());
        assert_eq!(
            index
                .search("p1", Endpoint::Chat, "m", &off_axis, 0.5, 1e-6)
                .len(),
            1
        );
    }

    #[test]
    fn ties_prefer_most_recent() {
        let index = VectorIndex::new();
        index.insert("p1", Endpoint::Chat, "m", fp(1), vec![1.0, 0.0], 100);
        index.insert("p1", Endpoint::Chat, "m", fp(2), vec![1.0, 0.0], 200);

        let hits = index.search("p1", Endpoint::Chat, "m", &[1.0, 0.0], 0.9, 1e-6);
        assert_eq!(hits[0].fingerprint, fp(2));
    }

    #[test]
    fn insert_is_idempotent_on_fingerprint() {
        let index = VectorIndex::new();
        index.insert("p1", Endpoint::Chat, "m", fp(1), vec![1.0, 0.0], 1);
        index.insert("p1", Endpoint::Chat, "m", fp(1), vec![0.0, 1.0], 2);

        let hits = index.search("p1", Endpoint::Chat, "m", &[1.0, 0.0], 0.9, 1e-6);
        assert_eq!(hits.len(), 1);
        // The first vector won.
        assert!((hits[0].similarity - 1.0).abs() < 1e-9);
    }

    #[test]
    fn remove_drops_the_vector() {
        let index = VectorIndex::new();
        index.insert("p1", Endpoint::Chat, "m", fp(1), vec![1.0, 0.0], 1);
        index.remove("p1", Endpoint::Chat, "m", &fp(1));
        assert!(index
            .search("p1", Endpoint::Chat, "m", &[1.0, 0.0], 0.5, 1e-6)
            .is_empty());
    }
}
