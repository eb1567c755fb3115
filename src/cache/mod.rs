mod embedding;
mod entry;
mod store;
mod vector_index;

pub use embedding::EmbeddingClient;
pub use entry::{CacheEntry, CachePayload, ResponseKind, TranscriptChunk};
pub use store::{CacheStore, MemoryStore};
pub use vector_index::cosine_similarity;
