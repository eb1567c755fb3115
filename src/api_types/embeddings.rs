use serde::{Deserialize, Serialize};
use validator::Validate;

/// Embedding input (text or array of texts)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EmbeddingInput {
    Text(String),
    TextArray(Vec<String>),
}

impl EmbeddingInput {
    /// Flatten the input into a single text blob for hashing.
    pub fn as_text(&self) -> String {
        match self {
            EmbeddingInput::Text(t) => t.clone(),
            EmbeddingInput::TextArray(parts) => parts.join("\n"),
        }
    }
}

/// Encoding format for embeddings
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EncodingFormat {
    Float,
    Base64,
}

/// Create embedding request (OpenAI-compatible)
#[derive(Debug, Clone, Validate, Serialize, Deserialize)]
pub struct CreateEmbeddingPayload {
    /// Input to embed
    pub input: EmbeddingInput,

    /// Model to use for embedding
    pub model: String,

    /// Output encoding format
    #[serde(skip_serializing_if = "Option::is_none")]
    pub encoding_format: Option<EncodingFormat>,

    /// Number of dimensions for output embeddings
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dimensions: Option<i64>,

    /// User identifier for abuse detection
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingObjectType {
    Embedding,
}

/// Embedding vector, either raw floats or base64-packed little-endian f32s
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EmbeddingVector {
    Float(Vec<f64>),
    Base64(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingData {
    pub object: EmbeddingObjectType,
    pub embedding: EmbeddingVector,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub index: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingUsage {
    pub prompt_tokens: i64,
    pub total_tokens: i64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingResponseObjectType {
    List,
}

/// Embedding response (OpenAI-compatible)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateEmbeddingResponse {
    pub object: EmbeddingResponseObjectType,
    pub data: Vec<EmbeddingData>,
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<EmbeddingUsage>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn embedding_vector_accepts_floats_and_base64() {
        let floats: EmbeddingVector = serde_json::from_str("[0.1, 0.2]").unwrap();
        assert!(matches!(floats, EmbeddingVector::Float(_)));

        let b64: EmbeddingVector = serde_json::from_str(r#""zczMPQ==""#).unwrap();
        assert!(matches!(b64, EmbeddingVector::Base64(_)));
    }

    #[test]
    fn parses_openai_embedding_response() {
        let json = r#"{
            "object": "list",
            "data": [{"object": "embedding", "embedding": [0.0, 1.0], "index": 0}],
            "model": "text-embedding-3-small",
            "usage": {"prompt_tokens": 4, "total_tokens": 4}
        }"#;
        let response: CreateEmbeddingResponse = serde_json::from_str(json).unwrap();
        assert_eq!(response.data.len(), 1);
        assert_eq!(response.usage.unwrap().total_tokens, 4);
    }
}
