//! Request normalization and fingerprinting.
//!
//! `canonicalize` reduces an incoming OpenAI-shaped request to a canonical
//! form; `Fingerprint` is a SHA-256 over the canonical byte encoding. Two
//! semantically-equivalent inputs (whitespace, elided default parameters,
//! role capitalization) must produce bit-identical canonical bytes: any
//! non-determinism here silently fragments the cache.
//!
//! The `stream` flag is deliberately excluded from the hash so the streaming
//! and non-streaming forms of one prompt share a cache entry family.

use sha2::{Digest, Sha256};
use unicode_normalization::UnicodeNormalization;

use crate::{
    api_types::{
        CreateChatCompletionPayload, CreateCompletionPayload, CreateEmbeddingPayload, Message,
        MessageContent, ToolChoice, ToolChoiceDefaults,
        chat_completion::{ContentPart, Stop},
        completions::CompletionStop,
    },
    error::ApiError,
};

/// Version tag mixed into every fingerprint so a change to the canonical
/// encoding can never alias entries written by an older build.
const CANONICAL_VERSION: &[u8] = b"watchllm.canonical.v1";

/// Byte separating labeled fields in the canonical encoding.
const FIELD_SEP: u8 = 0x00;

/// API endpoint family. Cache entries never cross families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Endpoint {
    Chat,
    Completions,
    Embeddings,
}

impl Endpoint {
    pub fn as_str(&self) -> &'static str {
        match self {
            Endpoint::Chat => "chat",
            Endpoint::Completions => "completions",
            Endpoint::Embeddings => "embeddings",
        }
    }
}

/// 256-bit content hash over the canonical request bytes.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint(pub [u8; 32]);

impl Fingerprint {
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl std::fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Fingerprint({})", &self.to_hex()[..12])
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// Whether a request may read from and write to the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CachePolicy {
    /// Cacheable unconditionally.
    Always,
    /// Carries tool definitions with a non-"none" tool_choice: cache the
    /// response only if it contains no tool call.
    IfNoToolCall,
    /// Never cached (sampling is non-deterministic or n > 1).
    Bypass,
}

/// Normalized payload, one variant per endpoint family.
#[derive(Debug, Clone)]
pub enum CanonicalPayload {
    Chat(CreateChatCompletionPayload),
    Completion(CreateCompletionPayload),
    Embedding(CreateEmbeddingPayload),
}

/// The canonical form of an inbound request.
///
/// Owned exclusively by the handling task; forwarding, hashing, and
/// embedding all derive from this one value.
#[derive(Debug, Clone)]
pub struct CanonicalRequest {
    pub endpoint: Endpoint,
    pub model: String,
    pub stream: bool,
    pub cache_policy: CachePolicy,
    pub payload: CanonicalPayload,
}

impl CanonicalRequest {
    /// Compute the fingerprint over the canonical byte encoding.
    pub fn fingerprint(&self) -> Fingerprint {
        let mut hasher = Sha256::new();
        hasher.update(CANONICAL_VERSION);
        hasher.update([FIELD_SEP]);
        hasher.update(self.endpoint.as_str().as_bytes());
        hasher.update([FIELD_SEP]);
        hasher.update(self.model.as_bytes());
        hasher.update([FIELD_SEP]);

        match &self.payload {
            CanonicalPayload::Chat(payload) => hash_chat(&mut hasher, payload),
            CanonicalPayload::Completion(payload) => hash_completion(&mut hasher, payload),
            CanonicalPayload::Embedding(payload) => hash_embedding(&mut hasher, payload),
        }

        Fingerprint(hasher.finalize().into())
    }

    /// Prompt-only projection fed to the embedding provider: system and user
    /// content concatenated, tool results excluded.
    pub fn prompt_text(&self) -> String {
        match &self.payload {
            CanonicalPayload::Chat(payload) => {
                let mut parts = Vec::new();
                for message in &payload.messages {
                    let text = match message {
                        Message::System { content, .. }
                        | Message::Developer { content, .. }
                        | Message::User { content, .. } => content.as_text(),
                        Message::Assistant { .. } | Message::Tool { .. } => continue,
                    };
                    if !text.is_empty() {
                        parts.push(format!("{}: {}", message.role(), text));
                    }
                }
                parts.join("\n")
            }
            CanonicalPayload::Completion(payload) => payload.prompt.as_text(),
            CanonicalPayload::Embedding(payload) => payload.input.as_text(),
        }
    }
}

/// Normalize a chat completion request.
///
/// Trims trailing whitespace in message content, NFC-normalizes text,
/// rejects empty message lists and missing models, and bounds the total
/// content size. Parameters equal to documented defaults are elided from
/// the hash input (not from the forwarded payload).
pub fn canonicalize_chat(
    mut payload: CreateChatCompletionPayload,
    max_content_bytes: usize,
) -> Result<CanonicalRequest, ApiError> {
    let model = payload
        .model
        .clone()
        .ok_or_else(|| ApiError::bad_request("missing required field: model"))?;
    if payload.messages.is_empty() {
        return Err(ApiError::bad_request("messages must not be empty"));
    }

    let mut total = 0usize;
    for message in &mut payload.messages {
        match message {
            Message::System { content, .. }
            | Message::User { content, .. }
            | Message::Tool { content, .. }
            | Message::Developer { content, .. } => {
                normalize_content(content, &mut total);
            }
            Message::Assistant { content, .. } => {
                if let Some(content) = content {
                    normalize_content(content, &mut total);
                }
            }
        }
    }
    if total > max_content_bytes {
        return Err(ApiError::bad_request(format!(
            "message content exceeds the {} byte limit",
            max_content_bytes
        )));
    }

    let cache_policy = chat_cache_policy(&payload);
    let stream = payload.stream;

    Ok(CanonicalRequest {
        endpoint: Endpoint::Chat,
        model,
        stream,
        cache_policy,
        payload: CanonicalPayload::Chat(payload),
    })
}

/// Normalize a legacy completion request.
pub fn canonicalize_completion(
    mut payload: CreateCompletionPayload,
    max_content_bytes: usize,
) -> Result<CanonicalRequest, ApiError> {
    let model = payload
        .model
        .clone()
        .ok_or_else(|| ApiError::bad_request("missing required field: model"))?;

    payload.prompt = match payload.prompt {
        crate::api_types::CompletionPrompt::Text(t) => {
            crate::api_types::CompletionPrompt::Text(normalize_text(&t))
        }
        crate::api_types::CompletionPrompt::TextArray(parts) => {
            crate::api_types::CompletionPrompt::TextArray(
                parts.iter().map(|p| normalize_text(p)).collect(),
            )
        }
    };
    let prompt_len = payload.prompt.as_text().len();
    if prompt_len == 0 {
        return Err(ApiError::bad_request("prompt must not be empty"));
    }
    if prompt_len > max_content_bytes {
        return Err(ApiError::bad_request(format!(
            "prompt exceeds the {} byte limit",
            max_content_bytes
        )));
    }

    let explicit_temp = payload.temperature.is_some_and(|t| t > 0.0);
    let multi = payload.n.is_some_and(|n| n > 1);
    let cache_policy = if explicit_temp || multi {
        CachePolicy::Bypass
    } else {
        CachePolicy::Always
    };
    let stream = payload.stream;

    Ok(CanonicalRequest {
        endpoint: Endpoint::Completions,
        model,
        stream,
        cache_policy,
        payload: CanonicalPayload::Completion(payload),
    })
}

/// Normalize an embeddings request. Embeddings are deterministic, so they
/// are always cacheable (exact-match only; they are never semantically
/// matched against chat entries).
pub fn canonicalize_embedding(
    mut payload: CreateEmbeddingPayload,
    max_content_bytes: usize,
) -> Result<CanonicalRequest, ApiError> {
    if payload.model.is_empty() {
        return Err(ApiError::bad_request("missing required field: model"));
    }

    payload.input = match payload.input {
        crate::api_types::EmbeddingInput::Text(t) => {
            crate::api_types::EmbeddingInput::Text(normalize_text(&t))
        }
        crate::api_types::EmbeddingInput::TextArray(parts) => {
            crate::api_types::EmbeddingInput::TextArray(
                parts.iter().map(|p| normalize_text(p)).collect(),
            )
        }
    };
    let input_len = payload.input.as_text().len();
    if input_len == 0 {
        return Err(ApiError::bad_request("input must not be empty"));
    }
    if input_len > max_content_bytes {
        return Err(ApiError::bad_request(format!(
            "input exceeds the {} byte limit",
            max_content_bytes
        )));
    }

    let model = payload.model.clone();
    Ok(CanonicalRequest {
        endpoint: Endpoint::Embeddings,
        model,
        stream: false,
        cache_policy: CachePolicy::Always,
        payload: CanonicalPayload::Embedding(payload),
    })
}

/// Cache policy from the raw (pre-elision) parameter values. An explicit
/// positive temperature or n > 1 makes sampling non-deterministic; tool
/// definitions defer the decision to the response unless tool_choice is
/// "none".
fn chat_cache_policy(payload: &CreateChatCompletionPayload) -> CachePolicy {
    if payload.temperature.is_some_and(|t| t > 0.0) || payload.n.is_some_and(|n| n > 1) {
        return CachePolicy::Bypass;
    }

    let has_tools = payload.tools.as_ref().is_some_and(|t| !t.is_empty());
    if has_tools {
        let choice_is_none = matches!(
            payload.tool_choice,
            Some(ToolChoice::String(ToolChoiceDefaults::None))
        );
        if !choice_is_none {
            return CachePolicy::IfNoToolCall;
        }
    }

    CachePolicy::Always
}

fn normalize_content(content: &mut MessageContent, total: &mut usize) {
    match content {
        MessageContent::Text(text) => {
            *text = normalize_text(text);
            *total += text.len();
        }
        MessageContent::Parts(parts) => {
            for part in parts {
                match part {
                    ContentPart::Text { text } => {
                        *text = normalize_text(text);
                        *total += text.len();
                    }
                    ContentPart::ImageUrl { image_url } => {
                        *total += image_url.url.len();
                    }
                }
            }
        }
    }
}

/// NFC-normalize and strip trailing whitespace.
fn normalize_text(text: &str) -> String {
    text.trim_end().nfc().collect()
}

// ─────────────────────────────────────────────────────────────────────────────
// Canonical byte encoding
// ─────────────────────────────────────────────────────────────────────────────

fn hash_field(hasher: &mut Sha256, label: &[u8], value: &[u8]) {
    hasher.update(label);
    hasher.update(b":");
    hasher.update(value);
    hasher.update([FIELD_SEP]);
}

/// Hash an optional f64 parameter, eliding it when equal to the documented
/// default so an explicit default and an absent field encode identically.
fn hash_param_f64(hasher: &mut Sha256, label: &[u8], value: Option<f64>, default: f64) {
    if let Some(v) = value
        && v != default
    {
        hash_field(hasher, label, &v.to_le_bytes());
    }
}

fn hash_chat(hasher: &mut Sha256, payload: &CreateChatCompletionPayload) {
    hash_param_f64(hasher, b"temp", payload.temperature, 1.0);
    hash_param_f64(hasher, b"top_p", payload.top_p, 1.0);
    hash_param_f64(hasher, b"freq_pen", payload.frequency_penalty, 0.0);
    hash_param_f64(hasher, b"pres_pen", payload.presence_penalty, 0.0);

    if let Some(n) = payload.n
        && n != 1
    {
        hash_field(hasher, b"n", &n.to_le_bytes());
    }
    if let Some(max) = payload.max_completion_tokens.or(payload.max_tokens) {
        hash_field(hasher, b"max_tokens", &max.to_le_bytes());
    }
    if let Some(seed) = payload.seed {
        hash_field(hasher, b"seed", &seed.to_le_bytes());
    }
    if let Some(stop) = &payload.stop {
        let stops: Vec<&str> = match stop {
            Stop::Single(s) => vec![s.as_str()],
            Stop::Multiple(all) => all.iter().map(String::as_str).collect(),
        };
        hash_field(hasher, b"stop", stops.join("\x1f").as_bytes());
    }
    if let Some(format) = &payload.response_format
        && let Ok(json) = serde_json::to_string(format)
    {
        hash_field(hasher, b"format", json.as_bytes());
    }
    if let Some(bias) = &payload.logit_bias {
        // Sorted key order so map iteration order cannot leak into the hash.
        let mut entries: Vec<_> = bias.iter().collect();
        entries.sort_by(|a, b| a.0.cmp(b.0));
        for (token, weight) in entries {
            hash_field(hasher, b"bias", token.as_bytes());
            hasher.update(weight.to_le_bytes());
        }
    }
    if let Some(tools) = &payload.tools
        && !tools.is_empty()
        && let Ok(json) = serde_json::to_string(tools)
    {
        hash_field(hasher, b"tools", json.as_bytes());
    }
    if let Some(choice) = &payload.tool_choice
        && let Ok(json) = serde_json::to_string(choice)
    {
        hash_field(hasher, b"tool_choice", json.as_bytes());
    }

    for message in &payload.messages {
        hasher.update(b"msg:");
        hasher.update(message.role().as_bytes());
        hasher.update(b"|");
        match message {
            Message::System { content, .. }
            | Message::User { content, .. }
            | Message::Developer { content, .. } => {
                hash_content(hasher, content);
            }
            Message::Assistant {
                content,
                tool_calls,
                ..
            } => {
                if let Some(content) = content {
                    hash_content(hasher, content);
                }
                if let Some(calls) = tool_calls
                    && let Ok(json) = serde_json::to_string(calls)
                {
                    hasher.update(b"calls|");
                    hasher.update(json.as_bytes());
                }
            }
            Message::Tool {
                content,
                tool_call_id,
            } => {
                hasher.update(tool_call_id.as_bytes());
                hasher.update(b"|");
                hash_content(hasher, content);
            }
        }
        hasher.update([FIELD_SEP]);
    }
}

fn hash_content(hasher: &mut Sha256, content: &MessageContent) {
    match content {
        MessageContent::Text(text) => hasher.update(text.as_bytes()),
        MessageContent::Parts(parts) => {
            for part in parts {
                match part {
                    ContentPart::Text { text } => {
                        hasher.update(b"t:");
                        hasher.update(text.as_bytes());
                    }
                    ContentPart::ImageUrl { image_url } => {
                        hasher.update(b"i:");
                        hasher.update(image_url.url.as_bytes());
                    }
                }
                hasher.update(b"\x1f");
            }
        }
    }
}

fn hash_completion(hasher: &mut Sha256, payload: &CreateCompletionPayload) {
    hash_param_f64(hasher, b"temp", payload.temperature, 1.0);
    hash_param_f64(hasher, b"top_p", payload.top_p, 1.0);
    hash_param_f64(hasher, b"freq_pen", payload.frequency_penalty, 0.0);
    hash_param_f64(hasher, b"pres_pen", payload.presence_penalty, 0.0);

    if let Some(n) = payload.n
        && n != 1
    {
        hash_field(hasher, b"n", &n.to_le_bytes());
    }
    if let Some(max) = payload.max_tokens {
        hash_field(hasher, b"max_tokens", &max.to_le_bytes());
    }
    if let Some(seed) = payload.seed {
        hash_field(hasher, b"seed", &seed.to_le_bytes());
    }
    if let Some(stop) = &payload.stop {
        let stops: Vec<&str> = match stop {
            CompletionStop::Single(s) => vec![s.as_str()],
            CompletionStop::Multiple(all) => all.iter().map(String::as_str).collect(),
        };
        hash_field(hasher, b"stop", stops.join("\x1f").as_bytes());
    }
    if let Some(suffix) = &payload.suffix {
        hash_field(hasher, b"suffix", suffix.as_bytes());
    }

    hash_field(hasher, b"prompt", payload.prompt.as_text().as_bytes());
}

fn hash_embedding(hasher: &mut Sha256, payload: &CreateEmbeddingPayload) {
    if let Some(dims) = payload.dimensions {
        hash_field(hasher, b"dims", &dims.to_le_bytes());
    }
    hash_field(hasher, b"input", payload.input.as_text().as_bytes());
}
