//! Upstream provider adapters.
//!
//! Each adapter translates the canonical OpenAI-compatible request into the
//! provider's native shape and the response back, for both unary and SSE
//! streaming flavors. Errors are classified into the externally-visible
//! taxonomy; nothing here retries.

pub mod anthropic;
pub mod open_ai;
mod router;

use std::pin::Pin;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::Stream;
pub use router::ModelRouter;

use crate::{
    api_types::{CreateChatCompletionPayload, CreateCompletionPayload, CreateEmbeddingPayload},
    config::ProviderConfig,
    error::{ApiError, ErrorKind},
};

/// A chunk stream from an upstream SSE response.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, ProviderError>> + Send>>;

/// Structured provider failure, surfaced verbatim to every waiter.
///
/// Cloneable so the coalescer can fan a single upstream failure out to all
/// attached followers.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProviderError {
    /// Provider rejected the credentials. Fatal for the project+provider.
    #[error("upstream auth rejected: {0}")]
    Auth(String),

    /// Provider returned 429; carries the upstream Retry-After when present.
    #[error("upstream rate limited: {message}")]
    RateLimited {
        message: String,
        retry_after: Option<u64>,
    },

    /// Provider rejected the translated request. Should not happen in
    /// steady state; surfaced verbatim when it does.
    #[error("upstream rejected request: {0}")]
    InvalidRequest(String),

    /// 5xx from the provider.
    #[error("upstream server error ({status}): {message}")]
    ServerError { status: u16, message: String },

    /// Transport-level failure.
    #[error("upstream network error: {0}")]
    Network(String),

    /// The proxy's own end-to-end deadline elapsed.
    #[error("deadline exceeded after {0} seconds")]
    DeadlineExceeded(u64),
}

impl ProviderError {
    /// Classify an HTTP error status plus body into a taxonomy entry.
    pub fn from_status(status: u16, body: &str, retry_after: Option<u64>) -> Self {
        let message = extract_error_message(body);
        match status {
            401 | 403 => ProviderError::Auth(message),
            429 => ProviderError::RateLimited {
                message,
                retry_after,
            },
            400 | 404 | 422 => ProviderError::InvalidRequest(message),
            _ if status >= 500 => ProviderError::ServerError { status, message },
            _ => ProviderError::ServerError { status, message },
        }
    }

    pub fn into_api_error(self) -> ApiError {
        match self {
            ProviderError::Auth(message) => ApiError::new(ErrorKind::UpstreamAuth, message),
            ProviderError::RateLimited {
                message,
                retry_after,
            } => {
                let mut error = ApiError::new(ErrorKind::UpstreamRateLimited, message);
                error.retry_after = retry_after;
                error
            }
            ProviderError::InvalidRequest(message) => {
                ApiError::new(ErrorKind::UpstreamInvalid, message)
            }
            ProviderError::ServerError { status, message } => ApiError::new(
                ErrorKind::UpstreamUnavailable,
                format!("provider returned {}: {}", status, message),
            ),
            ProviderError::Network(message) => {
                ApiError::new(ErrorKind::UpstreamUnavailable, message)
            }
            ProviderError::DeadlineExceeded(secs) => ApiError::timeout(format!(
                "request did not complete within the {}s deadline",
                secs
            )),
        }
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(error: reqwest::Error) -> Self {
        if error.is_timeout() {
            ProviderError::Network(format!("request timed out: {}", error))
        } else {
            ProviderError::Network(error.to_string())
        }
    }
}

/// Pull the human-readable message out of an OpenAI- or Anthropic-shaped
/// error body, falling back to the raw body.
fn extract_error_message(body: &str) -> String {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| {
            v.pointer("/error/message")
                .and_then(|m| m.as_str())
                .map(String::from)
        })
        .unwrap_or_else(|| {
            if body.is_empty() {
                "(empty body)".to_string()
            } else {
                body.chars().take(512).collect()
            }
        })
}

/// Parse a Retry-After header value (delta-seconds form only).
pub(crate) fn parse_retry_after(headers: &reqwest::header::HeaderMap) -> Option<u64> {
    headers
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse()
        .ok()
}

/// A successful upstream response in canonical OpenAI-compatible form.
pub enum ProviderResponse {
    /// Complete JSON body.
    Unary { body: Bytes, content_type: String },
    /// SSE chunk stream, already translated to OpenAI chunk framing.
    Stream(ByteStream),
}

impl std::fmt::Debug for ProviderResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unary { body, content_type } => f
                .debug_struct("Unary")
                .field("body", body)
                .field("content_type", content_type)
                .finish(),
            Self::Stream(_) => f.debug_tuple("Stream").field(&"..").finish(),
        }
    }
}

/// Uniform provider surface: chat, legacy completions, and embeddings,
/// each unary or streaming per the payload's `stream` flag.
#[async_trait]
pub trait Provider: Send + Sync {
    fn name(&self) -> &str;

    async fn chat_completion(
        &self,
        client: &reqwest::Client,
        payload: CreateChatCompletionPayload,
    ) -> Result<ProviderResponse, ProviderError>;

    async fn completion(
        &self,
        client: &reqwest::Client,
        payload: CreateCompletionPayload,
    ) -> Result<ProviderResponse, ProviderError>;

    async fn embeddings(
        &self,
        client: &reqwest::Client,
        payload: CreateEmbeddingPayload,
    ) -> Result<ProviderResponse, ProviderError>;
}

/// Construct the adapter for a configured provider, applying a per-project
/// credential override when the registry carries one.
pub fn build_provider(
    name: &str,
    config: &ProviderConfig,
    credential_override: Option<&str>,
) -> Box<dyn Provider> {
    match config {
        ProviderConfig::OpenAi(cfg) => Box::new(open_ai::OpenAICompatibleProvider::from_config(
            name,
            cfg,
            credential_override,
        )),
        ProviderConfig::Anthropic(cfg) => Box::new(anthropic::AnthropicProvider::from_config(
            name,
            cfg,
            credential_override,
        )),
    }
}
