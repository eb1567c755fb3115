//! Request-level error taxonomy and the OpenAI-compatible error body.
//!
//! Every failure a client can observe maps to one of the kinds below. Errors
//! from upstream providers are surfaced, not retried; the caller decides.

use axum::{
    Json,
    http::{HeaderValue, StatusCode},
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};

use crate::observability::metrics;

/// Standard error response body.
///
/// OpenAI error format: `{"error": {"type": "...", "message": "...", "param": ..., "code": ...}}`
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: ErrorInfo,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorInfo {
    /// Error type classification (e.g. "invalid_request_error", "rate_limit_error")
    #[serde(rename = "type")]
    pub error_type: String,
    /// Human-readable error message
    pub message: String,
    /// Parameter that caused the error (null if not applicable)
    pub param: Option<String>,
    /// Machine-readable error code
    pub code: Option<String>,
}

impl ErrorResponse {
    pub fn new(error_type: &str, code: &str, message: impl Into<String>) -> Self {
        Self {
            error: ErrorInfo {
                error_type: error_type.to_string(),
                message: message.into(),
                param: None,
                code: Some(code.to_string()),
            },
        }
    }
}

/// Externally-visible error kinds.
///
/// The string forms are stable: they appear in response bodies, telemetry
/// events, and metrics labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    BadRequest,
    Unauthenticated,
    Forbidden,
    RateLimited,
    UpstreamRateLimited,
    UpstreamAuth,
    UpstreamInvalid,
    UpstreamUnavailable,
    Timeout,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BadRequest => "bad_request",
            Self::Unauthenticated => "unauthenticated",
            Self::Forbidden => "forbidden",
            Self::RateLimited => "rate_limited",
            Self::UpstreamRateLimited => "upstream_rate_limited",
            Self::UpstreamAuth => "upstream_auth",
            Self::UpstreamInvalid => "upstream_invalid",
            Self::UpstreamUnavailable => "upstream_unavailable",
            Self::Timeout => "timeout",
            Self::Internal => "internal",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            Self::BadRequest => StatusCode::BAD_REQUEST,
            Self::Unauthenticated => StatusCode::UNAUTHORIZED,
            Self::Forbidden => StatusCode::FORBIDDEN,
            Self::RateLimited | Self::UpstreamRateLimited => StatusCode::TOO_MANY_REQUESTS,
            Self::UpstreamAuth | Self::UpstreamInvalid => StatusCode::BAD_GATEWAY,
            Self::UpstreamUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            Self::Timeout => StatusCode::GATEWAY_TIMEOUT,
            Self::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_type(&self) -> &'static str {
        match self {
            Self::BadRequest => "invalid_request_error",
            Self::Unauthenticated => "authentication_error",
            Self::Forbidden => "permission_error",
            Self::RateLimited | Self::UpstreamRateLimited => "rate_limit_error",
            Self::UpstreamAuth
            | Self::UpstreamInvalid
            | Self::UpstreamUnavailable
            | Self::Timeout
            | Self::Internal => "server_error",
        }
    }
}

/// A request-terminating error, carrying everything needed to render the
/// response and attribute the failure in telemetry.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct ApiError {
    pub kind: ErrorKind,
    pub message: String,
    /// Seconds the client should wait before retrying (rate limit errors).
    pub retry_after: Option<u64>,
}

impl ApiError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::BadRequest, message)
    }

    pub fn unauthenticated() -> Self {
        Self::new(ErrorKind::Unauthenticated, "Invalid or missing API key")
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Forbidden, message)
    }

    pub fn rate_limited(message: impl Into<String>, retry_after: u64) -> Self {
        Self {
            kind: ErrorKind::RateLimited,
            message: message.into(),
            retry_after: Some(retry_after),
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }

    pub fn with_retry_after(mut self, secs: u64) -> Self {
        self.retry_after = Some(secs);
        self
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        metrics::record_request_error(self.kind.as_str());

        let body = ErrorResponse::new(self.kind.error_type(), self.kind.as_str(), &self.message);
        let mut response = (self.kind.status(), Json(body)).into_response();

        if let Some(retry_after) = self.retry_after
            && let Ok(value) = HeaderValue::try_from(retry_after.to_string())
        {
            response.headers_mut().insert("Retry-After", value);
        }

        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_strings_are_stable() {
        assert_eq!(ErrorKind::BadRequest.as_str(), "bad_request");
        assert_eq!(ErrorKind::UpstreamRateLimited.as_str(), "upstream_rate_limited");
        assert_eq!(ErrorKind::Timeout.as_str(), "timeout");
    }

    #[test]
    fn status_mapping_follows_taxonomy() {
        assert_eq!(ErrorKind::BadRequest.status(), StatusCode::BAD_REQUEST);
        assert_eq!(ErrorKind::Unauthenticated.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(ErrorKind::Forbidden.status(), StatusCode::FORBIDDEN);
        assert_eq!(ErrorKind::RateLimited.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(ErrorKind::UpstreamAuth.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(ErrorKind::Timeout.status(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(ErrorKind::Internal.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn rate_limited_response_carries_retry_after() {
        let response = ApiError::rate_limited("slow down", 17).into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(
            response.headers().get("Retry-After").unwrap(),
            &HeaderValue::from_static("17")
        );
    }

    #[test]
    fn error_body_is_openai_shaped() {
        let body = ErrorResponse::new("rate_limit_error", "rate_limited", "too many requests");
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["error"]["type"], "rate_limit_error");
        assert_eq!(json["error"]["code"], "rate_limited");
        assert_eq!(json["error"]["message"], "too many requests");
    }
}
