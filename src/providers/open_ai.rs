//! OpenAI-compatible provider adapter.
//!
//! Covers OpenAI itself plus any endpoint speaking the same dialect (Groq,
//! self-hosted gateways); the only differences are the base URL and the
//! credential. Requests and responses pass through in canonical form, so
//! translation is a no-op; this adapter's job is auth, error
//! classification, and stream plumbing.

use std::{collections::HashMap, time::Duration};

use async_trait::async_trait;
use futures_util::StreamExt;

use super::{Provider, ProviderError, ProviderResponse, parse_retry_after};
use crate::{
    api_types::{CreateChatCompletionPayload, CreateCompletionPayload, CreateEmbeddingPayload},
    config::OpenAiProviderConfig,
};

pub struct OpenAICompatibleProvider {
    name: String,
    base_url: String,
    api_key: Option<String>,
    headers: HashMap<String, String>,
    timeout: Duration,
}

impl OpenAICompatibleProvider {
    pub fn from_config(
        name: &str,
        config: &OpenAiProviderConfig,
        credential_override: Option<&str>,
    ) -> Self {
        Self {
            name: name.to_string(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: credential_override
                .map(String::from)
                .or_else(|| config.api_key.clone()),
            headers: config.headers.clone(),
            timeout: Duration::from_secs(config.timeout_secs),
        }
    }

    fn build_request(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        let request = if let Some(api_key) = &self.api_key {
            request.header(
                reqwest::header::AUTHORIZATION,
                format!("Bearer {}", api_key),
            )
        } else {
            request
        };

        self.headers
            .iter()
            .fold(request, |req, (key, value)| {
                req.header(key.as_str(), value.as_str())
            })
            .timeout(self.timeout)
    }

    async fn execute(
        &self,
        client: &reqwest::Client,
        path: &str,
        body: serde_json::Value,
        stream: bool,
    ) -> Result<ProviderResponse, ProviderError> {
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .build_request(client.post(&url))
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = parse_retry_after(response.headers());
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::from_status(
                status.as_u16(),
                &body,
                retry_after,
            ));
        }

        if stream {
            let byte_stream = response
                .bytes_stream()
                .map(|chunk| chunk.map_err(ProviderError::from));
            Ok(ProviderResponse::Stream(Box::pin(byte_stream)))
        } else {
            let content_type = response
                .headers()
                .get(reqwest::header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("application/json")
                .to_string();
            let body = response.bytes().await?;
            Ok(ProviderResponse::Unary { body, content_type })
        }
    }
}

#[async_trait]
impl Provider for OpenAICompatibleProvider {
    fn name(&self) -> &str {
        &self.name
    }

    #[tracing::instrument(
        skip(self, client, payload),
        fields(provider = %self.name, stream = payload.stream)
    )]
    async fn chat_completion(
        &self,
        client: &reqwest::Client,
        payload: CreateChatCompletionPayload,
    ) -> Result<ProviderResponse, ProviderError> {
        let stream = payload.stream;
        let mut body = serde_json::to_value(&payload)
            .map_err(|e| ProviderError::InvalidRequest(e.to_string()))?;

        // Ask for usage in the final chunk so accounting has exact token
        // counts on the streaming path.
        if stream && payload.stream_options.is_none() {
            body["stream_options"] = serde_json::json!({ "include_usage": true });
        }

        self.execute(client, "/chat/completions", body, stream).await
    }

    #[tracing::instrument(skip(self, client, payload), fields(provider = %self.name))]
    async fn completion(
        &self,
        client: &reqwest::Client,
        payload: CreateCompletionPayload,
    ) -> Result<ProviderResponse, ProviderError> {
        let stream = payload.stream;
        let body = serde_json::to_value(&payload)
            .map_err(|e| ProviderError::InvalidRequest(e.to_string()))?;
        self.execute(client, "/completions", body, stream).await
    }

    #[tracing::instrument(skip(self, client, payload), fields(provider = %self.name))]
    async fn embeddings(
        &self,
        client: &reqwest::Client,
        payload: CreateEmbeddingPayload,
    ) -> Result<ProviderResponse, ProviderError> {
        let body = serde_json::to_value(&payload)
            .map_err(|e| ProviderError::InvalidRequest(e.to_string()))?;
        self.execute(client, "/embeddings", body, false).await
    }
}

#[cfg(test)]
mod tests {
    use wiremock::{
        Mock, MockServer, ResponseTemplate,
        matchers::{header, method, path},
    };

    use super::*;

    fn provider_for(url: &str) -> OpenAICompatibleProvider {
        OpenAICompatibleProvider::from_config(
            "openai",
            &OpenAiProviderConfig {
                base_url: url.to_string(),
                api_key: Some("sk-static".to_string()),
                headers: HashMap::new(),
                timeout_secs: 5,
            },
            None,
        )
    }

    fn chat_payload() -> CreateChatCompletionPayload {
        serde_json::from_str(
            r#"{"model":"gpt-4o-mini","messages":[{"role":"user","content":"Say hello."}]}"#,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn unary_chat_passes_through() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(header("authorization", "Bearer sk-static"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id": "chatcmpl-1",
                "object": "chat.completion",
                "choices": [{"index": 0, "message": {"role": "assistant", "content": "Hello!"},
                             "finish_reason": "stop"}],
                "usage": {"prompt_tokens": 9, "completion_tokens": 2, "total_tokens": 11}
            })))
            .mount(&server)
            .await;

        let provider = provider_for(&server.uri());
        let response = provider
            .chat_completion(&reqwest::Client::new(), chat_payload())
            .await
            .unwrap();

        let ProviderResponse::Unary { body, .. } = response else {
            panic!("expected unary response");
        };
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["choices"][0]["message"]["content"], "Hello!");
    }

    #[tokio::test]
    async fn project_credential_overrides_static_key() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/embeddings"))
            .and(header("authorization", "Bearer sk-project"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "object": "list", "data": [], "model": "text-embedding-3-small"
            })))
            .mount(&server)
            .await;

        let provider = OpenAICompatibleProvider::from_config(
            "openai",
            &OpenAiProviderConfig {
                base_url: server.uri(),
                api_key: Some("sk-static".to_string()),
                headers: HashMap::new(),
                timeout_secs: 5,
            },
            Some("sk-project"),
        );

        let payload: CreateEmbeddingPayload =
            serde_json::from_str(r#"{"model":"text-embedding-3-small","input":"hi"}"#).unwrap();
        provider
            .embeddings(&reqwest::Client::new(), payload)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn upstream_429_is_classified_with_retry_after() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(
                ResponseTemplate::new(429)
                    .insert_header("retry-after", "21")
                    .set_body_json(serde_json::json!({
                        "error": {"message": "rate limited", "type": "rate_limit_error"}
                    })),
            )
            .mount(&server)
            .await;

        let provider = provider_for(&server.uri());
        let err = provider
            .chat_completion(&reqwest::Client::new(), chat_payload())
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            ProviderError::RateLimited {
                retry_after: Some(21),
                ..
            }
        ));
    }

    #[tokio::test]
    async fn upstream_401_is_auth() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(401).set_body_json(serde_json::json!({
                "error": {"message": "bad key", "type": "invalid_api_key"}
            })))
            .mount(&server)
            .await;

        let provider = provider_for(&server.uri());
        let err = provider
            .chat_completion(&reqwest::Client::new(), chat_payload())
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::Auth(_)));
    }

    #[tokio::test]
    async fn streaming_chat_returns_the_raw_sse_stream() {
        use futures_util::StreamExt;

        let sse = "data: {\"choices\":[{\"delta\":{\"content\":\"Hi\"}}]}\n\ndata: [DONE]\n\n";
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/event-stream")
                    .set_body_string(sse),
            )
            .mount(&server)
            .await;

        let provider = provider_for(&server.uri());
        let mut payload = chat_payload();
        payload.stream = true;

        let response = provider
            .chat_completion(&reqwest::Client::new(), payload)
            .await
            .unwrap();
        let ProviderResponse::Stream(mut stream) = response else {
            panic!("expected stream response");
        };

        let mut collected = Vec::new();
        while let Some(chunk) = stream.next().await {
            collected.extend_from_slice(&chunk.unwrap());
        }
        let text = String::from_utf8(collected).unwrap();
        assert!(text.contains("data: [DONE]"));
    }
}
