//! Shared harness: a proxy wired to wiremock upstreams.

use axum::{Router, body::Body, response::Response};
use http::Request;
use tower::util::ServiceExt;
use wiremock::MockServer;

use crate::{AppState, config::ProxyConfig, routes};

pub const TOKEN: &str = "wl-test-token";
pub const PROJECT: &str = "p1";

pub struct TestProxy {
    pub router: Router,
    pub state: AppState,
    pub upstream: MockServer,
    pub embedder: Option<MockServer>,
}

impl TestProxy {
    /// Proxy with one OpenAI-compatible upstream, no embedding endpoint
    /// (exact-match only), free-plan project.
    pub async fn new() -> Self {
        Self::with_options(TestOptions::default()).await
    }

    pub async fn with_options(options: TestOptions) -> Self {
        let upstream = MockServer::start().await;
        let embedder = if options.embedding {
            Some(MockServer::start().await)
        } else {
            None
        };

        let embedding_section = match &embedder {
            Some(server) => format!(
                r#"
                [embedding]
                endpoint = "{}"
                model = "text-embedding-3-small"
                dimensions = 3
                deadline_ms = 2000
                "#,
                server.uri()
            ),
            None => String::new(),
        };

        let toml = format!(
            r#"
            [cache]
            enabled = true
            ttl_secs = {ttl}

            [cache.semantic]
            enabled = {semantic}
            default_threshold = 0.92

            {embedding_section}

            [providers.openai]
            type = "open_ai"
            base_url = "{upstream}"
            api_key = "sk-upstream"

            [routing]
            default_provider = "openai"

            [[registry.projects]]
            token = "{token}"
            id = "{project}"
            plan = "free"
            per_minute_limit = {per_minute}
            similarity_threshold = 0.92

            [[registry.projects]]
            token = "wl-suspended"
            id = "p-suspended"
            suspended = true
            "#,
            ttl = options.ttl_secs,
            semantic = options.embedding,
            embedding_section = embedding_section,
            upstream = upstream.uri(),
            token = TOKEN,
            project = PROJECT,
            per_minute = options.per_minute_limit,
        );

        let config = ProxyConfig::from_toml(&toml).expect("test config parses");
        let state = AppState::new(config).expect("state builds");
        let router = routes::build_router(state.clone());

        Self {
            router,
            state,
            upstream,
            embedder,
        }
    }

    pub async fn post(&self, path: &str, token: Option<&str>, body: &str) -> Response {
        let mut builder = Request::builder()
            .method("POST")
            .uri(path)
            .header("content-type", "application/json");
        if let Some(token) = token {
            builder = builder.header("authorization", format!("Bearer {}", token));
        }
        let request = builder.body(Body::from(body.to_string())).unwrap();
        self.router.clone().oneshot(request).await.unwrap()
    }

    pub async fn get(&self, path: &str, token: Option<&str>) -> Response {
        let mut builder = Request::builder().method("GET").uri(path);
        if let Some(token) = token {
            builder = builder.header("authorization", format!("Bearer {}", token));
        }
        let request = builder.body(Body::empty()).unwrap();
        self.router.clone().oneshot(request).await.unwrap()
    }

    /// Wait for the detached leader task to finish its cache insert.
    pub async fn wait_for_cache_entries(&self, count: usize) {
        for _ in 0..100 {
            if self.state.store.len() >= count {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        panic!(
            "cache never reached {} entries (has {})",
            count,
            self.state.store.len()
        );
    }
}

pub struct TestOptions {
    pub embedding: bool,
    pub per_minute_limit: u32,
    pub ttl_secs: u64,
}

impl Default for TestOptions {
    fn default() -> Self {
        Self {
            embedding: false,
            per_minute_limit: 600,
            ttl_secs: 3600,
        }
    }
}

pub async fn body_bytes(response: Response) -> Vec<u8> {
    axum::body::to_bytes(response.into_body(), 16 * 1024 * 1024)
        .await
        .unwrap()
        .to_vec()
}

pub async fn body_json(response: Response) -> serde_json::Value {
    serde_json::from_slice(&body_bytes(response).await).unwrap()
}

pub fn header<'a>(response: &'a Response, name: &str) -> Option<&'a str> {
    response.headers().get(name).and_then(|v| v.to_str().ok())
}

/// Standard unary chat completion body for mocks.
pub fn chat_completion_body(content: &str) -> serde_json::Value {
    serde_json::json!({
        "id": "chatcmpl-test",
        "object": "chat.completion",
        "created": 1700000000,
        "model": "gpt-4o-mini",
        "choices": [{
            "index": 0,
            "message": {"role": "assistant", "content": content, "refusal": null},
            "logprobs": null,
            "finish_reason": "stop"
        }],
        "usage": {"prompt_tokens": 9, "completion_tokens": 4, "total_tokens": 13}
    })
}

/// A unit-norm embedding response; cosine against other unit vectors is
/// the dot product, which keeps similarity assertions exact.
pub fn embedding_body(vector: &[f64]) -> serde_json::Value {
    serde_json::json!({
        "object": "list",
        "data": [{"object": "embedding", "embedding": vector, "index": 0}],
        "model": "text-embedding-3-small",
        "usage": {"prompt_tokens": 6, "total_tokens": 6}
    })
}

/// An SSE transcript of `contents` chunks followed by usage and `[DONE]`.
pub fn sse_body(contents: &[&str], include_done: bool) -> String {
    let mut body = String::new();
    for (i, content) in contents.iter().enumerate() {
        let role = if i == 0 { r#""role":"assistant","# } else { "" };
        body.push_str(&format!(
            "data: {{\"id\":\"chatcmpl-test\",\"object\":\"chat.completion.chunk\",\"choices\":[{{\"index\":0,\"delta\":{{{role}\"content\":\"{content}\"}},\"finish_reason\":null}}]}}\n\n",
        ));
    }
    if include_done {
        body.push_str("data: {\"id\":\"chatcmpl-test\",\"object\":\"chat.completion.chunk\",\"choices\":[],\"usage\":{\"prompt_tokens\":9,\"completion_tokens\":20,\"total_tokens\":29}}\n\n");
        body.push_str("data: [DONE]\n\n");
    }
    body
}
