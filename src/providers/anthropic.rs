//! Anthropic Messages API adapter.
//!
//! Translates the canonical OpenAI-compatible request into Anthropic's
//! native shape (system messages merge into the top-level `system` field,
//! unsupported parameters are stripped, tool definitions are renamed) and
//! translates both unary responses and SSE streams back into the
//! OpenAI-compatible shape clients expect.

use std::{
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use serde::{Deserialize, Serialize};

use super::{Provider, ProviderError, ProviderResponse, parse_retry_after};
use crate::{
    api_types::{
        CreateChatCompletionPayload, CreateCompletionPayload, CreateEmbeddingPayload, Message,
        MessageContent, ToolChoice, ToolChoiceDefaults, ToolDefinition,
        chat_completion::Stop,
    },
    config::AnthropicProviderConfig,
};

pub struct AnthropicProvider {
    name: String,
    base_url: String,
    api_key: Option<String>,
    version: String,
    default_max_tokens: u64,
    timeout: Duration,
}

impl AnthropicProvider {
    pub fn from_config(
        name: &str,
        config: &AnthropicProviderConfig,
        credential_override: Option<&str>,
    ) -> Self {
        Self {
            name: name.to_string(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: credential_override
                .map(String::from)
                .or_else(|| config.api_key.clone()),
            version: config.version.clone(),
            default_max_tokens: config.default_max_tokens,
            timeout: Duration::from_secs(config.timeout_secs),
        }
    }

    fn build_request(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        let request = if let Some(api_key) = &self.api_key {
            request.header("x-api-key", api_key.as_str())
        } else {
            request
        };
        request
            .header("anthropic-version", self.version.as_str())
            .timeout(self.timeout)
    }

    async fn send_messages(
        &self,
        client: &reqwest::Client,
        request: MessagesRequest,
    ) -> Result<reqwest::Response, ProviderError> {
        let url = format!("{}/v1/messages", self.base_url);
        let response = self
            .build_request(client.post(&url))
            .json(&request)
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
        Ok(response)
    }
}

#[async_trait]
impl Provider for AnthropicProvider {
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
        let request = convert_chat_request(payload, self.default_max_tokens)?;
        let response = self.send_messages(client, request).await?;

        if stream {
            let inner = response
                .bytes_stream()
                .map(|chunk| chunk.map_err(ProviderError::from));
            let transformed = MessagesToOpenAIStream::new(Box::pin(inner));
            Ok(ProviderResponse::Stream(Box::pin(transformed)))
        } else {
            let body = response.bytes().await?;
            let parsed: MessagesResponse = serde_json::from_slice(&body).map_err(|e| {
                ProviderError::ServerError {
                    status: 200,
                    message: format!("unparseable Anthropic response: {}", e),
                }
            })?;
            let openai = convert_chat_response(parsed);
            let body = serde_json::to_vec(&openai)
                .map_err(|e| ProviderError::InvalidRequest(e.to_string()))?;
            Ok(ProviderResponse::Unary {
                body: Bytes::from(body),
                content_type: "application/json".to_string(),
            })
        }
    }

    #[tracing::instrument(skip(self, client, payload), fields(provider = %self.name))]
    async fn completion(
        &self,
        client: &reqwest::Client,
        payload: CreateCompletionPayload,
    ) -> Result<ProviderResponse, ProviderError> {
        if payload.stream {
            return Err(ProviderError::InvalidRequest(
                "streaming legacy completions are not supported for Anthropic models".to_string(),
            ));
        }

        let model = payload.model.clone().unwrap_or_default();
        let max_tokens = payload
            .max_tokens
            .and_then(|m| u64::try_from(m).ok())
            .unwrap_or(self.default_max_tokens);

        // The Messages API has no legacy-completions surface; wrap the
        // prompt as a single user turn and unwrap the text on the way out.
        let request = MessagesRequest {
            model: model.clone(),
            max_tokens,
            system: None,
            messages: vec![AnthropicMessage {
                role: "user",
                content: vec![ContentBlock::Text {
                    text: payload.prompt.as_text(),
                }],
            }],
            temperature: payload.temperature.map(clamp_temperature),
            top_p: payload.top_p,
            stop_sequences: match &payload.stop {
                Some(crate::api_types::completions::CompletionStop::Single(s)) => {
                    Some(vec![s.clone()])
                }
                Some(crate::api_types::completions::CompletionStop::Multiple(all)) => {
                    Some(all.clone())
                }
                None => None,
            },
            tools: None,
            tool_choice: None,
            stream: false,
        };

        let response = self.send_messages(client, request).await?;
        let body = response.bytes().await?;
        let parsed: MessagesResponse =
            serde_json::from_slice(&body).map_err(|e| ProviderError::ServerError {
                status: 200,
                message: format!("unparseable Anthropic response: {}", e),
            })?;

        let text: String = parsed
            .content
            .iter()
            .filter_map(|block| match block {
                ResponseContentBlock::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect();

        let openai = serde_json::json!({
            "id": parsed.id,
            "object": "text_completion",
            "created": chrono::Utc::now().timestamp(),
            "model": parsed.model,
            "choices": [{
                "text": text,
                "index": 0,
                "logprobs": null,
                "finish_reason": map_stop_reason(parsed.stop_reason.as_deref()),
            }],
            "usage": {
                "prompt_tokens": parsed.usage.input_tokens,
                "completion_tokens": parsed.usage.output_tokens,
                "total_tokens": parsed.usage.input_tokens + parsed.usage.output_tokens,
            }
        });
        let body = serde_json::to_vec(&openai)
            .map_err(|e| ProviderError::InvalidRequest(e.to_string()))?;
        Ok(ProviderResponse::Unary {
            body: Bytes::from(body),
            content_type: "application/json".to_string(),
        })
    }

    async fn embeddings(
        &self,
        _client: &reqwest::Client,
        _payload: CreateEmbeddingPayload,
    ) -> Result<ProviderResponse, ProviderError> {
        Err(ProviderError::InvalidRequest(
            "Anthropic does not provide an embeddings API".to_string(),
        ))
    }
}

// ============================================================================
// Request conversion
// ============================================================================

#[derive(Debug, Serialize)]
struct MessagesRequest {
    model: String,
    max_tokens: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    messages: Vec<AnthropicMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop_sequences: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<AnthropicTool>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<AnthropicToolChoice>,
    stream: bool,
}

#[derive(Debug, Serialize)]
struct AnthropicMessage {
    role: &'static str,
    content: Vec<ContentBlock>,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
    ToolResult {
        tool_use_id: String,
        content: String,
    },
}

#[derive(Debug, Serialize)]
struct AnthropicTool {
    name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    description: Option<String>,
    input_schema: serde_json::Value,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum AnthropicToolChoice {
    Auto,
    Any,
    Tool { name: String },
}

/// Anthropic clamps temperature to [0, 1]; OpenAI allows up to 2.
fn clamp_temperature(temperature: f64) -> f64 {
    temperature.clamp(0.0, 1.0)
}

fn map_stop_reason(stop_reason: Option<&str>) -> &'static str {
    match stop_reason {
        Some("max_tokens") => "length",
        Some("tool_use") => "tool_calls",
        _ => "stop",
    }
}

fn convert_chat_request(
    payload: CreateChatCompletionPayload,
    default_max_tokens: u64,
) -> Result<MessagesRequest, ProviderError> {
    let model = payload.model.clone().unwrap_or_default();
    let max_tokens = payload
        .max_completion_tokens
        .or(payload.max_tokens)
        .unwrap_or(default_max_tokens);

    // System and developer turns merge into the top-level system field.
    let mut system_parts = Vec::new();
    let mut messages = Vec::new();

    for message in &payload.messages {
        match message {
            Message::System { content, .. } | Message::Developer { content, .. } => {
                let text = content.as_text();
                if !text.is_empty() {
                    system_parts.push(text);
                }
            }
            Message::User { content, .. } => {
                let blocks = content_blocks(content);
                if !blocks.is_empty() {
                    messages.push(AnthropicMessage {
                        role: "user",
                        content: blocks,
                    });
                }
            }
            Message::Assistant {
                content,
                tool_calls,
                ..
            } => {
                let mut blocks = Vec::new();
                if let Some(content) = content {
                    blocks.extend(content_blocks(content));
                }
                if let Some(calls) = tool_calls {
                    for call in calls {
                        let input = serde_json::from_str(&call.function.arguments)
                            .unwrap_or(serde_json::json!({}));
                        blocks.push(ContentBlock::ToolUse {
                            id: call.id.clone(),
                            name: call.function.name.clone(),
                            input,
                        });
                    }
                }
                if !blocks.is_empty() {
                    messages.push(AnthropicMessage {
                        role: "assistant",
                        content: blocks,
                    });
                }
            }
            Message::Tool {
                content,
                tool_call_id,
            } => {
                messages.push(AnthropicMessage {
                    role: "user",
                    content: vec![ContentBlock::ToolResult {
                        tool_use_id: tool_call_id.clone(),
                        content: content.as_text(),
                    }],
                });
            }
        }
    }

    if messages.is_empty() {
        return Err(ProviderError::InvalidRequest(
            "request contains no user or assistant messages".to_string(),
        ));
    }

    let tools = convert_tools(payload.tools);
    let tool_choice = convert_tool_choice(payload.tool_choice);

    Ok(MessagesRequest {
        model,
        max_tokens,
        system: (!system_parts.is_empty()).then(|| system_parts.join("\n\n")),
        messages,
        temperature: payload.temperature.map(clamp_temperature),
        top_p: payload.top_p,
        stop_sequences: payload.stop.map(|stop| match stop {
            Stop::Single(s) => vec![s],
            Stop::Multiple(all) => all,
        }),
        tools,
        tool_choice,
        stream: payload.stream,
    })
}

fn content_blocks(content: &MessageContent) -> Vec<ContentBlock> {
    let text = content.as_text();
    if text.is_empty() {
        Vec::new()
    } else {
        vec![ContentBlock::Text { text }]
    }
}

fn convert_tools(tools: Option<Vec<ToolDefinition>>) -> Option<Vec<AnthropicTool>> {
    tools.map(|tools| {
        tools
            .into_iter()
            .map(|tool| AnthropicTool {
                name: tool.function.name,
                description: tool.function.description,
                input_schema: tool
                    .function
                    .parameters
                    .unwrap_or(serde_json::json!({"type": "object", "properties": {}})),
            })
            .collect()
    })
}

fn convert_tool_choice(tool_choice: Option<ToolChoice>) -> Option<AnthropicToolChoice> {
    tool_choice.and_then(|tc| match tc {
        ToolChoice::String(default) => match default {
            ToolChoiceDefaults::Auto => Some(AnthropicToolChoice::Auto),
            ToolChoiceDefaults::Required => Some(AnthropicToolChoice::Any),
            // Anthropic has no "none"; tools are simply not consulted.
            ToolChoiceDefaults::None => None,
        },
        ToolChoice::Named(named) => Some(AnthropicToolChoice::Tool {
            name: named.function.name,
        }),
    })
}

// ============================================================================
// Unary response conversion
// ============================================================================

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    id: String,
    model: String,
    content: Vec<ResponseContentBlock>,
    stop_reason: Option<String>,
    usage: MessagesUsage,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ResponseContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Default, Deserialize)]
struct MessagesUsage {
    #[serde(default)]
    input_tokens: i64,
    #[serde(default)]
    output_tokens: i64,
}

fn convert_chat_response(response: MessagesResponse) -> serde_json::Value {
    let mut text = String::new();
    let mut tool_calls = Vec::new();

    for block in &response.content {
        match block {
            ResponseContentBlock::Text { text: t } => text.push_str(t),
            ResponseContentBlock::ToolUse { id, name, input } => {
                tool_calls.push(serde_json::json!({
                    "id": id,
                    "type": "function",
                    "function": {
                        "name": name,
                        "arguments": input.to_string(),
                    }
                }));
            }
            ResponseContentBlock::Other => {}
        }
    }

    let mut message = serde_json::json!({
        "role": "assistant",
        "content": if text.is_empty() { serde_json::Value::Null } else { text.clone().into() },
        "refusal": null,
    });
    if !tool_calls.is_empty() {
        message["tool_calls"] = serde_json::Value::Array(tool_calls);
    }

    serde_json::json!({
        "id": response.id,
        "object": "chat.completion",
        "created": chrono::Utc::now().timestamp(),
        "model": response.model,
        "choices": [{
            "index": 0,
            "message": message,
            "logprobs": null,
            "finish_reason": map_stop_reason(response.stop_reason.as_deref()),
        }],
        "usage": {
            "prompt_tokens": response.usage.input_tokens,
            "completion_tokens": response.usage.output_tokens,
            "total_tokens": response.usage.input_tokens + response.usage.output_tokens,
        }
    })
}

// ============================================================================
// Streaming conversion
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum StreamEvent {
    MessageStart {
        message: StreamMessageStart,
    },
    ContentBlockStart {
        index: usize,
        content_block: StreamContentBlock,
    },
    ContentBlockDelta {
        index: usize,
        delta: StreamDelta,
    },
    ContentBlockStop {},
    MessageDelta {
        delta: StreamMessageDelta,
        usage: Option<StreamDeltaUsage>,
    },
    MessageStop,
    Ping,
    Error {
        error: StreamError,
    },
}

#[derive(Debug, Deserialize)]
struct StreamMessageStart {
    id: String,
    model: String,
    #[serde(default)]
    usage: Option<StreamStartUsage>,
}

#[derive(Debug, Deserialize)]
struct StreamStartUsage {
    #[serde(default)]
    input_tokens: i64,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum StreamContentBlock {
    Text {
        #[allow(dead_code)]
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum StreamDelta {
    TextDelta {
        text: String,
    },
    InputJsonDelta {
        partial_json: String,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct StreamMessageDelta {
    stop_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StreamDeltaUsage {
    output_tokens: i64,
}

#[derive(Debug, Deserialize)]
struct StreamError {
    #[serde(rename = "type")]
    error_type: String,
    message: String,
}

#[derive(Debug, Default)]
struct StreamState {
    message_id: String,
    model: String,
    input_tokens: i64,
    output_tokens: i64,
    /// (anthropic_index, tool_id, tool_name) per started tool_use block.
    tool_blocks: Vec<(usize, String, String)>,
    buffer: String,
    sent_done: bool,
}

/// Transforms an Anthropic SSE stream into OpenAI chat-completion chunks.
pub struct MessagesToOpenAIStream<S> {
    inner: S,
    state: StreamState,
    output: Vec<Bytes>,
}

impl<S> MessagesToOpenAIStream<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            state: StreamState::default(),
            output: Vec::new(),
        }
    }

    fn emit_chunk(&mut self, delta: serde_json::Value, finish_reason: Option<&str>) {
        let chunk = serde_json::json!({
            "id": self.state.message_id,
            "object": "chat.completion.chunk",
            "created": chrono::Utc::now().timestamp(),
            "model": self.state.model,
            "choices": [{
                "index": 0,
                "delta": delta,
                "finish_reason": finish_reason,
                "logprobs": null,
            }],
        });
        self.push_data(&chunk);
    }

    fn push_data(&mut self, value: &serde_json::Value) {
        if let Ok(json) = serde_json::to_string(value) {
            self.output.push(Bytes::from(format!("data: {}\n\n", json)));
        }
    }

    fn handle_event(&mut self, event: StreamEvent) {
        match event {
            StreamEvent::MessageStart { message } => {
                self.state.message_id = message.id;
                self.state.model = message.model;
                if let Some(usage) = message.usage {
                    self.state.input_tokens = usage.input_tokens;
                }
                self.emit_chunk(serde_json::json!({"role": "assistant"}), None);
            }
            StreamEvent::ContentBlockStart {
                index,
                content_block,
            } => {
                if let StreamContentBlock::ToolUse { id, name } = content_block {
                    let tool_index = self.state.tool_blocks.len();
                    self.state.tool_blocks.push((index, id.clone(), name.clone()));
                    self.emit_chunk(
                        serde_json::json!({
                            "tool_calls": [{
                                "index": tool_index,
                                "id": id,
                                "type": "function",
                                "function": {"name": name, "arguments": ""},
                            }]
                        }),
                        None,
                    );
                }
            }
            StreamEvent::ContentBlockDelta { index, delta } => match delta {
                StreamDelta::TextDelta { text } => {
                    self.emit_chunk(serde_json::json!({"content": text}), None);
                }
                StreamDelta::InputJsonDelta { partial_json } => {
                    if let Some(tool_index) = self
                        .state
                        .tool_blocks
                        .iter()
                        .position(|(anthropic_idx, _, _)| *anthropic_idx == index)
                    {
                        self.emit_chunk(
                            serde_json::json!({
                                "tool_calls": [{
                                    "index": tool_index,
                                    "function": {"arguments": partial_json},
                                }]
                            }),
                            None,
                        );
                    }
                }
                StreamDelta::Other => {}
            },
            StreamEvent::ContentBlockStop {} => {}
            StreamEvent::MessageDelta { delta, usage } => {
                if let Some(usage) = usage {
                    self.state.output_tokens = usage.output_tokens;
                }
                if let Some(stop_reason) = delta.stop_reason {
                    self.emit_chunk(
                        serde_json::json!({}),
                        Some(map_stop_reason(Some(&stop_reason))),
                    );
                }
            }
            StreamEvent::MessageStop => {
                let usage_chunk = serde_json::json!({
                    "id": self.state.message_id,
                    "object": "chat.completion.chunk",
                    "created": chrono::Utc::now().timestamp(),
                    "model": self.state.model,
                    "choices": [],
                    "usage": {
                        "prompt_tokens": self.state.input_tokens,
                        "completion_tokens": self.state.output_tokens,
                        "total_tokens": self.state.input_tokens + self.state.output_tokens,
                    },
                });
                self.push_data(&usage_chunk);
                self.output.push(Bytes::from("data: [DONE]\n\n"));
                self.state.sent_done = true;
            }
            StreamEvent::Ping => {}
            StreamEvent::Error { error } => {
                tracing::error!(
                    error_type = %error.error_type,
                    message = %error.message,
                    "Anthropic streaming error"
                );
            }
        }
    }

    fn process_bytes(&mut self, bytes: &[u8]) {
        let Ok(text) = std::str::from_utf8(bytes) else {
            return;
        };
        self.state.buffer.push_str(text);

        while let Some(pos) = self.state.buffer.find('\n') {
            let line = self.state.buffer[..pos].trim().to_string();
            self.state.buffer.drain(..=pos);

            if line.is_empty() || line.starts_with("event:") {
                continue;
            }
            if let Some(json) = line.strip_prefix("data: ") {
                let json = json.trim();
                if json.is_empty() || json == "[DONE]" {
                    continue;
                }
                match serde_json::from_str::<StreamEvent>(json) {
                    Ok(event) => self.handle_event(event),
                    Err(error) => {
                        tracing::warn!(%error, "Unparseable Anthropic SSE event");
                    }
                }
            }
        }
    }
}

impl<S> Stream for MessagesToOpenAIStream<S>
where
    S: Stream<Item = Result<Bytes, ProviderError>> + Unpin,
{
    type Item = Result<Bytes, ProviderError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        loop {
            if !self.output.is_empty() {
                return Poll::Ready(Some(Ok(self.output.remove(0))));
            }

            match Pin::new(&mut self.inner).poll_next(cx) {
                Poll::Ready(Some(Ok(bytes))) => {
                    self.process_bytes(&bytes);
                    // Loop: the bytes may or may not have produced output.
                }
                Poll::Ready(Some(Err(error))) => return Poll::Ready(Some(Err(error))),
                Poll::Ready(None) => return Poll::Ready(None),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use futures_util::stream;

    use super::*;

    fn chat_payload(json: &str) -> CreateChatCompletionPayload {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn system_messages_merge_into_the_system_field() {
        let payload = chat_payload(
            r#"{"model":"claude-3-5-sonnet-latest","messages":[
                {"role":"system","content":"Be terse."},
                {"role":"system","content":"Answer in French."},
                {"role":"user","content":"Bonjour"}
            ]}"#,
        );
        let request = convert_chat_request(payload, 4096).unwrap();
        assert_eq!(request.system.as_deref(), Some("Be terse.\n\nAnswer in French."));
        assert_eq!(request.messages.len(), 1);
    }

    #[test]
    fn temperature_is_clamped_to_anthropic_range() {
        let payload = chat_payload(
            r#"{"model":"claude-3-5-haiku-latest","temperature":1.8,
                "messages":[{"role":"user","content":"hi"}]}"#,
        );
        let request = convert_chat_request(payload, 4096).unwrap();
        assert_eq!(request.temperature, Some(1.0));
    }

    #[test]
    fn default_max_tokens_applies_when_unset() {
        let payload = chat_payload(
            r#"{"model":"claude-3-5-haiku-latest","messages":[{"role":"user","content":"hi"}]}"#,
        );
        let request = convert_chat_request(payload, 2048).unwrap();
        assert_eq!(request.max_tokens, 2048);
    }

    #[test]
    fn tools_are_renamed_to_input_schema() {
        let payload = chat_payload(
            r#"{"model":"claude-3-5-sonnet-latest","messages":[{"role":"user","content":"hi"}],
                "tools":[{"type":"function","function":{
                    "name":"get_weather","description":"d",
                    "parameters":{"type":"object","properties":{"city":{"type":"string"}}}
                }}],
                "tool_choice":"auto"}"#,
        );
        let request = convert_chat_request(payload, 4096).unwrap();
        let tools = request.tools.unwrap();
        assert_eq!(tools[0].name, "get_weather");
        assert_eq!(tools[0].input_schema["properties"]["city"]["type"], "string");
        assert!(matches!(request.tool_choice, Some(AnthropicToolChoice::Auto)));
    }

    #[test]
    fn unary_response_converts_to_openai_shape() {
        let response = MessagesResponse {
            id: "msg_01".to_string(),
            model: "claude-3-5-sonnet-latest".to_string(),
            content: vec![ResponseContentBlock::Text {
                text: "Hello!".to_string(),
            }],
            stop_reason: Some("end_turn".to_string()),
            usage: MessagesUsage {
                input_tokens: 12,
                output_tokens: 3,
            },
        };

        let openai = convert_chat_response(response);
        assert_eq!(openai["object"], "chat.completion");
        assert_eq!(openai["choices"][0]["message"]["content"], "Hello!");
        assert_eq!(openai["choices"][0]["finish_reason"], "stop");
        assert_eq!(openai["usage"]["total_tokens"], 15);
    }

    #[test]
    fn tool_use_blocks_become_tool_calls() {
        let response = MessagesResponse {
            id: "msg_01".to_string(),
            model: "claude-3-5-sonnet-latest".to_string(),
            content: vec![ResponseContentBlock::ToolUse {
                id: "toolu_1".to_string(),
                name: "get_weather".to_string(),
                input: serde_json::json!({"city": "Paris"}),
            }],
            stop_reason: Some("tool_use".to_string()),
            usage: MessagesUsage::default(),
        };

        let openai = convert_chat_response(response);
        assert_eq!(openai["choices"][0]["finish_reason"], "tool_calls");
        let call = &openai["choices"][0]["message"]["tool_calls"][0];
        assert_eq!(call["function"]["name"], "get_weather");
        assert!(call["function"]["arguments"].as_str().unwrap().contains("Paris"));
    }

    #[tokio::test]
    async fn stream_transforms_to_openai_chunks() {
        let events = concat!(
            "event: message_start\n",
            "data: {\"type\":\"message_start\",\"message\":{\"id\":\"msg_1\",\"model\":\"claude-3-5-haiku-latest\",\"usage\":{\"input_tokens\":5,\"output_tokens\":0}}}\n\n",
            "data: {\"type\":\"content_block_start\",\"index\":0,\"content_block\":{\"type\":\"text\",\"text\":\"\"}}\n\n",
            "data: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\"Hel\"}}\n\n",
            "data: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\"lo\"}}\n\n",
            "data: {\"type\":\"message_delta\",\"delta\":{\"stop_reason\":\"end_turn\"},\"usage\":{\"output_tokens\":2}}\n\n",
            "data: {\"type\":\"message_stop\"}\n\n",
        );

        let inner = stream::iter(vec![Ok(Bytes::from(events))]);
        let mut transformed = MessagesToOpenAIStream::new(Box::pin(inner));

        let mut collected = String::new();
        while let Some(chunk) = transformed.next().await {
            collected.push_str(std::str::from_utf8(&chunk.unwrap()).unwrap());
        }

        assert!(collected.contains(r#""role":"assistant""#));
        assert!(collected.contains(r#""content":"Hel""#));
        assert!(collected.contains(r#""content":"lo""#));
        assert!(collected.contains(r#""finish_reason":"stop""#));
        assert!(collected.contains(r#""total_tokens":7"#));
        assert!(collected.trim_end().ends_with("data: [DONE]"));
    }

    #[tokio::test]
    async fn stream_handles_chunks_split_mid_line() {
        let part1 = "data: {\"type\":\"message_start\",\"message\":{\"id\":\"msg_1\",\"model\":\"m\",\"usage\":{\"input_tokens\":1}}}\n\ndata: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"ty";
        let part2 = "pe\":\"text_delta\",\"text\":\"Hi\"}}\n\ndata: {\"type\":\"message_stop\"}\n\n";

        let inner = stream::iter(vec![Ok(Bytes::from(part1)), Ok(Bytes::from(part2))]);
        let mut transformed = MessagesToOpenAIStream::new(Box::pin(inner));

        let mut collected = String::new();
        while let Some(chunk) = transformed.next().await {
            collected.push_str(std::str::from_utf8(&chunk.unwrap()).unwrap());
        }
        assert!(collected.contains(r#""content":"Hi""#));
        assert!(collected.contains("[DONE]"));
    }
}
