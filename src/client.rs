//! Provider wire clients
//!
//! One implementation per provider dialect. A client performs exactly one
//! attempt per call and never retries internally: the credential is an
//! argument, and failures come back pre-classified so the executor can decide
//! whether to rotate, wait, or advance the roster.

use crate::message::{ChatPayload, Message, Usage};
use crate::{config::ProviderConfig, Error, Result};
use futures::stream::Stream;
use reqwest::header::RETRY_AFTER;
use reqwest::Client as HttpClient;
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use std::time::Duration;

/// Build an HTTP client with specified timeout
fn build_http_client(timeout: Duration) -> std::result::Result<HttpClient, reqwest::Error> {
    HttpClient::builder()
        .timeout(timeout)
        .connect_timeout(Duration::from_secs(10))
        .build()
}

/// Map a non-success provider response onto the failure taxonomy.
///
/// 429 carries the `Retry-After` header (when present) as a backoff hint;
/// 404 and auth failures are permanent for the attempted model; 5xx and
/// everything unrecognized stays transient.
fn classify_response(status: reqwest::StatusCode, retry_after: Option<Duration>, body: String) -> Error {
    match status.as_u16() {
        429 => Error::RateLimited {
            message: body,
            retry_after,
        },
        400 if body.to_lowercase().contains("model") => Error::ModelUnavailable(body),
        401 | 403 | 404 => Error::ModelUnavailable(format!("({}) {}", status, body)),
        _ => Error::ProviderTransient(format!("({}) {}", status, body)),
    }
}

/// Read the `Retry-After` header as whole seconds
fn retry_after_header(response: &reqwest::Response) -> Option<Duration> {
    response
        .headers()
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

// ---------------------------------------------------------------------------
// SSE buffer utility shared between the OpenAI and Anthropic streaming parsers
// ---------------------------------------------------------------------------

/// Parsed SSE line types
enum SseLine {
    /// `data: [DONE]`, the OpenAI stream terminator
    Done,
    /// `data: <json>` carrying a JSON payload
    Data(String),
    /// `event: <name>` naming an SSE event
    Event(String),
    /// Empty or non-SSE line (skip)
    Skip,
}

/// Accumulates bytes from an HTTP response and yields complete SSE lines.
struct SseBuffer {
    buf: Vec<u8>,
}

impl SseBuffer {
    fn new() -> Self {
        Self { buf: Vec::with_capacity(4096) }
    }

    fn extend(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Extract the next complete line (terminated by `\n`) from the buffer.
    /// Returns `None` when no complete line is available yet.
    ///
    /// UTF-8 safety: uses `from_utf8` (strict) instead of `from_utf8_lossy`
    /// to avoid silently corrupting multi-byte characters split across chunk
    /// boundaries. Malformed bytes are reported as an error rather than
    /// replaced with U+FFFD.
    fn next_line(&mut self) -> Option<SseLine> {
        let pos = self.buf.iter().position(|&b| b == b'\n')?;
        let raw: Vec<u8> = self.buf.drain(..=pos).collect();
        let line = match std::str::from_utf8(&raw) {
            Ok(s) => s.trim().to_string(),
            Err(_) => {
                // Server sent non-UTF-8 data; surface as a parseable error
                // instead of silently corrupting the stream.
                return Some(SseLine::Data(
                    r#"{"error":"SSE stream contains invalid UTF-8"}"#.to_string(),
                ));
            }
        };

        if line.is_empty() {
            return Some(SseLine::Skip);
        }

        if line == "data: [DONE]" {
            return Some(SseLine::Done);
        }

        if let Some(json_str) = line.strip_prefix("data: ") {
            return Some(SseLine::Data(json_str.to_string()));
        }

        if let Some(event_name) = line.strip_prefix("event: ") {
            return Some(SseLine::Event(event_name.to_string()));
        }

        Some(SseLine::Skip)
    }
}

/// Streaming event from the LLM
#[derive(Debug, Clone)]
pub struct StreamEvent {
    /// Text delta for this event
    pub delta: String,

    /// Whether this is the final event
    pub done: bool,

    /// Token usage (only available in the final event)
    pub usage: Option<Usage>,
}

/// Trait for provider wire clients.
///
/// A call is a single attempt against a single model with a single
/// credential. Rotation and retry live above this layer.
#[async_trait::async_trait]
pub trait ProviderClient: Send + Sync {
    /// Send a chat completion request (non-streaming)
    async fn chat(&self, payload: &ChatPayload, model: &str, key: &str) -> Result<(String, Usage)>;

    /// Send a chat completion request with streaming
    fn chat_stream(
        &self,
        payload: &ChatPayload,
        model: &str,
        key: &str,
    ) -> Pin<Box<dyn Stream<Item = Result<StreamEvent>> + Send>>;

    /// Get the API base URL
    fn api_base(&self) -> &str;

    /// Default output token cap when neither the call nor the model sets one
    fn default_max_tokens(&self) -> u32 {
        4096
    }
}

/// OpenAI-dialect client implementation
pub struct OpenAiClient {
    api_base: String,
    http_client: HttpClient,
}

impl OpenAiClient {
    /// Create a new OpenAI-dialect client
    pub fn new(config: &ProviderConfig) -> Result<Self> {
        Ok(OpenAiClient {
            http_client: build_http_client(config.timeout())?,
            api_base: config.api_base().to_string(),
        })
    }

    fn url(&self) -> String {
        format!("{}/chat/completions", self.api_base.trim_end_matches('/'))
    }
}

#[async_trait::async_trait]
impl ProviderClient for OpenAiClient {
    async fn chat(&self, payload: &ChatPayload, model: &str, key: &str) -> Result<(String, Usage)> {
        let request = ChatRequest {
            model: model.to_string(),
            messages: payload.messages.clone(),
            temperature: payload.temperature,
            max_tokens: payload.max_tokens,
            stream: false,
        };

        let response = self
            .http_client
            .post(self.url())
            .header("Authorization", format!("Bearer {}", key))
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = retry_after_header(&response);
            let body = response.text().await.unwrap_or_default();
            return Err(classify_response(status, retry_after, body));
        }

        let body = response.text().await?;
        let response: ChatResponse = serde_json::from_str(&body).map_err(|e| {
            Error::ProviderTransient(format!("failed to parse response: {}. Body: {}", e, body))
        })?;
        let message = response
            .choices
            .first()
            .ok_or_else(|| Error::ProviderTransient("no choices in response".to_string()))?;

        let usage = Usage {
            prompt_tokens: response.usage.prompt_tokens,
            completion_tokens: response.usage.completion_tokens,
            total_tokens: response.usage.total_tokens,
        };

        Ok((message.message.content.clone(), usage))
    }

    fn chat_stream(
        &self,
        payload: &ChatPayload,
        model: &str,
        key: &str,
    ) -> Pin<Box<dyn Stream<Item = Result<StreamEvent>> + Send>> {
        let request = ChatRequest {
            model: model.to_string(),
            messages: payload.messages.clone(),
            temperature: payload.temperature,
            max_tokens: payload.max_tokens,
            stream: true,
        };

        let url = self.url();
        let key = key.to_string();
        let http_client = self.http_client.clone();

        Box::pin(async_stream::stream! {
            let response = match http_client
                .post(&url)
                .header("Authorization", format!("Bearer {}", key))
                .json(&request)
                .send()
                .await
            {
                Ok(r) => r,
                Err(e) => {
                    yield Err(Error::from(e));
                    return;
                }
            };

            let status = response.status();
            if !status.is_success() {
                let retry_after = retry_after_header(&response);
                let body = response.text().await.unwrap_or_default();
                yield Err(classify_response(status, retry_after, body));
                return;
            }

            let mut stream = response.bytes_stream();

            use futures::StreamExt;
            let mut sse = SseBuffer::new();
            let mut usage: Option<Usage> = None;

            while let Some(chunk_result) = stream.next().await {
                let chunk = match chunk_result {
                    Ok(c) => c,
                    Err(e) => {
                        yield Err(Error::from(e));
                        return;
                    }
                };

                sse.extend(&chunk);

                while let Some(sse_line) = sse.next_line() {
                    match sse_line {
                        SseLine::Done => {
                            yield Ok(StreamEvent { delta: String::new(), done: true, usage: usage.clone() });
                            return;
                        }
                        SseLine::Data(json_str) => {
                            match serde_json::from_str::<ChatStreamChunk>(&json_str) {
                                Ok(chunk) => {
                                    // Extract usage when available (final chunk)
                                    if let Some(ref u) = chunk.usage {
                                        usage = Some(Usage {
                                            prompt_tokens: u.prompt_tokens,
                                            completion_tokens: u.completion_tokens,
                                            total_tokens: u.total_tokens,
                                        });
                                    }

                                    if let Some(delta) = chunk.choices.first() {
                                        let delta_text = delta.delta.content.clone().unwrap_or_default();
                                        let done = delta.finish_reason.as_deref() == Some("stop");

                                        if !delta_text.is_empty() || done {
                                            yield Ok(StreamEvent {
                                                delta: delta_text,
                                                done,
                                                usage: if done { usage.clone() } else { None }
                                            });
                                        }
                                    }
                                }
                                Err(e) => {
                                    tracing::warn!("Failed to parse SSE chunk: {}", e);
                                }
                            }
                        }
                        _ => {} // Skip empty lines and event: lines
                    }
                }
            }
        })
    }

    fn api_base(&self) -> &str {
        &self.api_base
    }
}

/// Anthropic-dialect client implementation
pub struct AnthropicClient {
    api_base: String,
    http_client: HttpClient,
}

impl AnthropicClient {
    /// Create a new Anthropic-dialect client
    pub fn new(config: &ProviderConfig) -> Result<Self> {
        Ok(AnthropicClient {
            http_client: build_http_client(config.timeout())?,
            api_base: config.api_base().to_string(),
        })
    }

    fn url(&self) -> String {
        format!("{}/v1/messages", self.api_base.trim_end_matches('/'))
    }

    fn build_request(&self, payload: &ChatPayload, model: &str, stream: bool) -> AnthropicMessageRequest {
        // Extract system message if present
        let (system, others): (Vec<_>, Vec<_>) = payload
            .messages
            .iter()
            .partition(|m| m.role == crate::MessageRole::System);

        AnthropicMessageRequest {
            model: model.to_string(),
            messages: others.into_iter().cloned().collect(),
            system: system.first().map(|m| m.content.clone()),
            max_tokens: payload.max_tokens.unwrap_or_else(|| self.default_max_tokens()),
            temperature: payload.temperature,
            stream: stream.then_some(true),
        }
    }
}

#[async_trait::async_trait]
impl ProviderClient for AnthropicClient {
    async fn chat(&self, payload: &ChatPayload, model: &str, key: &str) -> Result<(String, Usage)> {
        let request = self.build_request(payload, model, false);

        let response = self
            .http_client
            .post(self.url())
            .header("x-api-key", key)
            .header("anthropic-version", "2023-06-01")
            .header("content-type", "application/json")
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = retry_after_header(&response);
            let body = response.text().await.unwrap_or_default();
            return Err(classify_response(status, retry_after, body));
        }

        let body = response.text().await?;
        let response: AnthropicMessageResponse = serde_json::from_str(&body).map_err(|e| {
            Error::ProviderTransient(format!("failed to parse response: {}. Body: {}", e, body))
        })?;
        let usage = Usage {
            prompt_tokens: response.usage.input_tokens,
            completion_tokens: response.usage.output_tokens,
            total_tokens: response.usage.input_tokens + response.usage.output_tokens,
        };

        let text = response
            .content
            .first()
            .map(|block| block.text.clone())
            .ok_or_else(|| Error::ProviderTransient("response contained no content blocks".to_string()))?;

        Ok((text, usage))
    }

    fn chat_stream(
        &self,
        payload: &ChatPayload,
        model: &str,
        key: &str,
    ) -> Pin<Box<dyn Stream<Item = Result<StreamEvent>> + Send>> {
        let request = self.build_request(payload, model, true);
        let url = self.url();
        let key = key.to_string();
        let http_client = self.http_client.clone();

        Box::pin(async_stream::stream! {
            let response = match http_client
                .post(&url)
                .header("x-api-key", key)
                .header("anthropic-version", "2023-06-01")
                .header("content-type", "application/json")
                .json(&request)
                .send()
                .await
            {
                Ok(r) => r,
                Err(e) => {
                    yield Err(Error::from(e));
                    return;
                }
            };

            let status = response.status();
            if !status.is_success() {
                let retry_after = retry_after_header(&response);
                let body = response.text().await.unwrap_or_default();
                yield Err(classify_response(status, retry_after, body));
                return;
            }

            let mut stream = response.bytes_stream();

            use futures::StreamExt;
            let mut sse = SseBuffer::new();
            let mut usage: Option<Usage> = None;

            while let Some(chunk_result) = stream.next().await {
                let chunk = match chunk_result {
                    Ok(c) => c,
                    Err(e) => {
                        yield Err(Error::from(e));
                        return;
                    }
                };

                sse.extend(&chunk);

                while let Some(sse_line) = sse.next_line() {
                    match sse_line {
                        SseLine::Event(name) if name == "message_stop" => {
                            yield Ok(StreamEvent { delta: String::new(), done: true, usage: usage.clone() });
                            return;
                        }
                        SseLine::Data(json_str) => {
                            match serde_json::from_str::<AnthropicStreamChunk>(&json_str) {
                                Ok(chunk) => {
                                    // Usage arrives in message_start for most
                                    // servers and in message_delta for others
                                    if let Some(msg) = &chunk.message {
                                        if let Some(u) = &msg.usage {
                                            usage = Some(Usage {
                                                prompt_tokens: u.input_tokens,
                                                completion_tokens: u.output_tokens,
                                                total_tokens: u.input_tokens + u.output_tokens,
                                            });
                                        }
                                    }

                                    if chunk.type_ == "message_delta" {
                                        if let Some(u) = &chunk.usage_info {
                                            usage = Some(Usage {
                                                prompt_tokens: u.input_tokens,
                                                completion_tokens: u.output_tokens,
                                                total_tokens: u.input_tokens + u.output_tokens,
                                            });
                                        }
                                    }

                                    match chunk.type_.as_str() {
                                        "content_block_delta" => {
                                            if let Some(StreamDelta::ContentBlock(delta)) = &chunk.delta {
                                                if delta.type_ == "text_delta" && !delta.text.is_empty() {
                                                    yield Ok(StreamEvent { delta: delta.text.clone(), done: false, usage: None });
                                                }
                                            }
                                        }
                                        "message_stop" => {
                                            yield Ok(StreamEvent { delta: String::new(), done: true, usage: usage.clone() });
                                            return;
                                        }
                                        _ => {} // message_delta, content_block_start, etc.
                                    }
                                }
                                Err(e) => {
                                    tracing::warn!("Failed to parse SSE chunk: {}", e);
                                }
                            }
                        }
                        _ => {} // Skip empty lines and other events
                    }
                }
            }

            tracing::warn!("SSE stream ended unexpectedly");
        })
    }

    fn api_base(&self) -> &str {
        &self.api_base
    }
}

// OpenAI types

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<Message>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
    usage: ChatUsage,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
    total_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct ChatStreamChunk {
    choices: Vec<ChatStreamChoice>,
    #[serde(default)]
    usage: Option<ChatUsage>,
}

#[derive(Debug, Deserialize)]
struct ChatStreamChoice {
    delta: ChatStreamDelta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatStreamDelta {
    content: Option<String>,
}

// Anthropic types

#[derive(Debug, Serialize)]
struct AnthropicMessageRequest {
    model: String,
    messages: Vec<Message>,
    system: Option<String>,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct AnthropicMessageResponse {
    content: Vec<AnthropicContentBlock>,
    usage: AnthropicUsage,
}

#[derive(Debug, Deserialize)]
struct AnthropicContentBlock {
    text: String,
}

#[derive(Debug, Deserialize)]
struct AnthropicUsage {
    input_tokens: u32,
    output_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct AnthropicStreamChunk {
    #[serde(rename = "type")]
    type_: String,
    #[serde(default)]
    delta: Option<StreamDelta>,
    #[serde(default, rename = "message")]
    message: Option<AnthropicStreamMessage>,
    #[serde(default, rename = "usage")]
    usage_info: Option<AnthropicStreamUsage>,
}

// Union type for different delta formats
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum StreamDelta {
    ContentBlock(AnthropicDelta),
    #[allow(dead_code)]
    MessageDelta(AnthropicMessageDelta),
}

#[derive(Debug, Deserialize)]
#[allow(dead_code)]
struct AnthropicMessageDelta {
    stop_reason: Option<String>,
    stop_sequence: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AnthropicDelta {
    #[serde(rename = "type")]
    type_: String,
    text: String,
}

#[derive(Debug, Deserialize)]
struct AnthropicStreamMessage {
    usage: Option<AnthropicStreamUsage>,
}

#[derive(Debug, Deserialize)]
struct AnthropicStreamUsage {
    input_tokens: u32,
    output_tokens: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_openai_sse_chunk() {
        let json = r#"{"choices":[{"delta":{"content":"Hello"}}]}"#;
        let chunk: ChatStreamChunk = serde_json::from_str(json).unwrap();
        assert_eq!(chunk.choices.len(), 1);
        assert_eq!(chunk.choices[0].delta.content.as_deref(), Some("Hello"));
    }

    #[test]
    fn test_parse_anthropic_content_block_delta() {
        let json = r#"{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"Hello"}}"#;
        let chunk: AnthropicStreamChunk = serde_json::from_str(json).unwrap();
        assert_eq!(chunk.type_, "content_block_delta");
        assert!(chunk.delta.is_some());
    }

    #[test]
    fn test_parse_anthropic_ping() {
        let json = r#"{"type":"ping"}"#;
        let chunk: AnthropicStreamChunk = serde_json::from_str(json).unwrap();
        assert_eq!(chunk.type_, "ping");
        assert!(chunk.delta.is_none());
    }

    #[test]
    fn test_classify_429_with_header() {
        let err = classify_response(
            reqwest::StatusCode::TOO_MANY_REQUESTS,
            Some(Duration::from_secs(3)),
            "slow down".into(),
        );
        match err {
            Error::RateLimited { retry_after, .. } => {
                assert_eq!(retry_after, Some(Duration::from_secs(3)))
            }
            other => panic!("expected RateLimited, got {:?}", other),
        }
    }

    #[test]
    fn test_classify_404_is_model_unavailable() {
        let err = classify_response(reqwest::StatusCode::NOT_FOUND, None, "no such model".into());
        assert!(matches!(err, Error::ModelUnavailable(_)));
    }

    #[test]
    fn test_classify_400_model_error_is_model_unavailable() {
        let err = classify_response(
            reqwest::StatusCode::BAD_REQUEST,
            None,
            r#"{"error": "The model `x` was removed"}"#.into(),
        );
        assert!(matches!(err, Error::ModelUnavailable(_)));
    }

    #[test]
    fn test_classify_500_is_transient() {
        let err = classify_response(
            reqwest::StatusCode::INTERNAL_SERVER_ERROR,
            None,
            "oops".into(),
        );
        assert!(matches!(err, Error::ProviderTransient(_)));
    }
}
