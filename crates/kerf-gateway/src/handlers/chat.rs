//! Chat completions proxy.
//!
//! Forwards chat requests to an OpenAI-compatible upstream. Streaming
//! responses are re-shaped for the tunnel client: each SSE delta
//! becomes a `{"type":"token","content":...}` message and the stream
//! ends with `{"type":"completion"}`.

use super::body_from_receiver;
use crate::router::{HandlerError, HandlerFuture, HandlerResponse, Request, RequestHandler};
use crate::streaming::StreamRegistry;
use bytes::Bytes;
use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Client request body for `POST /v1/{upstream}/chat/completions`.
#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub stream: bool,
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub max_tokens: Option<u64>,
    #[serde(default)]
    pub json: Option<bool>,
}

#[derive(Debug, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    Developer,
    User,
    Assistant,
}

impl ChatRole {
    fn as_str(self) -> &'static str {
        match self {
            ChatRole::System => "system",
            ChatRole::Developer => "developer",
            ChatRole::User => "user",
            ChatRole::Assistant => "assistant",
        }
    }
}

/// Proxies chat completions to one configured upstream.
pub struct ChatCompletionsHandler {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl ChatCompletionsHandler {
    pub fn new(client: reqwest::Client, base_url: String, api_key: Option<String>) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
        }
    }

    fn parse_request(body: Option<&str>) -> Result<ChatRequest, HandlerError> {
        let body = body.ok_or_else(|| HandlerError::bad_request("Request body is required"))?;
        serde_json::from_str(body)
            .map_err(|_| HandlerError::bad_request("Invalid chat request body"))
    }

    fn upstream_payload(chat_request: &ChatRequest) -> serde_json::Value {
        let messages: Vec<serde_json::Value> = chat_request
            .messages
            .iter()
            .map(|m| json!({"role": m.role.as_str(), "content": m.content}))
            .collect();

        let mut payload = json!({
            "model": chat_request.model,
            "messages": messages,
            "stream": chat_request.stream,
        });

        if let Some(temperature) = chat_request.temperature {
            payload["temperature"] = json!(temperature);
        }
        if let Some(max_tokens) = chat_request.max_tokens {
            payload["max_tokens"] = json!(max_tokens);
        }
        if chat_request.json == Some(true) {
            payload["response_format"] = json!({"type": "json_object"});
        }

        payload
    }

    async fn send_upstream(
        &self,
        chat_request: &ChatRequest,
    ) -> Result<reqwest::Response, HandlerError> {
        let mut request = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .json(&Self::upstream_payload(chat_request));
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await.map_err(|e| {
            warn!(error = %e, "chat upstream unreachable");
            HandlerError::new(502, "Chat completion failed")
        })?;

        if !response.status().is_success() {
            warn!(status = %response.status(), "chat upstream returned an error");
            return Err(HandlerError::new(502, "Chat completion failed"));
        }

        Ok(response)
    }
}

impl RequestHandler for ChatCompletionsHandler {
    fn handle<'a>(&'a self, request: Request, _registry: Arc<StreamRegistry>) -> HandlerFuture<'a> {
        Box::pin(async move {
            let chat_request = Self::parse_request(request.body.as_deref())?;
            let response = self.send_upstream(&chat_request).await?;

            if !chat_request.stream {
                let value: serde_json::Value = response
                    .json()
                    .await
                    .map_err(|_| HandlerError::new(502, "Chat completion failed"))?;
                let content = value["choices"][0]["message"]["content"]
                    .as_str()
                    .unwrap_or_default()
                    .to_string();
                return Ok(HandlerResponse::Single {
                    status: 200,
                    body: content,
                });
            }

            let (tx, rx) = mpsc::unbounded_channel();
            tokio::spawn(forward_sse(response, tx));

            Ok(HandlerResponse::Streaming {
                headers: HashMap::new(),
                body: body_from_receiver(rx),
            })
        })
    }
}

/// Read the upstream SSE body and translate deltas into client token
/// messages.
async fn forward_sse(
    response: reqwest::Response,
    tx: mpsc::UnboundedSender<Result<Bytes, HandlerError>>,
) {
    let mut parser = SseParser::new();
    let mut body = response.bytes_stream();

    while let Some(item) = body.next().await {
        let chunk = match item {
            Ok(chunk) => chunk,
            Err(e) => {
                warn!(error = %e, "error streaming chat response");
                let _ = tx.send(Err(HandlerError::internal("Streaming error")));
                return;
            }
        };

        for event in parser.push(&chunk) {
            if event == "[DONE]" {
                let _ = tx.send(Ok(completion_message()));
                return;
            }
            if let Some(message) = token_message(&event) {
                if tx.send(Ok(message)).is_err() {
                    // Client went away; stop reading upstream.
                    return;
                }
            }
        }
    }

    // Upstream ended without a [DONE] marker.
    let _ = tx.send(Ok(completion_message()));
}

fn completion_message() -> Bytes {
    Bytes::from_static(br#"{"type":"completion"}"#)
}

/// Convert one SSE data payload into a token message, if it carries
/// content.
fn token_message(event: &str) -> Option<Bytes> {
    let value: serde_json::Value = match serde_json::from_str(event) {
        Ok(value) => value,
        Err(e) => {
            warn!(error = %e, "unparseable chat stream event");
            return None;
        }
    };

    let choice = value["choices"].get(0)?;
    if let Some(reason) = choice["finish_reason"].as_str() {
        info!(reason, "chat stream finished");
    }

    let content = choice["delta"]["content"].as_str()?;
    if content.is_empty() {
        return None;
    }

    let message = json!({"type": "token", "content": content});
    Some(Bytes::from(message.to_string()))
}

/// Splits server-sent events out of an arbitrarily-chunked byte
/// stream. Only `data:` lines are surfaced.
struct SseParser {
    buffer: Vec<u8>,
}

impl SseParser {
    fn new() -> Self {
        Self { buffer: Vec::new() }
    }

    fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);
        let mut events = Vec::new();

        while let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line);
            let line = line.trim_end_matches(['\n', '\r']);

            if let Some(data) = line.strip_prefix("data:") {
                events.push(data.trim_start().to_string());
            }
        }

        events
    }
}
