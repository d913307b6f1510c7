//! OpenAI-compatible chat completions backend.
//!
//! Posts to `{base_url}/chat/completions`. Works against llama-server, vLLM,
//! Ollama and hosted endpoints that speak the same protocol. Streaming uses
//! SSE: each event is a `data: {json}` line and the stream ends with
//! `data: [DONE]`.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::InferenceConfig;
use crate::inference::{
    GenerationOptions, InferenceBackend, InferenceError, Message, TokenCallback,
};

// ---------------------------------------------------------------------------
// HTTP request / response types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: &'a [Message],
    max_tokens: u32,
    temperature: f32,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: Option<ChoiceMessage>,
    delta: Option<ChoiceMessage>,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

// ---------------------------------------------------------------------------
// Error mapping
// ---------------------------------------------------------------------------

fn classify_status(status: u16, body: &str) -> InferenceError {
    let message = if body.is_empty() {
        format!("HTTP {status}")
    } else {
        format!("HTTP {status}: {}", body.chars().take(500).collect::<String>())
    };
    match status {
        401 | 403 => InferenceError::Auth(message),
        404 => InferenceError::NoModelLoaded(message),
        408 => InferenceError::Timeout(message),
        429 => InferenceError::RateLimited(message),
        500..=599 => InferenceError::Server { status, message },
        _ => InferenceError::InvalidResponse(message),
    }
}

fn classify_transport(err: reqwest::Error) -> InferenceError {
    if err.is_timeout() {
        InferenceError::Timeout(err.to_string())
    } else if err.is_decode() {
        InferenceError::InvalidResponse(err.to_string())
    } else {
        InferenceError::Network(err.to_string())
    }
}

/// Outcome of one SSE line
#[derive(Debug, PartialEq, Eq)]
enum SseEvent {
    Token(String),
    Done,
    Skip,
}

fn parse_sse_line(line: &str) -> SseEvent {
    let line = line.trim();
    let data = match line.strip_prefix("data:") {
        Some(rest) => rest.trim(),
        None if line.starts_with('{') => line,
        None => return SseEvent::Skip,
    };
    if data == "[DONE]" {
        return SseEvent::Done;
    }
    match serde_json::from_str::<ChatCompletionResponse>(data) {
        Ok(chunk) => {
            let choice = chunk.choices.first();
            let text = choice
                .and_then(|c| c.delta.as_ref())
                .and_then(|d| d.content.clone())
                .unwrap_or_default();
            if choice.is_some_and(|c| c.finish_reason.is_some()) && text.is_empty() {
                SseEvent::Done
            } else if text.is_empty() {
                SseEvent::Skip
            } else {
                SseEvent::Token(text)
            }
        }
        Err(e) => {
            debug!(line = data, "Skipping unparseable SSE line: {e}");
            SseEvent::Skip
        }
    }
}

// ---------------------------------------------------------------------------
// Backend
// ---------------------------------------------------------------------------

pub struct OpenAiCompatibleBackend {
    http_client: reqwest::Client,
    base_url: String,
    model: String,
    api_key: Option<String>,
    stream: bool,
}

impl OpenAiCompatibleBackend {
    pub fn new(config: &InferenceConfig) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .context("failed to build HTTP client")?;
        let api_key = std::env::var(&config.api_key_env)
            .ok()
            .filter(|k| !k.is_empty());
        Ok(Self {
            http_client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            api_key,
            stream: config.stream,
        })
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }

    async fn send(
        &self,
        messages: &[Message],
        options: &GenerationOptions,
        stream: bool,
    ) -> Result<reqwest::Response, InferenceError> {
        let body = ChatCompletionRequest {
            model: &self.model,
            messages,
            max_tokens: options.max_tokens,
            temperature: options.temperature,
            stream,
            response_format: options.response_schema.as_ref().map(|schema| {
                json!({
                    "type": "json_schema",
                    "json_schema": { "name": "response", "schema": schema }
                })
            }),
        };
        let mut req = self.http_client.post(self.endpoint()).json(&body);
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }
        info!(model = %self.model, messages = messages.len(), stream, "Sending inference request");

        let resp = req.send().await.map_err(classify_transport)?;
        let status = resp.status();
        if !status.is_success() {
            let body_text = resp.text().await.unwrap_or_default();
            return Err(classify_status(status.as_u16(), &body_text));
        }
        Ok(resp)
    }

    async fn read_stream(
        &self,
        mut resp: reqwest::Response,
        cancel: &CancellationToken,
        on_token: Option<&TokenCallback<'_>>,
    ) -> Result<String, InferenceError> {
        let mut pending: Vec<u8> = Vec::new();
        let mut output = String::new();
        loop {
            let chunk = tokio::select! {
                _ = cancel.cancelled() => return Err(InferenceError::Cancelled),
                c = resp.chunk() => c.map_err(classify_transport)?,
            };
            let Some(bytes) = chunk else {
                break;
            };
            pending.extend_from_slice(&bytes);
            while let Some(pos) = pending.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = pending.drain(..=pos).collect();
                match parse_sse_line(&String::from_utf8_lossy(&line)) {
                    SseEvent::Token(t) => {
                        if let Some(cb) = on_token {
                            cb(&t);
                        }
                        output.push_str(&t);
                    }
                    SseEvent::Done => return Ok(output),
                    SseEvent::Skip => {}
                }
            }
        }
        if let SseEvent::Token(t) = parse_sse_line(&String::from_utf8_lossy(&pending)) {
            if let Some(cb) = on_token {
                cb(&t);
            }
            output.push_str(&t);
        }
        Ok(output)
    }
}

#[async_trait]
impl InferenceBackend for OpenAiCompatibleBackend {
    fn name(&self) -> &str {
        &self.model
    }

    async fn generate(
        &self,
        messages: &[Message],
        options: &GenerationOptions,
        cancel: &CancellationToken,
        on_token: Option<&TokenCallback<'_>>,
    ) -> Result<String, InferenceError> {
        let stream = self.stream && on_token.is_some();
        let resp = tokio::select! {
            _ = cancel.cancelled() => return Err(InferenceError::Cancelled),
            r = self.send(messages, options, stream) => r?,
        };

        if stream {
            return self.read_stream(resp, cancel, on_token).await;
        }

        let parsed: ChatCompletionResponse = tokio::select! {
            _ = cancel.cancelled() => return Err(InferenceError::Cancelled),
            r = resp.json() => r.map_err(classify_transport)?,
        };
        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message)
            .and_then(|m| m.content)
            .ok_or_else(|| InferenceError::InvalidResponse("response has no content".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert!(matches!(classify_status(401, ""), InferenceError::Auth(_)));
        assert!(matches!(classify_status(404, "model"), InferenceError::NoModelLoaded(_)));
        assert!(classify_status(429, "").is_transient());
        assert!(classify_status(503, "busy").is_transient());
        assert!(classify_status(408, "").is_transient());
        assert!(!classify_status(400, "bad").is_transient());
    }

    #[test]
    fn test_sse_lines() {
        assert_eq!(
            parse_sse_line(r#"data: {"choices":[{"delta":{"content":"Hel"},"finish_reason":null}]}"#),
            SseEvent::Token("Hel".into())
        );
        assert_eq!(parse_sse_line("data: [DONE]"), SseEvent::Done);
        assert_eq!(
            parse_sse_line(r#"data: {"choices":[{"delta":{},"finish_reason":"stop"}]}"#),
            SseEvent::Done
        );
        assert_eq!(parse_sse_line(": keep-alive"), SseEvent::Skip);
        assert_eq!(parse_sse_line(""), SseEvent::Skip);
    }

    #[test]
    fn test_request_serialization() {
        let messages = vec![Message::system("sys"), Message::user("hi")];
        let req = ChatCompletionRequest {
            model: "m",
            messages: &messages,
            max_tokens: 16,
            temperature: 0.1,
            stream: false,
            response_format: None,
        };
        let v = serde_json::to_value(&req).unwrap();
        assert_eq!(v["messages"][0]["role"], "system");
        assert_eq!(v["messages"][1]["content"], "hi");
        assert!(v.get("response_format").is_none());
    }

    #[test]
    fn test_response_deserialize() {
        let json = r#"{"choices":[{"message":{"role":"assistant","content":"Hi there!"},"finish_reason":"stop"}]}"#;
        let resp: ChatCompletionResponse = serde_json::from_str(json).unwrap();
        assert_eq!(
            resp.choices[0].message.as_ref().unwrap().content.as_deref(),
            Some("Hi there!")
        );
    }

    #[test]
    fn test_backend_from_config() {
        let config = InferenceConfig {
            base_url: "http://localhost:9999/v1/".into(),
            ..Default::default()
        };
        let backend = OpenAiCompatibleBackend::new(&config).unwrap();
        assert_eq!(backend.endpoint(), "http://localhost:9999/v1/chat/completions");
    }
}
