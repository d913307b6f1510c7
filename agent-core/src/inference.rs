//! Inference backend abstraction and retry policy

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GenerationOptions {
    pub temperature: f32,
    pub max_tokens: u32,
    /// Force the output to match this JSON schema when the backend supports it
    pub response_schema: Option<serde_json::Value>,
}

impl Default for GenerationOptions {
    fn default() -> Self {
        Self {
            temperature: 0.2,
            max_tokens: 2048,
            response_schema: None,
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum InferenceError {
    #[error("network error: {0}")]
    Network(String),
    #[error("request timed out: {0}")]
    Timeout(String),
    #[error("rate limited: {0}")]
    RateLimited(String),
    #[error("server error ({status}): {message}")]
    Server { status: u16, message: String },
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("no model loaded: {0}")]
    NoModelLoaded(String),
    #[error("invalid response: {0}")]
    InvalidResponse(String),
    #[error("generation cancelled")]
    Cancelled,
}

impl InferenceError {
    /// Worth another attempt after a backoff
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Network(_) | Self::Timeout(_) | Self::RateLimited(_) | Self::Server { .. }
        )
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Network(_) => "network",
            Self::Timeout(_) => "timeout",
            Self::RateLimited(_) => "rate_limited",
            Self::Server { .. } => "server",
            Self::Auth(_) => "auth",
            Self::NoModelLoaded(_) => "no_model",
            Self::InvalidResponse(_) => "invalid_response",
            Self::Cancelled => "cancelled",
        }
    }
}

/// Streaming token sink
pub type TokenCallback<'a> = dyn Fn(&str) + Send + Sync + 'a;

#[async_trait]
pub trait InferenceBackend: Send + Sync {
    fn name(&self) -> &str;

    /// Produce one complete response. Tokens are forwarded to `on_token` as
    /// they arrive when the backend streams. Must return promptly once
    /// `cancel` fires.
    async fn generate(
        &self,
        messages: &[Message],
        options: &GenerationOptions,
        cancel: &CancellationToken,
        on_token: Option<&TokenCallback<'_>>,
    ) -> Result<String, InferenceError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
        }
    }

    /// Delay after the `attempt`-th failure (1-based): base, 2×base, 4×base, …
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay * 2u32.saturating_pow(attempt.saturating_sub(1))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_secs(1))
    }
}

/// Call the backend, retrying transient failures with exponential backoff.
/// Cancellation wins over both the in-flight call and the backoff sleep.
pub async fn generate_with_retry(
    backend: &dyn InferenceBackend,
    messages: &[Message],
    options: &GenerationOptions,
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    on_token: Option<&TokenCallback<'_>>,
    mut on_retry: impl FnMut(u32, &InferenceError),
) -> Result<String, InferenceError> {
    let mut attempt = 0;
    loop {
        if cancel.is_cancelled() {
            return Err(InferenceError::Cancelled);
        }
        attempt += 1;

        let result = tokio::select! {
            _ = cancel.cancelled() => Err(InferenceError::Cancelled),
            r = backend.generate(messages, options, cancel, on_token) => r,
        };
        let err = match result {
            Ok(text) => return Ok(text),
            Err(e) => e,
        };
        if !err.is_transient() || attempt >= policy.max_attempts || cancel.is_cancelled() {
            return Err(if cancel.is_cancelled() {
                InferenceError::Cancelled
            } else {
                err
            });
        }

        let delay = policy.delay_for(attempt);
        warn!(
            backend = backend.name(),
            attempt,
            max = policy.max_attempts,
            "Inference failed ({err}), retrying in {}ms",
            delay.as_millis()
        );
        on_retry(attempt, &err);
        tokio::select! {
            _ = cancel.cancelled() => return Err(InferenceError::Cancelled),
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    struct Scripted {
        replies: Mutex<Vec<Result<String, InferenceError>>>,
        calls: AtomicU32,
    }

    impl Scripted {
        fn new(mut replies: Vec<Result<String, InferenceError>>) -> Self {
            replies.reverse();
            Self {
                replies: Mutex::new(replies),
                calls: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl InferenceBackend for Scripted {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn generate(
            &self,
            _messages: &[Message],
            _options: &GenerationOptions,
            _cancel: &CancellationToken,
            _on_token: Option<&TokenCallback<'_>>,
        ) -> Result<String, InferenceError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.replies
                .lock()
                .unwrap()
                .pop()
                .unwrap_or_else(|| Err(InferenceError::InvalidResponse("script exhausted".into())))
        }
    }

    fn net() -> Result<String, InferenceError> {
        Err(InferenceError::Network("connection refused".into()))
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_then_success() {
        let backend = Scripted::new(vec![net(), Ok("done".into())]);
        let mut retries = Vec::new();
        let out = generate_with_retry(
            &backend,
            &[Message::user("hi")],
            &GenerationOptions::default(),
            &RetryPolicy::default(),
            &CancellationToken::new(),
            None,
            |n, _| retries.push(n),
        )
        .await;
        assert_eq!(out.unwrap(), "done");
        assert_eq!(retries, vec![1]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_three_transient_failures_stop() {
        let backend = Scripted::new(vec![net(), net(), net(), Ok("never".into())]);
        let out = generate_with_retry(
            &backend,
            &[],
            &GenerationOptions::default(),
            &RetryPolicy::default(),
            &CancellationToken::new(),
            None,
            |_, _| {},
        )
        .await;
        assert!(matches!(out, Err(InferenceError::Network(_))));
        assert_eq!(backend.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_not_retried() {
        let backend = Scripted::new(vec![Err(InferenceError::Auth("bad key".into()))]);
        let out = generate_with_retry(
            &backend,
            &[],
            &GenerationOptions::default(),
            &RetryPolicy::default(),
            &CancellationToken::new(),
            None,
            |_, _| {},
        )
        .await;
        assert!(matches!(out, Err(InferenceError::Auth(_))));
        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancel_during_backoff() {
        let backend = Scripted::new(vec![net(), Ok("late".into())]);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });
        let out = generate_with_retry(
            &backend,
            &[],
            &GenerationOptions::default(),
            &RetryPolicy::new(3, Duration::from_secs(30)),
            &cancel,
            None,
            |_, _| {},
        )
        .await;
        assert_eq!(out, Err(InferenceError::Cancelled));
        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_backoff_schedule() {
        let p = RetryPolicy::default();
        assert_eq!(p.delay_for(1), Duration::from_secs(1));
        assert_eq!(p.delay_for(2), Duration::from_secs(2));
        assert_eq!(p.delay_for(3), Duration::from_secs(4));
    }
}
