//! LLM gateway trait and normalized request/response types.
//!
//! The [`Gateway`] trait abstracts over completion providers. The pipeline
//! always sends exactly two messages per stage attempt — a fixed system
//! instruction plus the stage prompt as the user message — and expects a
//! text response containing JSON.
//!
//! Built-in implementations: [`ChatGateway`] (OpenAI-compatible
//! `/v1/chat/completions`) and [`MockGateway`] (canned responses for tests
//! and demos).

pub mod backoff;
pub mod chat;
pub mod mock;

pub use backoff::BackoffConfig;
pub use chat::ChatGateway;
pub use mock::MockGateway;

use std::sync::Arc;

use async_trait::async_trait;
use reqwest::Client;

use crate::error::{PipelineError, Result};

/// A normalized completion request — provider-agnostic.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    /// Model identifier (e.g. `"gpt-4o-mini"`).
    pub model: String,

    /// Ordered chat messages. The pipeline sends a system instruction
    /// followed by the stage prompt.
    pub messages: Vec<ChatMessage>,

    /// Sampling temperature. Extraction wants it low.
    pub temperature: f64,

    /// Maximum tokens to generate.
    pub max_tokens: u32,

    /// Request JSON-formatted output from providers that support it.
    pub json_mode: bool,
}

impl CompletionRequest {
    pub fn new(model: impl Into<String>, messages: Vec<ChatMessage>) -> Self {
        Self {
            model: model.into(),
            messages,
            temperature: 0.2,
            max_tokens: 4096,
            json_mode: false,
        }
    }

    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_json_mode(mut self, enabled: bool) -> Self {
        self.json_mode = enabled;
        self
    }
}

/// A single message in a chat conversation.
#[derive(Debug, Clone)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
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
}

/// The role of a chat message author.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

/// A normalized completion response.
#[derive(Debug)]
pub struct GatewayResponse {
    /// The generated text content.
    pub text: String,

    /// HTTP status code (for diagnostics/logging).
    pub status: u16,

    /// Provider-specific metadata (token counts, model info).
    pub metadata: Option<serde_json::Value>,
}

/// Abstraction over completion providers.
///
/// Implementors translate between the normalized request/response types and
/// the provider's HTTP API, raising on transport or auth failure. The trait
/// is object-safe and used as `Arc<dyn Gateway>`.
#[async_trait]
pub trait Gateway: Send + Sync {
    /// Execute a completion call.
    async fn complete(
        &self,
        client: &Client,
        base_url: &str,
        request: &CompletionRequest,
    ) -> Result<GatewayResponse>;

    /// Human-readable name for logging and diagnostics.
    fn name(&self) -> &'static str;
}

/// Check whether a [`PipelineError`] is retryable based on the backoff config.
///
/// Retryable conditions:
/// - [`PipelineError::HttpError`] with a status in `config.retryable_statuses`
/// - [`PipelineError::Request`] (connection/transport errors)
pub fn is_retryable(error: &PipelineError, config: &BackoffConfig) -> bool {
    match error {
        PipelineError::HttpError { status, .. } => config.retryable_statuses.contains(status),
        PipelineError::Request(_) => true,
        _ => false,
    }
}

/// Execute a gateway call with transport-level retry and exponential backoff.
///
/// Wraps [`Gateway::complete`] with automatic retry on transient failures
/// (429, 5xx, connection errors), honoring `Retry-After` when configured.
/// Returns the first successful response, or the last error once retries
/// are exhausted.
pub async fn with_backoff(
    gateway: &Arc<dyn Gateway>,
    client: &Client,
    base_url: &str,
    request: &CompletionRequest,
    config: &BackoffConfig,
) -> Result<GatewayResponse> {
    let mut last_error: Option<PipelineError> = None;

    for attempt in 0..=config.max_retries {
        if attempt > 0 {
            let delay = if let Some(PipelineError::HttpError {
                retry_after: Some(ra),
                ..
            }) = &last_error
            {
                if config.respect_retry_after {
                    *ra
                } else {
                    config.delay_for_attempt(attempt - 1)
                }
            } else {
                config.delay_for_attempt(attempt - 1)
            };

            let reason = last_error
                .as_ref()
                .map(|e| e.to_string())
                .unwrap_or_default();
            tracing::warn!(attempt, delay_ms = delay.as_millis() as u64, %reason, "retrying model call");

            tokio::time::sleep(delay).await;
        }

        match gateway.complete(client, base_url, request).await {
            Ok(response) => return Ok(response),
            Err(e) => {
                if attempt < config.max_retries && is_retryable(&e, config) {
                    last_error = Some(e);
                    continue;
                }
                return Err(e);
            }
        }
    }

    Err(last_error.unwrap_or(PipelineError::Other(
        "backoff loop exited unexpectedly".into(),
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_is_retryable_429() {
        let config = BackoffConfig::standard();
        let err = PipelineError::HttpError {
            status: 429,
            body: "rate limited".into(),
            retry_after: None,
        };
        assert!(is_retryable(&err, &config));
    }

    #[test]
    fn test_is_retryable_400_not_retried() {
        let config = BackoffConfig::standard();
        let err = PipelineError::HttpError {
            status: 400,
            body: "bad request".into(),
            retry_after: None,
        };
        assert!(!is_retryable(&err, &config));
    }

    #[test]
    fn test_is_retryable_other_error_not_retried() {
        let config = BackoffConfig::standard();
        assert!(!is_retryable(&PipelineError::Other("nope".into()), &config));
        assert!(!is_retryable(&PipelineError::Cancelled, &config));
    }

    #[tokio::test]
    async fn test_with_backoff_exhausts_and_returns_last_error() {
        struct AlwaysBusy;

        #[async_trait]
        impl Gateway for AlwaysBusy {
            async fn complete(
                &self,
                _client: &Client,
                _base_url: &str,
                _request: &CompletionRequest,
            ) -> Result<GatewayResponse> {
                Err(PipelineError::HttpError {
                    status: 503,
                    body: "busy".into(),
                    retry_after: None,
                })
            }

            fn name(&self) -> &'static str {
                "always-busy"
            }
        }

        let gateway: Arc<dyn Gateway> = Arc::new(AlwaysBusy);
        let client = Client::new();
        let request = CompletionRequest::new("test", vec![ChatMessage::user("hi")]);
        let mut config = BackoffConfig::standard();
        config.max_retries = 2;
        config.initial_delay = Duration::from_millis(1);
        config.jitter = backoff::JitterStrategy::None;

        let err = with_backoff(&gateway, &client, "http://unused", &request, &config)
            .await
            .unwrap_err();
        match err {
            PipelineError::HttpError { status, .. } => assert_eq!(status, 503),
            other => panic!("expected HttpError, got {:?}", other),
        }
    }

    #[test]
    fn test_completion_request_builder() {
        let request = CompletionRequest::new(
            "gpt-4o-mini",
            vec![ChatMessage::system("extract"), ChatMessage::user("rules")],
        )
        .with_temperature(0.0)
        .with_max_tokens(1024)
        .with_json_mode(true);

        assert_eq!(request.model, "gpt-4o-mini");
        assert_eq!(request.messages.len(), 2);
        assert_eq!(request.messages[0].role, Role::System);
        assert_eq!(request.temperature, 0.0);
        assert!(request.json_mode);
    }
}
