//! Mock gateway for testing without a live model.
//!
//! [`MockGateway`] returns pre-configured outcomes in order, allowing
//! deterministic tests of the full pipeline, including transport failures
//! and slow responses.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;

use super::{CompletionRequest, Gateway, GatewayResponse};
use crate::error::{PipelineError, Result};

/// One scripted outcome: a canned response text or a transport failure.
#[derive(Debug, Clone)]
pub enum MockOutcome {
    Reply(String),
    Fail(String),
}

/// A test gateway that returns scripted outcomes in order.
///
/// Cycles back to the beginning when all outcomes have been consumed. An
/// optional per-call delay makes the in-flight window observable in tests.
#[derive(Debug)]
pub struct MockGateway {
    outcomes: Vec<MockOutcome>,
    index: AtomicUsize,
    delay: Option<Duration>,
}

impl MockGateway {
    /// Create a mock returning the given response texts in order.
    pub fn new(responses: Vec<String>) -> Self {
        assert!(!responses.is_empty(), "MockGateway requires at least one response");
        Self {
            outcomes: responses.into_iter().map(MockOutcome::Reply).collect(),
            index: AtomicUsize::new(0),
            delay: None,
        }
    }

    /// Create a mock that always returns the same response.
    pub fn fixed(response: impl Into<String>) -> Self {
        Self::new(vec![response.into()])
    }

    /// Create a mock from explicit outcomes, including failures.
    pub fn scripted(outcomes: Vec<MockOutcome>) -> Self {
        assert!(!outcomes.is_empty(), "MockGateway requires at least one outcome");
        Self {
            outcomes,
            index: AtomicUsize::new(0),
            delay: None,
        }
    }

    /// Create a mock whose every call fails with the given message.
    pub fn failing(message: impl Into<String>) -> Self {
        Self::scripted(vec![MockOutcome::Fail(message.into())])
    }

    /// Sleep this long before answering each call.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    fn next_outcome(&self) -> MockOutcome {
        let idx = self.index.fetch_add(1, Ordering::Relaxed) % self.outcomes.len();
        self.outcomes[idx].clone()
    }

    /// How many calls have been made so far.
    pub fn calls(&self) -> usize {
        self.index.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Gateway for MockGateway {
    async fn complete(
        &self,
        _client: &Client,
        _base_url: &str,
        _request: &CompletionRequest,
    ) -> Result<GatewayResponse> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        match self.next_outcome() {
            MockOutcome::Reply(text) => Ok(GatewayResponse {
                text,
                status: 200,
                metadata: None,
            }),
            MockOutcome::Fail(message) => Err(PipelineError::Other(message)),
        }
    }

    fn name(&self) -> &'static str {
        "mock"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_request() -> CompletionRequest {
        CompletionRequest::new("test", vec![crate::gateway::ChatMessage::user("hi")])
    }

    #[tokio::test]
    async fn test_mock_fixed_response() {
        let mock = MockGateway::fixed("{\"a\": 1}");
        let client = Client::new();
        let resp = mock
            .complete(&client, "http://unused", &test_request())
            .await
            .unwrap();
        assert_eq!(resp.text, "{\"a\": 1}");
        assert_eq!(resp.status, 200);
    }

    #[tokio::test]
    async fn test_mock_cycles_responses() {
        let mock = MockGateway::new(vec!["first".into(), "second".into()]);
        let client = Client::new();
        let request = test_request();
        let r1 = mock.complete(&client, "http://unused", &request).await.unwrap();
        let r2 = mock.complete(&client, "http://unused", &request).await.unwrap();
        let r3 = mock.complete(&client, "http://unused", &request).await.unwrap();
        assert_eq!(r1.text, "first");
        assert_eq!(r2.text, "second");
        assert_eq!(r3.text, "first"); // cycles
        assert_eq!(mock.calls(), 3);
    }

    #[tokio::test]
    async fn test_mock_scripted_failure() {
        let mock = MockGateway::scripted(vec![
            MockOutcome::Fail("connection reset".into()),
            MockOutcome::Reply("ok".into()),
        ]);
        let client = Client::new();
        let request = test_request();
        let err = mock
            .complete(&client, "http://unused", &request)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("connection reset"));
        let ok = mock.complete(&client, "http://unused", &request).await.unwrap();
        assert_eq!(ok.text, "ok");
    }
}
