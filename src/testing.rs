//! Deterministic test doubles (SPEC_FULL.md §A.4, §B).
//!
//! Grounded on `dashflow-testing::mock_tool::MockTool`'s scripted-response
//! pattern: a test double that records every call it served and replays a
//! fixed queue of responses, so pipeline tests never depend on wall clock
//! or network state.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use futures::stream;

use crate::error::{Error, Result};
use crate::provider::{Provider, ProviderChunk, ProviderChunkStream, ProviderRequest, ProviderResponse};

/// Injectable source of trace ids, so pipeline tests can assert against a
/// known value instead of a random UUID (SPEC_FULL.md §B).
pub trait TraceIdSource: Send + Sync {
    /// Produce the next trace id.
    fn next_id(&self) -> String;
}

/// Default production source: a random UUID per call.
#[derive(Debug, Default, Clone, Copy)]
pub struct RandomTraceIdSource;

impl TraceIdSource for RandomTraceIdSource {
    fn next_id(&self) -> String {
        uuid::Uuid::new_v4().to_string()
    }
}

/// Deterministic source for tests: `{prefix}-{n}` counting up from zero.
#[derive(Debug)]
pub struct SequentialTraceIdSource {
    prefix: String,
    counter: AtomicUsize,
}

impl SequentialTraceIdSource {
    /// Build a source that yields `{prefix}-0`, `{prefix}-1`, ...
    #[must_use]
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            counter: AtomicUsize::new(0),
        }
    }
}

impl TraceIdSource for SequentialTraceIdSource {
    fn next_id(&self) -> String {
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        format!("{}-{n}", self.prefix)
    }
}

/// A scripted [`Provider`] that replays a fixed queue of responses in
/// order, one per call to `generate`, recording every request it served.
///
/// Exhausting the queue is a test-authoring bug, not a runtime condition
/// the pipeline should handle gracefully, so it panics with a clear
/// message rather than returning an error a real provider would never
/// produce.
pub struct StubProvider {
    responses: Mutex<Vec<ProviderResponse>>,
    requests: Mutex<Vec<ProviderRequest>>,
}

impl StubProvider {
    /// Build a stub that replays `responses` in order, one per call.
    #[must_use]
    pub fn new(responses: Vec<ProviderResponse>) -> Self {
        Self {
            responses: Mutex::new(responses),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Every request this stub has served so far, in call order.
    #[must_use]
    pub fn recorded_requests(&self) -> Vec<ProviderRequest> {
        self.requests.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// How many calls this stub has served.
    #[must_use]
    pub fn call_count(&self) -> usize {
        self.requests.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

#[async_trait]
impl Provider for StubProvider {
    async fn generate(&self, request: ProviderRequest) -> Result<ProviderResponse> {
        self.requests.lock().unwrap_or_else(|e| e.into_inner()).push(request);
        let mut responses = self.responses.lock().unwrap_or_else(|e| e.into_inner());
        if responses.is_empty() {
            panic!("StubProvider: response queue exhausted; script more responses");
        }
        Ok(responses.remove(0))
    }

    async fn stream(&self, request: ProviderRequest) -> Result<ProviderChunkStream> {
        let response = self.generate(request).await?;
        let chunk = ProviderChunk {
            content_delta: Some(response.content),
            tool_call_delta: None,
            done: true,
            usage: response.usage,
            finish_reason: Some(response.finish_reason),
        };
        Ok(Box::pin(stream::iter(vec![Ok(chunk)])))
    }
}

/// A [`Provider`] that always fails with a [`Error::TransientProvider`],
/// for exercising retry/backoff paths.
pub struct FailingProvider {
    reason: String,
}

impl FailingProvider {
    /// Build a provider that fails every call with `reason`.
    #[must_use]
    pub fn new(reason: impl Into<String>) -> Self {
        Self { reason: reason.into() }
    }
}

#[async_trait]
impl Provider for FailingProvider {
    async fn generate(&self, _request: ProviderRequest) -> Result<ProviderResponse> {
        Err(Error::transient_provider(self.reason.clone(), 1))
    }

    async fn stream(&self, _request: ProviderRequest) -> Result<ProviderChunkStream> {
        Err(Error::transient_provider(self.reason.clone(), 1))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::provider::FinishReason;
    use serde_json::Value;

    fn response(content: &str) -> ProviderResponse {
        ProviderResponse {
            content: content.into(),
            model: "stub".into(),
            usage: None,
            finish_reason: FinishReason::Stop,
            tool_calls: vec![],
            token_logprobs: None,
        }
    }

    fn request() -> ProviderRequest {
        ProviderRequest {
            model: "stub".into(),
            messages: vec![],
            max_tokens: None,
            temperature: None,
            tools: vec![],
            extra: Value::Null,
        }
    }

    #[tokio::test]
    async fn stub_provider_replays_responses_in_order() {
        let provider = StubProvider::new(vec![response("first"), response("second")]);
        let first = provider.generate(request()).await.unwrap();
        let second = provider.generate(request()).await.unwrap();
        assert_eq!(first.content, "first");
        assert_eq!(second.content, "second");
        assert_eq!(provider.call_count(), 2);
    }

    #[tokio::test]
    #[should_panic(expected = "response queue exhausted")]
    async fn stub_provider_panics_when_queue_is_exhausted() {
        let provider = StubProvider::new(vec![]);
        let _ = provider.generate(request()).await;
    }

    #[tokio::test]
    async fn failing_provider_returns_transient_error() {
        let provider = FailingProvider::new("connection reset");
        let err = provider.generate(request()).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::TransientProvider);
    }

    #[test]
    fn sequential_trace_id_source_counts_up() {
        let source = SequentialTraceIdSource::new("t");
        assert_eq!(source.next_id(), "t-0");
        assert_eq!(source.next_id(), "t-1");
    }
}
