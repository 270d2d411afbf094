//! Provider interface (spec §4.1).
//!
//! This is a contract only — concrete provider HTTP clients (OpenAI,
//! Anthropic, Groq, vLLM, Ollama, OpenRouter, ...) are out of scope (spec
//! §1) and live in adapters outside this crate. Grounded on the
//! `generate`/`stream` contract shape described in `dashflow-openai`'s
//! module docs.

use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use serde_json::Value;

use crate::error::Result;
use crate::message::{Message, ToolCall};
use crate::tool_call::ToolSpec;
use crate::usage::Usage;

/// A single outbound call to a provider.
#[derive(Debug, Clone)]
pub struct ProviderRequest {
    /// Model identifier to invoke.
    pub model: String,
    /// The full transcript to send.
    pub messages: Vec<Message>,
    /// Generation cap, if set.
    pub max_tokens: Option<u32>,
    /// Sampling temperature, if set.
    pub temperature: Option<f32>,
    /// Tool schemas to offer the model, if any.
    pub tools: Vec<ToolSpec>,
    /// Opaque, provider-specific extras (top_p, stop sequences, ...).
    pub extra: Value,
}

/// Why a provider call stopped generating.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishReason {
    /// Generation completed naturally.
    Stop,
    /// `max_tokens` was reached.
    Length,
    /// The model emitted one or more tool calls.
    ToolCalls,
    /// Generation was stopped by a content filter.
    ContentFilter,
    /// Reason not reported or not recognized.
    Other,
}

/// A complete, non-streamed provider response.
#[derive(Debug, Clone)]
pub struct ProviderResponse {
    /// Generated text content.
    pub content: String,
    /// Model that actually served the request (may differ from the
    /// requested alias, e.g. after provider-side routing).
    pub model: String,
    /// Reported token usage, if the provider supplied it.
    pub usage: Option<Usage>,
    /// Why generation stopped.
    pub finish_reason: FinishReason,
    /// Tool calls requested by the model, if any.
    pub tool_calls: Vec<ToolCall>,
    /// Per-token log-probabilities, if the provider reported them. Feeds
    /// the `logprob` quality method (spec §4.6); absent for providers
    /// that don't expose them.
    pub token_logprobs: Option<Vec<f32>>,
}

/// One increment of a streamed provider response. For a single call,
/// chunks arrive in generation order; the final chunk carries `done=true`
/// plus `usage`, if the upstream supplied it (spec §4.1).
#[derive(Debug, Clone)]
pub struct ProviderChunk {
    /// Incremental text content for this chunk, if any.
    pub content_delta: Option<String>,
    /// Incremental tool-call fragment, if any (accumulated by the
    /// streaming engine into complete [`ToolCall`]s).
    pub tool_call_delta: Option<ToolCallDelta>,
    /// Whether this is the terminal chunk of the stream.
    pub done: bool,
    /// Final usage, populated only on the terminal chunk when reported.
    pub usage: Option<Usage>,
    /// Final finish reason, populated only on the terminal chunk.
    pub finish_reason: Option<FinishReason>,
}

/// A partial tool-call fragment as it streams in.
#[derive(Debug, Clone)]
pub struct ToolCallDelta {
    /// Index of the tool call within the assistant turn (for providers
    /// that stream multiple parallel calls interleaved).
    pub index: usize,
    /// Call id, present once known.
    pub id: Option<String>,
    /// Tool name, present once known.
    pub name: Option<String>,
    /// Incremental arguments-string fragment.
    pub arguments_delta: Option<String>,
}

/// Boxed stream of provider chunks, as returned by [`Provider::stream`].
pub type ProviderChunkStream = Pin<Box<dyn Stream<Item = Result<ProviderChunk>> + Send>>;

/// Uniform generate/stream contract over heterogeneous LLM backends.
///
/// Providers are stateless; authentication is attached per-request from
/// the caller's [`crate::model::ModelConfig`], not held as provider
/// state. Errors are categorized per spec §7.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Generate a complete response for `request`.
    async fn generate(&self, request: ProviderRequest) -> Result<ProviderResponse>;

    /// Stream a response for `request` as a lazy sequence of chunks.
    async fn stream(&self, request: ProviderRequest) -> Result<ProviderChunkStream>;
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn provider_request_carries_expected_fields() {
        let request = ProviderRequest {
            model: "gpt-4o-mini".into(),
            messages: vec![Message::user("hi")],
            max_tokens: Some(100),
            temperature: Some(0.7),
            tools: vec![],
            extra: Value::Null,
        };
        assert_eq!(request.model, "gpt-4o-mini");
        assert_eq!(request.messages.len(), 1);
    }

    #[test]
    fn finish_reason_equality() {
        assert_eq!(FinishReason::Stop, FinishReason::Stop);
        assert_ne!(FinishReason::Stop, FinishReason::Length);
    }
}
