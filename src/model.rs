//! Model configuration (spec §3 `ModelConfig`).
//!
//! Supplied by the caller at agent construction and immutable during a
//! request; a new agent is built for a new model configuration.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Closed provider variant (spec §9: "Model as a closed variant"). Each
/// name corresponds to a provider family; concrete HTTP clients live in
/// adapters outside this crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum Provider {
    /// OpenAI and OpenAI-compatible chat completion endpoints.
    OpenAi,
    /// Anthropic Claude models.
    Anthropic,
    /// Groq-hosted inference.
    Groq,
    /// Together AI.
    Together,
    /// Self-hosted Ollama.
    Ollama,
    /// Self-hosted vLLM.
    VLlm,
    /// Hugging Face inference endpoints.
    HuggingFace,
    /// OpenRouter aggregator.
    OpenRouter,
    /// Caller-defined provider not covered above.
    Custom,
}

/// A single model's capabilities, pricing, and connection hints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Model identifier as understood by the provider (e.g. `gpt-4o-mini`).
    pub name: String,
    /// Which provider family serves this model.
    pub provider: Provider,
    /// USD cost per 1,000 input tokens.
    pub cost_per_1k_input: f64,
    /// USD cost per 1,000 output tokens.
    pub cost_per_1k_output: f64,
    /// USD cost per 1,000 cached input tokens, if the provider discounts
    /// cache hits. `None` means "unknown"; cost math treats it as zero and
    /// never reports a saving attributable to caching in that case.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost_per_1k_cached: Option<f64>,
    /// Maximum context/generation tokens this model accepts.
    pub max_tokens: u32,
    /// Whether this model can be given tool/function schemas.
    pub supports_tools: bool,
    /// Relative quality score in `[0, 1]`, used for router tie-breaks.
    pub quality_score: f32,
    /// Typical response latency in milliseconds, used for router
    /// tie-breaks.
    pub speed_ms: u32,
    /// API key reference (never the raw secret value in logs/Debug paths
    /// a caller might print — adapters resolve the actual credential).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    /// Override base URL, for self-hosted or proxy deployments.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    /// Whether this model is deprecated and should be excluded from
    /// routing even if otherwise capable.
    #[serde(default)]
    pub deprecated: bool,
    /// Opaque provider-specific extras (sampling params, routing hints).
    #[serde(default)]
    pub extra: HashMap<String, Value>,
}

impl ModelConfig {
    /// Estimate the USD cost of `input_tokens`/`output_tokens` using this
    /// model's per-1k pricing. See [`crate::cost`] for the canonical
    /// resolution-priority calculator; this is the model's own local
    /// fallback, used when no external price book entry exists.
    #[must_use]
    pub fn estimate_cost(&self, input_tokens: u64, output_tokens: u64) -> f64 {
        (input_tokens as f64 / 1000.0) * self.cost_per_1k_input
            + (output_tokens as f64 / 1000.0) * self.cost_per_1k_output
    }

    /// Whether this model is a legal routing candidate given the request's
    /// requirements: not deprecated, supports tools if tools are present,
    /// and `max_tokens` covers the requested generation cap.
    #[must_use]
    pub fn is_capable(&self, needs_tools: bool, requested_max_tokens: Option<u32>) -> bool {
        if self.deprecated {
            return false;
        }
        if needs_tools && !self.supports_tools {
            return false;
        }
        if let Some(requested) = requested_max_tokens {
            if requested > self.max_tokens {
                return false;
            }
        }
        true
    }
}
