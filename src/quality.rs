//! Pluggable quality validator and threshold resolution (spec §4.6).
//!
//! Grounded on `dashflow-streaming::quality_gate::{QualityConfig,
//! QualityJudge}` — the `Arc<dyn Judge>`-as-custom-variant pattern and
//! the builder-style config — adapted to the spec's closed method variant
//! and threshold-resolution chain.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::complexity::Complexity;
use crate::domain::Domain;
use crate::error::Result;

/// Per-component scores contributing to a [`QualityScore`] (spec §3).
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct QualityComponents {
    /// How confident the model appeared to be (logprob or heuristic).
    pub confidence: f32,
    /// How well the response addresses the query's intent.
    pub alignment: f32,
    /// Structural well-formedness (valid syntax, expected shape).
    pub structure: f32,
    /// Safety/factuality score for sensitive domains.
    pub safety: f32,
}

/// Result of validating a draft response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualityScore {
    /// Overall score in `[0, 1]`.
    pub value: f32,
    /// Per-component breakdown.
    pub components: QualityComponents,
    /// Whether `value` cleared the resolved threshold.
    pub passed: bool,
    /// Reason for failure, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// A caller-supplied validator for the `Custom` method variant, or for a
/// `Semantic`/`Fact` method backed by an embedder/judge this crate does
/// not itself implement (spec §1: embedding model loading is out of
/// scope).
#[async_trait]
pub trait QualityJudge: Send + Sync {
    /// Score `response` to `query` given its complexity/domain context.
    async fn score(&self, query: &str, response: &str, complexity: Complexity, domain: Domain) -> Result<QualityScore>;
}

/// Closed set of validation strategies (spec §4.6, §9).
#[derive(Clone)]
pub enum QualityMethod {
    /// Always passes with `value = 1.0`.
    None,
    /// Length floor, non-empty, formatting sanity.
    Heuristic,
    /// Provider-reported token confidences averaged. `logprobs` must be
    /// supplied by the caller alongside the draft response.
    Logprob,
    /// Domain-specific syntax check (valid JSON/code parse).
    Syntax,
    /// Cosine similarity between query/response embeddings. Requires a
    /// [`QualityJudge`]; out of scope to implement the embedder itself.
    Semantic(Arc<dyn QualityJudge>),
    /// Stricter rule sets for sensitive domains (medical/legal). Requires
    /// a [`QualityJudge`].
    Fact(Arc<dyn QualityJudge>),
    /// Caller-supplied scoring function.
    Custom(Arc<dyn QualityJudge>),
}

impl fmt::Debug for QualityMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            QualityMethod::None => "None",
            QualityMethod::Heuristic => "Heuristic",
            QualityMethod::Logprob => "Logprob",
            QualityMethod::Syntax => "Syntax",
            QualityMethod::Semantic(_) => "Semantic(..)",
            QualityMethod::Fact(_) => "Fact(..)",
            QualityMethod::Custom(_) => "Custom(..)",
        };
        f.write_str(name)
    }
}

/// Complexity-adaptive default threshold map (spec §4.6).
#[must_use]
pub fn complexity_default_threshold(level: Complexity) -> f32 {
    match level {
        Complexity::Trivial | Complexity::Simple => 0.6,
        Complexity::Moderate => 0.7,
        Complexity::Hard => 0.8,
        Complexity::Expert => 0.85,
    }
}

/// Global fallback threshold when nothing more specific applies.
pub const GLOBAL_DEFAULT_THRESHOLD: f32 = 0.7;

/// Resolve the effective quality threshold: explicit per-request ->
/// domain config -> complexity-adaptive map -> global default.
#[must_use]
pub fn resolve_threshold(
    explicit: Option<f32>,
    domain_threshold: Option<f32>,
    complexity: Complexity,
) -> f32 {
    explicit
        .or(domain_threshold)
        .unwrap_or_else(|| complexity_default_threshold(complexity))
        .clamp(0.0, 1.0)
}

/// Stateless, pure scorers for the non-judge-backed methods.
#[derive(Debug, Default, Clone, Copy)]
pub struct QualityValidator;

impl QualityValidator {
    /// Construct the validator. Stateless; safe to share across requests.
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Heuristic score: non-empty, reasonable length, no dangling
    /// formatting markers.
    #[must_use]
    pub fn heuristic_score(&self, response: &str) -> QualityScore {
        let trimmed = response.trim();
        let non_empty = !trimmed.is_empty();
        let length_ok = trimmed.split_whitespace().count() >= 3;
        let balanced = trimmed.matches('`').count() % 2 == 0;

        let structure = if balanced { 1.0 } else { 0.5 };
        let confidence = if non_empty && length_ok { 0.9 } else { 0.2 };
        let value = (structure + confidence) / 2.0;

        QualityScore {
            value,
            components: QualityComponents {
                confidence,
                alignment: if non_empty { 0.8 } else { 0.0 },
                structure,
                safety: 1.0,
            },
            passed: false,
            reason: if non_empty && length_ok {
                None
            } else {
                Some("response is empty or too short".to_string())
            },
        }
    }

    /// Average provider-reported per-token confidences into a score.
    #[must_use]
    pub fn logprob_score(&self, token_logprobs: &[f32]) -> QualityScore {
        let value = if token_logprobs.is_empty() {
            0.0
        } else {
            // logprobs are <= 0; map to a [0,1] confidence via exp().
            let avg_logprob =
                token_logprobs.iter().sum::<f32>() / token_logprobs.len() as f32;
            avg_logprob.exp().clamp(0.0, 1.0)
        };
        QualityScore {
            value,
            components: QualityComponents {
                confidence: value,
                alignment: value,
                structure: value,
                safety: 1.0,
            },
            passed: false,
            reason: None,
        }
    }

    /// Domain-specific syntax validation (valid JSON/code parse for
    /// `code|data|structured|math|tool` domains).
    #[must_use]
    pub fn syntax_score(&self, response: &str, domain: Domain) -> QualityScore {
        let ok = match domain {
            Domain::Structured | Domain::Data | Domain::Tool => {
                serde_json::from_str::<serde_json::Value>(response).is_ok()
            }
            Domain::Code => response.contains('{') == response.contains('}'),
            _ => true,
        };
        let value = if ok { 1.0 } else { 0.2 };
        QualityScore {
            value,
            components: QualityComponents {
                confidence: value,
                alignment: value,
                structure: value,
                safety: 1.0,
            },
            passed: false,
            reason: if ok {
                None
            } else {
                Some(format!("response failed syntax check for domain {domain:?}"))
            },
        }
    }

    /// Apply `threshold` to a raw score and stamp `passed`/`reason`.
    #[must_use]
    pub fn finalize(mut score: QualityScore, threshold: f32) -> QualityScore {
        score.passed = score.value >= threshold;
        if !score.passed && score.reason.is_none() {
            score.reason = Some(format!(
                "quality {:.2} below threshold {:.2}",
                score.value, threshold
            ));
        }
        score
    }
}
