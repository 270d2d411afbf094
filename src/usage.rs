//! Token usage and cost accounting (spec §3 `Usage`, `CostBreakdown`).

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Token counts for a single provider call.
///
/// `cached_input_tokens` is optional; when absent, cost math treats it as
/// zero and never reports savings attributable to caching (spec §3, §9
/// "Cost correctness is load-bearing").
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    /// Tokens consumed by the prompt.
    pub input_tokens: u64,
    /// Tokens produced by the model.
    pub output_tokens: u64,
    /// Tokens served from a provider-side cache, if reported.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cached_input_tokens: Option<u64>,
}

impl Usage {
    /// Construct a usage record with no cache information.
    #[must_use]
    pub fn new(input_tokens: u64, output_tokens: u64) -> Self {
        Self {
            input_tokens,
            output_tokens,
            cached_input_tokens: None,
        }
    }

    /// Total tokens, `input + output` (cached tokens are a subset of
    /// input and are not counted twice).
    #[must_use]
    pub fn total_tokens(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }

    /// Sum two usage records field-wise. Used when a draft is rejected and
    /// both draft and verifier usage must be combined, and for the
    /// associativity property in spec §8.
    #[must_use]
    pub fn combine(self, other: Usage) -> Usage {
        Usage {
            input_tokens: self.input_tokens + other.input_tokens,
            output_tokens: self.output_tokens + other.output_tokens,
            cached_input_tokens: match (self.cached_input_tokens, other.cached_input_tokens) {
                (None, None) => None,
                (a, b) => Some(a.unwrap_or(0) + b.unwrap_or(0)),
            },
        }
    }
}

/// Fallback token estimator from raw text, used only when a provider does
/// not report usage (spec §4.2): `max(1, round(1.3 * word_count))`.
#[must_use]
pub fn estimate_tokens(text: &str) -> u64 {
    let word_count = text.split_whitespace().count();
    let estimate = (word_count as f64 * 1.3).round() as i64;
    estimate.max(1) as u64
}

/// Full cost accounting for one cascade request (spec §3, §4.2).
///
/// `cost_saved` is signed: negative when the draft was rejected (wasted
/// draft spend), per spec §3/§8 invariant 3.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CostBreakdown {
    /// USD cost of the drafter call, `0.0` if no drafter was used.
    pub draft_cost: f64,
    /// USD cost of the verifier call, `0.0` if no verifier was used.
    pub verifier_cost: f64,
    /// `draft_cost + verifier_cost`.
    pub total_cost: f64,
    /// Hypothetical cost had the whole request been served by the
    /// verifier alone.
    pub bigonly_cost: f64,
    /// `bigonly_cost - total_cost`. Positive for accepted drafts, negative
    /// for rejected ones.
    pub cost_saved: f64,
    /// `cost_saved / bigonly_cost * 100`, `0.0` if `bigonly_cost` is zero.
    pub savings_percent: f64,
    /// Tokens consumed by the drafter.
    pub draft_tokens: u64,
    /// Tokens consumed by the verifier.
    pub verifier_tokens: u64,
    /// `draft_tokens + verifier_tokens`.
    pub total_tokens: u64,
    /// Whether the cascade strategy was used (as opposed to direct/skip).
    pub was_cascaded: bool,
    /// Whether the draft was accepted without escalation.
    pub draft_accepted: bool,
    /// Whether usage was estimated (no provider-reported usage was
    /// available for at least one call). `estimated=true` suppresses
    /// "savings" framing in any UI built atop this breakdown.
    pub estimated: bool,
    /// Free-form metadata (model names, strategy, etc.) for audit.
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
}

impl CostBreakdown {
    /// Build the breakdown for an accepted draft: only the draft is
    /// billed; `bigonly_cost` is the hypothetical verifier cost for the
    /// same input/output token counts.
    #[must_use]
    pub fn draft_accepted(draft_cost: f64, draft_tokens: u64, bigonly_cost: f64, estimated: bool) -> Self {
        let cost_saved = bigonly_cost - draft_cost;
        Self {
            draft_cost,
            verifier_cost: 0.0,
            total_cost: draft_cost,
            bigonly_cost,
            cost_saved,
            savings_percent: savings_percent(cost_saved, bigonly_cost),
            draft_tokens,
            verifier_tokens: 0,
            total_tokens: draft_tokens,
            was_cascaded: true,
            draft_accepted: true,
            estimated,
            metadata: HashMap::new(),
        }
    }

    /// Build the breakdown for a rejected draft: both draft and verifier
    /// are billed; `bigonly_cost` equals the verifier cost actually
    /// incurred (the verifier call already included the original prompt
    /// plus the draft as context, so there is no separate hypothetical to
    /// compute).
    #[must_use]
    pub fn draft_rejected(
        draft_cost: f64,
        draft_tokens: u64,
        verifier_cost: f64,
        verifier_tokens: u64,
        estimated: bool,
    ) -> Self {
        let total_cost = draft_cost + verifier_cost;
        let bigonly_cost = verifier_cost;
        let cost_saved = -draft_cost;
        Self {
            draft_cost,
            verifier_cost,
            total_cost,
            bigonly_cost,
            cost_saved,
            savings_percent: savings_percent(cost_saved, bigonly_cost),
            draft_tokens,
            verifier_tokens,
            total_tokens: draft_tokens + verifier_tokens,
            was_cascaded: true,
            draft_accepted: false,
            estimated,
            metadata: HashMap::new(),
        }
    }

    /// Build the breakdown for a direct (non-cascaded) call: only the
    /// verifier is billed and there is no hypothetical to compare against,
    /// so `bigonly_cost == total_cost` and `cost_saved == 0`.
    #[must_use]
    pub fn direct(verifier_cost: f64, verifier_tokens: u64, estimated: bool) -> Self {
        Self {
            draft_cost: 0.0,
            verifier_cost,
            total_cost: verifier_cost,
            bigonly_cost: verifier_cost,
            cost_saved: 0.0,
            savings_percent: 0.0,
            draft_tokens: 0,
            verifier_tokens,
            total_tokens: verifier_tokens,
            was_cascaded: false,
            draft_accepted: false,
            estimated,
            metadata: HashMap::new(),
        }
    }

    /// Build the breakdown for a `skip` decision: no provider call, no
    /// token usage (spec §8 invariant 8).
    #[must_use]
    pub fn skipped() -> Self {
        Self::default()
    }

    /// Attach a metadata entry, builder-style.
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

fn savings_percent(cost_saved: f64, bigonly_cost: f64) -> f64 {
    if bigonly_cost.abs() < f64::EPSILON {
        0.0
    } else {
        (cost_saved / bigonly_cost) * 100.0
    }
}
