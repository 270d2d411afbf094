//! Complexity classifier (spec §4.3).
//!
//! A lazy sequence of signals, each contributing to a score; the score
//! maps to a bucket by monotonic thresholds. Deterministic given
//! identical input. Grounded on the signal-aggregation-then-bucket
//! pattern in `dashflow::adaptive_timeout` (`LatencyStats` ->
//! `TimeoutRecommendation`), adapted from latency statistics to textual
//! heuristics.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Complexity bucket. Ordered: `Trivial < Simple < Moderate < Hard <
/// Expert` (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Complexity {
    /// Single-fact lookups, arithmetic, greetings.
    Trivial,
    /// Short, single-step requests.
    Simple,
    /// Multi-step but bounded requests.
    Moderate,
    /// Requires reasoning chains, code, or domain depth.
    Hard,
    /// Open-ended, proof-like, or highly ambiguous requests.
    Expert,
}

static MULTI_STEP: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(first|then|after that|next|finally|step \d)\b").unwrap());
static CONDITIONAL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(if|unless|otherwise|in case|depending on)\b").unwrap());
static ITERATIVE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(for each|repeat|iterate|loop over|every)\b").unwrap());
static AMBIGUOUS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(prove|derive|explain why|design|architect)\b").unwrap());
static CODE_FENCE: Lazy<Regex> = Lazy::new(|| Regex::new(r"```").unwrap());
static MATH_OPERATORS: Lazy<Regex> = Lazy::new(|| Regex::new(r"[=+\-*/^√∑∫]|\bsqrt\b").unwrap());
static DOMAIN_TERMS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(algorithm|theorem|diagnos[ei]s|statute|regression|equilibrium)\b").unwrap()
});

/// A single contributing signal, for audit/debugging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Signal {
    /// Raw length bucket (short/medium/long/very-long).
    Length,
    /// Multi-step language ("first ... then ...").
    MultiStep,
    /// Conditional language ("if ... unless ...").
    Conditional,
    /// Iterative language ("for each ...").
    Iterative,
    /// Ambiguous/open-ended framing ("prove", "design").
    Ambiguous,
    /// Contains a fenced code block.
    CodeFence,
    /// Contains math operators.
    MathOperators,
    /// Contains domain-specific terminology.
    DomainTerms,
}

/// Classifier result: the bucket and a confidence in `[0, 1]` reflecting
/// how decisively the score landed within its bucket's range.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ComplexityResult {
    /// The assigned bucket.
    pub level: Complexity,
    /// Confidence in `[0, 1]`.
    pub confidence: f32,
}

/// Weight contributed by each signal when present.
const WEIGHTS: &[(Signal, f32)] = &[
    (Signal::MultiStep, 1.5),
    (Signal::Conditional, 1.0),
    (Signal::Iterative, 1.2),
    (Signal::Ambiguous, 2.0),
    (Signal::CodeFence, 1.5),
    (Signal::MathOperators, 1.0),
    (Signal::DomainTerms, 1.3),
];

/// Score bucket boundaries. A score strictly below a boundary falls into
/// the previous (simpler) bucket — ties break toward simpler per spec
/// §4.3.
const THRESHOLDS: &[(f32, Complexity)] = &[
    (1.0, Complexity::Simple),
    (2.5, Complexity::Moderate),
    (4.5, Complexity::Hard),
    (f32::MAX, Complexity::Expert),
];

/// Deterministic complexity classifier.
#[derive(Debug, Default, Clone, Copy)]
pub struct ComplexityClassifier;

impl ComplexityClassifier {
    /// Construct the classifier. Stateless; safe to share across
    /// requests.
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Collect which signals fire for `text`, in a stable order.
    #[must_use]
    pub fn signals(&self, text: &str) -> Vec<Signal> {
        let mut signals = Vec::new();
        if text.split_whitespace().count() > 60 {
            signals.push(Signal::Length);
        }
        if MULTI_STEP.is_match(text) {
            signals.push(Signal::MultiStep);
        }
        if CONDITIONAL.is_match(text) {
            signals.push(Signal::Conditional);
        }
        if ITERATIVE.is_match(text) {
            signals.push(Signal::Iterative);
        }
        if AMBIGUOUS.is_match(text) {
            signals.push(Signal::Ambiguous);
        }
        if CODE_FENCE.is_match(text) {
            signals.push(Signal::CodeFence);
        }
        if MATH_OPERATORS.is_match(text) {
            signals.push(Signal::MathOperators);
        }
        if DOMAIN_TERMS.is_match(text) {
            signals.push(Signal::DomainTerms);
        }
        signals
    }

    /// Classify `text` into a [`ComplexityResult`].
    #[must_use]
    pub fn classify(&self, text: &str) -> ComplexityResult {
        let signals = self.signals(text);
        let mut score: f32 = 0.0;
        let length_bonus = match text.split_whitespace().count() {
            0..=15 => 0.0,
            16..=40 => 0.5,
            41..=80 => 1.2,
            _ => 2.0,
        };
        score += length_bonus;
        for signal in &signals {
            if let Some((_, weight)) = WEIGHTS.iter().find(|(s, _)| s == signal) {
                score += weight;
            }
        }

        let level = THRESHOLDS
            .iter()
            .find(|(boundary, _)| score < *boundary)
            .map(|(_, level)| *level)
            .unwrap_or(Complexity::Expert);

        let (lower, upper) = bucket_range(level);
        let span = (upper - lower).max(0.01);
        let position = ((score - lower) / span).clamp(0.0, 1.0);
        let confidence = 0.5 + position * 0.5;

        ComplexityResult { level, confidence }
    }
}

fn bucket_range(level: Complexity) -> (f32, f32) {
    let mut lower = 0.0;
    for (boundary, bucket) in THRESHOLDS {
        if *bucket == level {
            return (lower, *boundary);
        }
        lower = *boundary;
    }
    (lower, lower + 1.0)
}
