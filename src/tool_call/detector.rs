//! 4-layer tool-call intent detector (spec §4.5).
//!
//! Layers run strongest-first and short-circuit: once a stronger layer
//! fires, weaker layers are skipped (their evidence would not change
//! `should_call`, only the confidence that `should_call` already
//! guarantees). Confidence is the normalized sum of per-layer weights.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::message::ToolCall;

/// A registered tool the caller may invoke.
#[derive(Debug, Clone)]
pub struct ToolSpec {
    /// Tool name as referenced in prompts and by the model.
    pub name: String,
    /// Human-readable description, consulted for risk-tier inference.
    pub description: String,
}

/// Which detector layer contributed evidence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectorLayer {
    /// Caller passed structured tool-call objects directly.
    Explicit,
    /// Query contains JSON-shaped tool-call markup.
    Structured,
    /// Query contains intent keywords ("search", "fetch", file/API verbs).
    Heuristic,
    /// Query literally mentions a registered tool's name.
    Fallback,
}

impl DetectorLayer {
    fn weight(self) -> f32 {
        match self {
            DetectorLayer::Explicit => 1.0,
            DetectorLayer::Structured => 0.8,
            DetectorLayer::Heuristic => 0.6,
            DetectorLayer::Fallback => 0.4,
        }
    }
}

/// Detector output (spec §3 `ToolCallIntent`).
#[derive(Debug, Clone)]
pub struct ToolCallIntent {
    /// Whether the detector recommends offering tools for this turn.
    pub should_call: bool,
    /// Normalized confidence in `[0, 1]`.
    pub confidence: f32,
    /// Which layers contributed evidence, strongest first.
    pub layers: Vec<DetectorLayer>,
    /// Free-text hints for diagnostics (matched keyword, tool name, ...).
    pub hints: Vec<String>,
}

static STRUCTURED_JSON: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"\{\s*"name"\s*:\s*"[^"]+"\s*,\s*"arguments"\s*:"#).unwrap());
static HEURISTIC_VERBS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(search|fetch|call|look ?up|query|retrieve|download|invoke)\b").unwrap()
});

/// Detects whether a turn likely requires a tool call.
#[derive(Debug, Default, Clone, Copy)]
pub struct ToolCallDetector;

impl ToolCallDetector {
    /// Construct the detector. Stateless; safe to share across requests.
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Run all four layers against `text`, short-circuiting once a
    /// stronger layer has fired, and registered `tools`.
    ///
    /// `explicit_tool_calls` represents structured tool-call objects the
    /// caller already attached to the request (layer 1, confidence 1.0
    /// outright).
    #[must_use]
    pub fn detect(
        &self,
        text: &str,
        explicit_tool_calls: &[ToolCall],
        tools: &[ToolSpec],
    ) -> ToolCallIntent {
        let mut layers = Vec::new();
        let mut hints = Vec::new();

        if !explicit_tool_calls.is_empty() {
            layers.push(DetectorLayer::Explicit);
            hints.push(format!("{} explicit tool call(s) supplied", explicit_tool_calls.len()));
        } else if STRUCTURED_JSON.is_match(text) {
            layers.push(DetectorLayer::Structured);
            hints.push("structured JSON tool-call markup detected".to_string());
        } else if let Some(m) = HEURISTIC_VERBS.find(text) {
            layers.push(DetectorLayer::Heuristic);
            hints.push(format!("intent keyword `{}`", m.as_str()));
        } else if let Some(tool) = tools.iter().find(|t| text.to_lowercase().contains(&t.name.to_lowercase())) {
            layers.push(DetectorLayer::Fallback);
            hints.push(format!("query mentions registered tool `{}`", tool.name));
        }

        let confidence: f32 = layers.iter().map(|l| l.weight()).sum::<f32>().min(1.0);
        let should_call = confidence >= 0.5;

        ToolCallIntent {
            should_call,
            confidence,
            layers,
            hints,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn tools() -> Vec<ToolSpec> {
        vec![ToolSpec {
            name: "get_weather".into(),
            description: "Fetch current weather for a location".into(),
        }]
    }

    #[test]
    fn explicit_tool_calls_short_circuit_at_full_confidence() {
        let call = ToolCall::new("get_weather", "{}");
        let intent = ToolCallDetector::new().detect("anything", std::slice::from_ref(&call), &tools());
        assert!(intent.should_call);
        assert!((intent.confidence - 1.0).abs() < f32::EPSILON);
        assert_eq!(intent.layers, vec![DetectorLayer::Explicit]);
    }

    #[test]
    fn structured_json_is_detected() {
        let intent = ToolCallDetector::new().detect(
            r#"please run {"name": "get_weather", "arguments": {"city": "Berlin"}}"#,
            &[],
            &tools(),
        );
        assert!(intent.should_call);
        assert_eq!(intent.layers, vec![DetectorLayer::Structured]);
    }

    #[test]
    fn heuristic_keywords_are_detected() {
        let intent = ToolCallDetector::new().detect("please search for today's news", &[], &tools());
        assert_eq!(intent.layers, vec![DetectorLayer::Heuristic]);
        assert!((intent.confidence - 0.6).abs() < f32::EPSILON);
        assert!(intent.should_call);
    }

    #[test]
    fn fallback_tool_name_mention_is_weak_evidence() {
        let intent = ToolCallDetector::new().detect("what does get_weather do?", &[], &tools());
        assert_eq!(intent.layers, vec![DetectorLayer::Fallback]);
        assert!(!intent.should_call);
    }

    #[test]
    fn no_evidence_yields_zero_confidence() {
        let intent = ToolCallDetector::new().detect("Tell me a joke.", &[], &tools());
        assert!(intent.layers.is_empty());
        assert_eq!(intent.confidence, 0.0);
        assert!(!intent.should_call);
    }

    #[test]
    fn layers_short_circuit_strongest_first() {
        // Structured JSON also contains a heuristic verb ("search"), but
        // only the structured layer should fire.
        let intent = ToolCallDetector::new().detect(
            r#"search using {"name": "get_weather", "arguments": {}}"#,
            &[],
            &tools(),
        );
        assert_eq!(intent.layers, vec![DetectorLayer::Structured]);
    }
}
