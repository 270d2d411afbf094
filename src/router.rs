//! Routing decision engine (spec §4.7).
//!
//! Deterministic given `(query, classifier outputs, configs, budget
//! state)` (spec §8 invariant 6) — no network calls, no randomness.
//! Grounded structurally on `dashflow-chains::router` (a decision struct
//! with a reasons trail), though the decision logic itself is the spec's
//! own algorithmic ladder rather than the teacher's LLM-driven routing.

use serde::{Deserialize, Serialize};

use crate::budget::AdmissionDecision;
use crate::complexity::Complexity;
use crate::model::ModelConfig;
use crate::tool_call::{risk_tier, RiskTier, ToolSpec};

/// Chosen strategy for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum RoutingStrategy {
    /// Try the drafter first, escalate to the verifier on low quality.
    Cascade,
    /// Bypass the drafter and call the verifier immediately.
    Direct,
    /// Admission-level decision that produces no provider call.
    Skip,
}

/// Router output (spec §4.7).
#[derive(Debug, Clone)]
pub struct RoutingDecision {
    /// Chosen strategy.
    pub strategy: RoutingStrategy,
    /// Drafter model, present only for `Cascade`.
    pub drafter: Option<ModelConfig>,
    /// Verifier model; present for `Cascade` and `Direct`, absent for
    /// `Skip`.
    pub verifier: Option<ModelConfig>,
    /// Human-readable trail of why this decision was reached, in the
    /// order the decision ladder evaluated them.
    pub reasons: Vec<String>,
}

/// Caller-level overrides and context consulted by the router (spec
/// §4.7, §6 `force_direct`).
#[derive(Debug, Clone, Default)]
pub struct RoutingContext<'a> {
    /// Bypass the cascade and go straight to the verifier.
    pub force_direct: bool,
    /// Tools offered for this request, for risk-tier evaluation.
    pub tools: &'a [ToolSpec],
    /// Whether tools are required at all for this request (affects
    /// `ModelConfig::is_capable`).
    pub needs_tools: bool,
    /// Requested generation cap, if any.
    pub requested_max_tokens: Option<u32>,
    /// Whether the domain configuration requires the verifier regardless
    /// of complexity (e.g. medical/legal policies).
    pub domain_requires_verifier: bool,
    /// Model names excluded by domain configuration.
    pub domain_excluded_models: &'a [String],
}

/// Deterministic, algorithmic router (spec §4.7).
#[derive(Debug, Default, Clone, Copy)]
pub struct Router;

impl Router {
    /// Construct the router. Stateless; safe to share across requests.
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Produce a [`RoutingDecision`] per the spec §4.7 decision ladder.
    ///
    /// `candidates` must already be sorted ascending by cost (spec §4.7
    /// input contract); the cheapest-first order is what makes step 5's
    /// "cheapest capable" / "next capable" selection correct.
    #[must_use]
    pub fn route(
        &self,
        complexity: Complexity,
        admission: AdmissionDecision,
        candidates: &[ModelConfig],
        context: &RoutingContext<'_>,
    ) -> RoutingDecision {
        let mut reasons = Vec::new();

        if admission == AdmissionDecision::Block {
            reasons.push("admission policy blocked the request".to_string());
            return RoutingDecision {
                strategy: RoutingStrategy::Skip,
                drafter: None,
                verifier: None,
                reasons,
            };
        }

        let max_risk = context
            .tools
            .iter()
            .map(risk_tier)
            .max();
        if matches!(max_risk, Some(RiskTier::High) | Some(RiskTier::Critical)) {
            reasons.push("a registered tool carries high/critical risk; forcing direct route".to_string());
            let verifier = capable(candidates, context).last().cloned();
            return RoutingDecision {
                strategy: RoutingStrategy::Direct,
                drafter: None,
                verifier,
                reasons,
            };
        }

        if context.force_direct {
            reasons.push("caller requested force_direct".to_string());
            return self.direct(candidates, context, reasons);
        }

        if complexity == Complexity::Expert || context.domain_requires_verifier {
            reasons.push("complexity is expert or domain requires the verifier".to_string());
            return self.direct(candidates, context, reasons);
        }

        let eligible = capable(candidates, context);
        if eligible.len() <= 1 {
            reasons.push("fewer than two capable candidate models; routing direct".to_string());
            return RoutingDecision {
                strategy: RoutingStrategy::Direct,
                drafter: None,
                verifier: eligible.first().cloned(),
                reasons,
            };
        }

        reasons.push("cascading: cheapest capable model as drafter, next as verifier".to_string());
        RoutingDecision {
            strategy: RoutingStrategy::Cascade,
            drafter: eligible.first().cloned(),
            verifier: eligible.get(1).cloned(),
            reasons,
        }
    }

    fn direct(
        &self,
        candidates: &[ModelConfig],
        context: &RoutingContext<'_>,
        reasons: Vec<String>,
    ) -> RoutingDecision {
        let eligible = capable(candidates, context);
        RoutingDecision {
            strategy: RoutingStrategy::Direct,
            drafter: None,
            verifier: eligible.last().cloned(),
            reasons,
        }
    }
}

/// Filter to capable candidates and tie-break: higher `quality_score`,
/// then lower `speed_ms`, then stable input order (spec §4.7).
fn capable(candidates: &[ModelConfig], context: &RoutingContext<'_>) -> Vec<ModelConfig> {
    let mut eligible: Vec<(usize, ModelConfig)> = candidates
        .iter()
        .enumerate()
        .filter(|(_, m)| {
            m.is_capable(context.needs_tools, context.requested_max_tokens)
                && !context.domain_excluded_models.iter().any(|n| n == &m.name)
        })
        .map(|(i, m)| (i, m.clone()))
        .collect();

    // Candidates arrive pre-sorted ascending by cost; within equal cost,
    // break ties by quality (desc), then speed (asc), then original order.
    eligible.sort_by(|(ia, a), (ib, b)| {
        a.cost_per_1k_input
            .partial_cmp(&b.cost_per_1k_input)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| {
                b.quality_score
                    .partial_cmp(&a.quality_score)
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .then_with(|| a.speed_ms.cmp(&b.speed_ms))
            .then_with(|| ia.cmp(ib))
    });

    eligible.into_iter().map(|(_, m)| m).collect()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::model::Provider as ModelProvider;
    use std::collections::HashMap;

    fn model(name: &str, cost: f64, quality: f32, speed: u32) -> ModelConfig {
        ModelConfig {
            name: name.into(),
            provider: ModelProvider::OpenAi,
            cost_per_1k_input: cost,
            cost_per_1k_output: cost * 2.0,
            cost_per_1k_cached: None,
            max_tokens: 4096,
            supports_tools: true,
            quality_score: quality,
            speed_ms: speed,
            api_key: None,
            base_url: None,
            deprecated: false,
            extra: HashMap::new(),
        }
    }

    fn two_models() -> Vec<ModelConfig> {
        vec![model("cheap", 0.0001, 0.5, 300), model("exp", 0.005, 0.9, 1000)]
    }

    #[test]
    fn single_model_routes_direct() {
        let models = vec![model("only", 0.001, 0.7, 500)];
        let decision = Router::new().route(
            Complexity::Simple,
            AdmissionDecision::Allow,
            &models,
            &RoutingContext::default(),
        );
        assert_eq!(decision.strategy, RoutingStrategy::Direct);
        assert_eq!(decision.verifier.unwrap().name, "only");
    }

    #[test]
    fn two_models_simple_complexity_cascades() {
        let decision = Router::new().route(
            Complexity::Simple,
            AdmissionDecision::Allow,
            &two_models(),
            &RoutingContext::default(),
        );
        assert_eq!(decision.strategy, RoutingStrategy::Cascade);
        assert_eq!(decision.drafter.unwrap().name, "cheap");
        assert_eq!(decision.verifier.unwrap().name, "exp");
    }

    #[test]
    fn expert_complexity_forces_direct() {
        let decision = Router::new().route(
            Complexity::Expert,
            AdmissionDecision::Allow,
            &two_models(),
            &RoutingContext::default(),
        );
        assert_eq!(decision.strategy, RoutingStrategy::Direct);
        assert_eq!(decision.verifier.unwrap().name, "exp");
    }

    #[test]
    fn force_direct_overrides_cascade() {
        let context = RoutingContext {
            force_direct: true,
            ..Default::default()
        };
        let decision = Router::new().route(Complexity::Simple, AdmissionDecision::Allow, &two_models(), &context);
        assert_eq!(decision.strategy, RoutingStrategy::Direct);
    }

    #[test]
    fn blocked_admission_yields_skip_with_no_models() {
        let decision = Router::new().route(
            Complexity::Simple,
            AdmissionDecision::Block,
            &two_models(),
            &RoutingContext::default(),
        );
        assert_eq!(decision.strategy, RoutingStrategy::Skip);
        assert!(decision.drafter.is_none());
        assert!(decision.verifier.is_none());
    }

    #[test]
    fn high_risk_tool_forces_direct_even_at_simple_complexity() {
        let tools = vec![ToolSpec {
            name: "delete_record".into(),
            description: "deletes a database record".into(),
        }];
        let context = RoutingContext {
            tools: &tools,
            ..Default::default()
        };
        let decision = Router::new().route(Complexity::Simple, AdmissionDecision::Allow, &two_models(), &context);
        assert_eq!(decision.strategy, RoutingStrategy::Direct);
    }

    #[test]
    fn routing_is_deterministic_for_identical_inputs() {
        let router = Router::new();
        let a = router.route(
            Complexity::Moderate,
            AdmissionDecision::Allow,
            &two_models(),
            &RoutingContext::default(),
        );
        let b = router.route(
            Complexity::Moderate,
            AdmissionDecision::Allow,
            &two_models(),
            &RoutingContext::default(),
        );
        assert_eq!(a.strategy, b.strategy);
        assert_eq!(a.drafter.map(|m| m.name), b.drafter.map(|m| m.name));
    }

    #[test]
    fn domain_excluded_model_is_never_selected() {
        let excluded = vec!["cheap".to_string()];
        let context = RoutingContext {
            domain_excluded_models: &excluded,
            ..Default::default()
        };
        let decision = Router::new().route(Complexity::Simple, AdmissionDecision::Allow, &two_models(), &context);
        assert_eq!(decision.strategy, RoutingStrategy::Direct);
        assert_eq!(decision.verifier.unwrap().name, "exp");
    }

    #[test]
    fn tool_incapable_models_are_excluded_from_candidacy() {
        let mut models = two_models();
        models[0].supports_tools = false;
        let context = RoutingContext {
            needs_tools: true,
            ..Default::default()
        };
        let decision = Router::new().route(Complexity::Simple, AdmissionDecision::Allow, &models, &context);
        assert_eq!(decision.strategy, RoutingStrategy::Direct);
        assert_eq!(decision.verifier.unwrap().name, "exp");
    }
}
