//! Budget and tier policy (spec §4.12).
//!
//! Grounded on `dashflow_observability::cost::{BudgetConfig,
//! BudgetEnforcer}`: synchronous, side-effect-free evaluation against a
//! tier's configured budget; accounting updates happen post-request in
//! the cost calculator, not here.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Admission-level verdict (spec §4.12).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdmissionDecision {
    /// Proceed normally.
    Allow,
    /// Proceed, but annotate the result (approaching budget ceiling).
    Warn,
    /// Deny the request outright.
    Block,
    /// Proceed, but force the router toward the cheapest capable model
    /// pair and lower the quality threshold to the tier's floor.
    Degrade,
}

/// Per-tier budget configuration.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TierBudget {
    /// Hard spend ceiling for this tier, in USD, over the policy's
    /// accounting window (caller-defined: daily/monthly/session).
    pub budget_usd: f64,
    /// Fraction of `budget_usd` at which to start warning, in `[0, 1]`.
    pub warn_at: f64,
    /// Fraction of `budget_usd` at which to degrade instead of block, in
    /// `[0, 1]`. Must be `<= 1.0`; spend beyond `budget_usd` always
    /// blocks.
    pub degrade_at: f64,
    /// Quality threshold floor to apply when this tier is degraded.
    pub degraded_quality_floor: f32,
}

impl TierBudget {
    /// A generous default tier: warn at 80%, degrade at 95%, block at
    /// 100%. Spec §4.12 leaves the concrete tier->threshold table to
    /// configuration; this is a reasonable, fully overridable starting
    /// point.
    #[must_use]
    pub fn default_for(budget_usd: f64) -> Self {
        Self {
            budget_usd,
            warn_at: 0.8,
            degrade_at: 0.95,
            degraded_quality_floor: 0.5,
        }
    }
}

/// Pre-flight admission control over cumulative spend (spec §4.12).
#[derive(Debug, Clone, Default)]
pub struct BudgetPolicy {
    tiers: HashMap<String, TierBudget>,
    default_tier: Option<TierBudget>,
}

impl BudgetPolicy {
    /// An empty policy; every evaluation allows (no tiers configured).
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a named tier's budget, builder-style.
    #[must_use]
    pub fn with_tier(mut self, tier: impl Into<String>, budget: TierBudget) -> Self {
        self.tiers.insert(tier.into(), budget);
        self
    }

    /// Set the budget applied when the caller supplies no `tier` or an
    /// unrecognized one, builder-style.
    #[must_use]
    pub fn with_default_tier(mut self, budget: TierBudget) -> Self {
        self.default_tier = Some(budget);
        self
    }

    /// Evaluate `(tier, cumulative_spend)` against the configured budget
    /// and return an [`AdmissionDecision`]. Synchronous and
    /// side-effect-free, per spec §4.12.
    #[must_use]
    pub fn evaluate(&self, tier: Option<&str>, cumulative_spend: f64) -> AdmissionDecision {
        let Some(budget) = tier.and_then(|t| self.tiers.get(t)).or(self.default_tier.as_ref()) else {
            return AdmissionDecision::Allow;
        };

        if budget.budget_usd <= 0.0 {
            return AdmissionDecision::Allow;
        }

        let fraction = cumulative_spend / budget.budget_usd;
        if fraction >= 1.0 {
            AdmissionDecision::Block
        } else if fraction >= budget.degrade_at {
            AdmissionDecision::Degrade
        } else if fraction >= budget.warn_at {
            AdmissionDecision::Warn
        } else {
            AdmissionDecision::Allow
        }
    }

    /// The degraded quality floor for `tier`, if a degrade decision
    /// applies. Used by the pipeline to lower the resolved quality
    /// threshold (spec §4.12).
    #[must_use]
    pub fn degraded_quality_floor(&self, tier: Option<&str>) -> Option<f32> {
        tier.and_then(|t| self.tiers.get(t))
            .or(self.default_tier.as_ref())
            .map(|b| b.degraded_quality_floor)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn no_tiers_configured_always_allows() {
        let policy = BudgetPolicy::new();
        assert_eq!(policy.evaluate(Some("pro"), 1_000_000.0), AdmissionDecision::Allow);
    }

    #[test]
    fn spend_below_warn_threshold_allows() {
        let policy = BudgetPolicy::new().with_tier("pro", TierBudget::default_for(100.0));
        assert_eq!(policy.evaluate(Some("pro"), 10.0), AdmissionDecision::Allow);
    }

    #[test]
    fn spend_at_warn_threshold_warns() {
        let policy = BudgetPolicy::new().with_tier("pro", TierBudget::default_for(100.0));
        assert_eq!(policy.evaluate(Some("pro"), 85.0), AdmissionDecision::Warn);
    }

    #[test]
    fn spend_at_degrade_threshold_degrades() {
        let policy = BudgetPolicy::new().with_tier("pro", TierBudget::default_for(100.0));
        assert_eq!(policy.evaluate(Some("pro"), 96.0), AdmissionDecision::Degrade);
    }

    #[test]
    fn spend_over_budget_blocks() {
        let policy = BudgetPolicy::new().with_tier("pro", TierBudget::default_for(100.0));
        assert_eq!(policy.evaluate(Some("pro"), 100.0), AdmissionDecision::Block);
        assert_eq!(policy.evaluate(Some("pro"), 150.0), AdmissionDecision::Block);
    }

    #[test]
    fn unknown_tier_falls_back_to_default_tier() {
        let policy = BudgetPolicy::new().with_default_tier(TierBudget::default_for(10.0));
        assert_eq!(policy.evaluate(Some("nonexistent"), 11.0), AdmissionDecision::Block);
    }

    #[test]
    fn no_tier_given_uses_default_tier() {
        let policy = BudgetPolicy::new().with_default_tier(TierBudget::default_for(10.0));
        assert_eq!(policy.evaluate(None, 1.0), AdmissionDecision::Allow);
    }

    #[test]
    fn degraded_quality_floor_is_exposed() {
        let policy = BudgetPolicy::new().with_tier("pro", TierBudget::default_for(100.0));
        assert_eq!(policy.degraded_quality_floor(Some("pro")), Some(0.5));
        assert_eq!(policy.degraded_quality_floor(Some("missing")), None);
    }
}
