//! Price book and cost calculator (spec §4.2).
//!
//! Resolves `(provider, model) -> (input, output, cached?)` per-1k
//! pricing and turns [`Usage`](crate::usage::Usage) into a
//! [`CostBreakdown`](crate::usage::CostBreakdown). Grounded on
//! `dashflow-observability::cost::{Pricing, ModelPricing}`, adapted from
//! per-1M to per-1k pricing and from a flat registry to the resolution
//! chain spec §4.2 requires.

use std::collections::HashMap;

use parking_lot::RwLock;

use crate::model::ModelConfig;
use crate::usage::{estimate_tokens, Usage};

/// Per-1k pricing for a single model, independent of the model's own
/// [`ModelConfig`] (e.g. from an external pricing sync or a
/// provider-reported rate for this specific call).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Pricing {
    /// USD per 1,000 input tokens.
    pub input_per_1k: f64,
    /// USD per 1,000 output tokens.
    pub output_per_1k: f64,
    /// USD per 1,000 cached input tokens, if known.
    pub cached_per_1k: Option<f64>,
}

impl Pricing {
    /// Construct pricing with no cache discount.
    #[must_use]
    pub fn new(input_per_1k: f64, output_per_1k: f64) -> Self {
        Self {
            input_per_1k,
            output_per_1k,
            cached_per_1k: None,
        }
    }

    /// Attach a cached-token rate, builder-style.
    #[must_use]
    pub fn with_cached(mut self, cached_per_1k: f64) -> Self {
        self.cached_per_1k = Some(cached_per_1k);
        self
    }

    /// Apply `cost = (input*p_in + output*p_out + cached*p_cached) / 1000`
    /// (spec §4.2). `cached` is ignored (priced at zero) if this pricing
    /// entry carries no cache rate.
    #[must_use]
    pub fn calculate_cost(&self, usage: Usage) -> f64 {
        let cached = usage.cached_input_tokens.unwrap_or(0);
        let cached_rate = self.cached_per_1k.unwrap_or(0.0);
        (usage.input_tokens as f64 * self.input_per_1k
            + usage.output_tokens as f64 * self.output_per_1k
            + cached as f64 * cached_rate)
            / 1000.0
    }
}

/// Lookup key for the in-process price registry.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct PriceKey {
    provider: String,
    model: String,
}

/// An overridable price book.
///
/// Resolution priority for a single lookup (spec §4.2):
/// 1. Provider-reported cost for *this* call (passed directly to
///    [`CostCalculator::cost_for_provider_reported`], bypassing the book).
/// 2. External pricing table entry, registered via
///    [`PriceBook::register`] (this is where a hot-reloaded sync would
///    write).
/// 3. Internal registry defaults, seeded via [`PriceBook::with_defaults`].
/// 4. Caller-supplied [`ModelConfig`] pricing fields.
/// 5. Zero.
#[derive(Debug, Default)]
pub struct PriceBook {
    external: RwLock<HashMap<PriceKey, Pricing>>,
    internal: RwLock<HashMap<PriceKey, Pricing>>,
}

impl PriceBook {
    /// An empty price book; every lookup falls through to the caller's
    /// `ModelConfig` or to zero.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or hot-swap) an external pricing-table entry. This is the
    /// dedicated swap point spec §5 describes for the price book being
    /// "read-only during request, hot-reload via a dedicated swap."
    pub fn register(&self, provider: &str, model: &str, pricing: Pricing) {
        self.external.write().insert(
            PriceKey {
                provider: provider.to_string(),
                model: model.to_string(),
            },
            pricing,
        );
    }

    /// Seed the internal registry defaults (lower priority than
    /// `register`, higher priority than the caller's `ModelConfig`).
    pub fn seed_internal(&self, provider: &str, model: &str, pricing: Pricing) {
        self.internal.write().insert(
            PriceKey {
                provider: provider.to_string(),
                model: model.to_string(),
            },
            pricing,
        );
    }

    fn lookup(&self, provider: &str, model: &str) -> Option<Pricing> {
        let key = PriceKey {
            provider: provider.to_string(),
            model: model.to_string(),
        };
        if let Some(p) = self.external.read().get(&key) {
            return Some(*p);
        }
        self.internal.read().get(&key).copied()
    }
}

/// Resolves pricing and turns usage into cost.
#[derive(Debug, Default)]
pub struct CostCalculator {
    book: PriceBook,
}

impl CostCalculator {
    /// Build a calculator around a (possibly shared) price book.
    #[must_use]
    pub fn new(book: PriceBook) -> Self {
        Self { book }
    }

    /// Resolve pricing for `model` by walking the priority chain: external
    /// table -> internal registry -> the model's own configured rates.
    #[must_use]
    pub fn resolve_pricing(&self, model: &ModelConfig) -> Pricing {
        let provider = format!("{:?}", model.provider);
        if let Some(p) = self.book.lookup(&provider, &model.name) {
            return p;
        }
        let mut pricing = Pricing::new(model.cost_per_1k_input, model.cost_per_1k_output);
        if let Some(cached) = model.cost_per_1k_cached {
            pricing = pricing.with_cached(cached);
        }
        pricing
    }

    /// Cost of a call for which a provider reported exact usage.
    #[must_use]
    pub fn cost_for_usage(&self, model: &ModelConfig, usage: Usage) -> f64 {
        self.resolve_pricing(model).calculate_cost(usage)
    }

    /// Cost of a call for which no usage was reported; falls back to the
    /// text-length token estimator (spec §4.2). Returns `(cost, usage)`
    /// with `usage` built from the estimate so callers can still populate
    /// `CostBreakdown` token fields.
    #[must_use]
    pub fn cost_for_text(&self, model: &ModelConfig, prompt: &str, completion: &str) -> (f64, Usage) {
        let usage = Usage::new(estimate_tokens(prompt), estimate_tokens(completion));
        (self.cost_for_usage(model, usage), usage)
    }

    /// The expose the price book for external registration (sync jobs,
    /// tests).
    #[must_use]
    pub fn book(&self) -> &PriceBook {
        &self.book
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::model::Provider;
    use std::collections::HashMap as Map;

    fn model() -> ModelConfig {
        ModelConfig {
            name: "gpt-4o-mini".into(),
            provider: Provider::OpenAi,
            cost_per_1k_input: 0.00015,
            cost_per_1k_output: 0.0006,
            cost_per_1k_cached: None,
            max_tokens: 4096,
            supports_tools: true,
            quality_score: 0.6,
            speed_ms: 200,
            api_key: None,
            base_url: None,
            deprecated: false,
            extra: Map::new(),
        }
    }

    #[test]
    fn falls_back_to_model_config_pricing_when_book_is_empty() {
        let calc = CostCalculator::new(PriceBook::new());
        let cost = calc.cost_for_usage(&model(), Usage::new(1000, 1000));
        assert!((cost - (0.00015 + 0.0006)).abs() < 1e-12);
    }

    #[test]
    fn external_registration_overrides_model_config() {
        let book = PriceBook::new();
        book.register("OpenAi", "gpt-4o-mini", Pricing::new(1.0, 2.0));
        let calc = CostCalculator::new(book);
        let cost = calc.cost_for_usage(&model(), Usage::new(1000, 0));
        assert!((cost - 1.0).abs() < 1e-12);
    }

    #[test]
    fn internal_registry_is_lower_priority_than_external() {
        let book = PriceBook::new();
        book.seed_internal("OpenAi", "gpt-4o-mini", Pricing::new(9.0, 9.0));
        book.register("OpenAi", "gpt-4o-mini", Pricing::new(1.0, 1.0));
        let calc = CostCalculator::new(book);
        let cost = calc.cost_for_usage(&model(), Usage::new(1000, 0));
        assert!((cost - 1.0).abs() < 1e-12);
    }

    #[test]
    fn internal_registry_beats_model_config_when_no_external() {
        let book = PriceBook::new();
        book.seed_internal("OpenAi", "gpt-4o-mini", Pricing::new(2.0, 2.0));
        let calc = CostCalculator::new(book);
        let cost = calc.cost_for_usage(&model(), Usage::new(1000, 0));
        assert!((cost - 2.0).abs() < 1e-12);
    }

    #[test]
    fn cached_tokens_are_zero_rated_without_a_cached_price() {
        let calc = CostCalculator::new(PriceBook::new());
        let mut usage = Usage::new(1000, 0);
        usage.cached_input_tokens = Some(500);
        let cost = calc.cost_for_usage(&model(), usage);
        assert!((cost - 0.00015).abs() < 1e-12);
    }

    #[test]
    fn cached_tokens_use_cached_rate_when_present() {
        let book = PriceBook::new();
        book.register(
            "OpenAi",
            "gpt-4o-mini",
            Pricing::new(1.0, 1.0).with_cached(0.1),
        );
        let calc = CostCalculator::new(book);
        let mut usage = Usage::new(0, 0);
        usage.cached_input_tokens = Some(1000);
        let cost = calc.cost_for_usage(&model(), usage);
        assert!((cost - 0.1).abs() < 1e-12);
    }

    #[test]
    fn cost_for_text_estimates_tokens_when_usage_unavailable() {
        let calc = CostCalculator::new(PriceBook::new());
        let (cost, usage) = calc.cost_for_text(&model(), "hello world", "hi there friend");
        assert!(usage.input_tokens > 0);
        assert!(usage.output_tokens > 0);
        assert!(cost > 0.0);
    }

    #[test]
    fn cost_is_associative_across_a_batch() {
        let calc = CostCalculator::new(PriceBook::new());
        let usages = [Usage::new(100, 50), Usage::new(200, 75), Usage::new(50, 10)];
        let summed: f64 = usages.iter().map(|u| calc.cost_for_usage(&model(), *u)).sum();
        let aggregate_usage = usages
            .iter()
            .copied()
            .fold(Usage::new(0, 0), Usage::combine);
        let aggregate_cost = calc.cost_for_usage(&model(), aggregate_usage);
        assert!((summed - aggregate_cost).abs() < 1e-9);
    }
}
