//! Agent construction configuration (spec §6, §9 "Configuration
//! plurality").
//!
//! No hidden globals: every knob is a field on a constructed
//! [`AgentConfig`] passed into the pipeline. Builder methods consume
//! `self` and return `Self`, mirroring
//! `dashflow_observability::cost::CostTracker::with_daily_budget` /
//! `dashflow-factories::llm`'s config builders.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::budget::BudgetPolicy;
use crate::model::ModelConfig;
use crate::provider::Provider;
use crate::quality::QualityMethod;
use crate::rate_limiter::RateLimitPolicy;

/// Which signal the router should optimize for (spec §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum RoutingObjective {
    /// Balance cost and quality using the full decision ladder.
    Adaptive,
    /// Prefer the cheapest capable candidates.
    Cost,
    /// Prefer the highest-quality capable candidates.
    Quality,
    /// Prefer the fastest capable candidates.
    Speed,
}

/// Per-domain overrides (spec §3 `Domain`).
#[derive(Debug, Clone, Default)]
pub struct DomainConfig {
    /// Preferred drafter model name for this domain, if any.
    pub drafter: Option<String>,
    /// Preferred verifier model name for this domain, if any.
    pub verifier: Option<String>,
    /// Quality threshold override for this domain.
    pub threshold: Option<f32>,
    /// Sampling temperature override for this domain.
    pub temperature: Option<f32>,
    /// Whether this domain always requires the verifier regardless of
    /// complexity.
    pub requires_verifier: bool,
    /// Model names excluded from routing for this domain.
    pub excluded_models: Vec<String>,
}

/// Cascade-wide tunables (spec §6 `CascadeConfig`).
#[derive(Debug, Clone)]
pub struct CascadeConfig {
    /// Maximum USD spend for a single request before admission blocks it.
    pub max_budget: Option<f64>,
    /// Maximum provider-call retries on transient errors.
    pub max_retries: u32,
    /// Per-step timeout.
    pub step_timeout: Duration,
    /// Overall per-request deadline, if set.
    pub deadline: Option<Duration>,
    /// Routing objective.
    pub routing_strategy: RoutingObjective,
    /// Emit verbose tracing for each pipeline step.
    pub verbose: bool,
    /// Maximum tool-loop steps (spec §4.8.a).
    pub max_tool_steps: u32,
    /// Maximum concurrent tool executions within one turn.
    pub tool_parallel_concurrency: usize,
}

impl Default for CascadeConfig {
    fn default() -> Self {
        Self {
            max_budget: None,
            max_retries: 3,
            step_timeout: Duration::from_secs(30),
            deadline: None,
            routing_strategy: RoutingObjective::Adaptive,
            verbose: false,
            max_tool_steps: 5,
            tool_parallel_concurrency: 4,
        }
    }
}

/// Quality configuration at agent-construction scope (spec §6
/// `QualityConfig`): the method and an optional explicit threshold
/// applied before domain/complexity resolution.
#[derive(Clone)]
pub struct AgentQualityConfig {
    /// Which scoring method to use.
    pub method: QualityMethod,
    /// Explicit threshold override, highest priority in the resolution
    /// chain (spec §4.6).
    pub explicit_threshold: Option<f32>,
}

impl Default for AgentQualityConfig {
    fn default() -> Self {
        Self {
            method: QualityMethod::Heuristic,
            explicit_threshold: None,
        }
    }
}

impl std::fmt::Debug for AgentQualityConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentQualityConfig")
            .field("method", &self.method)
            .field("explicit_threshold", &self.explicit_threshold)
            .finish()
    }
}

/// Top-level agent configuration (spec §6). Immutable once the agent is
/// constructed; build a new agent for a new configuration.
#[derive(Clone)]
pub struct AgentConfig {
    /// Ordered candidate models, ascending by cost (spec §4.7 input
    /// contract).
    pub models: Vec<ModelConfig>,
    /// Quality validation configuration.
    pub quality: AgentQualityConfig,
    /// Cascade-wide tunables.
    pub cascade: CascadeConfig,
    /// Per-domain overrides.
    pub domains: HashMap<crate::domain::Domain, DomainConfig>,
    /// Per-provider rate limiting.
    pub rate_limits: HashMap<String, RateLimitPolicy>,
    /// Budget/tier admission policy.
    pub budget: Arc<BudgetPolicy>,
    /// Provider-family adapters. The core never constructs an HTTP
    /// client itself (spec §1); the caller wires one [`Provider`] impl
    /// per family its `models` reference.
    pub providers: HashMap<crate::model::Provider, Arc<dyn Provider>>,
}

impl std::fmt::Debug for AgentConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentConfig")
            .field("models", &self.models.iter().map(|m| &m.name).collect::<Vec<_>>())
            .field("quality", &self.quality)
            .field("cascade", &self.cascade)
            .field("domains", &self.domains.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl AgentConfig {
    /// Construct from the required model list; every other field takes
    /// its default.
    #[must_use]
    pub fn new(models: Vec<ModelConfig>) -> Self {
        Self {
            models,
            quality: AgentQualityConfig::default(),
            cascade: CascadeConfig::default(),
            domains: HashMap::new(),
            rate_limits: HashMap::new(),
            budget: Arc::new(BudgetPolicy::new()),
            providers: HashMap::new(),
        }
    }

    /// Register the adapter that serves a provider family, builder-style.
    #[must_use]
    pub fn with_provider(mut self, kind: crate::model::Provider, provider: Arc<dyn Provider>) -> Self {
        self.providers.insert(kind, provider);
        self
    }

    /// Attach a quality configuration, builder-style.
    #[must_use]
    pub fn with_quality(mut self, quality: AgentQualityConfig) -> Self {
        self.quality = quality;
        self
    }

    /// Attach cascade tunables, builder-style.
    #[must_use]
    pub fn with_cascade(mut self, cascade: CascadeConfig) -> Self {
        self.cascade = cascade;
        self
    }

    /// Register a domain override, builder-style.
    #[must_use]
    pub fn with_domain(mut self, domain: crate::domain::Domain, config: DomainConfig) -> Self {
        self.domains.insert(domain, config);
        self
    }

    /// Register a per-provider rate limit, builder-style.
    #[must_use]
    pub fn with_rate_limit(mut self, provider: impl Into<String>, policy: RateLimitPolicy) -> Self {
        self.rate_limits.insert(provider.into(), policy);
        self
    }

    /// Attach a budget policy, builder-style.
    #[must_use]
    pub fn with_budget(mut self, budget: BudgetPolicy) -> Self {
        self.budget = Arc::new(budget);
        self
    }

    /// Validate construction-time invariants (spec §7 `config` kind):
    /// at least one model, and no duplicate model names.
    pub fn validate(&self) -> crate::error::Result<()> {
        if self.models.is_empty() {
            return Err(crate::error::Error::Config(
                "at least one model must be configured".to_string(),
            ));
        }
        let mut seen = std::collections::HashSet::new();
        for model in &self.models {
            if !seen.insert(&model.name) {
                return Err(crate::error::Error::Config(format!(
                    "duplicate model name `{}` in configuration",
                    model.name
                )));
            }
            if !self.providers.contains_key(&model.provider) {
                return Err(crate::error::Error::Config(format!(
                    "model `{}` references provider {:?} with no registered adapter",
                    model.name, model.provider
                )));
            }
        }
        Ok(())
    }
}

/// Per-request options (spec §6 "Options recognized").
#[derive(Clone, Default)]
pub struct RequestOptions {
    /// Generation cap for this request.
    pub max_tokens: Option<u32>,
    /// Sampling temperature in `[0, 2]`.
    pub temperature: Option<f32>,
    /// System prompt, normalized into messages.
    pub system_prompt: Option<String>,
    /// Tool schemas offered for this request.
    pub tools: Vec<crate::tool_call::ToolSpec>,
    /// Bypass the cascade and call the verifier directly.
    pub force_direct: bool,
    /// Tool-loop step cap for this request (overrides the agent default).
    pub max_steps: Option<u32>,
    /// Caller/end-user identifier, for admission accounting.
    pub user_id: Option<String>,
    /// Caller's tier, for admission accounting.
    pub user_tier: Option<String>,
    /// Per-request deadline in milliseconds.
    pub deadline_ms: Option<u64>,
    /// Caller-tracked cumulative spend for this user/session so far, fed
    /// into budget admission (spec §4.12). The core holds no persisted
    /// accounting state; callers that want running-total enforcement
    /// supply it here.
    pub cumulative_spend: f64,
    /// Handler invoked for each tool call the model requests (spec §6
    /// `tool_executor: (name, args) -> result`). Required whenever `tools`
    /// is non-empty and the model actually requests a call; the tool loop
    /// surfaces a [`crate::error::Error::ToolExecution`] if one is needed
    /// but absent.
    pub tool_executor: Option<Arc<dyn crate::pipeline::tool_loop::ToolExecutor>>,
}

impl std::fmt::Debug for RequestOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestOptions")
            .field("max_tokens", &self.max_tokens)
            .field("temperature", &self.temperature)
            .field("system_prompt", &self.system_prompt)
            .field("tools", &self.tools.iter().map(|t| &t.name).collect::<Vec<_>>())
            .field("force_direct", &self.force_direct)
            .field("max_steps", &self.max_steps)
            .field("user_id", &self.user_id)
            .field("user_tier", &self.user_tier)
            .field("deadline_ms", &self.deadline_ms)
            .field("cumulative_spend", &self.cumulative_spend)
            .field("tool_executor", &self.tool_executor.is_some())
            .finish()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::model::Provider;

    fn model(name: &str) -> ModelConfig {
        ModelConfig {
            name: name.into(),
            provider: Provider::OpenAi,
            cost_per_1k_input: 0.001,
            cost_per_1k_output: 0.002,
            cost_per_1k_cached: None,
            max_tokens: 4096,
            supports_tools: true,
            quality_score: 0.7,
            speed_ms: 400,
            api_key: None,
            base_url: None,
            deprecated: false,
            extra: HashMap::new(),
        }
    }

    #[test]
    fn empty_model_list_fails_validation() {
        let config = AgentConfig::new(vec![]);
        let err = config.validate().unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Config);
    }

    #[test]
    fn duplicate_model_names_fail_validation() {
        let config = AgentConfig::new(vec![model("a"), model("a")])
            .with_provider(Provider::OpenAi, Arc::new(crate::testing::StubProvider::new(vec![])));
        let err = config.validate().unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Config);
    }

    #[test]
    fn model_with_unregistered_provider_fails_validation() {
        let config = AgentConfig::new(vec![model("a")]);
        let err = config.validate().unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Config);
    }

    #[test]
    fn valid_config_passes() {
        let config = AgentConfig::new(vec![model("a"), model("b")])
            .with_provider(Provider::OpenAi, Arc::new(crate::testing::StubProvider::new(vec![])));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn builder_methods_compose() {
        let config = AgentConfig::new(vec![model("a")])
            .with_cascade(CascadeConfig { max_retries: 5, ..Default::default() })
            .with_rate_limit("openai", RateLimitPolicy { requests_per_minute: Some(10), ..Default::default() });
        assert_eq!(config.cascade.max_retries, 5);
        assert!(config.rate_limits.contains_key("openai"));
    }
}
