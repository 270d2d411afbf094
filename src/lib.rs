//! # CascadeFlow
//!
//! Cost-optimizing cascade routing for large-language-model inference: a
//! cheap drafter model answers first, a quality gate decides whether that
//! answer is good enough, and only borderline or hard cases escalate to an
//! expensive verifier. The core owns classification, routing, quality
//! scoring, cost accounting, and the tool-call loop; it never speaks HTTP
//! to a model provider itself — callers implement [`provider::Provider`]
//! once per backend and hand it to an [`Agent`].
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use cascadeflow::{Agent, AgentConfig, ModelConfig, Query, RequestOptions};
//! use cascadeflow::model::Provider as ProviderKind;
//!
//! # async fn run(my_provider_adapter: Arc<dyn cascadeflow::provider::Provider>) -> cascadeflow::Result<()> {
//! let models = vec![
//!     ModelConfig {
//!         name: "gpt-4o-mini".into(),
//!         provider: ProviderKind::OpenAi,
//!         cost_per_1k_input: 0.00015,
//!         cost_per_1k_output: 0.0006,
//!         cost_per_1k_cached: None,
//!         max_tokens: 16_384,
//!         supports_tools: true,
//!         quality_score: 0.6,
//!         speed_ms: 400,
//!         api_key: None,
//!         base_url: None,
//!         deprecated: false,
//!         extra: Default::default(),
//!     },
//! ];
//! let config = AgentConfig::new(models).with_provider(ProviderKind::OpenAi, my_provider_adapter);
//! let agent = Agent::new(config)?;
//!
//! let result = agent.run(&Query::Prompt("What is 2+2?".into()), &RequestOptions::default()).await?;
//! println!("{} (via {})", result.content, result.model_used);
//! # Ok(())
//! # }
//! ```

pub mod agent;
pub mod budget;
pub mod complexity;
pub mod config;
pub mod cost;
pub mod domain;
pub mod error;
pub mod message;
pub mod metrics;
pub mod model;
pub mod pipeline;
pub mod provider;
pub mod quality;
pub mod rate_limiter;
pub mod router;
pub mod streaming;
pub mod testing;
pub mod tool_call;
pub mod usage;

pub use agent::{Agent, BatchOptions, BatchResult, BatchStrategy};
pub use complexity::Complexity;
pub use config::{AgentConfig, AgentQualityConfig, CascadeConfig, DomainConfig, RequestOptions, RoutingObjective};
pub use domain::Domain;
pub use error::{Error, ErrorKind, Result};
pub use message::{Message, Query, Role, ToolCall};
pub use metrics::{MetricEvent, MetricsManager, MetricsSnapshot, Subscriber, SubscriptionId};
pub use model::ModelConfig;
pub use pipeline::{CascadeResult, Pipeline, Timings, ToolExecutor};
pub use quality::{QualityJudge, QualityMethod, QualityScore};
pub use streaming::StreamEvent;
pub use tool_call::ToolSpec;
pub use usage::{CostBreakdown, Usage};
