//! Top-level process API (spec §6).
//!
//! [`Agent`] is the facade callers construct once per `AgentConfig` and
//! reuse across requests: it validates configuration up front, then wraps
//! [`Pipeline::run`]/[`Pipeline::run_streaming`] with the batch operation
//! the core itself has no notion of. Grounded on `dashflow-factories::llm`'s
//! builder-then-facade shape: construction fails fast, the resulting
//! handle is cheap to clone and share.

use std::pin::Pin;
use std::sync::Arc;

use futures::Stream;

use crate::config::{AgentConfig, RequestOptions};
use crate::error::Result;
use crate::message::Query;
use crate::metrics::{MetricsManager, Subscriber};
use crate::pipeline::{CascadeResult, Pipeline};
use crate::streaming::StreamEvent;
use crate::testing::{RandomTraceIdSource, TraceIdSource};

/// How [`Agent::run_batch`] schedules its queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchStrategy {
    /// Run queries one at a time, in order.
    Sequential,
    /// Run all queries concurrently.
    Parallel,
}

/// Batch-level controls (spec §6 `run_batch`).
#[derive(Debug, Clone, Copy)]
pub struct BatchOptions {
    /// Scheduling strategy.
    pub strategy: BatchStrategy,
    /// `Sequential` only: stop at the first error instead of running the
    /// remaining queries. Ignored under `Parallel`, where every query
    /// always runs to completion and errors are collected rather than
    /// treated as fail-fast (no invariant in §8 requires cancelling
    /// sibling requests on one failure).
    pub stop_on_error: bool,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            strategy: BatchStrategy::Sequential,
            stop_on_error: false,
        }
    }
}

/// Outcome of a batch run (spec §6 `{results[], success_count,
/// failure_count}`). `results` is shorter than the input slice only when
/// `Sequential` + `stop_on_error` halted early.
#[derive(Debug)]
pub struct BatchResult {
    /// One outcome per query attempted, in input order.
    pub results: Vec<Result<CascadeResult>>,
    /// Count of `Ok` entries in `results`.
    pub success_count: usize,
    /// Count of `Err` entries in `results`.
    pub failure_count: usize,
}

impl BatchResult {
    fn from_results(results: Vec<Result<CascadeResult>>) -> Self {
        let success_count = results.iter().filter(|r| r.is_ok()).count();
        let failure_count = results.len() - success_count;
        Self {
            results,
            success_count,
            failure_count,
        }
    }
}

/// The cascade engine's public entry point. Cheap to clone: everything it
/// holds is already `Arc`-shared.
#[derive(Clone)]
pub struct Agent {
    pipeline: Arc<Pipeline>,
    metrics: Arc<MetricsManager>,
}

impl Agent {
    /// Validate `config` and construct an agent from it. Fails fast on any
    /// of the invariants [`AgentConfig::validate`] checks (spec §7
    /// `config` kind: fatal at construction).
    pub fn new(config: AgentConfig) -> Result<Self> {
        Self::with_trace_id_source(config, Arc::new(RandomTraceIdSource))
    }

    /// Same as [`Agent::new`], but with an injectable trace-id source —
    /// tests use a [`crate::testing::SequentialTraceIdSource`] so
    /// `trace_id` assertions are deterministic.
    pub fn with_trace_id_source(config: AgentConfig, trace_ids: Arc<dyn TraceIdSource>) -> Result<Self> {
        config.validate()?;
        let metrics = Arc::new(MetricsManager::new());
        let pipeline = Arc::new(Pipeline::new(Arc::new(config), metrics.clone(), trace_ids));
        Ok(Self { pipeline, metrics })
    }

    /// Register a metrics subscriber (spec §4.10). Returns a handle usable
    /// with [`MetricsManager::unsubscribe`].
    pub fn subscribe(&self, subscriber: Subscriber) -> crate::metrics::SubscriptionId {
        self.metrics.subscribe(subscriber)
    }

    /// The metrics manager backing this agent, for snapshotting or
    /// unsubscribing.
    #[must_use]
    pub fn metrics(&self) -> &MetricsManager {
        &self.metrics
    }

    /// The price book backing this agent's cost calculator, so callers can
    /// register external pricing after construction (spec §4.2, §5
    /// "dedicated swap").
    #[must_use]
    pub fn price_book(&self) -> &crate::cost::PriceBook {
        self.pipeline.price_book()
    }

    /// Run one request to completion (spec §6 `run(query, options) →
    /// CascadeResult`).
    pub async fn run(&self, query: &Query, options: &RequestOptions) -> Result<CascadeResult> {
        self.pipeline.run(query, options).await
    }

    /// Stream one request as a lazy [`StreamEvent`] sequence (spec §6
    /// `stream(query, options) → lazy event sequence`).
    pub fn stream<'a>(
        &'a self,
        query: &'a Query,
        options: &'a RequestOptions,
    ) -> Pin<Box<dyn Stream<Item = StreamEvent> + Send + 'a>> {
        self.pipeline.run_streaming(query, options)
    }

    /// Run many queries under one scheduling strategy, with the same
    /// per-request `options` applied to each (spec §6 `run_batch`).
    pub async fn run_batch(
        &self,
        queries: &[Query],
        options: &RequestOptions,
        batch: BatchOptions,
    ) -> BatchResult {
        match batch.strategy {
            BatchStrategy::Sequential => {
                let mut results = Vec::with_capacity(queries.len());
                for query in queries {
                    let outcome = self.pipeline.run(query, options).await;
                    let failed = outcome.is_err();
                    results.push(outcome);
                    if failed && batch.stop_on_error {
                        break;
                    }
                }
                BatchResult::from_results(results)
            }
            BatchStrategy::Parallel => {
                let futures = queries.iter().map(|query| self.pipeline.run(query, options));
                let results = futures::future::join_all(futures).await;
                BatchResult::from_results(results)
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::model::{ModelConfig, Provider as ModelProvider};
    use crate::provider::{FinishReason, ProviderResponse};
    use crate::testing::{SequentialTraceIdSource, StubProvider};
    use crate::usage::Usage;
    use std::collections::HashMap;

    fn model(name: &str) -> ModelConfig {
        ModelConfig {
            name: name.into(),
            provider: ModelProvider::OpenAi,
            cost_per_1k_input: 0.001,
            cost_per_1k_output: 0.002,
            cost_per_1k_cached: None,
            max_tokens: 4096,
            supports_tools: true,
            quality_score: 0.7,
            speed_ms: 300,
            api_key: None,
            base_url: None,
            deprecated: false,
            extra: HashMap::new(),
        }
    }

    fn response(content: &str) -> ProviderResponse {
        ProviderResponse {
            content: content.into(),
            model: "stub".into(),
            usage: Some(Usage::new(10, 10)),
            finish_reason: FinishReason::Stop,
            tool_calls: vec![],
            token_logprobs: None,
        }
    }

    #[test]
    fn construction_fails_fast_on_invalid_config() {
        let config = AgentConfig::new(vec![]);
        let err = Agent::new(config).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Config);
    }

    #[tokio::test]
    async fn run_delegates_to_the_pipeline() {
        let provider = StubProvider::new(vec![response("a single-model direct answer")]);
        let config = AgentConfig::new(vec![model("only")]).with_provider(ModelProvider::OpenAi, Arc::new(provider));
        let agent = Agent::with_trace_id_source(config, Arc::new(SequentialTraceIdSource::new("a"))).unwrap();

        let result = agent
            .run(&Query::Prompt("hello".into()), &RequestOptions::default())
            .await
            .unwrap();
        assert_eq!(result.model_used, "only");
    }

    #[tokio::test]
    async fn sequential_batch_stops_at_first_error_when_requested() {
        let provider = StubProvider::new(vec![response("first ok")]);
        let config = AgentConfig::new(vec![model("only")]).with_provider(ModelProvider::OpenAi, Arc::new(provider));
        let agent = Agent::with_trace_id_source(config, Arc::new(SequentialTraceIdSource::new("b"))).unwrap();

        let queries = vec![Query::Prompt("hi".into()), Query::Prompt("   ".into()), Query::Prompt("never reached".into())];
        let batch = agent
            .run_batch(
                &queries,
                &RequestOptions::default(),
                BatchOptions { strategy: BatchStrategy::Sequential, stop_on_error: true },
            )
            .await;

        assert_eq!(batch.results.len(), 2);
        assert!(batch.results[0].is_ok());
        assert!(batch.results[1].is_err());
        assert_eq!(batch.success_count, 1);
        assert_eq!(batch.failure_count, 1);
    }

    #[tokio::test]
    async fn parallel_batch_runs_every_query_and_collects_errors() {
        let provider = StubProvider::new(vec![response("ok 1"), response("ok 2")]);
        let config = AgentConfig::new(vec![model("only")]).with_provider(ModelProvider::OpenAi, Arc::new(provider));
        let agent = Agent::with_trace_id_source(config, Arc::new(SequentialTraceIdSource::new("c"))).unwrap();

        let queries = vec![Query::Prompt("one".into()), Query::Prompt("".into()), Query::Prompt("two".into())];
        let batch = agent
            .run_batch(
                &queries,
                &RequestOptions::default(),
                BatchOptions { strategy: BatchStrategy::Parallel, stop_on_error: false },
            )
            .await;

        assert_eq!(batch.results.len(), 3);
        assert!(batch.results[0].is_ok());
        assert!(batch.results[1].is_err());
        assert!(batch.results[2].is_ok());
        assert_eq!(batch.success_count, 2);
        assert_eq!(batch.failure_count, 1);
    }
}
