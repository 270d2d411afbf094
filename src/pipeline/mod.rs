//! Cascade orchestrator (spec §4.8).
//!
//! Wires the classifiers, router, quality validator, cost calculator,
//! rate limiter, and tool loop into the two entry points the rest of the
//! crate builds on: [`Pipeline::run`] (buffered) and
//! [`Pipeline::run_streaming`] (lazy event sequence). Grounded on
//! `dashflow`'s flat core-crate layout and its general
//! classify-route-execute-assemble shape, adapted to the spec's own
//! decision ladder.
//!
//! State machine (spec §4.8, observable as `tracing` spans rather than a
//! stored value, since no component here persists cross-request state):
//! `Init -> Routed -> (Admit | Blocked) -> (Drafting | Direct) ->
//! (ToolLoop | Validating) -> (Accepted | Escalating -> Escalated) ->
//! Done`. `Blocked` and any unhandled error both terminate at `Error`.

pub mod tool_loop;

pub use tool_loop::{run_tool_loop, ToolExecutor, ToolLoopConfig, ToolLoopOutcome, ToolLoopStep};

use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::Stream;
use tracing::debug;

use crate::budget::AdmissionDecision;
use crate::complexity::{Complexity, ComplexityClassifier};
use crate::config::{AgentConfig, RequestOptions};
use crate::cost::{CostCalculator, PriceBook};
use crate::domain::{Domain, DomainClassifier};
use crate::error::{Error, ErrorKind, Result};
use crate::message::{Message, Query, Role, ToolCall};
use crate::metrics::{MetricEvent, MetricsManager};
use crate::model::ModelConfig;
use crate::provider::{ProviderRequest, ProviderResponse};
use crate::quality::{resolve_threshold, QualityMethod, QualityScore, QualityValidator};
use crate::rate_limiter::{RateLimiter, RequestGuard};
use crate::router::{Router, RoutingContext, RoutingStrategy};
use crate::streaming::StreamEvent;
use crate::testing::TraceIdSource;
use crate::tool_call::{ToolCallDetector, ToolCallValidator};
use crate::usage::{estimate_tokens, CostBreakdown, Usage};

/// Coarse pipeline state, for tracing spans and debugging only — no
/// component persists this across requests (spec §5 "Persisted state:
/// none in the core").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    /// Before normalization.
    Init,
    /// Routing decision made.
    Routed,
    /// Admission allowed (possibly with a warn/degrade note).
    Admit,
    /// Admission blocked the request.
    Blocked,
    /// Calling the drafter.
    Drafting,
    /// Calling the verifier directly (no drafter in play).
    Direct,
    /// Running the tool-call loop.
    ToolLoop,
    /// Scoring the draft against the resolved threshold.
    Validating,
    /// Draft accepted without escalation.
    Accepted,
    /// Escalating from drafter to verifier.
    Escalating,
    /// Verifier response accepted as final after escalation.
    Escalated,
    /// Terminal success.
    Done,
    /// Terminal failure.
    Error,
}

/// Per-request wall-clock breakdown (spec §3 `CascadeResult` timing
/// fields).
#[derive(Debug, Clone, Copy, Default)]
pub struct Timings {
    /// Time spent in complexity/domain classification.
    pub complexity_ms: u64,
    /// Time spent calling the drafter (including its own tool loop).
    pub draft_ms: u64,
    /// Time spent scoring the draft against the resolved threshold.
    pub verify_ms: u64,
    /// Time spent calling the verifier (direct or escalated).
    pub verifier_ms: u64,
    /// Unaccounted time (admission, routing, assembly).
    pub overhead_ms: u64,
    /// Total wall-clock time for the request.
    pub total_ms: u64,
}

/// Outcome of a single cascade request (spec §3 `CascadeResult`).
#[derive(Debug, Clone)]
pub struct CascadeResult {
    /// Final text content.
    pub content: String,
    /// Name of the model that produced `content`.
    pub model_used: String,
    /// Whether the cascade strategy was used (drafter attempted at all).
    pub cascaded: bool,
    /// Whether the draft was accepted without escalation.
    pub draft_accepted: bool,
    /// Strategy the router chose.
    pub routing_strategy: RoutingStrategy,
    /// Classified complexity.
    pub complexity: Complexity,
    /// Classified domain.
    pub domain: Domain,
    /// Quality score, present whenever a draft was scored.
    pub quality: Option<QualityScore>,
    /// Reason the draft was rejected, if it was.
    pub rejection_reason: Option<String>,
    /// Tool calls executed over the course of the request.
    pub tool_calls: Vec<ToolCall>,
    /// Full cost accounting.
    pub cost: CostBreakdown,
    /// Wall-clock timing breakdown.
    pub timings: Timings,
    /// The drafter's raw response text, for audit, if a drafter ran.
    pub draft_response: Option<String>,
    /// The verifier's raw response text, for audit, if the verifier ran.
    pub verifier_response: Option<String>,
    /// Trace id correlating this result with emitted metric events.
    pub trace_id: String,
}

/// The cascade orchestrator. Holds the stateless classifiers/router plus
/// the shared, request-spanning resources (rate limiter, price book,
/// metrics fan-out).
pub struct Pipeline {
    config: Arc<AgentConfig>,
    router: Router,
    complexity: ComplexityClassifier,
    domain: DomainClassifier,
    quality: QualityValidator,
    cost: CostCalculator,
    rate_limiter: Arc<RateLimiter>,
    metrics: Arc<MetricsManager>,
    detector: ToolCallDetector,
    tool_validator: ToolCallValidator,
    trace_ids: Arc<dyn TraceIdSource>,
}

impl Pipeline {
    /// Build a pipeline from agent configuration. Registers each
    /// `config.rate_limits` entry with a fresh [`RateLimiter`].
    #[must_use]
    pub fn new(config: Arc<AgentConfig>, metrics: Arc<MetricsManager>, trace_ids: Arc<dyn TraceIdSource>) -> Self {
        let rate_limiter = Arc::new(RateLimiter::new());
        for (provider, policy) in &config.rate_limits {
            rate_limiter.set_policy(provider, *policy);
        }
        Self {
            config,
            router: Router::new(),
            complexity: ComplexityClassifier::new(),
            domain: DomainClassifier::default(),
            quality: QualityValidator::new(),
            cost: CostCalculator::new(PriceBook::new()),
            rate_limiter,
            metrics,
            detector: ToolCallDetector::new(),
            tool_validator: ToolCallValidator::new(),
            trace_ids,
        }
    }

    /// The price book backing this pipeline's cost calculator, so callers
    /// can register external pricing (spec §4.2, §5 "dedicated swap").
    #[must_use]
    pub fn price_book(&self) -> &PriceBook {
        self.cost.book()
    }

    /// Run one request to completion (spec §4.8 steps 1-8).
    pub async fn run(&self, query: &Query, options: &RequestOptions) -> Result<CascadeResult> {
        let deadline = options.deadline_ms.map(Duration::from_millis).or(self.config.cascade.deadline);
        match deadline {
            // A zero-duration `tokio::time::timeout` still polls the inner
            // future once before its timer fires, so a synchronously
            // completing path (or anything before the first await) would
            // run — and have side effects — despite an immediate deadline.
            // Short-circuit instead (spec §5 "Deadline=0 ⇒ immediate
            // timeout error with no side effects").
            Some(d) if d.is_zero() => Err(Error::Timeout("request deadline exceeded".to_string())),
            Some(d) => match tokio::time::timeout(d, self.execute(query, options)).await {
                Ok(result) => result,
                Err(_) => Err(Error::Timeout("request deadline exceeded".to_string())),
            },
            None => self.execute(query, options).await,
        }
    }

    async fn execute(&self, query: &Query, options: &RequestOptions) -> Result<CascadeResult> {
        let total_start = Instant::now();
        let trace_id = self.trace_ids.next_id();
        self.metrics.emit(MetricEvent::QueryStart { trace_id: trace_id.clone() });
        debug!(trace_id = %trace_id, state = ?PipelineState::Init, "starting cascade request");

        let result = self.run_inner(query, options, &trace_id, total_start).await;

        match &result {
            Ok(cascade_result) => {
                debug!(trace_id = %trace_id, state = ?PipelineState::Done, "cascade request completed");
                self.metrics.emit(MetricEvent::QueryComplete {
                    trace_id: trace_id.clone(),
                    total_cost: cascade_result.cost.total_cost,
                });
            }
            Err(err) => {
                debug!(trace_id = %trace_id, state = ?PipelineState::Error, error = %err, "cascade request failed");
                self.metrics.emit(MetricEvent::QueryError {
                    trace_id: trace_id.clone(),
                    error: err.to_string(),
                });
            }
        }
        result
    }

    async fn run_inner(
        &self,
        query: &Query,
        options: &RequestOptions,
        trace_id: &str,
        total_start: Instant,
    ) -> Result<CascadeResult> {
        let messages = query.normalize(options.system_prompt.as_deref())?;
        let user_text = extract_text(&messages);

        let complexity_start = Instant::now();
        let complexity = self.complexity.classify(&user_text);
        let domain = self.domain.classify(&user_text, None);
        let complexity_ms = complexity_start.elapsed().as_millis() as u64;
        self.metrics.emit(MetricEvent::ComplexityDetected {
            trace_id: trace_id.to_string(),
            level: format!("{:?}", complexity.level),
        });

        let domain_cfg = self.config.domains.get(&domain);
        let admission = self.config.budget.evaluate(options.user_tier.as_deref(), options.cumulative_spend);
        let intent = self.detector.detect(&user_text, &[], &options.tools);
        debug!(trace_id = %trace_id, should_call_tools = intent.should_call, "tool intent evaluated");
        let needs_tools = !options.tools.is_empty();

        let context = RoutingContext {
            force_direct: options.force_direct,
            tools: &options.tools,
            needs_tools,
            requested_max_tokens: options.max_tokens,
            domain_requires_verifier: domain_cfg.map(|d| d.requires_verifier).unwrap_or(false),
            domain_excluded_models: domain_cfg.map(|d| d.excluded_models.as_slice()).unwrap_or(&[]),
        };
        let decision = self.router.route(complexity.level, admission, &self.config.models, &context);
        self.metrics.emit(MetricEvent::StrategySelected {
            trace_id: trace_id.to_string(),
            strategy: format!("{:?}", decision.strategy),
        });
        debug!(trace_id = %trace_id, state = ?PipelineState::Routed, strategy = ?decision.strategy, "routing decided");

        if decision.strategy == RoutingStrategy::Skip {
            debug!(trace_id = %trace_id, state = ?PipelineState::Blocked);
            return Err(Error::admission(decision.reasons.join("; "), None));
        }
        debug!(trace_id = %trace_id, state = ?PipelineState::Admit, admission = ?admission);

        let admission_note = match admission {
            AdmissionDecision::Warn => Some("warn"),
            AdmissionDecision::Degrade => Some("degrade"),
            _ => None,
        };
        let explicit_threshold = if admission == AdmissionDecision::Degrade {
            self.config
                .budget
                .degraded_quality_floor(options.user_tier.as_deref())
                .or(self.config.quality.explicit_threshold)
        } else {
            self.config.quality.explicit_threshold
        };
        let domain_threshold = domain_cfg.and_then(|d| d.threshold);
        let threshold = resolve_threshold(explicit_threshold, domain_threshold, complexity.level);

        let max_tool_steps = options.max_steps.unwrap_or(self.config.cascade.max_tool_steps);
        let tool_loop_config = ToolLoopConfig {
            max_steps: max_tool_steps,
            parallel_concurrency: self.config.cascade.tool_parallel_concurrency,
        };

        let mut result = match decision.strategy {
            RoutingStrategy::Direct => {
                debug!(trace_id = %trace_id, state = ?PipelineState::Direct);
                let verifier = decision
                    .verifier
                    .clone()
                    .ok_or_else(|| Error::Internal("direct route produced no verifier".into()))?;

                let verifier_start = Instant::now();
                let request = build_request(&verifier, &messages, options);
                let response = self.call_with_retries(&verifier, request, trace_id).await?;
                let verifier_ms = verifier_start.elapsed().as_millis() as u64;

                let tool_outcome = self
                    .run_tool_loop_if_needed(&verifier, &messages, &response, options, tool_loop_config)
                    .await?;
                let (final_content, tool_calls) = match &tool_outcome {
                    Some(outcome) => (outcome.final_content.clone(), collect_tool_calls(&outcome.steps)),
                    None => (response.content.clone(), vec![]),
                };

                let (usage, verifier_cost, estimated) = self.usage_and_cost(&verifier, &user_text, &response);
                let cost = CostBreakdown::direct(verifier_cost, usage.total_tokens(), estimated)
                    .with_metadata("model", verifier.name.clone());

                CascadeResult {
                    content: final_content,
                    model_used: verifier.name.clone(),
                    cascaded: false,
                    draft_accepted: false,
                    routing_strategy: decision.strategy,
                    complexity: complexity.level,
                    domain,
                    quality: None,
                    rejection_reason: None,
                    tool_calls,
                    cost,
                    timings: Timings {
                        complexity_ms,
                        draft_ms: 0,
                        verify_ms: 0,
                        verifier_ms,
                        overhead_ms: 0,
                        total_ms: 0,
                    },
                    draft_response: None,
                    verifier_response: Some(response.content.clone()),
                    trace_id: trace_id.to_string(),
                }
            }
            RoutingStrategy::Cascade => {
                debug!(trace_id = %trace_id, state = ?PipelineState::Drafting);
                let drafter = decision
                    .drafter
                    .clone()
                    .ok_or_else(|| Error::Internal("cascade route produced no drafter".into()))?;
                let verifier = decision
                    .verifier
                    .clone()
                    .ok_or_else(|| Error::Internal("cascade route produced no verifier".into()))?;

                let draft_start = Instant::now();
                let draft_request = build_request(&drafter, &messages, options);
                let draft_response = self.call_with_retries(&drafter, draft_request, trace_id).await?;
                let draft_ms = draft_start.elapsed().as_millis() as u64;

                let tool_outcome = self
                    .run_tool_loop_if_needed(&drafter, &messages, &draft_response, options, tool_loop_config)
                    .await?;

                if let Some(outcome) = tool_outcome {
                    debug!(trace_id = %trace_id, state = ?PipelineState::ToolLoop);
                    let (usage, draft_cost, estimated) = self.usage_and_cost(&drafter, &user_text, &draft_response);
                    let bigonly_cost = self.cost.cost_for_usage(&verifier, usage);
                    let cost = CostBreakdown::draft_accepted(draft_cost, usage.total_tokens(), bigonly_cost, estimated);
                    self.metrics.emit(MetricEvent::CascadeDecision {
                        trace_id: trace_id.to_string(),
                        draft_accepted: true,
                    });
                    debug!(trace_id = %trace_id, state = ?PipelineState::Accepted, "tool-call draft accepted verbatim");

                    CascadeResult {
                        content: outcome.final_content,
                        model_used: drafter.name.clone(),
                        cascaded: true,
                        draft_accepted: true,
                        routing_strategy: decision.strategy,
                        complexity: complexity.level,
                        domain,
                        quality: None,
                        rejection_reason: None,
                        tool_calls: collect_tool_calls(&outcome.steps),
                        cost,
                        timings: Timings {
                            complexity_ms,
                            draft_ms,
                            verify_ms: 0,
                            verifier_ms: 0,
                            overhead_ms: 0,
                            total_ms: 0,
                        },
                        draft_response: Some(draft_response.content.clone()),
                        verifier_response: None,
                        trace_id: trace_id.to_string(),
                    }
                } else {
                    debug!(trace_id = %trace_id, state = ?PipelineState::Validating);
                    let verify_start = Instant::now();
                    let raw = self
                        .score_draft(&user_text, &draft_response, complexity.level, domain)
                        .await?;
                    let score = QualityValidator::finalize(raw, threshold);
                    let verify_ms = verify_start.elapsed().as_millis() as u64;
                    self.metrics.emit(MetricEvent::CascadeDecision {
                        trace_id: trace_id.to_string(),
                        draft_accepted: score.passed,
                    });

                    if score.passed {
                        debug!(trace_id = %trace_id, state = ?PipelineState::Accepted);
                        let (usage, draft_cost, estimated) = self.usage_and_cost(&drafter, &user_text, &draft_response);
                        let bigonly_cost = self.cost.cost_for_usage(&verifier, usage);
                        let cost =
                            CostBreakdown::draft_accepted(draft_cost, usage.total_tokens(), bigonly_cost, estimated);

                        CascadeResult {
                            content: draft_response.content.clone(),
                            model_used: drafter.name.clone(),
                            cascaded: true,
                            draft_accepted: true,
                            routing_strategy: decision.strategy,
                            complexity: complexity.level,
                            domain,
                            quality: Some(score),
                            rejection_reason: None,
                            tool_calls: vec![],
                            cost,
                            timings: Timings {
                                complexity_ms,
                                draft_ms,
                                verify_ms,
                                verifier_ms: 0,
                                overhead_ms: 0,
                                total_ms: 0,
                            },
                            draft_response: Some(draft_response.content.clone()),
                            verifier_response: None,
                            trace_id: trace_id.to_string(),
                        }
                    } else {
                        debug!(trace_id = %trace_id, state = ?PipelineState::Escalating, reason = ?score.reason);
                        let rejection_reason = score.reason.clone();
                        let mut verifier_messages = messages.clone();
                        verifier_messages.push(Message::assistant(draft_response.content.clone()));

                        let verifier_start = Instant::now();
                        let verifier_request = build_request(&verifier, &verifier_messages, options);
                        let verifier_response =
                            self.call_with_retries(&verifier, verifier_request, trace_id).await?;
                        let verifier_ms = verifier_start.elapsed().as_millis() as u64;

                        let verifier_tool_outcome = self
                            .run_tool_loop_if_needed(&verifier, &verifier_messages, &verifier_response, options, tool_loop_config)
                            .await?;
                        let (final_content, tool_calls) = match &verifier_tool_outcome {
                            Some(outcome) => (outcome.final_content.clone(), collect_tool_calls(&outcome.steps)),
                            None => (verifier_response.content.clone(), vec![]),
                        };

                        let (draft_usage, draft_cost, draft_estimated) =
                            self.usage_and_cost(&drafter, &user_text, &draft_response);
                        let (verifier_usage, verifier_cost, verifier_estimated) =
                            self.usage_and_cost(&verifier, &user_text, &verifier_response);
                        let cost = CostBreakdown::draft_rejected(
                            draft_cost,
                            draft_usage.total_tokens(),
                            verifier_cost,
                            verifier_usage.total_tokens(),
                            draft_estimated || verifier_estimated,
                        );
                        debug!(trace_id = %trace_id, state = ?PipelineState::Escalated);

                        CascadeResult {
                            content: final_content,
                            model_used: verifier.name.clone(),
                            cascaded: true,
                            draft_accepted: false,
                            routing_strategy: decision.strategy,
                            complexity: complexity.level,
                            domain,
                            quality: Some(score),
                            rejection_reason,
                            tool_calls,
                            cost,
                            timings: Timings {
                                complexity_ms,
                                draft_ms,
                                verify_ms,
                                verifier_ms,
                                overhead_ms: 0,
                                total_ms: 0,
                            },
                            draft_response: Some(draft_response.content.clone()),
                            verifier_response: Some(verifier_response.content.clone()),
                            trace_id: trace_id.to_string(),
                        }
                    }
                }
            }
            RoutingStrategy::Skip => unreachable!("Skip is handled above before this match"),
        };

        let total_ms = total_start.elapsed().as_millis() as u64;
        result.timings.total_ms = total_ms;
        let known = result.timings.complexity_ms + result.timings.draft_ms + result.timings.verify_ms + result.timings.verifier_ms;
        result.timings.overhead_ms = total_ms.saturating_sub(known);
        if let Some(note) = admission_note {
            result.cost = result.cost.with_metadata("admission", note);
        }
        Ok(result)
    }

    /// Lazily stream [`StreamEvent`]s for one request (spec §4.9). Ordering
    /// guarantees documented on [`StreamEvent`] are upheld: `Routing`
    /// first, `DraftDecision` before any `Switch`, tool-call events precede
    /// their execution, and exactly one of `Complete`/`Error` terminates
    /// the sequence.
    pub fn run_streaming<'a>(
        &'a self,
        query: &'a Query,
        options: &'a RequestOptions,
    ) -> Pin<Box<dyn Stream<Item = StreamEvent> + Send + 'a>> {
        Box::pin(async_stream::stream! {
            let trace_id = self.trace_ids.next_id();
            self.metrics.emit(MetricEvent::QueryStart { trace_id: trace_id.clone() });

            let messages = match query.normalize(options.system_prompt.as_deref()) {
                Ok(m) => m,
                Err(err) => {
                    self.metrics.emit(MetricEvent::QueryError { trace_id: trace_id.clone(), error: err.to_string() });
                    yield StreamEvent::from_error(&err);
                    return;
                }
            };
            let user_text = extract_text(&messages);

            let complexity = self.complexity.classify(&user_text);
            let domain = self.domain.classify(&user_text, None);
            self.metrics.emit(MetricEvent::ComplexityDetected {
                trace_id: trace_id.clone(),
                level: format!("{:?}", complexity.level),
            });
            let domain_cfg = self.config.domains.get(&domain);
            let admission = self.config.budget.evaluate(options.user_tier.as_deref(), options.cumulative_spend);
            let needs_tools = !options.tools.is_empty();

            let context = RoutingContext {
                force_direct: options.force_direct,
                tools: &options.tools,
                needs_tools,
                requested_max_tokens: options.max_tokens,
                domain_requires_verifier: domain_cfg.map(|d| d.requires_verifier).unwrap_or(false),
                domain_excluded_models: domain_cfg.map(|d| d.excluded_models.as_slice()).unwrap_or(&[]),
            };
            let decision = self.router.route(complexity.level, admission, &self.config.models, &context);
            self.metrics.emit(MetricEvent::StrategySelected {
                trace_id: trace_id.clone(),
                strategy: format!("{:?}", decision.strategy),
            });

            yield StreamEvent::Routing {
                strategy: decision.strategy,
                drafter: decision.drafter.as_ref().map(|m| m.name.clone()),
                verifier: decision.verifier.as_ref().map(|m| m.name.clone()),
                complexity: complexity.level,
                domain,
            };

            if decision.strategy == RoutingStrategy::Skip {
                let err = Error::admission(decision.reasons.join("; "), None);
                self.metrics.emit(MetricEvent::QueryError { trace_id: trace_id.clone(), error: err.to_string() });
                yield StreamEvent::from_error(&err);
                return;
            }

            let explicit_threshold = if admission == AdmissionDecision::Degrade {
                self.config
                    .budget
                    .degraded_quality_floor(options.user_tier.as_deref())
                    .or(self.config.quality.explicit_threshold)
            } else {
                self.config.quality.explicit_threshold
            };
            let domain_threshold = domain_cfg.and_then(|d| d.threshold);
            let threshold = resolve_threshold(explicit_threshold, domain_threshold, complexity.level);
            let max_tool_steps = options.max_steps.unwrap_or(self.config.cascade.max_tool_steps);
            let tool_loop_config = ToolLoopConfig {
                max_steps: max_tool_steps,
                parallel_concurrency: self.config.cascade.tool_parallel_concurrency,
            };

            match decision.strategy {
                RoutingStrategy::Direct => {
                    let verifier = match decision.verifier.clone() {
                        Some(v) => v,
                        None => {
                            let err = Error::Internal("direct route produced no verifier".into());
                            self.metrics.emit(MetricEvent::QueryError { trace_id: trace_id.clone(), error: err.to_string() });
                            yield StreamEvent::from_error(&err);
                            return;
                        }
                    };
                    let request = build_request(&verifier, &messages, options);
                    let response = match self.call_with_retries(&verifier, request, &trace_id).await {
                        Ok(r) => r,
                        Err(err) => {
                            self.metrics.emit(MetricEvent::QueryError { trace_id: trace_id.clone(), error: err.to_string() });
                            yield StreamEvent::from_error(&err);
                            return;
                        }
                    };

                    let tool_outcome = match self
                        .run_tool_loop_if_needed(&verifier, &messages, &response, options, tool_loop_config)
                        .await
                    {
                        Ok(outcome) => outcome,
                        Err(err) => {
                            self.metrics.emit(MetricEvent::QueryError { trace_id: trace_id.clone(), error: err.to_string() });
                            yield StreamEvent::from_error(&err);
                            return;
                        }
                    };
                    let final_content = match &tool_outcome {
                        Some(outcome) => outcome.final_content.clone(),
                        None => response.content.clone(),
                    };
                    // Chunk content must concatenate to the final text (spec
                    // §8 invariant 5): stream the first-turn content only
                    // when there was no tool loop to supersede it, otherwise
                    // stream the final turn's content once the loop settles.
                    match &tool_outcome {
                        Some(outcome) => {
                            for event in tool_step_events(&outcome.steps) {
                                yield event;
                            }
                            yield StreamEvent::Chunk { content: outcome.final_content.clone(), model: verifier.name.clone() };
                        }
                        None => {
                            yield StreamEvent::Chunk { content: response.content.clone(), model: verifier.name.clone() };
                        }
                    }

                    let (usage, verifier_cost, estimated) = self.usage_and_cost(&verifier, &user_text, &response);
                    let cost = CostBreakdown::direct(verifier_cost, usage.total_tokens(), estimated);
                    self.metrics.emit(MetricEvent::QueryComplete { trace_id: trace_id.clone(), total_cost: cost.total_cost });
                    yield StreamEvent::Complete { content: final_content, model_used: verifier.name.clone(), cost };
                }
                RoutingStrategy::Cascade => {
                    let (drafter, verifier) = match (decision.drafter.clone(), decision.verifier.clone()) {
                        (Some(d), Some(v)) => (d, v),
                        _ => {
                            let err = Error::Internal("cascade route missing drafter/verifier".into());
                            self.metrics.emit(MetricEvent::QueryError { trace_id: trace_id.clone(), error: err.to_string() });
                            yield StreamEvent::from_error(&err);
                            return;
                        }
                    };

                    let request = build_request(&drafter, &messages, options);
                    let draft_response = match self.call_with_retries(&drafter, request, &trace_id).await {
                        Ok(r) => r,
                        Err(err) => {
                            self.metrics.emit(MetricEvent::QueryError { trace_id: trace_id.clone(), error: err.to_string() });
                            yield StreamEvent::from_error(&err);
                            return;
                        }
                    };

                    let tool_outcome = match self
                        .run_tool_loop_if_needed(&drafter, &messages, &draft_response, options, tool_loop_config)
                        .await
                    {
                        Ok(outcome) => outcome,
                        Err(err) => {
                            self.metrics.emit(MetricEvent::QueryError { trace_id: trace_id.clone(), error: err.to_string() });
                            yield StreamEvent::from_error(&err);
                            return;
                        }
                    };

                    if let Some(outcome) = tool_outcome {
                        self.metrics.emit(MetricEvent::CascadeDecision { trace_id: trace_id.clone(), draft_accepted: true });
                        for event in tool_step_events(&outcome.steps) {
                            yield event;
                        }
                        // See the Direct arm: only the settled final-turn
                        // content is streamed, so Chunks still concatenate
                        // to the final text when a tool loop ran.
                        yield StreamEvent::Chunk { content: outcome.final_content.clone(), model: drafter.name.clone() };
                        let (usage, draft_cost, estimated) = self.usage_and_cost(&drafter, &user_text, &draft_response);
                        let bigonly_cost = self.cost.cost_for_usage(&verifier, usage);
                        let cost = CostBreakdown::draft_accepted(draft_cost, usage.total_tokens(), bigonly_cost, estimated);
                        self.metrics.emit(MetricEvent::QueryComplete { trace_id: trace_id.clone(), total_cost: cost.total_cost });
                        yield StreamEvent::Complete {
                            content: outcome.final_content,
                            model_used: drafter.name.clone(),
                            cost,
                        };
                        return;
                    }
                    yield StreamEvent::Chunk { content: draft_response.content.clone(), model: drafter.name.clone() };

                    let raw = match self.score_draft(&user_text, &draft_response, complexity.level, domain).await {
                        Ok(s) => s,
                        Err(err) => {
                            self.metrics.emit(MetricEvent::QueryError { trace_id: trace_id.clone(), error: err.to_string() });
                            yield StreamEvent::from_error(&err);
                            return;
                        }
                    };
                    let score = QualityValidator::finalize(raw, threshold);
                    self.metrics.emit(MetricEvent::CascadeDecision { trace_id: trace_id.clone(), draft_accepted: score.passed });
                    yield StreamEvent::DraftDecision { accepted: score.passed, reason: score.reason.clone() };

                    if score.passed {
                        let (usage, draft_cost, estimated) = self.usage_and_cost(&drafter, &user_text, &draft_response);
                        let bigonly_cost = self.cost.cost_for_usage(&verifier, usage);
                        let cost = CostBreakdown::draft_accepted(draft_cost, usage.total_tokens(), bigonly_cost, estimated);
                        self.metrics.emit(MetricEvent::QueryComplete { trace_id: trace_id.clone(), total_cost: cost.total_cost });
                        yield StreamEvent::Complete {
                            content: draft_response.content.clone(),
                            model_used: drafter.name.clone(),
                            cost,
                        };
                        return;
                    }

                    yield StreamEvent::Switch { from: drafter.name.clone(), to: verifier.name.clone() };
                    let mut verifier_messages = messages.clone();
                    verifier_messages.push(Message::assistant(draft_response.content.clone()));
                    let verifier_request = build_request(&verifier, &verifier_messages, options);
                    let verifier_response = match self.call_with_retries(&verifier, verifier_request, &trace_id).await {
                        Ok(r) => r,
                        Err(err) => {
                            self.metrics.emit(MetricEvent::QueryError { trace_id: trace_id.clone(), error: err.to_string() });
                            yield StreamEvent::from_error(&err);
                            return;
                        }
                    };

                    let verifier_tool_outcome = match self
                        .run_tool_loop_if_needed(&verifier, &verifier_messages, &verifier_response, options, tool_loop_config)
                        .await
                    {
                        Ok(outcome) => outcome,
                        Err(err) => {
                            self.metrics.emit(MetricEvent::QueryError { trace_id: trace_id.clone(), error: err.to_string() });
                            yield StreamEvent::from_error(&err);
                            return;
                        }
                    };
                    let final_content = match &verifier_tool_outcome {
                        Some(outcome) => outcome.final_content.clone(),
                        None => verifier_response.content.clone(),
                    };
                    match &verifier_tool_outcome {
                        Some(outcome) => {
                            for event in tool_step_events(&outcome.steps) {
                                yield event;
                            }
                            yield StreamEvent::Chunk { content: outcome.final_content.clone(), model: verifier.name.clone() };
                        }
                        None => {
                            yield StreamEvent::Chunk { content: verifier_response.content.clone(), model: verifier.name.clone() };
                        }
                    }

                    let (draft_usage, draft_cost, draft_estimated) = self.usage_and_cost(&drafter, &user_text, &draft_response);
                    let (verifier_usage, verifier_cost, verifier_estimated) =
                        self.usage_and_cost(&verifier, &user_text, &verifier_response);
                    let cost = CostBreakdown::draft_rejected(
                        draft_cost,
                        draft_usage.total_tokens(),
                        verifier_cost,
                        verifier_usage.total_tokens(),
                        draft_estimated || verifier_estimated,
                    );
                    self.metrics.emit(MetricEvent::QueryComplete { trace_id: trace_id.clone(), total_cost: cost.total_cost });
                    yield StreamEvent::Complete { content: final_content, model_used: verifier.name.clone(), cost };
                }
                RoutingStrategy::Skip => unreachable!("Skip is handled above before this match"),
            }
        })
    }

    async fn run_tool_loop_if_needed(
        &self,
        model: &ModelConfig,
        messages: &[Message],
        response: &ProviderResponse,
        options: &RequestOptions,
        config: ToolLoopConfig,
    ) -> Result<Option<ToolLoopOutcome>> {
        if response.tool_calls.is_empty() {
            return Ok(None);
        }
        let Some(executor) = options.tool_executor.as_ref() else {
            return Err(Error::tool_execution(
                response.tool_calls[0].name.clone(),
                "no tool_executor configured for this request",
            ));
        };
        let provider = self.provider_for(model)?;
        let outcome = run_tool_loop(
            provider.as_ref(),
            model,
            &options.tools,
            executor.as_ref(),
            &self.tool_validator,
            messages.to_vec(),
            response.content.clone(),
            response.tool_calls.clone(),
            config,
        )
        .await?;
        Ok(Some(outcome))
    }

    async fn score_draft(
        &self,
        query_text: &str,
        response: &ProviderResponse,
        complexity: Complexity,
        domain: Domain,
    ) -> Result<QualityScore> {
        match &self.config.quality.method {
            QualityMethod::None => Ok(QualityScore {
                value: 1.0,
                components: crate::quality::QualityComponents::default(),
                passed: false,
                reason: None,
            }),
            QualityMethod::Heuristic => Ok(self.quality.heuristic_score(&response.content)),
            QualityMethod::Logprob => match &response.token_logprobs {
                Some(logprobs) => Ok(self.quality.logprob_score(logprobs)),
                None => Ok(self.quality.heuristic_score(&response.content)),
            },
            QualityMethod::Syntax => Ok(self.quality.syntax_score(&response.content, domain)),
            QualityMethod::Semantic(judge) | QualityMethod::Fact(judge) | QualityMethod::Custom(judge) => {
                judge.score(query_text, &response.content, complexity, domain).await
            }
        }
    }

    fn usage_and_cost(&self, model: &ModelConfig, prompt: &str, response: &ProviderResponse) -> (Usage, f64, bool) {
        match response.usage {
            Some(usage) => (usage, self.cost.cost_for_usage(model, usage), false),
            None => {
                let (cost, usage) = self.cost.cost_for_text(model, prompt, &response.content);
                (usage, cost, true)
            }
        }
    }

    fn provider_for(&self, model: &ModelConfig) -> Result<Arc<dyn crate::provider::Provider>> {
        self.config.providers.get(&model.provider).cloned().ok_or_else(|| {
            Error::Config(format!(
                "model `{}` references provider {:?} with no registered adapter",
                model.name, model.provider
            ))
        })
    }

    fn admit(&self, model: &ModelConfig, token_estimate: u64) -> Result<Option<RequestGuard>> {
        let key = format!("{:?}", model.provider);
        self.rate_limiter.admit(&key, token_estimate)
    }

    async fn call_with_retries(&self, model: &ModelConfig, request: ProviderRequest, trace_id: &str) -> Result<ProviderResponse> {
        let provider = self.provider_for(model)?;
        let max_retries = self.config.cascade.max_retries;
        let token_estimate: u64 = request.messages.iter().map(|m| estimate_tokens(&m.content)).sum();
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            let _guard = self.admit(model, token_estimate)?;
            self.metrics.emit(MetricEvent::ModelCallStart {
                trace_id: trace_id.to_string(),
                model: model.name.clone(),
            });
            let call_start = Instant::now();

            let outcome = tokio::time::timeout(self.config.cascade.step_timeout, provider.generate(request.clone())).await;
            let result = match outcome {
                Ok(inner) => inner,
                Err(_) => Err(Error::Timeout(format!(
                    "provider call to `{}` exceeded step timeout of {:?}",
                    model.name, self.config.cascade.step_timeout
                ))),
            };

            match result {
                Ok(response) => {
                    self.metrics.emit(MetricEvent::ModelCallComplete {
                        trace_id: trace_id.to_string(),
                        model: model.name.clone(),
                        latency_ms: call_start.elapsed().as_millis() as u64,
                    });
                    return Ok(response);
                }
                Err(err) => {
                    self.metrics.emit(MetricEvent::ModelCallError {
                        trace_id: trace_id.to_string(),
                        model: model.name.clone(),
                        error: err.to_string(),
                    });
                    if err.kind() == ErrorKind::TransientProvider && attempt <= max_retries {
                        let backoff_ms = 100u64.saturating_mul(1u64 << attempt.min(10));
                        tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                        continue;
                    }
                    return Err(err);
                }
            }
        }
    }
}

fn build_request(model: &ModelConfig, messages: &[Message], options: &RequestOptions) -> ProviderRequest {
    ProviderRequest {
        model: model.name.clone(),
        messages: messages.to_vec(),
        max_tokens: options.max_tokens,
        temperature: options.temperature,
        tools: options.tools.clone(),
        extra: serde_json::Value::Null,
    }
}

/// The text the classifiers/detector/quality judge operate over: the most
/// recent user turn, or the whole transcript joined if none is found.
fn extract_text(messages: &[Message]) -> String {
    messages
        .iter()
        .rev()
        .find(|m| m.role == Role::User)
        .map(|m| m.content.clone())
        .unwrap_or_else(|| messages.iter().map(|m| m.content.as_str()).collect::<Vec<_>>().join("\n"))
}

fn collect_tool_calls(steps: &[ToolLoopStep]) -> Vec<ToolCall> {
    steps
        .iter()
        .filter_map(|s| s.assistant.tool_calls.clone())
        .flatten()
        .collect()
}

/// Build the `ToolCallStart`/`ToolCallComplete`/`ToolExecuting`/
/// `ToolResult`/`ToolError` event sequence for one tool loop's steps, in
/// an order that satisfies spec §4.9's per-call-id ordering guarantee.
fn tool_step_events(steps: &[ToolLoopStep]) -> Vec<StreamEvent> {
    let mut events = Vec::new();
    for step in steps {
        if let Some(calls) = &step.assistant.tool_calls {
            for call in calls {
                events.push(StreamEvent::ToolCallStart {
                    id: call.id.clone(),
                    name: Some(call.name.clone()),
                });
                events.push(StreamEvent::ToolCallComplete { call: call.clone() });
            }
        }
        for tool_result in &step.tool_results {
            let id = tool_result.tool_call_id.clone().unwrap_or_default();
            events.push(StreamEvent::ToolExecuting { id: id.clone() });
            match tool_result.content.strip_prefix("error: ") {
                Some(reason) => events.push(StreamEvent::ToolError { id, error: reason.to_string() }),
                None => events.push(StreamEvent::ToolResult {
                    id,
                    result: serde_json::Value::String(tool_result.content.clone()),
                }),
            }
        }
    }
    events
}
