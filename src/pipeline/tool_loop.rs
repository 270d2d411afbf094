//! Tool-call execution loop (spec §4.8.a).
//!
//! Maintains a canonical transcript (original messages + assistant
//! tool-call turns + tool-result turns). Independent calls within one
//! turn run concurrently; results are always merged back in call-issue
//! order regardless of completion order (spec §5 "Ordering guarantees").
//! Grounded structurally on `dashflow`'s executor module's step/segment
//! audit trail, adapted to this crate's transcript model.

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use serde_json::{Map, Value};
use tokio::sync::Semaphore;

use crate::error::{Error, Result};
use crate::message::{Message, ToolCall};
use crate::model::ModelConfig;
use crate::provider::{Provider, ProviderRequest};
use crate::tool_call::{ToolCallValidator, ToolSpec};

/// Caller-supplied handler for executing a single tool call (spec §6
/// `tool_executor: (name, args) -> result`).
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    /// Execute `name` with `arguments`, returning its JSON result.
    async fn execute(&self, name: &str, arguments: &Map<String, Value>) -> Result<Value>;
}

/// Tool-loop parameters (spec §4.8.a).
#[derive(Debug, Clone, Copy)]
pub struct ToolLoopConfig {
    /// Maximum loop iterations. `0` means the model's first response is
    /// used verbatim without executing any tool calls (spec §8 boundary
    /// behavior).
    pub max_steps: u32,
    /// Maximum tool calls executed concurrently within one turn.
    pub parallel_concurrency: usize,
}

impl Default for ToolLoopConfig {
    fn default() -> Self {
        Self {
            max_steps: 5,
            parallel_concurrency: 4,
        }
    }
}

/// One auditable segment of the tool loop: the assistant turn that
/// requested calls, and the tool-result turns that answered them, in
/// call-issue order.
#[derive(Debug, Clone)]
pub struct ToolLoopStep {
    /// The assistant turn, carrying the requested tool calls.
    pub assistant: Message,
    /// Tool-result turns, one per requested call, in call-issue order.
    pub tool_results: Vec<Message>,
}

/// Outcome of running the loop to completion or exhaustion.
#[derive(Debug, Clone)]
pub struct ToolLoopOutcome {
    /// The full transcript: the messages passed in, plus every
    /// assistant/tool turn the loop produced, plus the final assistant
    /// turn.
    pub transcript: Vec<Message>,
    /// Per-turn audit segments, in order.
    pub steps: Vec<ToolLoopStep>,
    /// Final content, tool-call-free (or the `max_steps`-truncated
    /// response verbatim).
    pub final_content: String,
    /// Number of loop iterations actually executed.
    pub steps_taken: u32,
}

/// Run the tool loop starting from `first_content`/`first_tool_calls`,
/// the drafter's (or verifier's) initial response, feeding transcripts
/// back through `provider` until the model stops requesting tools or
/// `config.max_steps` is reached.
#[allow(clippy::too_many_arguments)]
pub async fn run_tool_loop(
    provider: &dyn Provider,
    model: &ModelConfig,
    tools: &[ToolSpec],
    executor: &dyn ToolExecutor,
    validator: &ToolCallValidator,
    mut transcript: Vec<Message>,
    first_content: String,
    first_tool_calls: Vec<ToolCall>,
    config: ToolLoopConfig,
) -> Result<ToolLoopOutcome> {
    let mut steps = Vec::new();
    let mut content = first_content;
    let mut tool_calls = first_tool_calls;

    if config.max_steps == 0 {
        return Ok(ToolLoopOutcome {
            transcript,
            steps,
            final_content: content,
            steps_taken: 0,
        });
    }

    let mut steps_taken = 0u32;
    loop {
        if tool_calls.is_empty() {
            transcript.push(Message::assistant(content.clone()));
            break;
        }
        if steps_taken >= config.max_steps {
            transcript.push(Message::assistant_with_tool_calls(content.clone(), tool_calls.clone()));
            break;
        }

        let assistant = Message::assistant_with_tool_calls(content.clone(), tool_calls.clone());
        transcript.push(assistant.clone());

        let tool_results = execute_calls(&tool_calls, executor, validator, config.parallel_concurrency).await;
        transcript.extend(tool_results.clone());
        steps.push(ToolLoopStep { assistant, tool_results });
        steps_taken += 1;

        let request = ProviderRequest {
            model: model.name.clone(),
            messages: transcript.clone(),
            max_tokens: None,
            temperature: None,
            tools: tools.to_vec(),
            extra: Value::Null,
        };
        let response = provider.generate(request).await?;
        content = response.content;
        tool_calls = response.tool_calls;
    }

    Ok(ToolLoopOutcome {
        transcript,
        steps,
        final_content: content,
        steps_taken,
    })
}

/// Validate and execute `calls` concurrently (bounded by `concurrency`),
/// returning tool-result messages in the same order as `calls` regardless
/// of completion order.
async fn execute_calls(
    calls: &[ToolCall],
    executor: &dyn ToolExecutor,
    validator: &ToolCallValidator,
    concurrency: usize,
) -> Vec<Message> {
    let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));

    let results = stream::iter(calls.iter().cloned().enumerate())
        .map(|(index, call)| {
            let semaphore = semaphore.clone();
            async move {
                let _permit = semaphore.acquire_owned().await;
                let outcome = validator.validate(&call, &[]);
                if !outcome.valid {
                    let reason = outcome.reasons.join("; ");
                    return (index, call.id.clone(), Err(Error::tool_execution(call.name.clone(), reason)));
                }
                let arguments = call.parsed_arguments().unwrap_or_default();
                let result = executor.execute(&call.name, &arguments).await;
                (index, call.id.clone(), result)
            }
        })
        .buffer_unordered(concurrency.max(1))
        .collect::<Vec<_>>()
        .await;

    let mut ordered: Vec<Option<Message>> = vec![None; calls.len()];
    for (index, call_id, result) in results {
        let message = match result {
            Ok(value) => Message::tool_result(call_id, value.to_string()),
            Err(err) => Message::tool_result(call_id, format!("error: {err}")),
        };
        ordered[index] = Some(message);
    }
    ordered.into_iter().flatten().collect()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::model::Provider as ModelProvider;
    use crate::provider::FinishReason;
    use crate::testing::StubProvider;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct EchoExecutor {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ToolExecutor for EchoExecutor {
        async fn execute(&self, name: &str, arguments: &Map<String, Value>) -> Result<Value> {
            self.calls.fetch_add(1, Ordering::Relaxed);
            Ok(serde_json::json!({ "tool": name, "echo": arguments }))
        }
    }

    fn model() -> ModelConfig {
        ModelConfig {
            name: "drafter".into(),
            provider: ModelProvider::OpenAi,
            cost_per_1k_input: 0.0001,
            cost_per_1k_output: 0.0002,
            cost_per_1k_cached: None,
            max_tokens: 4096,
            supports_tools: true,
            quality_score: 0.6,
            speed_ms: 200,
            api_key: None,
            base_url: None,
            deprecated: false,
            extra: HashMap::new(),
        }
    }

    fn done_response(content: &str) -> crate::provider::ProviderResponse {
        crate::provider::ProviderResponse {
            content: content.into(),
            model: "drafter".into(),
            usage: None,
            finish_reason: FinishReason::Stop,
            tool_calls: vec![],
            token_logprobs: None,
        }
    }

    #[tokio::test]
    async fn max_steps_zero_uses_model_output_verbatim() {
        let provider = StubProvider::new(vec![]);
        let executor = EchoExecutor { calls: AtomicUsize::new(0) };
        let validator = ToolCallValidator::new();
        let call = ToolCall::new("get_weather", r#"{"city":"Berlin"}"#);

        let outcome = run_tool_loop(
            &provider,
            &model(),
            &[],
            &executor,
            &validator,
            vec![Message::user("weather in Berlin")],
            "fetching weather".to_string(),
            vec![call],
            ToolLoopConfig { max_steps: 0, parallel_concurrency: 4 },
        )
        .await
        .unwrap();

        assert_eq!(outcome.steps_taken, 0);
        assert!(outcome.steps.is_empty());
        assert_eq!(outcome.final_content, "fetching weather");
        assert_eq!(executor.calls.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn loop_terminates_when_model_stops_requesting_tools() {
        let provider = StubProvider::new(vec![done_response("the weather is sunny")]);
        let executor = EchoExecutor { calls: AtomicUsize::new(0) };
        let validator = ToolCallValidator::new();
        let call = ToolCall::new("get_weather", r#"{"city":"Berlin"}"#);

        let outcome = run_tool_loop(
            &provider,
            &model(),
            &[],
            &executor,
            &validator,
            vec![Message::user("weather in Berlin")],
            String::new(),
            vec![call],
            ToolLoopConfig::default(),
        )
        .await
        .unwrap();

        assert_eq!(outcome.steps_taken, 1);
        assert_eq!(outcome.steps.len(), 1);
        assert_eq!(outcome.final_content, "the weather is sunny");
        assert_eq!(executor.calls.load(Ordering::Relaxed), 1);
        assert!(outcome.transcript.iter().any(|m| m.role == crate::message::Role::Tool));
    }

    #[tokio::test]
    async fn max_steps_cap_stops_the_loop_even_with_pending_tool_calls() {
        let call = ToolCall::new("get_weather", r#"{"city":"Berlin"}"#);
        let provider = StubProvider::new(vec![
            crate::provider::ProviderResponse {
                content: String::new(),
                model: "drafter".into(),
                usage: None,
                finish_reason: FinishReason::ToolCalls,
                tool_calls: vec![call.clone()],
                token_logprobs: None,
            },
        ]);
        let executor = EchoExecutor { calls: AtomicUsize::new(0) };
        let validator = ToolCallValidator::new();

        let outcome = run_tool_loop(
            &provider,
            &model(),
            &[],
            &executor,
            &validator,
            vec![Message::user("weather in Berlin")],
            String::new(),
            vec![call],
            ToolLoopConfig { max_steps: 1, parallel_concurrency: 4 },
        )
        .await
        .unwrap();

        assert_eq!(outcome.steps_taken, 1);
    }

    #[tokio::test]
    async fn invalid_tool_call_produces_error_result_without_executing() {
        let provider = StubProvider::new(vec![done_response("done")]);
        let executor = EchoExecutor { calls: AtomicUsize::new(0) };
        let validator = ToolCallValidator::new();
        let bad_call = ToolCall::new("run_sql", r#"{"query":"DROP TABLE users"}"#);

        let outcome = run_tool_loop(
            &provider,
            &model(),
            &[],
            &executor,
            &validator,
            vec![Message::user("run a query")],
            String::new(),
            vec![bad_call],
            ToolLoopConfig::default(),
        )
        .await
        .unwrap();

        assert_eq!(executor.calls.load(Ordering::Relaxed), 0);
        let tool_message = outcome.steps[0].tool_results[0].clone();
        assert!(tool_message.content.contains("error"));
    }

    #[tokio::test]
    async fn results_merge_in_call_order_regardless_of_completion_order() {
        let call_a = ToolCall::new("slow_tool", r#"{"n":1}"#);
        let call_b = ToolCall::new("fast_tool", r#"{"n":2}"#);
        let provider = StubProvider::new(vec![done_response("done")]);
        let executor = EchoExecutor { calls: AtomicUsize::new(0) };
        let validator = ToolCallValidator::new();

        let outcome = run_tool_loop(
            &provider,
            &model(),
            &[],
            &executor,
            &validator,
            vec![Message::user("do two things")],
            String::new(),
            vec![call_a.clone(), call_b.clone()],
            ToolLoopConfig::default(),
        )
        .await
        .unwrap();

        let results = &outcome.steps[0].tool_results;
        assert_eq!(results[0].tool_call_id.as_deref(), Some(call_a.id.as_str()));
        assert_eq!(results[1].tool_call_id.as_deref(), Some(call_b.id.as_str()));
    }
}
