//! Streaming event model (spec §4.9).
//!
//! `StreamEvent` is the wire-agnostic event the pipeline emits; the
//! ordering guarantees in this module's doc comments are enforced by the
//! pipeline's streaming path (`pipeline::run_streaming`), not by this
//! type itself. Grounded on `dashflow-streaming`'s event-ordering
//! discipline.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::complexity::Complexity;
use crate::domain::Domain;
use crate::error::ErrorKind;
use crate::message::ToolCall;
use crate::router::RoutingStrategy;
use crate::usage::CostBreakdown;

/// A single event in the streaming state machine (spec §3, §4.9).
///
/// Guarantees enforced by the pipeline:
/// - The first event of any stream is always [`StreamEvent::Routing`].
/// - `Chunk` events for one model arrive in upstream order; their content
///   concatenation equals that model's final text.
/// - `DraftDecision` precedes any `Switch`; `Switch` precedes any
///   verifier `Chunk`.
/// - `ToolCallStart`/`ToolCallDelta`/`ToolCallComplete` precede
///   `ToolExecuting`, which precedes `ToolResult` or `ToolError`, per call
///   id.
/// - The terminal event is exactly one of `Complete` or `Error`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "SCREAMING_SNAKE_CASE")]
#[non_exhaustive]
pub enum StreamEvent {
    /// Chosen strategy and models for this request. Always first.
    Routing {
        /// Chosen strategy.
        strategy: RoutingStrategy,
        /// Drafter model name, if a drafter was chosen.
        drafter: Option<String>,
        /// Verifier model name.
        verifier: Option<String>,
        /// Classified complexity.
        complexity: Complexity,
        /// Classified domain.
        domain: Domain,
    },
    /// An incremental content fragment from the currently active model.
    Chunk {
        /// Text fragment.
        content: String,
        /// Name of the model this chunk came from.
        model: String,
    },
    /// The draft was scored and accepted or rejected.
    DraftDecision {
        /// Whether the draft was accepted.
        accepted: bool,
        /// Reason, present when rejected.
        reason: Option<String>,
    },
    /// Execution is switching from one model to another (always a
    /// drafter-to-verifier escalation in this spec).
    Switch {
        /// Model being switched away from.
        from: String,
        /// Model being switched to.
        to: String,
    },
    /// A tool call began streaming in.
    ToolCallStart {
        /// Call id.
        id: String,
        /// Tool name, if already known.
        name: Option<String>,
    },
    /// An incremental argument fragment for an in-flight tool call.
    ToolCallDelta {
        /// Call id.
        id: String,
        /// Argument-string fragment.
        arguments_delta: String,
    },
    /// A tool call finished streaming in and is ready to execute.
    ToolCallComplete {
        /// The fully materialized tool call.
        call: ToolCall,
    },
    /// Execution of a tool call has begun.
    ToolExecuting {
        /// Call id.
        id: String,
    },
    /// A tool call executed successfully.
    ToolResult {
        /// Call id.
        id: String,
        /// Result payload.
        result: Value,
    },
    /// A tool call failed to execute.
    ToolError {
        /// Call id.
        id: String,
        /// Error message.
        error: String,
    },
    /// Terminal success event.
    Complete {
        /// Final text content.
        content: String,
        /// Model that produced the final content.
        model_used: String,
        /// Full cost accounting for the request.
        cost: CostBreakdown,
    },
    /// Terminal failure event.
    Error {
        /// Coarse error classification.
        kind: ErrorKindWire,
        /// Human-readable reason.
        reason: String,
    },
}

/// Wire-serializable mirror of [`ErrorKind`] (the original is not
/// `Serialize` since it is a pure dispatch tag, not wire data).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKindWire {
    /// See [`ErrorKind::Config`].
    Config,
    /// See [`ErrorKind::Admission`].
    Admission,
    /// See [`ErrorKind::TransientProvider`].
    TransientProvider,
    /// See [`ErrorKind::AuthProvider`].
    AuthProvider,
    /// See [`ErrorKind::BadRequest`].
    BadRequest,
    /// See [`ErrorKind::Validation`].
    Validation,
    /// See [`ErrorKind::ToolExecution`].
    ToolExecution,
    /// See [`ErrorKind::Timeout`].
    Timeout,
    /// See [`ErrorKind::Cancelled`].
    Cancelled,
    /// See [`ErrorKind::Internal`].
    Internal,
}

impl From<ErrorKind> for ErrorKindWire {
    fn from(kind: ErrorKind) -> Self {
        match kind {
            ErrorKind::Config => ErrorKindWire::Config,
            ErrorKind::Admission => ErrorKindWire::Admission,
            ErrorKind::TransientProvider => ErrorKindWire::TransientProvider,
            ErrorKind::AuthProvider => ErrorKindWire::AuthProvider,
            ErrorKind::BadRequest => ErrorKindWire::BadRequest,
            ErrorKind::Validation => ErrorKindWire::Validation,
            ErrorKind::ToolExecution => ErrorKindWire::ToolExecution,
            ErrorKind::Timeout => ErrorKindWire::Timeout,
            ErrorKind::Cancelled => ErrorKindWire::Cancelled,
            ErrorKind::Internal => ErrorKindWire::Internal,
        }
    }
}

impl StreamEvent {
    /// Build a terminal error event from a crate [`crate::error::Error`].
    #[must_use]
    pub fn from_error(error: &crate::error::Error) -> Self {
        StreamEvent::Error {
            kind: error.kind().into(),
            reason: error.to_string(),
        }
    }

    /// Whether this event is one of the two valid terminal events.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamEvent::Complete { .. } | StreamEvent::Error { .. })
    }
}

/// Validate the ordering invariants of a completed event sequence (spec
/// §8 invariant 5). Intended for tests exercising
/// `pipeline::run_streaming` against fixtures; not used on the hot path.
#[must_use]
pub fn validate_ordering(events: &[StreamEvent]) -> Result<(), String> {
    let Some(first) = events.first() else {
        return Err("empty event sequence".to_string());
    };
    if !matches!(first, StreamEvent::Routing { .. }) {
        return Err("first event must be Routing".to_string());
    }
    let Some(last) = events.last() else {
        return Err("empty event sequence".to_string());
    };
    if !last.is_terminal() {
        return Err("last event must be Complete or Error".to_string());
    }
    if events[..events.len() - 1].iter().any(StreamEvent::is_terminal) {
        return Err("a terminal event appeared before the end of the sequence".to_string());
    }

    let draft_decision_index = events.iter().position(|e| matches!(e, StreamEvent::DraftDecision { .. }));
    let switch_index = events.iter().position(|e| matches!(e, StreamEvent::Switch { .. }));
    if let (Some(dd), Some(sw)) = (draft_decision_index, switch_index) {
        if dd > sw {
            return Err("DraftDecision must precede Switch".to_string());
        }
    }

    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn complete() -> StreamEvent {
        StreamEvent::Complete {
            content: "done".into(),
            model_used: "gpt-4o-mini".into(),
            cost: CostBreakdown::skipped(),
        }
    }

    fn routing() -> StreamEvent {
        StreamEvent::Routing {
            strategy: RoutingStrategy::Direct,
            drafter: None,
            verifier: Some("gpt-4o-mini".into()),
            complexity: Complexity::Simple,
            domain: Domain::General,
        }
    }

    #[test]
    fn valid_minimal_sequence_passes() {
        let events = vec![routing(), complete()];
        assert!(validate_ordering(&events).is_ok());
    }

    #[test]
    fn sequence_not_starting_with_routing_is_rejected() {
        let events = vec![complete()];
        assert!(validate_ordering(&events).is_err());
    }

    #[test]
    fn sequence_not_ending_in_terminal_is_rejected() {
        let events = vec![routing()];
        assert!(validate_ordering(&events).is_err());
    }

    #[test]
    fn terminal_event_mid_sequence_is_rejected() {
        let events = vec![routing(), complete(), routing()];
        assert!(validate_ordering(&events).is_err());
    }

    #[test]
    fn draft_decision_must_precede_switch() {
        let events = vec![
            routing(),
            StreamEvent::Switch { from: "a".into(), to: "b".into() },
            StreamEvent::DraftDecision { accepted: false, reason: Some("low quality".into()) },
            complete(),
        ];
        assert!(validate_ordering(&events).is_err());
    }

    #[test]
    fn draft_decision_before_switch_is_valid() {
        let events = vec![
            routing(),
            StreamEvent::DraftDecision { accepted: false, reason: Some("low quality".into()) },
            StreamEvent::Switch { from: "a".into(), to: "b".into() },
            complete(),
        ];
        assert!(validate_ordering(&events).is_ok());
    }

    #[test]
    fn error_event_carries_mapped_kind() {
        let err = crate::error::Error::Timeout("deadline".into());
        let event = StreamEvent::from_error(&err);
        assert!(matches!(event, StreamEvent::Error { kind: ErrorKindWire::Timeout, .. }));
        assert!(event.is_terminal());
    }
}
