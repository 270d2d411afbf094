//! Query and transcript data model (spec §3).
//!
//! The transcript is kept as a list of typed turns end-to-end; it is
//! flattened to a provider-native wire payload only at the adapter
//! boundary (outside this crate, per §1/§6). This preserves tool-call
//! structure across the tool loop and the streaming adapters.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Role of a single transcript turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// System prompt / instructions.
    System,
    /// End-user turn.
    User,
    /// Model-generated turn, possibly carrying tool calls.
    Assistant,
    /// Result of executing a tool call, correlated by `tool_call_id`.
    Tool,
}

/// A single tool invocation requested by an assistant turn.
///
/// Invariants: `id` is unique within an assistant turn; `arguments` is
/// either valid JSON or the detector/validator surfaces a structural
/// error before the call is executed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Unique identifier for this call within its assistant turn.
    pub id: String,
    /// Name of the tool being invoked.
    pub name: String,
    /// JSON-object-encoded arguments, as returned by the model.
    pub arguments: String,
}

impl ToolCall {
    /// Construct a new tool call with a random id.
    #[must_use]
    pub fn new(name: impl Into<String>, arguments: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.into(),
            arguments: arguments.into(),
        }
    }

    /// Parse `arguments` as a JSON object, surfacing a [`Error::Validation`]
    /// on malformed or non-object JSON.
    pub fn parsed_arguments(&self) -> Result<serde_json::Map<String, serde_json::Value>> {
        let value: serde_json::Value = serde_json::from_str(&self.arguments).map_err(|e| {
            Error::Validation(format!("tool call `{}` has invalid JSON arguments: {e}", self.name))
        })?;
        value.as_object().cloned().ok_or_else(|| {
            Error::Validation(format!(
                "tool call `{}` arguments must be a JSON object",
                self.name
            ))
        })
    }
}

/// A single transcript turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Who produced this turn.
    pub role: Role,
    /// Textual content. May be empty for a pure tool-call assistant turn.
    pub content: String,
    /// Present on `Tool` turns: the id of the assistant tool call this is
    /// a result for.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    /// Present on `Assistant` turns that requested tool execution.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
}

impl Message {
    /// Build a system message.
    #[must_use]
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
            tool_call_id: None,
            tool_calls: None,
        }
    }

    /// Build a user message.
    #[must_use]
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            tool_call_id: None,
            tool_calls: None,
        }
    }

    /// Build a plain assistant message (no tool calls).
    #[must_use]
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            tool_call_id: None,
            tool_calls: None,
        }
    }

    /// Build an assistant message carrying tool calls.
    #[must_use]
    pub fn assistant_with_tool_calls(content: impl Into<String>, tool_calls: Vec<ToolCall>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            tool_call_id: None,
            tool_calls: Some(tool_calls),
        }
    }

    /// Build a tool-result message correlated to `tool_call_id`.
    #[must_use]
    pub fn tool_result(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            content: content.into(),
            tool_call_id: Some(tool_call_id.into()),
            tool_calls: None,
        }
    }
}

/// A query as given to the agent: either a bare prompt or an already
/// structured transcript.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Query {
    /// A plain prompt string, normalized to a single user message.
    Prompt(String),
    /// An ordered list of messages, already structured by the caller.
    Messages(Vec<Message>),
}

impl Query {
    /// Normalize this query into a message list with an optional system
    /// prompt moved to the head, validating the `tool` message invariant
    /// (every `tool` turn's `tool_call_id` matches a prior assistant tool
    /// call).
    pub fn normalize(&self, system_prompt: Option<&str>) -> Result<Vec<Message>> {
        let mut messages = match self {
            Query::Prompt(text) => {
                if text.trim().is_empty() {
                    return Err(Error::BadRequest("query prompt is empty".into()));
                }
                vec![Message::user(text.clone())]
            }
            Query::Messages(messages) => {
                if messages.is_empty() {
                    return Err(Error::BadRequest("query message list is empty".into()));
                }
                messages.clone()
            }
        };

        if let Some(system) = system_prompt {
            if !system.trim().is_empty() {
                messages.retain(|m| m.role != Role::System);
                messages.insert(0, Message::system(system));
            }
        }

        validate_tool_linkage(&messages)?;
        Ok(messages)
    }
}

/// Validate that every `tool` message references a `tool_call_id` emitted
/// by a preceding assistant turn, and that ids are unique within the
/// transcript (spec §8 invariant 7).
pub fn validate_tool_linkage(messages: &[Message]) -> Result<()> {
    let mut seen_ids = std::collections::HashSet::new();
    let mut known_ids = std::collections::HashSet::new();

    for message in messages {
        match message.role {
            Role::Assistant => {
                if let Some(calls) = &message.tool_calls {
                    for call in calls {
                        if !seen_ids.insert(call.id.clone()) {
                            return Err(Error::Internal(format!(
                                "duplicate tool_call id `{}` in transcript",
                                call.id
                            )));
                        }
                        known_ids.insert(call.id.clone());
                    }
                }
            }
            Role::Tool => {
                let Some(id) = &message.tool_call_id else {
                    return Err(Error::BadRequest(
                        "tool message missing tool_call_id".into(),
                    ));
                };
                if !known_ids.contains(id) {
                    return Err(Error::BadRequest(format!(
                        "tool message references unknown tool_call_id `{id}`"
                    )));
                }
            }
            Role::System | Role::User => {}
        }
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn prompt_normalizes_to_single_user_message() {
        let query = Query::Prompt("hello".into());
        let messages = query.normalize(None).unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].role, Role::User);
    }

    #[test]
    fn empty_prompt_is_bad_request() {
        let query = Query::Prompt("   ".into());
        let err = query.normalize(None).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::BadRequest);
    }

    #[test]
    fn system_prompt_is_moved_to_head() {
        let query = Query::Messages(vec![Message::user("hi")]);
        let messages = query.normalize(Some("be terse")).unwrap();
        assert_eq!(messages[0].role, Role::System);
        assert_eq!(messages[0].content, "be terse");
        assert_eq!(messages[1].role, Role::User);
    }

    #[test]
    fn existing_system_message_is_replaced_not_duplicated() {
        let query = Query::Messages(vec![Message::system("old"), Message::user("hi")]);
        let messages = query.normalize(Some("new")).unwrap();
        assert_eq!(messages.iter().filter(|m| m.role == Role::System).count(), 1);
        assert_eq!(messages[0].content, "new");
    }

    #[test]
    fn tool_message_without_matching_call_is_rejected() {
        let messages = vec![
            Message::user("weather?"),
            Message::tool_result("call-1", "72F"),
        ];
        let err = validate_tool_linkage(&messages).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::BadRequest);
    }

    #[test]
    fn tool_message_with_matching_call_is_accepted() {
        let call = ToolCall {
            id: "call-1".into(),
            name: "get_weather".into(),
            arguments: "{}".into(),
        };
        let messages = vec![
            Message::user("weather?"),
            Message::assistant_with_tool_calls("", vec![call]),
            Message::tool_result("call-1", "72F"),
        ];
        validate_tool_linkage(&messages).unwrap();
    }

    #[test]
    fn duplicate_tool_call_ids_are_rejected() {
        let call = ToolCall {
            id: "dup".into(),
            name: "a".into(),
            arguments: "{}".into(),
        };
        let messages = vec![Message::assistant_with_tool_calls(
            "",
            vec![call.clone(), call],
        )];
        let err = validate_tool_linkage(&messages).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Internal);
    }

    #[test]
    fn parsed_arguments_rejects_non_object_json() {
        let call = ToolCall::new("search", "[1,2,3]");
        let err = call.parsed_arguments().unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Validation);
    }

    #[test]
    fn parsed_arguments_accepts_object_json() {
        let call = ToolCall::new("search", r#"{"query":"rust"}"#);
        let parsed = call.parsed_arguments().unwrap();
        assert_eq!(parsed.get("query").and_then(|v| v.as_str()), Some("rust"));
    }
}
