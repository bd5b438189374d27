//! Conversation transcript as a tagged-variant event log.
//!
//! The transcript replaces ad hoc backward scanning with explicit helpers:
//! "was an affirmative confirmation observed since the last human input" is
//! a single query, and history normalization (collapsing repeated human
//! turns for backends that reject consecutive same-role messages) happens
//! at the wire boundary, not in the stored log.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::llm_client::{ChatMessage, LlmFunctionCall, LlmToolCall};
use crate::tools::confirm;

/// A capability-call request captured from a model message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolInvocation {
    pub call_id: String,
    pub name: String,
    pub arguments: serde_json::Value,
}

/// One entry in the causal/conversational order of a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TurnEvent {
    Human {
        content: String,
        at: DateTime<Utc>,
    },
    Assistant {
        content: Option<String>,
        tool_calls: Vec<ToolInvocation>,
        at: DateTime<Utc>,
    },
    ToolResult {
        call_id: String,
        tool: String,
        content: String,
        at: DateTime<Utc>,
    },
}

impl TurnEvent {
    pub fn human(content: impl Into<String>) -> Self {
        TurnEvent::Human {
            content: content.into(),
            at: Utc::now(),
        }
    }

    pub fn assistant(content: Option<String>, tool_calls: Vec<ToolInvocation>) -> Self {
        TurnEvent::Assistant {
            content,
            tool_calls,
            at: Utc::now(),
        }
    }

    pub fn tool_result(
        call_id: impl Into<String>,
        tool: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        TurnEvent::ToolResult {
            call_id: call_id.into(),
            tool: tool.into(),
            content: content.into(),
            at: Utc::now(),
        }
    }

    fn is_human(&self) -> bool {
        matches!(self, TurnEvent::Human { .. })
    }
}

/// Append-only event log for one session.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Transcript {
    events: Vec<TurnEvent>,
}

impl Transcript {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, event: TurnEvent) {
        self.events.push(event);
    }

    pub fn events(&self) -> &[TurnEvent] {
        &self.events
    }

    /// Scan backward from the latest event until a human message or a
    /// confirmation-capability result is hit. Returns true only when the
    /// first such result found carries an affirmative value.
    pub fn confirmation_since_last_human(&self) -> bool {
        for event in self.events.iter().rev() {
            match event {
                TurnEvent::Human { .. } => return false,
                TurnEvent::ToolResult { tool, content, .. } if tool == confirm::NAME => {
                    return is_affirmative_result(content);
                }
                _ => {}
            }
        }
        false
    }

    /// Copy of the log with consecutive human entries collapsed to the
    /// latest one. Idempotent: a log without consecutive human entries is
    /// returned unchanged.
    pub fn normalized(&self) -> Vec<TurnEvent> {
        let mut out: Vec<TurnEvent> = Vec::with_capacity(self.events.len());
        for event in &self.events {
            if event.is_human() && out.last().map(TurnEvent::is_human).unwrap_or(false) {
                out.pop();
            }
            out.push(event.clone());
        }
        out
    }

    /// Render the normalized log as chat-completions wire messages,
    /// prefixed by the given system instructions.
    pub fn to_wire(&self, instructions: &str) -> Vec<ChatMessage> {
        let mut messages = vec![ChatMessage::system(instructions)];
        for event in self.normalized() {
            match event {
                TurnEvent::Human { content, .. } => messages.push(ChatMessage::user(content)),
                TurnEvent::Assistant {
                    content,
                    tool_calls,
                    ..
                } => {
                    let wire_calls = if tool_calls.is_empty() {
                        None
                    } else {
                        Some(
                            tool_calls
                                .iter()
                                .map(|call| LlmToolCall {
                                    id: call.call_id.clone(),
                                    call_type: "function".to_string(),
                                    function: LlmFunctionCall {
                                        name: call.name.clone(),
                                        arguments: call.arguments.to_string(),
                                    },
                                })
                                .collect(),
                        )
                    };
                    messages.push(ChatMessage {
                        role: "assistant".to_string(),
                        content,
                        tool_calls: wire_calls,
                        tool_call_id: None,
                    });
                }
                TurnEvent::ToolResult {
                    call_id, content, ..
                } => messages.push(ChatMessage::tool_result(call_id, content)),
            }
        }
        messages
    }
}

/// The confirmation capability reports affirmation as the literal `true`.
fn is_affirmative_result(content: &str) -> bool {
    content.trim().eq_ignore_ascii_case("true")
}
