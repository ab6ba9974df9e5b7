//! Agent-level streaming events.
//!
//! `AgentStreamEvent` is what a host forwards to its clients while a session
//! runs. Serialized with a `type` tag:
//!
//! - `new_completion`: a model call is starting
//! - `text_chunk`: one batch of model output (or the final answer)
//! - `text`: the full text of a completed model call
//! - `tool_call`: code is being dispatched to the executor
//! - `tool_call_output`: the execution's observation or error
//! - `error`: the session failed
//! - `guidance`: a corrective retry was injected
//! - `thought`: executed code left a note in the side channel
//! - `planning` / `planning_failed`: the planning sub-loop ran
//! - `done`: the session finalized

use serde::{Deserialize, Serialize};

use crate::loop_runner::FinishReason;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentStreamEvent {
    NewCompletion {
        completion_id: String,
    },

    TextChunk {
        content: String,
    },

    Text {
        content: String,
    },

    ToolCall {
        name: String,
        arguments: serde_json::Value,
        call_id: String,
    },

    ToolCallOutput {
        content: String,
        call_id: String,
    },

    Error {
        content: String,
    },

    Guidance {
        content: String,
    },

    Thought {
        content: String,
    },

    Planning {
        facts: String,
        plan: String,
    },

    PlanningFailed {
        message: String,
    },

    Done {
        answer: String,
        reason: FinishReason,
        steps_consumed: u32,
    },
}

impl AgentStreamEvent {
    /// SSE event name for this event type.
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::NewCompletion { .. } => "new_completion",
            Self::TextChunk { .. } => "text_chunk",
            Self::Text { .. } => "text",
            Self::ToolCall { .. } => "tool_call",
            Self::ToolCallOutput { .. } => "tool_call_output",
            Self::Error { .. } => "error",
            Self::Guidance { .. } => "guidance",
            Self::Thought { .. } => "thought",
            Self::Planning { .. } => "planning",
            Self::PlanningFailed { .. } => "planning_failed",
            Self::Done { .. } => "done",
        }
    }

    /// Whether this event ends the stream.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done { .. } | Self::Error { .. })
    }
}
