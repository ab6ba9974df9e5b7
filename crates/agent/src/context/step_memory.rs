//! Step memory: the ordered log a session replays into every model call.
//!
//! Steps are appended in iteration order and never edited afterwards. The
//! system prompt is the one exception: it lives in a single slot that is
//! replaced whenever the session's context changes (for instance when an
//! executor attaches), so there is at most one live instance.
//!
//! Alongside the log, memory owns the two shared stores executed code can
//! reach: the [`SideChannelStore`] and the [`ExecutionLog`].

use chrono::{DateTime, Utc};
use codeloop_core::{Language, Message, Role};
use serde::{Deserialize, Serialize};

use super::execution_log::ExecutionLog;
use super::side_channel::SideChannelStore;

// ── Data Structures ───────────────────────────────────────────────────────

/// One entry in the session log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Step {
    SystemPrompt {
        text: String,
    },
    Task {
        text: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        images: Vec<String>,
    },
    Action(ActionStep),
    Planning(PlanningStep),
}

/// Discriminant of [`Step`], for filtering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    SystemPrompt,
    Task,
    Action,
    Planning,
}

impl Step {
    pub fn kind(&self) -> StepKind {
        match self {
            Self::SystemPrompt { .. } => StepKind::SystemPrompt,
            Self::Task { .. } => StepKind::Task,
            Self::Action(_) => StepKind::Action,
            Self::Planning(_) => StepKind::Planning,
        }
    }

    pub fn task(text: impl Into<String>, images: Vec<String>) -> Self {
        Self::Task {
            text: text.into(),
            images,
        }
    }
}

/// One loop iteration that produced a directive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionStep {
    pub step_number: u32,

    /// Messages sent for this iteration's completion
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_input: Option<Vec<Message>>,

    /// Raw model text, kept verbatim so directive syntax replays exactly
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_output: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call: Option<DispatchedCode>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observation: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub observation_images: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_output: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    pub start_time: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
}

impl ActionStep {
    pub fn new(step_number: u32) -> Self {
        Self {
            step_number,
            model_input: None,
            model_output: None,
            tool_call: None,
            observation: None,
            observation_images: Vec::new(),
            final_output: None,
            error: None,
            start_time: Utc::now(),
            end_time: None,
        }
    }
}

/// The code directive an action dispatched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchedCode {
    /// Execution record id
    pub id: String,
    pub completion_id: String,
    pub language: Language,
    pub code: String,
}

/// A facts-then-plan side conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanningStep {
    pub step_number: u32,
    pub facts: String,
    pub plan: String,
    pub model_input: Vec<Message>,
    pub model_output_facts: String,
    pub model_output_plan: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
}

/// The session log plus its auxiliary stores.
#[derive(Debug, Clone, Default)]
pub struct StepMemory {
    system_prompt: Option<Step>,
    steps: Vec<Step>,
    executions: ExecutionLog,
    side_channel: SideChannelStore,
}

// ── Implementation ────────────────────────────────────────────────────────

impl StepMemory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Clear every step and both stores.
    ///
    /// Store handles held elsewhere stay valid and see the cleared state.
    pub fn reset(&mut self) {
        self.system_prompt = None;
        self.steps.clear();
        self.executions.clear();
        self.side_channel.clear_all();
    }

    /// Append a step. A system prompt replaces the current one instead.
    pub fn add_step(&mut self, step: Step) {
        match step {
            Step::SystemPrompt { .. } => self.system_prompt = Some(step),
            other => self.steps.push(other),
        }
    }

    pub fn steps_by_kind(&self, kind: StepKind) -> Vec<&Step> {
        self.system_prompt
            .iter()
            .chain(self.steps.iter())
            .filter(|s| s.kind() == kind)
            .collect()
    }

    /// Logged steps in order, excluding the system prompt slot.
    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn system_prompt(&self) -> Option<&str> {
        match &self.system_prompt {
            Some(Step::SystemPrompt { text }) => Some(text),
            _ => None,
        }
    }

    /// The most recent planning step, if any.
    pub fn latest_plan(&self) -> Option<&PlanningStep> {
        self.steps.iter().rev().find_map(|s| match s {
            Step::Planning(p) => Some(p),
            _ => None,
        })
    }

    pub fn executions(&self) -> &ExecutionLog {
        &self.executions
    }

    pub fn side_channel(&self) -> &SideChannelStore {
        &self.side_channel
    }

    /// Replay the log as chat messages.
    ///
    /// Summary mode drops the system prompt, raw model output and planning
    /// steps, leaving what happened rather than what was said about it.
    /// Adjacent assistant messages are merged; user messages never are.
    pub fn to_messages(&self, summary_mode: bool) -> Vec<Message> {
        let mut messages = Vec::new();

        if !summary_mode && let Some(text) = self.system_prompt() {
            messages.push(Message::system(text));
        }

        for step in &self.steps {
            match step {
                Step::SystemPrompt { .. } => {}
                Step::Task { text, images } => {
                    messages.push(Message::user(text.as_str()).with_images(images.clone()));
                }
                Step::Action(action) => action_messages(action, summary_mode, &mut messages),
                Step::Planning(plan) => {
                    if !summary_mode {
                        messages.push(Message::assistant(format!("## Facts\n{}", plan.facts)));
                        messages.push(Message::assistant(format!("## Plan\n{}", plan.plan)));
                    }
                }
            }
        }

        merge_adjacent_assistant(messages)
    }
}

fn action_messages(action: &ActionStep, summary_mode: bool, out: &mut Vec<Message>) {
    if !summary_mode
        && let Some(output) = action.model_output.as_deref().filter(|o| !o.trim().is_empty())
    {
        out.push(Message::assistant(output));
    }

    if let Some(call) = &action.tool_call {
        out.push(Message::user(format!(
            "Dispatched {} code as execution `{}`:\n<{tag} id=\"{}\">\n{}\n</{tag}>",
            call.language,
            call.id,
            call.id,
            call.code.trim_end(),
            tag = call.language.tag(),
        )));
    }

    if let Some(observation) = &action.observation {
        let body = if observation.trim().is_empty() {
            "(no output)"
        } else {
            observation.trim_end()
        };
        out.push(
            Message::user(format!("<observation>\n{body}\n</observation>"))
                .with_images(action.observation_images.clone()),
        );
    }

    if let Some(error) = &action.error {
        out.push(Message::user(format!(
            "<observation>\nExecution failed:\n{}\n</observation>\nFix the problem and try again, or finalize if it cannot be fixed.",
            error.trim_end()
        )));
    }
}

fn merge_adjacent_assistant(messages: Vec<Message>) -> Vec<Message> {
    let mut merged: Vec<Message> = Vec::with_capacity(messages.len());
    for message in messages {
        match merged.last_mut() {
            Some(last) if last.role == Role::Assistant && message.role == Role::Assistant => {
                last.content.push('\n');
                last.content.push_str(&message.content);
                last.images.extend(message.images);
            }
            _ => merged.push(message),
        }
    }
    merged
}
