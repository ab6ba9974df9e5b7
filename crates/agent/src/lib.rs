//! The code-executing agent loop.
//!
//! A session follows a **Reason → Act → Observe** cycle:
//!
//! 1. **Receive** a task (text plus optional images)
//! 2. **Build context**: system prompt, current plan, replayed steps
//! 3. **Stream** the model's reply through the adaptive batcher
//! 4. **Extract** one directive: code to run, or a final answer
//! 5. **If code**: run it on the attached executor, record the
//!    observation, loop back to step 2
//! 6. **If final answer**: commit referenced executions and finish
//!
//! The loop also stops when the step budget runs out, when the model
//! repeats itself, or when it keeps ignoring the directive format.

pub mod batcher;
pub mod context;
pub mod loop_runner;
pub mod planning;
pub mod prompts;
pub mod protocol;
pub mod stream_event;

#[cfg(test)]
mod test_helpers;

pub use batcher::{AdaptiveBatcher, BatchParams, ThroughputTracker};
pub use context::{
    ActionStep, DispatchedCode, ExecutionLog, ExecutionRecord, PlanningStep, SideChannelEntry,
    SideChannelStore, Step, StepKind, StepMemory, spawn_sweeper,
};
pub use loop_runner::{AgentOutcome, CodeAgent, FinishReason, RunRequest};
pub use planning::Planner;
pub use protocol::{CodeDirective, Extraction, FinalAnswer, extract, normalize_fences};
pub use stream_event::AgentStreamEvent;
