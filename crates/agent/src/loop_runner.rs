//! The agent reasoning loop.
//!
//! Each iteration requests a completion, streams it through the
//! [`AdaptiveBatcher`], and extracts one directive from the full text:
//!
//! - **code**: dispatch to the executor, record the observation, loop
//! - **final answer**: commit referenced executions, render, finish
//! - **nothing usable**: with an executor, inject a corrective note and
//!   retry without spending budget; without one, the text is the answer
//!
//! Only code and final-answer iterations consume the step budget. The loop
//! force-finalizes with a fixed diagnostic when the budget runs out, when
//! the model repeats itself or goes silent, or when guidance keeps failing.
//! Provider failures end the run with a typed error and are never retried.

use chrono::Utc;
use codeloop_config::AppConfig;
use codeloop_core::{
    CodeExecutor, Error, ExecutionRequest, Language, Message, Provider, ProviderRequest, Role,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::batcher::AdaptiveBatcher;
use crate::context::{
    ActionStep, DispatchedCode, ExecutionLog, ExecutionRecord, SideChannelStore, Step, StepMemory,
};
use crate::planning::Planner;
use crate::prompts;
use crate::protocol::{self, CodeDirective, Extraction, FinalAnswer};
use crate::stream_event::AgentStreamEvent;

/// Why a run finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    /// The model gave a final-answer directive.
    Answered,
    /// Executed code supplied the final answer.
    ExecutionFinalized,
    /// No executor attached; the model's text is the answer.
    PlainText,
    MaxSteps,
    StuckLoop,
    FormatTrouble,
}

/// The result of a finished run.
#[derive(Debug, Clone)]
pub struct AgentOutcome {
    /// The answer with committed executions rendered after it.
    pub answer: String,
    pub reason: FinishReason,
    pub steps_consumed: u32,
    /// Model calls issued by the main loop (planning calls excluded).
    pub completions: u32,
    /// Executions the answer committed.
    pub committed: Vec<ExecutionRecord>,
}

/// Input for one run.
#[derive(Debug, Clone, Default)]
pub struct RunRequest {
    pub task: String,
    pub images: Vec<String>,
    /// Extra messages sent after the replayed steps on every call.
    pub messages: Vec<Message>,
}

impl RunRequest {
    pub fn new(task: impl Into<String>) -> Self {
        Self {
            task: task.into(),
            ..Self::default()
        }
    }

    pub fn with_images(mut self, images: Vec<String>) -> Self {
        self.images = images;
        self
    }

    pub fn with_messages(mut self, messages: Vec<Message>) -> Self {
        self.messages = messages;
        self
    }
}

/// Per-run counters. Not part of step memory.
#[derive(Debug, Default)]
struct SessionState {
    consumed: u32,
    completions: u32,
    guidance_attempts: u32,
    last_output: Option<String>,
    empty_streak: u32,
    guidance_pending: bool,
}

impl SessionState {
    /// Track the latest output; true when the loop is stuck.
    fn is_stuck(&mut self, text: &str) -> bool {
        let stuck = if text.trim().is_empty() {
            self.empty_streak += 1;
            self.empty_streak >= 2
        } else {
            self.empty_streak = 0;
            self.last_output.as_deref() == Some(text)
        };
        self.last_output = Some(text.to_string());
        stuck
    }
}

struct EventSink(Option<mpsc::Sender<AgentStreamEvent>>);

impl EventSink {
    async fn send(&self, event: AgentStreamEvent) {
        if let Some(tx) = &self.0 {
            // A dropped receiver only means nobody is listening
            let _ = tx.send(event).await;
        }
    }
}

/// A code-executing agent session.
pub struct CodeAgent {
    /// The LLM provider
    provider: Arc<dyn Provider>,

    /// The execution kernel, when attached
    executor: Option<Arc<dyn CodeExecutor>>,

    config: AppConfig,

    /// Step log and shared stores
    memory: StepMemory,

    planner: Planner,

    /// Caller-supplied capability summary for planning prompts
    capabilities: String,

    /// Set when the executor failed to start; blocks runs until cleared
    startup_error: Option<String>,
}

impl CodeAgent {
    /// Create a session without an executor.
    pub fn new(provider: Arc<dyn Provider>, config: AppConfig) -> Self {
        let planner = Planner::new(
            provider.clone(),
            config.model.clone(),
            config.planning.clone(),
        );
        let mut agent = Self {
            provider,
            executor: None,
            config,
            memory: StepMemory::new(),
            planner,
            capabilities: String::new(),
            startup_error: None,
        };
        agent.install_system_prompt();
        agent
    }

    /// Set the capability summary shown to the planner.
    pub fn with_capabilities(mut self, summary: impl Into<String>) -> Self {
        self.capabilities = summary.into();
        self
    }

    /// Initialize and attach an executor.
    ///
    /// On failure the session is blocked until [`reconfigure`](Self::reconfigure),
    /// [`detach_executor`](Self::detach_executor) or a successful attach.
    pub async fn attach_executor(&mut self, executor: Arc<dyn CodeExecutor>) -> Result<(), Error> {
        match executor.initialize().await {
            Ok(()) => {
                info!(executor = executor.name(), "Executor attached");
                self.executor = Some(executor);
                self.startup_error = None;
                self.install_system_prompt();
                Ok(())
            }
            Err(e) => {
                let message = e.to_string();
                warn!(executor = executor.name(), error = %message, "Executor failed to start");
                self.executor = None;
                self.startup_error = Some(message.clone());
                self.install_system_prompt();
                Err(Error::Startup(message))
            }
        }
    }

    pub fn detach_executor(&mut self) {
        self.executor = None;
        self.startup_error = None;
        self.install_system_prompt();
    }

    /// Replace the configuration, keeping steps, executor and capabilities.
    pub fn reconfigure(&mut self, config: AppConfig) -> Result<(), Error> {
        config.validate()?;
        self.planner = Planner::new(
            self.provider.clone(),
            config.model.clone(),
            config.planning.clone(),
        );
        self.config = config;
        self.startup_error = None;
        self.install_system_prompt();
        Ok(())
    }

    /// Start a fresh session. Configuration, executor and capabilities stay.
    pub fn reset(&mut self) {
        self.memory.reset();
        self.install_system_prompt();
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn memory(&self) -> &StepMemory {
        &self.memory
    }

    /// Handle for executors and hosts to write out-of-band signals.
    pub fn side_channel(&self) -> SideChannelStore {
        self.memory.side_channel().clone()
    }

    pub fn executions(&self) -> ExecutionLog {
        self.memory.executions().clone()
    }

    pub fn startup_error(&self) -> Option<&str> {
        self.startup_error.as_deref()
    }

    /// Periodically sweep stale side-channel entries and uncommitted
    /// execution records until `cancel` fires.
    pub fn spawn_sweeper(&self, cancel: CancellationToken) -> JoinHandle<()> {
        crate::context::spawn_sweeper(
            self.side_channel(),
            self.executions(),
            self.config.agent.side_channel_ttl(),
            self.config.agent.sweep_interval(),
            cancel,
        )
    }

    fn execution_language(&self) -> Option<Language> {
        self.executor
            .as_ref()
            .map(|_| self.config.agent.execution_language)
    }

    fn install_system_prompt(&mut self) {
        let text =
            prompts::system_prompt(&self.config.agent.instructions, self.execution_language());
        self.memory.add_step(Step::SystemPrompt { text });
    }

    /// Run the loop in a background task, streaming events.
    ///
    /// The task hands the session back together with the result.
    pub fn run_stream(
        mut self,
        request: RunRequest,
        cancel: CancellationToken,
    ) -> (
        mpsc::Receiver<AgentStreamEvent>,
        JoinHandle<(Self, Result<AgentOutcome, Error>)>,
    ) {
        let (tx, rx) = mpsc::channel(128);
        let handle = tokio::spawn(async move {
            let result = self.run(request, cancel, Some(tx)).await;
            (self, result)
        });
        (rx, handle)
    }

    /// Run the loop until it finalizes, errors, or is cancelled.
    pub async fn run(
        &mut self,
        request: RunRequest,
        cancel: CancellationToken,
        events: Option<mpsc::Sender<AgentStreamEvent>>,
    ) -> Result<AgentOutcome, Error> {
        let sink = EventSink(events);

        if let Some(message) = &self.startup_error {
            let err = Error::Startup(message.clone());
            sink.send(AgentStreamEvent::Error {
                content: err.to_string(),
            })
            .await;
            return Err(err);
        }

        let RunRequest {
            task,
            images,
            messages: extra,
        } = request;
        self.memory.add_step(Step::task(task.clone(), images));

        let max_steps = self.config.agent.max_steps;
        let mut state = SessionState::default();

        info!(
            model = %self.config.model,
            max_steps,
            executor = self.executor.as_ref().map(|e| e.name()).unwrap_or("none"),
            "Agent loop starting"
        );

        if self.planner.is_due(0) {
            self.refresh_plan(&task, 0, &sink, &cancel).await?;
        }

        loop {
            if cancel.is_cancelled() {
                info!(steps = state.consumed, "Agent loop cancelled");
                return Err(Error::Cancelled);
            }

            let outbound = self.outbound_messages(&extra, &state);
            let completion_id = uuid::Uuid::new_v4().to_string();
            state.completions += 1;

            debug!(
                completion = %completion_id,
                messages = outbound.len(),
                consumed = state.consumed,
                "Requesting completion"
            );
            sink.send(AgentStreamEvent::NewCompletion {
                completion_id: completion_id.clone(),
            })
            .await;

            let text = match self.complete_text(outbound.clone(), &sink, &cancel).await {
                Ok(text) => text,
                Err(Error::Cancelled) => {
                    info!(steps = state.consumed, "Agent loop cancelled");
                    return Err(Error::Cancelled);
                }
                Err(e) => {
                    warn!(error = %e, kind = ?e.kind(), "Completion failed");
                    sink.send(AgentStreamEvent::Error {
                        content: e.to_string(),
                    })
                    .await;
                    return Err(e);
                }
            };

            sink.send(AgentStreamEvent::Text {
                content: text.clone(),
            })
            .await;

            if state.is_stuck(&text) {
                warn!(steps = state.consumed, "Model output repeated or empty, stopping");
                return Ok(self
                    .finish(
                        FinishReason::StuckLoop,
                        prompts::STUCK_LOOP_MESSAGE.into(),
                        Vec::new(),
                        &state,
                        &sink,
                    )
                    .await);
            }

            let extraction = protocol::extract(&text, self.config.agent.fallback_language);

            match (extraction, self.executor.clone()) {
                (Extraction::FinalAnswer(answer), _) => {
                    state.consumed += 1;
                    let (rendered, committed) = self.render_answer(answer);

                    let mut action = ActionStep::new(state.consumed);
                    action.model_input = Some(outbound);
                    action.model_output = Some(text);
                    action.final_output = Some(rendered.clone());
                    action.end_time = Some(Utc::now());
                    self.memory.add_step(Step::Action(action));

                    return Ok(self
                        .finish(FinishReason::Answered, rendered, committed, &state, &sink)
                        .await);
                }

                (Extraction::Code(directive), Some(executor)) => {
                    state.consumed += 1;
                    state.guidance_attempts = 0;
                    state.guidance_pending = false;

                    let finalized = self
                        .dispatch(
                            directive,
                            executor,
                            text,
                            outbound,
                            &completion_id,
                            &state,
                            &sink,
                            &cancel,
                        )
                        .await?;
                    if let Some(outcome) = finalized {
                        return Ok(outcome);
                    }

                    if state.consumed >= max_steps {
                        warn!(max_steps, "Maximum steps reached");
                        return Ok(self
                            .finish(
                                FinishReason::MaxSteps,
                                prompts::MAX_STEPS_MESSAGE.into(),
                                Vec::new(),
                                &state,
                                &sink,
                            )
                            .await);
                    }

                    if self.planner.is_due(state.consumed) {
                        self.refresh_plan(&task, state.consumed, &sink, &cancel)
                            .await?;
                    }
                }

                (_, None) => {
                    // Without an executor the first coherent reply is the answer
                    if text.trim().is_empty() {
                        continue;
                    }

                    let mut action = ActionStep::new(state.consumed);
                    action.model_input = Some(outbound);
                    action.model_output = Some(text.clone());
                    action.final_output = Some(text.clone());
                    action.end_time = Some(Utc::now());
                    self.memory.add_step(Step::Action(action));

                    return Ok(self
                        .finish(FinishReason::PlainText, text, Vec::new(), &state, &sink)
                        .await);
                }

                (Extraction::NoDirective, Some(_)) => {
                    state.guidance_attempts += 1;
                    if state.guidance_attempts > self.config.agent.guidance_ceiling {
                        warn!(
                            attempts = state.guidance_attempts,
                            "Model kept missing the directive format"
                        );
                        return Ok(self
                            .finish(
                                FinishReason::FormatTrouble,
                                prompts::FORMAT_TROUBLE_MESSAGE.into(),
                                Vec::new(),
                                &state,
                                &sink,
                            )
                            .await);
                    }

                    debug!(attempt = state.guidance_attempts, "Injecting guidance");
                    state.guidance_pending = true;
                    sink.send(AgentStreamEvent::Guidance {
                        content: prompts::GUIDANCE_NOTE.into(),
                    })
                    .await;
                }
            }
        }
    }

    /// Messages for the next completion.
    fn outbound_messages(&self, extra: &[Message], state: &SessionState) -> Vec<Message> {
        let mut system = self.memory.system_prompt().unwrap_or_default().to_string();
        if let Some(plan) = self.memory.latest_plan() {
            system = prompts::with_plan(&system, &plan.plan);
        }

        let mut messages = vec![Message::system(system)];

        if let Some(language) = self.execution_language()
            && self.config.agent.include_examples
        {
            messages.extend(prompts::example_exchanges(language));
        }

        messages.extend(
            self.memory
                .to_messages(false)
                .into_iter()
                .filter(|m| m.role != Role::System),
        );
        messages.extend(extra.iter().cloned());

        if state.guidance_pending {
            messages.push(Message::user(prompts::GUIDANCE_NOTE));
        }
        if self.executor.is_some() && state.consumed + 2 >= self.config.agent.max_steps {
            messages.push(Message::user(prompts::FINALIZE_REMINDER));
        }

        messages
    }

    /// Request a completion and return its full text.
    async fn complete_text(
        &self,
        messages: Vec<Message>,
        sink: &EventSink,
        cancel: &CancellationToken,
    ) -> Result<String, Error> {
        let request = ProviderRequest {
            model: self.config.model.clone(),
            messages,
            temperature: self.config.temperature,
            max_tokens: self.config.max_tokens,
            stream: self.config.stream,
            stop: vec![],
        };

        if !self.config.stream {
            let response = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                r = self.provider.complete(request) => r?,
            };
            let text = response.message.content;
            if !text.is_empty() {
                sink.send(AgentStreamEvent::TextChunk {
                    content: text.clone(),
                })
                .await;
            }
            return Ok(text);
        }

        let source = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            r = self.provider.stream(request) => r?,
        };

        let mut batcher = AdaptiveBatcher::new(source, &self.config.batching, cancel.clone());
        let mut text = String::new();
        while let Some(batch) = batcher.next_batch().await {
            let batch = batch?;
            text.push_str(&batch);
            sink.send(AgentStreamEvent::TextChunk { content: batch }).await;
        }

        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        Ok(text)
    }

    /// Run one code directive and record it.
    ///
    /// Returns an outcome when the execution finalized the session through
    /// the side channel or its own finalize record.
    #[allow(clippy::too_many_arguments)]
    async fn dispatch(
        &mut self,
        directive: CodeDirective,
        executor: Arc<dyn CodeExecutor>,
        model_output: String,
        model_input: Vec<Message>,
        completion_id: &str,
        state: &SessionState,
        sink: &EventSink,
        cancel: &CancellationToken,
    ) -> Result<Option<AgentOutcome>, Error> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let executions = self.memory.executions().clone();
        let record_id = directive
            .id
            .clone()
            .unwrap_or_else(|| executions.next_id());

        let mut action = ActionStep::new(state.consumed);
        action.model_input = Some(model_input);
        action.model_output = Some(model_output);
        action.tool_call = Some(DispatchedCode {
            id: record_id.clone(),
            completion_id: completion_id.to_string(),
            language: directive.language,
            code: directive.code.clone(),
        });

        info!(
            step = state.consumed,
            execution = %record_id,
            language = %directive.language,
            "Dispatching code"
        );
        sink.send(AgentStreamEvent::ToolCall {
            name: "execute_code".into(),
            arguments: serde_json::json!({
                "id": record_id,
                "language": directive.language,
                "code": directive.code,
            }),
            call_id: record_id.clone(),
        })
        .await;

        let request = ExecutionRequest {
            completion_id: completion_id.to_string(),
            code: directive.code.clone(),
            language: directive.language,
        };
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            r = executor.execute(request) => r,
        };

        let record = ExecutionRecord::new(
            &record_id,
            completion_id,
            &directive.code,
            directive.language,
        );
        let mut finalize = None;
        let (record, shown) = match result {
            Ok(output) => {
                if output.success {
                    action.observation = Some(output.output.clone());
                } else {
                    warn!(execution = %record_id, "Code raised an error");
                    action.error = Some(non_empty_error(&output.output));
                }
                action.observation_images = output.images;
                finalize = output.finalize;
                (
                    record.with_output(output.output.clone(), output.success),
                    output.output,
                )
            }
            Err(e) => {
                let message = e.to_string();
                warn!(execution = %record_id, error = %message, "Execution failed");
                action.error = Some(message.clone());
                (record.with_output(message.clone(), false), message)
            }
        };
        action.end_time = Some(Utc::now());

        executions.add(record);
        sink.send(AgentStreamEvent::ToolCallOutput {
            content: shown,
            call_id: record_id,
        })
        .await;
        self.memory.add_step(Step::Action(action));

        // Out-of-band signals left during execution
        let entry = self.memory.side_channel().take(completion_id);
        if let Some(thoughts) = entry.as_ref().and_then(|e| e.thoughts.clone()) {
            sink.send(AgentStreamEvent::Thought { content: thoughts }).await;
        }

        let Some(record) = entry.and_then(|e| e.final_answer).or(finalize) else {
            return Ok(None);
        };

        info!(step = state.consumed, "Execution finalized the session");
        let (rendered, committed) = self.render_answer(FinalAnswer {
            content: record.content,
            commit_ids: record.commit_ids,
        });
        Ok(Some(
            self.finish(
                FinishReason::ExecutionFinalized,
                rendered,
                committed,
                state,
                sink,
            )
            .await,
        ))
    }

    /// Commit the answer's executions and render them after its content.
    fn render_answer(&self, answer: FinalAnswer) -> (String, Vec<ExecutionRecord>) {
        let committed = self.memory.executions().commit(&answer.commit_ids);
        if committed.len() < answer.commit_ids.len() {
            debug!(
                requested = answer.commit_ids.len(),
                found = committed.len(),
                "Final answer referenced unknown executions"
            );
        }

        let mut rendered = answer.content;
        for record in &committed {
            if !rendered.is_empty() {
                rendered.push_str("\n\n");
            }
            rendered.push_str(&record.render());
        }
        (rendered, committed)
    }

    async fn finish(
        &self,
        reason: FinishReason,
        answer: String,
        committed: Vec<ExecutionRecord>,
        state: &SessionState,
        sink: &EventSink,
    ) -> AgentOutcome {
        // Plain text already streamed as chunks
        if reason != FinishReason::PlainText {
            sink.send(AgentStreamEvent::TextChunk {
                content: answer.clone(),
            })
            .await;
        }
        sink.send(AgentStreamEvent::Done {
            answer: answer.clone(),
            reason,
            steps_consumed: state.consumed,
        })
        .await;

        info!(
            reason = ?reason,
            steps = state.consumed,
            completions = state.completions,
            committed = committed.len(),
            "Agent loop finished"
        );

        AgentOutcome {
            answer,
            reason,
            steps_consumed: state.consumed,
            completions: state.completions,
            committed,
        }
    }

    async fn refresh_plan(
        &mut self,
        task: &str,
        consumed: u32,
        sink: &EventSink,
        cancel: &CancellationToken,
    ) -> Result<(), Error> {
        let result = self
            .planner
            .plan(task, &self.capabilities, &self.memory, consumed, cancel)
            .await;

        match result {
            Ok(step) => {
                sink.send(AgentStreamEvent::Planning {
                    facts: step.facts.clone(),
                    plan: step.plan.clone(),
                })
                .await;
                self.memory.add_step(Step::Planning(step));
                Ok(())
            }
            Err(Error::Cancelled) => Err(Error::Cancelled),
            Err(e) => {
                warn!(error = %e, "Planning failed, continuing without a new plan");
                sink.send(AgentStreamEvent::PlanningFailed {
                    message: e.to_string(),
                })
                .await;
                Ok(())
            }
        }
    }
}

fn non_empty_error(output: &str) -> String {
    if output.trim().is_empty() {
        "(the code raised an error without a message)".into()
    } else {
        output.to_string()
    }
}
