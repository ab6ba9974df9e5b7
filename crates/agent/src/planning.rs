//! Planning sub-loop: facts first, then a plan.
//!
//! Two low-temperature side calls outside the main conversation. The first
//! surveys what is known and what is missing; the second turns that into a
//! numbered plan, cut at the end marker. Later rounds see a summary of the
//! session so far and revise the previous plan.
//!
//! Each call is retried up to `planning.max_retries` attempts. The main
//! loop decides what a planning failure means (it reports and moves on).

use chrono::Utc;
use codeloop_config::PlanningConfig;
use codeloop_core::{Error, Message, Provider, ProviderError, ProviderRequest};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::context::{PlanningStep, StepMemory};
use crate::prompts;

pub struct Planner {
    provider: Arc<dyn Provider>,
    model: String,
    config: PlanningConfig,
}

impl Planner {
    pub fn new(
        provider: Arc<dyn Provider>,
        model: impl Into<String>,
        config: PlanningConfig,
    ) -> Self {
        Self {
            provider,
            model: model.into(),
            config,
        }
    }

    pub fn enabled(&self) -> bool {
        self.config.enabled
    }

    /// Whether a plan is due after `consumed` steps.
    ///
    /// Step zero (session start) always plans when enabled.
    pub fn is_due(&self, consumed: u32) -> bool {
        self.config.enabled
            && (consumed == 0 || (self.config.interval > 0 && consumed % self.config.interval == 0))
    }

    /// Run both planning calls and build the planning step.
    pub async fn plan(
        &self,
        task: &str,
        capabilities: &str,
        memory: &StepMemory,
        step_number: u32,
        cancel: &CancellationToken,
    ) -> Result<PlanningStep, Error> {
        let start_time = Utc::now();
        let previous = memory.latest_plan();

        // Later rounds carry a summary of the session so far
        let history = if previous.is_some() {
            memory.to_messages(true)
        } else {
            Vec::new()
        };

        let facts_prompt = match previous {
            Some(p) => prompts::facts_update_request(task, &p.facts),
            None => prompts::facts_request(task, capabilities),
        };
        let mut facts_messages = vec![Message::system(prompts::FACTS_SYSTEM)];
        facts_messages.extend(history.iter().cloned());
        facts_messages.push(Message::user(facts_prompt));

        let facts_output = self.call(facts_messages, Vec::new(), cancel).await?;
        let facts = facts_output.trim().to_string();

        let plan_prompt = prompts::plan_request(
            task,
            capabilities,
            &facts,
            previous.map(|p| p.plan.as_str()),
            &self.config.end_marker,
        );
        let mut plan_messages = vec![Message::system(prompts::PLAN_SYSTEM)];
        plan_messages.extend(history);
        plan_messages.push(Message::user(plan_prompt));

        let plan_output = self
            .call(
                plan_messages.clone(),
                vec![self.config.end_marker.clone()],
                cancel,
            )
            .await?;
        let plan = truncate_at(&plan_output, &self.config.end_marker)
            .trim()
            .to_string();

        debug!(step = step_number, plan_lines = plan.lines().count(), "Plan updated");

        Ok(PlanningStep {
            step_number,
            facts,
            plan,
            model_input: plan_messages,
            model_output_facts: facts_output,
            model_output_plan: plan_output,
            start_time,
            end_time: Utc::now(),
        })
    }

    async fn call(
        &self,
        messages: Vec<Message>,
        stop: Vec<String>,
        cancel: &CancellationToken,
    ) -> Result<String, Error> {
        let attempts = self.config.max_retries.max(1);
        let wait = Duration::from_millis(self.config.retry_wait_ms);
        let mut last_error: Option<ProviderError> = None;

        for attempt in 1..=attempts {
            let request = ProviderRequest {
                model: self.model.clone(),
                messages: messages.clone(),
                temperature: self.config.temperature,
                max_tokens: Some(self.config.max_tokens),
                stream: false,
                stop: stop.clone(),
            };

            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                r = self.provider.complete(request) => r,
            };

            match result {
                Ok(response) => return Ok(response.message.content),
                Err(e) => {
                    warn!(attempt, attempts, error = %e, "Planning call failed");
                    last_error = Some(e);
                    if attempt < attempts && !wait.is_zero() {
                        tokio::select! {
                            biased;
                            _ = cancel.cancelled() => return Err(Error::Cancelled),
                            _ = tokio::time::sleep(wait) => {}
                        }
                    }
                }
            }
        }

        Err(last_error
            .map(Error::from)
            .unwrap_or_else(|| Error::Internal("planning made no attempts".into())))
    }
}

fn truncate_at<'a>(text: &'a str, marker: &str) -> &'a str {
    if marker.is_empty() {
        return text;
    }
    text.split(marker).next().unwrap_or(text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Step;
    use crate::test_helpers::{ScriptedProvider, Turn};

    fn config() -> PlanningConfig {
        PlanningConfig {
            enabled: true,
            interval: 2,
            ..PlanningConfig::default()
        }
    }

    #[test]
    fn cadence() {
        let provider = Arc::new(ScriptedProvider::new(vec![]));
        let planner = Planner::new(provider.clone(), "mock", config());
        assert!(planner.is_due(0));
        assert!(!planner.is_due(1));
        assert!(planner.is_due(2));
        assert!(planner.is_due(4));

        let disabled = Planner::new(provider, "mock", PlanningConfig::default());
        assert!(!disabled.is_due(0));
    }

    #[test]
    fn truncation_at_marker() {
        assert_eq!(truncate_at("1. a\n2. b\n<end_plan>\nextra", "<end_plan>"), "1. a\n2. b\n");
        assert_eq!(truncate_at("1. a", "<end_plan>"), "1. a");
    }

    #[tokio::test]
    async fn first_plan_makes_two_calls() {
        let provider = Arc::new(ScriptedProvider::new(vec![
            Turn::text("- 2 and 2 are given"),
            Turn::text("1. Add the numbers\n2. Report\n<end_plan>\nignored"),
        ]));
        let planner = Planner::new(provider.clone(), "mock", config());

        let step = planner
            .plan("Calculate 2+2", "python", &StepMemory::new(), 0, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(provider.call_count(), 2);
        assert_eq!(step.facts, "- 2 and 2 are given");
        assert_eq!(step.plan, "1. Add the numbers\n2. Report");
        assert!(step.model_output_plan.contains("ignored"));

        let requests = provider.requests();
        assert!(requests[0].stop.is_empty());
        assert_eq!(requests[1].stop, vec!["<end_plan>"]);
        assert!(requests[1].messages.last().unwrap().content.contains("- 2 and 2 are given"));
        assert!(!requests[1].stream);
    }

    #[tokio::test]
    async fn revision_sees_history_and_previous_plan() {
        let provider = Arc::new(ScriptedProvider::new(vec![
            Turn::text("updated facts"),
            Turn::text("1. finish<end_plan>"),
        ]));
        let planner = Planner::new(provider.clone(), "mock", config());

        let mut memory = StepMemory::new();
        memory.add_step(Step::task("Calculate 2+2", vec![]));
        memory.add_step(Step::Planning(PlanningStep {
            step_number: 0,
            facts: "old facts".into(),
            plan: "1. start".into(),
            model_input: vec![],
            model_output_facts: String::new(),
            model_output_plan: String::new(),
            start_time: Utc::now(),
            end_time: Utc::now(),
        }));

        let step = planner
            .plan("Calculate 2+2", "", &memory, 2, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(step.plan, "1. finish");

        let requests = provider.requests();
        let facts_msgs = &requests[0].messages;
        assert!(facts_msgs.iter().any(|m| m.content == "Calculate 2+2"));
        assert!(facts_msgs.last().unwrap().content.contains("old facts"));
        assert!(requests[1].messages.last().unwrap().content.contains("Previous plan:\n1. start"));
    }

    #[tokio::test(start_paused = true)]
    async fn retries_then_succeeds() {
        let provider = Arc::new(ScriptedProvider::new(vec![
            Turn::fail(ProviderError::Timeout("slow".into())),
            Turn::text("facts"),
            Turn::text("1. go<end_plan>"),
        ]));
        let planner = Planner::new(
            provider.clone(),
            "mock",
            PlanningConfig {
                max_retries: 2,
                retry_wait_ms: 500,
                ..config()
            },
        );

        let step = planner
            .plan("t", "", &StepMemory::new(), 0, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(step.facts, "facts");
        assert_eq!(provider.call_count(), 3);
    }

    #[tokio::test]
    async fn failure_surfaces_after_attempts() {
        let provider = Arc::new(ScriptedProvider::new(vec![Turn::fail(
            ProviderError::AuthenticationFailed("bad key".into()),
        )]));
        let planner = Planner::new(provider, "mock", config());

        let err = planner
            .plan("t", "", &StepMemory::new(), 0, &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), codeloop_core::ErrorKind::Authentication);
    }

    #[tokio::test]
    async fn cancellation_stops_planning() {
        let provider = Arc::new(ScriptedProvider::new(vec![Turn::text("facts")]));
        let planner = Planner::new(provider.clone(), "mock", config());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = planner
            .plan("t", "", &StepMemory::new(), 0, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled));
    }
}
