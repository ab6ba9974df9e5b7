//! Prompt text: the directive protocol, example exchanges, corrective notes,
//! forced-finalization diagnostics, and the planning conversation.

use codeloop_core::{Language, Message};

/// Sent when a response carries no usable directive.
pub const GUIDANCE_NOTE: &str = "Your last reply contained no usable directive. Reply with exactly one code block in a script tag, or a <final-answer> tag if you are done.";

/// Sent once the step budget is nearly spent.
pub const FINALIZE_REMINDER: &str = "You are close to the step limit. Wrap up now and reply with a <final-answer> tag.";

pub const MAX_STEPS_MESSAGE: &str = "I reached the maximum number of steps before finishing this task. The work so far is above; try again with a narrower request or a larger step budget.";

pub const STUCK_LOOP_MESSAGE: &str = "I stopped because the model kept producing the same (or empty) output and was not making progress.";

pub const FORMAT_TROUBLE_MESSAGE: &str = "I had trouble following the response format required to run code, so I stopped. Please rephrase the request or try a different model.";

/// The full system prompt.
///
/// Without an execution language only the base instructions are used: a
/// session without an executor takes the model's first reply as the answer.
pub fn system_prompt(instructions: &str, language: Option<Language>) -> String {
    let Some(language) = language else {
        return instructions.to_string();
    };

    let tag = language.tag();
    format!(
        "{instructions}\n\n\
        ## How to work\n\
        Solve the task in steps. In each reply, think briefly, then either run code or give the final answer.\n\n\
        To run {language} code, put it in a single tag:\n\
        <{tag} id=\"short-name\">\n\
        ...code...\n\
        </{tag}>\n\
        The `id` is optional and names the execution so you can show it later. \
        After each run you receive its output inside <observation> tags.\n\n\
        When you are done, reply with:\n\
        <final-answer commit=\"short-name\">\n\
        your answer\n\
        </final-answer>\n\
        `commit` is optional: list execution ids (comma-separated) whose code and output the user should see.\n\n\
        Rules:\n\
        - One code block per reply; wait for its observation before continuing.\n\
        - Print the values you need; only printed output is observed.\n\
        - Never invent observations.\n\
        - If code fails, read the error, fix it, and try again."
    )
}

/// Append the current plan to a system prompt.
pub fn with_plan(system: &str, plan: &str) -> String {
    format!("{system}\n\n## Current plan\n{plan}")
}

/// Illustrative exchange teaching the protocol in `language`.
pub fn example_exchanges(language: Language) -> Vec<Message> {
    let (tag, code) = match language {
        Language::Python => ("py-script", "values = [3, 1, 4, 1, 5]\nprint(sum(values) / len(values))"),
        Language::TypeScript => (
            "ts-script",
            "const values: number[] = [3, 1, 4, 1, 5];\nconsole.log(values.reduce((a, b) => a + b, 0) / values.length);",
        ),
        Language::JavaScript => (
            "js-script",
            "const values = [3, 1, 4, 1, 5];\nconsole.log(values.reduce((a, b) => a + b, 0) / values.length);",
        ),
    };

    vec![
        Message::user("What is the mean of 3, 1, 4, 1 and 5?"),
        Message::assistant(format!(
            "I'll compute it.\n<{tag} id=\"mean\">\n{code}\n</{tag}>"
        )),
        Message::user("<observation>\n2.8\n</observation>"),
        Message::assistant("<final-answer commit=\"mean\">\nThe mean is 2.8.\n</final-answer>"),
    ]
}

// ── Planning ──────────────────────────────────────────────────────────────

pub const FACTS_SYSTEM: &str = "You are an expert at surveying a task before work starts. List what is given, what must be looked up or computed, and what can be derived. Be concise and use bullet points.";

pub const PLAN_SYSTEM: &str = "You are an expert planner. Write a short, numbered, high-level plan that solves the task using the available capabilities. Do not solve the task yourself.";

fn capability_block(capabilities: &str) -> String {
    if capabilities.trim().is_empty() {
        "No external capabilities are listed.".into()
    } else {
        format!("Available capabilities:\n{capabilities}")
    }
}

/// First planning call: survey the facts.
pub fn facts_request(task: &str, capabilities: &str) -> String {
    format!(
        "Task:\n{task}\n\n\
        {}\n\n\
        List the facts: 1. given in the task, 2. to look up, 3. to derive.",
        capability_block(capabilities)
    )
}

/// Follow-up planning call: update the facts from the progress so far.
pub fn facts_update_request(task: &str, previous_facts: &str) -> String {
    format!(
        "Task:\n{task}\n\n\
        Facts so far:\n{previous_facts}\n\n\
        Given the progress above, update the facts: what has been learned, what is still missing."
    )
}

/// Plan call, first or revised.
pub fn plan_request(
    task: &str,
    capabilities: &str,
    facts: &str,
    previous_plan: Option<&str>,
    end_marker: &str,
) -> String {
    let revision = match previous_plan {
        Some(plan) => format!(
            "Previous plan:\n{plan}\n\nRevise the plan for the remaining work only.\n\n"
        ),
        None => String::new(),
    };

    format!(
        "Task:\n{task}\n\n\
        {}\n\n\
        Facts:\n{facts}\n\n\
        {revision}\
        Respond with one numbered step per line. After the last step, write {end_marker}",
        capability_block(capabilities)
    )
}
