//! Directive extraction from free-form model output.
//!
//! The model communicates intent through tags embedded in its text:
//!
//! | Form | Result |
//! |------|--------|
//! | `<py-script id="..">code</py-script>` | Python code |
//! | `<ts-script>code</ts-script>` | TypeScript code |
//! | `<js-script>code</js-script>` | JavaScript code |
//! | `<script lang="..">code</script>` | code in `lang`, or the fallback language |
//! | `<final-answer commit="a, b">text</final-answer>` | final answer (`final_answer` also accepted) |
//!
//! Tag names are case-insensitive and tolerate inner whitespace. A missing
//! closing tag extends the block to the end of the text, since a stream can
//! stop mid-tag. Fenced markdown blocks in a known language are rewritten to
//! the native tag first, but only when the text carries no native tag.
//!
//! When a response holds both a code block and a final answer, the code
//! block wins. Only top-level tags count: a tag name written inside a
//! final-answer body is part of the answer.

use codeloop_core::Language;
use regex::{Captures, Regex};
use std::borrow::Cow;
use std::collections::HashMap;
use std::ops::Range;
use std::sync::LazyLock;

/// Opening code tag: name in group 1, raw attributes in group 2.
static CODE_OPEN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)<\s*(py-script|ts-script|js-script|script)(\s[^>]*)?>").unwrap()
});

static FINAL_OPEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)<\s*(final[-_]answer)(\s[^>]*)?>").unwrap());

static CLOSE_TAG: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)<\s*/\s*(py-script|ts-script|js-script|script|final[-_]answer)\s*>").unwrap()
});

static ATTRIBUTE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"([A-Za-z_][\w-]*)\s*=\s*(?:"([^"]*)"|'([^']*)'|([^\s"'>]+))"#).unwrap()
});

/// A fenced block in a recognized language; an unterminated fence runs to the end.
static FENCED_BLOCK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)```[ \t]*(python|py|typescript|ts|javascript|js)[ \t]*\r?\n(.*?)(?:```|\z)")
        .unwrap()
});

/// What a model response asks the loop to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Extraction {
    /// Run this code and observe the result.
    Code(CodeDirective),
    /// Finish with this answer.
    FinalAnswer(FinalAnswer),
    /// No usable directive (absent, or tags with nothing inside).
    NoDirective,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodeDirective {
    pub language: Language,
    pub code: String,
    /// Caller-chosen execution record id (`id` attribute)
    pub id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinalAnswer {
    pub content: String,
    /// Execution record ids to surface with the answer
    pub commit_ids: Vec<String>,
}

/// Extract the single directive a response carries.
pub fn extract(text: &str, fallback: Language) -> Extraction {
    let text = normalize_fences(text);

    if let Some(code) = code_directive(&text, fallback) {
        return Extraction::Code(code);
    }
    if let Some(answer) = final_answer(&text) {
        return Extraction::FinalAnswer(answer);
    }
    Extraction::NoDirective
}

/// Rewrite fenced code blocks into native tags.
///
/// Text that already carries a native tag is returned untouched so fenced
/// examples inside a directive survive verbatim.
pub fn normalize_fences(text: &str) -> Cow<'_, str> {
    if CODE_OPEN.is_match(text) || FINAL_OPEN.is_match(text) {
        return Cow::Borrowed(text);
    }

    FENCED_BLOCK.replace_all(text, |caps: &Captures| {
        let language = Language::from_name(&caps[1]).unwrap_or_default();
        format!(
            "<{tag}>\n{code}\n</{tag}>",
            tag = language.tag(),
            code = caps[2].trim_end()
        )
    })
}

fn code_directive(text: &str, fallback: Language) -> Option<CodeDirective> {
    let answer_span = final_answer_span(text);

    CODE_OPEN.captures_iter(text).find_map(|caps| {
        let open = caps.get(0)?;
        if answer_span
            .as_ref()
            .is_some_and(|span| span.contains(&open.start()))
        {
            return None;
        }
        let name = caps[1].to_ascii_lowercase();
        let attrs = attributes(caps.get(2).map_or("", |m| m.as_str()));

        let code = block_body(text, open.end(), &name).trim();
        if code.is_empty() {
            return None;
        }

        let language = match name.as_str() {
            "py-script" => Language::Python,
            "ts-script" => Language::TypeScript,
            "js-script" => Language::JavaScript,
            _ => attrs
                .get("lang")
                .or_else(|| attrs.get("language"))
                .and_then(|l| Language::from_name(l))
                .unwrap_or(fallback),
        };

        Some(CodeDirective {
            language,
            code: code.to_string(),
            id: attrs
                .get("id")
                .map(|id| id.trim().to_string())
                .filter(|id| !id.is_empty()),
        })
    })
}

fn final_answer(text: &str) -> Option<FinalAnswer> {
    let caps = FINAL_OPEN.captures(text)?;
    let open = caps.get(0)?;
    let attrs = attributes(caps.get(2).map_or("", |m| m.as_str()));

    let content = block_body(text, open.end(), &caps[1]).trim().to_string();
    let commit_ids: Vec<String> = attrs
        .get("commit")
        .map(|raw| {
            raw.split(',')
                .map(str::trim)
                .filter(|id| !id.is_empty())
                .map(String::from)
                .collect()
        })
        .unwrap_or_default();

    if content.is_empty() && commit_ids.is_empty() {
        return None;
    }

    Some(FinalAnswer {
        content,
        commit_ids,
    })
}

/// Byte range from the first final-answer open tag to the end of its body.
fn final_answer_span(text: &str) -> Option<Range<usize>> {
    let caps = FINAL_OPEN.captures(text)?;
    let open = caps.get(0)?;
    let body = block_body(text, open.end(), &caps[1]);
    Some(open.start()..open.end() + body.len())
}

/// Text between an opening tag and its matching close (or the end of text).
fn block_body<'a>(text: &'a str, from: usize, name: &str) -> &'a str {
    let rest = &text[from..];
    let end = CLOSE_TAG
        .captures_iter(rest)
        .find(|caps| same_tag(&caps[1], name))
        .and_then(|caps| caps.get(0))
        .map_or(rest.len(), |m| m.start());
    &rest[..end]
}

fn same_tag(a: &str, b: &str) -> bool {
    let canon = |s: &str| s.to_ascii_lowercase().replace('_', "-");
    canon(a) == canon(b)
}

fn attributes(raw: &str) -> HashMap<String, String> {
    ATTRIBUTE
        .captures_iter(raw)
        .map(|caps| {
            let value = caps
                .get(2)
                .or_else(|| caps.get(3))
                .or_else(|| caps.get(4))
                .map_or("", |m| m.as_str());
            (caps[1].to_ascii_lowercase(), value.to_string())
        })
        .collect()
}
