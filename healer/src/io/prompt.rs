//! Prompt builder for model calls.
//!
//! Templates are embedded at compile time and rendered with minijinja. Each
//! rendered user prompt is split on `<!-- section:KEY required|droppable -->`
//! markers so it can be fitted to a byte budget by dropping the least critical
//! sections first.

use std::sync::LazyLock;

use minijinja::{Environment, context};
use regex::Regex;
use serde::Serialize;
use tracing::debug;

use crate::core::types::{
    CodeArtifact, Diagnosis, IterationRecord, Language, Task, one_line, truncate_chars,
};
use crate::io::model::{Prompt, Role};

const SYSTEM_GENERATOR: &str = include_str!("prompts/system_generator.md");
const SYSTEM_ADVERSARY: &str = include_str!("prompts/system_adversary.md");
const SYSTEM_DEBUGGER: &str = include_str!("prompts/system_debugger.md");
const SYSTEM_SUMMARIZER: &str = include_str!("prompts/system_summarizer.md");

const TEMPLATES: [(&str, &str); 5] = [
    ("generate_initial", include_str!("prompts/generate_initial.md")),
    ("generate_repair", include_str!("prompts/generate_repair.md")),
    ("adversarial", include_str!("prompts/adversarial.md")),
    ("diagnose", include_str!("prompts/diagnose.md")),
    ("summarize", include_str!("prompts/summarize.md")),
];

/// Earlier iterations shown to the debugger.
pub const DIAGNOSE_HISTORY_ENTRIES: usize = 3;

/// Drop order when a prompt exceeds its budget.
const DROP_ORDER: [&str; 3] = ["history", "lessons", "output"];

const TRUNCATION_NOTICE: &str = "\n[truncated]";

/// Diagnosis fields exposed to the repair template.
#[derive(Debug, Serialize)]
struct DiagnosisContext<'a> {
    failure_category: &'a str,
    root_cause: &'a str,
    repair_strategy: &'a str,
}

impl<'a> DiagnosisContext<'a> {
    fn from_diagnosis(diagnosis: &'a Diagnosis) -> Self {
        Self {
            failure_category: diagnosis.failure_category.as_str(),
            root_cause: diagnosis.root_cause.trim(),
            repair_strategy: diagnosis.repair_strategy.trim(),
        }
    }
}

/// Renders role prompts within a byte budget.
pub struct PromptEngine {
    env: Environment<'static>,
    budget_bytes: usize,
}

impl PromptEngine {
    pub fn new(budget_bytes: usize) -> Self {
        let mut env = Environment::new();
        for (name, source) in TEMPLATES {
            env.add_template(name, source)
                .expect("embedded prompt template should be valid");
        }
        Self { env, budget_bytes }
    }

    pub fn system(role: Role) -> &'static str {
        match role {
            Role::Generator => SYSTEM_GENERATOR,
            Role::Adversary => SYSTEM_ADVERSARY,
            Role::Debugger => SYSTEM_DEBUGGER,
            Role::Summarizer => SYSTEM_SUMMARIZER,
        }
    }

    /// First attempt at a task.
    pub fn generate_initial(&self, task: &Task, language: Language, lessons: &[String]) -> Prompt {
        let user = self.render(
            "generate_initial",
            context! {
                language => language.as_str(),
                task => task.description.trim(),
                lessons => lessons,
            },
        );
        self.prompt(Role::Generator, user)
    }

    /// Repair of `previous` guided by `diagnosis` and the failing output.
    pub fn generate_repair(
        &self,
        task: &Task,
        language: Language,
        previous: &CodeArtifact,
        diagnosis: &Diagnosis,
        failure: &str,
        lessons: &[String],
    ) -> Prompt {
        let user = self.render(
            "generate_repair",
            context! {
                language => language.as_str(),
                task => task.description.trim(),
                lessons => lessons,
                diagnosis => DiagnosisContext::from_diagnosis(diagnosis),
                failure => non_empty(failure),
                code => previous.code.trim_end(),
            },
        );
        self.prompt(Role::Generator, user)
    }

    pub fn adversarial(
        &self,
        task: &Task,
        language: Language,
        artifact: &CodeArtifact,
        lessons: &[String],
    ) -> Prompt {
        let user = self.render(
            "adversarial",
            context! {
                language => language.as_str(),
                task => task.description.trim(),
                lessons => lessons,
                code => artifact.code.trim_end(),
            },
        );
        self.prompt(Role::Adversary, user)
    }

    /// Diagnosis request. Only the last [`DIAGNOSE_HISTORY_ENTRIES`] of
    /// `history` are shown.
    pub fn diagnose(
        &self,
        task: &Task,
        language: Language,
        artifact: &CodeArtifact,
        failure: &str,
        history: &[IterationRecord],
    ) -> Prompt {
        let skip = history.len().saturating_sub(DIAGNOSE_HISTORY_ENTRIES);
        let history: Vec<String> = history[skip..].iter().map(history_line).collect();
        let user = self.render(
            "diagnose",
            context! {
                language => language.as_str(),
                task => task.description.trim(),
                history => history,
                failure => failure.trim(),
                code => artifact.code.trim_end(),
            },
        );
        self.prompt(Role::Debugger, user)
    }

    pub fn summarize(&self, entries: &[String]) -> Prompt {
        let user = self.render("summarize", context! { entries => entries });
        self.prompt(Role::Summarizer, user)
    }

    fn render(&self, name: &str, ctx: minijinja::Value) -> String {
        let template = self
            .env
            .get_template(name)
            .expect("embedded prompt template should exist");
        let rendered = template
            .render(ctx)
            .expect("prompt template rendering should not fail");
        let mut sections = parse_sections(&rendered);
        apply_budget_to_sections(&mut sections, self.budget_bytes);
        render_sections(&sections)
    }

    fn prompt(&self, role: Role, user: String) -> Prompt {
        Prompt::new(role, Self::system(role).trim().to_string(), user)
    }
}

fn non_empty(text: &str) -> Option<&str> {
    Some(text.trim()).filter(|s| !s.is_empty())
}

fn history_line(record: &IterationRecord) -> String {
    let outcome = record
        .outcome
        .as_ref()
        .map_or_else(|| "not executed".to_string(), |o| o.tag.to_string());
    let category = record
        .failure_category
        .map_or("none", |c| c.as_str());
    let cause = record
        .diagnosis
        .as_ref()
        .map(|d| d.root_cause.as_str())
        .or(record.step_error.as_deref())
        .unwrap_or("");
    truncate_chars(
        &format!(
            "Iteration {}: outcome={outcome} | category={category} | cause={}",
            record.number,
            one_line(cause)
        ),
        240,
    )
}

/// A parsed section from rendered template output.
#[derive(Debug, Clone)]
struct ParsedSection {
    /// Section identifier (e.g., "contract", "task").
    key: String,
    /// Whether this section is required (cannot be dropped).
    required: bool,
    /// Section content after the marker.
    content: String,
}

/// Parse sections from rendered template output using HTML comment markers.
///
/// Markers follow format: `<!-- section:KEY required|droppable -->`
fn parse_sections(rendered: &str) -> Vec<ParsedSection> {
    static SECTION_RE: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r"<!--\s*section:(\w+)\s+(required|droppable)\s*-->")
            .expect("section marker regex should compile")
    });

    let markers: Vec<(usize, usize, String, bool)> = SECTION_RE
        .captures_iter(rendered)
        .filter_map(|caps| {
            let whole = caps.get(0)?;
            let key = caps.get(1)?.as_str().to_string();
            let required = caps.get(2)?.as_str() == "required";
            Some((whole.start(), whole.end(), key, required))
        })
        .collect();

    let mut sections = Vec::new();
    for (i, (_, start, key, required)) in markers.iter().enumerate() {
        let end = markers
            .get(i + 1)
            .map_or(rendered.len(), |(next_start, ..)| *next_start);
        let content = rendered[*start..end].trim().to_string();
        if !content.is_empty() || *required {
            sections.push(ParsedSection {
                key: key.clone(),
                required: *required,
                content,
            });
        }
    }

    sections
}

/// Apply budget to parsed sections, dropping droppable sections as needed.
///
/// Drop order: history -> lessons -> output. If still over budget the last
/// section is truncated with a notice.
fn apply_budget_to_sections(sections: &mut Vec<ParsedSection>, budget: usize) {
    let total_len =
        |secs: &[ParsedSection]| -> usize { secs.iter().map(|s| s.content.len()).sum() };

    if total_len(sections) <= budget {
        return;
    }

    for key in DROP_ORDER {
        if total_len(sections) <= budget {
            break;
        }
        if let Some(idx) = sections.iter().position(|s| s.key == key && !s.required) {
            debug!(
                section = key,
                bytes_dropped = sections[idx].content.len(),
                "dropped section for budget"
            );
            sections.remove(idx);
        }
    }

    let other_len: usize = sections
        .iter()
        .rev()
        .skip(1)
        .map(|s| s.content.len())
        .sum();
    if let Some(last) = sections.last_mut()
        && other_len + last.content.len() > budget
    {
        let allowed = budget.saturating_sub(other_len);
        let before_len = last.content.len();
        if allowed > TRUNCATION_NOTICE.len() {
            truncate_at_boundary(&mut last.content, allowed - TRUNCATION_NOTICE.len());
            last.content.push_str(TRUNCATION_NOTICE);
        } else {
            truncate_at_boundary(&mut last.content, allowed);
        }
        debug!(
            section = last.key,
            before_len,
            after_len = last.content.len(),
            "truncated section for budget"
        );
    }
}

/// Truncate to at most `max` bytes without splitting a UTF-8 character.
fn truncate_at_boundary(text: &mut String, max: usize) {
    if text.len() <= max {
        return;
    }
    let mut cut = max;
    while !text.is_char_boundary(cut) {
        cut -= 1;
    }
    text.truncate(cut);
}

/// Render sections back to a single string.
fn render_sections(sections: &[ParsedSection]) -> String {
    sections
        .iter()
        .map(|s| s.content.as_str())
        .collect::<Vec<_>>()
        .join("\n\n")
}
