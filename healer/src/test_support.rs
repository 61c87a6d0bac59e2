//! Test-only helpers: a scripted model plus builders for tasks, artifacts,
//! outcomes and model payloads.

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};

use serde_json::json;

use crate::core::types::{CodeArtifact, ExecutionOutcome, Language, OutcomeTag, Task};
use crate::io::model::{Model, ModelError, Prompt, Role};

/// One captured model call.
#[derive(Debug, Clone)]
pub struct ModelCall {
    pub role: Role,
    pub prompt: Prompt,
}

/// Model that replays queued responses per role and records every call.
///
/// An empty queue answers with `ModelError::Unavailable`.
#[derive(Debug, Default)]
pub struct ScriptedModel {
    queues: RefCell<HashMap<Role, VecDeque<Result<String, ModelError>>>>,
    calls: RefCell<Vec<ModelCall>>,
}

impl ScriptedModel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond(self, role: Role, text: impl Into<String>) -> Self {
        self.push_response(role, text);
        self
    }

    pub fn fail(self, role: Role, err: ModelError) -> Self {
        self.push_error(role, err);
        self
    }

    pub fn push_response(&self, role: Role, text: impl Into<String>) {
        self.queues
            .borrow_mut()
            .entry(role)
            .or_default()
            .push_back(Ok(text.into()));
    }

    pub fn push_error(&self, role: Role, err: ModelError) {
        self.queues
            .borrow_mut()
            .entry(role)
            .or_default()
            .push_back(Err(err));
    }

    pub fn calls(&self) -> Vec<ModelCall> {
        self.calls.borrow().clone()
    }

    pub fn calls_for(&self, role: Role) -> Vec<ModelCall> {
        self.calls
            .borrow()
            .iter()
            .filter(|call| call.role == role)
            .cloned()
            .collect()
    }

    /// Responses still queued for `role`.
    pub fn remaining(&self, role: Role) -> usize {
        self.queues.borrow().get(&role).map_or(0, VecDeque::len)
    }
}

impl Model for ScriptedModel {
    fn complete(&self, role: Role, prompt: &Prompt) -> Result<String, ModelError> {
        self.calls.borrow_mut().push(ModelCall {
            role,
            prompt: prompt.clone(),
        });
        self.queues
            .borrow_mut()
            .get_mut(&role)
            .and_then(VecDeque::pop_front)
            .unwrap_or_else(|| Err(ModelError::Unavailable(format!("no scripted {role} response"))))
    }
}

/// Python task with no oracle cases.
pub fn task(id: &str, description: &str) -> Task {
    Task {
        id: id.to_string(),
        description: description.to_string(),
        language: Language::Python,
        oracle: Vec::new(),
    }
}

/// Shell task with no oracle cases.
pub fn shell_task(id: &str, description: &str) -> Task {
    Task {
        language: Language::Shell,
        ..task(id, description)
    }
}

pub fn artifact(code: &str) -> CodeArtifact {
    CodeArtifact {
        code: code.to_string(),
        explanation: None,
        repaired_from: None,
        lessons_seen: Vec::new(),
    }
}

/// Outcome with `tag` and no per-case results.
pub fn outcome(tag: OutcomeTag) -> ExecutionOutcome {
    ExecutionOutcome {
        tag,
        exit_code: if tag == OutcomeTag::Timeout { None } else { Some(1) },
        stdout: String::new(),
        stderr: String::new(),
        results: Vec::new(),
        duration_ms: 1,
    }
}

pub fn generation_json(code: &str) -> String {
    json!({ "code": code, "explanation": "scripted" }).to_string()
}

pub fn tests_json(cases: &[(&str, &str)]) -> String {
    let tests: Vec<_> = cases
        .iter()
        .map(|(input, expected)| json!({ "input": input, "expected": expected }))
        .collect();
    json!({ "tests": tests }).to_string()
}

pub fn diagnosis_json(category: &str, root_cause: &str, repair_strategy: &str) -> String {
    json!({
        "root_cause": root_cause,
        "failure_category": category,
        "repair_strategy": repair_strategy,
        "confidence": 0.8
    })
    .to_string()
}

pub fn summary_json(lessons: &[&str]) -> String {
    json!({ "lessons": lessons }).to_string()
}
