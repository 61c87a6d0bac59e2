//! Model backends.
//!
//! The [`Model`] trait decouples the repair steps from the actual language model
//! backend. [`CommandModel`] shells out to a configured command; [`FixtureModel`]
//! returns canned payloads for offline runs. Tests use scripted models that
//! return predetermined responses without spawning processes.

use std::collections::HashMap;
use std::fmt;
use std::process::Command;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::core::types::Language;
use crate::io::config::ModelConfig;
use crate::io::process::run_command_with_timeout;

pub const DEFAULT_TEMPERATURE: f32 = 0.2;

/// The step a model call serves. Selects system prompt, token cap and fixture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Generator,
    Adversary,
    Debugger,
    Summarizer,
}

impl Role {
    pub const ALL: [Role; 4] = [
        Role::Generator,
        Role::Adversary,
        Role::Debugger,
        Role::Summarizer,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Role::Generator => "generator",
            Role::Adversary => "adversary",
            Role::Debugger => "debugger",
            Role::Summarizer => "summarizer",
        }
    }

    pub fn max_tokens(self) -> u32 {
        match self {
            Role::Generator => 2048,
            Role::Adversary | Role::Debugger => 768,
            Role::Summarizer => 256,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A rendered request for one model call.
#[derive(Debug, Clone, PartialEq)]
pub struct Prompt {
    pub system: String,
    pub user: String,
    pub max_tokens: u32,
    pub temperature: f32,
}

impl Prompt {
    pub fn new(role: Role, system: String, user: String) -> Self {
        Self {
            system,
            user,
            max_tokens: role.max_tokens(),
            temperature: DEFAULT_TEMPERATURE,
        }
    }

    /// System and user text as one document, the form written to command stdin.
    pub fn combined(&self) -> String {
        format!("{}\n\n{}\n", self.system.trim_end(), self.user.trim_end())
    }
}

/// Transport-level failure of a model call. All variants are retryable.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ModelError {
    #[error("model unavailable: {0}")]
    Unavailable(String),
    #[error("model provider error: {0}")]
    Provider(String),
    #[error("model timed out after {0:?}")]
    Timeout(Duration),
}

/// Abstraction over model backends.
pub trait Model {
    /// Return the raw completion text for `prompt`.
    fn complete(&self, role: Role, prompt: &Prompt) -> Result<String, ModelError>;
}

impl<M: Model + ?Sized> Model for &M {
    fn complete(&self, role: Role, prompt: &Prompt) -> Result<String, ModelError> {
        (**self).complete(role, prompt)
    }
}

impl<M: Model + ?Sized> Model for Box<M> {
    fn complete(&self, role: Role, prompt: &Prompt) -> Result<String, ModelError> {
        (**self).complete(role, prompt)
    }
}

/// Model that spawns a command, writes the prompt on stdin and reads the
/// completion from stdout.
///
/// The child sees `HEALER_ROLE`, `HEALER_MAX_TOKENS` and `HEALER_TEMPERATURE`.
#[derive(Debug, Clone)]
pub struct CommandModel {
    config: ModelConfig,
    poll_interval: Duration,
    cancel: Option<CancellationToken>,
}

impl CommandModel {
    pub fn new(config: ModelConfig) -> Self {
        Self {
            config,
            poll_interval: Duration::from_millis(25),
            cancel: None,
        }
    }

    /// Kill an in-flight call when `token` is cancelled.
    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }
}

impl Model for CommandModel {
    #[instrument(skip_all, fields(role = %role, max_tokens = prompt.max_tokens))]
    fn complete(&self, role: Role, prompt: &Prompt) -> Result<String, ModelError> {
        let Some((program, args)) = self.config.command.split_first() else {
            return Err(ModelError::Unavailable("no model command configured".to_string()));
        };
        let mut cmd = Command::new(program);
        cmd.args(args)
            .env("HEALER_ROLE", role.as_str())
            .env("HEALER_MAX_TOKENS", prompt.max_tokens.to_string())
            .env("HEALER_TEMPERATURE", prompt.temperature.to_string());

        let limits = self.config.limits(self.poll_interval);
        let output = run_command_with_timeout(
            cmd,
            Some(prompt.combined().into_bytes()),
            limits,
            self.cancel.as_ref(),
        )
        .map_err(|e| ModelError::Unavailable(format!("{program}: {e:#}")))?;

        if output.timed_out {
            warn!(timeout_secs = self.config.timeout_secs, "model command timed out");
            return Err(ModelError::Timeout(limits.timeout));
        }
        if output.cancelled {
            return Err(ModelError::Provider("interrupted by cancellation".to_string()));
        }
        if !output.status.success() {
            let stderr = output.stderr_lossy();
            warn!(exit_code = ?output.status.code(), "model command failed");
            return Err(ModelError::Provider(format!(
                "exit status {:?}: {}",
                output.status.code(),
                stderr.trim()
            )));
        }

        let text = output.stdout_lossy();
        if text.trim().is_empty() {
            return Err(ModelError::Provider("empty response".to_string()));
        }
        debug!(bytes = text.len(), "model command completed");
        Ok(text)
    }
}

/// Deterministic stand-in that returns one valid payload per role.
#[derive(Debug, Clone)]
pub struct FixtureModel {
    fixtures: HashMap<Role, String>,
}

impl FixtureModel {
    /// Defaults that solve "sort the input" in `language`.
    pub fn new(language: Language) -> Self {
        let fixtures = Role::ALL
            .into_iter()
            .map(|role| (role, default_fixture(role, language).to_string()))
            .collect();
        Self { fixtures }
    }

    pub fn with_fixture(mut self, role: Role, payload: &Value) -> Self {
        self.fixtures.insert(role, payload.to_string());
        self
    }
}

impl Model for FixtureModel {
    fn complete(&self, role: Role, _prompt: &Prompt) -> Result<String, ModelError> {
        self.fixtures
            .get(&role)
            .cloned()
            .ok_or_else(|| ModelError::Unavailable(format!("no fixture for {role}")))
    }
}

fn default_fixture(role: Role, language: Language) -> Value {
    match (role, language) {
        (Role::Generator, Language::Python) => json!({
            "code": "def solve(data):\n    if not data:\n        return []\n    return sorted(data)\n",
            "explanation": "Return the input sorted; empty input yields an empty list."
        }),
        (Role::Generator, Language::Shell) => json!({
            "code": "solve() {\n    for x in \"$@\"; do echo \"$x\"; done | sort -n | tr '\\n' ' ' | sed 's/ $//'\n}\n",
            "explanation": "Print the arguments sorted numerically on one line."
        }),
        (Role::Adversary, Language::Python) => json!({
            "tests": [
                { "input": "solve([])", "expected": "[]", "description": "empty input" },
                { "input": "solve([3, 1, 2])", "expected": "[1, 2, 3]", "description": "unsorted input" },
                { "input": "solve([2, 2, -1])", "expected": "[-1, 2, 2]", "description": "duplicates and negatives" }
            ]
        }),
        (Role::Adversary, Language::Shell) => json!({
            "tests": [
                { "input": "solve", "expected": "", "description": "no arguments" },
                { "input": "solve 3 1 2", "expected": "1 2 3", "description": "unsorted input" },
                { "input": "solve 2 2 -1", "expected": "-1 2 2", "description": "duplicates and negatives" }
            ]
        }),
        (Role::Debugger, _) => json!({
            "root_cause": "No concrete failure is visible in offline mode.",
            "failure_category": "other",
            "repair_strategy": "Re-check empty and boundary inputs.",
            "confidence": 0.5
        }),
        (Role::Summarizer, _) => json!({
            "lessons": ["Always validate empty inputs before processing."]
        }),
    }
}
