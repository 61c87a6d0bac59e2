//! Healer configuration stored in `healer.toml`.

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::backoff::RetryPolicy;
use crate::core::ledger::LEDGER_CAPACITY;
use crate::core::types::Language;
use crate::io::process::ProcessLimits;

pub const DEFAULT_CONFIG_FILE: &str = "healer.toml";

/// Healer configuration (TOML).
///
/// Meant to be edited by humans. Missing fields default to the values below.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct HealerConfig {
    /// Upper bound on generate/test/diagnose cycles per task.
    pub max_iterations: u32,
    pub sandbox: SandboxConfig,
    pub model: ModelConfig,
    pub retry: RetryPolicy,
    pub ledger: LedgerConfig,
    pub prompt: PromptConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SandboxConfig {
    /// Language used when a task file does not name one.
    pub language: Language,
    /// Interpreter command; empty means `python3` or `sh` depending on language.
    pub interpreter: Vec<String>,
    pub timeout_secs: u64,
    /// Truncate captured stdout/stderr beyond this many bytes.
    pub output_limit_bytes: usize,
    pub poll_interval_ms: u64,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            language: Language::Python,
            interpreter: Vec::new(),
            timeout_secs: 15,
            output_limit_bytes: 64_000,
            poll_interval_ms: 25,
        }
    }
}

impl SandboxConfig {
    pub fn limits(&self) -> ProcessLimits {
        ProcessLimits {
            timeout: Duration::from_secs(self.timeout_secs),
            output_limit_bytes: self.output_limit_bytes,
            poll_interval: Duration::from_millis(self.poll_interval_ms),
        }
    }

    /// Interpreter argv for `language`.
    pub fn interpreter_for(&self, language: Language) -> Vec<String> {
        if !self.interpreter.is_empty() {
            return self.interpreter.clone();
        }
        match language {
            Language::Python => vec!["python3".to_string()],
            Language::Shell => vec!["sh".to_string()],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ModelConfig {
    /// Command that reads a prompt on stdin and prints the completion on stdout.
    pub command: Vec<String>,
    pub timeout_secs: u64,
    pub output_limit_bytes: usize,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            command: vec!["ollama".to_string(), "run".to_string(), "llama3".to_string()],
            timeout_secs: 180,
            output_limit_bytes: 200_000,
        }
    }
}

impl ModelConfig {
    pub fn limits(&self, poll_interval: Duration) -> ProcessLimits {
        ProcessLimits {
            timeout: Duration::from_secs(self.timeout_secs),
            output_limit_bytes: self.output_limit_bytes,
            poll_interval,
        }
    }
}

/// How surplus ledger entries are merged on overflow.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    /// Ask the summarizer model, falling back to a plain join.
    #[default]
    Model,
    Join,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LedgerConfig {
    pub capacity: usize,
    pub compression: Compression,
    pub max_entry_chars: usize,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            capacity: LEDGER_CAPACITY,
            compression: Compression::Model,
            max_entry_chars: 400,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PromptConfig {
    pub budget_bytes: usize,
}

impl Default for PromptConfig {
    fn default() -> Self {
        Self {
            budget_bytes: 12_000,
        }
    }
}

impl Default for HealerConfig {
    fn default() -> Self {
        Self {
            max_iterations: 4,
            sandbox: SandboxConfig::default(),
            model: ModelConfig::default(),
            retry: RetryPolicy::default(),
            ledger: LedgerConfig::default(),
            prompt: PromptConfig::default(),
        }
    }
}

impl HealerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_iterations == 0 {
            return Err(anyhow!("max_iterations must be > 0"));
        }
        if self.sandbox.timeout_secs == 0 {
            return Err(anyhow!("sandbox.timeout_secs must be > 0"));
        }
        if self.sandbox.output_limit_bytes == 0 {
            return Err(anyhow!("sandbox.output_limit_bytes must be > 0"));
        }
        if self.sandbox.poll_interval_ms == 0 {
            return Err(anyhow!("sandbox.poll_interval_ms must be > 0"));
        }
        if self
            .sandbox
            .interpreter
            .first()
            .is_some_and(|program| program.trim().is_empty())
        {
            return Err(anyhow!("sandbox.interpreter must start with a program"));
        }
        if self.model.timeout_secs == 0 {
            return Err(anyhow!("model.timeout_secs must be > 0"));
        }
        if self.model.output_limit_bytes == 0 {
            return Err(anyhow!("model.output_limit_bytes must be > 0"));
        }
        if self.model.command.is_empty() || self.model.command[0].trim().is_empty() {
            return Err(anyhow!("model.command must be a non-empty array"));
        }
        if self.retry.max_attempts == 0 {
            return Err(anyhow!("retry.max_attempts must be > 0"));
        }
        if self.retry.multiplier == 0 {
            return Err(anyhow!("retry.multiplier must be > 0"));
        }
        if !(2..=LEDGER_CAPACITY).contains(&self.ledger.capacity) {
            return Err(anyhow!(
                "ledger.capacity must be between 2 and {LEDGER_CAPACITY}, got {}",
                self.ledger.capacity
            ));
        }
        if self.ledger.max_entry_chars < 16 {
            return Err(anyhow!("ledger.max_entry_chars must be >= 16"));
        }
        if self.prompt.budget_bytes < 1_000 {
            return Err(anyhow!("prompt.budget_bytes must be >= 1000"));
        }
        Ok(())
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `HealerConfig::default()`.
pub fn load_config(path: &Path) -> Result<HealerConfig> {
    if !path.exists() {
        let cfg = HealerConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: HealerConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("invalid config {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &HealerConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}
