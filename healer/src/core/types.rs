//! Shared deterministic types for the repair loop.
//!
//! These types define the contracts between the orchestrator and the steps it
//! drives. Every value here is produced once and never edited afterwards; a
//! later iteration supersedes it with a fresh value instead.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Language the generated solution (and its test harness) is written in.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    #[default]
    Python,
    Shell,
}

impl Language {
    pub fn as_str(self) -> &'static str {
        match self {
            Language::Python => "python",
            Language::Shell => "shell",
        }
    }
}

/// One test case: an input expression and the behavior it must produce.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestCase {
    pub input: String,
    pub expected: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Immutable task input. Created once per run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub description: String,
    #[serde(default)]
    pub language: Language,
    /// Reference cases appended to every generated test set.
    #[serde(default)]
    pub oracle: Vec<TestCase>,
}

/// Generated source plus the context that produced it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeArtifact {
    pub code: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub explanation: Option<String>,
    /// Iteration whose diagnosis drove this repair, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repaired_from: Option<u32>,
    /// Ledger snapshot visible to the generator.
    #[serde(default)]
    pub lessons_seen: Vec<String>,
}

/// Ordered adversarial cases for one iteration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestSet {
    pub cases: Vec<TestCase>,
    /// Number of leading cases produced by the adversary (the rest are oracle cases).
    pub adversarial_count: usize,
}

impl TestSet {
    pub fn len(&self) -> usize {
        self.cases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cases.is_empty()
    }
}

/// Outcome classification of a sandbox execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeTag {
    Pass,
    Fail,
    Timeout,
    CrashNonZeroExit,
}

impl fmt::Display for OutcomeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OutcomeTag::Pass => "pass",
            OutcomeTag::Fail => "fail",
            OutcomeTag::Timeout => "timeout",
            OutcomeTag::CrashNonZeroExit => "crash_non_zero_exit",
        };
        f.write_str(name)
    }
}

/// Result of a single test case as reported by the harness.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestResult {
    pub index: usize,
    pub passed: bool,
    pub message: String,
}

/// Result of running one artifact against one test set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionOutcome {
    pub tag: OutcomeTag,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    /// Per-test breakdown, ordered by index. Partial when the run timed out.
    pub results: Vec<TestResult>,
    pub duration_ms: u64,
}

impl ExecutionOutcome {
    /// True only for a `Pass` tag with every case individually passing.
    pub fn all_passed(&self) -> bool {
        self.tag == OutcomeTag::Pass
            && !self.results.is_empty()
            && self.results.iter().all(|r| r.passed)
    }

    pub fn failed_results(&self) -> impl Iterator<Item = &TestResult> {
        self.results.iter().filter(|r| !r.passed)
    }
}

/// Failure classification attached to diagnoses and failed iterations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCategory {
    LogicError,
    EdgeCase,
    Exception,
    SyntaxError,
    Timeout,
    Performance,
    Other,
    /// The generator produced no usable code.
    GenerationMalformed,
    /// The adversary produced no usable test set.
    TestGenMalformed,
}

impl FailureCategory {
    /// Categories a diagnosis may name. The malformed variants are assigned by the loop.
    pub const DIAGNOSABLE: [FailureCategory; 7] = [
        FailureCategory::LogicError,
        FailureCategory::EdgeCase,
        FailureCategory::Exception,
        FailureCategory::SyntaxError,
        FailureCategory::Timeout,
        FailureCategory::Performance,
        FailureCategory::Other,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            FailureCategory::LogicError => "logic_error",
            FailureCategory::EdgeCase => "edge_case",
            FailureCategory::Exception => "exception",
            FailureCategory::SyntaxError => "syntax_error",
            FailureCategory::Timeout => "timeout",
            FailureCategory::Performance => "performance",
            FailureCategory::Other => "other",
            FailureCategory::GenerationMalformed => "generation_malformed",
            FailureCategory::TestGenMalformed => "test_gen_malformed",
        }
    }

    /// Fallback category inferred from an execution outcome alone.
    pub fn from_outcome(tag: OutcomeTag) -> Self {
        match tag {
            OutcomeTag::Timeout => FailureCategory::Timeout,
            OutcomeTag::CrashNonZeroExit => FailureCategory::Exception,
            OutcomeTag::Fail => FailureCategory::LogicError,
            OutcomeTag::Pass => FailureCategory::Other,
        }
    }
}

impl fmt::Display for FailureCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured root-cause record produced after a non-passing execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Diagnosis {
    pub failure_category: FailureCategory,
    pub root_cause: String,
    pub repair_strategy: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    /// Set when the record was built without a validated model response.
    #[serde(default)]
    pub stub: bool,
}

impl Diagnosis {
    /// Placeholder used when the diagnosis step itself produced nothing usable.
    pub fn stub(outcome: &ExecutionOutcome) -> Self {
        let category = FailureCategory::from_outcome(outcome.tag);
        Self {
            failure_category: category,
            root_cause: format!("execution ended with {} (diagnosis unavailable)", outcome.tag),
            repair_strategy: "Re-read the task and the failing cases before rewriting.".to_string(),
            confidence: None,
            stub: true,
        }
    }

    /// Single-line lesson text for the ledger.
    pub fn lesson(&self, max_chars: usize) -> String {
        let text = format!(
            "[{}] {} -> {}",
            self.failure_category,
            one_line(&self.root_cause),
            one_line(&self.repair_strategy)
        );
        truncate_chars(&text, max_chars)
    }
}

/// A user-requested abort observed at a cancellation point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("run cancelled")]
pub struct Cancelled;

/// Terminal result of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinalOutcome {
    Success,
    ExhaustedFailure,
    Cancelled,
}

/// Audit record of one iteration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IterationRecord {
    /// 1-based iteration number.
    pub number: u32,
    pub artifact: Option<CodeArtifact>,
    pub tests: Option<TestSet>,
    pub outcome: Option<ExecutionOutcome>,
    pub diagnosis: Option<Diagnosis>,
    /// Category for a failed iteration (diagnosed or malformed step).
    pub failure_category: Option<FailureCategory>,
    /// Step-level error text when a step produced nothing usable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_error: Option<String>,
    /// True if any structured output in this iteration came from salvage parsing.
    pub salvage_recovered: bool,
    /// Ledger contents after this iteration.
    pub lessons: Vec<String>,
    pub duration_ms: u64,
}

impl IterationRecord {
    pub fn new(number: u32) -> Self {
        Self {
            number,
            artifact: None,
            tests: None,
            outcome: None,
            diagnosis: None,
            failure_category: None,
            step_error: None,
            salvage_recovered: false,
            lessons: Vec::new(),
            duration_ms: 0,
        }
    }

    pub fn passed(&self) -> bool {
        self.outcome.as_ref().is_some_and(ExecutionOutcome::all_passed)
    }
}

pub(crate) fn one_line(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

pub(crate) fn truncate_chars(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max_chars.saturating_sub(3)).collect();
    out.push_str("...");
    out
}
