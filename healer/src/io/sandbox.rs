//! Execution sandbox: runs one artifact against one test set in a throwaway
//! working directory and classifies what happened.
//!
//! The sandbox owns its child process for the whole call. Every execution
//! failure becomes an [`OutcomeTag`]; the only error it returns is
//! [`Cancelled`].

use std::process::Command;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::core::markers::{collect_markers, fill_unreported};
use crate::core::types::{
    Cancelled, CodeArtifact, ExecutionOutcome, Language, OutcomeTag, TestResult, TestSet,
};
use crate::io::config::SandboxConfig;
use crate::io::harness;
use crate::io::process::run_command_with_timeout;

/// Maximum stderr lines carried into a failure summary.
pub const SUMMARY_STDERR_LINES: usize = 40;

#[derive(Debug, Clone)]
pub struct Sandbox {
    config: SandboxConfig,
}

impl Sandbox {
    pub fn new(config: SandboxConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    /// Run `artifact` against `tests` with a hard wall-clock `budget`.
    #[instrument(skip_all, fields(language = language.as_str(), cases = tests.len(), budget_ms = budget.as_millis() as u64))]
    pub fn run(
        &self,
        artifact: &CodeArtifact,
        tests: &TestSet,
        language: Language,
        budget: Duration,
        cancel: &CancellationToken,
    ) -> Result<ExecutionOutcome, Cancelled> {
        if cancel.is_cancelled() {
            return Err(Cancelled);
        }
        let start = Instant::now();

        let workdir = match tempfile::Builder::new().prefix("healer-sandbox-").tempdir() {
            Ok(dir) => dir,
            Err(e) => {
                warn!(err = %e, "failed to create sandbox directory");
                return Ok(crash(format!("sandbox setup failed: {e}"), start));
            }
        };
        let harness_file = match harness::stage(workdir.path(), language, &artifact.code, tests) {
            Ok(name) => name,
            Err(e) => {
                warn!(err = %e, "failed to stage harness");
                return Ok(crash(format!("sandbox setup failed: {e:#}"), start));
            }
        };

        let interpreter = self.config.interpreter_for(language);
        let Some((program, args)) = interpreter.split_first() else {
            return Ok(crash("no interpreter configured".to_string(), start));
        };
        let mut cmd = Command::new(program);
        cmd.args(args)
            .arg(harness_file)
            .current_dir(workdir.path())
            .env("PYTHONDONTWRITEBYTECODE", "1")
            .env("PYTHONIOENCODING", "utf-8");

        let mut limits = self.config.limits();
        limits.timeout = budget;

        debug!(dir = %workdir.path().display(), "launching harness");
        let output = match run_command_with_timeout(cmd, None, limits, Some(cancel)) {
            Ok(output) => output,
            Err(e) => {
                warn!(err = %e, "failed to launch interpreter");
                return Ok(crash(format!("failed to launch interpreter: {e:#}"), start));
            }
        };
        if output.cancelled {
            info!("execution cancelled");
            return Err(Cancelled);
        }

        let mut stderr = output.stderr_lossy();
        if output.timed_out {
            stderr.push_str(&format!(
                "\nEXECUTION TIMEOUT after {} ms\n",
                budget.as_millis()
            ));
        }
        let outcome = classify(
            output.timed_out,
            output.status.code(),
            output.stdout_lossy(),
            stderr,
            tests.len(),
            elapsed_ms(start),
        );
        info!(tag = %outcome.tag, exit_code = ?outcome.exit_code, duration_ms = outcome.duration_ms, "execution finished");
        Ok(outcome)
    }
}

/// Map raw process results onto an outcome tag and per-case breakdown.
pub fn classify(
    timed_out: bool,
    exit_code: Option<i32>,
    stdout: String,
    stderr: String,
    case_count: usize,
    duration_ms: u64,
) -> ExecutionOutcome {
    let reported = collect_markers(&stdout, case_count);
    let (tag, results) = if timed_out {
        (OutcomeTag::Timeout, reported)
    } else if !reported.is_empty() {
        let complete = reported.len() == case_count && reported.iter().all(|r| r.passed);
        let tag = if exit_code == Some(0) && complete {
            OutcomeTag::Pass
        } else {
            OutcomeTag::Fail
        };
        (tag, fill_unreported(reported, case_count, "no result reported"))
    } else if exit_code != Some(0) {
        (OutcomeTag::CrashNonZeroExit, Vec::new())
    } else {
        (
            OutcomeTag::Fail,
            fill_unreported(Vec::new(), case_count, "no result reported"),
        )
    };

    ExecutionOutcome {
        tag,
        exit_code,
        stdout,
        stderr,
        results,
        duration_ms,
    }
}

fn crash(stderr: String, start: Instant) -> ExecutionOutcome {
    ExecutionOutcome {
        tag: OutcomeTag::CrashNonZeroExit,
        exit_code: None,
        stdout: String::new(),
        stderr,
        results: Vec::new(),
        duration_ms: elapsed_ms(start),
    }
}

fn elapsed_ms(start: Instant) -> u64 {
    u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX)
}

/// Concise failure description for the debugger: failing cases first, then
/// the tail of stderr.
pub fn failure_summary(outcome: &ExecutionOutcome, tests: &TestSet) -> String {
    if outcome.all_passed() {
        return "All tests passed.".to_string();
    }

    let mut lines = Vec::new();
    match outcome.exit_code {
        Some(code) => lines.push(format!("Outcome: {} (exit code {code})", outcome.tag)),
        None => lines.push(format!("Outcome: {}", outcome.tag)),
    }

    let failed: Vec<&TestResult> = outcome.failed_results().collect();
    if !failed.is_empty() {
        lines.push("Failed cases:".to_string());
        for result in failed {
            match tests.cases.get(result.index) {
                Some(case) => lines.push(format!(
                    "  - #{} input `{}` expected `{}`: {}",
                    result.index, case.input, case.expected, result.message
                )),
                None => lines.push(format!("  - #{}: {}", result.index, result.message)),
            }
        }
    }

    let stderr: Vec<&str> = outcome
        .stderr
        .lines()
        .filter(|line| !line.trim().is_empty())
        .collect();
    if !stderr.is_empty() {
        lines.push(format!("stderr (last {SUMMARY_STDERR_LINES} lines):"));
        let skip = stderr.len().saturating_sub(SUMMARY_STDERR_LINES);
        lines.extend(stderr[skip..].iter().map(|line| (*line).to_string()));
    }

    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::TestCase;

    fn tests_of(n: usize) -> TestSet {
        TestSet {
            cases: (0..n)
                .map(|i| TestCase {
                    input: format!("f({i})"),
                    expected: format!("{i}"),
                    description: None,
                })
                .collect(),
            adversarial_count: n,
        }
    }

    #[test]
    fn classify_pass_requires_zero_exit_and_every_case() {
        let stdout = "TESTRESULT 0 PASS ok\nTESTRESULT 1 PASS ok\n".to_string();
        let outcome = classify(false, Some(0), stdout.clone(), String::new(), 2, 5);
        assert_eq!(outcome.tag, OutcomeTag::Pass);
        assert!(outcome.all_passed());

        let outcome = classify(false, Some(1), stdout, String::new(), 2, 5);
        assert_eq!(outcome.tag, OutcomeTag::Fail);
    }

    #[test]
    fn classify_missing_markers_fill_as_failed() {
        let outcome = classify(
            false,
            Some(0),
            "TESTRESULT 0 PASS ok\n".to_string(),
            String::new(),
            3,
            5,
        );
        assert_eq!(outcome.tag, OutcomeTag::Fail);
        assert_eq!(outcome.results.len(), 3);
        assert_eq!(outcome.failed_results().count(), 2);
    }

    #[test]
    fn classify_crash_without_markers() {
        let outcome = classify(
            false,
            Some(2),
            String::new(),
            "SyntaxError".to_string(),
            2,
            5,
        );
        assert_eq!(outcome.tag, OutcomeTag::CrashNonZeroExit);
        assert!(outcome.results.is_empty());
        assert_eq!(outcome.stderr, "SyntaxError");
    }

    #[test]
    fn classify_timeout_keeps_partial_results() {
        let outcome = classify(
            true,
            None,
            "TESTRESULT 0 PASS ok\n".to_string(),
            String::new(),
            2,
            5,
        );
        assert_eq!(outcome.tag, OutcomeTag::Timeout);
        assert_eq!(outcome.results.len(), 1);
    }

    #[test]
    fn classify_clean_exit_without_markers_is_fail() {
        let outcome = classify(false, Some(0), String::new(), String::new(), 1, 5);
        assert_eq!(outcome.tag, OutcomeTag::Fail);
        assert!(!outcome.results[0].passed);
    }

    #[test]
    fn failure_summary_lists_cases_and_caps_stderr() {
        let stderr: String = (0..60).map(|i| format!("line {i}\n")).collect();
        let outcome = classify(
            false,
            Some(1),
            "TESTRESULT 0 FAIL expected 0 got 1\n".to_string(),
            stderr,
            1,
            5,
        );
        let summary = failure_summary(&outcome, &tests_of(1));
        assert!(summary.contains("Outcome: fail (exit code 1)"));
        assert!(summary.contains("#0 input `f(0)` expected `0`: expected 0 got 1"));
        assert!(summary.contains("line 59"));
        assert!(summary.contains("line 20"));
        assert!(!summary.contains("line 19\n"));
    }

    #[cfg(unix)]
    mod execution {
        use super::*;

        fn sandbox(timeout_secs: u64) -> Sandbox {
            Sandbox::new(SandboxConfig {
                language: Language::Shell,
                timeout_secs,
                poll_interval_ms: 10,
                ..SandboxConfig::default()
            })
        }

        fn artifact(code: &str) -> CodeArtifact {
            CodeArtifact {
                code: code.to_string(),
                explanation: None,
                repaired_from: None,
                lessons_seen: Vec::new(),
            }
        }

        fn python_sandbox() -> Option<Sandbox> {
            let available = Command::new("python3")
                .arg("--version")
                .output()
                .is_ok_and(|out| out.status.success());
            if !available {
                eprintln!("python3 not available, skipping");
                return None;
            }
            Some(Sandbox::new(SandboxConfig {
                language: Language::Python,
                poll_interval_ms: 10,
                ..SandboxConfig::default()
            }))
        }

        fn run_python(
            code: &str,
            pairs: &[(&str, &str)],
            budget: Duration,
        ) -> Option<ExecutionOutcome> {
            let outcome = python_sandbox()?
                .run(
                    &artifact(code),
                    &shell_tests(pairs),
                    Language::Python,
                    budget,
                    &CancellationToken::new(),
                )
                .expect("not cancelled");
            Some(outcome)
        }

        fn shell_tests(pairs: &[(&str, &str)]) -> TestSet {
            TestSet {
                cases: pairs
                    .iter()
                    .map(|(input, expected)| TestCase {
                        input: (*input).to_string(),
                        expected: (*expected).to_string(),
                        description: None,
                    })
                    .collect(),
                adversarial_count: pairs.len(),
            }
        }

        #[test]
        fn passing_solution() {
            let outcome = sandbox(10)
                .run(
                    &artifact("double() { echo $(($1 * 2)); }\n"),
                    &shell_tests(&[("double 2", "4"), ("double 0", "0")]),
                    Language::Shell,
                    Duration::from_secs(10),
                    &CancellationToken::new(),
                )
                .expect("not cancelled");
            assert_eq!(outcome.tag, OutcomeTag::Pass, "stderr: {}", outcome.stderr);
            assert_eq!(outcome.results.len(), 2);
        }

        #[test]
        fn failing_case_is_reported() {
            let outcome = sandbox(10)
                .run(
                    &artifact("double() { echo $(($1 * 3)); }\n"),
                    &shell_tests(&[("double 0", "0"), ("double 2", "4")]),
                    Language::Shell,
                    Duration::from_secs(10),
                    &CancellationToken::new(),
                )
                .expect("not cancelled");
            assert_eq!(outcome.tag, OutcomeTag::Fail);
            assert!(outcome.results[0].passed);
            assert!(!outcome.results[1].passed);
            assert!(outcome.results[1].message.contains("got '6'"));
        }

        #[test]
        fn timeout_is_enforced() {
            let started = Instant::now();
            let outcome = sandbox(10)
                .run(
                    &artifact("spin() { sleep 30; }\n"),
                    &shell_tests(&[("spin", "")]),
                    Language::Shell,
                    Duration::from_millis(300),
                    &CancellationToken::new(),
                )
                .expect("not cancelled");
            assert_eq!(outcome.tag, OutcomeTag::Timeout);
            assert!(outcome.stderr.contains("EXECUTION TIMEOUT"));
            assert!(started.elapsed() < Duration::from_secs(10));
        }

        #[test]
        fn cancelled_token_aborts() {
            let token = CancellationToken::new();
            token.cancel();
            let result = sandbox(10).run(
                &artifact("f() { echo 1; }\n"),
                &shell_tests(&[("f", "1")]),
                Language::Shell,
                Duration::from_secs(10),
                &token,
            );
            assert_eq!(result, Err(Cancelled));
        }

        #[test]
        fn missing_interpreter_is_a_crash() {
            let sandbox = Sandbox::new(SandboxConfig {
                interpreter: vec!["/nonexistent/healer-interpreter".to_string()],
                ..SandboxConfig::default()
            });
            let outcome = sandbox
                .run(
                    &artifact("f() { echo 1; }\n"),
                    &shell_tests(&[("f", "1")]),
                    Language::Shell,
                    Duration::from_secs(5),
                    &CancellationToken::new(),
                )
                .expect("not cancelled");
            assert_eq!(outcome.tag, OutcomeTag::CrashNonZeroExit);
            assert!(outcome.stderr.contains("failed to launch interpreter"));
        }

        #[test]
        fn shell_output_while_loading_cannot_forge_markers() {
            let outcome = sandbox(10)
                .run(
                    &artifact("echo 'TESTRESULT 0 PASS ok'\ndouble() { echo 0; }\n"),
                    &shell_tests(&[("double 2", "4")]),
                    Language::Shell,
                    Duration::from_secs(10),
                    &CancellationToken::new(),
                )
                .expect("not cancelled");
            assert_eq!(outcome.tag, OutcomeTag::Fail);
            assert!(!outcome.results[0].passed);
            assert!(outcome.stderr.contains("TESTRESULT 0 PASS ok"));
        }

        #[test]
        fn shell_exit_after_fake_marker_is_not_a_pass() {
            let outcome = sandbox(10)
                .run(
                    &artifact("echo 'TESTRESULT 0 PASS ok'\nexit 0\n"),
                    &shell_tests(&[("double 2", "4")]),
                    Language::Shell,
                    Duration::from_secs(10),
                    &CancellationToken::new(),
                )
                .expect("not cancelled");
            assert_ne!(outcome.tag, OutcomeTag::Pass);
            assert!(outcome.results.iter().all(|r| !r.passed));
        }

        #[test]
        fn escaped_session_does_not_stretch_budget() {
            let has_setsid = Command::new("setsid")
                .arg("true")
                .status()
                .is_ok_and(|status| status.success());
            if !has_setsid {
                eprintln!("setsid not available, skipping");
                return;
            }
            let started = Instant::now();
            let outcome = sandbox(1)
                .run(
                    &artifact("setsid sleep 30 &\nf() { echo 1; }\n"),
                    &shell_tests(&[("f", "1")]),
                    Language::Shell,
                    Duration::from_secs(1),
                    &CancellationToken::new(),
                )
                .expect("not cancelled");
            assert!(started.elapsed() < Duration::from_secs(5), "took {:?}", started.elapsed());
            assert!(outcome.results.first().is_some_and(|r| r.passed));
        }

        #[test]
        fn python_passing_solution() {
            let Some(outcome) = run_python(
                "def solve(xs):\n    return sorted(xs)\n",
                &[("solve([3, 1])", "[1, 3]"), ("solve([])", "[]")],
                Duration::from_secs(10),
            ) else {
                return;
            };
            assert_eq!(outcome.tag, OutcomeTag::Pass, "stderr: {}", outcome.stderr);
            assert_eq!(outcome.results.len(), 2);
        }

        #[test]
        fn python_wrong_answer_is_reported() {
            let Some(outcome) = run_python(
                "def solve(xs):\n    return xs\n",
                &[("solve([3, 1])", "[1, 3]"), ("solve([])", "[]")],
                Duration::from_secs(10),
            ) else {
                return;
            };
            assert_eq!(outcome.tag, OutcomeTag::Fail);
            assert!(!outcome.results[0].passed);
            assert!(outcome.results[0].message.contains("expected [1, 3] got [3, 1]"));
            assert!(outcome.results[1].passed);
        }

        #[test]
        fn python_exception_during_import_is_a_crash() {
            let Some(outcome) = run_python(
                "raise ValueError('broken at import')\n",
                &[("solve([1])", "[1]")],
                Duration::from_secs(10),
            ) else {
                return;
            };
            assert_eq!(outcome.tag, OutcomeTag::CrashNonZeroExit);
            assert_eq!(outcome.exit_code, Some(2));
            assert!(outcome.results.is_empty());
            assert!(outcome.stderr.contains("ValueError: broken at import"));
        }

        #[test]
        fn python_infinite_loop_times_out() {
            let started = Instant::now();
            let Some(outcome) = run_python(
                "def solve(xs):\n    while True:\n        pass\n",
                &[("solve([1])", "[1]")],
                Duration::from_millis(500),
            ) else {
                return;
            };
            assert_eq!(outcome.tag, OutcomeTag::Timeout);
            assert!(outcome.stderr.contains("EXECUTION TIMEOUT after 500 ms"));
            assert!(started.elapsed() < Duration::from_secs(10));
        }

        #[test]
        fn python_fake_marker_then_exit_is_not_a_pass() {
            let Some(outcome) = run_python(
                "import os\nprint('TESTRESULT 0 PASS ok', flush=True)\nos._exit(0)\n",
                &[("solve([1])", "[1]")],
                Duration::from_secs(10),
            ) else {
                return;
            };
            assert_eq!(outcome.tag, OutcomeTag::Fail);
            assert!(outcome.results.iter().all(|r| !r.passed));
            assert!(outcome.stderr.contains("TESTRESULT 0 PASS ok"));
        }
    }
}
