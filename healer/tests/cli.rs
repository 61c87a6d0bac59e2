//! CLI tests for the `healer` binary.
//!
//! Spawns the binary and checks exit codes and written artifacts.

use std::fs;
use std::io::Write;
use std::path::Path;
use std::process::{Command, Output, Stdio};

use healer::core::types::Language;
use healer::exit_codes;
use healer::io::config::{HealerConfig, load_config, write_config};
use serde_json::Value;

fn healer(dir: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_healer"))
        .current_dir(dir)
        .args(args)
        .output()
        .expect("spawn healer")
}

fn healer_with_stdin(args: &[&str], input: &str) -> Output {
    let mut child = Command::new(env!("CARGO_BIN_EXE_healer"))
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .expect("spawn healer");
    child
        .stdin
        .take()
        .expect("stdin")
        .write_all(input.as_bytes())
        .expect("write stdin");
    child.wait_with_output().expect("wait healer")
}

#[test]
fn validate_prints_full_record() {
    let output = healer_with_stdin(
        &["validate", "--schema", "generation"],
        "```json\n{\"code\": \"print(1)\", \"explanation\": \"prints\"}\n```",
    );
    assert_eq!(output.status.code(), Some(exit_codes::OK));
    let out: Value = serde_json::from_slice(&output.stdout).expect("json stdout");
    assert_eq!(out["record"]["code"], "print(1)");
    assert_eq!(out["salvaged"], false);
}

#[test]
fn validate_reports_salvaged_partial_record() {
    let output = healer_with_stdin(
        &["validate", "--schema", "diagnosis"],
        r#"{"root_cause": "off by one in the loop bou"#,
    );
    assert_eq!(output.status.code(), Some(exit_codes::OK));
    let out: Value = serde_json::from_slice(&output.stdout).expect("json stdout");
    assert_eq!(out["salvaged"], true);
    assert_eq!(out["record"]["root_cause"], "off by one in the loop bou");
    let absent = out["absent"].as_array().expect("absent list");
    assert!(absent.iter().any(|f| f == "failure_category"));
    assert!(out["record"].get("failure_category").is_none());
}

#[test]
fn validate_rejects_unrecoverable_text() {
    let output = healer_with_stdin(&["validate", "--schema", "tests"], "no structure here");
    assert_eq!(output.status.code(), Some(exit_codes::INVALID));
    assert!(String::from_utf8_lossy(&output.stderr).contains("tests output"));
}

#[test]
fn init_config_refuses_overwrite_without_force() {
    let temp = tempfile::tempdir().expect("tempdir");

    let first = healer(temp.path(), &["init-config"]);
    assert_eq!(first.status.code(), Some(exit_codes::OK));
    let path = temp.path().join("healer.toml");
    assert_eq!(load_config(&path).expect("load"), HealerConfig::default());

    let second = healer(temp.path(), &["init-config"]);
    assert_eq!(second.status.code(), Some(exit_codes::INVALID));

    let forced = healer(temp.path(), &["init-config", "--force"]);
    assert_eq!(forced.status.code(), Some(exit_codes::OK));
}

#[test]
fn run_rejects_missing_task_file() {
    let temp = tempfile::tempdir().expect("tempdir");
    let output = healer(temp.path(), &["run", "--task", "missing.toml", "--mock"]);
    assert_eq!(output.status.code(), Some(exit_codes::INVALID));
    assert!(String::from_utf8_lossy(&output.stderr).contains("missing.toml"));
}

#[cfg(unix)]
mod unix {
    use super::*;

    const SORT_TASK: &str = r#"
[task]
id = "sort-numbers"
description = "Define solve so that it prints its numeric arguments sorted ascending on one line."
language = "shell"

[[oracle]]
input = "solve 10 9"
expected = "9 10"
"#;

    #[test]
    fn mock_run_succeeds_and_writes_audit_trail() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::write(temp.path().join("sort.toml"), SORT_TASK).expect("write task");

        let output = healer(
            temp.path(),
            &["run", "--task", "sort.toml", "--mock", "--audit-dir", "audit", "--json"],
        );
        assert_eq!(
            output.status.code(),
            Some(exit_codes::OK),
            "stderr: {}",
            String::from_utf8_lossy(&output.stderr)
        );

        let report: Value = serde_json::from_slice(&output.stdout).expect("json report");
        assert_eq!(report["outcome"], "success");
        assert_eq!(report["iterations"].as_array().map(Vec::len), Some(1));

        let stderr = String::from_utf8_lossy(&output.stderr);
        assert!(stderr.contains("EXECUTE"));
        assert!(stderr.contains("TERMINATED_SUCCESS"));

        let trail = temp.path().join("audit/sort-numbers");
        assert!(trail.join("report.json").is_file());
        assert!(trail.join("1/code.txt").is_file());
        assert!(trail.join("1/outcome.json").is_file());
    }

    #[test]
    fn command_model_run_heals_and_exits_ok() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::write(temp.path().join("sort.toml"), SORT_TASK).expect("write task");

        // The model command answers with `<role>.json` from the working directory.
        let mut config = HealerConfig::default();
        config.sandbox.language = Language::Shell;
        config.model.command = vec![
            "sh".to_string(),
            "-c".to_string(),
            "cat \"$HEALER_ROLE.json\"".to_string(),
        ];
        write_config(&temp.path().join("healer.toml"), &config).expect("write config");
        fs::write(
            temp.path().join("generator.json"),
            r#"{"code": "solve() { printf '%s\\n' \"$@\" | sort -n | tr '\\n' ' ' | sed 's/ $//'; }\n"}"#,
        )
        .expect("write generator");
        fs::write(
            temp.path().join("adversary.json"),
            r#"{"tests": [{"input": "solve 3 1 2", "expected": "1 2 3"}]}"#,
        )
        .expect("write adversary");

        let output = healer(temp.path(), &["run", "--task", "sort.toml", "--max-iterations", "2"]);
        assert_eq!(
            output.status.code(),
            Some(exit_codes::OK),
            "stderr: {}",
            String::from_utf8_lossy(&output.stderr)
        );
        let stdout = String::from_utf8_lossy(&output.stdout);
        assert!(stdout.contains("sort-numbers: solved after 1 iteration(s)"));
    }

    #[test]
    fn bench_exits_exhausted_when_a_task_fails() {
        let temp = tempfile::tempdir().expect("tempdir");
        let tasks = temp.path().join("tasks");
        fs::create_dir(&tasks).expect("tasks dir");
        fs::write(tasks.join("a_sort.toml"), SORT_TASK).expect("write task");
        fs::write(
            tasks.join("b_reverse.toml"),
            r#"
[task]
id = "reverse"
description = "Print the arguments in reverse order."
language = "shell"

[[oracle]]
input = "solve 1 2 3"
expected = "3 2 1"
"#,
        )
        .expect("write task");

        let mut config = HealerConfig::default();
        config.sandbox.language = Language::Shell;
        write_config(&temp.path().join("healer.toml"), &config).expect("write config");

        let output = healer(
            temp.path(),
            &["bench", "--tasks", "tasks", "--mock", "--max-iterations", "2", "--out", "out/bench.json"],
        );
        assert_eq!(
            output.status.code(),
            Some(exit_codes::EXHAUSTED),
            "stderr: {}",
            String::from_utf8_lossy(&output.stderr)
        );

        let summary: Value = serde_json::from_str(
            &fs::read_to_string(temp.path().join("out/bench.json")).expect("summary"),
        )
        .expect("summary json");
        assert_eq!(summary["total_tasks"], 2);
        assert_eq!(summary["first_pass_success"], 1);
        assert_eq!(summary["healed_success"], 0);
        assert_eq!(summary["total_failures"], 1);
        assert_eq!(summary["results"][1]["task_id"], "reverse");
        assert_eq!(summary["results"][1]["iterations_used"], 2);
    }
}
