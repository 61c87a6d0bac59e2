//! Benchmark runner: every task in a directory, one JSON summary.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::core::types::{FailureCategory, FinalOutcome, Task};
use crate::io::model::Model;
use crate::repair_loop::{RepairLoop, RunReport};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_id: String,
    pub success: bool,
    /// Solved on the first iteration.
    pub first_pass: bool,
    pub iterations_used: u32,
    pub failure_categories: Vec<FailureCategory>,
    pub final_code: Option<String>,
    /// Set when the run itself could not complete.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TaskResult {
    pub fn from_report(report: &RunReport) -> Self {
        let success = report.outcome == FinalOutcome::Success;
        let iterations_used = u32::try_from(report.iterations.len()).unwrap_or(u32::MAX);
        Self {
            task_id: report.task_id.clone(),
            success,
            first_pass: success && iterations_used == 1,
            iterations_used,
            failure_categories: report.failure_categories(),
            final_code: report.final_code.clone(),
            error: None,
        }
    }

    fn errored(task_id: &str, error: String) -> Self {
        Self {
            task_id: task_id.to_string(),
            success: false,
            first_pass: false,
            iterations_used: 0,
            failure_categories: Vec::new(),
            final_code: None,
            error: Some(error),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BenchSummary {
    pub total_tasks: usize,
    pub first_pass_success: usize,
    pub healed_success: usize,
    pub total_failures: usize,
    /// Share of first-pass failures that were healed later.
    pub repair_effectiveness: f64,
    pub avg_iterations: f64,
    pub failure_categories: BTreeMap<FailureCategory, usize>,
    pub run_timestamp: String,
    pub cancelled: bool,
    pub results: Vec<TaskResult>,
}

impl BenchSummary {
    pub fn from_results(results: Vec<TaskResult>, cancelled: bool) -> Self {
        let total_tasks = results.len();
        let first_pass_success = results.iter().filter(|r| r.first_pass).count();
        let healed_success = results
            .iter()
            .filter(|r| r.success && !r.first_pass)
            .count();
        let total_failures = results.iter().filter(|r| !r.success).count();

        let first_pass_failures = total_tasks - first_pass_success;
        let repair_effectiveness = if first_pass_failures == 0 {
            1.0
        } else {
            healed_success as f64 / first_pass_failures as f64
        };
        let avg_iterations = if total_tasks == 0 {
            0.0
        } else {
            results
                .iter()
                .map(|r| f64::from(r.iterations_used))
                .sum::<f64>()
                / total_tasks as f64
        };

        let mut failure_categories = BTreeMap::new();
        for category in results.iter().flat_map(|r| &r.failure_categories) {
            *failure_categories.entry(*category).or_insert(0) += 1;
        }

        Self {
            total_tasks,
            first_pass_success,
            healed_success,
            total_failures,
            repair_effectiveness,
            avg_iterations,
            failure_categories,
            run_timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
            cancelled,
            results,
        }
    }
}

/// Run every task in order. Stops early, keeping finished results, once the
/// loop's cancellation token fires.
pub fn run_bench<M: Model + ?Sized>(
    repair: &RepairLoop<'_, M>,
    tasks: &[Task],
    max_iterations: u32,
    mut on_report: impl FnMut(&RunReport),
) -> BenchSummary {
    let mut results = Vec::with_capacity(tasks.len());
    let mut cancelled = false;

    for task in tasks {
        if repair.cancel_token().is_cancelled() {
            cancelled = true;
            break;
        }
        match repair.run_task(task, max_iterations) {
            Ok(report) => {
                on_report(&report);
                if report.outcome == FinalOutcome::Cancelled {
                    cancelled = true;
                    results.push(TaskResult::from_report(&report));
                    break;
                }
                info!(task = %task.id, outcome = ?report.outcome, "bench task finished");
                results.push(TaskResult::from_report(&report));
            }
            Err(err) => {
                warn!(task = %task.id, err = %err, "bench task aborted");
                results.push(TaskResult::errored(&task.id, err.to_string()));
            }
        }
    }

    BenchSummary::from_results(results, cancelled)
}

pub fn write_summary(path: &Path, summary: &BenchSummary) -> Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)
            .with_context(|| format!("create {}", parent.display()))?;
    }
    let json = serde_json::to_string_pretty(summary).context("serialize bench summary")?;
    fs::write(path, format!("{json}\n")).with_context(|| format!("write {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(id: &str, success: bool, iterations: u32, categories: &[FailureCategory]) -> TaskResult {
        TaskResult {
            task_id: id.to_string(),
            success,
            first_pass: success && iterations == 1,
            iterations_used: iterations,
            failure_categories: categories.to_vec(),
            final_code: None,
            error: None,
        }
    }

    #[test]
    fn summary_metrics() {
        let summary = BenchSummary::from_results(
            vec![
                result("a", true, 1, &[]),
                result("b", true, 3, &[FailureCategory::LogicError, FailureCategory::EdgeCase]),
                result("c", false, 4, &[FailureCategory::LogicError; 4]),
                result("d", false, 4, &[FailureCategory::Timeout; 4]),
            ],
            false,
        );
        assert_eq!(summary.total_tasks, 4);
        assert_eq!(summary.first_pass_success, 1);
        assert_eq!(summary.healed_success, 1);
        assert_eq!(summary.total_failures, 2);
        assert!((summary.repair_effectiveness - 1.0 / 3.0).abs() < 1e-9);
        assert!((summary.avg_iterations - 3.0).abs() < 1e-9);
        assert_eq!(summary.failure_categories[&FailureCategory::LogicError], 5);
        assert_eq!(summary.failure_categories[&FailureCategory::Timeout], 4);
    }

    #[test]
    fn all_first_pass_counts_as_fully_effective() {
        let summary = BenchSummary::from_results(vec![result("a", true, 1, &[])], false);
        assert!((summary.repair_effectiveness - 1.0).abs() < 1e-9);

        let empty = BenchSummary::from_results(Vec::new(), false);
        assert_eq!(empty.avg_iterations, 0.0);
        assert!((empty.repair_effectiveness - 1.0).abs() < 1e-9);
    }

    #[test]
    fn summary_file_is_pretty_json() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("out/bench.json");
        let summary = BenchSummary::from_results(vec![result("a", false, 2, &[])], false);
        write_summary(&path, &summary).expect("write");

        let text = fs::read_to_string(&path).expect("read");
        assert!(text.contains("\n  \"total_tasks\": 1"));
        let back: BenchSummary = serde_json::from_str(&text).expect("parse");
        assert_eq!(back, summary);
    }
}
