//! Audit trail for finished runs under `<audit-dir>/<task-id>/`.
//!
//! ```text
//! <task-id>/report.json
//! <task-id>/<n>/meta.json
//! <task-id>/<n>/code.txt        (when generation produced code)
//! <task-id>/<n>/tests.json      (when a test set was produced)
//! <task-id>/<n>/outcome.json    (when the artifact was executed)
//! <task-id>/<n>/diagnosis.json  (when a diagnosis was recorded)
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;

use crate::core::types::{FailureCategory, IterationRecord, OutcomeTag};
use crate::repair_loop::RunReport;

#[derive(Debug, Clone, Serialize)]
pub struct IterationMeta<'a> {
    pub task_id: &'a str,
    pub iteration: u32,
    pub passed: bool,
    pub outcome: Option<OutcomeTag>,
    pub failure_category: Option<FailureCategory>,
    pub step_error: Option<&'a str>,
    pub salvage_recovered: bool,
    pub duration_ms: u64,
}

impl<'a> IterationMeta<'a> {
    fn from_record(task_id: &'a str, record: &'a IterationRecord) -> Self {
        Self {
            task_id,
            iteration: record.number,
            passed: record.passed(),
            outcome: record.outcome.as_ref().map(|o| o.tag),
            failure_category: record.failure_category,
            step_error: record.step_error.as_deref(),
            salvage_recovered: record.salvage_recovered,
            duration_ms: record.duration_ms,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReportPaths {
    pub dir: PathBuf,
    pub report_path: PathBuf,
}

impl ReportPaths {
    pub fn new(root: &Path, task_id: &str) -> Self {
        let dir = root.join(task_id);
        Self {
            report_path: dir.join("report.json"),
            dir,
        }
    }

    pub fn iteration_dir(&self, number: u32) -> PathBuf {
        self.dir.join(number.to_string())
    }
}

/// Write the full audit trail for `report`, replacing any earlier trail for the same task.
pub fn write_report(root: &Path, report: &RunReport) -> Result<ReportPaths> {
    let paths = ReportPaths::new(root, &report.task_id);
    if paths.dir.exists() {
        fs::remove_dir_all(&paths.dir)
            .with_context(|| format!("clear audit dir {}", paths.dir.display()))?;
    }
    fs::create_dir_all(&paths.dir)
        .with_context(|| format!("create audit dir {}", paths.dir.display()))?;

    write_json(&paths.report_path, report)?;
    for record in &report.iterations {
        write_iteration(&paths, &report.task_id, record)?;
    }
    Ok(paths)
}

fn write_iteration(paths: &ReportPaths, task_id: &str, record: &IterationRecord) -> Result<()> {
    let dir = paths.iteration_dir(record.number);
    fs::create_dir_all(&dir).with_context(|| format!("create iteration dir {}", dir.display()))?;

    // Write in deterministic order to keep logs stable.
    write_json(&dir.join("meta.json"), &IterationMeta::from_record(task_id, record))?;
    if let Some(artifact) = &record.artifact {
        write_text(&dir.join("code.txt"), &artifact.code)?;
    }
    if let Some(tests) = &record.tests {
        write_json(&dir.join("tests.json"), tests)?;
    }
    if let Some(outcome) = &record.outcome {
        write_json(&dir.join("outcome.json"), outcome)?;
    }
    if let Some(diagnosis) = &record.diagnosis {
        write_json(&dir.join("diagnosis.json"), diagnosis)?;
    }
    Ok(())
}

fn write_text(path: &Path, contents: &str) -> Result<()> {
    fs::write(path, contents).with_context(|| format!("write {}", path.display()))
}

fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let mut buf = serde_json::to_string_pretty(value)
        .with_context(|| format!("serialize {}", path.display()))?;
    buf.push('\n');
    write_text(path, &buf)
}
