//! Task files.
//!
//! ```toml
//! [task]
//! id = "sort-list"
//! description = "Write solve(data) returning the integers sorted ascending."
//! language = "python"   # optional, falls back to the configured default
//!
//! [[oracle]]            # optional reference cases
//! input = "solve([2, 1])"
//! expected = "[1, 2]"
//! ```

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow, bail};
use serde::Deserialize;
use tracing::debug;

use crate::core::types::{Language, Task, TestCase};

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct TaskFile {
    task: TaskHeader,
    #[serde(default)]
    oracle: Vec<TestCase>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct TaskHeader {
    id: String,
    description: String,
    #[serde(default)]
    language: Option<Language>,
}

/// Parse a task from TOML text.
pub fn parse_task(contents: &str, default_language: Language) -> Result<Task> {
    let file: TaskFile = toml::from_str(contents).context("parse task toml")?;
    let task = Task {
        id: file.task.id.trim().to_string(),
        description: file.task.description.trim().to_string(),
        language: file.task.language.unwrap_or(default_language),
        oracle: file.oracle,
    };
    validate_task(&task)?;
    Ok(task)
}

/// Load one task file.
pub fn load_task(path: &Path, default_language: Language) -> Result<Task> {
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    parse_task(&contents, default_language).with_context(|| format!("load task {}", path.display()))
}

/// Load every `*.toml` task under `dir`, sorted by file name.
pub fn discover_tasks(dir: &Path, default_language: Language) -> Result<Vec<Task>> {
    let mut paths: Vec<PathBuf> = fs::read_dir(dir)
        .with_context(|| format!("read task directory {}", dir.display()))?
        .map(|entry| entry.map(|e| e.path()))
        .collect::<std::io::Result<_>>()
        .with_context(|| format!("list {}", dir.display()))?;
    paths.retain(|p| p.is_file() && p.extension().is_some_and(|ext| ext == "toml"));
    paths.sort();

    let mut seen = BTreeSet::new();
    let mut tasks = Vec::with_capacity(paths.len());
    for path in paths {
        let task = load_task(&path, default_language)?;
        if !seen.insert(task.id.clone()) {
            bail!("duplicate task id {:?} in {}", task.id, path.display());
        }
        debug!(id = %task.id, path = %path.display(), "loaded task");
        tasks.push(task);
    }
    Ok(tasks)
}

fn validate_task(task: &Task) -> Result<()> {
    if task.id.is_empty() {
        return Err(anyhow!("task.id must not be empty"));
    }
    if !task
        .id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        || task.id.starts_with('.')
    {
        return Err(anyhow!(
            "task.id {:?} may only contain ASCII letters, digits, '-', '_' and '.'",
            task.id
        ));
    }
    if task.description.is_empty() {
        return Err(anyhow!("task.description must not be empty"));
    }
    for (index, case) in task.oracle.iter().enumerate() {
        if case.input.trim().is_empty() {
            return Err(anyhow!("oracle[{index}].input must not be empty"));
        }
    }
    Ok(())
}
