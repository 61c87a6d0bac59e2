//! Stage a solution, its test cases and a language harness into a working directory.
//!
//! The harness scripts are static; cases are written as data files so neither
//! the solution nor the test text is ever spliced into harness source.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};

use crate::core::types::{Language, TestSet};

const PYTHON_HARNESS: &str = include_str!("harness/harness.py");
const SHELL_HARNESS: &str = include_str!("harness/harness.sh");

/// Write everything the harness needs into `dir`. Returns the harness file name
/// to hand to the interpreter.
pub fn stage(dir: &Path, language: Language, code: &str, tests: &TestSet) -> Result<&'static str> {
    match language {
        Language::Python => stage_python(dir, code, tests),
        Language::Shell => stage_shell(dir, code, tests),
    }
}

fn stage_python(dir: &Path, code: &str, tests: &TestSet) -> Result<&'static str> {
    write(dir, "solution.py", code)?;
    let cases = serde_json::to_string(&tests.cases).context("serialize test cases")?;
    write(dir, "cases.json", &cases)?;
    write(dir, "harness.py", PYTHON_HARNESS)?;
    Ok("harness.py")
}

fn stage_shell(dir: &Path, code: &str, tests: &TestSet) -> Result<&'static str> {
    write(dir, "solution.sh", code)?;
    let cases_dir = dir.join("cases");
    fs::create_dir_all(&cases_dir)
        .with_context(|| format!("create directory {}", cases_dir.display()))?;
    for (index, case) in tests.cases.iter().enumerate() {
        write(&cases_dir, &format!("{index}.input"), &case.input)?;
        write(&cases_dir, &format!("{index}.expected"), &case.expected)?;
    }
    write(dir, "harness.sh", SHELL_HARNESS)?;
    Ok("harness.sh")
}

fn write(dir: &Path, name: &str, contents: &str) -> Result<()> {
    let path = dir.join(name);
    fs::write(&path, contents).with_context(|| format!("write {}", path.display()))
}
