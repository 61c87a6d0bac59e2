//! Adversarial test step: build the test set a candidate must survive.

use serde::Deserialize;
use tracing::info;

use crate::agents::{StepError, StepRunner};
use crate::core::recovery::SchemaKind;
use crate::core::types::{CodeArtifact, Language, Task, TestCase, TestSet};
use crate::io::model::{Model, Role};
use crate::io::prompt::PromptEngine;

#[derive(Debug, Deserialize)]
struct TestsPayload {
    tests: Vec<TestCase>,
}

/// Ask the adversary for cases against `artifact`, then append the task's
/// oracle cases.
pub fn create_tests<M: Model + ?Sized>(
    runner: &StepRunner<'_, M>,
    prompts: &PromptEngine,
    task: &Task,
    language: Language,
    artifact: &CodeArtifact,
    lessons: &[String],
) -> Result<TestSet, StepError> {
    let prompt = prompts.adversarial(task, language, artifact, lessons);
    let validated = runner.call_structured(Role::Adversary, &prompt, SchemaKind::Tests)?;
    let payload: TestsPayload = validated
        .decode()
        .map_err(|source| StepError::Malformed {
            role: Role::Adversary,
            source,
        })?;

    let adversarial_count = payload.tests.len();
    let mut cases = payload.tests;
    cases.extend(task.oracle.iter().cloned());
    info!(adversarial_count, oracle = task.oracle.len(), "created test set");
    Ok(TestSet {
        cases,
        adversarial_count,
    })
}
