//! Diagnosis step: explain a non-passing execution.
//!
//! A salvaged response only guarantees `root_cause`; the other fields fall
//! back to values derived from the execution outcome.

use serde_json::Value;
use tracing::info;

use crate::agents::{StepError, StepRunner};
use crate::core::recovery::{SchemaKind, Validated};
use crate::core::types::{
    CodeArtifact, Diagnosis, ExecutionOutcome, FailureCategory, IterationRecord, Language, Task,
};
use crate::io::model::{Model, Role};
use crate::io::prompt::PromptEngine;

const SALVAGED_STRATEGY: &str = "Fix the root cause above and re-check the failing cases.";

#[derive(Debug, Clone)]
pub struct DiagnosisResult {
    pub diagnosis: Diagnosis,
    pub salvaged: bool,
}

#[allow(clippy::too_many_arguments)]
pub fn diagnose<M: Model + ?Sized>(
    runner: &StepRunner<'_, M>,
    prompts: &PromptEngine,
    task: &Task,
    language: Language,
    artifact: &CodeArtifact,
    outcome: &ExecutionOutcome,
    failure: &str,
    history: &[IterationRecord],
) -> Result<DiagnosisResult, StepError> {
    let prompt = prompts.diagnose(task, language, artifact, failure, history);
    let validated = runner.call_structured(Role::Debugger, &prompt, SchemaKind::Diagnosis)?;
    let diagnosis = build_diagnosis(&validated, outcome);
    info!(
        category = %diagnosis.failure_category,
        confidence = ?diagnosis.confidence,
        salvaged = validated.salvaged,
        "diagnosed failure"
    );
    Ok(DiagnosisResult {
        diagnosis,
        salvaged: validated.salvaged,
    })
}

fn build_diagnosis(validated: &Validated, outcome: &ExecutionOutcome) -> Diagnosis {
    let category = validated
        .record
        .get("failure_category")
        .and_then(|v| serde_json::from_value::<FailureCategory>(v.clone()).ok())
        .filter(|c| FailureCategory::DIAGNOSABLE.contains(c))
        .unwrap_or_else(|| FailureCategory::from_outcome(outcome.tag));
    let repair_strategy = validated
        .str_field("repair_strategy")
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .unwrap_or(SALVAGED_STRATEGY)
        .to_string();
    Diagnosis {
        failure_category: category,
        root_cause: validated
            .str_field("root_cause")
            .unwrap_or_default()
            .trim()
            .to_string(),
        repair_strategy,
        confidence: validated
            .record
            .get("confidence")
            .and_then(Value::as_f64),
        stub: false,
    }
}
