//! Generation step: produce a fresh or repaired code artifact.

use tracing::info;

use crate::agents::{StepError, StepRunner};
use crate::core::recovery::SchemaKind;
use crate::core::types::{CodeArtifact, Diagnosis, Language, Task};
use crate::io::model::{Model, Role};
use crate::io::prompt::PromptEngine;

/// What the generator sees when repairing an earlier attempt.
#[derive(Debug, Clone, Copy)]
pub struct RepairContext<'a> {
    pub previous: &'a CodeArtifact,
    pub diagnosis: &'a Diagnosis,
    /// Failure summary of the previous execution.
    pub failure: &'a str,
    /// Iteration that produced `diagnosis`.
    pub from_iteration: u32,
}

#[derive(Debug, Clone)]
pub struct Generation {
    pub artifact: CodeArtifact,
    /// True when the code field was salvaged from malformed output.
    pub salvaged: bool,
}

pub fn generate<M: Model + ?Sized>(
    runner: &StepRunner<'_, M>,
    prompts: &PromptEngine,
    task: &Task,
    language: Language,
    lessons: &[String],
    repair: Option<RepairContext<'_>>,
) -> Result<Generation, StepError> {
    let prompt = match repair {
        Some(ctx) => prompts.generate_repair(
            task,
            language,
            ctx.previous,
            ctx.diagnosis,
            ctx.failure,
            lessons,
        ),
        None => prompts.generate_initial(task, language, lessons),
    };

    let validated = runner.call_structured(Role::Generator, &prompt, SchemaKind::Generation)?;
    let code = validated.str_field("code").unwrap_or_default().to_string();
    let explanation = validated
        .str_field("explanation")
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string);

    info!(
        bytes = code.len(),
        repair = repair.is_some(),
        salvaged = validated.salvaged,
        "generated code"
    );
    Ok(Generation {
        artifact: CodeArtifact {
            code,
            explanation,
            repaired_from: repair.map(|ctx| ctx.from_iteration),
            lessons_seen: lessons.to_vec(),
        },
        salvaged: validated.salvaged,
    })
}
