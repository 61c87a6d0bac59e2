//! Ledger compression backed by the summarizer model.

use serde_json::Value;
use tracing::{debug, warn};

use crate::agents::StepRunner;
use crate::core::ledger::{Compressor, JoinCompressor};
use crate::core::recovery::SchemaKind;
use crate::core::types::{one_line, truncate_chars};
use crate::io::model::{Model, Role};
use crate::io::prompt::PromptEngine;

/// Merges surplus lessons with the model; any failure falls back to a plain join.
pub struct ModelCompressor<'a, M: Model + ?Sized> {
    runner: &'a StepRunner<'a, M>,
    prompts: &'a PromptEngine,
    fallback: JoinCompressor,
}

impl<'a, M: Model + ?Sized> ModelCompressor<'a, M> {
    pub fn new(runner: &'a StepRunner<'a, M>, prompts: &'a PromptEngine, max_chars: usize) -> Self {
        Self {
            runner,
            prompts,
            fallback: JoinCompressor { max_chars },
        }
    }
}

impl<M: Model + ?Sized> Compressor for ModelCompressor<'_, M> {
    fn compress(&self, entries: &[String]) -> String {
        let prompt = self.prompts.summarize(entries);
        let validated =
            match self
                .runner
                .call_structured(Role::Summarizer, &prompt, SchemaKind::Summary)
            {
                Ok(validated) => validated,
                Err(err) => {
                    warn!(err = %err, "summarizer failed, joining lessons");
                    return self.fallback.compress(entries);
                }
            };

        let lessons: Vec<String> = validated
            .record
            .get("lessons")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(one_line)
                    .filter(|s| !s.is_empty())
                    .collect()
            })
            .unwrap_or_default();
        if lessons.is_empty() {
            warn!("summarizer returned no lessons, joining lessons");
            return self.fallback.compress(entries);
        }

        debug!(merged = entries.len(), into = lessons.len(), "compressed lessons");
        truncate_chars(&lessons.join("; "), self.fallback.max_chars)
    }
}
