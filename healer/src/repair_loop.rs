//! Repair-loop orchestrator.
//!
//! Drives one task through generate → adversarial test → execute →
//! {success | diagnose → summarize} → decide until it succeeds, exhausts its
//! iteration budget or is cancelled. Steps run strictly one after another on
//! the calling thread. Step failures are absorbed into the iteration record;
//! only cancellation ends a run early.

use std::time::{Duration, Instant};

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, instrument, warn};

use crate::agents::adversary::create_tests;
use crate::agents::debugger::diagnose;
use crate::agents::generator::{RepairContext, generate};
use crate::agents::summarizer::ModelCompressor;
use crate::agents::{StepError, StepRunner};
use crate::core::ledger::{JoinCompressor, LessonLedger};
use crate::core::state::{IllegalTransition, LoopState, RunState, TransitionRecord};
use crate::core::types::{
    CodeArtifact, Diagnosis, FailureCategory, FinalOutcome, IterationRecord, Task,
};
use crate::io::config::{Compression, HealerConfig};
use crate::io::model::Model;
use crate::io::prompt::PromptEngine;
use crate::io::sandbox::{Sandbox, failure_summary};
use crate::progress::{ProgressChannel, ProgressEvent};

/// Everything a harness needs to audit a finished run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub task_id: String,
    pub outcome: FinalOutcome,
    /// One record per iteration, including malformed and timed-out ones.
    pub iterations: Vec<IterationRecord>,
    /// Ledger contents at the end of the run.
    pub lessons: Vec<String>,
    pub transitions: Vec<TransitionRecord>,
    /// Code of the last generated artifact.
    pub final_code: Option<String>,
    pub started_at: String,
    pub duration_ms: u64,
}

impl RunReport {
    pub fn diagnoses(&self) -> impl Iterator<Item = &Diagnosis> {
        self.iterations.iter().filter_map(|r| r.diagnosis.as_ref())
    }

    pub fn failure_categories(&self) -> Vec<FailureCategory> {
        self.iterations
            .iter()
            .filter_map(|r| r.failure_category)
            .collect()
    }
}

/// Input carried from a diagnosed iteration into the next generation.
#[derive(Debug, Clone)]
struct RepairInput {
    previous: CodeArtifact,
    diagnosis: Diagnosis,
    failure: String,
    from_iteration: u32,
}

impl RepairInput {
    fn context(&self) -> RepairContext<'_> {
        RepairContext {
            previous: &self.previous,
            diagnosis: &self.diagnosis,
            failure: &self.failure,
            from_iteration: self.from_iteration,
        }
    }
}

/// Runs tasks against one model and sandbox.
pub struct RepairLoop<'a, M: Model + ?Sized> {
    model: &'a M,
    sandbox: Sandbox,
    prompts: PromptEngine,
    config: HealerConfig,
    progress: Option<ProgressChannel>,
    cancel: CancellationToken,
}

impl<'a, M: Model + ?Sized> RepairLoop<'a, M> {
    pub fn new(model: &'a M, config: HealerConfig) -> Self {
        Self {
            model,
            sandbox: Sandbox::new(config.sandbox.clone()),
            prompts: PromptEngine::new(config.prompt.budget_bytes),
            config,
            progress: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_progress(mut self, progress: ProgressChannel) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Run `task` with at most `max_iterations` iterations.
    #[instrument(skip_all, fields(task = %task.id, max_iterations = max_iterations))]
    pub fn run_task(&self, task: &Task, max_iterations: u32) -> Result<RunReport, IllegalTransition> {
        let started_at = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
        let run_start = Instant::now();
        let runner = StepRunner::new(self.model, self.config.retry.clone(), self.cancel.clone());
        let mut run = RunState::new(max_iterations);
        let mut ledger = LessonLedger::new(self.config.ledger.capacity);
        let mut repair: Option<RepairInput> = None;
        let mut iteration_start = Instant::now();

        info!(language = task.language.as_str(), "starting run");
        self.publish(&run, "run started", json!({ "task_id": task.id }));

        while !run.state().is_terminal() {
            let _span = info_span!("state", iteration = run.iteration(), state = %run.state()).entered();
            if self.cancel.is_cancelled() {
                self.transition(&mut run, LoopState::Cancelled, "cancelled", Value::Null)?;
                break;
            }

            match run.state() {
                LoopState::Generate => {
                    let lessons = ledger.snapshot();
                    let result = generate(
                        &runner,
                        &self.prompts,
                        task,
                        task.language,
                        &lessons,
                        repair.as_ref().map(RepairInput::context),
                    );
                    match result {
                        Ok(generation) => {
                            let payload = json!({
                                "bytes": generation.artifact.code.len(),
                                "salvaged": generation.salvaged,
                                "repair": generation.artifact.repaired_from,
                            });
                            let record = run.current_mut();
                            record.salvage_recovered |= generation.salvaged;
                            record.artifact = Some(generation.artifact);
                            self.transition(&mut run, LoopState::AdversarialTest, "code generated", payload)?;
                        }
                        Err(err) => {
                            self.step_failed(&mut run, err, FailureCategory::GenerationMalformed)?;
                        }
                    }
                }
                LoopState::AdversarialTest => {
                    let Some(artifact) = run.current().artifact.clone() else {
                        return Err(IllegalTransition {
                            from: LoopState::AdversarialTest,
                            to: LoopState::Execute,
                        });
                    };
                    let lessons = ledger.snapshot();
                    match create_tests(&runner, &self.prompts, task, task.language, &artifact, &lessons) {
                        Ok(tests) => {
                            let payload = json!({
                                "cases": tests.len(),
                                "adversarial": tests.adversarial_count,
                            });
                            run.current_mut().tests = Some(tests);
                            self.transition(&mut run, LoopState::Execute, "tests created", payload)?;
                        }
                        Err(err) => {
                            self.step_failed(&mut run, err, FailureCategory::TestGenMalformed)?;
                        }
                    }
                }
                LoopState::Execute => {
                    let record = run.current();
                    let (Some(artifact), Some(tests)) = (&record.artifact, &record.tests) else {
                        return Err(IllegalTransition {
                            from: LoopState::Execute,
                            to: LoopState::Diagnose,
                        });
                    };
                    let budget = Duration::from_secs(self.config.sandbox.timeout_secs);
                    match self.sandbox.run(artifact, tests, task.language, budget, &self.cancel) {
                        Ok(outcome) => {
                            let passed = outcome.all_passed();
                            let payload = json!({
                                "tag": outcome.tag,
                                "passed": outcome.results.iter().filter(|r| r.passed).count(),
                                "failed": outcome.failed_results().count(),
                                "duration_ms": outcome.duration_ms,
                            });
                            run.current_mut().outcome = Some(outcome);
                            if passed {
                                self.transition(&mut run, LoopState::Success, "all tests passed", payload)?;
                            } else {
                                self.transition(&mut run, LoopState::Diagnose, "tests failed", payload)?;
                            }
                        }
                        Err(_) => {
                            self.transition(&mut run, LoopState::Cancelled, "cancelled during execution", Value::Null)?;
                        }
                    }
                }
                LoopState::Success => {
                    close_iteration(&mut run, &ledger, iteration_start);
                    self.transition(&mut run, LoopState::TerminatedSuccess, "task solved", Value::Null)?;
                }
                LoopState::Diagnose => {
                    let history_len = run.history().len() - 1;
                    let record = run.current();
                    let (Some(artifact), Some(tests), Some(outcome)) =
                        (&record.artifact, &record.tests, &record.outcome)
                    else {
                        return Err(IllegalTransition {
                            from: LoopState::Diagnose,
                            to: LoopState::Summarize,
                        });
                    };
                    let failure = failure_summary(outcome, tests);
                    let result = diagnose(
                        &runner,
                        &self.prompts,
                        task,
                        task.language,
                        artifact,
                        outcome,
                        &failure,
                        &run.history()[..history_len],
                    );
                    let (diagnosis, salvaged, step_error) = match result {
                        Ok(result) => (result.diagnosis, result.salvaged, None),
                        Err(err) if err.is_cancelled() => {
                            self.transition(&mut run, LoopState::Cancelled, "cancelled during diagnosis", Value::Null)?;
                            continue;
                        }
                        Err(err) => {
                            warn!(err = %err, "diagnosis failed, using stub");
                            (Diagnosis::stub(outcome), false, Some(err.to_string()))
                        }
                    };

                    repair = Some(RepairInput {
                        previous: artifact.clone(),
                        diagnosis: diagnosis.clone(),
                        failure,
                        from_iteration: run.iteration(),
                    });
                    let payload = json!({
                        "category": diagnosis.failure_category,
                        "root_cause": diagnosis.root_cause,
                        "stub": diagnosis.stub,
                    });
                    let record = run.current_mut();
                    record.salvage_recovered |= salvaged;
                    record.step_error = step_error;
                    record.failure_category = Some(diagnosis.failure_category);
                    record.diagnosis = Some(diagnosis);
                    self.transition(&mut run, LoopState::Summarize, "failure diagnosed", payload)?;
                }
                LoopState::Summarize => {
                    let lesson = run
                        .current()
                        .diagnosis
                        .as_ref()
                        .map(|d| d.lesson(self.config.ledger.max_entry_chars));
                    if let Some(lesson) = lesson {
                        self.record_lesson(&mut ledger, lesson, &runner);
                    }
                    let payload = json!({ "lessons": ledger.len() });
                    self.transition(&mut run, LoopState::Decide, "lesson recorded", payload)?;
                }
                LoopState::Decide => {
                    close_iteration(&mut run, &ledger, iteration_start);
                    if run.has_iterations_left() {
                        iteration_start = Instant::now();
                        self.transition(&mut run, LoopState::Generate, "repairing", Value::Null)?;
                    } else {
                        self.transition(&mut run, LoopState::TerminatedExhausted, "iterations exhausted", Value::Null)?;
                    }
                }
                LoopState::TerminatedSuccess | LoopState::TerminatedExhausted | LoopState::Cancelled => {}
            }
        }

        if run.state() == LoopState::Cancelled {
            close_iteration(&mut run, &ledger, iteration_start);
        }

        let outcome = run
            .state()
            .final_outcome()
            .unwrap_or(FinalOutcome::Cancelled);
        let transitions = run.transitions().to_vec();
        let iterations = run.into_history();
        let final_code = iterations
            .iter()
            .rev()
            .find_map(|r| r.artifact.as_ref().map(|a| a.code.clone()));
        info!(outcome = ?outcome, iterations = iterations.len(), "run finished");

        Ok(RunReport {
            task_id: task.id.clone(),
            outcome,
            iterations,
            lessons: ledger.snapshot(),
            transitions,
            final_code,
            started_at,
            duration_ms: u64::try_from(run_start.elapsed().as_millis()).unwrap_or(u64::MAX),
        })
    }

    fn record_lesson(&self, ledger: &mut LessonLedger, lesson: String, runner: &StepRunner<'_, M>) {
        let max_chars = self.config.ledger.max_entry_chars;
        match self.config.ledger.compression {
            Compression::Model => {
                let compressor = ModelCompressor::new(runner, &self.prompts, max_chars);
                ledger.append(lesson, &compressor);
            }
            Compression::Join => {
                ledger.append(lesson, &JoinCompressor { max_chars });
            }
        }
    }

    /// Absorb a generation or test-generation failure into the iteration and
    /// skip to `Decide`. Cancellation ends the run instead.
    fn step_failed(
        &self,
        run: &mut RunState,
        err: StepError,
        category: FailureCategory,
    ) -> Result<(), IllegalTransition> {
        if err.is_cancelled() {
            return self.transition(run, LoopState::Cancelled, "cancelled", Value::Null);
        }
        warn!(err = %err, category = %category, "step produced no usable output");
        let payload = json!({ "category": category, "error": err.to_string() });
        let record = run.current_mut();
        record.failure_category = Some(category);
        record.step_error = Some(err.to_string());
        self.transition(run, LoopState::Decide, "step output malformed", payload)
    }

    fn transition(
        &self,
        run: &mut RunState,
        to: LoopState,
        message: &str,
        payload: Value,
    ) -> Result<(), IllegalTransition> {
        run.advance(to)?;
        self.publish(run, message, payload);
        Ok(())
    }

    fn publish(&self, run: &RunState, message: &str, payload: Value) {
        if let Some(progress) = &self.progress {
            progress.publish(ProgressEvent {
                state: run.state(),
                iteration: run.iteration(),
                message: message.to_string(),
                payload,
            });
        }
    }
}

/// Convenience entry point: run one task with `config` and no observer.
pub fn run_task<M: Model + ?Sized>(
    model: &M,
    config: &HealerConfig,
    task: &Task,
    max_iterations: u32,
) -> Result<RunReport, IllegalTransition> {
    RepairLoop::new(model, config.clone()).run_task(task, max_iterations)
}

fn close_iteration(run: &mut RunState, ledger: &LessonLedger, started: Instant) {
    let record = run.current_mut();
    record.lessons = ledger.snapshot();
    record.duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
}
