//! Model-backed repair steps.
//!
//! Every step goes through [`StepRunner::call_structured`]: provider errors are
//! retried with bounded backoff, the response is run through structured output
//! recovery, and cancellation is honoured between attempts and during waits.

use std::thread;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::core::backoff::RetryPolicy;
use crate::core::recovery::{RecoveryError, SchemaKind, Validated, validate};
use crate::core::types::Cancelled;
use crate::io::model::{Model, ModelError, Prompt, Role};

pub mod adversary;
pub mod debugger;
pub mod generator;
pub mod summarizer;

/// Temperature added per retry to move away from a degenerate response.
const RETRY_TEMPERATURE_STEP: f32 = 0.1;

/// Granularity of cancellation checks while waiting between attempts.
const WAIT_SLICE: Duration = Duration::from_millis(25);

/// Why a step produced nothing usable.
#[derive(Debug, Error)]
pub enum StepError {
    #[error("{role} provider failed after {attempts} attempt(s): {source}")]
    Provider {
        role: Role,
        attempts: u32,
        #[source]
        source: ModelError,
    },
    #[error("{role} output rejected: {source}")]
    Malformed {
        role: Role,
        #[source]
        source: RecoveryError,
    },
    #[error(transparent)]
    Cancelled(#[from] Cancelled),
}

impl StepError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, StepError::Cancelled(_))
    }
}

/// Shared call policy for one run: the model, its retry budget and the run's
/// cancellation token.
pub struct StepRunner<'a, M: Model + ?Sized> {
    model: &'a M,
    retry: RetryPolicy,
    cancel: CancellationToken,
}

impl<'a, M: Model + ?Sized> StepRunner<'a, M> {
    pub fn new(model: &'a M, retry: RetryPolicy, cancel: CancellationToken) -> Self {
        Self {
            model,
            retry,
            cancel,
        }
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Call the model for `role` and recover a record matching `kind`.
    ///
    /// Schema failures are not retried; the response is what it is.
    #[instrument(skip_all, fields(role = %role, schema = %kind))]
    pub fn call_structured(
        &self,
        role: Role,
        prompt: &Prompt,
        kind: SchemaKind,
    ) -> Result<Validated, StepError> {
        let attempts = self.retry.max_attempts.max(1);
        let mut last_error = None;

        for attempt in 0..attempts {
            self.check_cancelled()?;
            let mut request = prompt.clone();
            #[allow(clippy::cast_precision_loss)]
            let bump = RETRY_TEMPERATURE_STEP * attempt as f32;
            request.temperature = (prompt.temperature + bump).min(1.0);

            match self.model.complete(role, &request) {
                Ok(raw) => {
                    self.check_cancelled()?;
                    debug!(attempt, bytes = raw.len(), "model responded");
                    return validate(&raw, kind.schema())
                        .map_err(|source| StepError::Malformed { role, source });
                }
                Err(err) => {
                    self.check_cancelled()?;
                    warn!(attempt, err = %err, "model call failed");
                    last_error = Some(err);
                    match self.retry.delay_after(attempt) {
                        Some(delay) => self.wait(delay)?,
                        None => break,
                    }
                }
            }
        }

        Err(StepError::Provider {
            role,
            attempts,
            source: last_error
                .unwrap_or_else(|| ModelError::Unavailable("no attempt was made".to_string())),
        })
    }

    fn check_cancelled(&self) -> Result<(), Cancelled> {
        if self.cancel.is_cancelled() {
            return Err(Cancelled);
        }
        Ok(())
    }

    /// Sleep for `delay`, waking early with `Cancelled` if the run is aborted.
    fn wait(&self, delay: Duration) -> Result<(), Cancelled> {
        let deadline = Instant::now() + delay;
        loop {
            self.check_cancelled()?;
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(());
            }
            thread::sleep(remaining.min(WAIT_SLICE));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{ScriptedModel, generation_json};

    fn prompt() -> Prompt {
        Prompt::new(Role::Generator, "s".to_string(), "u".to_string())
    }

    #[test]
    fn retries_provider_errors_then_succeeds() {
        let model = ScriptedModel::new()
            .fail(Role::Generator, ModelError::Provider("503".to_string()))
            .respond(Role::Generator, generation_json("x = 1"));
        let runner = StepRunner::new(&model, RetryPolicy::immediate(3), CancellationToken::new());

        let validated = runner
            .call_structured(Role::Generator, &prompt(), SchemaKind::Generation)
            .expect("second attempt succeeds");
        assert_eq!(validated.str_field("code"), Some("x = 1"));

        let calls = model.calls();
        assert_eq!(calls.len(), 2);
        assert!(calls[1].prompt.temperature > calls[0].prompt.temperature);
    }

    #[test]
    fn exhausted_retries_escalate_as_provider_error() {
        let model = ScriptedModel::new();
        for _ in 0..3 {
            model.push_error(Role::Debugger, ModelError::Timeout(Duration::from_secs(1)));
        }
        let runner = StepRunner::new(&model, RetryPolicy::immediate(3), CancellationToken::new());

        let err = runner
            .call_structured(Role::Debugger, &prompt(), SchemaKind::Diagnosis)
            .expect_err("should fail");
        assert!(matches!(err, StepError::Provider { attempts: 3, .. }));
        assert_eq!(model.calls().len(), 3);
    }

    #[test]
    fn schema_failure_is_not_retried() {
        let model = ScriptedModel::new()
            .respond(Role::Adversary, r#"{"tests": []}"#)
            .respond(Role::Adversary, r#"{"tests": []}"#);
        let runner = StepRunner::new(&model, RetryPolicy::immediate(3), CancellationToken::new());

        let err = runner
            .call_structured(Role::Adversary, &prompt(), SchemaKind::Tests)
            .expect_err("should fail");
        assert!(matches!(err, StepError::Malformed { .. }));
        assert_eq!(model.calls().len(), 1);
    }

    #[test]
    fn cancellation_interrupts_backoff_wait() {
        let model = ScriptedModel::new()
            .fail(Role::Generator, ModelError::Provider("down".to_string()))
            .respond(Role::Generator, generation_json("x = 1"));
        let token = CancellationToken::new();
        let policy = RetryPolicy {
            max_attempts: 3,
            initial_delay_ms: 10_000,
            multiplier: 1,
            max_delay_ms: 10_000,
        };
        let runner = StepRunner::new(&model, policy, token.clone());

        let canceller = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            token.cancel();
        });
        let started = Instant::now();
        let err = runner
            .call_structured(Role::Generator, &prompt(), SchemaKind::Generation)
            .expect_err("cancelled");
        canceller.join().expect("join");

        assert!(err.is_cancelled());
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(model.calls().len(), 1);
    }
}
