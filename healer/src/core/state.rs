//! Repair-loop state machine: named states, the legal transition table and the
//! run-level aggregate the orchestrator owns.
//!
//! ```text
//! Generate → AdversarialTest → Execute → Success → TerminatedSuccess
//!                                      ↘ Diagnose → Summarize → Decide
//! Decide → Generate | TerminatedExhausted
//! Generate | AdversarialTest → Decide            (malformed step output)
//! any non-terminal state → Cancelled
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::types::{FinalOutcome, IterationRecord};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LoopState {
    Generate,
    AdversarialTest,
    Execute,
    Success,
    Diagnose,
    Summarize,
    Decide,
    TerminatedSuccess,
    TerminatedExhausted,
    Cancelled,
}

impl LoopState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            LoopState::TerminatedSuccess | LoopState::TerminatedExhausted | LoopState::Cancelled
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            LoopState::Generate => "GENERATE",
            LoopState::AdversarialTest => "ADVERSARIAL_TEST",
            LoopState::Execute => "EXECUTE",
            LoopState::Success => "SUCCESS",
            LoopState::Diagnose => "DIAGNOSE",
            LoopState::Summarize => "SUMMARIZE",
            LoopState::Decide => "DECIDE",
            LoopState::TerminatedSuccess => "TERMINATED_SUCCESS",
            LoopState::TerminatedExhausted => "TERMINATED_EXHAUSTED",
            LoopState::Cancelled => "CANCELLED",
        }
    }

    /// Final outcome for a terminal state.
    pub fn final_outcome(self) -> Option<FinalOutcome> {
        match self {
            LoopState::TerminatedSuccess => Some(FinalOutcome::Success),
            LoopState::TerminatedExhausted => Some(FinalOutcome::ExhaustedFailure),
            LoopState::Cancelled => Some(FinalOutcome::Cancelled),
            _ => None,
        }
    }
}

impl fmt::Display for LoopState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn is_legal_transition(from: LoopState, to: LoopState) -> bool {
    use LoopState::{
        AdversarialTest, Cancelled, Decide, Diagnose, Execute, Generate, Success, Summarize,
        TerminatedExhausted, TerminatedSuccess,
    };

    if to == Cancelled && !from.is_terminal() {
        return true;
    }

    matches!(
        (from, to),
        (Generate, AdversarialTest)
            | (Generate, Decide)
            | (AdversarialTest, Execute)
            | (AdversarialTest, Decide)
            | (Execute, Success)
            | (Execute, Diagnose)
            | (Success, TerminatedSuccess)
            | (Diagnose, Summarize)
            | (Summarize, Decide)
            | (Decide, Generate)
            | (Decide, TerminatedExhausted)
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("illegal transition {from} -> {to}")]
pub struct IllegalTransition {
    pub from: LoopState,
    pub to: LoopState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub from: LoopState,
    pub to: LoopState,
    pub iteration: u32,
}

/// Mutable aggregate for one task run. Only the orchestrator holds it mutably.
#[derive(Debug, Clone)]
pub struct RunState {
    state: LoopState,
    iteration: u32,
    max_iterations: u32,
    transitions: Vec<TransitionRecord>,
    history: Vec<IterationRecord>,
}

impl RunState {
    /// Start at `Generate` on iteration 1.
    pub fn new(max_iterations: u32) -> Self {
        let max_iterations = max_iterations.max(1);
        Self {
            state: LoopState::Generate,
            iteration: 1,
            max_iterations,
            transitions: Vec::new(),
            history: vec![IterationRecord::new(1)],
        }
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    pub fn iteration(&self) -> u32 {
        self.iteration
    }

    pub fn max_iterations(&self) -> u32 {
        self.max_iterations
    }

    pub fn transitions(&self) -> &[TransitionRecord] {
        &self.transitions
    }

    pub fn history(&self) -> &[IterationRecord] {
        &self.history
    }

    pub fn into_history(self) -> Vec<IterationRecord> {
        self.history
    }

    pub fn current(&self) -> &IterationRecord {
        // Invariant: history always holds the current iteration.
        &self.history[self.history.len() - 1]
    }

    pub fn current_mut(&mut self) -> &mut IterationRecord {
        let last = self.history.len() - 1;
        &mut self.history[last]
    }

    pub fn has_iterations_left(&self) -> bool {
        self.iteration < self.max_iterations
    }

    /// Move to `to`, recording the edge. Entering `Generate` from `Decide`
    /// opens the next iteration.
    pub fn advance(&mut self, to: LoopState) -> Result<(), IllegalTransition> {
        let from = self.state;
        if !is_legal_transition(from, to) {
            return Err(IllegalTransition { from, to });
        }
        if from == LoopState::Decide && to == LoopState::Generate {
            if !self.has_iterations_left() {
                return Err(IllegalTransition { from, to });
            }
            self.iteration += 1;
            self.history.push(IterationRecord::new(self.iteration));
        }
        self.transitions.push(TransitionRecord {
            from,
            to,
            iteration: self.iteration,
        });
        self.state = to;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn walk(state: &mut RunState, path: &[LoopState]) {
        for next in path {
            state.advance(*next).expect("legal transition");
        }
    }

    #[test]
    fn happy_path_reaches_success_on_first_iteration() {
        let mut state = RunState::new(4);
        walk(
            &mut state,
            &[
                LoopState::AdversarialTest,
                LoopState::Execute,
                LoopState::Success,
                LoopState::TerminatedSuccess,
            ],
        );
        assert_eq!(state.iteration(), 1);
        assert_eq!(state.history().len(), 1);
        assert_eq!(
            state.state().final_outcome(),
            Some(FinalOutcome::Success)
        );
    }

    #[test]
    fn decide_opens_next_iteration_until_budget_is_spent() {
        let mut state = RunState::new(2);
        walk(&mut state, &[LoopState::Decide, LoopState::Generate]);
        assert_eq!(state.iteration(), 2);
        assert_eq!(state.current().number, 2);

        walk(&mut state, &[LoopState::Decide]);
        let err = state.advance(LoopState::Generate).unwrap_err();
        assert_eq!(err.from, LoopState::Decide);
        state
            .advance(LoopState::TerminatedExhausted)
            .expect("exhaust");
        assert_eq!(state.history().len(), 2);
    }

    #[test]
    fn rejects_skipping_execution() {
        let mut state = RunState::new(4);
        let err = state.advance(LoopState::Success).unwrap_err();
        assert_eq!(
            err,
            IllegalTransition {
                from: LoopState::Generate,
                to: LoopState::Success
            }
        );
    }

    #[test]
    fn cancel_allowed_from_any_non_terminal_state_only() {
        let mut state = RunState::new(4);
        walk(&mut state, &[LoopState::AdversarialTest, LoopState::Cancelled]);
        assert!(state.state().is_terminal());
        assert!(state.advance(LoopState::Cancelled).is_err());
    }

    #[test]
    fn zero_budget_is_clamped_to_one_iteration() {
        let state = RunState::new(0);
        assert_eq!(state.max_iterations(), 1);
        assert!(!state.has_iterations_left());
    }

    #[test]
    fn transitions_record_iteration_numbers() {
        let mut state = RunState::new(3);
        walk(
            &mut state,
            &[LoopState::Decide, LoopState::Generate, LoopState::AdversarialTest],
        );
        let iterations: Vec<u32> = state.transitions().iter().map(|t| t.iteration).collect();
        assert_eq!(iterations, vec![1, 2, 2]);
    }
}
