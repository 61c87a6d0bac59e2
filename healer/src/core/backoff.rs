//! Bounded exponential backoff for model calls.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Retry policy for transient provider errors.
///
/// Attempt `n` (0-based) waits `initial_delay * multiplier^(n)` before the
/// next attempt, capped at `max_delay`. No wait follows the last attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub multiplier: u32,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 500,
            multiplier: 2,
            max_delay_ms: 4_000,
        }
    }
}

impl RetryPolicy {
    /// Policy that retries without waiting. Used by tests.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay_ms: 0,
            multiplier: 1,
            max_delay_ms: 0,
        }
    }

    /// Delay after failed attempt `attempt` (0-based), or `None` when no attempts remain.
    pub fn delay_after(&self, attempt: u32) -> Option<Duration> {
        if attempt + 1 >= self.max_attempts {
            return None;
        }
        let factor = u64::from(self.multiplier).saturating_pow(attempt);
        let millis = self
            .initial_delay_ms
            .saturating_mul(factor)
            .min(self.max_delay_ms);
        Some(Duration::from_millis(millis))
    }
}
