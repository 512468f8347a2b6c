//! Exponential backoff policy shared by the engine and the binder.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Bounded exponential backoff
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts including the first one (minimum 1)
    pub max_attempts: u32,
    /// Delay before the second attempt, in milliseconds
    pub initial_backoff_ms: u64,
    /// Upper bound on any single delay, in milliseconds
    pub max_backoff_ms: u64,
    /// Growth factor between consecutive delays
    pub multiplier: f64,
}

impl RetryPolicy {
    /// Create a policy with the given attempt budget and default delays
    #[must_use]
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            ..Self::default()
        }
    }

    /// Policy that never retries
    #[must_use]
    pub fn no_retry() -> Self {
        Self::new(1)
    }

    /// Set the initial backoff
    #[must_use]
    pub fn with_initial_backoff(mut self, backoff: Duration) -> Self {
        self.initial_backoff_ms = backoff.as_millis() as u64;
        self
    }

    /// Set the maximum backoff
    #[must_use]
    pub fn with_max_backoff(mut self, backoff: Duration) -> Self {
        self.max_backoff_ms = backoff.as_millis() as u64;
        self
    }

    /// Set the multiplier
    #[must_use]
    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    /// Attempt budget, never below one
    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }

    /// Delay to wait after the given failed attempt (1-based)
    #[must_use]
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32) as i32;
        let factor = self.multiplier.max(1.0).powi(exponent);
        let millis = (self.initial_backoff_ms as f64 * factor).min(self.max_backoff_ms as f64);
        Duration::from_millis(millis as u64)
    }

    /// Whether another attempt is allowed after `attempt` failures
    #[must_use]
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.attempts()
    }

    /// Sum of every delay the policy can impose; one "retry window"
    #[must_use]
    pub fn window(&self) -> Duration {
        (1..self.attempts()).map(|a| self.backoff_for(a)).sum()
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff_ms: 200,
            max_backoff_ms: 10_000,
            multiplier: 2.0,
        }
    }
}
