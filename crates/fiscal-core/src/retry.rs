//! # Retry Budget
//!
//! How many times, and how patiently, a transient authority failure is
//! retried before it is escalated. The budget is plain data handed to the
//! pipeline, batcher and notifier, so tests can pass [`RetryPolicy::immediate`]
//! and never sleep.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Retry budget for one logical authority operation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts, including the first one. Always at least 1.
    pub max_attempts: u32,
    /// Wait before the second attempt.
    pub initial_interval: Duration,
    /// Upper bound for any single wait.
    pub max_interval: Duration,
    /// Growth factor between consecutive waits.
    pub multiplier: f64,
    /// Bound on a single authority call; exceeding it counts as unreachable.
    pub attempt_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: 3,
            initial_interval: Duration::from_secs(2),
            max_interval: Duration::from_secs(10),
            multiplier: 2.0,
            attempt_timeout: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    /// No waiting between attempts.
    pub fn immediate(max_attempts: u32) -> Self {
        RetryPolicy {
            max_attempts: max_attempts.max(1),
            initial_interval: Duration::ZERO,
            max_interval: Duration::ZERO,
            multiplier: 1.0,
            attempt_timeout: Duration::from_secs(5),
        }
    }

    /// A single attempt, never retried.
    pub fn single_attempt() -> Self {
        Self::immediate(1)
    }

    pub fn with_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = timeout;
        self
    }

    /// Returns true if attempt number `attempt` (1-based) is still in budget.
    pub fn allows_attempt(&self, attempt: u32) -> bool {
        attempt >= 1 && attempt <= self.max_attempts.max(1)
    }

    /// Returns true if the budget holds at least one retry.
    pub fn retries(&self) -> bool {
        self.max_attempts > 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_budget() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 3);
        assert!(policy.allows_attempt(1));
        assert!(policy.allows_attempt(3));
        assert!(!policy.allows_attempt(4));
        assert!(!policy.allows_attempt(0));
    }

    #[test]
    fn test_immediate_never_waits() {
        let policy = RetryPolicy::immediate(0);
        assert_eq!(policy.max_attempts, 1);
        assert_eq!(policy.initial_interval, Duration::ZERO);
        assert!(!policy.retries());
        assert!(RetryPolicy::immediate(4).retries());
    }
}
