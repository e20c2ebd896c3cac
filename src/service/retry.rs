//! Bounded exponential backoff for the optimistic commit loop.

use std::time::Duration;

/// Retry budget and backoff shape.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: usize,

    /// Delay before the first retry.
    pub initial_backoff: Duration,

    /// Cap on any single delay.
    pub max_backoff: Duration,

    /// Growth factor between consecutive delays.
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_secs(1),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Set the total number of attempts.
    pub fn with_max_attempts(mut self, max_attempts: usize) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Set the first and maximum delays.
    pub fn with_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.initial_backoff = initial;
        self.max_backoff = max;
        self
    }

    /// Start a fresh backoff sequence.
    pub fn backoff(&self) -> Backoff {
        Backoff {
            policy: self.clone(),
            retries: 0,
            delay: self.initial_backoff,
        }
    }
}

/// One run through a [`RetryPolicy`].
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: RetryPolicy,
    retries: usize,
    delay: Duration,
}

impl Backoff {
    /// Delay before the next attempt, or `None` once the budget is spent.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.retries + 1 >= self.policy.max_attempts {
            return None;
        }
        self.retries += 1;
        let delay = self.delay.min(self.policy.max_backoff);
        self.delay = self.delay.mul_f64(self.policy.multiplier).min(self.policy.max_backoff);
        Some(delay)
    }

    /// Retries taken so far.
    pub fn retries(&self) -> usize {
        self.retries
    }
}
