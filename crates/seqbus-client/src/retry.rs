//! Backoff and retry budgets.
//!
//! The puller keeps two independent [`RetryPolicy`] instances: one for
//! send-side failures, one for response-side failures. A successful full
//! protocol cycle resets both.

use rand::Rng;
use std::time::Duration;

/// Exponential backoff with jitter plus a retry budget.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    init_sleep: Duration,
    max_sleep: Duration,
    multiplier: f64,
    jitter: f64,
    max_retries: u32,
    attempts: u32,
}

impl RetryPolicy {
    /// Create a policy.
    pub fn new(
        init_sleep: Duration,
        max_sleep: Duration,
        multiplier: f64,
        jitter: f64,
        max_retries: u32,
    ) -> Self {
        Self {
            init_sleep,
            max_sleep,
            multiplier,
            jitter,
            max_retries,
            attempts: 0,
        }
    }

    /// Record one failure. Returns `false` once the budget is exceeded.
    pub fn record_failure(&mut self) -> bool {
        self.attempts += 1;
        self.attempts <= self.max_retries
    }

    /// Failures recorded since the last reset.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// True once more failures were recorded than the budget allows.
    pub fn exhausted(&self) -> bool {
        self.attempts > self.max_retries
    }

    /// Sleep duration for the current attempt count, with jitter applied.
    pub fn next_sleep(&self) -> Duration {
        let exp = self.attempts.saturating_sub(1).min(32);
        let base = self.init_sleep.as_millis() as f64 * self.multiplier.powi(exp as i32);
        let capped = base.min(self.max_sleep.as_millis() as f64);
        let jittered = if self.jitter > 0.0 {
            let spread = capped * self.jitter;
            let offset = rand::thread_rng().gen_range(-spread..=spread);
            (capped + offset).max(0.0)
        } else {
            capped
        };
        Duration::from_millis(jittered as u64)
    }

    /// Forget all recorded failures.
    pub fn reset(&mut self) {
        self.attempts = 0;
    }
}
