//! Retry policy with capped exponential backoff.

use std::{future::Future, time::Duration};

use tracing::debug;

use crate::error::Error;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Total number of attempts, including the first. Zero behaves like one.
    pub times: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub factor: f64,
}

impl RetryPolicy {
    pub const fn new(times: u32, initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            times,
            initial_delay,
            max_delay,
            factor: 2.0,
        }
    }

    /// Retries until success; used where dissemination matters more than latency.
    pub const fn unlimited() -> Self {
        Self::new(u32::MAX, Duration::from_millis(100), Duration::from_secs(1))
    }

    /// A single attempt with no retries.
    pub const fn once() -> Self {
        Self::new(1, Duration::ZERO, Duration::ZERO)
    }

    pub fn is_unlimited(&self) -> bool {
        self.times == u32::MAX
    }

    /// Delay to sleep before attempt number `attempt + 1`, where `attempt` >= 1.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let scaled = self.initial_delay.as_secs_f64() * self.factor.powi(exponent);
        if !scaled.is_finite() || scaled >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        Duration::from_secs_f64(scaled)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_millis(100), Duration::from_secs(1))
    }
}

/// Runs `operation` until it succeeds, fails with a non-retryable error, or the
/// policy's attempt budget is spent. The attempt number (1-based) is passed in.
pub async fn retry<T, F, Fut>(policy: RetryPolicy, mut operation: F) -> Result<T, Error>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, Error>>,
{
    let attempts = policy.times.max(1);
    let mut attempt = 1;
    loop {
        match operation(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() && attempt < attempts => {
                let delay = policy.delay_after(attempt);
                debug!(attempt, ?delay, error = %err, "retrying operation");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}
