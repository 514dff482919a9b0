//! Bounded retry for transient failures.

use std::thread;
use std::time::Duration;

use tracing::warn;

use mcluster_common::{McError, McResult};

/// How many times an operation may run and how long to wait in between.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first. Zero behaves like one.
    pub max_attempts: u32,
    /// Pause between attempts.
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: 2,
            backoff: Duration::ZERO,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff: Duration) -> Self {
        RetryPolicy {
            max_attempts,
            backoff,
        }
    }

    /// Returns true when a failed attempt number `attempts_made` may be retried.
    pub fn should_retry(&self, attempts_made: u32, err: &McError) -> bool {
        err.is_transient() && attempts_made < self.max_attempts.max(1)
    }

    /// Runs `op` until it succeeds, fails permanently, or attempts run out.
    ///
    /// `op` receives the 1-based attempt number. The last error is surfaced
    /// unchanged.
    pub fn run<T, F>(&self, mut op: F) -> McResult<T>
    where
        F: FnMut(u32) -> McResult<T>,
    {
        let mut attempt = 1;
        loop {
            match op(attempt) {
                Ok(value) => return Ok(value),
                Err(err) if self.should_retry(attempt, &err) => {
                    warn!(attempt, error = %err, "transient failure, retrying");
                    if !self.backoff.is_zero() {
                        thread::sleep(self.backoff);
                    }
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}
