//! Bounded retry around produce-and-validate.

use std::future::Future;
use std::time::Instant;

use tracing::warn;

use loom_contracts::error::{LoomError, LoomResult};

/// How often an executor may re-run a failed attempt.
///
/// Only retryable errors (output validation failures) are retried. When
/// the budget runs out, or the caller's deadline has passed, the last
/// failure is reported as `UnexpectedResponseFormat`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub deadline: Option<Instant>,
}

impl RetryPolicy {
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            deadline: None,
        }
    }

    pub fn with_deadline(mut self, deadline: Option<Instant>) -> Self {
        self.deadline = deadline;
        self
    }

    /// Total attempts allowed.
    pub fn attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    fn past_deadline(&self) -> bool {
        self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// Run `attempt` (called with 1, 2, …) until it succeeds, fails with a
    /// non-retryable error, or the budget is spent.
    pub async fn run<T, F, Fut>(&self, agent: &str, mut attempt: F) -> LoomResult<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = LoomResult<T>>,
    {
        let mut n = 0;
        loop {
            n += 1;
            let err = match attempt(n).await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retryable() => err,
                Err(err) => return Err(err),
            };

            if n < self.attempts() && !self.past_deadline() {
                warn!(agent = %agent, attempt = n, error = %err, "attempt failed validation; retrying");
                continue;
            }
            return Err(LoomError::UnexpectedResponseFormat {
                agent: agent.to_string(),
                attempts: n,
                reason: err.to_string(),
            });
        }
    }
}
