//! Retry executor.
//!
//! Runs an attempt until it succeeds, fails fatally, or the deadline passes.
//! The executor never inspects errors: each attempt classifies its own
//! failure and returns the matching [`Outcome`].

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{ReconcileError, ReconcileResult};
use crate::shutdown::ShutdownSignal;

/// Default delay between attempts.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Directive returned by one attempt.
#[derive(Debug)]
pub enum Outcome<T> {
    /// Stop retrying and return the value.
    Success(T),

    /// Transient failure; try again after the retry delay.
    Retry,

    /// Fatal failure; return the error immediately.
    Fail(ReconcileError),
}

/// Executes retryable operations with a fixed delay between attempts.
#[derive(Debug, Clone)]
pub struct RetryExecutor {
    delay: Duration,
}

impl RetryExecutor {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }

    /// Run `attempt` until it succeeds, fails, or `timeout` elapses.
    ///
    /// The first attempt starts immediately. `attempt` receives the 1-based
    /// attempt number. An attempt that is still running (for example blocked
    /// on a lock) when the deadline passes is abandoned.
    pub async fn run<T, F, Fut>(
        &self,
        description: &str,
        timeout: Duration,
        shutdown: &ShutdownSignal,
        mut attempt: F,
    ) -> ReconcileResult<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Outcome<T>>,
    {
        let deadline = Instant::now() + timeout;
        let mut attempts = 0u32;

        debug!(
            operation = description,
            retry_delay_ms = self.delay.as_millis() as u64,
            timeout_secs = timeout.as_secs(),
            "Will attempt operation until successful"
        );

        loop {
            attempts += 1;
            debug!(operation = description, attempt = attempts, "Performing attempt");

            let outcome = tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    return Err(ReconcileError::Cancelled(format!("retrying {description}")));
                }
                result = tokio::time::timeout_at(deadline, attempt(attempts)) => match result {
                    Ok(outcome) => outcome,
                    Err(_) => return Err(Self::timed_out(description, timeout, attempts)),
                },
            };

            match outcome {
                Outcome::Success(value) => {
                    info!(
                        operation = description,
                        attempts, "Operation successful"
                    );
                    return Ok(value);
                }
                Outcome::Fail(err) => {
                    warn!(
                        operation = description,
                        attempt = attempts,
                        error = %err,
                        "Attempt failed"
                    );
                    return Err(err);
                }
                Outcome::Retry => {
                    let next_attempt = Instant::now() + self.delay;
                    if next_attempt >= deadline {
                        if !shutdown.sleep_until(deadline).await {
                            return Err(ReconcileError::Cancelled(format!(
                                "retrying {description}"
                            )));
                        }
                        return Err(Self::timed_out(description, timeout, attempts));
                    }

                    info!(
                        operation = description,
                        attempt = attempts,
                        "Attempt marked for retry"
                    );

                    if !shutdown.sleep_until(next_attempt).await {
                        return Err(ReconcileError::Cancelled(format!(
                            "retrying {description}"
                        )));
                    }
                }
            }
        }
    }

    fn timed_out(description: &str, timeout: Duration, attempts: u32) -> ReconcileError {
        warn!(
            operation = description,
            timeout_secs = timeout.as_secs(),
            attempts,
            "Operation timed out"
        );
        ReconcileError::Timeout {
            operation: description.to_string(),
            timeout,
            attempts,
        }
    }
}

impl Default for RetryExecutor {
    fn default() -> Self {
        Self::new(DEFAULT_RETRY_DELAY)
    }
}
