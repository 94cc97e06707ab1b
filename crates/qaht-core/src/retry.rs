//! Bounded retries with exponential backoff and optional jitter.

use std::future::Future;
use std::time::Duration;

use crate::config::ResilienceConfig;
use crate::error::CallError;

/// Backoff strategy between attempts.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Backoff {
    Fixed {
        delay: Duration,
    },
    /// `base * factor^(attempt - 1)`, capped at `max`.
    Exponential {
        base: Duration,
        factor: f64,
        max: Duration,
        /// Spread each delay by +/- 50%.
        jitter: bool,
    },
}

impl Default for Backoff {
    fn default() -> Self {
        Self::Exponential {
            base: Duration::from_secs(1),
            factor: 2.0,
            max: Duration::from_secs(60),
            jitter: false,
        }
    }
}

impl Backoff {
    /// Delay to sleep after the given failed attempt (1-based).
    pub fn delay(self, attempt: u32) -> Duration {
        match self {
            Self::Fixed { delay } => delay,
            Self::Exponential {
                base,
                factor,
                max,
                jitter,
            } => {
                let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
                let seconds = base.as_secs_f64() * factor.powi(exponent);
                let capped = if seconds.is_finite() {
                    seconds.min(max.as_secs_f64())
                } else {
                    max.as_secs_f64()
                };
                let delay = Duration::from_secs_f64(capped.max(0.0));

                if jitter {
                    let jitter_ms = (delay.as_millis() as f64 * 0.5) as u64;
                    let offset = fastrand::u64(0..=(jitter_ms * 2));
                    let total_ms = delay.as_millis() as i64 + offset as i64 - jitter_ms as i64;
                    Duration::from_millis(total_ms.max(0) as u64)
                } else {
                    delay
                }
            }
        }
    }
}

/// Final failure after the policy stopped retrying.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryError {
    pub attempts: u32,
    pub last_error: CallError,
}

/// Retries transient failures up to `max_attempts` attempts in total.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&ResilienceConfig::default())
    }
}

impl From<&ResilienceConfig> for RetryPolicy {
    fn from(config: &ResilienceConfig) -> Self {
        Self {
            max_attempts: config.max_retries.max(1),
            backoff: Backoff::Exponential {
                base: Duration::from_secs_f64(config.base_delay_secs),
                factor: config.backoff_factor,
                max: Duration::from_secs_f64(config.max_backoff_secs),
                jitter: config.jitter,
            },
        }
    }
}

impl RetryPolicy {
    pub fn exponential(max_attempts: u32, base: Duration, factor: f64) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff: Backoff::Exponential {
                base,
                factor,
                max: Duration::from_secs(60),
                jitter: false,
            },
        }
    }

    /// Single attempt, never retried.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            backoff: Backoff::Fixed {
                delay: Duration::ZERO,
            },
        }
    }

    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        self.backoff.delay(attempt)
    }

    /// Runs `operation` (given the 1-based attempt number) until it
    /// succeeds, fails with a non-retryable kind, or attempts run out.
    ///
    /// The backoff sleep is a plain tokio sleep, so dropping the returned
    /// future aborts the wait immediately.
    pub async fn execute<T, F, Fut>(&self, mut operation: F) -> Result<T, RetryError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, CallError>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            let error = match operation(attempt).await {
                Ok(value) => return Ok(value),
                Err(error) => error,
            };

            if !error.retryable() {
                return Err(RetryError {
                    attempts: attempt,
                    last_error: error,
                });
            }

            if attempt >= max_attempts {
                tracing::error!(
                    attempts = attempt,
                    error = %error,
                    "retries exhausted"
                );
                return Err(RetryError {
                    attempts: attempt,
                    last_error: error,
                });
            }

            let delay = self.delay_for_attempt(attempt);
            tracing::debug!(
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "transient failure, retrying"
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}
