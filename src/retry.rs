//! Retry strategies for event delivery and transient storage failures
//!
//! A [`RetryStrategy`] decides whether, and after how long, a failed
//! operation is attempted again. The subscription models wrap every handler
//! invocation (including the follow-up position persistence) in a strategy,
//! and stop retrying as soon as the owning model shuts down.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::warn;

/// Decides the delay before each retry attempt
#[derive(Debug, Clone, PartialEq)]
pub enum RetryStrategy {
    /// Never retry; the first failure surfaces immediately
    None,

    /// Retry with a constant delay
    Fixed {
        /// Delay between attempts
        delay: Duration,
        /// Total attempts allowed; `None` retries indefinitely
        max_attempts: Option<u32>,
    },

    /// Retry with exponentially growing delays
    Exponential {
        /// Delay before the first retry
        initial: Duration,
        /// Upper bound on the delay
        max: Duration,
        /// Factor applied to the delay after each attempt
        multiplier: f64,
        /// Randomize each delay uniformly in `0..=delay` (full jitter)
        jitter: bool,
        /// Total attempts allowed; `None` retries indefinitely
        max_attempts: Option<u32>,
    },
}

impl RetryStrategy {
    /// Retry forever with a constant delay.
    pub fn fixed(delay: Duration) -> Self {
        RetryStrategy::Fixed {
            delay,
            max_attempts: None,
        }
    }

    /// Retry forever with exponentially growing delays and no jitter.
    pub fn exponential(initial: Duration, max: Duration, multiplier: f64) -> Self {
        RetryStrategy::Exponential {
            initial,
            max,
            multiplier,
            jitter: false,
            max_attempts: None,
        }
    }

    /// Limit the total number of attempts (first call included).
    pub fn with_max_attempts(self, attempts: u32) -> Self {
        match self {
            RetryStrategy::None => RetryStrategy::None,
            RetryStrategy::Fixed { delay, .. } => RetryStrategy::Fixed {
                delay,
                max_attempts: Some(attempts),
            },
            RetryStrategy::Exponential {
                initial,
                max,
                multiplier,
                jitter,
                ..
            } => RetryStrategy::Exponential {
                initial,
                max,
                multiplier,
                jitter,
                max_attempts: Some(attempts),
            },
        }
    }

    /// Randomize exponential delays uniformly in `0..=delay`.
    pub fn with_jitter(self) -> Self {
        match self {
            RetryStrategy::Exponential {
                initial,
                max,
                multiplier,
                max_attempts,
                ..
            } => RetryStrategy::Exponential {
                initial,
                max,
                multiplier,
                jitter: true,
                max_attempts,
            },
            other => other,
        }
    }

    /// The delay before retry number `attempt` (1-based), or `None` when the
    /// strategy gives up.
    pub fn backoff(&self, attempt: u32) -> Option<Duration> {
        match self {
            RetryStrategy::None => None,
            RetryStrategy::Fixed {
                delay,
                max_attempts,
            } => {
                if exhausted(*max_attempts, attempt) {
                    None
                } else {
                    Some(*delay)
                }
            }
            RetryStrategy::Exponential {
                initial,
                max,
                multiplier,
                jitter,
                max_attempts,
            } => {
                if exhausted(*max_attempts, attempt) {
                    return None;
                }

                let factor = multiplier.powi(attempt.saturating_sub(1) as i32);
                let unclamped = initial.as_secs_f64() * factor;
                let mut delay = Duration::from_secs_f64(unclamped.min(max.as_secs_f64()));

                if *jitter && !delay.is_zero() {
                    delay = rand::thread_rng().gen_range(Duration::ZERO..=delay);
                }

                Some(delay)
            }
        }
    }

    /// Run `operation` until it succeeds, the strategy gives up, or
    /// `should_abort` returns true.
    ///
    /// `retryable` filters which errors are retried at all; the final error
    /// is returned unchanged.
    pub async fn execute_with<T, E, Op, Fut, P, A>(
        &self,
        mut operation: Op,
        retryable: P,
        should_abort: A,
    ) -> Result<T, E>
    where
        Op: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: Fn(&E) -> bool,
        A: Fn() -> bool,
        E: Display,
    {
        let mut attempt: u32 = 0;

        loop {
            match operation().await {
                Ok(value) => return Ok(value),
                Err(error) => {
                    attempt += 1;

                    if !retryable(&error) || should_abort() {
                        return Err(error);
                    }

                    let Some(delay) = self.backoff(attempt) else {
                        return Err(error);
                    };

                    warn!(attempt, delay_ms = delay.as_millis() as u64, %error, "operation failed, retrying");
                    tokio::time::sleep(delay).await;

                    if should_abort() {
                        return Err(error);
                    }
                }
            }
        }
    }

    /// Run `operation`, retrying every failure per this strategy.
    pub async fn execute<T, E, Op, Fut>(&self, operation: Op) -> Result<T, E>
    where
        Op: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        self.execute_with(operation, |_| true, || false).await
    }
}

fn exhausted(max_attempts: Option<u32>, attempt: u32) -> bool {
    // `attempt` counts failures so far; `max_attempts` counts total calls.
    matches!(max_attempts, Some(max) if attempt >= max)
}
