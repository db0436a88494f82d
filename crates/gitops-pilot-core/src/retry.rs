//! Retry with backoff
//!
//! One primitive for every "wait until the remote side is ready" loop in
//! the installer. A [`RetryPolicy`] picks the delay between attempts, how
//! the delay grows, and when to give up (never, after N attempts, or after
//! a wall-clock budget). A predicate decides which errors are worth
//! retrying; anything else is returned immediately.
//!
//! Time is measured with `tokio::time`, so a paused test clock drives the
//! loop as well as real time does.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;
use tracing::warn;

/// How the delay changes between attempts
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Backoff {
    /// Same delay every time
    Fixed,
    /// Delay multiplied after each failure, optionally capped
    Exponential {
        multiplier: f64,
        max_delay: Option<Duration>,
    },
}

/// When to stop retrying
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryLimit {
    Unbounded,
    /// Total attempts, including the first
    Attempts(u32),
    /// Wall-clock budget measured from the first attempt
    Elapsed(Duration),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub delay: Duration,
    pub backoff: Backoff,
    pub limit: RetryLimit,
}

impl RetryPolicy {
    /// Poll at a fixed interval until `timeout` has elapsed
    pub fn poll(interval: Duration, timeout: Duration) -> Self {
        Self {
            delay: interval,
            backoff: Backoff::Fixed,
            limit: RetryLimit::Elapsed(timeout),
        }
    }

    /// Doubling delay starting at `base`, no limit
    pub fn exponential(base: Duration) -> Self {
        Self {
            delay: base,
            backoff: Backoff::Exponential {
                multiplier: 2.0,
                max_delay: None,
            },
            limit: RetryLimit::Unbounded,
        }
    }

    pub fn with_limit(mut self, limit: RetryLimit) -> Self {
        self.limit = limit;
        self
    }

    pub fn with_max_delay(mut self, max: Duration) -> Self {
        if let Backoff::Exponential { max_delay, .. } = &mut self.backoff {
            *max_delay = Some(max);
        }
        self
    }

    fn next_delay(&self, current: Duration) -> Duration {
        match self.backoff {
            Backoff::Fixed => current,
            Backoff::Exponential {
                multiplier,
                max_delay,
            } => {
                let next = Duration::try_from_secs_f64(current.as_secs_f64() * multiplier)
                    .unwrap_or(Duration::MAX);
                match max_delay {
                    Some(max) => next.min(max),
                    None => next,
                }
            }
        }
    }
}

/// Why a retried operation ended without a result
#[derive(Debug, Error, PartialEq)]
pub enum RetryError<E> {
    /// The predicate rejected the error
    #[error("{error}")]
    Fatal { attempts: u32, error: E },

    #[error("gave up after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: E },

    #[error("timed out after {}s ({attempts} attempts): {last}", .elapsed.as_secs())]
    TimedOut {
        attempts: u32,
        elapsed: Duration,
        last: E,
    },
}

impl<E> RetryError<E> {
    pub fn attempts(&self) -> u32 {
        match self {
            RetryError::Fatal { attempts, .. }
            | RetryError::Exhausted { attempts, .. }
            | RetryError::TimedOut { attempts, .. } => *attempts,
        }
    }

    /// The error from the final attempt
    pub fn into_last(self) -> E {
        match self {
            RetryError::Fatal { error, .. } => error,
            RetryError::Exhausted { last, .. } => last,
            RetryError::TimedOut { last, .. } => last,
        }
    }
}

/// Run `operation` until it succeeds, hits a non-retryable error, or the
/// policy's limit is reached. Every retried failure is logged with its
/// attempt number.
///
/// Elapsed time is checked after each failure rather than counting
/// attempts, so slow calls do not stretch an `Elapsed` budget.
pub async fn retry<T, E, F, Fut, P>(
    policy: &RetryPolicy,
    operation_name: &str,
    is_retryable: P,
    mut operation: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
    E: Display,
{
    let start = Instant::now();
    let mut attempt = 0u32;
    let mut delay = policy.delay;

    loop {
        attempt += 1;

        let err = match operation().await {
            Ok(value) => return Ok(value),
            Err(e) => e,
        };

        if !is_retryable(&err) {
            return Err(RetryError::Fatal {
                attempts: attempt,
                error: err,
            });
        }

        match policy.limit {
            RetryLimit::Attempts(max) if attempt >= max => {
                return Err(RetryError::Exhausted {
                    attempts: attempt,
                    last: err,
                });
            }
            RetryLimit::Elapsed(budget) if start.elapsed() >= budget => {
                return Err(RetryError::TimedOut {
                    attempts: attempt,
                    elapsed: start.elapsed(),
                    last: err,
                });
            }
            _ => {}
        }

        warn!(
            operation = %operation_name,
            attempt = attempt,
            error = %err,
            delay_ms = delay.as_millis() as u64,
            "{} failed, reason \"{}\", attempt {}",
            operation_name,
            err,
            attempt
        );

        tokio::time::sleep(delay).await;
        delay = policy.next_delay(delay);
    }
}
