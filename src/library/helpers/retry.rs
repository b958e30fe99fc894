//! Bounded retries of fallible asynchronous operations

use super::Backoff;
use rand::Rng;
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio::time::sleep;
use tracing::{debug, warn};

/// Reason why [`RetryPolicy::execute`] gave up
#[derive(Debug, Error)]
pub enum RetryError<E> {
    /// Every attempt failed with a transient error
    #[error("gave up after {attempts} attempts: {last}")]
    Exhausted {
        /// Number of attempts made
        attempts: u32,
        /// Error returned by the final attempt
        last: E,
    },
    /// An attempt failed with an error that is not worth retrying
    #[error("aborted after {attempts} attempts: {error}")]
    Aborted {
        /// Number of attempts made
        attempts: u32,
        /// Error which caused the abort
        error: E,
    },
}

impl<E> RetryError<E> {
    /// Number of attempts made before giving up
    pub fn attempts(&self) -> u32 {
        match self {
            RetryError::Exhausted { attempts, .. } | RetryError::Aborted { attempts, .. } => {
                *attempts
            }
        }
    }

    /// Whether the retry budget was used up
    pub fn is_exhausted(&self) -> bool {
        matches!(self, RetryError::Exhausted { .. })
    }

    /// Error returned by the last attempt
    pub fn into_inner(self) -> E {
        match self {
            RetryError::Exhausted { last, .. } => last,
            RetryError::Aborted { error, .. } => error,
        }
    }
}

/// Value describing how often and how fast an operation is retried
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total number of attempts including the first one
    pub max_attempts: u32,
    /// Delay before the first retry
    pub initial_delay: Duration,
    /// Factor applied to the delay after every retry
    pub multiplier: u32,
    /// Upper bound for a single delay
    pub max_delay: Duration,
    /// Whether up to a quarter of each delay is randomly added
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_secs(1),
            multiplier: 2,
            max_delay: Duration::from_secs(60),
            jitter: false,
        }
    }
}

impl RetryPolicy {
    /// Creates an exponential policy doubling the delay with every retry
    pub fn new(max_attempts: u32, initial_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_delay,
            ..Default::default()
        }
    }

    /// Policy which never retries
    pub fn no_retry() -> Self {
        Self::new(1, Duration::default())
    }

    /// Replaces the delay multiplier
    pub fn with_multiplier(mut self, multiplier: u32) -> Self {
        self.multiplier = multiplier;
        self
    }

    /// Replaces the upper bound for a single delay
    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    /// Enables randomized delays
    pub fn with_jitter(mut self) -> Self {
        self.jitter = true;
        self
    }

    /// Delays between consecutive attempts
    pub fn backoff(&self) -> Backoff {
        Backoff::new(
            self.initial_delay,
            self.multiplier,
            self.max_attempts.saturating_sub(1),
        )
        .with_maximum(self.max_delay)
    }

    /// Runs the operation until it succeeds, fails with a non-transient error or the attempts are used up
    pub async fn execute<T, E, F, Fut, P>(
        &self,
        mut operation: F,
        is_transient: P,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: Fn(&E) -> bool,
        E: Display,
    {
        let mut delays = self.backoff();
        let mut attempts = 0;

        loop {
            attempts += 1;

            let error = match operation().await {
                Ok(value) => return Ok(value),
                Err(error) => error,
            };

            if !is_transient(&error) {
                debug!(attempts, %error, "Operation failed permanently");
                return Err(RetryError::Aborted { attempts, error });
            }

            match delays.next() {
                Some(delay) => {
                    let delay = self.jittered(delay);
                    warn!(attempts, ?delay, %error, "Operation failed, retrying");
                    sleep(delay).await;
                }
                None => {
                    return Err(RetryError::Exhausted {
                        attempts,
                        last: error,
                    })
                }
            }
        }
    }

    fn jittered(&self, delay: Duration) -> Duration {
        let spread = delay.as_millis() as u64 / 4;

        if self.jitter && spread > 0 {
            delay + Duration::from_millis(rand::thread_rng().gen_range(0..=spread))
        } else {
            delay
        }
    }
}

#[cfg(test)]
mod does {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new(max_attempts, Duration::from_millis(1))
    }

    #[tokio::test]
    async fn return_first_success() {
        let calls = AtomicU32::new(0);

        let result: Result<u32, RetryError<String>> = fast(5)
            .execute(
                || async {
                    let call = calls.fetch_add(1, Ordering::SeqCst) + 1;
                    if call < 3 {
                        Err(format!("dropped {}", call))
                    } else {
                        Ok(call)
                    }
                },
                |_| true,
            )
            .await;

        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn give_up_after_max_attempts() {
        let calls = AtomicU32::new(0);

        let result: Result<(), RetryError<&str>> = fast(4)
            .execute(
                || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err("dropped")
                },
                |_| true,
            )
            .await;

        let error = result.unwrap_err();
        assert!(error.is_exhausted());
        assert_eq!(error.attempts(), 4);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn not_retry_permanent_errors() {
        let calls = AtomicU32::new(0);

        let result: Result<(), RetryError<&str>> = fast(4)
            .execute(
                || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err("bad request")
                },
                |_| false,
            )
            .await;

        let error = result.unwrap_err();
        assert!(!error.is_exhausted());
        assert_eq!(error.into_inner(), "bad request");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn yield_one_delay_less_than_attempts() {
        assert_eq!(fast(4).backoff().count(), 3);
        assert_eq!(RetryPolicy::no_retry().backoff().count(), 0);
    }

    #[test]
    fn plan_long_retry_sequences() {
        assert_eq!(RetryPolicy::new(100, Duration::from_secs(1)).backoff().count(), 99);
    }
}
