//! Exponential backoff implementations

use std::{iter::Iterator, time::Duration};

/// Exponential backoff iterator
///
/// This struct implements the iterator trait and returns monotonically increasing values until a specified limit of iterations is reached.
/// The first element is the initial delay, each following one is the previous element multiplied by the `multiplier` property,
/// optionally capped at a maximum delay.
#[derive(Debug, Clone)]
pub struct Backoff {
    retries: u32,
    limit: u32,
    multiplier: u32,
    current: Duration,
    maximum: Option<Duration>,
}

impl Backoff {
    /// Creates a new backoff yielding `limit` delays starting at `initial`
    pub fn new(initial: Duration, multiplier: u32, limit: u32) -> Self {
        Self {
            retries: 0,
            limit,
            multiplier,
            current: initial,
            maximum: None,
        }
    }

    /// Caps every yielded delay at the given maximum
    pub fn with_maximum(mut self, maximum: Duration) -> Self {
        self.maximum = Some(maximum);
        self
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_millis(50), 2, 13)
    }
}

impl Iterator for Backoff {
    type Item = Duration;

    fn next(&mut self) -> Option<Self::Item> {
        self.retries += 1;

        if self.retries > self.limit {
            return None;
        }

        let delay = match self.maximum {
            Some(maximum) => self.current.min(maximum),
            None => self.current,
        };

        // Saturate instead of overflowing for long retry sequences
        self.current = self
            .current
            .checked_mul(self.multiplier)
            .map_or(self.current, |next| match self.maximum {
                Some(maximum) => next.min(maximum),
                None => next,
            });

        Some(delay)
    }
}
