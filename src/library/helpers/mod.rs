//! Helper functions that don't belong elsewhere
//!
//! This module contains small helpers that don't belong to a specific area but are still used by multiple components.

mod backoff;
mod retry;

pub use backoff::Backoff;
pub use retry::{RetryError, RetryPolicy};

use std::{num::ParseIntError, time::Duration};

/// Parses a Duration from a string containing seconds.
/// Useful for command line parsing
pub fn parse_seconds(src: &str) -> Result<Duration, ParseIntError> {
    let seconds = src.parse::<u64>()?;
    Ok(Duration::from_secs(seconds))
}

/// Parses a Duration from a string containing milliseconds.
pub fn parse_millis(src: &str) -> Result<Duration, ParseIntError> {
    let millis = src.parse::<u64>()?;
    Ok(Duration::from_millis(millis))
}
