//! Exponential backoff implementations

use std::{iter::Iterator, time::Duration};

/// Exponential backoff iterator
///
/// Yields monotonically increasing delays until the configured number of
/// attempts is exhausted. Each element is the previous one multiplied by the
/// `multiplier`, starting from `base * multiplier`.
pub struct Backoff {
    attempt: u32,
    limit: u32,
    multiplier: u32,
    current: Duration,
}

impl Backoff {
    /// Creates an iterator starting at `base * multiplier` with at most `limit` elements
    pub fn new(base: Duration, multiplier: u32, limit: u32) -> Self {
        Self {
            attempt: 0,
            limit,
            multiplier,
            current: base,
        }
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_millis(25), 2, 13)
    }
}

impl Iterator for Backoff {
    type Item = Duration;

    fn next(&mut self) -> Option<Self::Item> {
        self.attempt += 1;

        if self.attempt > self.limit {
            None
        } else {
            self.current *= self.multiplier;
            Some(self.current)
        }
    }
}
