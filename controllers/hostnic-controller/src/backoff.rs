//! # Fibonacci Backoff
//!
//! Requeue delays for failed reconciles. The delay grows along the Fibonacci
//! sequence in seconds: with a 5 s minimum and 300 s cap the sequence is
//! 5s, 5s, 10s, 15s, 25s, 40s, 65s, 105s, 170s, 275s, 300s.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

/// Fibonacci backoff calculator
#[derive(Debug, Clone)]
pub struct FibonacciBackoff {
    min_secs: u64,
    prev_secs: u64,
    current_secs: u64,
    max_secs: u64,
}

impl FibonacciBackoff {
    /// Backoff starting at `min_secs`, capped at `max_secs`
    #[must_use]
    pub fn new(min_secs: u64, max_secs: u64) -> Self {
        Self {
            min_secs,
            prev_secs: 0,
            current_secs: min_secs,
            max_secs,
        }
    }

    /// Return the current delay and advance the sequence
    pub fn next_backoff(&mut self) -> Duration {
        let result = self.current_secs;
        let next = self.prev_secs + self.current_secs;
        self.prev_secs = self.current_secs;
        self.current_secs = std::cmp::min(next, self.max_secs);
        Duration::from_secs(result)
    }

    pub fn reset(&mut self) {
        self.prev_secs = 0;
        self.current_secs = self.min_secs;
    }
}

/// One backoff per object key, reset on success
#[derive(Debug)]
pub struct BackoffMap {
    min_secs: u64,
    max_secs: u64,
    entries: Mutex<HashMap<String, FibonacciBackoff>>,
}

impl BackoffMap {
    pub fn new(min_secs: u64, max_secs: u64) -> Self {
        Self {
            min_secs,
            max_secs,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Next requeue delay for a failing object
    pub fn next(&self, key: &str) -> Duration {
        let mut entries = self.entries.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        entries
            .entry(key.to_string())
            .or_insert_with(|| FibonacciBackoff::new(self.min_secs, self.max_secs))
            .next_backoff()
    }

    pub fn reset(&self, key: &str) {
        self.entries
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fibonacci_backoff_sequence() {
        let mut backoff = FibonacciBackoff::new(5, 300);
        let secs: Vec<u64> = (0..12).map(|_| backoff.next_backoff().as_secs()).collect();
        assert_eq!(secs, vec![5, 5, 10, 15, 25, 40, 65, 105, 170, 275, 300, 300]);
    }

    #[test]
    fn test_fibonacci_backoff_reset() {
        let mut backoff = FibonacciBackoff::new(5, 300);
        backoff.next_backoff();
        backoff.next_backoff();
        backoff.next_backoff();

        backoff.reset();

        assert_eq!(backoff.next_backoff(), Duration::from_secs(5));
        assert_eq!(backoff.next_backoff(), Duration::from_secs(5));
        assert_eq!(backoff.next_backoff(), Duration::from_secs(10));
    }

    #[test]
    fn test_backoff_map_is_per_key() {
        let map = BackoffMap::new(5, 300);
        assert_eq!(map.next("a"), Duration::from_secs(5));
        assert_eq!(map.next("a"), Duration::from_secs(5));
        assert_eq!(map.next("a"), Duration::from_secs(10));
        assert_eq!(map.next("b"), Duration::from_secs(5));

        map.reset("a");
        assert_eq!(map.next("a"), Duration::from_secs(5));
    }
}
