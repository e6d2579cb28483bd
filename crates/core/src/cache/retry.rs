//! Bounded retry on transient lock contention.
//!
//! SQLite's `busy_timeout` already blocks inside a single statement; this
//! adds a small number of application-level attempts on top of it. Only
//! [`ErrorKind::TransientContention`](crate::ErrorKind) is retried. Missing
//! schema is surfaced so the storage handle can re-run initialization.

use std::thread;
use std::time::Duration;

use crate::Error;

/// Fixed-delay retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    max_retries: u32,
    delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_retries: 3, delay: Duration::from_millis(50) }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, delay: Duration) -> Self {
        Self { max_retries, delay }
    }

    /// A policy that runs the operation exactly once.
    pub fn none() -> Self {
        Self { max_retries: 0, delay: Duration::ZERO }
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Run `op`, retrying up to `max_retries` extra times on lock contention.
    pub fn run<T>(&self, mut op: impl FnMut() -> Result<T, Error>) -> Result<T, Error> {
        let mut attempt = 0u32;
        loop {
            match op() {
                Err(err) if err.is_transient() && attempt < self.max_retries => {
                    attempt += 1;
                    tracing::warn!(attempt, max_retries = self.max_retries, error = %err, "Storage busy, retrying");
                    if !self.delay.is_zero() {
                        thread::sleep(self.delay);
                    }
                }
                other => return other,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn locked() -> Error {
        Error::Database(rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            Some("database is locked".to_string()),
        ))
    }

    fn missing_table() -> Error {
        Error::Database(rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_ERROR),
            Some("no such table: kv_cache".to_string()),
        ))
    }

    #[test]
    fn test_succeeds_after_transient_failures() {
        let policy = RetryPolicy::new(3, Duration::from_millis(1));
        let mut calls = 0;
        let result = policy.run(|| {
            calls += 1;
            if calls < 3 { Err(locked()) } else { Ok(calls) }
        });
        assert_eq!(result.unwrap(), 3);
    }

    #[test]
    fn test_gives_up_after_max_retries() {
        let policy = RetryPolicy::new(2, Duration::ZERO);
        let mut calls = 0;
        let result: Result<(), Error> = policy.run(|| {
            calls += 1;
            Err(locked())
        });
        assert!(result.unwrap_err().is_transient());
        assert_eq!(calls, 3);
    }

    #[test]
    fn test_missing_schema_not_retried() {
        let policy = RetryPolicy::default();
        let mut calls = 0;
        let result: Result<(), Error> = policy.run(|| {
            calls += 1;
            Err(missing_table())
        });
        assert!(result.is_err());
        assert_eq!(calls, 1);
    }

    #[test]
    fn test_none_runs_once() {
        let policy = RetryPolicy::none();
        let mut calls = 0;
        let _: Result<(), Error> = policy.run(|| {
            calls += 1;
            Err(locked())
        });
        assert_eq!(calls, 1);
    }
}
