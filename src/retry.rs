//! Bounded retry for transient SQLite contention.
//!
//! Several batch workers may commit summaries into the same database file at
//! once. SQLite serialises writers and reports `SQLITE_BUSY` or
//! `SQLITE_LOCKED` to whoever loses the race once the busy timeout expires.
//! [`RetryPolicy::run`] re-executes the whole unit of work in that case and
//! gives up with [`StorageError::RetriesExhausted`] once its budget is spent.
//! Any other SQLite error is returned immediately.

use crate::error::StorageError;
use rusqlite::ErrorCode;
use std::time::Duration;

/// Defines the policy for retrying a locked database operation.
///
/// # Example
///
/// ```rust
/// use seaflow_opp::retry::RetryPolicy;
/// use std::time::Duration;
///
/// let policy = RetryPolicy {
///     max_attempts: 5,
///     backoff_delay: Duration::from_millis(200),
/// };
/// assert_eq!(policy.total_attempts(), 6);
/// ```
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// The maximum number of retry attempts.
    ///
    /// Total attempts will be max_attempts + 1 (the initial try is not
    /// counted). Set to 0 to disable retries.
    pub max_attempts: u32,

    /// The delay between retry attempts.
    ///
    /// Uses a constant backoff strategy.
    pub backoff_delay: Duration,
}

impl Default for RetryPolicy {
    /// Creates a default retry policy.
    ///
    /// Default policy attempts 3 retries with 100ms delay between attempts.
    ///
    /// # Example
    ///
    /// ```rust
    /// use seaflow_opp::retry::RetryPolicy;
    /// use std::time::Duration;
    ///
    /// let policy = RetryPolicy::default();
    /// assert_eq!(policy.max_attempts, 3);
    /// assert_eq!(policy.backoff_delay, Duration::from_millis(100));
    /// ```
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_delay: Duration::from_millis(100),
        }
    }
}

impl RetryPolicy {
    /// Initial try plus retries.
    pub fn total_attempts(&self) -> u32 {
        self.max_attempts.saturating_add(1)
    }

    /// Run `op`, retrying while it fails with a busy or locked database.
    ///
    /// Blocks the calling thread between attempts; callers on an async
    /// runtime run this inside `spawn_blocking`.
    pub fn run<T, F>(&self, mut op: F) -> Result<T, StorageError>
    where
        F: FnMut() -> rusqlite::Result<T>,
    {
        let mut attempt = 1;
        loop {
            match op() {
                Ok(value) => return Ok(value),
                Err(err) if is_contention(&err) => {
                    if attempt >= self.total_attempts() {
                        return Err(StorageError::RetriesExhausted {
                            attempts: attempt,
                            source: err,
                        });
                    }
                    tracing::debug!(attempt, error = %err, "database busy, retrying");
                    std::thread::sleep(self.backoff_delay);
                    attempt += 1;
                }
                Err(err) => return Err(StorageError::Sqlite(err)),
            }
        }
    }
}

/// Whether an error reports lock contention rather than a real failure.
pub fn is_contention(err: &rusqlite::Error) -> bool {
    matches!(
        err.sqlite_error_code(),
        Some(ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::ffi;

    fn busy() -> rusqlite::Error {
        rusqlite::Error::SqliteFailure(ffi::Error::new(ffi::SQLITE_BUSY), None)
    }

    fn quick(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            backoff_delay: Duration::from_millis(1),
        }
    }

    #[test]
    fn test_succeeds_after_transient_busy() {
        let mut calls = 0;
        let value = quick(3)
            .run(|| {
                calls += 1;
                if calls < 3 {
                    Err(busy())
                } else {
                    Ok(42)
                }
            })
            .unwrap();
        assert_eq!(value, 42);
        assert_eq!(calls, 3);
    }

    #[test]
    fn test_exhaustion_reports_attempts() {
        let mut calls = 0;
        let err = quick(2)
            .run(|| -> rusqlite::Result<()> {
                calls += 1;
                Err(busy())
            })
            .unwrap_err();
        assert_eq!(calls, 3);
        assert!(matches!(err, StorageError::RetriesExhausted { attempts: 3, .. }));
    }

    #[test]
    fn test_other_errors_not_retried() {
        let mut calls = 0;
        let err = quick(5)
            .run(|| -> rusqlite::Result<()> {
                calls += 1;
                Err(rusqlite::Error::QueryReturnedNoRows)
            })
            .unwrap_err();
        assert_eq!(calls, 1);
        assert!(matches!(err, StorageError::Sqlite(_)));
    }

    #[test]
    fn test_zero_retries_tries_once() {
        let mut calls = 0;
        let _ = quick(0).run(|| -> rusqlite::Result<()> {
            calls += 1;
            Err(busy())
        });
        assert_eq!(calls, 1);
    }
}
