//! Bounded retry for transient SQLite contention

use std::time::Duration;

use rusqlite::ErrorCode;
use tracing::warn;

use crate::core::{ManagerError, Result};

/// How often and how patiently a busy store is retried
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first
    pub attempts: u32,
    /// Delay before the first retry; doubles each time
    pub base_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 5,
            base_backoff: Duration::from_millis(50),
        }
    }
}

impl RetryPolicy {
    pub fn new(attempts: u32, base_backoff: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            base_backoff,
        }
    }

    fn backoff(&self, attempt: u32) -> Duration {
        self.base_backoff
            .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)))
    }

    /// Run `op`, retrying while SQLite reports the database busy or locked
    pub fn run<T>(&self, mut op: impl FnMut() -> rusqlite::Result<T>) -> Result<T> {
        let mut attempt = 1;
        loop {
            match op() {
                Ok(value) => return Ok(value),
                Err(err) if is_busy(&err) => {
                    if attempt >= self.attempts {
                        return Err(ManagerError::StoreBusy {
                            attempts: attempt,
                            source: err,
                        });
                    }
                    let delay = self.backoff(attempt);
                    warn!(
                        "Store busy (attempt {}/{}), retrying in {:?}",
                        attempt, self.attempts, delay
                    );
                    std::thread::sleep(delay);
                    attempt += 1;
                }
                Err(err) => return Err(err.into()),
            }
        }
    }
}

/// Whether an error is transient lock contention
pub fn is_busy(err: &rusqlite::Error) -> bool {
    matches!(
        err.sqlite_error_code(),
        Some(ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked)
    )
}
