pub mod db;
pub mod hash;

use std::time::{Duration, Instant};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("operation timed out")]
    Timeout,

    #[error("operation cancelled")]
    Cancelled,

    #[error("store worker is not running")]
    Unavailable,
}

/// Result of a single last-write-wins upsert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UpsertOutcome {
    /// No record existed for the key
    Inserted,
    /// The stored record was older and has been replaced
    Updated,
    /// The stored record was as fresh or fresher; nothing changed
    Stale,
}

impl UpsertOutcome {
    pub fn rows_affected(self) -> u64 {
        match self {
            Self::Inserted | Self::Updated => 1,
            Self::Stale => 0,
        }
    }
}

/// Deadline and cancellation signal carried by every store call.
/// Work that has not committed when either fires is rolled back.
#[derive(Debug, Clone)]
pub struct CallGuard {
    deadline: Instant,
    cancel: CancellationToken,
}

/// Deadlines past this point are treated as "no deadline".
const FAR_FUTURE: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);
const ONE_DAY: Duration = Duration::from_secs(24 * 60 * 60);

impl CallGuard {
    pub fn new(timeout: Duration, cancel: CancellationToken) -> Self {
        let now = Instant::now();
        Self {
            deadline: now
                .checked_add(timeout.min(FAR_FUTURE))
                .or_else(|| now.checked_add(timeout.min(ONE_DAY)))
                .unwrap_or(now),
            cancel,
        }
    }

    pub fn check(&self) -> Result<(), StoreError> {
        if self.cancel.is_cancelled() {
            return Err(StoreError::Cancelled);
        }
        if Instant::now() >= self.deadline {
            return Err(StoreError::Timeout);
        }
        Ok(())
    }

    /// Time left before the deadline, or the reason there is none.
    pub fn remaining(&self) -> Result<Duration, StoreError> {
        self.check()?;
        Ok(self.deadline.saturating_duration_since(Instant::now()))
    }

    /// Resolves once the deadline passes or the token is cancelled.
    pub async fn expired(&self) -> StoreError {
        tokio::select! {
            _ = tokio::time::sleep_until(self.deadline.into()) => StoreError::Timeout,
            _ = self.cancel.cancelled() => StoreError::Cancelled,
        }
    }
}
