//! Retry-with-backoff for SQLite lock contention.
//!
//! The per-connection busy timeout absorbs short waits inside the engine.
//! [`retry_busy`] covers the longer ones, such as a reader holding the file
//! while `VACUUM INTO` wants a consistent snapshot.

use std::time::{Duration, Instant};

use rusqlite::ErrorCode;

/// How long a [`RetryPolicy`] keeps trying.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryBudget {
    /// Stop once this much wall-clock time has passed since the first attempt
    WallClock(Duration),
    /// Stop after this many attempts in total
    Attempts(u32),
}

/// Exponential backoff settings for busy/locked errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Sleep before the second attempt
    pub initial_delay: Duration,
    /// Upper bound for a single sleep
    pub max_delay: Duration,
    /// When to give up
    pub budget: RetryBudget,
}

impl RetryPolicy {
    /// Policy for backup creation: 200ms doubling to 2s, for up to `budget`.
    pub fn backup(budget: Duration) -> Self {
        Self {
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(2),
            budget: RetryBudget::WallClock(budget),
        }
    }

    /// Policy for bulk inserts: 100ms doubling to 2s, 8 attempts.
    pub fn bulk() -> Self {
        Self {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
            budget: RetryBudget::Attempts(8),
        }
    }

    fn exhausted(&self, attempts: u32, started: Instant) -> bool {
        match self.budget {
            RetryBudget::WallClock(limit) => started.elapsed() > limit,
            RetryBudget::Attempts(max) => attempts >= max,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::backup(Duration::from_secs(30))
    }
}

/// Returns true when SQLite reported lock contention.
pub fn is_busy_error(error: &rusqlite::Error) -> bool {
    match error {
        rusqlite::Error::SqliteFailure(e, msg) => {
            matches!(e.code, ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked)
                || msg.as_deref().map(message_is_busy).unwrap_or(false)
        }
        other => message_is_busy(&other.to_string()),
    }
}

fn message_is_busy(msg: &str) -> bool {
    let msg = msg.to_ascii_lowercase();
    msg.contains("locked") || msg.contains("busy")
}

/// Run `op`, retrying only busy/locked failures until `policy` runs out.
///
/// Any other error is returned on first occurrence. When the budget is spent
/// the last engine error is returned unchanged.
pub fn retry_busy<T, F>(policy: &RetryPolicy, mut op: F) -> Result<T, rusqlite::Error>
where
    F: FnMut() -> Result<T, rusqlite::Error>,
{
    let started = Instant::now();
    let mut delay = policy.initial_delay;
    let mut attempts = 0u32;

    loop {
        attempts += 1;
        match op() {
            Ok(value) => return Ok(value),
            Err(e) if is_busy_error(&e) && !policy.exhausted(attempts, started) => {
                tracing::debug!(attempt = attempts, ?delay, "Database busy, retrying: {}", e);
                std::thread::sleep(delay);
                delay = std::cmp::min(delay * 2, policy.max_delay);
            }
            Err(e) => return Err(e),
        }
    }
}
