//! Retrying write transactions that lose the race for the database write lock.
//!
//! SQLite admits one writer at a time. A deferred transaction that has already read cannot
//! wait for a competing writer without deadlocking, so SQLite fails it with "database is
//! locked" straight away. The loser has to roll back and start over from fresh reads.
//! [`with_write_retry`] reruns the whole transaction with jittered exponential backoff
//! until it either completes or gives a different answer. A guard that trips after
//! validation ([`Error::Conflict`] from the attempt itself) is rerun only once. When either
//! budget is spent the caller gets [`Error::Conflict`].
//!
//! Only the outermost transaction may be retried this way. Helpers that take an open
//! transaction (`ledger::credit_in` and friends) never retry on their own.

use crate::errors::{Error, Result};
use backon::{ExponentialBuilder, Retryable};
use sea_orm::DbErr;
use std::{
    future::Future,
    sync::atomic::{AtomicUsize, Ordering},
    time::Duration,
};
use tracing::debug;

const MAX_RETRIES: usize = 12;
const MAX_CONFLICT_RETRIES: usize = 1;

/// Whether `err` is SQLite refusing a lock held by another connection.
pub(crate) fn is_lock_contention(err: &DbErr) -> bool {
    let message = err.to_string().to_ascii_lowercase();
    message.contains("is locked") || message.contains("database is busy")
}

/// Maps lock contention to [`Error::Conflict`]; other errors pass through.
pub(crate) fn contention_to_conflict(err: Error) -> Error {
    match err {
        Error::Database(db_err) if is_lock_contention(&db_err) => Error::Conflict {
            message: db_err.to_string(),
        },
        other => other,
    }
}

fn backoff() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(5))
        .with_max_delay(Duration::from_millis(200))
        .with_max_times(MAX_RETRIES)
        .with_jitter()
}

/// Runs `attempt` until it stops losing the write lock, rerunning a tripped guard once.
///
/// `attempt` must open and finish its own transaction so that every run re-reads the
/// state it validates.
pub(crate) async fn with_write_retry<T, F, Fut>(operation: &str, attempt: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let conflicts = AtomicUsize::new(0);
    attempt
        .retry(backoff())
        .when(|err: &Error| match err {
            Error::Database(db_err) => is_lock_contention(db_err),
            Error::Conflict { .. } => {
                conflicts.fetch_add(1, Ordering::Relaxed) < MAX_CONFLICT_RETRIES
            }
            _ => false,
        })
        .notify(|err: &Error, delay: Duration| {
            debug!("{} conflicted ({}), retrying in {:?}", operation, err, delay);
        })
        .await
        .map_err(contention_to_conflict)
}
