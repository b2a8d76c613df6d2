use thiserror::Error;

use crate::types::JobState;

/// Enumeration of errors for operations on the queue store.
#[derive(Error, Debug)]
pub enum QueueError {
    #[error("invalid job spec: {0}")]
    InvalidSpec(String),
    #[error("a job with id {0} already exists")]
    Duplicate(String),
    #[error("no job with id {0}")]
    NotFound(String),
    #[error("job {id} is {actual}, expected {expected}")]
    StateMismatch {
        id: String,
        expected: JobState,
        actual: JobState,
    },
    #[error("store is busy; write lock not acquired within the wait budget")]
    Busy,
    #[error("{0} is not a valid job state")]
    ParseJobState(String),
    #[error("store query failed with: {0}")]
    Database(sqlx::Error),
    #[error("store migration failed with: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
}

impl From<sqlx::Error> for QueueError {
    fn from(error: sqlx::Error) -> Self {
        if is_locked(&error) {
            QueueError::Busy
        } else {
            QueueError::Database(error)
        }
    }
}

impl QueueError {
    /// Transient errors may be retried by the caller; everything else is not
    /// going to get better on its own.
    pub fn is_transient(&self) -> bool {
        matches!(self, QueueError::Busy)
    }
}

/// Whether an sqlx error is a unique-constraint violation, which on an insert
/// means an id collision.
pub(crate) fn is_unique_violation(error: &sqlx::Error) -> bool {
    match error {
        sqlx::Error::Database(db) => db.is_unique_violation(),
        _ => false,
    }
}

// SQLITE_BUSY (5) and SQLITE_LOCKED (6) surface when the busy timeout ran out
// while another connection held the write lock.
fn is_locked(error: &sqlx::Error) -> bool {
    match error {
        sqlx::Error::Database(db) => {
            matches!(db.code().as_deref(), Some("5") | Some("6"))
        }
        _ => false,
    }
}
