//! Store error classification.

use thiserror::Error;

/// Error kinds surfaced by every store operation.
///
/// Callers retry `Transient` within their own budget; `Conflict` and
/// `Permanent` are never retried. The store itself performs no retries.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("transient store failure: {0}")]
    Transient(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("permanent store failure: {0}")]
    Permanent(String),
}

impl StoreError {
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::RowNotFound => Self::NotFound(err.to_string()),
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                Self::Conflict(err.to_string())
            }
            sqlx::Error::Io(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => Self::Transient(err.to_string()),
            _ => Self::Permanent(err.to_string()),
        }
    }
}
