//! Error types for store operations

use thiserror::Error;
use uuid::Uuid;

/// Errors that can occur when talking to the job record store
#[derive(Debug, Error)]
pub enum StoreError {
    /// Underlying database operation failed
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Job does not exist
    #[error("job not found: {0}")]
    NotFound(Uuid),

    /// Stored record could not be decoded into a domain type
    #[error("corrupt job record {id}: {reason}")]
    Corrupt {
        /// Job the record belongs to
        id: Uuid,
        /// What failed to decode
        reason: String,
    },
}

impl StoreError {
    /// Whether the failure is transient I/O that the poll loop should retry
    /// with backoff. Transient store errors never count against a job's
    /// attempt budget.
    pub fn is_transient(&self) -> bool {
        match self {
            StoreError::Database(err) => matches!(
                err,
                sqlx::Error::Io(_)
                    | sqlx::Error::PoolTimedOut
                    | sqlx::Error::PoolClosed
                    | sqlx::Error::WorkerCrashed
            ),
            StoreError::NotFound(_) | StoreError::Corrupt { .. } => false,
        }
    }
}
