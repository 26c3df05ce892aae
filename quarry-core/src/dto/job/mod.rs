//! Job DTOs for store operations

use serde::{Deserialize, Serialize};

use crate::domain::job::JobStatus;

/// Request to enqueue a new job
///
/// Submitted by an external producer; the job enters the store in `pending`
/// with a zero attempt count.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewJob {
    pub payload: serde_json::Value,
    pub max_attempts: i32,
}

impl NewJob {
    pub fn new(payload: serde_json::Value, max_attempts: i32) -> Self {
        Self {
            payload,
            max_attempts,
        }
    }
}

/// Candidate filter for an atomic claim attempt
///
/// Eligible candidates are `pending` jobs and owned jobs whose lease expired
/// before `now`. The timestamp is carried explicitly so tests can claim at a
/// simulated instant instead of sleeping through real lease windows.
#[derive(Debug, Clone, Copy)]
pub struct ClaimFilter {
    pub now: chrono::DateTime<chrono::Utc>,
}

impl ClaimFilter {
    pub fn at(now: chrono::DateTime<chrono::Utc>) -> Self {
        Self { now }
    }
}

/// Outcome of a lease extension attempt
///
/// `extended == false` means ownership was lost: the lease expired and the
/// job was reclaimed or finalized by someone else. The cancellation flag is
/// piggybacked on the heartbeat so the owning worker observes cancel
/// requests without an extra store read.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct LeaseExtension {
    pub extended: bool,
    pub cancel_requested: bool,
}

impl LeaseExtension {
    pub fn lost() -> Self {
        Self {
            extended: false,
            cancel_requested: false,
        }
    }
}

/// Fields written alongside a finalizing status transition
///
/// `retry_not_before` is only meaningful when finalizing to `failed`: it is
/// stored as the backoff gate the expiry sweep checks before promoting the
/// job back to `pending`.
#[derive(Debug, Clone, Default)]
pub struct FinalizeFields {
    pub last_error: Option<String>,
    pub result: Option<serde_json::Value>,
    pub progress: Option<String>,
    pub retry_not_before: Option<chrono::DateTime<chrono::Utc>>,
}

impl FinalizeFields {
    pub fn with_result(result: serde_json::Value) -> Self {
        Self {
            result: Some(result),
            ..Self::default()
        }
    }

    pub fn with_error(error: impl Into<String>) -> Self {
        Self {
            last_error: Some(error.into()),
            ..Self::default()
        }
    }
}

/// Statuses a worker may finalize an owned job into
///
/// Kept as a separate type so callers cannot ask the store to finalize into
/// an owned or initial status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinalStatus {
    Completed,
    /// Execution failed, retry scheduled. Increments the attempt count.
    Failed,
    /// Execution failed with attempts exhausted. Increments the attempt count.
    Dead,
    Canceled,
    /// Execution was interrupted (shutdown drain) before producing an
    /// outcome; the job returns to `pending` with attempts untouched.
    Requeued,
}

impl FinalStatus {
    pub fn as_job_status(&self) -> JobStatus {
        match self {
            FinalStatus::Completed => JobStatus::Completed,
            FinalStatus::Failed => JobStatus::Failed,
            FinalStatus::Dead => JobStatus::Dead,
            FinalStatus::Canceled => JobStatus::Canceled,
            FinalStatus::Requeued => JobStatus::Pending,
        }
    }

    /// Whether this finalization records a failed execution attempt.
    pub fn counts_as_attempt(&self) -> bool {
        matches!(self, FinalStatus::Failed | FinalStatus::Dead)
    }
}
