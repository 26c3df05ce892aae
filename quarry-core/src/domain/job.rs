//! Job domain types

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Job record
///
/// Structure shared between the job record store (persists) and the worker
/// runtime (claims, executes, finalizes). The payload is opaque to the
/// coordination core; only the external execution engine interprets it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub status: JobStatus,
    pub payload: serde_json::Value,
    pub owner_worker_id: Option<String>,
    /// Expiry of the current lease while the job is owned. For a `failed`
    /// job awaiting retry this field holds the backoff gate instead: the
    /// earliest instant the expiry sweep may return the job to `pending`.
    pub lease_expires_at: Option<chrono::DateTime<chrono::Utc>>,
    pub attempt_count: i32,
    pub max_attempts: i32,
    pub progress: Option<String>,
    /// Advisory cancellation flag, orthogonal to `status`. Set by
    /// `request_cancel`, observed by the owning worker on heartbeat.
    pub cancel_requested: bool,
    pub result: Option<serde_json::Value>,
    pub last_error: Option<String>,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

impl Job {
    /// Whether the job's lease has expired at `now`.
    ///
    /// Only meaningful while the job is owned; an unowned job reports false.
    pub fn lease_expired(&self, now: chrono::DateTime<chrono::Utc>) -> bool {
        self.status.is_owned()
            && self
                .lease_expires_at
                .map(|expiry| expiry <= now)
                .unwrap_or(false)
    }
}

/// Job lifecycle status
///
/// `pending → claimed → running → {completed | failed | canceled}`, with
/// `failed` returning to `pending` via the retry sweep or terminating in
/// `dead` once attempts are exhausted. Owned jobs whose lease expires are
/// reclaimed back to `pending` without a status stop in between.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Claimed,
    Running,
    Completed,
    Failed,
    Dead,
    Canceled,
}

impl JobStatus {
    /// Terminal states never transition again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Dead | JobStatus::Canceled
        )
    }

    /// States in which a worker holds (or held) the lease.
    pub fn is_owned(&self) -> bool {
        matches!(self, JobStatus::Claimed | JobStatus::Running)
    }

    /// Validates a status transition against the lifecycle state machine.
    ///
    /// `claimed → running` is optional (a worker may merge them), so every
    /// transition allowed from `running` is also allowed from `claimed`.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        match (self, next) {
            (Pending, Claimed) => true,
            (Pending, Canceled) => true,
            (Claimed | Running, Running) => *self == Claimed,
            (Claimed | Running, Completed) => true,
            (Claimed | Running, Failed) => true,
            (Claimed | Running, Dead) => true,
            (Claimed | Running, Canceled) => true,
            // Lease expiry reclaim
            (Claimed | Running, Pending) => true,
            // Retry promotion after backoff, or exhaustion
            (Failed, Pending) => true,
            (Failed, Dead) => true,
            (Failed, Canceled) => true,
            _ => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Claimed => "claimed",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Dead => "dead",
            JobStatus::Canceled => "canceled",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "claimed" => Ok(JobStatus::Claimed),
            "running" => Ok(JobStatus::Running),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "dead" => Ok(JobStatus::Dead),
            "canceled" => Ok(JobStatus::Canceled),
            other => Err(format!("unknown job status: {other}")),
        }
    }
}
