//! Job lifecycle events
//!
//! A single outbound stream carries everything that happens to a claimed
//! job. The stats collector and the store progress writer both consume it,
//! so execution code never threads reporting callbacks through its layers.

use std::time::Duration;
use uuid::Uuid;

/// One observation about a claimed job
#[derive(Debug, Clone)]
pub struct JobEvent {
    pub job_id: Uuid,
    pub kind: JobEventKind,
    pub message: Option<String>,
    /// Wall-clock execution time, present on events that end an execution
    pub elapsed: Option<Duration>,
}

impl JobEvent {
    pub fn new(job_id: Uuid, kind: JobEventKind) -> Self {
        Self {
            job_id,
            kind,
            message: None,
            elapsed: None,
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_elapsed(mut self, elapsed: Duration) -> Self {
        self.elapsed = Some(elapsed);
        self
    }
}

/// What happened
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobEventKind {
    /// Lease acquired
    Claimed,
    /// Handed to the execution engine
    Started,
    /// Free-form progress from the engine, forwarded to the store
    Progress,
    /// Finished successfully
    Completed,
    /// Failed; another attempt was scheduled
    Retried,
    /// Failed with attempts exhausted
    DeadLettered,
    /// Stopped after a cancellation request
    Canceled,
    /// Interrupted by shutdown and returned to the queue
    Requeued,
    /// Lease ownership lost mid-flight; no release was attempted
    LeaseLost,
}

impl JobEventKind {
    /// Whether this event removes the job from the worker's active set.
    pub fn ends_execution(&self) -> bool {
        !matches!(
            self,
            JobEventKind::Claimed | JobEventKind::Started | JobEventKind::Progress
        )
    }
}
