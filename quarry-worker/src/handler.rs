//! Execution engine seam
//!
//! The worker runtime hands a claimed job to a [`JobHandler`] and awaits its
//! outcome. The handler receives an [`ExecutionContext`] carrying the
//! cooperative cancellation signal and the progress stream; it must consult
//! the cancellation check between internal phases of its work.

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use quarry_core::domain::job::Job;

use crate::runtime::events::{JobEvent, JobEventKind};

/// Outcome of a job execution the engine reports back
#[derive(Debug, Error)]
pub enum ExecutionError {
    /// The engine ran and reported failure; counts against the attempt budget
    #[error("execution failed: {0}")]
    Failed(String),

    /// Execution stopped in response to the cancellation signal
    #[error("execution canceled")]
    Canceled,
}

/// Per-execution context handed to the engine
pub struct ExecutionContext {
    job_id: Uuid,
    cancel: CancellationToken,
    events: mpsc::UnboundedSender<JobEvent>,
}

impl ExecutionContext {
    pub fn new(
        job_id: Uuid,
        cancel: CancellationToken,
        events: mpsc::UnboundedSender<JobEvent>,
    ) -> Self {
        Self {
            job_id,
            cancel,
            events,
        }
    }

    /// Cancellation check. Handlers call this before each internal phase.
    pub fn cancel_requested(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves when cancellation is requested; for use in `select!` against
    /// long-running work.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    /// Reports free-form progress; forwarded to the store best-effort.
    pub fn report_progress(&self, message: impl Into<String>) {
        let _ = self.events.send(
            JobEvent::new(self.job_id, JobEventKind::Progress).with_message(message),
        );
    }
}

/// The external engine that performs the actual work of a job
///
/// The payload is opaque to the worker; only the engine interprets it.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn run(
        &self,
        job: &Job,
        ctx: &ExecutionContext,
    ) -> Result<serde_json::Value, ExecutionError>;
}
