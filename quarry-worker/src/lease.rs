//! Lease coordination
//!
//! Wraps the store's conditional-update primitives into the claim,
//! heartbeat, release, and expiry-sweep operations the runtime drives. All
//! ownership checks happen inside the store; this layer decides what to
//! write, never whether the write wins.

use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

use quarry_core::domain::job::Job;
use quarry_core::dto::job::{ClaimFilter, FinalStatus, FinalizeFields, LeaseExtension};
use quarry_store::{JobStore, StoreError};

use crate::retry::{RetryDecision, RetryPolicy};

/// How a finished execution reported back
#[derive(Debug)]
pub enum ExecutionOutcome {
    Completed(serde_json::Value),
    Failed(String),
    Canceled,
    /// Stopped by shutdown before producing an outcome; not an attempt
    Interrupted,
}

/// What the release actually did to the record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseDisposition {
    Completed,
    Retried { delay: Duration },
    DeadLettered,
    Canceled,
    Requeued,
    /// Ownership was already gone; the release was a silent no-op
    Lost,
}

/// Claim/heartbeat/release/sweep operations for one worker
pub struct LeaseCoordinator {
    store: Arc<dyn JobStore>,
    worker_id: String,
    lease_duration: chrono::Duration,
    retry_policy: RetryPolicy,
}

impl LeaseCoordinator {
    pub fn new(
        store: Arc<dyn JobStore>,
        worker_id: String,
        lease_duration: Duration,
        retry_policy: RetryPolicy,
    ) -> Self {
        Self {
            store,
            worker_id,
            // Bounded by config validation, so the cast cannot truncate.
            lease_duration: chrono::Duration::milliseconds(lease_duration.as_millis() as i64),
            retry_policy,
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Attempts to claim one eligible job under a fresh lease.
    pub async fn claim(&self) -> Result<Option<Job>, StoreError> {
        let now = chrono::Utc::now();
        self.store
            .try_claim_one(&ClaimFilter::at(now), &self.worker_id, now + self.lease_duration)
            .await
    }

    /// Marks a claimed job running. False means ownership was already lost.
    pub async fn start(&self, job_id: Uuid) -> Result<bool, StoreError> {
        self.store.try_start(job_id, &self.worker_id).await
    }

    /// Renews the lease on an in-flight job.
    pub async fn heartbeat(&self, job_id: Uuid) -> Result<LeaseExtension, StoreError> {
        let now = chrono::Utc::now();
        self.store
            .try_extend_lease(job_id, &self.worker_id, now + self.lease_duration)
            .await
    }

    /// Records free-form progress on an owned job, best-effort.
    pub async fn update_progress(&self, job_id: Uuid, progress: &str) -> Result<bool, StoreError> {
        self.store
            .try_update_progress(job_id, &self.worker_id, progress)
            .await
    }

    /// Finalizes an execution, routing failures through the retry policy.
    ///
    /// The attempt count is incremented by the store atomically with the
    /// `failed`/`dead` transition; the policy decides on the count as it
    /// will be after that increment.
    pub async fn release(
        &self,
        job: &Job,
        outcome: ExecutionOutcome,
    ) -> Result<ReleaseDisposition, StoreError> {
        let (new_status, fields, disposition) = match outcome {
            ExecutionOutcome::Completed(result) => (
                FinalStatus::Completed,
                FinalizeFields::with_result(result),
                ReleaseDisposition::Completed,
            ),
            ExecutionOutcome::Canceled => (
                FinalStatus::Canceled,
                FinalizeFields::default(),
                ReleaseDisposition::Canceled,
            ),
            ExecutionOutcome::Interrupted => (
                FinalStatus::Requeued,
                FinalizeFields::default(),
                ReleaseDisposition::Requeued,
            ),
            ExecutionOutcome::Failed(error) => {
                let attempts_after = job.attempt_count + 1;
                match self.retry_policy.decide(attempts_after, job.max_attempts) {
                    RetryDecision::Retry { delay } => {
                        let gate = chrono::Utc::now()
                            + chrono::Duration::milliseconds(delay.as_millis() as i64);
                        let mut fields = FinalizeFields::with_error(error);
                        fields.retry_not_before = Some(gate);
                        (
                            FinalStatus::Failed,
                            fields,
                            ReleaseDisposition::Retried { delay },
                        )
                    }
                    RetryDecision::DeadLetter => (
                        FinalStatus::Dead,
                        FinalizeFields::with_error(error),
                        ReleaseDisposition::DeadLettered,
                    ),
                }
            }
        };

        let applied = self
            .store
            .try_finalize(job.id, &self.worker_id, new_status, &fields)
            .await?;

        if applied {
            Ok(disposition)
        } else {
            debug!(job_id = %job.id, "release was a no-op; ownership already gone");
            Ok(ReleaseDisposition::Lost)
        }
    }

    /// Expiry sweep: reclaims abandoned leases and promotes backoff-elapsed
    /// failures back to `pending`.
    pub async fn sweep_expired(&self) -> Result<u64, StoreError> {
        self.store.reap_expired(chrono::Utc::now()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quarry_core::domain::job::JobStatus;
    use quarry_core::dto::job::NewJob;
    use quarry_store::MemoryJobStore;

    fn coordinator(store: Arc<dyn JobStore>, worker_id: &str) -> LeaseCoordinator {
        let mut policy = RetryPolicy::default();
        policy.base_delay = Duration::ZERO;
        LeaseCoordinator::new(store, worker_id.to_string(), Duration::from_secs(300), policy)
    }

    #[tokio::test]
    async fn test_claim_start_heartbeat_release_cycle() {
        let store = Arc::new(MemoryJobStore::new());
        let coordinator = coordinator(store.clone(), "w1");

        let job = store
            .insert(NewJob::new(serde_json::json!({"task": "analyze"}), 3))
            .await
            .unwrap();

        let claimed = coordinator.claim().await.unwrap().expect("claimable job");
        assert_eq!(claimed.id, job.id);
        assert!(coordinator.start(job.id).await.unwrap());

        let extension = coordinator.heartbeat(job.id).await.unwrap();
        assert!(extension.extended);
        assert!(!extension.cancel_requested);

        let disposition = coordinator
            .release(&claimed, ExecutionOutcome::Completed(serde_json::json!("done")))
            .await
            .unwrap();
        assert_eq!(disposition, ReleaseDisposition::Completed);

        let done = store.get(job.id).await.unwrap();
        assert_eq!(done.status, JobStatus::Completed);
        assert_eq!(done.result, Some(serde_json::json!("done")));
        assert_eq!(done.owner_worker_id, None);
    }

    #[tokio::test]
    async fn test_failed_release_routes_through_retry_policy() {
        let store = Arc::new(MemoryJobStore::new());
        let coordinator = coordinator(store.clone(), "w1");

        let job = store
            .insert(NewJob::new(serde_json::Value::Null, 2))
            .await
            .unwrap();

        let claimed = coordinator.claim().await.unwrap().unwrap();
        let disposition = coordinator
            .release(&claimed, ExecutionOutcome::Failed("boom".into()))
            .await
            .unwrap();
        assert!(matches!(disposition, ReleaseDisposition::Retried { .. }));

        let after = store.get(job.id).await.unwrap();
        assert_eq!(after.status, JobStatus::Failed);
        assert_eq!(after.attempt_count, 1);
        assert_eq!(after.last_error.as_deref(), Some("boom"));

        // Promote past the backoff gate and fail again: attempts exhausted.
        coordinator.sweep_expired().await.unwrap();
        let reclaimed = coordinator.claim().await.unwrap().unwrap();
        let disposition = coordinator
            .release(&reclaimed, ExecutionOutcome::Failed("boom again".into()))
            .await
            .unwrap();
        assert_eq!(disposition, ReleaseDisposition::DeadLettered);

        let dead = store.get(job.id).await.unwrap();
        assert_eq!(dead.status, JobStatus::Dead);
        assert_eq!(dead.attempt_count, 2);
        assert!(coordinator.claim().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_release_after_reclaim_is_lost() {
        let store = Arc::new(MemoryJobStore::new());
        let a = coordinator(store.clone(), "worker-a");

        let job = store
            .insert(NewJob::new(serde_json::Value::Null, 3))
            .await
            .unwrap();
        let claimed_by_a = a.claim().await.unwrap().unwrap();

        // Worker B claims the job once A's lease has expired.
        let past = chrono::Utc::now() + chrono::Duration::minutes(10);
        store
            .try_claim_one(&ClaimFilter::at(past), "worker-b", past + chrono::Duration::minutes(5))
            .await
            .unwrap()
            .expect("expired lease must be reclaimable");

        let extension = a.heartbeat(job.id).await.unwrap();
        assert!(!extension.extended, "reclaim revokes the old lease");

        let disposition = a
            .release(&claimed_by_a, ExecutionOutcome::Completed(serde_json::Value::Null))
            .await
            .unwrap();
        assert_eq!(disposition, ReleaseDisposition::Lost);

        let current = store.get(job.id).await.unwrap();
        assert_eq!(current.owner_worker_id.as_deref(), Some("worker-b"));
        assert_eq!(current.status, JobStatus::Claimed);
    }

    #[tokio::test]
    async fn test_interrupted_release_requeues_without_attempt() {
        let store = Arc::new(MemoryJobStore::new());
        let coordinator = coordinator(store.clone(), "w1");

        let job = store
            .insert(NewJob::new(serde_json::Value::Null, 3))
            .await
            .unwrap();
        let claimed = coordinator.claim().await.unwrap().unwrap();

        let disposition = coordinator
            .release(&claimed, ExecutionOutcome::Interrupted)
            .await
            .unwrap();
        assert_eq!(disposition, ReleaseDisposition::Requeued);

        let after = store.get(job.id).await.unwrap();
        assert_eq!(after.status, JobStatus::Pending);
        assert_eq!(after.attempt_count, 0);
        assert_eq!(after.owner_worker_id, None);
    }
}
