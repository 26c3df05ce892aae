//! In-memory job store
//!
//! Backs tests and local development. A single mutex around the job table
//! makes every operation atomic, giving the same conditional-update
//! semantics as the Postgres backend without a database.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use uuid::Uuid;

use quarry_core::domain::job::{Job, JobStatus};
use quarry_core::dto::job::{ClaimFilter, FinalStatus, FinalizeFields, LeaseExtension, NewJob};

use crate::error::StoreError;
use crate::store::JobStore;

/// Mutex-backed job table
#[derive(Default)]
pub struct MemoryJobStore {
    jobs: Mutex<HashMap<Uuid, Job>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of jobs currently in the given status.
    pub fn count_in_status(&self, status: JobStatus) -> usize {
        self.jobs
            .lock()
            .unwrap()
            .values()
            .filter(|job| job.status == status)
            .count()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn insert(&self, new: NewJob) -> Result<Job, StoreError> {
        let now = chrono::Utc::now();
        let job = Job {
            id: Uuid::new_v4(),
            status: JobStatus::Pending,
            payload: new.payload,
            owner_worker_id: None,
            lease_expires_at: None,
            attempt_count: 0,
            max_attempts: new.max_attempts,
            progress: None,
            cancel_requested: false,
            result: None,
            last_error: None,
            created_at: now,
            updated_at: now,
        };
        self.jobs.lock().unwrap().insert(job.id, job.clone());
        Ok(job)
    }

    async fn get(&self, job_id: Uuid) -> Result<Job, StoreError> {
        self.jobs
            .lock()
            .unwrap()
            .get(&job_id)
            .cloned()
            .ok_or(StoreError::NotFound(job_id))
    }

    async fn try_claim_one(
        &self,
        filter: &ClaimFilter,
        new_owner: &str,
        lease_until: chrono::DateTime<chrono::Utc>,
    ) -> Result<Option<Job>, StoreError> {
        let mut jobs = self.jobs.lock().unwrap();

        let eligible = |job: &Job| {
            job.status == JobStatus::Pending
                || (job.status.is_owned() && job.lease_expired(filter.now))
        };

        // Cancel-requested candidates leave the claimable set here; a claim
        // attempt observes them and finalizes them instead of running them.
        for job in jobs.values_mut() {
            if job.cancel_requested && eligible(job) {
                job.status = JobStatus::Canceled;
                job.owner_worker_id = None;
                job.lease_expires_at = None;
                job.updated_at = filter.now;
            }
        }

        let candidate = jobs
            .values()
            .filter(|job| !job.cancel_requested && eligible(job))
            .min_by_key(|job| job.created_at)
            .map(|job| job.id);

        let Some(id) = candidate else {
            return Ok(None);
        };

        let job = jobs.get_mut(&id).expect("candidate selected under lock");
        job.status = JobStatus::Claimed;
        job.owner_worker_id = Some(new_owner.to_string());
        job.lease_expires_at = Some(lease_until);
        job.last_error = None;
        job.updated_at = filter.now;
        Ok(Some(job.clone()))
    }

    async fn try_start(&self, job_id: Uuid, owner_id: &str) -> Result<bool, StoreError> {
        let mut jobs = self.jobs.lock().unwrap();
        match jobs.get_mut(&job_id) {
            Some(job)
                if job.status == JobStatus::Claimed
                    && job.owner_worker_id.as_deref() == Some(owner_id) =>
            {
                job.status = JobStatus::Running;
                job.updated_at = chrono::Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn try_extend_lease(
        &self,
        job_id: Uuid,
        owner_id: &str,
        lease_until: chrono::DateTime<chrono::Utc>,
    ) -> Result<LeaseExtension, StoreError> {
        let mut jobs = self.jobs.lock().unwrap();
        match jobs.get_mut(&job_id) {
            Some(job)
                if job.status.is_owned() && job.owner_worker_id.as_deref() == Some(owner_id) =>
            {
                job.lease_expires_at = Some(lease_until);
                job.updated_at = chrono::Utc::now();
                Ok(LeaseExtension {
                    extended: true,
                    cancel_requested: job.cancel_requested,
                })
            }
            _ => Ok(LeaseExtension::lost()),
        }
    }

    async fn try_finalize(
        &self,
        job_id: Uuid,
        owner_id: &str,
        new_status: FinalStatus,
        fields: &FinalizeFields,
    ) -> Result<bool, StoreError> {
        let mut jobs = self.jobs.lock().unwrap();
        match jobs.get_mut(&job_id) {
            Some(job)
                if job.status.is_owned() && job.owner_worker_id.as_deref() == Some(owner_id) =>
            {
                job.status = new_status.as_job_status();
                job.owner_worker_id = None;
                job.lease_expires_at = if new_status == FinalStatus::Failed {
                    fields.retry_not_before
                } else {
                    None
                };
                if new_status.counts_as_attempt() {
                    job.attempt_count += 1;
                }
                job.last_error = fields.last_error.clone();
                if let Some(result) = &fields.result {
                    job.result = Some(result.clone());
                }
                if let Some(progress) = &fields.progress {
                    job.progress = Some(progress.clone());
                }
                job.updated_at = chrono::Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn try_update_progress(
        &self,
        job_id: Uuid,
        owner_id: &str,
        progress: &str,
    ) -> Result<bool, StoreError> {
        let mut jobs = self.jobs.lock().unwrap();
        match jobs.get_mut(&job_id) {
            Some(job)
                if job.status.is_owned() && job.owner_worker_id.as_deref() == Some(owner_id) =>
            {
                job.progress = Some(progress.to_string());
                job.updated_at = chrono::Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn request_cancel(&self, job_id: Uuid) -> Result<(), StoreError> {
        let mut jobs = self.jobs.lock().unwrap();
        let job = jobs.get_mut(&job_id).ok_or(StoreError::NotFound(job_id))?;
        if !job.status.is_terminal() {
            job.cancel_requested = true;
            job.updated_at = chrono::Utc::now();
        }
        Ok(())
    }

    async fn reap_expired(
        &self,
        now: chrono::DateTime<chrono::Utc>,
    ) -> Result<u64, StoreError> {
        let mut jobs = self.jobs.lock().unwrap();
        let mut swept = 0;
        for job in jobs.values_mut() {
            let reclaim = job.lease_expired(now);
            let retry_due = job.status == JobStatus::Failed
                && job.lease_expires_at.map(|gate| gate <= now).unwrap_or(true);
            if reclaim || retry_due {
                job.status = JobStatus::Pending;
                job.owner_worker_id = None;
                job.lease_expires_at = None;
                job.updated_at = now;
                swept += 1;
            }
        }
        Ok(swept)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_claim_selects_oldest_pending_first() {
        let store = MemoryJobStore::new();
        let first = store
            .insert(NewJob::new(serde_json::json!({"n": 1}), 3))
            .await
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        store
            .insert(NewJob::new(serde_json::json!({"n": 2}), 3))
            .await
            .unwrap();

        let now = chrono::Utc::now();
        let claimed = store
            .try_claim_one(&ClaimFilter::at(now), "w1", now + chrono::Duration::minutes(5))
            .await
            .unwrap()
            .expect("a pending job");
        assert_eq!(claimed.id, first.id);
        assert_eq!(claimed.status, JobStatus::Claimed);
        assert_eq!(claimed.owner_worker_id.as_deref(), Some("w1"));
    }

    #[tokio::test]
    async fn test_claim_clears_previous_error() {
        let store = MemoryJobStore::new();
        let job = store
            .insert(NewJob::new(serde_json::Value::Null, 3))
            .await
            .unwrap();
        {
            let mut jobs = store.jobs.lock().unwrap();
            jobs.get_mut(&job.id).unwrap().last_error = Some("boom".into());
        }

        let now = chrono::Utc::now();
        let claimed = store
            .try_claim_one(&ClaimFilter::at(now), "w1", now + chrono::Duration::minutes(5))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(claimed.last_error, None);
    }

    #[tokio::test]
    async fn test_start_requires_claimed_by_owner() {
        let store = MemoryJobStore::new();
        let job = store
            .insert(NewJob::new(serde_json::Value::Null, 3))
            .await
            .unwrap();
        let now = chrono::Utc::now();
        store
            .try_claim_one(&ClaimFilter::at(now), "w1", now + chrono::Duration::minutes(5))
            .await
            .unwrap()
            .unwrap();

        assert!(!store.try_start(job.id, "w2").await.unwrap());
        assert!(store.try_start(job.id, "w1").await.unwrap());
        // Already running: a second start is not a legal transition.
        assert!(!store.try_start(job.id, "w1").await.unwrap());
    }
}
