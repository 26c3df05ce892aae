//! Job record store interface
//!
//! Every mutation is an atomic conditional update: the store applies the
//! change only if the record's current ownership and status match the
//! caller's expectation, and reports whether it did. Workers never
//! communicate with each other directly; this contract is the sole
//! cross-worker ordering guarantee.

use async_trait::async_trait;
use uuid::Uuid;

use quarry_core::domain::job::Job;
use quarry_core::dto::job::{ClaimFilter, FinalStatus, FinalizeFields, LeaseExtension, NewJob};

use crate::error::StoreError;

/// Narrow interface to the durable job table.
///
/// Implementations must guarantee that each method is atomic with respect to
/// every other method: two workers racing `try_claim_one` on the same record
/// never both succeed, and a worker whose lease was reclaimed can never
/// clobber the new owner's state through `try_finalize`.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Enqueues a new job in `pending` with a zero attempt count.
    async fn insert(&self, new: NewJob) -> Result<Job, StoreError>;

    /// Fetches a job by id.
    async fn get(&self, job_id: Uuid) -> Result<Job, StoreError>;

    /// Claims at most one eligible job for `new_owner`.
    ///
    /// Eligible: `pending`, or owned (`claimed`/`running`) with a lease that
    /// expired before `filter.now`. Selection is oldest `created_at` first
    /// to bound starvation. On success the record atomically becomes
    /// `claimed` with `owner_worker_id = new_owner`,
    /// `lease_expires_at = lease_until` and `last_error` cleared.
    ///
    /// Eligible candidates carrying the cancellation flag are finalized to
    /// `canceled` during selection and are never returned; a cancel
    /// requested on a never-claimed job therefore takes effect at the next
    /// claim attempt against the store.
    async fn try_claim_one(
        &self,
        filter: &ClaimFilter,
        new_owner: &str,
        lease_until: chrono::DateTime<chrono::Utc>,
    ) -> Result<Option<Job>, StoreError>;

    /// Marks a claimed job `running`, conditioned on ownership.
    ///
    /// Returns false when ownership was already lost.
    async fn try_start(&self, job_id: Uuid, owner_id: &str) -> Result<bool, StoreError>;

    /// Extends the lease to `lease_until`, conditioned on `owner_id` still
    /// owning the job.
    ///
    /// A failed extension means the lease was lost; the caller must abort
    /// its in-flight execution and must not finalize. The job's
    /// cancellation flag rides along on success so the owner observes
    /// cancel requests at heartbeat cadence.
    async fn try_extend_lease(
        &self,
        job_id: Uuid,
        owner_id: &str,
        lease_until: chrono::DateTime<chrono::Utc>,
    ) -> Result<LeaseExtension, StoreError>;

    /// Finalizes an owned job, conditioned on `owner_id` still owning it.
    ///
    /// Returns false (a silent no-op) when ownership was lost: the job has
    /// moved on and the new owner's state is left untouched. Finalizing to
    /// `Failed` or `Dead` increments the attempt count atomically with the
    /// status transition; for `Failed`, `fields.retry_not_before` is stored
    /// as the backoff gate the expiry sweep honors before promoting the job
    /// back to `pending`.
    async fn try_finalize(
        &self,
        job_id: Uuid,
        owner_id: &str,
        new_status: FinalStatus,
        fields: &FinalizeFields,
    ) -> Result<bool, StoreError>;

    /// Records free-form progress, conditioned on ownership. Best-effort:
    /// returns false when ownership was lost.
    async fn try_update_progress(
        &self,
        job_id: Uuid,
        owner_id: &str,
        progress: &str,
    ) -> Result<bool, StoreError>;

    /// Sets the advisory cancellation flag without touching status or lease.
    ///
    /// A no-op on jobs already in a terminal state.
    async fn request_cancel(&self, job_id: Uuid) -> Result<(), StoreError>;

    /// Expiry sweep: returns owned jobs with expired leases to `pending`
    /// (a reclaim is not a failed attempt, so the attempt count is untouched)
    /// and promotes `failed` jobs whose backoff gate has passed back to
    /// `pending`. Returns the number of records swept.
    async fn reap_expired(
        &self,
        now: chrono::DateTime<chrono::Utc>,
    ) -> Result<u64, StoreError>;
}
