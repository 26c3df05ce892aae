//! Lease protocol tests
//!
//! Exercises the conditional-update contract every store backend must
//! honor: claims are mutually exclusive, expired leases are reclaimable,
//! finalization is ownership-gated, and attempt accounting only moves on
//! real execution failures.

use std::collections::HashSet;
use std::sync::Arc;

use quarry_core::domain::job::JobStatus;
use quarry_core::dto::job::{ClaimFilter, FinalStatus, FinalizeFields, NewJob};
use quarry_store::{JobStore, MemoryJobStore, StoreError};

fn minutes(n: i64) -> chrono::Duration {
    chrono::Duration::minutes(n)
}

async fn seed(store: &MemoryJobStore, count: usize, max_attempts: i32) {
    for n in 0..count {
        store
            .insert(NewJob::new(serde_json::json!({ "n": n }), max_attempts))
            .await
            .unwrap();
    }
}

#[tokio::test]
async fn test_concurrent_claims_never_share_a_job() {
    let store = Arc::new(MemoryJobStore::new());
    seed(&store, 30, 3).await;

    let mut workers = Vec::new();
    for w in 0..8 {
        let store = Arc::clone(&store);
        workers.push(tokio::spawn(async move {
            let worker_id = format!("worker-{w}");
            let mut claimed = Vec::new();
            loop {
                let now = chrono::Utc::now();
                match store
                    .try_claim_one(&ClaimFilter::at(now), &worker_id, now + minutes(5))
                    .await
                    .unwrap()
                {
                    Some(job) => {
                        assert_eq!(job.owner_worker_id.as_deref(), Some(worker_id.as_str()));
                        claimed.push(job.id);
                    }
                    None => break,
                }
            }
            claimed
        }));
    }

    let mut all_claims = Vec::new();
    for worker in workers {
        all_claims.extend(worker.await.unwrap());
    }

    let distinct: HashSet<_> = all_claims.iter().copied().collect();
    assert_eq!(all_claims.len(), 30, "every job claimed exactly once");
    assert_eq!(distinct.len(), 30, "no job claimed by two workers");
    assert_eq!(store.count_in_status(JobStatus::Claimed), 30);
}

#[tokio::test]
async fn test_reclaim_waits_for_lease_expiry() {
    let store = MemoryJobStore::new();
    let job = store
        .insert(NewJob::new(serde_json::Value::Null, 3))
        .await
        .unwrap();

    let t0 = chrono::Utc::now();
    let claimed = store
        .try_claim_one(&ClaimFilter::at(t0), "worker-a", t0 + minutes(5))
        .await
        .unwrap()
        .expect("pending job");
    assert_eq!(claimed.id, job.id);

    // Worker A crashes without heartbeating. Before the lease expires the
    // job stays invisible to other workers.
    let before_expiry = store
        .try_claim_one(&ClaimFilter::at(t0 + minutes(4)), "worker-b", t0 + minutes(9))
        .await
        .unwrap();
    assert!(before_expiry.is_none());

    let reclaimed = store
        .try_claim_one(&ClaimFilter::at(t0 + minutes(6)), "worker-b", t0 + minutes(11))
        .await
        .unwrap()
        .expect("expired lease is reclaimable");
    assert_eq!(reclaimed.id, job.id);
    assert_eq!(reclaimed.owner_worker_id.as_deref(), Some("worker-b"));
    // A reclaim is not a failed attempt.
    assert_eq!(reclaimed.attempt_count, 0);
}

#[tokio::test]
async fn test_finalize_requires_current_ownership() {
    let store = MemoryJobStore::new();
    let job = store
        .insert(NewJob::new(serde_json::Value::Null, 3))
        .await
        .unwrap();

    let t0 = chrono::Utc::now();
    store
        .try_claim_one(&ClaimFilter::at(t0), "worker-a", t0 + minutes(5))
        .await
        .unwrap()
        .unwrap();
    store
        .try_claim_one(&ClaimFilter::at(t0 + minutes(6)), "worker-b", t0 + minutes(11))
        .await
        .unwrap()
        .unwrap();

    // Worker A comes back from the dead and tries to report success; the
    // release must not clobber worker B's state.
    let applied = store
        .try_finalize(
            job.id,
            "worker-a",
            FinalStatus::Completed,
            &FinalizeFields::with_result(serde_json::json!("stale")),
        )
        .await
        .unwrap();
    assert!(!applied);

    let current = store.get(job.id).await.unwrap();
    assert_eq!(current.status, JobStatus::Claimed);
    assert_eq!(current.owner_worker_id.as_deref(), Some("worker-b"));
    assert_eq!(current.result, None);
}

#[tokio::test]
async fn test_attempts_increment_until_dead() {
    let store = MemoryJobStore::new();
    let job = store
        .insert(NewJob::new(serde_json::Value::Null, 3))
        .await
        .unwrap();

    let mut t = chrono::Utc::now();
    for attempt in 1..=3 {
        let claimed = store
            .try_claim_one(&ClaimFilter::at(t), "w1", t + minutes(5))
            .await
            .unwrap()
            .expect("job claimable for another attempt");
        assert_eq!(claimed.attempt_count, attempt - 1);

        let status = if attempt == 3 {
            FinalStatus::Dead
        } else {
            FinalStatus::Failed
        };
        let mut fields = FinalizeFields::with_error(format!("attempt {attempt} failed"));
        fields.retry_not_before = Some(t + minutes(1));
        assert!(store.try_finalize(job.id, "w1", status, &fields).await.unwrap());

        let after = store.get(job.id).await.unwrap();
        assert_eq!(after.attempt_count, attempt);

        // Let the backoff gate pass, then promote the retry.
        t += minutes(2);
        store.reap_expired(t).await.unwrap();
    }

    let dead = store.get(job.id).await.unwrap();
    assert_eq!(dead.status, JobStatus::Dead);
    assert_eq!(dead.attempt_count, 3);

    // A dead job never re-enters the claimable set.
    let claim = store
        .try_claim_one(&ClaimFilter::at(t + minutes(60)), "w2", t + minutes(65))
        .await
        .unwrap();
    assert!(claim.is_none());
}

#[tokio::test]
async fn test_cancel_on_pending_is_observed_at_claim() {
    let store = MemoryJobStore::new();
    let job = store
        .insert(NewJob::new(serde_json::Value::Null, 3))
        .await
        .unwrap();

    store.request_cancel(job.id).await.unwrap();

    let now = chrono::Utc::now();
    let claim = store
        .try_claim_one(&ClaimFilter::at(now), "w1", now + minutes(5))
        .await
        .unwrap();
    assert!(claim.is_none(), "canceled work is never handed out");

    let canceled = store.get(job.id).await.unwrap();
    assert_eq!(canceled.status, JobStatus::Canceled);
    assert_eq!(canceled.owner_worker_id, None);
    assert_eq!(canceled.attempt_count, 0);
}

#[tokio::test]
async fn test_cancel_flag_rides_on_heartbeat() {
    let store = MemoryJobStore::new();
    let job = store
        .insert(NewJob::new(serde_json::Value::Null, 3))
        .await
        .unwrap();

    let t0 = chrono::Utc::now();
    store
        .try_claim_one(&ClaimFilter::at(t0), "w1", t0 + minutes(5))
        .await
        .unwrap()
        .unwrap();

    let extension = store
        .try_extend_lease(job.id, "w1", t0 + minutes(10))
        .await
        .unwrap();
    assert!(extension.extended);
    assert!(!extension.cancel_requested);

    store.request_cancel(job.id).await.unwrap();

    let extension = store
        .try_extend_lease(job.id, "w1", t0 + minutes(15))
        .await
        .unwrap();
    assert!(extension.extended, "cancellation does not revoke the lease");
    assert!(extension.cancel_requested);

    // Status and ownership are untouched by the request itself.
    let current = store.get(job.id).await.unwrap();
    assert_eq!(current.status, JobStatus::Claimed);
    assert_eq!(current.owner_worker_id.as_deref(), Some("w1"));
}

#[tokio::test]
async fn test_heartbeat_fails_after_reclaim() {
    let store = MemoryJobStore::new();
    let job = store
        .insert(NewJob::new(serde_json::Value::Null, 3))
        .await
        .unwrap();

    let t0 = chrono::Utc::now();
    store
        .try_claim_one(&ClaimFilter::at(t0), "worker-a", t0 + minutes(5))
        .await
        .unwrap()
        .unwrap();
    store
        .try_claim_one(&ClaimFilter::at(t0 + minutes(6)), "worker-b", t0 + minutes(11))
        .await
        .unwrap()
        .unwrap();

    let extension = store
        .try_extend_lease(job.id, "worker-a", t0 + minutes(12))
        .await
        .unwrap();
    assert!(!extension.extended);

    // The new owner heartbeats fine.
    let extension = store
        .try_extend_lease(job.id, "worker-b", t0 + minutes(12))
        .await
        .unwrap();
    assert!(extension.extended);
}

#[tokio::test]
async fn test_reap_promotes_failed_jobs_after_backoff() {
    let store = MemoryJobStore::new();
    let job = store
        .insert(NewJob::new(serde_json::Value::Null, 3))
        .await
        .unwrap();

    let t0 = chrono::Utc::now();
    store
        .try_claim_one(&ClaimFilter::at(t0), "w1", t0 + minutes(5))
        .await
        .unwrap()
        .unwrap();

    let mut fields = FinalizeFields::with_error("flaky dependency");
    fields.retry_not_before = Some(t0 + minutes(5));
    store
        .try_finalize(job.id, "w1", FinalStatus::Failed, &fields)
        .await
        .unwrap();

    // Before the gate: the sweep leaves the job parked in failed.
    assert_eq!(store.reap_expired(t0 + minutes(1)).await.unwrap(), 0);
    assert_eq!(store.get(job.id).await.unwrap().status, JobStatus::Failed);

    // After the gate: promoted back to pending, attempts preserved.
    assert_eq!(store.reap_expired(t0 + minutes(6)).await.unwrap(), 1);
    let promoted = store.get(job.id).await.unwrap();
    assert_eq!(promoted.status, JobStatus::Pending);
    assert_eq!(promoted.attempt_count, 1);
    assert_eq!(promoted.lease_expires_at, None);
}

#[tokio::test]
async fn test_reap_reclaims_abandoned_leases() {
    let store = MemoryJobStore::new();
    let job = store
        .insert(NewJob::new(serde_json::Value::Null, 3))
        .await
        .unwrap();

    let t0 = chrono::Utc::now();
    store
        .try_claim_one(&ClaimFilter::at(t0), "w1", t0 + minutes(5))
        .await
        .unwrap()
        .unwrap();
    store.try_start(job.id, "w1").await.unwrap();

    assert_eq!(store.reap_expired(t0 + minutes(4)).await.unwrap(), 0);

    assert_eq!(store.reap_expired(t0 + minutes(6)).await.unwrap(), 1);
    let reclaimed = store.get(job.id).await.unwrap();
    assert_eq!(reclaimed.status, JobStatus::Pending);
    assert_eq!(reclaimed.owner_worker_id, None);
    assert_eq!(reclaimed.attempt_count, 0);
}

#[tokio::test]
async fn test_cancel_is_a_noop_on_terminal_jobs() {
    let store = MemoryJobStore::new();
    let job = store
        .insert(NewJob::new(serde_json::Value::Null, 3))
        .await
        .unwrap();

    let t0 = chrono::Utc::now();
    store
        .try_claim_one(&ClaimFilter::at(t0), "w1", t0 + minutes(5))
        .await
        .unwrap()
        .unwrap();
    store
        .try_finalize(
            job.id,
            "w1",
            FinalStatus::Completed,
            &FinalizeFields::with_result(serde_json::json!("done")),
        )
        .await
        .unwrap();

    store.request_cancel(job.id).await.unwrap();
    let current = store.get(job.id).await.unwrap();
    assert_eq!(current.status, JobStatus::Completed);
    assert!(!current.cancel_requested);
}

#[tokio::test]
async fn test_cancel_of_unknown_job_is_an_error() {
    let store = MemoryJobStore::new();
    let missing = uuid::Uuid::new_v4();
    assert!(matches!(
        store.request_cancel(missing).await,
        Err(StoreError::NotFound(id)) if id == missing
    ));
}
