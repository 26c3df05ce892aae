//! Worker runtime
//!
//! One logical loop per worker process: poll for claimable jobs while below
//! the concurrency limit, run each claim in its own task under a heartbeat,
//! and release on completion, failure, or cancellation. A shutdown signal
//! stops claiming immediately and drains in-flight work.
//!
//! The job record is the only shared mutable resource; everything the
//! runtime does against it goes through the store's conditional updates.

pub mod events;
mod heartbeat;

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tokio::sync::{Notify, Semaphore, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use quarry_core::domain::job::Job;
use quarry_store::JobStore;

use crate::config::WorkerConfig;
use crate::handler::{ExecutionContext, ExecutionError, JobHandler};
use crate::lease::{ExecutionOutcome, LeaseCoordinator, ReleaseDisposition};
use crate::retry::RetryPolicy;
use crate::stats::WorkerStats;
use events::{JobEvent, JobEventKind};

/// Per-execution flags set by the heartbeat task and read at release time.
#[derive(Default)]
pub(crate) struct JobFlags {
    lease_lost: AtomicBool,
    cancel_requested: AtomicBool,
}

impl JobFlags {
    pub(crate) fn mark_lease_lost(&self) {
        self.lease_lost.store(true, Ordering::SeqCst);
    }

    pub(crate) fn lease_lost(&self) -> bool {
        self.lease_lost.load(Ordering::SeqCst)
    }

    pub(crate) fn mark_cancel_requested(&self) {
        self.cancel_requested.store(true, Ordering::SeqCst);
    }

    pub(crate) fn cancel_requested(&self) -> bool {
        self.cancel_requested.load(Ordering::SeqCst)
    }
}

/// What one claim round observed, used to set the next poll delay
enum ClaimRound {
    Progressed,
    Idle,
    TransientError,
}

/// Poll loop, concurrency limiter, and cancellation fan-out for one worker
pub struct WorkerRuntime {
    config: WorkerConfig,
    coordinator: Arc<LeaseCoordinator>,
    handler: Arc<dyn JobHandler>,
    stats: Arc<WorkerStats>,
    semaphore: Arc<Semaphore>,
    shutdown: CancellationToken,
    active: Arc<Mutex<HashSet<Uuid>>>,
    slot_freed: Arc<Notify>,
    events_tx: mpsc::UnboundedSender<JobEvent>,
    events_rx: Option<mpsc::UnboundedReceiver<JobEvent>>,
}

impl WorkerRuntime {
    /// Creates a runtime with the default retry policy.
    pub fn new(
        config: WorkerConfig,
        store: Arc<dyn JobStore>,
        handler: Arc<dyn JobHandler>,
        shutdown: CancellationToken,
    ) -> Self {
        Self::with_retry_policy(config, store, handler, shutdown, RetryPolicy::default())
    }

    pub fn with_retry_policy(
        config: WorkerConfig,
        store: Arc<dyn JobStore>,
        handler: Arc<dyn JobHandler>,
        shutdown: CancellationToken,
        retry_policy: RetryPolicy,
    ) -> Self {
        let coordinator = Arc::new(LeaseCoordinator::new(
            store,
            config.worker_id.clone(),
            config.lease_duration,
            retry_policy,
        ));
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        Self {
            semaphore: Arc::new(Semaphore::new(config.max_concurrent_jobs)),
            coordinator,
            handler,
            stats: Arc::new(WorkerStats::default()),
            shutdown,
            active: Arc::new(Mutex::new(HashSet::new())),
            slot_freed: Arc::new(Notify::new()),
            events_tx,
            events_rx: Some(events_rx),
            config,
        }
    }

    /// Shared handle to the live counters, for the health reporter.
    pub fn stats(&self) -> Arc<WorkerStats> {
        Arc::clone(&self.stats)
    }

    /// Runs the poll loop until shutdown, then drains in-flight jobs.
    pub async fn run(mut self) -> anyhow::Result<()> {
        info!(
            worker_id = %self.coordinator.worker_id(),
            "starting worker runtime (poll interval: {:?}, max concurrent: {})",
            self.config.poll_interval,
            self.config.max_concurrent_jobs,
        );

        let events_task = self.spawn_events_task()?;

        let mut delay = self.config.poll_interval;
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
                // A finished job frees its slot immediately; claim again
                // without waiting for the next tick.
                _ = self.slot_freed.notified() => {}
            }

            match self.coordinator.sweep_expired().await {
                Ok(0) => {}
                Ok(swept) => debug!(swept, "expiry sweep returned jobs to pending"),
                Err(err) if err.is_transient() => {
                    warn!("expiry sweep failed transiently: {err}")
                }
                Err(err) => error!("expiry sweep failed: {err}"),
            }

            delay = match self.claim_available().await {
                ClaimRound::TransientError => self.config.poll_interval * 2,
                ClaimRound::Progressed | ClaimRound::Idle => self.config.poll_interval,
            };
        }

        self.drain().await;
        events_task.abort();
        info!("worker runtime stopped");
        Ok(())
    }

    /// Claims jobs until capacity is full or the store runs dry.
    async fn claim_available(&self) -> ClaimRound {
        let mut round = ClaimRound::Idle;
        loop {
            if self.shutdown.is_cancelled() {
                return round;
            }
            let Ok(permit) = Arc::clone(&self.semaphore).try_acquire_owned() else {
                return round;
            };

            match self.coordinator.claim().await {
                Ok(Some(job)) => {
                    self.spawn_job_task(job, permit);
                    round = ClaimRound::Progressed;
                }
                Ok(None) => return round,
                Err(err) if err.is_transient() => {
                    warn!("claim failed transiently: {err}");
                    return ClaimRound::TransientError;
                }
                Err(err) => {
                    error!("claim failed: {err}");
                    return round;
                }
            }
        }
    }

    /// Spawns the execution task for a freshly claimed job.
    fn spawn_job_task(&self, job: Job, permit: tokio::sync::OwnedSemaphorePermit) {
        let job_id = job.id;
        let job_token = self.shutdown.child_token();
        self.active.lock().unwrap().insert(job_id);
        let _ = self.events_tx.send(JobEvent::new(job_id, JobEventKind::Claimed));

        let coordinator = Arc::clone(&self.coordinator);
        let handler = Arc::clone(&self.handler);
        let events = self.events_tx.clone();
        let active = Arc::clone(&self.active);
        let slot_freed = Arc::clone(&self.slot_freed);
        let shutdown = self.shutdown.clone();
        let heartbeat_interval = self.config.heartbeat_interval;

        tokio::spawn(async move {
            let _permit = permit;
            let flags = Arc::new(JobFlags::default());
            let heartbeat = heartbeat::spawn(
                Arc::clone(&coordinator),
                job_id,
                heartbeat_interval,
                job_token.clone(),
                Arc::clone(&flags),
            );

            let started = Instant::now();
            let result = execute_job(
                handler.as_ref(),
                coordinator.as_ref(),
                &job,
                &job_token,
                &events,
                flags.as_ref(),
            )
            .await;
            heartbeat.abort();
            let elapsed = started.elapsed();

            if flags.lease_lost() {
                // Ownership is gone; finalizing now would clobber the new
                // owner.
                warn!(job_id = %job_id, "execution aborted after lease loss; no release attempted");
                let _ = events.send(
                    JobEvent::new(job_id, JobEventKind::LeaseLost).with_elapsed(elapsed),
                );
            } else {
                let outcome = match result {
                    Ok(value) => ExecutionOutcome::Completed(value),
                    Err(ExecutionError::Failed(message)) => ExecutionOutcome::Failed(message),
                    Err(ExecutionError::Canceled) => {
                        if flags.cancel_requested() {
                            ExecutionOutcome::Canceled
                        } else if shutdown.is_cancelled() {
                            ExecutionOutcome::Interrupted
                        } else {
                            ExecutionOutcome::Canceled
                        }
                    }
                };

                match coordinator.release(&job, outcome).await {
                    Ok(disposition) => {
                        info!(job_id = %job_id, ?disposition, "job released");
                        let kind = match disposition {
                            ReleaseDisposition::Completed => JobEventKind::Completed,
                            ReleaseDisposition::Retried { .. } => JobEventKind::Retried,
                            ReleaseDisposition::DeadLettered => JobEventKind::DeadLettered,
                            ReleaseDisposition::Canceled => JobEventKind::Canceled,
                            ReleaseDisposition::Requeued => JobEventKind::Requeued,
                            ReleaseDisposition::Lost => JobEventKind::LeaseLost,
                        };
                        let _ = events.send(JobEvent::new(job_id, kind).with_elapsed(elapsed));
                    }
                    Err(err) => {
                        // The lease stays put and expires on its own; some
                        // other worker reclaims the job.
                        error!(job_id = %job_id, "release failed: {err}");
                        let _ = events.send(
                            JobEvent::new(job_id, JobEventKind::LeaseLost).with_elapsed(elapsed),
                        );
                    }
                }
            }

            active.lock().unwrap().remove(&job_id);
            drop(_permit);
            slot_freed.notify_one();
        });
    }

    /// Consumes the job event stream: counters first, then store-side
    /// progress writes.
    fn spawn_events_task(&mut self) -> anyhow::Result<JoinHandle<()>> {
        let mut rx = self
            .events_rx
            .take()
            .ok_or_else(|| anyhow::anyhow!("runtime already started"))?;
        let stats = Arc::clone(&self.stats);
        let coordinator = Arc::clone(&self.coordinator);

        Ok(tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                stats.record(&event);
                if event.kind == JobEventKind::Progress {
                    if let Some(message) = &event.message {
                        match coordinator.update_progress(event.job_id, message).await {
                            Ok(true) => {}
                            Ok(false) => {
                                debug!(job_id = %event.job_id, "progress dropped; ownership gone")
                            }
                            Err(err) => {
                                warn!(job_id = %event.job_id, "failed to record progress: {err}")
                            }
                        }
                    }
                }
            }
        }))
    }

    /// Waits for in-flight jobs after shutdown.
    ///
    /// The per-job tokens are children of the shutdown token, so every
    /// execution already has its stop signal by the time this runs. Jobs
    /// that do not finish within the timeout keep their leases; forcing a
    /// release here would report an outcome for work we could not observe.
    async fn drain(&self) {
        let active_now = self.active.lock().unwrap().len();
        if active_now == 0 {
            info!("shutdown with no jobs in flight");
            return;
        }
        info!(
            active = active_now,
            "draining: waiting up to {:?} for in-flight jobs", self.config.drain_timeout
        );

        let deadline = tokio::time::Instant::now() + self.config.drain_timeout;
        while tokio::time::Instant::now() < deadline {
            if self.active.lock().unwrap().is_empty() {
                info!("drain complete");
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(25)).await;
        }

        let abandoned: Vec<Uuid> = self.active.lock().unwrap().iter().copied().collect();
        warn!(
            jobs = ?abandoned,
            "drain timeout; leases left intact for reclaim by another worker"
        );
    }
}

/// Marks the job running and hands it to the engine.
async fn execute_job(
    handler: &dyn JobHandler,
    coordinator: &LeaseCoordinator,
    job: &Job,
    token: &CancellationToken,
    events: &mpsc::UnboundedSender<JobEvent>,
    flags: &JobFlags,
) -> Result<serde_json::Value, ExecutionError> {
    match coordinator.start(job.id).await {
        Ok(true) => {}
        Ok(false) => {
            // Ownership vanished between claim and start.
            flags.mark_lease_lost();
            return Err(ExecutionError::Canceled);
        }
        Err(err) => {
            // The claimed lease is still valid; `running` is an optional
            // marker, expiry handling treats both states the same.
            warn!(job_id = %job.id, "failed to mark job running: {err}");
        }
    }

    let _ = events.send(JobEvent::new(job.id, JobEventKind::Started));
    let ctx = ExecutionContext::new(job.id, token.clone(), events.clone());
    handler.run(job, &ctx).await
}
