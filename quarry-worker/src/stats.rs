//! Worker statistics
//!
//! An explicit counter struct owned by the runtime instance and shared by
//! reference with the health reporter. No process-wide state; two runtimes
//! in one process keep separate books.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::runtime::events::{JobEvent, JobEventKind};

/// Live counters, updated from the job event stream
#[derive(Debug, Default)]
pub struct WorkerStats {
    claimed_total: AtomicU64,
    completed_total: AtomicU64,
    retried_total: AtomicU64,
    dead_lettered_total: AtomicU64,
    canceled_total: AtomicU64,
    requeued_total: AtomicU64,
    lease_lost_total: AtomicU64,
    active_jobs: AtomicU64,
    execution_millis_total: AtomicU64,
    executions_timed: AtomicU64,
}

impl WorkerStats {
    /// Folds one job event into the counters.
    pub fn record(&self, event: &JobEvent) {
        match event.kind {
            JobEventKind::Claimed => {
                self.claimed_total.fetch_add(1, Ordering::Relaxed);
                self.active_jobs.fetch_add(1, Ordering::Relaxed);
            }
            JobEventKind::Started | JobEventKind::Progress => {}
            JobEventKind::Completed => {
                self.completed_total.fetch_add(1, Ordering::Relaxed);
            }
            JobEventKind::Retried => {
                self.retried_total.fetch_add(1, Ordering::Relaxed);
            }
            JobEventKind::DeadLettered => {
                self.dead_lettered_total.fetch_add(1, Ordering::Relaxed);
            }
            JobEventKind::Canceled => {
                self.canceled_total.fetch_add(1, Ordering::Relaxed);
            }
            JobEventKind::Requeued => {
                self.requeued_total.fetch_add(1, Ordering::Relaxed);
            }
            JobEventKind::LeaseLost => {
                self.lease_lost_total.fetch_add(1, Ordering::Relaxed);
            }
        }

        if event.kind.ends_execution() {
            // Saturating: a stray event must not wrap the gauge.
            let _ = self.active_jobs.fetch_update(
                Ordering::Relaxed,
                Ordering::Relaxed,
                |current| current.checked_sub(1),
            );
            if let Some(elapsed) = event.elapsed {
                self.execution_millis_total
                    .fetch_add(elapsed.as_millis() as u64, Ordering::Relaxed);
                self.executions_timed.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub fn active_jobs(&self) -> u64 {
        self.active_jobs.load(Ordering::Relaxed)
    }

    /// Read-only snapshot for the metrics endpoint.
    pub fn snapshot(&self) -> StatsSnapshot {
        let timed = self.executions_timed.load(Ordering::Relaxed);
        let millis = self.execution_millis_total.load(Ordering::Relaxed);
        StatsSnapshot {
            claimed_total: self.claimed_total.load(Ordering::Relaxed),
            completed_total: self.completed_total.load(Ordering::Relaxed),
            failed_total: self.retried_total.load(Ordering::Relaxed)
                + self.dead_lettered_total.load(Ordering::Relaxed),
            retried_total: self.retried_total.load(Ordering::Relaxed),
            dead_lettered_total: self.dead_lettered_total.load(Ordering::Relaxed),
            canceled_total: self.canceled_total.load(Ordering::Relaxed),
            requeued_total: self.requeued_total.load(Ordering::Relaxed),
            lease_lost_total: self.lease_lost_total.load(Ordering::Relaxed),
            active_jobs: self.active_jobs.load(Ordering::Relaxed),
            average_execution_ms: if timed == 0 { 0 } else { millis / timed },
        }
    }
}

/// Point-in-time view of the counters
#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub claimed_total: u64,
    pub completed_total: u64,
    pub failed_total: u64,
    pub retried_total: u64,
    pub dead_lettered_total: u64,
    pub canceled_total: u64,
    pub requeued_total: u64,
    pub lease_lost_total: u64,
    pub active_jobs: u64,
    pub average_execution_ms: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use uuid::Uuid;

    #[test]
    fn test_counters_follow_the_event_stream() {
        let stats = WorkerStats::default();
        let id = Uuid::new_v4();

        stats.record(&JobEvent::new(id, JobEventKind::Claimed));
        stats.record(&JobEvent::new(id, JobEventKind::Started));
        assert_eq!(stats.active_jobs(), 1);

        stats.record(
            &JobEvent::new(id, JobEventKind::Completed)
                .with_elapsed(Duration::from_millis(400)),
        );

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.claimed_total, 1);
        assert_eq!(snapshot.completed_total, 1);
        assert_eq!(snapshot.active_jobs, 0);
        assert_eq!(snapshot.average_execution_ms, 400);
    }

    #[test]
    fn test_failures_split_into_retried_and_dead() {
        let stats = WorkerStats::default();
        let id = Uuid::new_v4();

        stats.record(&JobEvent::new(id, JobEventKind::Claimed));
        stats.record(&JobEvent::new(id, JobEventKind::Retried));
        stats.record(&JobEvent::new(id, JobEventKind::Claimed));
        stats.record(&JobEvent::new(id, JobEventKind::DeadLettered));

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.failed_total, 2);
        assert_eq!(snapshot.retried_total, 1);
        assert_eq!(snapshot.dead_lettered_total, 1);
        assert_eq!(snapshot.active_jobs, 0);
    }

    #[test]
    fn test_gauge_never_underflows() {
        let stats = WorkerStats::default();
        stats.record(&JobEvent::new(Uuid::new_v4(), JobEventKind::Completed));
        assert_eq!(stats.active_jobs(), 0);
    }
}
