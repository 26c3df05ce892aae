//! Per-job heartbeat task
//!
//! Renews the lease on one in-flight job until the job task aborts it. A
//! failed renewal means ownership is gone: the task flags the loss and
//! cancels the execution, which must then stop without releasing.

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::lease::LeaseCoordinator;
use crate::runtime::JobFlags;

pub(crate) fn spawn(
    coordinator: Arc<LeaseCoordinator>,
    job_id: Uuid,
    interval: Duration,
    cancel: CancellationToken,
    flags: Arc<JobFlags>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // The first tick fires immediately; skip it, the claim's lease is
        // still fresh.
        ticker.tick().await;

        loop {
            ticker.tick().await;

            match coordinator.heartbeat(job_id).await {
                Ok(extension) if !extension.extended => {
                    flags.mark_lease_lost();
                    cancel.cancel();
                    warn!(job_id = %job_id, "lease lost; aborting in-flight execution");
                    break;
                }
                Ok(extension) => {
                    debug!(job_id = %job_id, "lease extended");
                    if extension.cancel_requested && !flags.cancel_requested() {
                        flags.mark_cancel_requested();
                        cancel.cancel();
                        info!(job_id = %job_id, "cancellation observed on heartbeat");
                        // Keep renewing so the lease stays valid while the
                        // handler winds down.
                    }
                }
                Err(err) if err.is_transient() => {
                    // The lease may still be valid; the next renewal decides.
                    warn!(job_id = %job_id, "heartbeat failed transiently: {err}");
                }
                Err(err) => {
                    error!(job_id = %job_id, "heartbeat error: {err}");
                }
            }
        }
    })
}
