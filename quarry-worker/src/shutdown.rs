//! Shutdown signal handling

use tokio_util::sync::CancellationToken;
use tracing::info;

/// Installs a handler for SIGTERM and ctrl-c.
///
/// Returns a `CancellationToken` that is cancelled when either signal
/// arrives. The runtime stops claiming the moment it fires; per-job tokens
/// are children of this one, so in-flight executions get their stop signal
/// at the same time.
pub fn install_shutdown_handler() -> CancellationToken {
    let token = CancellationToken::new();
    let signalled = token.clone();

    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();

        #[cfg(unix)]
        {
            use tokio::signal::unix::{SignalKind, signal};
            let mut sigterm = match signal(SignalKind::terminate()) {
                Ok(sigterm) => sigterm,
                Err(err) => {
                    tracing::error!("failed to install SIGTERM handler: {err}");
                    return;
                }
            };

            tokio::select! {
                _ = ctrl_c => info!("received ctrl-c, initiating graceful shutdown"),
                _ = sigterm.recv() => info!("received SIGTERM, initiating graceful shutdown"),
            }
        }

        #[cfg(not(unix))]
        {
            let _ = ctrl_c.await;
            info!("received ctrl-c, initiating graceful shutdown");
        }

        signalled.cancel();
    });

    token
}
