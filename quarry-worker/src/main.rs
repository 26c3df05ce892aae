//! Quarry Worker binary
//!
//! Wires the configuration, the Postgres job store, the external engine
//! command, the health endpoints, and the worker runtime together, then
//! runs until a shutdown signal drains the worker.

use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use quarry_store::{JobStore, PgJobStore};
use quarry_worker::config::WorkerConfig;
use quarry_worker::engine::CommandHandler;
use quarry_worker::health::{self, HealthState};
use quarry_worker::runtime::WorkerRuntime;
use quarry_worker::shutdown;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "quarry_worker=info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Quarry worker");

    // Missing or invalid configuration is fatal before the poll loop starts.
    let config = WorkerConfig::from_env().context("failed to load configuration")?;
    config.validate().context("invalid configuration")?;
    info!(worker_id = %config.worker_id, "configuration loaded");

    let store: Arc<dyn JobStore> = Arc::new(
        PgJobStore::connect(&config.database_url)
            .await
            .context("failed to connect to job store")?,
    );
    info!("job store connected");

    let handler = Arc::new(
        CommandHandler::from_command_line(&config.engine_command)
            .context("invalid engine command")?,
    );

    let root_token = shutdown::install_shutdown_handler();

    let runtime = WorkerRuntime::new(config.clone(), store, handler, root_token.clone());

    let health_state = Arc::new(HealthState::new(config.worker_id.clone(), runtime.stats()));
    let health_task = tokio::spawn(health::serve(
        config.health_bind_addr.clone(),
        health_state,
        root_token.clone(),
    ));

    runtime.run().await?;

    // The runtime only returns after shutdown; make sure the health server
    // follows even if it was stopped for another reason.
    root_token.cancel();
    if let Ok(Err(err)) = health_task.await {
        tracing::warn!("health server error: {err}");
    }

    info!("worker stopped");
    Ok(())
}
