//! Worker configuration
//!
//! Defines all configurable parameters for a worker process: identity,
//! polling cadence, lease and heartbeat timing, concurrency, and drain
//! behavior.

use std::time::Duration;

/// Worker configuration
///
/// Heartbeat timing is validated against the lease duration so a healthy
/// worker always gets several renewal attempts before its lease can expire.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Unique identifier for this worker instance
    pub worker_id: String,

    /// Connection string for the job record store
    pub database_url: String,

    /// Command line of the external execution engine (program + args)
    pub engine_command: Vec<String>,

    /// How often to poll the store for claimable jobs
    pub poll_interval: Duration,

    /// Length of the exclusive lease taken on claim and on each renewal
    pub lease_duration: Duration,

    /// How often each in-flight job renews its lease
    pub heartbeat_interval: Duration,

    /// Max jobs this worker executes concurrently
    pub max_concurrent_jobs: usize,

    /// How long shutdown waits for in-flight jobs before abandoning leases
    pub drain_timeout: Duration,

    /// Bind address for the health/metrics endpoints
    pub health_bind_addr: String,
}

impl WorkerConfig {
    /// Creates a new configuration with defaults for all timing parameters.
    pub fn new(
        worker_id: String,
        database_url: String,
        engine_command: Vec<String>,
    ) -> Self {
        Self {
            worker_id,
            database_url,
            engine_command,
            poll_interval: Duration::from_secs(5),
            lease_duration: Duration::from_secs(300),
            heartbeat_interval: Duration::from_secs(60),
            max_concurrent_jobs: 2,
            drain_timeout: Duration::from_secs(30),
            health_bind_addr: "0.0.0.0:8081".to_string(),
        }
    }

    /// Creates configuration from environment variables
    ///
    /// Expected environment variables:
    /// - DATABASE_URL (required)
    /// - ENGINE_COMMAND (required, whitespace-separated command line)
    /// - WORKER_ID (optional, generated when unset)
    /// - POLL_INTERVAL_MS (optional, default: 5000)
    /// - LEASE_DURATION_MS (optional, default: 300000)
    /// - HEARTBEAT_INTERVAL_MS (optional, default: 60000)
    /// - MAX_CONCURRENT_JOBS (optional, default: 2)
    /// - DRAIN_TIMEOUT_MS (optional, default: 30000)
    /// - HEALTH_BIND_ADDR (optional, default: 0.0.0.0:8081)
    pub fn from_env() -> anyhow::Result<Self> {
        let database_url = std::env::var("DATABASE_URL")
            .map_err(|_| anyhow::anyhow!("DATABASE_URL environment variable not set"))?;

        let engine_command: Vec<String> = std::env::var("ENGINE_COMMAND")
            .map_err(|_| anyhow::anyhow!("ENGINE_COMMAND environment variable not set"))?
            .split_whitespace()
            .map(str::to_string)
            .collect();

        let worker_id = std::env::var("WORKER_ID")
            .unwrap_or_else(|_| format!("worker-{}", uuid::Uuid::new_v4()));

        let mut config = Self::new(worker_id, database_url, engine_command);

        if let Some(ms) = env_millis("POLL_INTERVAL_MS") {
            config.poll_interval = ms;
        }
        if let Some(ms) = env_millis("LEASE_DURATION_MS") {
            config.lease_duration = ms;
        }
        if let Some(ms) = env_millis("HEARTBEAT_INTERVAL_MS") {
            config.heartbeat_interval = ms;
        }
        if let Some(ms) = env_millis("DRAIN_TIMEOUT_MS") {
            config.drain_timeout = ms;
        }
        if let Some(n) = std::env::var("MAX_CONCURRENT_JOBS")
            .ok()
            .and_then(|s| s.parse::<usize>().ok())
        {
            config.max_concurrent_jobs = n;
        }
        if let Ok(addr) = std::env::var("HEALTH_BIND_ADDR") {
            config.health_bind_addr = addr;
        }

        Ok(config)
    }

    /// Validates the configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.worker_id.is_empty() {
            anyhow::bail!("worker_id cannot be empty");
        }

        if self.database_url.is_empty() {
            anyhow::bail!("database_url cannot be empty");
        }

        if self.engine_command.is_empty() {
            anyhow::bail!("engine_command cannot be empty");
        }

        if self.poll_interval.is_zero() {
            anyhow::bail!("poll_interval must be greater than 0");
        }

        if self.lease_duration.is_zero() {
            anyhow::bail!("lease_duration must be greater than 0");
        }

        if self.lease_duration > Duration::from_secs(24 * 60 * 60) {
            anyhow::bail!("lease_duration must be at most 24 hours");
        }

        if self.heartbeat_interval.is_zero() {
            anyhow::bail!("heartbeat_interval must be greater than 0");
        }

        // At least two renewal attempts must fit inside a lease window,
        // otherwise a single delayed heartbeat loses the lease.
        if self.heartbeat_interval > self.lease_duration / 2 {
            anyhow::bail!(
                "heartbeat_interval must be at most half of lease_duration \
                 (recommended: at most a fifth)"
            );
        }

        if self.max_concurrent_jobs == 0 {
            anyhow::bail!("max_concurrent_jobs must be greater than 0");
        }

        Ok(())
    }
}

fn env_millis(name: &str) -> Option<Duration> {
    std::env::var(name)
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .map(Duration::from_millis)
}
