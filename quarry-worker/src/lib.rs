//! Quarry Worker
//!
//! A worker process that pulls long-running jobs from a shared job store
//! and executes them exactly-once-in-practice under a time-bounded lease.
//!
//! Architecture:
//! - Configuration: identity, timing, and concurrency from the environment
//! - Lease coordination: claim, heartbeat, release, and expiry sweep built
//!   on the store's atomic conditional updates
//! - Runtime: poll loop, concurrency limiting, per-job heartbeats, and
//!   cancellation propagation
//! - Health: liveness and metrics endpoints over the runtime's counters
//!
//! The actual work of a job is performed by an external engine reached
//! through the [`handler::JobHandler`] seam; workers never communicate with
//! each other except through the job record.

pub mod config;
pub mod engine;
pub mod handler;
pub mod health;
pub mod lease;
pub mod retry;
pub mod runtime;
pub mod shutdown;
pub mod stats;
