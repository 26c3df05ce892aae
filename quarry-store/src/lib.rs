//! Quarry Store
//!
//! The narrow interface to the job record store, and its implementations.
//!
//! The store's atomic conditional updates are the only cross-worker
//! synchronization primitive in the system: every claim, lease extension,
//! and finalization is a compare-and-swap against the record's current
//! ownership. Two backends are provided:
//! - `PgJobStore`: Postgres via sqlx, conditional `UPDATE` statements
//! - `MemoryJobStore`: in-process, for tests and local development

pub mod error;
pub mod memory;
pub mod postgres;
mod store;

pub use error::StoreError;
pub use memory::MemoryJobStore;
pub use postgres::PgJobStore;
pub use store::JobStore;
