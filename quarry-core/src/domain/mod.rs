//! Core domain types
//!
//! This module contains the core domain structures used across Quarry
//! services. These types represent the fundamental business entities and are
//! shared between the job record store (for persistence) and the worker
//! runtime (for execution).

pub mod job;
