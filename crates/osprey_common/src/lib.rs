//! Shared foundation of the osprey storage core.
//!
//! - `types`: replicated-log entry, hard state and snapshot types shared by
//!   the log, the WAL and the storage layer
//! - `error`: the layered error taxonomy all crates convert into
//! - `config`: serde-backed configuration sections with spec defaults

pub mod config;
pub mod error;
pub mod types;
