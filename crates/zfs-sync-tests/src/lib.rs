//! Test support for zfs-sync
//!
//! This crate provides [`FakeCluster`], an in-memory set of hosts that answers
//! the storage-CLI command lines the engine emits, plus the fixtures used by
//! the end-to-end scenario tests in `tests/`.

#![deny(missing_docs)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

/// Simulated multi-host storage system
pub mod cluster;

/// Fixture jobs, hosts and seeding helpers
pub mod test_utils;

pub use cluster::{FakeCluster, FakeSnapshot, Recorded, DEFAULT_TOOLS};
pub use test_utils::*;
