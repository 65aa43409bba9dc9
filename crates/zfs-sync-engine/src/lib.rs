//! Replication engine for zfs-sync
//!
//! This crate decides how each dataset is brought up to date and carries the
//! transfer out:
//!
//! - **Inventory**: dataset and snapshot queries
//! - **Reconciliation**: the verified (name and GUID) common snapshot set
//! - **Resume detection**: pending resumable-receive tokens
//! - **Pipeline building**: send, meter, compress, buffer and receive stages
//!   for every topology
//! - **Baselines**: the `<prefix>-sync` snapshot renewed after each transfer
//! - **Retention**: pruning of managed and incomplete snapshots
//! - **Orchestration**: the per-job state machine and sequential multi-job runs
//!
//! # Examples
//!
//! ```rust,no_run
//! use zfs_sync_engine::ReplicationEngine;
//! use zfs_sync_remote::{DryRun, ProcessExecutor};
//! use zfs_sync_types::{Endpoint, Host, JobOptions, ReplicationJob};
//!
//! # async fn example() {
//! let engine = ReplicationEngine::new(DryRun::new(ProcessExecutor::default()));
//! let job = ReplicationJob {
//!     name: "nightly".to_string(),
//!     source: Endpoint::new(Host::Local, "tank/data"),
//!     destination: Endpoint::new(Host::Local, "backup/data"),
//!     prefix: "backup".to_string(),
//!     options: JobOptions::default(),
//! };
//! let report = engine.run_job(&job).await;
//! println!("{}: {}", report.job, report.phase);
//! # }
//! ```

#![deny(missing_docs)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod baseline;
pub mod inventory;
pub mod orchestrator;
pub mod pipeline;
pub mod prune;
pub mod reconcile;
pub mod report;
pub mod resume;
pub mod zfs;

pub use baseline::{renew_baseline, BaselineUpdate};
pub use inventory::Inventory;
pub use orchestrator::{EngineBuilder, ReplicationEngine};
pub use pipeline::{PipelineBuilder, TransferSpec};
pub use prune::PruneStats;
pub use reconcile::{reconcile, Divergence, Reconciliation};
pub use report::{JobReport, RunSummary};
