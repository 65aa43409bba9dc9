//! Core type system and error handling for zfs-sync
//!
//! This crate provides the types shared by every zfs-sync crate:
//!
//! - **Error handling**: the job-level error taxonomy with severity levels
//! - **Core types**: hosts, endpoints, snapshots, replication jobs and phases
//! - **Commands and pipelines**: argv descriptions the executors run
//! - **Traits**: the async [`HostExecutor`] seam
//! - **Configuration**: validated value types for job options
//!
//! # Features
//!
//! - `std` (default): Enable standard library features
//! - `serde`: Enable serialization support
//!
//! # Examples
//!
//! ```rust
//! use zfs_sync_types::{ConnectTimeout, Endpoint, Host, JobOptions, ReplicationJob, Topology};
//!
//! let job = ReplicationJob {
//!     name: "nightly".to_string(),
//!     source: Endpoint::new(Host::Local, "tank/data"),
//!     destination: Endpoint::new(
//!         Host::new("backup01", "root", ConnectTimeout::default()),
//!         "backup/data",
//!     ),
//!     prefix: "backup".to_string(),
//!     options: JobOptions::default(),
//! };
//! assert!(job.validate().is_ok());
//! assert_eq!(job.topology(), Topology::LocalRemote);
//! ```

#![deny(missing_docs)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod command;
pub mod config;
pub mod error;
pub mod pipeline;
pub mod result;
pub mod traits;
pub mod types;

// Re-export commonly used types
pub use command::{Command, CommandOutput, Effect};
pub use config::{BufferMemory, ConnectTimeout, KeepCount, ToolSet};
pub use error::{Error, ErrorKind, ErrorSeverity};
pub use pipeline::{Hop, Leg, Pipeline, PipelineReport, Stage, StageKind};
pub use result::Result;
pub use traits::*;
pub use types::*;
