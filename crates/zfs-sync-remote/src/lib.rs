//! Remote execution for zfs-sync
//!
//! This crate runs storage commands and transfer pipelines on the
//! orchestrating machine or over ssh:
//!
//! - **Process execution**: [`ProcessExecutor`] spawns commands and pipeline
//!   stages as child processes and fails a pipeline if any stage fails
//! - **Sessions**: ssh argument construction with connect timeouts
//! - **Rendering**: equivalent shell text for logs and dry-run output
//! - **Capability probe**: a one-shot, cancellable gate per host
//! - **Dry-run**: a decorator that turns mutations into logged no-ops
//!
//! # Examples
//!
//! ```rust,no_run
//! use zfs_sync_remote::{DryRun, ProcessExecutor, SshOptions};
//! use zfs_sync_types::{Command, Host, HostExecutor};
//!
//! # async fn example() -> zfs_sync_types::Result<()> {
//! let executor = DryRun::new(ProcessExecutor::new(SshOptions::default()));
//! let output = executor
//!     .execute(&Host::Local, &Command::read_only("zfs").arg("version"))
//!     .await?;
//! println!("{}", output.stdout);
//! # Ok(())
//! # }
//! ```

#![deny(missing_docs)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod dry_run;
pub mod executor;
pub mod probe;
pub mod render;
pub mod session;

pub use dry_run::DryRun;
pub use executor::ProcessExecutor;
pub use probe::probe_host;
pub use render::PipelineRenderer;
pub use session::SshOptions;
