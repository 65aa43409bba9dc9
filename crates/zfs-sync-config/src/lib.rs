//! Job definition loading for zfs-sync
//!
//! This crate loads replication job definitions from YAML, TOML or JSON
//! files, applies environment overrides and turns named jobs into validated
//! [`ReplicationJob`] values.
//!
//! # Features
//!
//! - **Multiple formats**: YAML, TOML and JSON configuration files
//! - **Validation**: every job is checked before the engine sees it
//! - **Environment overrides**: `ZFS_SYNC__SECTION__KEY=value`
//! - **Defaults**: per-job fields fall back to the `defaults` section
//!
//! # Examples
//!
//! ```rust,no_run
//! use zfs_sync_config::ConfigBuilder;
//!
//! let config = ConfigBuilder::new()
//!     .add_defaults()
//!     .add_source_file("zfs-sync.yaml")
//!     .add_env_prefix("ZFS_SYNC")
//!     .build()
//!     .expect("Failed to load configuration");
//!
//! for name in config.job_names() {
//!     println!("{}", name);
//! }
//! ```

#![deny(missing_docs)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use zfs_sync_types::{
    BufferMemory, ConnectTimeout, Endpoint, Host, JobOptions, KeepCount, ReplicationJob, ToolSet,
};

pub mod builder;
pub mod error;
pub mod loader;

pub use builder::ConfigBuilder;
pub use error::{ConfigError, ConfigResult};
pub use loader::ConfigLoader;

/// Main configuration structure for zfs-sync
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Values every job inherits unless it overrides them
    #[serde(default)]
    pub defaults: JobDefaults,
    /// Remote session settings
    #[serde(default)]
    pub ssh: SshConfig,
    /// External pipeline tools
    #[serde(default)]
    pub tools: ToolsConfig,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Job definitions by name
    #[serde(default)]
    pub jobs: BTreeMap<String, JobConfig>,
}

/// Defaults shared by all jobs
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JobDefaults {
    /// Login used for remote hosts
    pub ssh_user: String,
    /// Prefix for managed snapshot names
    pub snapshot_prefix: String,
    /// Managed snapshots kept per side
    pub max_snapshots: u32,
    /// Replicate child datasets
    pub recursive: bool,
    /// Compress the stream across the network
    pub compression: bool,
    /// Resumable receives with buffering around the hop
    pub resume_support: bool,
    /// Remote hosts connect to each other directly
    pub direct_transfer: bool,
}

impl Default for JobDefaults {
    fn default() -> Self {
        Self {
            ssh_user: "root".to_string(),
            snapshot_prefix: "backup".to_string(),
            max_snapshots: KeepCount::DEFAULT,
            recursive: true,
            compression: true,
            resume_support: true,
            direct_transfer: false,
        }
    }
}

/// Remote session settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SshConfig {
    /// Seconds allowed for the ssh handshake
    pub connect_timeout_secs: u64,
    /// Never prompt for passwords
    pub batch_mode: bool,
    /// Verify host keys; when off, unknown keys are accepted
    pub strict_host_key_checking: bool,
    /// Extra `-o` options appended to every session
    pub extra_options: Vec<String>,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: ConnectTimeout::DEFAULT_SECS,
            batch_mode: true,
            strict_host_key_checking: false,
            extra_options: Vec::new(),
        }
    }
}

/// External pipeline tools
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolsConfig {
    /// Memory for each flow-control buffer, in MiB
    pub buffer_memory_mib: u32,
    /// Block size for the buffer tool
    pub buffer_block_size: String,
    /// Compressor preferred when installed
    pub parallel_compressor: String,
    /// Fallback compressor
    pub serial_compressor: String,
    /// Progress meter
    pub meter: String,
    /// Flow-control buffer
    pub buffer: String,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        let tools = ToolSet::default();
        Self {
            buffer_memory_mib: BufferMemory::DEFAULT,
            buffer_block_size: tools.buffer_block_size,
            parallel_compressor: tools.parallel_compressor,
            serial_compressor: tools.serial_compressor,
            meter: tools.meter,
            buffer: tools.buffer,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level
    pub level: String,
    /// Directory for the rolling log file
    pub log_dir: Option<PathBuf>,
    /// Enable file logging
    pub file_logging: bool,
    /// Enable JSON formatting
    pub json_format: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            log_dir: None,
            file_logging: false,
            json_format: false,
        }
    }
}

/// One job definition as written in the file
///
/// Endpoint fields are mandatory; the rest override [`JobDefaults`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobConfig {
    /// Source host, `local` for this machine
    pub source_host: Option<String>,
    /// Source dataset
    pub source_dataset: Option<String>,
    /// Destination host, `local` for this machine
    pub dest_host: Option<String>,
    /// Destination dataset
    pub dest_dataset: Option<String>,
    /// Login override
    pub ssh_user: Option<String>,
    /// Prefix override
    pub snapshot_prefix: Option<String>,
    /// Retention override
    pub max_snapshots: Option<u32>,
    /// Recursion override
    pub recursive: Option<bool>,
    /// Compression override
    pub compression: Option<bool>,
    /// Resume-support override
    pub resume_support: Option<bool>,
    /// Direct-transfer override
    pub direct_transfer: Option<bool>,
    /// Buffer memory override, in MiB
    pub buffer_memory_mib: Option<u32>,
}

impl Config {
    /// Names of all configured jobs, sorted
    pub fn job_names(&self) -> Vec<String> {
        self.jobs.keys().cloned().collect()
    }

    /// Session connect timeout
    pub fn connect_timeout(&self) -> ConfigResult<ConnectTimeout> {
        ConnectTimeout::from_secs(self.ssh.connect_timeout_secs)
            .map_err(|message| ConfigError::invalid_value("ssh.connect_timeout_secs", message))
    }

    /// Tool names for the pipeline builder
    pub fn tool_set(&self) -> ToolSet {
        ToolSet {
            parallel_compressor: self.tools.parallel_compressor.clone(),
            serial_compressor: self.tools.serial_compressor.clone(),
            meter: self.tools.meter.clone(),
            buffer: self.tools.buffer.clone(),
            buffer_block_size: self.tools.buffer_block_size.clone(),
        }
    }

    /// Merge a named job with the defaults and validate it
    pub fn resolve_job(&self, name: &str) -> ConfigResult<ReplicationJob> {
        let job = self.jobs.get(name).ok_or_else(|| ConfigError::UnknownJob {
            name: name.to_string(),
        })?;
        let required = |value: &Option<String>, field: &str| {
            value
                .as_deref()
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(str::to_string)
                .ok_or_else(|| ConfigError::missing_required(format!("jobs.{}.{}", name, field)))
        };

        let source_host = required(&job.source_host, "source_host")?;
        let source_dataset = required(&job.source_dataset, "source_dataset")?;
        let dest_host = required(&job.dest_host, "dest_host")?;
        let dest_dataset = required(&job.dest_dataset, "dest_dataset")?;

        let defaults = &self.defaults;
        let user = job.ssh_user.as_ref().unwrap_or(&defaults.ssh_user);
        let timeout = self.connect_timeout()?;

        let keep = KeepCount::new(job.max_snapshots.unwrap_or(defaults.max_snapshots))
            .map_err(|message| {
                ConfigError::invalid_value(format!("jobs.{}.max_snapshots", name), message)
            })?;
        let buffer_memory =
            BufferMemory::new(job.buffer_memory_mib.unwrap_or(self.tools.buffer_memory_mib))
                .map_err(|message| {
                    ConfigError::invalid_value(format!("jobs.{}.buffer_memory_mib", name), message)
                })?;

        let resolved = ReplicationJob {
            name: name.to_string(),
            source: Endpoint::new(Host::new(source_host, user.clone(), timeout), source_dataset),
            destination: Endpoint::new(Host::new(dest_host, user.clone(), timeout), dest_dataset),
            prefix: job
                .snapshot_prefix
                .clone()
                .unwrap_or_else(|| defaults.snapshot_prefix.clone()),
            options: JobOptions {
                recursive: job.recursive.unwrap_or(defaults.recursive),
                compression: job.compression.unwrap_or(defaults.compression),
                resume_support: job.resume_support.unwrap_or(defaults.resume_support),
                direct_transfer: job.direct_transfer.unwrap_or(defaults.direct_transfer),
                keep,
                buffer_memory,
            },
        };

        resolved
            .validate()
            .map_err(|e| ConfigError::validation(format!("job '{}': {}", name, e)))?;
        Ok(resolved)
    }
}
