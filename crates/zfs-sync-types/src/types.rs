//! Core data types for zfs-sync
//!
//! Hosts, dataset endpoints, snapshot records, replication jobs and the small
//! enums the decision engine reasons about.

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, TimeZone, Utc};

use crate::{BufferMemory, ConnectTimeout, Error, KeepCount, Result};

/// Host identifier that routes commands to the orchestrating machine
pub const LOCAL_HOST: &str = "local";

/// Name pattern marking snapshots left behind by an aborted transfer
pub const INCOMPLETE_MARKER: &str = "_zfs_sync_incomplete_";

/// A machine commands are executed on
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Host {
    /// The orchestrating machine itself
    Local,
    /// A machine reached over ssh
    Remote(RemoteHost),
}

/// Connection details for a remote host
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct RemoteHost {
    /// Hostname or address
    pub address: String,
    /// Login principal
    pub user: String,
    /// Session connect timeout
    pub connect_timeout: ConnectTimeout,
}

impl Host {
    /// Build a host from an address, treating the `local` sentinel specially
    pub fn new<A: Into<String>, U: Into<String>>(
        address: A,
        user: U,
        connect_timeout: ConnectTimeout,
    ) -> Self {
        let address = address.into();
        if address.eq_ignore_ascii_case(LOCAL_HOST) {
            Self::Local
        } else {
            Self::Remote(RemoteHost {
                address,
                user: user.into(),
                connect_timeout,
            })
        }
    }

    /// Whether commands for this host run in-process
    pub fn is_local(&self) -> bool {
        matches!(self, Self::Local)
    }

    /// `user@address` for remote hosts, `local` otherwise
    pub fn label(&self) -> String {
        match self {
            Self::Local => LOCAL_HOST.to_string(),
            Self::Remote(remote) => remote.destination(),
        }
    }
}

impl RemoteHost {
    /// The `user@address` argument passed to ssh
    pub fn destination(&self) -> String {
        if self.user.is_empty() {
            self.address.clone()
        } else {
            format!("{}@{}", self.user, self.address)
        }
    }
}

impl fmt::Display for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label())
    }
}

/// A dataset on a particular host
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Endpoint {
    /// Host holding the dataset
    pub host: Host,
    /// Dataset path, e.g. `tank/data`
    pub dataset: String,
}

impl Endpoint {
    /// Create a new endpoint
    pub fn new<D: Into<String>>(host: Host, dataset: D) -> Self {
        Self {
            host,
            dataset: dataset.into(),
        }
    }

    /// Full snapshot path `dataset@name`
    pub fn snapshot_path(&self, name: &str) -> String {
        format!("{}@{}", self.dataset, name)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.dataset)
    }
}

/// A snapshot as reported by the storage CLI
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct SnapshotInfo {
    /// Short name, the part after `@`
    pub name: String,
    /// Content identity assigned at creation
    pub guid: u64,
    /// Creation time, seconds since the epoch
    pub creation: i64,
}

impl SnapshotInfo {
    /// Create a new snapshot record
    pub fn new<N: Into<String>>(name: N, guid: u64, creation: i64) -> Self {
        Self {
            name: name.into(),
            guid,
            creation,
        }
    }

    /// Creation time as a timestamp
    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        Utc.timestamp_opt(self.creation, 0).single()
    }

    /// Whether this snapshot is managed under the given prefix
    pub fn has_prefix(&self, prefix: &str) -> bool {
        self.name
            .strip_prefix(prefix)
            .is_some_and(|rest| rest.starts_with('-'))
    }

    /// Whether this snapshot was left by an aborted transfer
    pub fn is_incomplete(&self) -> bool {
        self.name.starts_with(INCOMPLETE_MARKER)
    }
}

/// How the next transfer is sent
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum TransferKind {
    /// Entire history up to the transfer snapshot
    Full,
    /// Delta from a snapshot both sides already hold
    Incremental {
        /// Short name of the verified common snapshot
        base: String,
    },
    /// Continuation of an interrupted receive
    Resume {
        /// Opaque token read from the destination
        token: String,
    },
}

impl TransferKind {
    /// Short label used in logs and reports
    pub fn label(&self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::Incremental { .. } => "incremental",
            Self::Resume { .. } => "resume",
        }
    }

    /// Whether the transfer continues a partial receive
    pub fn is_resume(&self) -> bool {
        matches!(self, Self::Resume { .. })
    }
}

impl fmt::Display for TransferKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Full => f.write_str("full"),
            Self::Incremental { base } => write!(f, "incremental from {}", base),
            Self::Resume { .. } => f.write_str("resume"),
        }
    }
}

/// Placement of source and destination relative to the orchestrator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Topology {
    /// Both datasets on this machine
    LocalLocal,
    /// Local source, remote destination
    LocalRemote,
    /// Remote source, local destination
    RemoteLocal,
    /// Two remote hosts, source connects to destination itself
    RemoteRemoteDirect,
    /// Two remote hosts, bytes relayed through this machine
    RemoteRemoteProxied,
}

impl Topology {
    /// Classify a source/destination pair
    pub fn classify(source: &Host, destination: &Host, direct_transfer: bool) -> Self {
        match (source.is_local(), destination.is_local()) {
            (true, true) => Self::LocalLocal,
            (true, false) => Self::LocalRemote,
            (false, true) => Self::RemoteLocal,
            (false, false) if direct_transfer => Self::RemoteRemoteDirect,
            (false, false) => Self::RemoteRemoteProxied,
        }
    }

    /// Whether bytes cross a network link
    pub fn has_network_hop(self) -> bool {
        !matches!(self, Self::LocalLocal)
    }
}

/// Per-job toggles, threaded explicitly through the engine
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct JobOptions {
    /// Replicate child datasets too
    pub recursive: bool,
    /// Compress the stream across the network hop
    pub compression: bool,
    /// Make receives resumable and buffer around the hop
    pub resume_support: bool,
    /// Let remote hosts talk to each other directly
    pub direct_transfer: bool,
    /// Managed snapshots to keep per side
    pub keep: KeepCount,
    /// Memory for each flow-control buffer
    pub buffer_memory: BufferMemory,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            recursive: true,
            compression: true,
            resume_support: true,
            direct_transfer: false,
            keep: KeepCount::default(),
            buffer_memory: BufferMemory::default(),
        }
    }
}

/// One source to destination replication
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ReplicationJob {
    /// Job name used in logs and reports
    pub name: String,
    /// Dataset being replicated
    pub source: Endpoint,
    /// Dataset receiving the stream
    pub destination: Endpoint,
    /// Prefix for managed snapshot names
    pub prefix: String,
    /// Job-scoped options
    pub options: JobOptions,
}

impl ReplicationJob {
    /// Name of the baseline snapshot, `<prefix>-sync`
    pub fn baseline_name(&self) -> String {
        format!("{}-sync", self.prefix)
    }

    /// Topology implied by the hosts and the direct-transfer toggle
    pub fn topology(&self) -> Topology {
        Topology::classify(
            &self.source.host,
            &self.destination.host,
            self.options.direct_transfer,
        )
    }

    /// Check that every mandatory field is usable
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::validation("job name is empty"));
        }
        validate_dataset("source", &self.source.dataset)?;
        validate_dataset("destination", &self.destination.dataset)?;
        if self.prefix.is_empty() {
            return Err(Error::validation("snapshot prefix is empty"));
        }
        if !self
            .prefix
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | ':'))
        {
            return Err(Error::validation(format!(
                "snapshot prefix '{}' contains characters not allowed in snapshot names",
                self.prefix
            )));
        }
        if self.source == self.destination {
            return Err(Error::validation(format!(
                "source and destination are the same dataset {}",
                self.source
            )));
        }
        Ok(())
    }
}

fn validate_dataset(role: &str, dataset: &str) -> Result<()> {
    if dataset.is_empty() {
        return Err(Error::validation(format!("{} dataset is empty", role)));
    }
    if dataset.contains('@') || dataset.starts_with('/') || dataset.ends_with('/') {
        return Err(Error::validation(format!(
            "{} dataset '{}' is not a dataset path",
            role, dataset
        )));
    }
    if dataset.chars().any(char::is_whitespace) {
        return Err(Error::validation(format!(
            "{} dataset '{}' contains whitespace",
            role, dataset
        )));
    }
    Ok(())
}

/// Stages of a single job run
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum JobPhase {
    /// Checking the job definition
    Validating,
    /// Hosts answered the capability probe
    ConnectivityChecked,
    /// Source exists, destination state known
    DatasetsVerified,
    /// Full, incremental or resume chosen
    TransferKindDecided,
    /// Transfer snapshot pinned on the source
    SnapshotTaken,
    /// Stream running
    Transferring,
    /// Baseline renewed on both sides
    BaselineUpdated,
    /// Retention applied
    Pruned,
    /// Finished successfully
    Done,
    /// Aborted by a fatal error
    Failed,
}

impl JobPhase {
    /// Phase name as used in logs
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Validating => "validating",
            Self::ConnectivityChecked => "connectivity-checked",
            Self::DatasetsVerified => "datasets-verified",
            Self::TransferKindDecided => "transfer-kind-decided",
            Self::SnapshotTaken => "snapshot-taken",
            Self::Transferring => "transferring",
            Self::BaselineUpdated => "baseline-updated",
            Self::Pruned => "pruned",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for JobPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A job-fatal error with the context needed to act on it
#[derive(thiserror::Error, Debug, Clone)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[error("job '{job}' failed during {phase}: {error}")]
pub struct JobFailure {
    /// Job name
    pub job: String,
    /// Last phase the job was working on
    pub phase: JobPhase,
    /// Root cause
    pub error: Error,
}

/// Tools found on a host by the capability probe
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct HostCapabilities {
    /// First line of `zfs version`
    pub zfs_version: String,
    /// Auxiliary tools present on the host
    pub tools: BTreeSet<String>,
}

impl HostCapabilities {
    /// Whether a tool was found
    pub fn has(&self, tool: &str) -> bool {
        self.tools.contains(tool)
    }
}
