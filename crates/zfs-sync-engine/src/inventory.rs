//! Dataset and snapshot queries
//!
//! Read-only lookups plus the handful of snapshot mutations the engine
//! performs. Mutations go through the executor, so dry-run turns them into
//! logged no-ops.

use tracing::{debug, warn};
use zfs_sync_types::{Endpoint, Error, Host, HostExecutor, Result, SnapshotInfo, TransferKind};

use crate::zfs;

/// Query and mutation helpers over one executor
pub struct Inventory<'a, E: ?Sized> {
    executor: &'a E,
}

impl<'a, E: HostExecutor + ?Sized> Inventory<'a, E> {
    /// Create an inventory over an executor
    pub fn new(executor: &'a E) -> Self {
        Self { executor }
    }

    /// The executor queries run on
    pub fn executor(&self) -> &'a E {
        self.executor
    }

    /// Whether the dataset exists
    ///
    /// "does not exist" answers are `false`; any other failure is an error,
    /// so a permission problem is never mistaken for a pristine destination.
    pub async fn dataset_exists(&self, endpoint: &Endpoint) -> Result<bool> {
        let command = zfs::dataset_exists(&endpoint.dataset);
        let output = self.executor.run(&endpoint.host, &command).await?;
        if output.is_success() {
            return Ok(true);
        }
        if output.stderr.contains("does not exist") {
            return Ok(false);
        }
        Err(Error::RemoteExecution {
            host: endpoint.host.label(),
            command: command.to_shell(),
            exit_code: output.exit_code.unwrap_or(-1),
            stderr: output.stderr.trim().to_string(),
        })
    }

    /// Snapshots of the dataset itself, oldest first
    pub async fn list_snapshots(&self, endpoint: &Endpoint) -> Result<Vec<SnapshotInfo>> {
        let output = self
            .executor
            .execute(&endpoint.host, &zfs::list_snapshots(&endpoint.dataset, false))
            .await?;
        let prefix = format!("{}@", endpoint.dataset);

        let mut snapshots = Vec::new();
        for line in output.lines() {
            let (path, snapshot) = parse_snapshot_line(line)?;
            if path.starts_with(&prefix) {
                snapshots.push(snapshot);
            }
        }
        snapshots.sort_by_key(|s| s.creation);
        Ok(snapshots)
    }

    /// Full snapshot paths for interactive listing, newest first, at most `limit`
    pub async fn list_snapshot_paths(
        &self,
        endpoint: &Endpoint,
        recursive: bool,
        limit: Option<usize>,
    ) -> Result<Vec<(String, SnapshotInfo)>> {
        let output = self
            .executor
            .execute(&endpoint.host, &zfs::list_snapshots(&endpoint.dataset, recursive))
            .await?;
        let mut entries = output
            .lines()
            .map(|line| parse_snapshot_line(line).map(|(path, snap)| (path.to_string(), snap)))
            .collect::<Result<Vec<_>>>()?;
        entries.sort_by(|a, b| b.1.creation.cmp(&a.1.creation));
        if let Some(limit) = limit {
            entries.truncate(limit);
        }
        Ok(entries)
    }

    /// Filesystems and volumes, optionally below a root
    pub async fn list_datasets(&self, host: &Host, root: Option<&str>) -> Result<Vec<String>> {
        let output = self.executor.execute(host, &zfs::list_datasets(root)).await?;
        Ok(output.lines().map(str::to_string).collect())
    }

    /// Whether `dataset@name` exists
    pub async fn snapshot_exists(&self, endpoint: &Endpoint, name: &str) -> Result<bool> {
        let output = self
            .executor
            .run(&endpoint.host, &zfs::snapshot_exists(&endpoint.snapshot_path(name)))
            .await?;
        Ok(output.is_success())
    }

    /// GUID of `dataset@name`, `None` if it does not exist
    pub async fn snapshot_guid(&self, endpoint: &Endpoint, name: &str) -> Result<Option<u64>> {
        let output = self
            .executor
            .run(&endpoint.host, &zfs::guid(&endpoint.snapshot_path(name)))
            .await?;
        if !output.is_success() {
            return Ok(None);
        }
        let value = output.stdout.trim();
        value
            .parse()
            .map(Some)
            .map_err(|_| Error::parse(format!("guid '{}' of {}@{}", value, endpoint.dataset, name)))
    }

    /// Pending resumable-receive token on the dataset
    ///
    /// Any failure to read the marker degrades to `None`.
    pub async fn resume_token(&self, endpoint: &Endpoint) -> Option<String> {
        match self
            .executor
            .run(&endpoint.host, &zfs::resume_token(&endpoint.dataset))
            .await
        {
            Ok(output) if output.is_success() => {
                let value = output.stdout.trim();
                (!value.is_empty() && value != "-").then(|| value.to_string())
            }
            Ok(output) => {
                debug!(
                    endpoint = %endpoint,
                    stderr = %output.stderr.trim(),
                    "No resume token readable"
                );
                None
            }
            Err(error) => {
                warn!(
                    endpoint = %endpoint,
                    error = %error,
                    "Resume token check failed, assuming none"
                );
                None
            }
        }
    }

    /// Estimated stream size in bytes; never fails the caller
    pub async fn estimate_size(
        &self,
        source: &Endpoint,
        kind: &TransferKind,
        snapshot: &str,
        recursive: bool,
    ) -> Option<u64> {
        let estimate = match kind {
            TransferKind::Full => self.full_size(source, snapshot).await,
            TransferKind::Incremental { .. } | TransferKind::Resume { .. } => {
                let command = zfs::send_estimate(&source.dataset, kind, snapshot, recursive);
                match self.executor.execute(&source.host, &command).await {
                    Ok(output) => zfs::parse_estimate(&output.stdout)
                        .or_else(|| zfs::parse_estimate(&output.stderr)),
                    Err(error) => {
                        debug!(error = %error, "Send estimate failed");
                        None
                    }
                }
            }
        };
        if estimate.is_none() {
            warn!(
                source = %source,
                "Could not estimate transfer size, progress will be indeterminate"
            );
        }
        estimate
    }

    async fn full_size(&self, source: &Endpoint, snapshot: &str) -> Option<u64> {
        let snapshot_used = self.used(&source.host, &source.snapshot_path(snapshot)).await;
        match snapshot_used {
            Some(bytes) if bytes > 0 => Some(bytes),
            _ => self.used(&source.host, &source.dataset).await,
        }
    }

    async fn used(&self, host: &Host, path: &str) -> Option<u64> {
        let output = self.executor.execute(host, &zfs::used(path)).await.ok()?;
        output.stdout.trim().parse().ok()
    }

    /// Take `dataset@name`
    pub async fn create_snapshot(
        &self,
        endpoint: &Endpoint,
        name: &str,
        recursive: bool,
    ) -> Result<()> {
        self.executor
            .execute(
                &endpoint.host,
                &zfs::create_snapshot(&endpoint.snapshot_path(name), recursive),
            )
            .await
            .map(|_| ())
    }

    /// Destroy `dataset@name`
    pub async fn destroy_snapshot(
        &self,
        endpoint: &Endpoint,
        name: &str,
        recursive: bool,
    ) -> Result<()> {
        self.executor
            .execute(
                &endpoint.host,
                &zfs::destroy_snapshot(&endpoint.snapshot_path(name), recursive),
            )
            .await
            .map(|_| ())
    }

    /// Rename `dataset@from` to `dataset@to`
    pub async fn rename_snapshot(
        &self,
        endpoint: &Endpoint,
        from: &str,
        to: &str,
        recursive: bool,
    ) -> Result<()> {
        self.executor
            .execute(
                &endpoint.host,
                &zfs::rename_snapshot(
                    &endpoint.snapshot_path(from),
                    &endpoint.snapshot_path(to),
                    recursive,
                ),
            )
            .await
            .map(|_| ())
    }
}

/// Split a `path<TAB>guid<TAB>creation` line
fn parse_snapshot_line(line: &str) -> Result<(&str, SnapshotInfo)> {
    let mut fields = line.split('\t');
    let (Some(path), Some(guid), Some(creation)) = (fields.next(), fields.next(), fields.next())
    else {
        return Err(Error::parse(format!("snapshot line '{}'", line)));
    };
    let name = path
        .split_once('@')
        .map(|(_, name)| name)
        .ok_or_else(|| Error::parse(format!("snapshot path '{}'", path)))?;
    let guid = guid
        .trim()
        .parse()
        .map_err(|_| Error::parse(format!("guid '{}' in '{}'", guid, line)))?;
    let creation = creation
        .trim()
        .parse()
        .map_err(|_| Error::parse(format!("creation '{}' in '{}'", creation, line)))?;
    Ok((path, SnapshotInfo::new(name, guid, creation)))
}
