//! Retention of managed snapshots
//!
//! Only snapshots named `<prefix>-*` are considered, and the baseline is never
//! one of them. Individual destroy failures are logged and counted; pruning
//! never fails a job.

use serde::Serialize;
use tracing::{debug, info, warn};
use zfs_sync_types::{Endpoint, Error, HostExecutor, KeepCount, SnapshotInfo};

use crate::inventory::Inventory;

/// Counters for one pruning pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PruneStats {
    /// Snapshots destroyed
    pub removed: usize,
    /// Snapshots that could not be destroyed
    pub failed: usize,
}

impl PruneStats {
    /// Add another pass's counters
    pub fn merge(&mut self, other: Self) {
        self.removed += other.removed;
        self.failed += other.failed;
    }
}

/// Managed snapshots that are candidates for removal, oldest first
///
/// `protected` names (the baseline and its parked predecessor) and
/// incomplete-transfer leftovers are excluded.
pub fn select_expired<'a>(
    snapshots: &'a [SnapshotInfo],
    prefix: &str,
    protected: &[&str],
    keep: KeepCount,
) -> Vec<&'a SnapshotInfo> {
    let mut managed: Vec<&SnapshotInfo> = snapshots
        .iter()
        .filter(|s| s.has_prefix(prefix))
        .filter(|s| !s.is_incomplete())
        .filter(|s| !protected.contains(&s.name.as_str()))
        .collect();
    managed.sort_by_key(|s| s.creation);

    let excess = managed.len().saturating_sub(keep.get() as usize);
    managed.truncate(excess);
    managed
}

/// Destroy the oldest managed snapshots beyond `keep`
pub async fn prune<E: HostExecutor + ?Sized>(
    inventory: &Inventory<'_, E>,
    endpoint: &Endpoint,
    prefix: &str,
    protected: &[&str],
    keep: KeepCount,
    recursive: bool,
) -> PruneStats {
    let snapshots = match inventory.list_snapshots(endpoint).await {
        Ok(snapshots) => snapshots,
        Err(error) => {
            warn!(endpoint = %endpoint, error = %error, "Could not list snapshots for pruning");
            return PruneStats::default();
        }
    };

    let expired = select_expired(&snapshots, prefix, protected, keep);
    if expired.is_empty() {
        debug!(endpoint = %endpoint, keep = keep.get(), "Nothing to prune");
        return PruneStats::default();
    }

    info!(
        endpoint = %endpoint,
        count = expired.len(),
        keep = keep.get(),
        "Pruning old snapshots"
    );
    destroy_each(inventory, endpoint, expired, recursive).await
}

/// Remove snapshots left behind by aborted transfers
pub async fn remove_incomplete<E: HostExecutor + ?Sized>(
    inventory: &Inventory<'_, E>,
    endpoint: &Endpoint,
    recursive: bool,
) -> PruneStats {
    let snapshots = match inventory.list_snapshots(endpoint).await {
        Ok(snapshots) => snapshots,
        Err(error) => {
            debug!(endpoint = %endpoint, error = %error, "Skipping incomplete-snapshot sweep");
            return PruneStats::default();
        }
    };

    let incomplete: Vec<&SnapshotInfo> = snapshots.iter().filter(|s| s.is_incomplete()).collect();
    if incomplete.is_empty() {
        return PruneStats::default();
    }
    info!(
        endpoint = %endpoint,
        count = incomplete.len(),
        "Removing snapshots from aborted transfers"
    );
    destroy_each(inventory, endpoint, incomplete, recursive).await
}

async fn destroy_each<E: HostExecutor + ?Sized>(
    inventory: &Inventory<'_, E>,
    endpoint: &Endpoint,
    snapshots: Vec<&SnapshotInfo>,
    recursive: bool,
) -> PruneStats {
    let mut stats = PruneStats::default();
    for snapshot in snapshots {
        match inventory
            .destroy_snapshot(endpoint, &snapshot.name, recursive)
            .await
        {
            Ok(()) => {
                debug!(endpoint = %endpoint, snapshot = %snapshot.name, "Destroyed snapshot");
                stats.removed += 1;
            }
            Err(error) => {
                let error = Error::Prune {
                    host: endpoint.host.label(),
                    snapshot: endpoint.snapshot_path(&snapshot.name),
                    message: error.to_string(),
                };
                warn!(error = %error, "Snapshot removal failed, continuing");
                stats.failed += 1;
            }
        }
    }
    stats
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn snap(name: &str, creation: i64) -> SnapshotInfo {
        SnapshotInfo::new(name, creation as u64 + 1000, creation)
    }

    fn keep(n: u32) -> KeepCount {
        KeepCount::new(n).unwrap()
    }

    #[test]
    fn test_oldest_managed_are_selected() {
        let snapshots = vec![
            snap("backup-3", 3),
            snap("backup-1", 1),
            snap("backup-sync", 0),
            snap("hourly-1", 2),
            snap("backup-2", 2),
            snap("backup-4", 4),
        ];

        let expired = select_expired(&snapshots, "backup", &["backup-sync"], keep(2));
        let names: Vec<&str> = expired.iter().map(|s| s.name.as_str()).collect();

        assert_eq!(names, vec!["backup-1", "backup-2"]);
    }

    #[test]
    fn test_incomplete_leftovers_are_not_counted() {
        let snapshots = vec![
            snap("backup-1", 1),
            snap("backup-_zfs_sync_incomplete_x", 2),
            snap("_zfs_sync_incomplete_y", 3),
        ];
        let expired = select_expired(&snapshots, "backup", &[], keep(1));
        let names: Vec<&str> = expired.iter().map(|s| s.name.as_str()).collect();

        assert_eq!(names, vec!["backup-1"]);
    }

    fn names() -> impl Strategy<Value = Vec<SnapshotInfo>> {
        prop::collection::vec(
            (prop_oneof!["backup-[a-z]{1,4}", "other-[a-z]{1,4}", "backupx"], 0_i64..100),
            0..20,
        )
        .prop_map(|items| items.into_iter().map(|(name, t)| snap(&name, t)).collect())
    }

    proptest! {
        #[test]
        fn prop_never_exceeds_excess_or_leaves_prefix(
            snapshots in names(),
            n in 1_u32..8,
        ) {
            let expired = select_expired(&snapshots, "backup", &["backup-sync"], keep(n));
            let managed = snapshots.iter().filter(|s| s.has_prefix("backup")).count();

            prop_assert!(expired.len() <= managed.saturating_sub(n as usize));
            for snapshot in expired {
                prop_assert!(snapshot.name.starts_with("backup-"));
                prop_assert_ne!(snapshot.name.as_str(), "backup-sync");
            }
        }
    }
}
