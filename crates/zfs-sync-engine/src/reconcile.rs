//! Verified common snapshots between source and destination
//!
//! A snapshot counts as common only when both sides hold the same name with
//! the same GUID. Same-named snapshots with different GUIDs are divergence:
//! they are reported, never used as a baseline.

use std::collections::HashMap;

use serde::Serialize;
use tracing::warn;
use zfs_sync_types::{Endpoint, HostExecutor, Result, SnapshotInfo};

use crate::inventory::Inventory;

/// A same-named snapshot whose identity differs between the sides
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Divergence {
    /// Snapshot name
    pub name: String,
    /// GUID on the source
    pub source_guid: u64,
    /// GUID on the destination
    pub destination_guid: u64,
}

/// Result of comparing two snapshot histories
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reconciliation {
    /// Verified common snapshots, newest first
    pub common: Vec<SnapshotInfo>,
    /// Same-named snapshots with different GUIDs
    pub divergent: Vec<Divergence>,
    /// Number of snapshots on the source
    pub source_total: usize,
}

impl Reconciliation {
    /// Most recent verified common snapshot
    pub fn latest(&self) -> Option<&SnapshotInfo> {
        self.common.first()
    }

    /// Whether the named snapshot is part of the verified common set
    pub fn contains(&self, name: &str) -> bool {
        self.common.iter().any(|s| s.name == name)
    }
}

/// Compare two snapshot lists
///
/// The common set is ordered by source creation time, newest first; ties are
/// broken by name so the order is deterministic.
pub fn reconcile(source: &[SnapshotInfo], destination: &[SnapshotInfo]) -> Reconciliation {
    let destination_guids: HashMap<&str, u64> = destination
        .iter()
        .map(|s| (s.name.as_str(), s.guid))
        .collect();

    let mut result = Reconciliation {
        source_total: source.len(),
        ..Reconciliation::default()
    };
    for snapshot in source {
        match destination_guids.get(snapshot.name.as_str()) {
            Some(&guid) if guid == snapshot.guid => result.common.push(snapshot.clone()),
            Some(&guid) => result.divergent.push(Divergence {
                name: snapshot.name.clone(),
                source_guid: snapshot.guid,
                destination_guid: guid,
            }),
            None => {}
        }
    }

    result
        .common
        .sort_by(|a, b| b.creation.cmp(&a.creation).then_with(|| b.name.cmp(&a.name)));
    result
}

/// List both sides and reconcile them, logging every divergence
pub async fn find_verified_common<E: HostExecutor + ?Sized>(
    inventory: &Inventory<'_, E>,
    source: &Endpoint,
    destination: &Endpoint,
) -> Result<Reconciliation> {
    let source_snapshots = inventory.list_snapshots(source).await?;
    let destination_snapshots = inventory.list_snapshots(destination).await?;
    let result = reconcile(&source_snapshots, &destination_snapshots);

    for divergence in &result.divergent {
        warn!(
            snapshot = %divergence.name,
            source_guid = divergence.source_guid,
            destination_guid = divergence.destination_guid,
            "Snapshot exists on both sides with different GUIDs, ignoring it as a baseline"
        );
    }
    Ok(result)
}
