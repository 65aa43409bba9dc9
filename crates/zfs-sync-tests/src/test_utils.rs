//! Fixtures shared by the scenario tests
//!
//! Jobs here replicate `tank/data` to `backup/data` under the `backup`
//! prefix, which keeps assertions short.

use std::sync::Arc;

use zfs_sync_types::{ConnectTimeout, Endpoint, Host, JobOptions, ReplicationJob};

use crate::FakeCluster;

/// Dataset replicated by fixture jobs
pub const SOURCE_DATASET: &str = "tank/data";

/// Dataset receiving the stream in fixture jobs
pub const DESTINATION_DATASET: &str = "backup/data";

/// Snapshot prefix of fixture jobs
pub const PREFIX: &str = "backup";

/// Baseline snapshot name for [`PREFIX`]
pub const BASELINE: &str = "backup-sync";

/// A remote host logged into as root
pub fn remote(address: &str) -> Host {
    Host::new(address, "root", ConnectTimeout::default())
}

/// Job replicating `tank/data` on `source` to `backup/data` on `destination`
pub fn job(name: &str, source: &Host, destination: &Host) -> ReplicationJob {
    ReplicationJob {
        name: name.to_string(),
        source: Endpoint::new(source.clone(), SOURCE_DATASET),
        destination: Endpoint::new(destination.clone(), DESTINATION_DATASET),
        prefix: PREFIX.to_string(),
        options: JobOptions::default(),
    }
}

/// Cluster with both hosts registered and a source dataset holding one
/// unmanaged snapshot
pub fn seeded_cluster(source: &Host, destination: &Host) -> Arc<FakeCluster> {
    let cluster = FakeCluster::new();
    cluster.add_host(source).add_host(destination);
    cluster.take_snapshot(source, SOURCE_DATASET, "manual-1");
    Arc::new(cluster)
}

/// Seed a verified baseline on both sides, as a previous run would leave it
pub fn seed_baseline(cluster: &FakeCluster, source: &Host, destination: &Host) -> u64 {
    let guid = cluster.take_snapshot(source, SOURCE_DATASET, BASELINE);
    cluster.replicate_snapshot(
        source,
        SOURCE_DATASET,
        BASELINE,
        destination,
        DESTINATION_DATASET,
    );
    guid
}

/// Names of snapshots carrying the fixture prefix, other than the baseline
pub fn managed_names(cluster: &FakeCluster, host: &Host, dataset: &str) -> Vec<String> {
    cluster
        .snapshot_names(host, dataset)
        .into_iter()
        .filter(|name| name.starts_with("backup-") && name != BASELINE)
        .collect()
}
