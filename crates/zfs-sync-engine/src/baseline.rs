//! Baseline renewal after a successful transfer
//!
//! The snapshot that was just transferred becomes `<prefix>-sync` on both
//! sides. The previous baseline is parked as `<prefix>-sync-prev` until the
//! new one is verified, so an interrupted renewal never leaves a side without
//! a usable baseline.

use tracing::{debug, info, warn};
use zfs_sync_types::{Endpoint, Error, HostExecutor, ReplicationJob, Result};

use crate::inventory::Inventory;

/// Suffix for the baseline kept while its successor is installed
pub const PREVIOUS_SUFFIX: &str = "-prev";

/// Outcome of a baseline renewal
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BaselineUpdate {
    /// Snapshot promoted to baseline
    pub promoted: String,
    /// GUID shared by both baselines, unknown in dry-run
    pub guid: Option<u64>,
    /// False when `promoted` already was the baseline
    pub renamed: bool,
}

/// Name of the parked previous baseline
pub fn previous_name(job: &ReplicationJob) -> String {
    format!("{}{}", job.baseline_name(), PREVIOUS_SUFFIX)
}

/// Install `promote` as the baseline on both sides and verify it
///
/// Fails with a postcondition error when either dataset vanished or the
/// two baselines do not share a GUID afterwards.
pub async fn renew_baseline<E: HostExecutor + ?Sized>(
    inventory: &Inventory<'_, E>,
    job: &ReplicationJob,
    promote: &str,
) -> Result<BaselineUpdate> {
    let dry_run = inventory.executor().is_dry_run();
    let baseline = job.baseline_name();
    let recursive = job.options.recursive;

    if !dry_run {
        for endpoint in [&job.source, &job.destination] {
            if !inventory.dataset_exists(endpoint).await? {
                return Err(Error::postcondition(format!(
                    "{} disappeared before the baseline could be renewed",
                    endpoint
                )));
            }
        }
    }

    let renamed = promote != baseline;
    if renamed {
        info!(job = %job.name, snapshot = %promote, baseline = %baseline, "Renewing baseline");
        for endpoint in [&job.source, &job.destination] {
            install(inventory, job, endpoint, promote, recursive).await?;
        }
    } else {
        debug!(job = %job.name, "Transferred snapshot already is the baseline");
    }

    let guid = if dry_run { None } else { Some(verify(inventory, job).await?) };

    let previous = previous_name(job);
    for endpoint in [&job.source, &job.destination] {
        if !renamed || !inventory.snapshot_exists(endpoint, &previous).await.unwrap_or(false) {
            continue;
        }
        if let Err(error) = inventory.destroy_snapshot(endpoint, &previous, recursive).await {
            warn!(
                endpoint = %endpoint,
                snapshot = %previous,
                error = %error,
                "Could not remove previous baseline"
            );
        }
    }

    Ok(BaselineUpdate {
        promoted: promote.to_string(),
        guid,
        renamed,
    })
}

async fn install<E: HostExecutor + ?Sized>(
    inventory: &Inventory<'_, E>,
    job: &ReplicationJob,
    endpoint: &Endpoint,
    promote: &str,
    recursive: bool,
) -> Result<()> {
    let baseline = job.baseline_name();
    let previous = previous_name(job);

    if inventory.snapshot_exists(endpoint, &previous).await? {
        debug!(endpoint = %endpoint, "Removing stale previous baseline");
        inventory.destroy_snapshot(endpoint, &previous, recursive).await?;
    }
    if inventory.snapshot_exists(endpoint, &baseline).await? {
        inventory
            .rename_snapshot(endpoint, &baseline, &previous, recursive)
            .await?;
    }
    inventory
        .rename_snapshot(endpoint, promote, &baseline, recursive)
        .await
}

async fn verify<E: HostExecutor + ?Sized>(
    inventory: &Inventory<'_, E>,
    job: &ReplicationJob,
) -> Result<u64> {
    let baseline = job.baseline_name();
    let source = inventory.snapshot_guid(&job.source, &baseline).await?;
    let destination = inventory.snapshot_guid(&job.destination, &baseline).await?;

    match (source, destination) {
        (Some(source), Some(destination)) if source == destination => Ok(source),
        (Some(source), Some(destination)) => Err(Error::postcondition(format!(
            "baseline {} differs between sides (source guid {}, destination guid {})",
            baseline, source, destination
        ))),
        (None, _) => Err(Error::postcondition(format!(
            "baseline {} missing on {}",
            baseline, job.source
        ))),
        (_, None) => Err(Error::postcondition(format!(
            "baseline {} missing on {}",
            baseline, job.destination
        ))),
    }
}
