//! JSON output structures for the zfs-sync CLI

use serde::Serialize;
use zfs_sync_engine::RunSummary;
use zfs_sync_types::SnapshotInfo;

/// Envelope for a run summary
#[derive(Debug, Serialize)]
pub struct RunOutputJson<'a> {
    /// zfs-sync version
    pub version: &'static str,
    /// Process exit status the run produced
    pub exit_code: i32,
    /// Per-job reports
    #[serde(flatten)]
    pub summary: &'a RunSummary,
}

/// One snapshot in a listing
#[derive(Debug, Serialize)]
pub struct SnapshotJson<'a> {
    /// Full `dataset@name` path
    pub path: &'a str,
    /// Short name
    pub name: &'a str,
    /// Content identity
    pub guid: u64,
    /// Creation time, seconds since the epoch
    pub creation: i64,
    /// Creation time as RFC 3339, when representable
    pub created_at: Option<String>,
}

/// Pretty-printed run summary
pub fn run_summary_json(summary: &RunSummary) -> serde_json::Result<String> {
    serde_json::to_string_pretty(&RunOutputJson {
        version: env!("CARGO_PKG_VERSION"),
        exit_code: summary.exit_code(),
        summary,
    })
}

/// Pretty-printed snapshot listing
pub fn snapshots_json(snapshots: &[(String, SnapshotInfo)]) -> serde_json::Result<String> {
    let entries: Vec<SnapshotJson<'_>> = snapshots
        .iter()
        .map(|(path, snapshot)| SnapshotJson {
            path,
            name: &snapshot.name,
            guid: snapshot.guid,
            creation: snapshot.creation,
            created_at: snapshot.created_at().map(|t| t.to_rfc3339()),
        })
        .collect();
    serde_json::to_string_pretty(&entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use zfs_sync_engine::JobReport;
    use zfs_sync_types::Error;

    #[test]
    fn test_run_summary_json_shape() {
        let mut summary = RunSummary::new(true);
        summary
            .jobs
            .push(JobReport::rejected("nightly", Error::validation("missing dest_host"), true));

        let text = run_summary_json(&summary).unwrap();
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();

        assert_eq!(value["exit_code"], 1);
        assert_eq!(value["dry_run"], true);
        assert_eq!(value["jobs"][0]["job"], "nightly");
        assert!(value["run_id"].is_string());
    }

    #[test]
    fn test_snapshots_json() {
        let snapshots = vec![(
            "tank/data@backup-sync".to_string(),
            SnapshotInfo::new("backup-sync", 42, 0),
        )];
        let value: serde_json::Value =
            serde_json::from_str(&snapshots_json(&snapshots).unwrap()).unwrap();

        assert_eq!(value[0]["guid"], 42);
        assert_eq!(value[0]["created_at"], "1970-01-01T00:00:00+00:00");
    }
}
