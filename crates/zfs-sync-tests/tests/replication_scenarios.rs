//! End-to-end replication scenarios
//!
//! Every test drives the real engine against a [`FakeCluster`] and checks
//! both the job report and the resulting snapshot state on each host.

use std::sync::Arc;

use rstest::rstest;
use zfs_sync_engine::{Inventory, PruneStats, ReplicationEngine};
use zfs_sync_remote::DryRun;
use zfs_sync_tests::{
    job, managed_names, remote, seed_baseline, seeded_cluster, FakeCluster, BASELINE,
    DESTINATION_DATASET, SOURCE_DATASET,
};
use zfs_sync_types::{
    Endpoint, Error, ErrorKind, Host, JobPhase, KeepCount, StageKind, Topology,
};

fn engine(cluster: &Arc<FakeCluster>) -> ReplicationEngine<Arc<FakeCluster>> {
    ReplicationEngine::new(Arc::clone(cluster))
}

/// Both sides hold a baseline with the same GUID
fn assert_baseline_shared(cluster: &FakeCluster, source: &Host, destination: &Host) -> u64 {
    let source_guid = cluster.guid(source, SOURCE_DATASET, BASELINE);
    let destination_guid = cluster.guid(destination, DESTINATION_DATASET, BASELINE);
    assert!(source_guid.is_some(), "no baseline on {}", source);
    assert_eq!(source_guid, destination_guid);
    source_guid.unwrap()
}

#[tokio::test]
async fn test_first_run_sends_full_stream_and_installs_baseline() {
    let nas = remote("nas02");
    let cluster = seeded_cluster(&Host::Local, &nas);

    let report = engine(&cluster).run_job(&job("nightly", &Host::Local, &nas)).await;

    assert!(report.success, "{:?}", report.error);
    assert_eq!(report.phase, JobPhase::Done);
    assert_eq!(report.kind.as_deref(), Some("full"));
    assert_eq!(report.topology, Some(Topology::LocalRemote));

    let guid = assert_baseline_shared(&cluster, &Host::Local, &nas);
    assert_eq!(report.baseline_guid, Some(guid));

    let transferred = report.transfer_snapshot.unwrap();
    assert!(transferred.starts_with("backup-"));
    assert!(!cluster
        .snapshot_names(&Host::Local, SOURCE_DATASET)
        .contains(&transferred));
    assert_eq!(
        cluster.snapshot_names(&nas, DESTINATION_DATASET),
        vec!["manual-1", BASELINE]
    );

    let pipelines = cluster.pipelines();
    assert_eq!(pipelines.len(), 1);
    assert!(pipelines[0].contains(&format!("zfs send -p -R tank/data@{}", transferred)));
    assert!(pipelines[0].contains("mbuffer -q -s 128k -m 1G"));
    assert!(pipelines[0].ends_with("zfs receive -u -s backup/data"));
}

#[tokio::test]
async fn test_second_run_is_incremental_from_baseline() {
    let nas = remote("nas02");
    let cluster = seeded_cluster(&Host::Local, &nas);
    let engine = engine(&cluster);
    let job = job("nightly", &Host::Local, &nas);

    let first = engine.run_job(&job).await;
    let second = engine.run_job(&job).await;

    assert!(second.success, "{:?}", second.error);
    assert_eq!(second.kind.as_deref(), Some("incremental"));
    assert_ne!(first.baseline_guid, second.baseline_guid);
    assert_eq!(
        second.baseline_guid,
        Some(assert_baseline_shared(&cluster, &Host::Local, &nas))
    );

    let pipelines = cluster.pipelines();
    assert!(pipelines[1].contains("-i tank/data@backup-sync"));
    for (host, dataset) in [(&Host::Local, SOURCE_DATASET), (&nas, DESTINATION_DATASET)] {
        let names = cluster.snapshot_names(host, dataset);
        assert!(!names.iter().any(|n| n == "backup-sync-prev"), "{:?}", names);
    }
}

#[rstest]
#[case::local_local("local", "local", false, Topology::LocalLocal, 1)]
#[case::local_remote("local", "nas02", false, Topology::LocalRemote, 2)]
#[case::remote_local("nas01", "local", false, Topology::RemoteLocal, 2)]
#[case::remote_remote_proxied("nas01", "nas02", false, Topology::RemoteRemoteProxied, 2)]
#[case::remote_remote_direct("nas01", "nas02", true, Topology::RemoteRemoteDirect, 2)]
#[tokio::test]
async fn test_every_topology_replicates(
    #[case] source: &str,
    #[case] destination: &str,
    #[case] direct: bool,
    #[case] topology: Topology,
    #[case] legs: usize,
) {
    let source = remote(source);
    let destination = remote(destination);
    let cluster = seeded_cluster(&source, &destination);
    let engine = engine(&cluster);
    let mut job = job("topology", &source, &destination);
    job.options.direct_transfer = direct;

    let full = engine.run_job(&job).await;
    let incremental = engine.run_job(&job).await;

    assert!(full.success, "{:?}", full.error);
    assert!(incremental.success, "{:?}", incremental.error);
    assert_eq!(full.topology, Some(topology));
    assert_eq!(incremental.kind.as_deref(), Some("incremental"));
    assert_baseline_shared(&cluster, &source, &destination);

    let description = &cluster.pipelines()[0];
    assert_eq!(description.matches('[').count(), legs);
    assert_eq!(description.contains(" => "), direct);
    assert_eq!(description.contains("mbuffer"), topology.has_network_hop());
}

#[tokio::test]
async fn test_resume_token_wins_over_common_snapshots() {
    let nas = remote("nas02");
    let cluster = seeded_cluster(&Host::Local, &nas);
    cluster.replicate_snapshot(
        &Host::Local,
        SOURCE_DATASET,
        "manual-1",
        &nas,
        DESTINATION_DATASET,
    );
    let interrupted = "backup-20240101-000000";
    let guid = cluster.take_snapshot(&Host::Local, SOURCE_DATASET, interrupted);
    let token = cluster.interrupt_receive(
        &Host::Local,
        SOURCE_DATASET,
        interrupted,
        &nas,
        DESTINATION_DATASET,
    );

    let report = engine(&cluster).run_job(&job("nightly", &Host::Local, &nas)).await;

    assert!(report.success, "{:?}", report.error);
    assert_eq!(report.kind.as_deref(), Some("resume"));
    assert_eq!(report.transfer_snapshot, None);
    assert_eq!(report.baseline_guid, Some(guid));
    assert_eq!(assert_baseline_shared(&cluster, &Host::Local, &nas), guid);
    assert_eq!(cluster.resume_token(&nas, DESTINATION_DATASET), None);

    let pipeline = &cluster.pipelines()[0];
    assert!(pipeline.contains(&format!("zfs send -t {} | pv -f", token)));
    assert!(!pipeline.contains("mbuffer"));
    assert!(!cluster
        .mutations()
        .iter()
        .any(|c| c.command.starts_with("zfs snapshot")));
}

#[tokio::test]
async fn test_dry_run_changes_nothing() {
    let nas = remote("nas02");
    let cluster = seeded_cluster(&Host::Local, &nas);
    let engine = ReplicationEngine::new(DryRun::new(Arc::clone(&cluster)));

    let report = engine.run_job(&job("nightly", &Host::Local, &nas)).await;

    assert!(report.success, "{:?}", report.error);
    assert!(report.dry_run);
    assert_eq!(report.kind.as_deref(), Some("full"));
    assert_eq!(report.baseline_guid, None);
    assert_eq!(report.estimated_bytes, Some(1 << 20));

    assert!(cluster.mutations().is_empty());
    assert!(cluster.pipelines().is_empty());
    assert!(!cluster.dataset_exists(&nas, DESTINATION_DATASET));
    assert_eq!(cluster.snapshot_names(&Host::Local, SOURCE_DATASET), vec!["manual-1"]);

    let planned = engine.executor().planned();
    assert!(planned
        .iter()
        .any(|p| p.starts_with("[local] zfs snapshot -r tank/data@backup-")));
    assert!(planned
        .iter()
        .any(|p| p.contains("zfs send -p -R tank/data@backup-")
            && p.contains("zfs receive -u -s backup/data")));
}

#[tokio::test]
async fn test_divergent_history_forces_full_overwrite() {
    let nas = remote("nas02");
    let cluster = seeded_cluster(&Host::Local, &nas);
    cluster.insert_snapshot(&Host::Local, SOURCE_DATASET, BASELINE, 111);
    cluster.insert_snapshot(&nas, DESTINATION_DATASET, BASELINE, 222);
    let mut job = job("nightly", &Host::Local, &nas);
    job.options.resume_support = false;

    let report = engine(&cluster).run_job(&job).await;

    assert!(report.success, "{:?}", report.error);
    assert_eq!(report.kind.as_deref(), Some("full"));
    let pipeline = &cluster.pipelines()[0];
    assert!(!pipeline.contains(" -i "));
    assert!(pipeline.ends_with("zfs receive -u -F backup/data"));

    let guid = assert_baseline_shared(&cluster, &Host::Local, &nas);
    assert_ne!(guid, 111);
    assert_ne!(guid, 222);
}

#[tokio::test]
async fn test_divergent_history_is_never_overwritten_by_resumable_receive() {
    let nas = remote("nas02");
    let cluster = seeded_cluster(&Host::Local, &nas);
    cluster.insert_snapshot(&Host::Local, SOURCE_DATASET, BASELINE, 111);
    cluster.insert_snapshot(&nas, DESTINATION_DATASET, BASELINE, 222);

    let report = engine(&cluster).run_job(&job("nightly", &Host::Local, &nas)).await;

    assert!(!report.success);
    assert_eq!(report.kind.as_deref(), Some("full"));
    assert_eq!(report.phase, JobPhase::Transferring);
    assert_eq!(report.error_kind, Some(ErrorKind::PipelineStage));
    match report.failure.map(|f| f.error) {
        Some(Error::PipelineStage { leg, stage, .. }) => {
            assert_eq!(leg, 1);
            assert!(stage.starts_with("receive:"), "{}", stage);
        }
        other => panic!("unexpected failure {:?}", other),
    }
    assert_eq!(cluster.guid(&nas, DESTINATION_DATASET, BASELINE), Some(222));
}

#[rstest]
#[case::send(StageKind::Send, 0, "send:")]
#[case::meter(StageKind::Meter, 0, "meter:")]
#[case::compress(StageKind::Compress, 0, "compress:")]
#[case::buffer(StageKind::Buffer, 0, "buffer:")]
#[case::decompress(StageKind::Decompress, 1, "decompress:")]
#[tokio::test]
async fn test_failed_stage_is_reported_even_if_receive_succeeds(
    #[case] kind: StageKind,
    #[case] expected_leg: usize,
    #[case] expected_stage: &str,
) {
    let nas = remote("nas02");
    let cluster = seeded_cluster(&Host::Local, &nas);
    cluster.fail_next_stage(kind, 1, "Broken pipe");

    let report = engine(&cluster).run_job(&job("nightly", &Host::Local, &nas)).await;

    assert!(!report.success);
    assert_eq!(report.phase, JobPhase::Transferring);
    let failure = report.failure.unwrap();
    assert_eq!(failure.job, "nightly");
    assert_eq!(failure.phase, JobPhase::Transferring);
    match failure.error {
        Error::PipelineStage {
            leg,
            stage,
            exit_code,
            stderr_tail,
        } => {
            assert_eq!(leg, expected_leg);
            assert!(stage.starts_with(expected_stage), "{}", stage);
            assert_eq!(exit_code, Some(1));
            assert_eq!(stderr_tail, "Broken pipe");
        }
        other => panic!("unexpected error {:?}", other),
    }
    assert!(!cluster.dataset_exists(&nas, DESTINATION_DATASET));
    assert_eq!(cluster.guid(&Host::Local, SOURCE_DATASET, BASELINE), None);
}

#[tokio::test]
async fn test_missing_meter_fails_before_any_change() {
    let nas = remote("nas02");
    let cluster = seeded_cluster(&Host::Local, &nas);
    cluster.set_tools(&Host::Local, &["pigz", "gzip", "mbuffer"]);

    let report = engine(&cluster).run_job(&job("nightly", &Host::Local, &nas)).await;

    assert_eq!(report.phase, JobPhase::ConnectivityChecked);
    assert_eq!(
        report.failure.map(|f| f.error),
        Some(Error::capability("local", "pv"))
    );
    assert!(cluster.mutations().is_empty());
}

#[tokio::test]
async fn test_gzip_stands_in_for_missing_pigz() {
    let nas = remote("nas02");
    let cluster = seeded_cluster(&Host::Local, &nas);
    cluster.set_tools(&nas, &["gzip", "mbuffer"]);

    let report = engine(&cluster).run_job(&job("nightly", &Host::Local, &nas)).await;

    assert!(report.success, "{:?}", report.error);
    let pipeline = &cluster.pipelines()[0];
    assert!(pipeline.contains("pigz -c"));
    assert!(pipeline.contains("gzip -dc"));
}

#[tokio::test]
async fn test_missing_zfs_is_capability_error() {
    let nas = remote("nas02");
    let cluster = seeded_cluster(&Host::Local, &nas);
    cluster.set_zfs(&nas, false);

    let report = engine(&cluster).run_job(&job("nightly", &Host::Local, &nas)).await;

    assert_eq!(report.phase, JobPhase::ConnectivityChecked);
    assert_eq!(
        report.failure.map(|f| f.error),
        Some(Error::capability("root@nas02", "zfs"))
    );
}

#[tokio::test]
async fn test_unreachable_destination_fails_at_connectivity() {
    let nas = remote("nas02");
    let cluster = seeded_cluster(&Host::Local, &nas);
    cluster.set_reachable(&nas, false);

    let report = engine(&cluster).run_job(&job("nightly", &Host::Local, &nas)).await;

    assert!(!report.success);
    assert_eq!(report.phase, JobPhase::ConnectivityChecked);
    assert_eq!(report.error_kind, Some(ErrorKind::Connectivity));
    assert!(report.error.unwrap().contains("root@nas02"));
    assert!(cluster.mutations().is_empty());
}

#[tokio::test]
async fn test_missing_source_dataset_is_validation_error() {
    let nas = remote("nas02");
    let cluster = Arc::new(FakeCluster::new());
    cluster.add_host(&nas);

    let report = engine(&cluster).run_job(&job("nightly", &Host::Local, &nas)).await;

    assert_eq!(report.phase, JobPhase::DatasetsVerified);
    assert_eq!(report.error_kind, Some(ErrorKind::Validation));
    assert!(cluster.mutations().is_empty());
}

#[tokio::test]
async fn test_batch_continues_after_failures() {
    let nas = remote("nas02");
    let offline = remote("nas09");
    let cluster = seeded_cluster(&Host::Local, &nas);
    cluster.set_reachable(&offline, false);

    let summary = engine(&cluster)
        .run_all(vec![
            ("broken".to_string(), Ok(job("broken", &Host::Local, &offline))),
            ("nightly".to_string(), Ok(job("nightly", &Host::Local, &nas))),
            (
                "typo".to_string(),
                Err(Error::validation("job 'typo' is missing dest_host")),
            ),
        ])
        .await;

    let names: Vec<&str> = summary.jobs.iter().map(|r| r.job.as_str()).collect();
    assert_eq!(names, vec!["broken", "nightly", "typo"]);
    assert_eq!(summary.succeeded(), 1);
    assert_eq!(summary.failed(), 2);
    assert_eq!(summary.exit_code(), 1);
    assert!(summary.jobs[1].success);
    assert_eq!(summary.jobs[0].phase, JobPhase::ConnectivityChecked);
    assert_eq!(summary.jobs[2].phase, JobPhase::Validating);
    assert_eq!(summary.failures().count(), 2);
}

#[tokio::test]
async fn test_retention_keeps_newest_and_counts_failures() {
    let nas = remote("nas02");
    let cluster = seeded_cluster(&Host::Local, &nas);
    for n in 1..=5 {
        cluster.take_snapshot(
            &Host::Local,
            SOURCE_DATASET,
            &format!("backup-20230101-00000{}", n),
        );
    }
    cluster.fail_destroy(&nas, DESTINATION_DATASET, "backup-20230101-000001");
    let mut job = job("nightly", &Host::Local, &nas);
    job.options.keep = KeepCount::new(2).unwrap();

    let report = engine(&cluster).run_job(&job).await;

    assert!(report.success, "{:?}", report.error);
    assert_eq!(report.pruned, PruneStats { removed: 5, failed: 1 });
    assert_eq!(
        managed_names(&cluster, &Host::Local, SOURCE_DATASET),
        vec!["backup-20230101-000004", "backup-20230101-000005"]
    );
    assert_eq!(
        managed_names(&cluster, &nas, DESTINATION_DATASET),
        vec![
            "backup-20230101-000001",
            "backup-20230101-000004",
            "backup-20230101-000005"
        ]
    );
    assert!(cluster
        .snapshot_names(&Host::Local, SOURCE_DATASET)
        .contains(&"manual-1".to_string()));
    assert_baseline_shared(&cluster, &Host::Local, &nas);
}

#[tokio::test]
async fn test_incomplete_snapshots_are_swept_before_transfer() {
    let nas = remote("nas02");
    let cluster = seeded_cluster(&Host::Local, &nas);
    seed_baseline(&cluster, &Host::Local, &nas);
    cluster.insert_snapshot(&nas, DESTINATION_DATASET, "_zfs_sync_incomplete_20240101", 7);

    let report = engine(&cluster).run_job(&job("nightly", &Host::Local, &nas)).await;

    assert!(report.success, "{:?}", report.error);
    assert_eq!(report.kind.as_deref(), Some("incremental"));
    assert_eq!(report.pruned.removed, 1);
    assert_eq!(
        cluster.snapshot_names(&nas, DESTINATION_DATASET),
        vec![BASELINE]
    );
}

#[tokio::test]
async fn test_seeded_baseline_is_used_as_incremental_base() {
    let nas = remote("nas02");
    let cluster = seeded_cluster(&Host::Local, &nas);
    let seeded = seed_baseline(&cluster, &Host::Local, &nas);

    let report = engine(&cluster).run_job(&job("nightly", &Host::Local, &nas)).await;

    assert!(report.success, "{:?}", report.error);
    assert_eq!(report.kind.as_deref(), Some("incremental"));
    assert_ne!(report.baseline_guid, Some(seeded));
    assert!(cluster.pipelines()[0].contains("-i tank/data@backup-sync tank/data@backup-"));
}

#[tokio::test]
async fn test_shared_host_is_probed_once() {
    let nas = remote("nas01");
    let cluster = seeded_cluster(&nas, &nas);

    let report = engine(&cluster).run_job(&job("nightly", &nas, &nas)).await;

    assert!(report.success, "{:?}", report.error);
    let probes = cluster
        .commands()
        .into_iter()
        .filter(|c| c.command == "zfs version")
        .count();
    assert_eq!(probes, 1);
}

#[tokio::test]
async fn test_snapshot_listing_is_newest_first_and_bounded() {
    let cluster = FakeCluster::new();
    cluster.create_dataset(&Host::Local, "tank/data/child");
    for name in ["a", "b", "c"] {
        cluster.take_snapshot(&Host::Local, SOURCE_DATASET, name);
    }
    cluster.take_snapshot(&Host::Local, "tank/data/child", "d");
    let inventory = Inventory::new(&cluster);
    let endpoint = Endpoint::new(Host::Local, SOURCE_DATASET);

    let flat = inventory
        .list_snapshot_paths(&endpoint, false, Some(2))
        .await
        .unwrap();
    let paths: Vec<&str> = flat.iter().map(|(path, _)| path.as_str()).collect();
    assert_eq!(paths, vec!["tank/data@c", "tank/data@b"]);

    let nested = inventory
        .list_snapshot_paths(&endpoint, true, None)
        .await
        .unwrap();
    assert_eq!(nested[0].0, "tank/data/child@d");
    assert_eq!(nested.len(), 4);
}
