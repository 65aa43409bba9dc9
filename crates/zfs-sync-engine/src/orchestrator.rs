//! Job orchestration
//!
//! A job walks through [`JobPhase`] in order and drops to `Failed` on the
//! first fatal error. Jobs in a run are executed one after another, each with
//! its own options; a failed job never stops the jobs after it.

use std::time::Instant;

use chrono::Local;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};
use zfs_sync_remote::probe_host;
use zfs_sync_types::{
    Error, HostCapabilities, HostExecutor, JobPhase, ReplicationJob, Result, ToolSet,
    TransferKind,
};

use crate::baseline::{previous_name, renew_baseline};
use crate::inventory::Inventory;
use crate::pipeline::{PipelineBuilder, TransferSpec};
use crate::prune::{prune, remove_incomplete};
use crate::reconcile::find_verified_common;
use crate::report::{JobReport, RunSummary};
use crate::resume::detect_resume;

/// Drives replication jobs through one executor
#[derive(Debug)]
pub struct ReplicationEngine<E> {
    executor: E,
    pipelines: PipelineBuilder,
    cancel: CancellationToken,
}

impl<E: HostExecutor> ReplicationEngine<E> {
    /// Create an engine with default tools
    pub fn new(executor: E) -> Self {
        EngineBuilder::new(executor).build()
    }

    /// Executor in use
    pub fn executor(&self) -> &E {
        &self.executor
    }

    /// Token that aborts connectivity checks
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Run every job in order and summarize
    ///
    /// Entries that failed to resolve are reported as failed at validation.
    pub async fn run_all<I>(&self, jobs: I) -> RunSummary
    where
        I: IntoIterator<Item = (String, Result<ReplicationJob>)>,
    {
        let mut summary = RunSummary::new(self.executor.is_dry_run());
        info!(run_id = %summary.run_id, dry_run = summary.dry_run, "Starting replication run");

        for (name, job) in jobs {
            let report = match job {
                Ok(job) => self.run_job(&job).await,
                Err(error) => {
                    error!(job = %name, error = %error, "Job definition rejected");
                    JobReport::rejected(name, error, summary.dry_run)
                }
            };
            summary.jobs.push(report);
        }

        info!(
            run_id = %summary.run_id,
            succeeded = summary.succeeded(),
            failed = summary.failed(),
            "Replication run finished"
        );
        summary
    }

    /// Run one job to completion or failure
    pub async fn run_job(&self, job: &ReplicationJob) -> JobReport {
        let started = Instant::now();
        let mut report = JobReport::new(job.name.clone(), self.executor.is_dry_run());
        let span = info_span!("job", name = %job.name);

        let outcome = self.drive(job, &mut report).instrument(span).await;
        report.duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        match outcome {
            Ok(()) => {
                report.success = true;
                report.phase = JobPhase::Done;
                info!(
                    job = %job.name,
                    kind = report.kind.as_deref().unwrap_or("-"),
                    duration_ms = report.duration_ms,
                    "Job completed"
                );
            }
            Err(failure) => {
                error!(
                    job = %job.name,
                    phase = %report.phase,
                    error = %failure,
                    "Job failed"
                );
                report.fail(failure);
            }
        }
        report
    }

    async fn drive(&self, job: &ReplicationJob, report: &mut JobReport) -> Result<()> {
        let inventory = Inventory::new(&self.executor);
        let recursive = job.options.recursive;

        job.validate()?;
        report.start(job);

        enter(report, JobPhase::ConnectivityChecked);
        let (source_caps, destination_caps) = self.probe(job).await?;
        self.pipelines
            .check_capabilities(job, &source_caps, &destination_caps)?;

        enter(report, JobPhase::DatasetsVerified);
        if !inventory.dataset_exists(&job.source).await? {
            return Err(Error::validation(format!(
                "source dataset {} does not exist",
                job.source
            )));
        }
        let destination_exists = inventory.dataset_exists(&job.destination).await?;

        enter(report, JobPhase::TransferKindDecided);
        let kind = match detect_resume(&inventory, &job.destination).await {
            Some(kind) => kind,
            None => {
                if destination_exists {
                    report
                        .pruned
                        .merge(remove_incomplete(&inventory, &job.destination, recursive).await);
                }
                decide(&inventory, job, destination_exists).await?
            }
        };
        info!(job = %job.name, kind = %kind, topology = ?job.topology(), "Transfer kind decided");
        report.kind = Some(kind.label().to_string());

        enter(report, JobPhase::SnapshotTaken);
        let snapshot = if kind.is_resume() {
            None
        } else {
            Some(take_transfer_snapshot(&inventory, job).await?)
        };
        report.transfer_snapshot.clone_from(&snapshot);

        enter(report, JobPhase::Transferring);
        let estimated_size = inventory
            .estimate_size(
                &job.source,
                &kind,
                snapshot.as_deref().unwrap_or_default(),
                recursive,
            )
            .await;
        report.estimated_bytes = estimated_size;
        let pipeline = self.pipelines.build(&TransferSpec {
            job,
            kind: &kind,
            snapshot: snapshot.as_deref(),
            estimated_size,
            source_caps: &source_caps,
            destination_caps: &destination_caps,
        })?;
        info!(
            job = %job.name,
            command = %self.executor.render(&pipeline),
            estimated_bytes = ?estimated_size,
            "Starting transfer"
        );
        let transfer = self.executor.run_pipeline(&pipeline).await?;
        info!(
            job = %job.name,
            elapsed_ms = u64::try_from(transfer.elapsed.as_millis()).unwrap_or(u64::MAX),
            "Transfer finished"
        );

        enter(report, JobPhase::BaselineUpdated);
        let promote = match snapshot {
            Some(snapshot) => Some(snapshot),
            None => find_verified_common(&inventory, &job.source, &job.destination)
                .await?
                .latest()
                .map(|s| s.name.clone()),
        };
        match promote {
            Some(promote) => {
                let update = renew_baseline(&inventory, job, &promote).await?;
                report.baseline_guid = update.guid;
            }
            None if self.executor.is_dry_run() => {
                info!(job = %job.name, "No resumed snapshot to promote in dry-run");
            }
            None => {
                return Err(Error::postcondition(
                    "no verified common snapshot after resumed transfer",
                ))
            }
        }

        enter(report, JobPhase::Pruned);
        let baseline = job.baseline_name();
        let previous = previous_name(job);
        let protected = [baseline.as_str(), previous.as_str()];
        for endpoint in [&job.source, &job.destination] {
            report.pruned.merge(
                prune(
                    &inventory,
                    endpoint,
                    &job.prefix,
                    &protected,
                    job.options.keep,
                    recursive,
                )
                .await,
            );
            report
                .pruned
                .merge(remove_incomplete(&inventory, endpoint, recursive).await);
        }
        if report.pruned.failed > 0 {
            warn!(
                job = %job.name,
                removed = report.pruned.removed,
                failed = report.pruned.failed,
                "Some snapshots could not be pruned"
            );
        }
        Ok(())
    }

    /// Probe each distinct host once for zfs and the tools it will need
    async fn probe(&self, job: &ReplicationJob) -> Result<(HostCapabilities, HostCapabilities)> {
        let (mut source_tools, destination_tools) = self.pipelines.required_tools(job);

        if job.source.host == job.destination.host {
            for tool in destination_tools {
                if !source_tools.contains(&tool) {
                    source_tools.push(tool);
                }
            }
            let caps =
                probe_host(&self.executor, &job.source.host, &source_tools, &self.cancel).await?;
            return Ok((caps.clone(), caps));
        }

        let source =
            probe_host(&self.executor, &job.source.host, &source_tools, &self.cancel).await?;
        let destination = probe_host(
            &self.executor,
            &job.destination.host,
            &destination_tools,
            &self.cancel,
        )
        .await?;
        Ok((source, destination))
    }
}

fn enter(report: &mut JobReport, phase: JobPhase) {
    debug!(job = %report.job, phase = %phase, "Entering phase");
    report.phase = phase;
}

/// Pick full or incremental once no resume token is pending
async fn decide<E: HostExecutor + ?Sized>(
    inventory: &Inventory<'_, E>,
    job: &ReplicationJob,
    destination_exists: bool,
) -> Result<TransferKind> {
    if !destination_exists {
        info!(destination = %job.destination, "Destination does not exist, sending full stream");
        return Ok(TransferKind::Full);
    }

    let reconciliation = find_verified_common(inventory, &job.source, &job.destination).await?;
    match reconciliation.latest() {
        Some(base) => Ok(TransferKind::Incremental {
            base: base.name.clone(),
        }),
        None => {
            if reconciliation.source_total > 0 {
                warn!(
                    job = %job.name,
                    source_snapshots = reconciliation.source_total,
                    divergent = reconciliation.divergent.len(),
                    "No verified common snapshot although the source has history, \
                     forcing a full transfer onto the existing destination"
                );
            }
            Ok(TransferKind::Full)
        }
    }
}

/// Create `<prefix>-YYYYmmdd-HHMMSS` on the source, or reuse it if present
async fn take_transfer_snapshot<E: HostExecutor + ?Sized>(
    inventory: &Inventory<'_, E>,
    job: &ReplicationJob,
) -> Result<String> {
    let name = format!("{}-{}", job.prefix, Local::now().format("%Y%m%d-%H%M%S"));
    if inventory.snapshot_exists(&job.source, &name).await? {
        warn!(snapshot = %job.source.snapshot_path(&name), "Transfer snapshot already exists, reusing it");
        return Ok(name);
    }
    inventory
        .create_snapshot(&job.source, &name, job.options.recursive)
        .await?;
    info!(snapshot = %job.source.snapshot_path(&name), "Created transfer snapshot");
    Ok(name)
}

/// Builder for a [`ReplicationEngine`]
#[derive(Debug)]
pub struct EngineBuilder<E> {
    executor: E,
    tools: Option<ToolSet>,
    cancel: Option<CancellationToken>,
}

impl<E: HostExecutor> EngineBuilder<E> {
    /// Start from an executor
    pub fn new(executor: E) -> Self {
        Self {
            executor,
            tools: None,
            cancel: None,
        }
    }

    /// Use these pipeline tools
    pub fn with_tools(mut self, tools: ToolSet) -> Self {
        self.tools = Some(tools);
        self
    }

    /// Abort connectivity checks when this token fires
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    /// Build the engine
    pub fn build(self) -> ReplicationEngine<E> {
        ReplicationEngine {
            executor: self.executor,
            pipelines: PipelineBuilder::new(self.tools.unwrap_or_default()),
            cancel: self.cancel.unwrap_or_default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use zfs_sync_types::{
        Command, CommandOutput, ConnectTimeout, Endpoint, Host, JobOptions, Pipeline,
        PipelineReport,
    };

    /// Every host unreachable
    struct Offline;

    #[async_trait]
    impl HostExecutor for Offline {
        async fn run(&self, host: &Host, _command: &Command) -> Result<CommandOutput> {
            Err(Error::connectivity(host.label(), "Connection timed out"))
        }

        async fn run_pipeline(&self, _pipeline: &Pipeline) -> Result<PipelineReport> {
            Ok(PipelineReport::default())
        }
    }

    fn job(name: &str) -> ReplicationJob {
        ReplicationJob {
            name: name.to_string(),
            source: Endpoint::new(Host::Local, "tank/data"),
            destination: Endpoint::new(
                Host::new("nas02", "root", ConnectTimeout::default()),
                "backup/data",
            ),
            prefix: "backup".to_string(),
            options: JobOptions::default(),
        }
    }

    #[tokio::test]
    async fn test_unreachable_host_fails_at_connectivity() {
        let engine = ReplicationEngine::new(Offline);
        let report = engine.run_job(&job("nightly")).await;

        assert!(!report.success);
        assert_eq!(report.phase, JobPhase::ConnectivityChecked);
        assert_eq!(report.error_kind, Some(zfs_sync_types::ErrorKind::Connectivity));
    }

    #[tokio::test]
    async fn test_invalid_job_fails_at_validation() {
        let engine = ReplicationEngine::new(Offline);
        let mut bad = job("bad");
        bad.destination = bad.source.clone();

        let report = engine.run_job(&bad).await;
        assert_eq!(report.phase, JobPhase::Validating);
        assert!(report.topology.is_none());
    }

    #[tokio::test]
    async fn test_run_all_attempts_every_job() {
        let engine = EngineBuilder::new(Offline)
            .with_tools(ToolSet::default())
            .build();
        let summary = engine
            .run_all(vec![
                ("a".to_string(), Ok(job("a"))),
                ("b".to_string(), Err(Error::validation("missing source_dataset"))),
                ("c".to_string(), Ok(job("c"))),
            ])
            .await;

        assert_eq!(summary.jobs.len(), 3);
        assert_eq!(summary.jobs[1].phase, JobPhase::Validating);
        assert_eq!(summary.exit_code(), 1);
    }
}
