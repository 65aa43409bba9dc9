//! Dry-run decorator

use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tracing::info;
use zfs_sync_types::{Command, CommandOutput, Host, HostExecutor, Pipeline, PipelineReport, Result};

/// Passes reads through and turns every mutation into a logged no-op
///
/// Read-only commands still run, so every decision is made on real state.
/// Mutating commands and whole pipelines are only described.
#[derive(Debug)]
pub struct DryRun<E> {
    inner: E,
    planned: Mutex<Vec<String>>,
}

impl<E: HostExecutor> DryRun<E> {
    /// Wrap an executor
    pub fn new(inner: E) -> Self {
        Self {
            inner,
            planned: Mutex::new(Vec::new()),
        }
    }

    /// Descriptions of everything that would have run, in order
    pub fn planned(&self) -> Vec<String> {
        self.planned
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// The wrapped executor
    pub fn inner(&self) -> &E {
        &self.inner
    }

    fn record(&self, description: String) {
        info!("[DRY RUN] Would execute: {}", description);
        self.planned
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(description);
    }
}

#[async_trait]
impl<E: HostExecutor> HostExecutor for DryRun<E> {
    async fn run(&self, host: &Host, command: &Command) -> Result<CommandOutput> {
        if command.is_mutating() {
            self.record(format!("[{}] {}", host, command));
            return Ok(CommandOutput::success(""));
        }
        self.inner.run(host, command).await
    }

    async fn run_pipeline(&self, pipeline: &Pipeline) -> Result<PipelineReport> {
        self.record(self.inner.render(pipeline));
        Ok(PipelineReport {
            elapsed: Duration::ZERO,
            stages: pipeline.stages().count(),
            dry_run: true,
        })
    }

    fn is_dry_run(&self) -> bool {
        true
    }

    fn render(&self, pipeline: &Pipeline) -> String {
        self.inner.render(pipeline)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use zfs_sync_types::{Leg, StageKind};

    #[derive(Default)]
    struct Counting {
        runs: AtomicUsize,
        pipelines: AtomicUsize,
    }

    #[async_trait]
    impl HostExecutor for Counting {
        async fn run(&self, _host: &Host, _command: &Command) -> Result<CommandOutput> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            Ok(CommandOutput::success("tank/data\n"))
        }

        async fn run_pipeline(&self, _pipeline: &Pipeline) -> Result<PipelineReport> {
            self.pipelines.fetch_add(1, Ordering::SeqCst);
            Ok(PipelineReport::default())
        }
    }

    #[tokio::test]
    async fn test_reads_pass_through_and_mutations_are_recorded() {
        let dry = DryRun::new(Counting::default());

        let listed = dry
            .run(&Host::Local, &Command::read_only("zfs").args(["list", "-H"]))
            .await
            .unwrap();
        dry.run(
            &Host::Local,
            &Command::mutating("zfs").args(["destroy", "tank/data@old"]),
        )
        .await
        .unwrap();

        assert_eq!(listed.stdout, "tank/data\n");
        assert_eq!(dry.inner().runs.load(Ordering::SeqCst), 1);
        assert_eq!(dry.planned(), vec!["[local] zfs destroy tank/data@old"]);
    }

    #[tokio::test]
    async fn test_pipelines_never_run() {
        let dry = DryRun::new(Counting::default());
        let mut leg = Leg::new(Host::Local);
        leg.push(StageKind::Send, Command::read_only("zfs").args(["send", "tank@s"]));
        let pipeline = Pipeline {
            legs: vec![leg],
            hop: None,
        };

        let report = dry.run_pipeline(&pipeline).await.unwrap();

        assert!(report.dry_run);
        assert!(dry.is_dry_run());
        assert_eq!(dry.inner().pipelines.load(Ordering::SeqCst), 0);
        assert_eq!(dry.planned(), vec!["[local] zfs send tank@s"]);
    }
}
