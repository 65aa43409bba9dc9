//! Execution seam between the decision engine and the outside world
//!
//! Everything the engine does to a host goes through [`HostExecutor`], so the
//! same engine drives real ssh sessions, dry-run planning and the simulated
//! cluster used in tests.

use async_trait::async_trait;

use crate::{Command, CommandOutput, Error, Host, Pipeline, PipelineReport, Result};

/// Runs commands and pipelines on hosts
#[async_trait]
pub trait HostExecutor: Send + Sync {
    /// Run a command and capture its output
    ///
    /// A non-zero exit is reported through [`CommandOutput::exit_code`]; only
    /// failures to start the command or reach the host are errors.
    async fn run(&self, host: &Host, command: &Command) -> Result<CommandOutput>;

    /// Run a connected pipeline to completion
    ///
    /// Fails if any stage exits non-zero, even when the last stage succeeds.
    async fn run_pipeline(&self, pipeline: &Pipeline) -> Result<PipelineReport>;

    /// Whether mutating actions are being turned into no-ops
    fn is_dry_run(&self) -> bool {
        false
    }

    /// Text of the command line the pipeline would run
    fn render(&self, pipeline: &Pipeline) -> String {
        pipeline.describe()
    }

    /// Run a command and fail on a non-zero exit
    async fn execute(&self, host: &Host, command: &Command) -> Result<CommandOutput> {
        let output = self.run(host, command).await?;
        if output.is_success() {
            Ok(output)
        } else {
            Err(Error::RemoteExecution {
                host: host.label(),
                command: command.to_shell(),
                exit_code: output.exit_code.unwrap_or(-1),
                stderr: output.stderr.trim().to_string(),
            })
        }
    }
}

#[async_trait]
impl<T: HostExecutor + ?Sized> HostExecutor for std::sync::Arc<T> {
    async fn run(&self, host: &Host, command: &Command) -> Result<CommandOutput> {
        (**self).run(host, command).await
    }

    async fn run_pipeline(&self, pipeline: &Pipeline) -> Result<PipelineReport> {
        (**self).run_pipeline(pipeline).await
    }

    fn is_dry_run(&self) -> bool {
        (**self).is_dry_run()
    }

    fn render(&self, pipeline: &Pipeline) -> String {
        (**self).render(pipeline)
    }
}
