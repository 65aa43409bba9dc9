//! Process-backed [`HostExecutor`]

use std::process::Stdio;
use std::time::Instant;

use async_trait::async_trait;
use futures::future::join_all;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStderr};
use tracing::{debug, warn};
use zfs_sync_types::{
    Command, CommandOutput, Error, Host, HostExecutor, Pipeline, PipelineReport, Result,
};

use crate::render::{PipelineRenderer, ProcessRole, ProcessSpec, StageMarker};
use crate::session::{SshOptions, SSH_CONNECTION_FAILURE};

/// Bytes of stderr kept per process for failure reports
pub const STDERR_TAIL_BYTES: usize = 4096;

/// Runs commands as child processes, locally or through ssh
#[derive(Debug, Clone, Default)]
pub struct ProcessExecutor {
    renderer: PipelineRenderer,
}

impl ProcessExecutor {
    /// Create an executor using the given ssh options
    pub fn new(ssh: SshOptions) -> Self {
        Self {
            renderer: PipelineRenderer::new(ssh),
        }
    }

    /// Renderer used for command lines
    pub fn renderer(&self) -> &PipelineRenderer {
        &self.renderer
    }

    fn spawn_error(host: &Host, program: &str, error: &std::io::Error) -> Error {
        match host {
            Host::Local => Error::Io {
                message: format!("failed to start '{}': {}", program, error),
            },
            Host::Remote(_) => Error::connectivity(
                host.label(),
                format!("failed to start '{}': {}", program, error),
            ),
        }
    }
}

#[async_trait]
impl HostExecutor for ProcessExecutor {
    async fn run(&self, host: &Host, command: &Command) -> Result<CommandOutput> {
        let argv = self.renderer.command_argv(host, command);
        let Some((program, args)) = argv.split_first() else {
            return Err(Error::validation("empty command"));
        };
        debug!(host = %host, command = %command, "Running command");

        let output = tokio::process::Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| Self::spawn_error(host, program, &e))?;

        let result = CommandOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_code: output.status.code(),
        };

        if !host.is_local() && result.exit_code == Some(SSH_CONNECTION_FAILURE) {
            return Err(Error::connectivity(host.label(), result.stderr.trim()));
        }
        Ok(result)
    }

    async fn run_pipeline(&self, pipeline: &Pipeline) -> Result<PipelineReport> {
        let started = Instant::now();
        let specs = self.renderer.processes(pipeline);
        debug!(pipeline = %self.renderer.display(pipeline), "Starting pipeline");

        let mut running: Vec<(ProcessSpec, Child)> = Vec::with_capacity(specs.len());
        let mut upstream: Option<Stdio> = None;
        let last = specs.len().saturating_sub(1);

        for (index, spec) in specs.into_iter().enumerate() {
            let Some((program, args)) = spec.argv.split_first() else {
                return Err(Error::validation("pipeline stage has no program"));
            };
            let host = match &spec.role {
                ProcessRole::Stage { .. } => Host::Local,
                ProcessRole::Session { leg, .. } => pipeline
                    .legs
                    .get(*leg)
                    .map_or(Host::Local, |leg| leg.host.clone()),
            };

            let mut child = tokio::process::Command::new(program)
                .args(args)
                .stdin(upstream.take().unwrap_or_else(Stdio::null))
                .stdout(if index == last {
                    Stdio::null()
                } else {
                    Stdio::piped()
                })
                .stderr(Stdio::piped())
                .kill_on_drop(true)
                .spawn()
                .map_err(|e| Self::spawn_error(&host, program, &e))?;

            if index != last {
                let stdout = child
                    .stdout
                    .take()
                    .ok_or_else(|| Error::Io {
                        message: format!("no stdout handle for '{}'", program),
                    })?;
                upstream = Some(stdout.try_into()?);
            }
            running.push((spec, child));
        }

        let outcomes = join_all(running.into_iter().map(|(spec, mut child)| async move {
            let capture = collect_stderr(child.stderr.take(), spec.forwards_progress);
            let (status, capture) = tokio::join!(child.wait(), capture);
            (spec, status, capture)
        }))
        .await;

        let mut failures = Vec::new();
        for (spec, status, capture) in outcomes {
            let status = status?;
            match spec.role {
                ProcessRole::Stage { leg, stage } => {
                    if !status.success() {
                        failures.push(StageFailure::new(leg, stage, status.code(), capture.tail));
                    }
                }
                ProcessRole::Session { leg, ref host } => {
                    if capture.markers.is_empty() {
                        if !status.success() {
                            let stage = pipeline.legs.get(leg).map_or(0, |l| l.stages.len());
                            debug!(
                                host = %host,
                                exit_code = ?status.code(),
                                "Session ended without a stage report"
                            );
                            failures.push(StageFailure::new(leg, stage, status.code(), capture.tail));
                        }
                    } else {
                        // Session stderr is shared; judge broken pipes by status.
                        for marker in &capture.markers {
                            let mut failure = StageFailure::new(
                                marker.leg,
                                marker.stage,
                                Some(marker.exit_code),
                                capture.tail.clone(),
                            );
                            failure.broken_pipe = marker.exit_code == SIGPIPE_EXIT;
                            failures.push(failure);
                        }
                    }
                }
            }
        }

        if let Some(error) = pipeline_error(pipeline, failures) {
            return Err(error);
        }

        Ok(PipelineReport {
            elapsed: started.elapsed(),
            stages: pipeline.stages().count(),
            dry_run: false,
        })
    }

    fn render(&self, pipeline: &Pipeline) -> String {
        self.renderer.display(pipeline)
    }
}

/// Exit status of a shell child killed by SIGPIPE
const SIGPIPE_EXIT: i32 = 141;

/// A stage, or the session carrying a leg, that exited non-zero
#[derive(Debug, Clone, PartialEq, Eq)]
struct StageFailure {
    leg: usize,
    stage: usize,
    exit_code: Option<i32>,
    tail: String,
    broken_pipe: bool,
}

impl StageFailure {
    fn new(leg: usize, stage: usize, exit_code: Option<i32>, tail: String) -> Self {
        let broken_pipe = matches!(exit_code, None | Some(SIGPIPE_EXIT))
            || tail.to_ascii_lowercase().contains("broken pipe");
        Self {
            leg,
            stage,
            exit_code,
            tail,
            broken_pipe,
        }
    }

    fn is_session(&self, pipeline: &Pipeline) -> bool {
        pipeline
            .legs
            .get(self.leg)
            .map_or(true, |leg| self.stage >= leg.stages.len())
    }

    fn describe(&self, pipeline: &Pipeline) -> String {
        match pipeline.legs.get(self.leg) {
            Some(leg) => leg
                .stages
                .get(self.stage)
                .map_or_else(|| format!("session to {}", leg.host), |s| s.describe()),
            None => format!("leg {}", self.leg),
        }
    }
}

/// Error for a failed pipeline, naming the stage that caused it
///
/// A stage that dies takes the stages feeding it down with a broken pipe, so
/// the cause is the furthest downstream failure that is not a broken pipe.
/// A session failure only counts when no stage of its leg reported one. The
/// stderr of every other failing stage is appended to the cause's.
fn pipeline_error(pipeline: &Pipeline, failures: Vec<StageFailure>) -> Option<Error> {
    let mut failures: Vec<StageFailure> = failures
        .iter()
        .filter(|f| {
            !f.is_session(pipeline)
                || !failures
                    .iter()
                    .any(|other| other.leg == f.leg && !other.is_session(pipeline))
        })
        .cloned()
        .collect();
    failures.sort_by_key(|f| (f.leg, f.stage));
    for failure in &failures {
        warn!(
            leg = failure.leg,
            stage = %failure.describe(pipeline),
            exit_code = ?failure.exit_code,
            stderr = %failure.tail.trim(),
            "Pipeline stage failed"
        );
    }

    let cause = failures
        .iter()
        .rposition(|f| !f.broken_pipe)
        .or_else(|| failures.len().checked_sub(1))?;
    let cause = failures.remove(cause);

    let host = pipeline.legs.get(cause.leg).map(|leg| &leg.host);
    if cause.is_session(pipeline) && cause.exit_code == Some(SSH_CONNECTION_FAILURE) {
        if let Some(host) = host.filter(|h| !h.is_local()) {
            return Some(Error::connectivity(host.label(), cause.tail.trim()));
        }
    }

    let mut stderr_tail = cause.tail.trim().to_string();
    for other in &failures {
        let tail = other.tail.trim();
        if tail.is_empty() || tail == cause.tail.trim() {
            continue;
        }
        stderr_tail.push_str(&format!(
            "\n[{} exited {:?}] {}",
            other.describe(pipeline),
            other.exit_code,
            tail
        ));
    }

    Some(Error::PipelineStage {
        leg: cause.leg,
        stage: cause.describe(pipeline),
        exit_code: cause.exit_code,
        stderr_tail,
    })
}

#[derive(Debug, Default)]
struct StderrCapture {
    tail: String,
    markers: Vec<StageMarker>,
}

/// Drain a child's stderr, keeping the tail and any stage markers
///
/// Meter output is passed through to our own stderr so progress stays
/// visible; marker lines are never forwarded.
async fn collect_stderr(stderr: Option<ChildStderr>, forward: bool) -> StderrCapture {
    let Some(mut stderr) = stderr else {
        return StderrCapture::default();
    };
    let mut terminal = tokio::io::stderr();
    let mut tail: Vec<u8> = Vec::new();
    let mut line: Vec<u8> = Vec::new();
    let mut markers = Vec::new();
    let mut chunk = [0_u8; 8192];

    loop {
        let read = match stderr.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(read) => read,
        };
        for &byte in &chunk[..read] {
            if byte == b'\n' || byte == b'\r' {
                let text = String::from_utf8_lossy(&line);
                if let Some(marker) = StageMarker::parse(&text) {
                    markers.push(marker);
                } else if forward {
                    let _ = terminal.write_all(&line).await;
                    let _ = terminal.write_all(&[byte]).await;
                }
                line.clear();
            } else if line.len() < STDERR_TAIL_BYTES {
                line.push(byte);
            }
        }
        tail.extend_from_slice(&chunk[..read]);
        if tail.len() > 2 * STDERR_TAIL_BYTES {
            tail.drain(..tail.len() - STDERR_TAIL_BYTES);
        }
    }

    if !line.is_empty() {
        let text = String::from_utf8_lossy(&line);
        if let Some(marker) = StageMarker::parse(&text) {
            markers.push(marker);
        }
    }
    let start = tail.len().saturating_sub(STDERR_TAIL_BYTES);
    let _ = terminal.flush().await;

    StderrCapture {
        tail: String::from_utf8_lossy(&tail[start..]).into_owned(),
        markers,
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use zfs_sync_types::{ConnectTimeout, Hop, Leg, Stage, StageKind};

    fn stage(kind: StageKind, program: &str, args: &[&str]) -> Stage {
        Stage::new(kind, Command::read_only(program).args(args.iter().copied()))
    }

    fn local_pipeline(stages: Vec<Stage>) -> Pipeline {
        let mut leg = Leg::new(Host::Local);
        leg.stages = stages;
        Pipeline {
            legs: vec![leg],
            hop: None,
        }
    }

    #[tokio::test]
    async fn test_run_captures_exit_code() {
        let executor = ProcessExecutor::default();
        let output = executor
            .run(&Host::Local, &Command::read_only("sh").args(["-c", "echo out; echo err >&2; exit 3"]))
            .await
            .unwrap();

        assert_eq!(output.stdout.trim(), "out");
        assert_eq!(output.stderr.trim(), "err");
        assert_eq!(output.exit_code, Some(3));
    }

    #[tokio::test]
    async fn test_missing_program_is_an_error() {
        let executor = ProcessExecutor::default();
        let result = executor
            .run(&Host::Local, &Command::read_only("zfs-sync-no-such-program"))
            .await;

        assert!(matches!(result, Err(Error::Io { .. })));
    }

    #[tokio::test]
    async fn test_pipeline_success() {
        let pipeline = local_pipeline(vec![
            stage(StageKind::Send, "printf", &["data"]),
            stage(StageKind::Receive, "cat", &[]),
        ]);

        let report = ProcessExecutor::default().run_pipeline(&pipeline).await.unwrap();
        assert_eq!(report.stages, 2);
        assert!(!report.dry_run);
    }

    #[tokio::test]
    async fn test_early_failure_is_not_masked_by_last_stage() {
        let pipeline = local_pipeline(vec![
            stage(
                StageKind::Send,
                "sh",
                &["-c", "echo cannot open dataset >&2; exit 1"],
            ),
            stage(StageKind::Receive, "cat", &[]),
        ]);

        let error = ProcessExecutor::default()
            .run_pipeline(&pipeline)
            .await
            .unwrap_err();

        match error {
            Error::PipelineStage {
                leg,
                stage,
                exit_code,
                stderr_tail,
            } => {
                assert_eq!(leg, 0);
                assert!(stage.starts_with("send:"));
                assert_eq!(exit_code, Some(1));
                assert!(stderr_tail.contains("cannot open dataset"));
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_two_local_legs_are_chained() {
        let mut pipeline = local_pipeline(vec![stage(StageKind::Send, "printf", &["abc"])]);
        let mut receive = Leg::new(Host::Local);
        receive.push(
            StageKind::Receive,
            Command::read_only("sh").args(["-c", "test \"$(cat)\" = abc"]),
        );
        pipeline.legs.push(receive);
        pipeline.hop = Some(Hop::Orchestrator);

        assert!(ProcessExecutor::default().run_pipeline(&pipeline).await.is_ok());
    }

    #[tokio::test]
    async fn test_downstream_failure_outranks_broken_pipe() {
        let pipeline = local_pipeline(vec![
            stage(
                StageKind::Send,
                "sh",
                &["-c", "yes; echo 'warning: Broken pipe' >&2; exit 1"],
            ),
            stage(
                StageKind::Receive,
                "sh",
                &[
                    "-c",
                    "head -c 10 >/dev/null; echo 'cannot receive: destination exists' >&2; exit 1",
                ],
            ),
        ]);

        let error = ProcessExecutor::default()
            .run_pipeline(&pipeline)
            .await
            .unwrap_err();

        match error {
            Error::PipelineStage {
                leg,
                stage,
                exit_code,
                stderr_tail,
            } => {
                assert_eq!(leg, 0);
                assert!(stage.starts_with("receive:"), "blamed {}", stage);
                assert_eq!(exit_code, Some(1));
                assert!(stderr_tail.starts_with("cannot receive: destination exists"));
                assert!(stderr_tail.contains("Broken pipe"));
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    fn direct_pipeline() -> Pipeline {
        let mut source = Leg::new(Host::new("nas01", "root", ConnectTimeout::default()));
        source.push(StageKind::Send, Command::read_only("zfs").args(["send", "tank@s1"]));
        source.push(StageKind::Meter, Command::read_only("pv").args(["-f"]));
        let mut destination = Leg::new(Host::new("nas02", "root", ConnectTimeout::default()));
        destination.push(
            StageKind::Receive,
            Command::read_only("zfs").args(["receive", "-u", "backup/tank"]),
        );
        Pipeline {
            legs: vec![source, destination],
            hop: Some(Hop::Direct),
        }
    }

    fn failure(leg: usize, stage: usize, code: i32, tail: &str) -> StageFailure {
        StageFailure::new(leg, stage, Some(code), tail.to_string())
    }

    #[test]
    fn test_unreachable_hop_is_a_connectivity_error() {
        let pipeline = direct_pipeline();
        let tail = "ssh: connect to host nas02 port 22: Connection refused";
        let failures = vec![
            failure(0, 0, SIGPIPE_EXIT, tail),
            failure(0, 1, SIGPIPE_EXIT, tail),
            failure(1, 1, SSH_CONNECTION_FAILURE, tail),
        ];

        match pipeline_error(&pipeline, failures) {
            Some(Error::Connectivity { host, message }) => {
                assert_eq!(host, "root@nas02");
                assert!(message.contains("Connection refused"));
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn test_stage_failure_outranks_its_session() {
        let pipeline = direct_pipeline();
        let tail = "cannot receive new filesystem stream: destination has snapshots";
        let failures = vec![
            failure(0, 1, SIGPIPE_EXIT, tail),
            failure(1, 0, 1, tail),
            failure(1, 1, 1, tail),
        ];

        match pipeline_error(&pipeline, failures) {
            Some(Error::PipelineStage {
                leg,
                stage,
                exit_code,
                stderr_tail,
            }) => {
                assert_eq!(leg, 1);
                assert!(stage.starts_with("receive:"));
                assert_eq!(exit_code, Some(1));
                assert_eq!(stderr_tail, tail);
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn test_only_broken_pipes_blames_the_last() {
        let pipeline = local_pipeline(vec![
            stage(StageKind::Send, "zfs", &["send", "tank@s1"]),
            stage(StageKind::Meter, "pv", &[]),
        ]);
        let failures = vec![
            StageFailure::new(0, 0, None, String::new()),
            StageFailure::new(0, 1, Some(SIGPIPE_EXIT), String::new()),
        ];

        match pipeline_error(&pipeline, failures) {
            Some(Error::PipelineStage { stage, .. }) => assert!(stage.starts_with("meter:")),
            other => panic!("unexpected error {:?}", other),
        }
        assert!(pipeline_error(&pipeline, Vec::new()).is_none());
    }
}
