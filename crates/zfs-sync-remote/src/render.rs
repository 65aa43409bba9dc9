//! Turning a [`Pipeline`] into processes
//!
//! Local stages become one process each. A remote leg becomes a single ssh
//! session whose remote shell runs the leg's stages; every stage inside it is
//! guarded so a failure prints a status marker on stderr. That marker is how
//! an early stage failure is detected even when the session as a whole exits
//! with the status of its last stage.

use zfs_sync_types::command::{join, quote};
use zfs_sync_types::{Command, Hop, Host, Leg, Pipeline, StageKind};

use crate::session::SshOptions;

/// Prefix of the stderr line a guarded stage prints when it fails
pub const STAGE_MARKER: &str = "zfs-sync-stage-failed";

/// One OS process of a rendered pipeline
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessSpec {
    /// Program and arguments
    pub argv: Vec<String>,
    /// What the process runs
    pub role: ProcessRole,
    /// Whether stderr carries meter output for the terminal
    pub forwards_progress: bool,
}

/// What a process stands for in the pipeline
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessRole {
    /// A single stage on this machine
    Stage {
        /// Leg index
        leg: usize,
        /// Stage index within the leg
        stage: usize,
    },
    /// An ssh session running one or more whole legs
    Session {
        /// First leg run by the session
        leg: usize,
        /// Host the session connects to
        host: String,
    },
}

/// A stage failure reported through a stderr marker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageMarker {
    /// Leg index
    pub leg: usize,
    /// Stage index within the leg
    pub stage: usize,
    /// Exit status of the stage
    pub exit_code: i32,
}

impl StageMarker {
    /// Parse `zfs-sync-stage-failed <leg>.<stage> <rc>`
    pub fn parse(line: &str) -> Option<Self> {
        let rest = line.trim().strip_prefix(STAGE_MARKER)?;
        let mut fields = rest.split_whitespace();
        let (leg, stage) = fields.next()?.split_once('.')?;
        let exit_code = fields.next()?.parse().ok()?;
        Some(Self {
            leg: leg.parse().ok()?,
            stage: stage.parse().ok()?,
            exit_code,
        })
    }
}

/// Renders pipelines and commands for a given ssh configuration
#[derive(Debug, Clone, Default)]
pub struct PipelineRenderer {
    ssh: SshOptions,
}

impl PipelineRenderer {
    /// Create a renderer
    pub fn new(ssh: SshOptions) -> Self {
        Self { ssh }
    }

    /// ssh options in use
    pub fn ssh(&self) -> &SshOptions {
        &self.ssh
    }

    /// argv that runs `command` on `host`
    pub fn command_argv(&self, host: &Host, command: &Command) -> Vec<String> {
        match host {
            Host::Local => command.argv().map(str::to_string).collect(),
            Host::Remote(remote) => {
                let mut argv = self.ssh.argv(remote);
                argv.push(command.to_shell());
                argv
            }
        }
    }

    /// Equivalent shell command line, for logs and dry-run output
    pub fn display(&self, pipeline: &Pipeline) -> String {
        if let Some((source, destination)) = direct_pair(pipeline) {
            let inner = self.session_text(&destination.host, &destination.script());
            return self.session_text(&source.host, &format!("{} | {}", source.script(), inner));
        }

        pipeline
            .legs
            .iter()
            .map(|leg| self.session_text(&leg.host, &leg.script()))
            .collect::<Vec<_>>()
            .join(" | ")
    }

    /// Processes to spawn, in stream order
    pub fn processes(&self, pipeline: &Pipeline) -> Vec<ProcessSpec> {
        if let Some((source, destination)) = direct_pair(pipeline) {
            let inner = self.session_argv(&destination.host, guarded_script(1, destination));
            let script = format!(
                "{} | {}",
                guarded_script(0, source),
                guard(
                    &join(inner.iter().map(String::as_str)),
                    1,
                    destination.stages.len()
                )
            );
            return vec![ProcessSpec {
                argv: self.session_argv(&source.host, script),
                role: ProcessRole::Session {
                    leg: 0,
                    host: source.host.label(),
                },
                forwards_progress: true,
            }];
        }

        let mut processes = Vec::new();
        for (leg_index, leg) in pipeline.legs.iter().enumerate() {
            match &leg.host {
                Host::Local => {
                    for (stage_index, stage) in leg.stages.iter().enumerate() {
                        processes.push(ProcessSpec {
                            argv: stage.command.argv().map(str::to_string).collect(),
                            role: ProcessRole::Stage {
                                leg: leg_index,
                                stage: stage_index,
                            },
                            forwards_progress: stage.kind == StageKind::Meter,
                        });
                    }
                }
                Host::Remote(_) => processes.push(ProcessSpec {
                    argv: self.session_argv(&leg.host, guarded_script(leg_index, leg)),
                    role: ProcessRole::Session {
                        leg: leg_index,
                        host: leg.host.label(),
                    },
                    forwards_progress: leg.contains(StageKind::Meter),
                }),
            }
        }
        processes
    }

    fn session_argv(&self, host: &Host, script: String) -> Vec<String> {
        match host {
            Host::Local => vec!["sh".to_string(), "-c".to_string(), script],
            Host::Remote(remote) => {
                let mut argv = self.ssh.argv(remote);
                argv.push(script);
                argv
            }
        }
    }

    fn session_text(&self, host: &Host, script: &str) -> String {
        match host {
            Host::Local => script.to_string(),
            Host::Remote(remote) => format!(
                "{} {}",
                join(self.ssh.argv(remote).iter().map(String::as_str)),
                quote(script)
            ),
        }
    }
}

/// Both legs of a remote-to-remote pipeline whose hosts talk directly
fn direct_pair(pipeline: &Pipeline) -> Option<(&Leg, &Leg)> {
    match (pipeline.hop, pipeline.legs.as_slice()) {
        (Some(Hop::Direct), [source, destination])
            if !source.host.is_local() && !destination.host.is_local() =>
        {
            Some((source, destination))
        }
        _ => None,
    }
}

/// Leg script where each stage reports its own failure
fn guarded_script(leg_index: usize, leg: &Leg) -> String {
    leg.stages
        .iter()
        .enumerate()
        .map(|(stage_index, stage)| guard(&stage.command.to_shell(), leg_index, stage_index))
        .collect::<Vec<_>>()
        .join(" | ")
}

/// Wrap a shell command so a non-zero exit prints a [`StageMarker`] line
///
/// A stage index equal to the leg's length stands for the session that
/// carries the leg.
fn guard(command: &str, leg_index: usize, stage_index: usize) -> String {
    format!(
        "{{ {} || {{ rc=$?; echo \"{} {}.{} $rc\" >&2; exit $rc; }}; }}",
        command, STAGE_MARKER, leg_index, stage_index
    )
}
