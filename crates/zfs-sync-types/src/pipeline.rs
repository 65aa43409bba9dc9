//! Transfer pipeline description
//!
//! A pipeline is one or two legs of stages. Each leg runs on a single host,
//! and consecutive legs are joined by a network hop.

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::{Command, Host};

/// Role of a stage in the transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum StageKind {
    /// Produces the replication stream
    Send,
    /// Compresses the stream
    Compress,
    /// Fixed-size ring buffer
    Buffer,
    /// Progress meter
    Meter,
    /// Decompresses the stream
    Decompress,
    /// Consumes the replication stream
    Receive,
}

impl StageKind {
    /// Stage name used in errors
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Send => "send",
            Self::Compress => "compress",
            Self::Buffer => "buffer",
            Self::Meter => "meter",
            Self::Decompress => "decompress",
            Self::Receive => "receive",
        }
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One process in the pipeline
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Stage {
    /// Role of the stage
    pub kind: StageKind,
    /// Process to run
    pub command: Command,
}

impl Stage {
    /// Create a new stage
    pub fn new(kind: StageKind, command: Command) -> Self {
        Self { kind, command }
    }

    /// `kind: command line`, as used in failure reports
    pub fn describe(&self) -> String {
        format!("{}: {}", self.kind, self.command)
    }
}

/// Maximal run of stages on one host
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Leg {
    /// Host the stages run on
    pub host: Host,
    /// Stages in stream order
    pub stages: Vec<Stage>,
}

impl Leg {
    /// Create an empty leg on a host
    pub fn new(host: Host) -> Self {
        Self {
            host,
            stages: Vec::new(),
        }
    }

    /// Append a stage
    pub fn push(&mut self, kind: StageKind, command: Command) {
        self.stages.push(Stage::new(kind, command));
    }

    /// Stages joined with `|`
    pub fn script(&self) -> String {
        self.stages
            .iter()
            .map(|stage| stage.command.to_shell())
            .collect::<Vec<_>>()
            .join(" | ")
    }

    /// Whether the leg contains a stage of this kind
    pub fn contains(&self, kind: StageKind) -> bool {
        self.stages.iter().any(|stage| stage.kind == kind)
    }
}

/// How consecutive legs are joined
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Hop {
    /// Every leg's stdio passes through the orchestrating host
    Orchestrator,
    /// The first leg opens its own session to the second host
    Direct,
}

/// An ordered, connected set of legs
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Pipeline {
    /// Legs in stream order
    pub legs: Vec<Leg>,
    /// Join mode, `None` for a single leg
    pub hop: Option<Hop>,
}

impl Pipeline {
    /// Iterate over every stage with its leg index
    pub fn stages(&self) -> impl Iterator<Item = (usize, &Stage)> {
        self.legs
            .iter()
            .enumerate()
            .flat_map(|(index, leg)| leg.stages.iter().map(move |stage| (index, stage)))
    }

    /// Stage kinds in stream order
    pub fn kinds(&self) -> Vec<StageKind> {
        self.stages().map(|(_, stage)| stage.kind).collect()
    }

    /// Host-annotated summary, independent of the transport
    pub fn describe(&self) -> String {
        let separator = match self.hop {
            Some(Hop::Direct) => " => ",
            _ => " | ",
        };
        self.legs
            .iter()
            .map(|leg| format!("[{}] {}", leg.host, leg.script()))
            .collect::<Vec<_>>()
            .join(separator)
    }
}

impl fmt::Display for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.describe())
    }
}

/// Outcome of a completed pipeline
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct PipelineReport {
    /// Wall-clock duration
    pub elapsed: Duration,
    /// Number of stages that ran
    pub stages: usize,
    /// Whether execution was simulated
    pub dry_run: bool,
}
