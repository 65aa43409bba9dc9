//! Transfer pipeline construction
//!
//! Stages are derived by rules rather than enumerated per topology:
//!
//! ```text
//! send -> meter -> compress -> buffer  ==hop==  buffer -> decompress -> receive
//! ```
//!
//! Optional stages drop out when their option is off. The source leg ends at
//! the hop and the destination leg starts after it; with no hop both halves
//! form a single leg.

use tracing::debug;
use zfs_sync_types::{
    Command, Error, Hop, HostCapabilities, Leg, Pipeline, ReplicationJob, Result, StageKind,
    ToolSet, Topology, TransferKind,
};

use crate::zfs;

/// Everything the builder needs to know about one transfer
#[derive(Debug, Clone, Copy)]
pub struct TransferSpec<'a> {
    /// Job being run
    pub job: &'a ReplicationJob,
    /// Chosen transfer kind
    pub kind: &'a TransferKind,
    /// Transfer snapshot; unused for a resume
    pub snapshot: Option<&'a str>,
    /// Bytes the meter should expect
    pub estimated_size: Option<u64>,
    /// Tools found on the source host
    pub source_caps: &'a HostCapabilities,
    /// Tools found on the destination host
    pub destination_caps: &'a HostCapabilities,
}

impl TransferSpec<'_> {
    /// Whether flow-control buffers wrap the hop
    pub fn buffered(&self) -> bool {
        self.job.options.resume_support
            && !self.kind.is_resume()
            && self.job.topology().has_network_hop()
    }

    /// Whether the receive is resumable
    pub fn resumable(&self) -> bool {
        self.job.options.resume_support || self.kind.is_resume()
    }
}

/// Which end of the compressor pair to build
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Compress,
    Decompress,
}

/// Builds pipelines from a [`ToolSet`]
#[derive(Debug, Clone, Default)]
pub struct PipelineBuilder {
    tools: ToolSet,
}

impl PipelineBuilder {
    /// Create a builder for the given tools
    pub fn new(tools: ToolSet) -> Self {
        Self { tools }
    }

    /// Tools this builder emits
    pub fn tools(&self) -> &ToolSet {
        &self.tools
    }

    /// Tools the planned pipeline may need on the source and destination
    pub fn required_tools(&self, job: &ReplicationJob) -> (Vec<&str>, Vec<&str>) {
        let mut source = vec![self.tools.meter.as_str()];
        let mut destination = Vec::new();
        if job.options.compression {
            for side in [&mut source, &mut destination] {
                side.push(self.tools.parallel_compressor.as_str());
                side.push(self.tools.serial_compressor.as_str());
            }
        }
        if job.options.resume_support && job.topology().has_network_hop() {
            source.push(self.tools.buffer.as_str());
            destination.push(self.tools.buffer.as_str());
        }
        (source, destination)
    }

    /// Fail early when a host lacks a tool every transfer of this job needs
    ///
    /// The buffer is not checked here; whether it is used depends on the
    /// transfer kind, so [`build`](Self::build) checks it.
    pub fn check_capabilities(
        &self,
        job: &ReplicationJob,
        source_caps: &HostCapabilities,
        destination_caps: &HostCapabilities,
    ) -> Result<()> {
        if !source_caps.has(&self.tools.meter) {
            return Err(Error::capability(
                job.source.host.label(),
                self.tools.meter.as_str(),
            ));
        }
        if job.options.compression {
            self.compressor(source_caps, &job.source.host.label(), Direction::Compress)?;
            self.compressor(
                destination_caps,
                &job.destination.host.label(),
                Direction::Decompress,
            )?;
        }
        Ok(())
    }

    /// Assemble the stages for one transfer
    pub fn build(&self, spec: &TransferSpec<'_>) -> Result<Pipeline> {
        let job = spec.job;
        let snapshot = match (spec.kind, spec.snapshot) {
            (TransferKind::Resume { .. }, _) => "",
            (_, Some(snapshot)) => snapshot,
            (kind, None) => {
                return Err(Error::validation(format!(
                    "{} transfer needs a transfer snapshot",
                    kind.label()
                )))
            }
        };

        let mut source = Leg::new(job.source.host.clone());
        source.push(
            StageKind::Send,
            zfs::send(&job.source.dataset, spec.kind, snapshot, job.options.recursive),
        );
        source.push(StageKind::Meter, self.meter(spec)?);
        if job.options.compression {
            source.push(
                StageKind::Compress,
                self.compressor(spec.source_caps, &job.source.host.label(), Direction::Compress)?,
            );
        }
        if spec.buffered() {
            source.push(
                StageKind::Buffer,
                self.buffer(spec.source_caps, &job.source.host.label(), job)?,
            );
        }

        let mut destination = Leg::new(job.destination.host.clone());
        if spec.buffered() {
            destination.push(
                StageKind::Buffer,
                self.buffer(spec.destination_caps, &job.destination.host.label(), job)?,
            );
        }
        if job.options.compression {
            destination.push(
                StageKind::Decompress,
                self.compressor(
                    spec.destination_caps,
                    &job.destination.host.label(),
                    Direction::Decompress,
                )?,
            );
        }
        destination.push(
            StageKind::Receive,
            zfs::receive(&job.destination.dataset, spec.resumable()),
        );

        let pipeline = match job.topology() {
            Topology::LocalLocal => {
                source.stages.append(&mut destination.stages);
                Pipeline {
                    legs: vec![source],
                    hop: None,
                }
            }
            Topology::RemoteRemoteDirect => Pipeline {
                legs: vec![source, destination],
                hop: Some(Hop::Direct),
            },
            Topology::LocalRemote | Topology::RemoteLocal | Topology::RemoteRemoteProxied => {
                Pipeline {
                    legs: vec![source, destination],
                    hop: Some(Hop::Orchestrator),
                }
            }
        };

        debug!(
            job = %job.name,
            kind = spec.kind.label(),
            stages = ?pipeline.kinds(),
            "Pipeline assembled"
        );
        Ok(pipeline)
    }

    fn meter(&self, spec: &TransferSpec<'_>) -> Result<Command> {
        let tool = &self.tools.meter;
        if !spec.source_caps.has(tool) {
            return Err(Error::capability(spec.job.source.host.label(), tool.as_str()));
        }
        let command = Command::read_only(tool.as_str()).arg("-f");
        Ok(match spec.estimated_size {
            Some(bytes) => command.arg("-s").arg(bytes.to_string()),
            None => command,
        })
    }

    /// Parallel compressor if the host has it, else the serial one
    fn compressor(
        &self,
        caps: &HostCapabilities,
        host: &str,
        direction: Direction,
    ) -> Result<Command> {
        let tool = [&self.tools.parallel_compressor, &self.tools.serial_compressor]
            .into_iter()
            .find(|tool| caps.has(tool))
            .ok_or_else(|| Error::capability(host, self.tools.serial_compressor.as_str()))?;
        let flag = match direction {
            Direction::Compress => "-c",
            Direction::Decompress => "-dc",
        };
        Ok(Command::read_only(tool.as_str()).arg(flag))
    }

    fn buffer(&self, caps: &HostCapabilities, host: &str, job: &ReplicationJob) -> Result<Command> {
        let tool = &self.tools.buffer;
        if !caps.has(tool) {
            return Err(Error::capability(host, tool.as_str()));
        }
        Ok(Command::read_only(tool.as_str())
            .arg("-q")
            .arg("-s")
            .arg(self.tools.buffer_block_size.as_str())
            .arg("-m")
            .arg(job.options.buffer_memory.as_arg()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use zfs_sync_types::{ConnectTimeout, Endpoint, Host, JobOptions};

    fn host(address: &str) -> Host {
        Host::new(address, "root", ConnectTimeout::default())
    }

    fn job(source: &str, destination: &str) -> ReplicationJob {
        ReplicationJob {
            name: "nightly".to_string(),
            source: Endpoint::new(host(source), "tank/data"),
            destination: Endpoint::new(host(destination), "backup/data"),
            prefix: "backup".to_string(),
            options: JobOptions::default(),
        }
    }

    fn caps(tools: &[&str]) -> HostCapabilities {
        HostCapabilities {
            zfs_version: "zfs-2.2.2".to_string(),
            tools: tools.iter().map(ToString::to_string).collect(),
        }
    }

    fn everything() -> HostCapabilities {
        caps(&["pigz", "gzip", "pv", "mbuffer"])
    }

    fn build(job: &ReplicationJob, kind: &TransferKind) -> Result<Pipeline> {
        let all = everything();
        PipelineBuilder::default().build(&TransferSpec {
            job,
            kind,
            snapshot: Some("backup-20240101-000000"),
            estimated_size: Some(4096),
            source_caps: &all,
            destination_caps: &all,
        })
    }

    fn incremental() -> TransferKind {
        TransferKind::Incremental {
            base: "backup-sync".to_string(),
        }
    }

    #[test]
    fn test_full_stage_order_across_hop() {
        let job = job("local", "backup01");
        let pipeline = build(&job, &TransferKind::Full).unwrap();

        assert_eq!(pipeline.hop, Some(Hop::Orchestrator));
        assert_eq!(
            pipeline.kinds(),
            vec![
                StageKind::Send,
                StageKind::Meter,
                StageKind::Compress,
                StageKind::Buffer,
                StageKind::Buffer,
                StageKind::Decompress,
                StageKind::Receive,
            ]
        );
        assert_eq!(
            pipeline.legs[0].script(),
            "zfs send -p -R tank/data@backup-20240101-000000 | pv -f -s 4096 | pigz -c \
             | mbuffer -q -s 128k -m 1G"
        );
        assert_eq!(
            pipeline.legs[1].script(),
            "mbuffer -q -s 128k -m 1G | pigz -dc | zfs receive -u -s backup/data"
        );
    }

    #[test]
    fn test_resume_has_no_buffers_and_bare_send() {
        let job = job("local", "backup01");
        let kind = TransferKind::Resume {
            token: "1-abc-def".to_string(),
        };
        let all = everything();
        let pipeline = PipelineBuilder::default()
            .build(&TransferSpec {
                job: &job,
                kind: &kind,
                snapshot: None,
                estimated_size: None,
                source_caps: &all,
                destination_caps: &all,
            })
            .unwrap();

        assert!(!pipeline.kinds().contains(&StageKind::Buffer));
        assert_eq!(pipeline.legs[0].stages[0].command.to_shell(), "zfs send -t 1-abc-def");
        assert_eq!(pipeline.legs[0].stages[1].command.to_shell(), "pv -f");
        assert!(pipeline.legs[1].script().ends_with("zfs receive -u -s backup/data"));
    }

    #[test]
    fn test_non_resumable_receive_forces_rollback() {
        let mut job = job("local", "backup01");
        job.options.resume_support = false;
        let pipeline = build(&job, &incremental()).unwrap();

        assert!(!pipeline.kinds().contains(&StageKind::Buffer));
        let receive = &pipeline.legs[1].stages.last().unwrap().command;
        assert_eq!(receive.to_shell(), "zfs receive -u -F backup/data");
        assert!(receive.is_mutating());
        assert!(pipeline.legs[0].stages[0]
            .command
            .to_shell()
            .contains("-i tank/data@backup-sync tank/data@backup-20240101-000000"));
    }

    #[rstest]
    #[case("local", "local", 1, None)]
    #[case("local", "nas02", 2, Some(Hop::Orchestrator))]
    #[case("nas01", "local", 2, Some(Hop::Orchestrator))]
    fn test_topology_legs(
        #[case] source: &str,
        #[case] destination: &str,
        #[case] legs: usize,
        #[case] hop: Option<Hop>,
    ) {
        let job = job(source, destination);
        let pipeline = build(&job, &TransferKind::Full).unwrap();

        assert_eq!(pipeline.legs.len(), legs);
        assert_eq!(pipeline.hop, hop);
        assert_eq!(pipeline.kinds().first(), Some(&StageKind::Send));
        assert_eq!(pipeline.kinds().last(), Some(&StageKind::Receive));
    }

    #[rstest]
    #[case(true, Hop::Direct)]
    #[case(false, Hop::Orchestrator)]
    fn test_remote_to_remote_modes(#[case] direct: bool, #[case] expected: Hop) {
        let mut job = job("nas01", "nas02");
        job.options.direct_transfer = direct;
        let pipeline = build(&job, &incremental()).unwrap();

        assert_eq!(pipeline.hop, Some(expected));
        assert_eq!(pipeline.legs[0].host, host("nas01"));
        assert_eq!(pipeline.legs[1].host, host("nas02"));
    }

    #[test]
    fn test_local_to_local_is_unbuffered_single_leg() {
        let job = job("local", "local");
        let pipeline = build(&job, &TransferKind::Full).unwrap();

        assert_eq!(
            pipeline.kinds(),
            vec![
                StageKind::Send,
                StageKind::Meter,
                StageKind::Compress,
                StageKind::Decompress,
                StageKind::Receive,
            ]
        );
    }

    #[test]
    fn test_compressor_choice_is_per_side() {
        let job = job("nas01", "nas02");
        let source = caps(&["gzip", "pv", "mbuffer"]);
        let destination = everything();
        let pipeline = PipelineBuilder::default()
            .build(&TransferSpec {
                job: &job,
                kind: &TransferKind::Full,
                snapshot: Some("s1"),
                estimated_size: None,
                source_caps: &source,
                destination_caps: &destination,
            })
            .unwrap();

        assert!(pipeline.legs[0].script().contains("gzip -c"));
        assert!(pipeline.legs[1].script().contains("pigz -dc"));
    }

    #[test]
    fn test_missing_tools_are_capability_errors() {
        let job = job("local", "nas02");
        let source = everything();
        let destination = caps(&["pigz"]);
        let error = PipelineBuilder::default()
            .build(&TransferSpec {
                job: &job,
                kind: &TransferKind::Full,
                snapshot: Some("s1"),
                estimated_size: None,
                source_caps: &source,
                destination_caps: &destination,
            })
            .unwrap_err();

        assert_eq!(
            error,
            Error::Capability {
                host: "root@nas02".to_string(),
                tool: "mbuffer".to_string(),
            }
        );
    }

    #[test]
    fn test_capability_check_ignores_buffer() {
        let mut job = job("local", "nas02");
        let builder = PipelineBuilder::default();

        assert!(builder
            .check_capabilities(&job, &caps(&["pv", "gzip"]), &caps(&["pigz"]))
            .is_ok());
        assert_eq!(
            builder
                .check_capabilities(&job, &caps(&["pv", "gzip"]), &caps(&[]))
                .unwrap_err(),
            Error::capability("root@nas02", "gzip")
        );
        assert_eq!(
            builder
                .check_capabilities(&job, &caps(&["pigz"]), &everything())
                .unwrap_err(),
            Error::capability("local", "pv")
        );

        job.options.compression = false;
        assert!(builder
            .check_capabilities(&job, &caps(&["pv"]), &caps(&[]))
            .is_ok());
    }

    #[test]
    fn test_plain_pipeline_without_options() {
        let mut job = job("local", "nas02");
        job.options.compression = false;
        job.options.resume_support = false;
        let pipeline = build(&job, &TransferKind::Full).unwrap();

        assert_eq!(
            pipeline.kinds(),
            vec![StageKind::Send, StageKind::Meter, StageKind::Receive]
        );
    }

    #[test]
    fn test_full_without_snapshot_is_rejected() {
        let job = job("local", "nas02");
        let all = everything();
        let result = PipelineBuilder::default().build(&TransferSpec {
            job: &job,
            kind: &TransferKind::Full,
            snapshot: None,
            estimated_size: None,
            source_caps: &all,
            destination_caps: &all,
        });

        assert!(result.is_err());
    }

    #[test]
    fn test_required_tools() {
        let builder = PipelineBuilder::default();
        let (source, destination) = builder.required_tools(&job("local", "nas02"));
        assert_eq!(source, vec!["pv", "pigz", "gzip", "mbuffer"]);
        assert_eq!(destination, vec!["pigz", "gzip", "mbuffer"]);

        let (source, destination) = builder.required_tools(&job("local", "local"));
        assert_eq!(source, vec!["pv", "pigz", "gzip"]);
        assert_eq!(destination, vec!["pigz", "gzip"]);
    }
}
