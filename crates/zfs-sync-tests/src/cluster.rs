//! In-memory storage cluster
//!
//! [`FakeCluster`] answers the storage-CLI command lines the engine emits and
//! simulates send/receive between its hosts, so whole jobs run end to end
//! without ssh or a pool. Snapshot identity works like the real thing: a
//! received snapshot keeps the GUID it had on the sending side, a freshly
//! taken one gets a new GUID.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use zfs_sync_types::{
    Command, CommandOutput, Error, Host, HostExecutor, Pipeline, PipelineReport, Result, Stage,
    StageKind, LOCAL_HOST,
};

/// Tools every simulated host has unless told otherwise
pub const DEFAULT_TOOLS: &[&str] = &["pv", "pigz", "gzip", "mbuffer"];

/// Creation time of the first simulated snapshot
const EPOCH: i64 = 1_704_067_200;
/// Seconds between consecutive simulated snapshots
const TICK: i64 = 60;
/// `used` reported for datasets
const DATASET_USED: u64 = 1 << 20;
/// `used` reported for snapshots and send estimates
const SNAPSHOT_USED: u64 = 4096;

/// A snapshot held by a simulated dataset
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FakeSnapshot {
    /// Short name
    pub name: String,
    /// Content identity
    pub guid: u64,
    /// Creation time, seconds since the epoch
    pub creation: i64,
}

/// A command that reached the cluster
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recorded {
    /// Label of the host it ran on
    pub host: String,
    /// Rendered command line
    pub command: String,
    /// Whether the command changes state
    pub mutating: bool,
}

#[derive(Debug, Clone, Default)]
struct Dataset {
    /// Oldest first
    snapshots: Vec<FakeSnapshot>,
    pending: Option<PendingReceive>,
}

impl Dataset {
    fn get(&self, name: &str) -> Option<&FakeSnapshot> {
        self.snapshots.iter().find(|s| s.name == name)
    }
}

/// Partially received stream, resumable with its token
#[derive(Debug, Clone)]
struct PendingReceive {
    token: String,
    snapshot: FakeSnapshot,
}

#[derive(Debug, Clone)]
struct FakeHost {
    reachable: bool,
    zfs: bool,
    tools: BTreeSet<String>,
    datasets: BTreeMap<String, Dataset>,
}

impl FakeHost {
    fn new() -> Self {
        Self {
            reachable: true,
            zfs: true,
            tools: DEFAULT_TOOLS.iter().map(ToString::to_string).collect(),
            datasets: BTreeMap::new(),
        }
    }

    /// The dataset and, when recursive, its descendants, parents first
    fn family(&self, dataset: &str, recursive: bool) -> Vec<String> {
        let children = format!("{}/", dataset);
        self.datasets
            .keys()
            .filter(|name| *name == dataset || (recursive && name.starts_with(&children)))
            .cloned()
            .collect()
    }
}

#[derive(Debug)]
struct State {
    hosts: BTreeMap<String, FakeHost>,
    commands: Vec<Recorded>,
    pipelines: Vec<String>,
    failing_stage: Option<(StageKind, i32, String)>,
    failing_destroys: BTreeSet<String>,
    minted: u64,
    clock: i64,
}

/// Simulated hosts with datasets, snapshots and pipeline tools
///
/// The local host always exists; remote hosts come into existence the first
/// time a setup method names them. Commands to hosts that were never set up
/// fail as unreachable.
#[derive(Debug)]
pub struct FakeCluster {
    state: Mutex<State>,
}

impl Default for FakeCluster {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeCluster {
    /// A cluster holding only the local host, with every pipeline tool
    pub fn new() -> Self {
        let mut hosts = BTreeMap::new();
        hosts.insert(LOCAL_HOST.to_string(), FakeHost::new());
        Self {
            state: Mutex::new(State {
                hosts,
                commands: Vec::new(),
                pipelines: Vec::new(),
                failing_stage: None,
                failing_destroys: BTreeSet::new(),
                minted: 0,
                clock: EPOCH,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a reachable host with the default tools
    pub fn add_host(&self, host: &Host) -> &Self {
        self.lock().host(&host.label());
        self
    }

    /// Replace the tools found on a host
    pub fn set_tools(&self, host: &Host, tools: &[&str]) -> &Self {
        self.lock().host(&host.label()).tools = tools.iter().map(ToString::to_string).collect();
        self
    }

    /// Make a host answer or time out
    pub fn set_reachable(&self, host: &Host, reachable: bool) -> &Self {
        self.lock().host(&host.label()).reachable = reachable;
        self
    }

    /// Make the storage CLI present or missing on a host
    pub fn set_zfs(&self, host: &Host, installed: bool) -> &Self {
        self.lock().host(&host.label()).zfs = installed;
        self
    }

    /// Create an empty dataset
    pub fn create_dataset(&self, host: &Host, dataset: &str) -> &Self {
        self.lock()
            .host(&host.label())
            .datasets
            .entry(dataset.to_string())
            .or_default();
        self
    }

    /// Take a snapshot with a fresh GUID, creating the dataset if needed
    pub fn take_snapshot(&self, host: &Host, dataset: &str, name: &str) -> u64 {
        let mut state = self.lock();
        let snapshot = state.mint(name);
        let guid = snapshot.guid;
        state
            .host(&host.label())
            .datasets
            .entry(dataset.to_string())
            .or_default()
            .snapshots
            .push(snapshot);
        guid
    }

    /// Add a snapshot with a chosen GUID, e.g. to fake a divergent history
    pub fn insert_snapshot(&self, host: &Host, dataset: &str, name: &str, guid: u64) -> &Self {
        let mut state = self.lock();
        let mut snapshot = state.mint(name);
        snapshot.guid = guid;
        state
            .host(&host.label())
            .datasets
            .entry(dataset.to_string())
            .or_default()
            .snapshots
            .push(snapshot);
        self
    }

    /// Copy an existing snapshot to another dataset as a completed receive would
    ///
    /// # Panics
    ///
    /// Panics if the snapshot does not exist on the sending side.
    pub fn replicate_snapshot(
        &self,
        from: &Host,
        from_dataset: &str,
        name: &str,
        to: &Host,
        to_dataset: &str,
    ) -> &Self {
        let mut state = self.lock();
        let snapshot = state
            .snapshot(&from.label(), from_dataset, name)
            .unwrap_or_else(|| panic!("{}@{} does not exist on {}", from_dataset, name, from));
        state
            .host(&to.label())
            .datasets
            .entry(to_dataset.to_string())
            .or_default()
            .snapshots
            .push(snapshot);
        self
    }

    /// Leave a partially received copy of a snapshot and return its token
    ///
    /// # Panics
    ///
    /// Panics if the snapshot does not exist on the sending side.
    pub fn interrupt_receive(
        &self,
        from: &Host,
        from_dataset: &str,
        name: &str,
        to: &Host,
        to_dataset: &str,
    ) -> String {
        let mut state = self.lock();
        let snapshot = state
            .snapshot(&from.label(), from_dataset, name)
            .unwrap_or_else(|| panic!("{}@{} does not exist on {}", from_dataset, name, from));
        let token = format!("1-{:x}-c8-789c636064000310a500c4ec50360710e72765a5269740", snapshot.guid);
        state
            .host(&to.label())
            .datasets
            .entry(to_dataset.to_string())
            .or_default()
            .pending = Some(PendingReceive {
            token: token.clone(),
            snapshot,
        });
        token
    }

    /// Make the next pipeline fail at the first stage of this kind
    pub fn fail_next_stage(&self, kind: StageKind, exit_code: i32, stderr: &str) -> &Self {
        self.lock().failing_stage = Some((kind, exit_code, stderr.to_string()));
        self
    }

    /// Make destroying `dataset@name` on a host fail
    pub fn fail_destroy(&self, host: &Host, dataset: &str, name: &str) -> &Self {
        self.lock()
            .failing_destroys
            .insert(format!("{}:{}@{}", host.label(), dataset, name));
        self
    }

    /// Whether a dataset exists
    pub fn dataset_exists(&self, host: &Host, dataset: &str) -> bool {
        self.lock()
            .hosts
            .get(&host.label())
            .is_some_and(|h| h.datasets.contains_key(dataset))
    }

    /// Snapshots of a dataset, oldest first
    pub fn snapshots(&self, host: &Host, dataset: &str) -> Vec<FakeSnapshot> {
        self.lock()
            .hosts
            .get(&host.label())
            .and_then(|h| h.datasets.get(dataset))
            .map(|d| d.snapshots.clone())
            .unwrap_or_default()
    }

    /// Snapshot names of a dataset, oldest first
    pub fn snapshot_names(&self, host: &Host, dataset: &str) -> Vec<String> {
        self.snapshots(host, dataset)
            .into_iter()
            .map(|s| s.name)
            .collect()
    }

    /// GUID of `dataset@name`
    pub fn guid(&self, host: &Host, dataset: &str, name: &str) -> Option<u64> {
        self.lock()
            .snapshot(&host.label(), dataset, name)
            .map(|s| s.guid)
    }

    /// Pending resume token on a dataset
    pub fn resume_token(&self, host: &Host, dataset: &str) -> Option<String> {
        self.lock()
            .hosts
            .get(&host.label())
            .and_then(|h| h.datasets.get(dataset))
            .and_then(|d| d.pending.as_ref())
            .map(|p| p.token.clone())
    }

    /// Every command that reached a host, in order
    pub fn commands(&self) -> Vec<Recorded> {
        self.lock().commands.clone()
    }

    /// Commands that changed state
    pub fn mutations(&self) -> Vec<Recorded> {
        self.lock()
            .commands
            .iter()
            .filter(|c| c.mutating)
            .cloned()
            .collect()
    }

    /// Descriptions of every pipeline that ran
    pub fn pipelines(&self) -> Vec<String> {
        self.lock().pipelines.clone()
    }
}

#[async_trait]
impl HostExecutor for FakeCluster {
    async fn run(&self, host: &Host, command: &Command) -> Result<CommandOutput> {
        let mut state = self.lock();
        state.connect(host)?;
        let label = host.label();
        state.commands.push(Recorded {
            host: label.clone(),
            command: command.to_shell(),
            mutating: command.is_mutating(),
        });
        Ok(state.answer(&label, command))
    }

    async fn run_pipeline(&self, pipeline: &Pipeline) -> Result<PipelineReport> {
        let mut state = self.lock();
        state.pipelines.push(pipeline.describe());
        for leg in &pipeline.legs {
            state.connect(&leg.host)?;
        }

        for (leg, stage) in pipeline.stages() {
            let program = stage.command.program.as_str();
            let host = state.host(&pipeline.legs[leg].host.label());
            let installed = if program == "zfs" {
                host.zfs
            } else {
                host.tools.contains(program)
            };
            if !installed {
                return Err(stage_error(
                    leg,
                    stage,
                    127,
                    format!("sh: 1: {}: not found", program),
                ));
            }
            if state
                .failing_stage
                .as_ref()
                .is_some_and(|(kind, _, _)| *kind == stage.kind)
            {
                if let Some((_, exit_code, stderr)) = state.failing_stage.take() {
                    return Err(stage_error(leg, stage, exit_code, stderr));
                }
            }
        }

        state.transfer(pipeline)?;
        Ok(PipelineReport {
            elapsed: Duration::from_millis(1),
            stages: pipeline.stages().count(),
            dry_run: false,
        })
    }
}

fn stage_error<S: Into<String>>(leg: usize, stage: &Stage, exit_code: i32, stderr: S) -> Error {
    Error::PipelineStage {
        leg,
        stage: stage.describe(),
        exit_code: Some(exit_code),
        stderr_tail: stderr.into(),
    }
}

fn missing(name: &str) -> CommandOutput {
    CommandOutput::failure(1, format!("cannot open '{}': dataset does not exist\n", name))
}

/// Parsed `zfs send` arguments
enum SendPlan {
    Full {
        path: String,
        recursive: bool,
    },
    Incremental {
        base: String,
        path: String,
        recursive: bool,
    },
    Resume {
        token: String,
    },
}

impl SendPlan {
    fn parse(command: &Command) -> Option<Self> {
        let mut args = command.args.iter().map(String::as_str);
        if args.next() != Some("send") {
            return None;
        }
        let (mut recursive, mut base, mut target) = (false, None, None);
        while let Some(arg) = args.next() {
            match arg {
                "-t" => {
                    return args.next().map(|token| Self::Resume {
                        token: token.to_string(),
                    })
                }
                "-p" => {}
                "-R" => recursive = true,
                "-i" => base = Some(args.next()?.to_string()),
                path => target = Some(path.to_string()),
            }
        }
        let path = target?;
        Some(match base {
            Some(base) => Self::Incremental {
                base,
                path,
                recursive,
            },
            None => Self::Full { path, recursive },
        })
    }
}

/// Parsed `zfs receive` arguments
struct ReceivePlan {
    dataset: String,
    force: bool,
}

impl ReceivePlan {
    fn parse(command: &Command) -> Option<Self> {
        let mut args = command.args.iter().map(String::as_str);
        if args.next() != Some("receive") {
            return None;
        }
        let mut force = false;
        let mut dataset = None;
        for arg in args {
            match arg {
                "-u" | "-s" => {}
                "-F" => force = true,
                name => dataset = Some(name.to_string()),
            }
        }
        Some(Self {
            dataset: dataset?,
            force,
        })
    }
}

impl State {
    fn host(&mut self, label: &str) -> &mut FakeHost {
        self.hosts
            .entry(label.to_string())
            .or_insert_with(FakeHost::new)
    }

    fn connect(&self, host: &Host) -> Result<()> {
        match self.hosts.get(&host.label()) {
            Some(fake) if fake.reachable => Ok(()),
            Some(_) => Err(Error::connectivity(
                host.label(),
                "ssh: connect to host port 22: Connection timed out",
            )),
            None => Err(Error::connectivity(
                host.label(),
                "ssh: Could not resolve hostname: Name or service not known",
            )),
        }
    }

    fn mint(&mut self, name: &str) -> FakeSnapshot {
        self.minted += 1;
        self.clock += TICK;
        FakeSnapshot {
            name: name.to_string(),
            guid: 0x5a17_0000_0000_0000 | self.minted.wrapping_mul(0x9e37_79b9),
            creation: self.clock,
        }
    }

    fn snapshot(&self, label: &str, dataset: &str, name: &str) -> Option<FakeSnapshot> {
        self.hosts
            .get(label)
            .and_then(|h| h.datasets.get(dataset))
            .and_then(|d| d.get(name))
            .cloned()
    }

    fn snapshot_at(&self, label: &str, path: &str) -> Option<FakeSnapshot> {
        let (dataset, name) = path.split_once('@')?;
        self.snapshot(label, dataset, name)
    }

    fn answer(&mut self, label: &str, command: &Command) -> CommandOutput {
        let args: Vec<&str> = command.args.iter().map(String::as_str).collect();
        if command.program == "zfs" && !self.host(label).zfs {
            return CommandOutput::failure(127, "sh: 1: zfs: not found\n");
        }

        match (command.program.as_str(), args.as_slice()) {
            ("zfs", ["version"]) => CommandOutput::success("zfs-2.2.2-1\nzfs-kmod-2.2.2-1\n"),
            ("sh", ["-c", script]) => match script.strip_prefix("command -v ") {
                Some(tool) if self.host(label).tools.contains(tool) => {
                    CommandOutput::success(format!("/usr/bin/{}\n", tool))
                }
                _ => CommandOutput::failure(1, ""),
            },
            ("zfs", ["list", "-H", "-o", "name", dataset]) => {
                if self.host(label).datasets.contains_key(*dataset) {
                    CommandOutput::success(format!("{}\n", dataset))
                } else {
                    missing(dataset)
                }
            }
            ("zfs", ["list", "-H", "-o", "name", "-t", "filesystem,volume", scope @ ..]) => {
                self.list_datasets(label, scope)
            }
            (
                "zfs",
                ["list", "-H", "-p", "-t", "snapshot", "-o", "name,guid,creation", "-s", "creation", depth @ .., dataset],
            ) => self.list_snapshots(label, dataset, matches!(depth, ["-r"])),
            ("zfs", ["list", "-H", "-t", "snapshot", "-o", "name", path]) => {
                match self.snapshot_at(label, path) {
                    Some(_) => CommandOutput::success(format!("{}\n", path)),
                    None => missing(path),
                }
            }
            ("zfs", ["get", "-H", "-p", "-o", "value", "guid", path]) => {
                match self.snapshot_at(label, path) {
                    Some(snapshot) => CommandOutput::success(format!("{}\n", snapshot.guid)),
                    None => missing(path),
                }
            }
            ("zfs", ["list", "-H", "-p", "-o", "used", path]) => {
                let used = if path.contains('@') {
                    self.snapshot_at(label, path).map(|_| SNAPSHOT_USED)
                } else {
                    self.host(label)
                        .datasets
                        .contains_key(*path)
                        .then_some(DATASET_USED)
                };
                match used {
                    Some(bytes) => CommandOutput::success(format!("{}\n", bytes)),
                    None => missing(path),
                }
            }
            ("zfs", ["get", "-H", "-o", "value", "receive_resume_token", dataset]) => {
                match self.host(label).datasets.get(*dataset) {
                    Some(Dataset {
                        pending: Some(pending),
                        ..
                    }) => CommandOutput::success(format!("{}\n", pending.token)),
                    Some(_) => CommandOutput::success("-\n"),
                    None => missing(dataset),
                }
            }
            ("zfs", ["snapshot", "-r", path]) => self.create(label, path, true),
            ("zfs", ["snapshot", path]) => self.create(label, path, false),
            ("zfs", ["destroy", "-r", path]) => self.destroy(label, path, true),
            ("zfs", ["destroy", path]) => self.destroy(label, path, false),
            ("zfs", ["rename", "-r", from, to]) => self.rename(label, from, to, true),
            ("zfs", ["rename", from, to]) => self.rename(label, from, to, false),
            ("zfs", ["send", "-n", "-v", "-P", ..]) => {
                CommandOutput::success(format!("size\t{}\n", SNAPSHOT_USED))
            }
            _ => CommandOutput::failure(2, format!("unsupported command: {}\n", command)),
        }
    }

    fn list_datasets(&mut self, label: &str, scope: &[&str]) -> CommandOutput {
        let host = self.host(label);
        let names = match scope {
            ["-r", root] => {
                if !host.datasets.contains_key(*root) {
                    return missing(root);
                }
                host.family(root, true)
            }
            _ => host.datasets.keys().cloned().collect(),
        };
        CommandOutput::success(names.iter().map(|n| format!("{}\n", n)).collect::<String>())
    }

    fn list_snapshots(&mut self, label: &str, dataset: &str, recursive: bool) -> CommandOutput {
        let host = self.host(label);
        if !host.datasets.contains_key(dataset) {
            return missing(dataset);
        }
        let mut rows: Vec<(String, &FakeSnapshot)> = Vec::new();
        for name in host.family(dataset, recursive) {
            if let Some(member) = host.datasets.get(&name) {
                rows.extend(member.snapshots.iter().map(|s| (name.clone(), s)));
            }
        }
        rows.sort_by_key(|(_, s)| s.creation);
        CommandOutput::success(
            rows.iter()
                .map(|(name, s)| format!("{}@{}\t{}\t{}\n", name, s.name, s.guid, s.creation))
                .collect::<String>(),
        )
    }

    fn create(&mut self, label: &str, path: &str, recursive: bool) -> CommandOutput {
        let Some((dataset, name)) = path.split_once('@') else {
            return CommandOutput::failure(1, format!("invalid snapshot name '{}'\n", path));
        };
        let Some(top) = self.host(label).datasets.get(dataset) else {
            return missing(dataset);
        };
        if top.get(name).is_some() {
            return CommandOutput::failure(
                1,
                format!("cannot create snapshot '{}': dataset already exists\n", path),
            );
        }
        for member in self.host(label).family(dataset, recursive) {
            let snapshot = self.mint(name);
            if let Some(target) = self.host(label).datasets.get_mut(&member) {
                if target.get(name).is_none() {
                    target.snapshots.push(snapshot);
                }
            }
        }
        CommandOutput::success("")
    }

    fn destroy(&mut self, label: &str, path: &str, recursive: bool) -> CommandOutput {
        if self.failing_destroys.contains(&format!("{}:{}", label, path)) {
            return CommandOutput::failure(
                1,
                format!("cannot destroy snapshot {}: dataset is busy\n", path),
            );
        }
        let Some((dataset, name)) = path.split_once('@') else {
            return CommandOutput::failure(1, format!("invalid snapshot name '{}'\n", path));
        };
        let host = self.host(label);
        match host.datasets.get(dataset) {
            None => return missing(dataset),
            Some(top) if top.get(name).is_none() => {
                return CommandOutput::failure(
                    1,
                    "could not find any snapshots to destroy; check snapshot names.\n",
                )
            }
            Some(_) => {}
        }
        for member in host.family(dataset, recursive) {
            if let Some(target) = host.datasets.get_mut(&member) {
                target.snapshots.retain(|s| s.name != name);
            }
        }
        CommandOutput::success("")
    }

    fn rename(&mut self, label: &str, from: &str, to: &str, recursive: bool) -> CommandOutput {
        let (Some((dataset, old)), Some((to_dataset, new))) = (from.split_once('@'), to.split_once('@'))
        else {
            return CommandOutput::failure(1, "snapshot names must contain '@'\n");
        };
        if dataset != to_dataset {
            return CommandOutput::failure(
                1,
                "cannot rename to a different dataset: snapshots must be part of same dataset\n",
            );
        }
        let host = self.host(label);
        match host.datasets.get(dataset) {
            None => return missing(dataset),
            Some(top) if top.get(old).is_none() => return missing(from),
            Some(top) if top.get(new).is_some() => {
                return CommandOutput::failure(
                    1,
                    format!("cannot rename to '{}': dataset already exists\n", to),
                )
            }
            Some(_) => {}
        }
        for member in host.family(dataset, recursive) {
            if let Some(target) = host.datasets.get_mut(&member) {
                if target.get(new).is_some() {
                    continue;
                }
                if let Some(snapshot) = target.snapshots.iter_mut().find(|s| s.name == old) {
                    snapshot.name = new.to_string();
                }
            }
        }
        CommandOutput::success("")
    }

    /// Apply the stream described by the send and receive stages
    fn transfer(&mut self, pipeline: &Pipeline) -> Result<()> {
        let find = |kind: StageKind| {
            pipeline
                .stages()
                .find(|(_, stage)| stage.kind == kind)
                .ok_or_else(|| Error::validation(format!("pipeline has no {} stage", kind)))
        };
        let (send_leg, send) = find(StageKind::Send)?;
        let (receive_leg, receive) = find(StageKind::Receive)?;
        let source = pipeline.legs[send_leg].host.label();
        let destination = pipeline.legs[receive_leg].host.label();

        let plan = SendPlan::parse(&send.command)
            .ok_or_else(|| stage_error(send_leg, send, 2, "invalid send arguments"))?;
        let target = ReceivePlan::parse(&receive.command)
            .ok_or_else(|| stage_error(receive_leg, receive, 2, "invalid receive arguments"))?;
        let refuse = |message: String| stage_error(receive_leg, receive, 1, message);

        match plan {
            SendPlan::Resume { token } => {
                let dataset = self.host(&destination).datasets.get_mut(&target.dataset);
                match dataset {
                    Some(dataset) if dataset.pending.as_ref().is_some_and(|p| p.token == token) => {
                        if let Some(pending) = dataset.pending.take() {
                            dataset.snapshots.push(pending.snapshot);
                        }
                        Ok(())
                    }
                    _ => Err(refuse(format!(
                        "cannot resume send: {} has no matching partially-received state",
                        target.dataset
                    ))),
                }
            }
            SendPlan::Full { path, recursive } => {
                let Some((dataset, name)) = path.split_once('@') else {
                    return Err(stage_error(send_leg, send, 1, "invalid snapshot path"));
                };
                let streams = self.streams(&source, dataset, recursive);
                let mut received = Vec::new();
                for (suffix, snapshots) in streams {
                    let Some(index) = snapshots.iter().position(|s| s.name == name) else {
                        if suffix.is_empty() {
                            return Err(stage_error(
                                send_leg,
                                send,
                                1,
                                format!("cannot open '{}': dataset does not exist", path),
                            ));
                        }
                        continue;
                    };
                    let sent = if recursive {
                        snapshots[..=index].to_vec()
                    } else {
                        vec![snapshots[index].clone()]
                    };
                    received.push((format!("{}{}", target.dataset, suffix), sent));
                }

                let exists = self
                    .host(&destination)
                    .datasets
                    .contains_key(&target.dataset);
                if exists && !target.force {
                    return Err(refuse(format!(
                        "cannot receive new filesystem stream: destination '{}' exists\n\
                         must specify -F to overwrite it",
                        target.dataset
                    )));
                }
                let host = self.host(&destination);
                for (name, snapshots) in received {
                    host.datasets.insert(
                        name,
                        Dataset {
                            snapshots,
                            pending: None,
                        },
                    );
                }
                Ok(())
            }
            SendPlan::Incremental {
                base,
                path,
                recursive,
            } => {
                let (Some((dataset, name)), Some((_, base_name))) =
                    (path.split_once('@'), base.split_once('@'))
                else {
                    return Err(stage_error(send_leg, send, 1, "invalid snapshot path"));
                };
                let streams = self.streams(&source, dataset, recursive);
                let mut deltas = Vec::new();
                for (suffix, snapshots) in streams {
                    let from = snapshots.iter().find(|s| s.name == base_name).cloned();
                    let to = snapshots.iter().find(|s| s.name == name).cloned();
                    match (from, to) {
                        (Some(from), Some(to)) => deltas.push((suffix, from, to)),
                        _ if suffix.is_empty() => {
                            return Err(stage_error(
                                send_leg,
                                send,
                                1,
                                format!("incremental source {} or target {} does not exist", base, path),
                            ))
                        }
                        _ => {}
                    }
                }

                let force = target.force;
                let host = self.host(&destination);
                for (suffix, from, to) in deltas {
                    let name = format!("{}{}", target.dataset, suffix);
                    let top = suffix.is_empty();
                    let Some(received) = host.datasets.get_mut(&name) else {
                        if top {
                            return Err(refuse(format!(
                                "cannot receive incremental stream: destination '{}' does not exist",
                                name
                            )));
                        }
                        continue;
                    };
                    let Some(position) = received
                        .snapshots
                        .iter()
                        .position(|s| s.name == from.name && s.guid == from.guid)
                    else {
                        if top {
                            return Err(refuse(format!(
                                "cannot receive incremental stream: most recent snapshot of {} \
                                 does not match incremental source",
                                name
                            )));
                        }
                        continue;
                    };
                    if position + 1 < received.snapshots.len() {
                        if !force {
                            return Err(refuse(format!(
                                "cannot receive incremental stream: destination {} has been \
                                 modified since most recent snapshot",
                                name
                            )));
                        }
                        received.snapshots.truncate(position + 1);
                    }
                    received.snapshots.push(to);
                }
                Ok(())
            }
        }
    }

    /// Snapshots of the sent dataset and, when recursive, its descendants,
    /// keyed by the path suffix below the sent dataset
    fn streams(
        &mut self,
        label: &str,
        dataset: &str,
        recursive: bool,
    ) -> Vec<(String, Vec<FakeSnapshot>)> {
        let host = self.host(label);
        host.family(dataset, recursive)
            .into_iter()
            .filter_map(|name| {
                let snapshots = host.datasets.get(&name)?.snapshots.clone();
                Some((name[dataset.len()..].to_string(), snapshots))
            })
            .collect()
    }
}
