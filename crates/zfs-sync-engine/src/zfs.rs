//! Storage CLI command lines
//!
//! Every `zfs` invocation the engine issues is built here, so the exact
//! argv is easy to audit and to interpret in the simulated cluster.

use zfs_sync_types::{Command, TransferKind};

/// Program name of the storage CLI
pub const ZFS: &str = "zfs";

/// `zfs list -H -o name <dataset>`, succeeds iff the dataset exists
pub fn dataset_exists(dataset: &str) -> Command {
    Command::read_only(ZFS).args(["list", "-H", "-o", "name", dataset])
}

/// Filesystems and volumes on a host, or below `root`
pub fn list_datasets(root: Option<&str>) -> Command {
    let command =
        Command::read_only(ZFS).args(["list", "-H", "-o", "name", "-t", "filesystem,volume"]);
    match root {
        Some(root) => command.args(["-r", root]),
        None => command,
    }
}

/// Snapshots of `dataset` as `name guid creation`, oldest first
///
/// Non-recursive listing covers only the dataset itself; recursive listing
/// includes every descendant.
pub fn list_snapshots(dataset: &str, recursive: bool) -> Command {
    let command = Command::read_only(ZFS).args([
        "list",
        "-H",
        "-p",
        "-t",
        "snapshot",
        "-o",
        "name,guid,creation",
        "-s",
        "creation",
    ]);
    if recursive {
        command.args(["-r", dataset])
    } else {
        command.args(["-d", "1", dataset])
    }
}

/// `zfs list -H -t snapshot -o name <dataset@snapshot>`
pub fn snapshot_exists(path: &str) -> Command {
    Command::read_only(ZFS).args(["list", "-H", "-t", "snapshot", "-o", "name", path])
}

/// `zfs get -H -p -o value guid <path>`
pub fn guid(path: &str) -> Command {
    Command::read_only(ZFS).args(["get", "-H", "-p", "-o", "value", "guid", path])
}

/// `zfs list -H -p -o used <path>`
pub fn used(path: &str) -> Command {
    Command::read_only(ZFS).args(["list", "-H", "-p", "-o", "used", path])
}

/// `zfs get -H -o value receive_resume_token <dataset>`
pub fn resume_token(dataset: &str) -> Command {
    Command::read_only(ZFS).args(["get", "-H", "-o", "value", "receive_resume_token", dataset])
}

/// `zfs snapshot [-r] <dataset@snapshot>`
pub fn create_snapshot(path: &str, recursive: bool) -> Command {
    Command::mutating(ZFS)
        .arg("snapshot")
        .arg_if(recursive, "-r")
        .arg(path)
}

/// `zfs destroy [-r] <dataset@snapshot>`
pub fn destroy_snapshot(path: &str, recursive: bool) -> Command {
    Command::mutating(ZFS)
        .arg("destroy")
        .arg_if(recursive, "-r")
        .arg(path)
}

/// `zfs rename [-r] <dataset@from> <dataset@to>`
pub fn rename_snapshot(from: &str, to: &str, recursive: bool) -> Command {
    Command::mutating(ZFS)
        .arg("rename")
        .arg_if(recursive, "-r")
        .args([from, to])
}

/// Producer of the replication stream
///
/// A resume send is fully determined by its token; no other flags apply.
pub fn send(dataset: &str, kind: &TransferKind, snapshot: &str, recursive: bool) -> Command {
    let command = Command::read_only(ZFS).arg("send");
    send_arguments(command, dataset, kind, snapshot, recursive)
}

/// Dry-run of the producer that reports the stream size
pub fn send_estimate(
    dataset: &str,
    kind: &TransferKind,
    snapshot: &str,
    recursive: bool,
) -> Command {
    let command = Command::read_only(ZFS).args(["send", "-n", "-v", "-P"]);
    send_arguments(command, dataset, kind, snapshot, recursive)
}

fn send_arguments(
    command: Command,
    dataset: &str,
    kind: &TransferKind,
    snapshot: &str,
    recursive: bool,
) -> Command {
    let target = format!("{}@{}", dataset, snapshot);
    match kind {
        TransferKind::Resume { token } => command.args(["-t", token.as_str()]),
        TransferKind::Full => command.arg("-p").arg_if(recursive, "-R").arg(target),
        TransferKind::Incremental { base } => command
            .arg("-p")
            .arg_if(recursive, "-R")
            .arg("-i")
            .arg(format!("{}@{}", dataset, base))
            .arg(target),
    }
}

/// Consumer of the replication stream
///
/// Always `-u`. A resumable receive gets `-s` and never `-F`.
pub fn receive(dataset: &str, resumable: bool) -> Command {
    Command::mutating(ZFS)
        .args(["receive", "-u"])
        .arg(if resumable { "-s" } else { "-F" })
        .arg(dataset)
}

/// Parse the byte count from `zfs send -n -v -P` output
///
/// The parsable output carries a `size<TAB><bytes>` line, on stdout for
/// recent releases and on stderr for older ones.
pub fn parse_estimate(output: &str) -> Option<u64> {
    output.lines().rev().find_map(|line| {
        let mut fields = line.split_whitespace();
        match (fields.next(), fields.next()) {
            (Some("size"), Some(bytes)) => bytes.parse().ok(),
            _ => None,
        }
    })
}
