//! One-shot capability probe
//!
//! The probe is a gate: it runs once per host per job, before any transfer,
//! and is never retried. It is the only step that honours cancellation.

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use zfs_sync_types::{Command, Error, Host, HostCapabilities, HostExecutor, Result};

use crate::session::SshOptions;

/// Extra time on top of the connect timeout for the probe command itself
const PROBE_GRACE: Duration = Duration::from_secs(20);

/// `zfs version`, proving the storage CLI answers on the host
pub fn zfs_version_command() -> Command {
    Command::read_only("zfs").arg("version")
}

/// `sh -c 'command -v <tool>'`
pub fn tool_lookup_command(tool: &str) -> Command {
    Command::read_only("sh").args(["-c".to_string(), format!("command -v {}", tool)])
}

/// Check that the storage CLI works on `host` and which `tools` exist there
pub async fn probe_host<E: HostExecutor + ?Sized>(
    executor: &E,
    host: &Host,
    tools: &[&str],
    cancel: &CancellationToken,
) -> Result<HostCapabilities> {
    let timeout = SshOptions::connect_timeout(host).as_duration() + PROBE_GRACE;
    let probe = async {
        let output = executor.run(host, &zfs_version_command()).await?;
        if !output.is_success() {
            return Err(Error::capability(host.label(), "zfs"));
        }
        let mut capabilities = HostCapabilities {
            zfs_version: output.lines().next().unwrap_or_default().to_string(),
            ..HostCapabilities::default()
        };

        for tool in tools {
            let found = executor.run(host, &tool_lookup_command(tool)).await?;
            if found.is_success() {
                capabilities.tools.insert((*tool).to_string());
            } else {
                debug!(host = %host, tool, "Tool not found");
            }
        }
        Ok(capabilities)
    };

    let capabilities = tokio::select! {
        biased;
        () = cancel.cancelled() => return Err(Error::Cancelled),
        result = tokio::time::timeout(timeout, probe) => match result {
            Ok(result) => result?,
            Err(_) => {
                return Err(Error::connectivity(
                    host.label(),
                    format!("no answer within {} seconds", timeout.as_secs()),
                ))
            }
        },
    };

    info!(
        host = %host,
        zfs = %capabilities.zfs_version,
        tools = ?capabilities.tools,
        "Host capabilities verified"
    );
    Ok(capabilities)
}
