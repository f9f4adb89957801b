//! Identity of the server the agent runs on.

use std::fs;
use std::path::Path;

use anyhow::{Context, anyhow};
use chroma_agent_core::ServerProperties;
use chroma_agent_core::properties::parse_btime;
use tokio::process::Command;
use tracing::{debug, warn};

/// Read the server's properties from the live system.
pub async fn detect() -> anyhow::Result<ServerProperties> {
    let fqdn = lookup_fqdn().await;
    from_proc(Path::new("/proc"), fqdn)
}

/// `hostname --fqdn`, if it answers with something.
async fn lookup_fqdn() -> Option<String> {
    match Command::new("hostname").arg("--fqdn").output().await {
        Ok(output) if output.status.success() => {
            let fqdn = String::from_utf8_lossy(&output.stdout).trim().to_string();
            (!fqdn.is_empty()).then_some(fqdn)
        }
        Ok(output) => {
            debug!(rc = ?output.status.code(), "hostname --fqdn failed");
            None
        }
        Err(e) => {
            warn!(error = %e, "cannot run hostname");
            None
        }
    }
}

/// Build properties from a proc tree; the fqdn falls back to the nodename.
pub fn from_proc(proc_root: &Path, fqdn: Option<String>) -> anyhow::Result<ServerProperties> {
    let hostname_path = proc_root.join("sys/kernel/hostname");
    let nodename = fs::read_to_string(&hostname_path)
        .with_context(|| format!("reading {}", hostname_path.display()))?
        .trim()
        .to_string();

    let stat_path = proc_root.join("stat");
    let stat = fs::read_to_string(&stat_path)
        .with_context(|| format!("reading {}", stat_path.display()))?;
    let boot_time =
        parse_btime(&stat).ok_or_else(|| anyhow!("no btime line in {}", stat_path.display()))?;

    let fqdn = fqdn.unwrap_or_else(|| nodename.clone());
    Ok(ServerProperties::new(fqdn, nodename, boot_time))
}
