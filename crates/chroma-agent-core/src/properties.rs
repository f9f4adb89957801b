//! Identity of the server the agent runs on.

use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// Hostname the manager rejects at registration; it cannot identify a server.
pub const UNCONFIGURED_FQDN: &str = "localhost.localdomain";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerProperties {
    pub fqdn: String,
    pub nodename: String,
    pub boot_time: DateTime<Utc>,
}

impl ServerProperties {
    pub fn new(fqdn: impl Into<String>, nodename: impl Into<String>, boot_time: DateTime<Utc>) -> Self {
        Self {
            fqdn: fqdn.into(),
            nodename: nodename.into(),
            boot_time,
        }
    }

    /// Boot time as sent to the manager (`2024-01-01T00:00:00Z`).
    pub fn boot_time_rfc3339(&self) -> String {
        format_timestamp(&self.boot_time)
    }

    pub fn is_unconfigured(&self) -> bool {
        self.fqdn == UNCONFIGURED_FQDN
    }
}

pub fn format_timestamp(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Extract the boot time from the contents of `/proc/stat`.
pub fn parse_btime(proc_stat: &str) -> Option<DateTime<Utc>> {
    proc_stat
        .lines()
        .find_map(|line| line.strip_prefix("btime "))
        .and_then(|rest| rest.trim().parse::<i64>().ok())
        .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
}
