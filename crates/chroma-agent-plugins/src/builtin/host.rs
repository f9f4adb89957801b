//! `host` device plugin: node name, boot time and load average.

use std::fs;
use std::path::PathBuf;

use async_trait::async_trait;
use chroma_agent_core::properties::{format_timestamp, parse_btime};
use serde_json::{Value, json};

use crate::device::{DevicePlugin, PollOutcome};
use crate::error::{PluginError, PluginResult};

pub const NAME: &str = "host";

#[derive(Debug)]
pub struct HostPlugin {
    proc_root: PathBuf,
    last_load: Option<Vec<f64>>,
}

impl Default for HostPlugin {
    fn default() -> Self {
        Self::new("/proc")
    }
}

impl HostPlugin {
    pub fn new(proc_root: impl Into<PathBuf>) -> Self {
        Self {
            proc_root: proc_root.into(),
            last_load: None,
        }
    }

    fn read(&self, rel: &str) -> PluginResult<String> {
        Ok(fs::read_to_string(self.proc_root.join(rel))?)
    }

    /// 1, 5 and 15 minute load, rounded to one decimal.
    fn load_average(&self) -> PluginResult<Vec<f64>> {
        let text = self.read("loadavg")?;
        let load: Vec<f64> = text
            .split_whitespace()
            .take(3)
            .map(|field| field.parse::<f64>().map(|v| (v * 10.0).round() / 10.0))
            .collect::<Result<_, _>>()
            .map_err(|e| PluginError::Parse {
                what: "loadavg",
                reason: e.to_string(),
            })?;
        if load.len() != 3 {
            return Err(PluginError::Parse {
                what: "loadavg",
                reason: format!("expected 3 fields, got {}", load.len()),
            });
        }
        Ok(load)
    }

    fn snapshot(&mut self) -> PluginResult<Value> {
        let nodename = self.read("sys/kernel/hostname")?.trim().to_string();
        let boot_time = parse_btime(&self.read("stat")?).ok_or(PluginError::Parse {
            what: "stat",
            reason: "no btime line".into(),
        })?;
        let load = self.load_average()?;
        self.last_load = Some(load.clone());

        Ok(json!({
            "nodename": nodename,
            "boot_time": format_timestamp(&boot_time),
            "load_average": load,
        }))
    }
}

#[async_trait]
impl DevicePlugin for HostPlugin {
    async fn start_session(&mut self) -> PluginResult<Option<Value>> {
        self.snapshot().map(Some)
    }

    async fn update_session(&mut self) -> PluginResult<PollOutcome> {
        let load = self.load_average()?;
        if self.last_load.as_ref() == Some(&load) {
            return Ok(PollOutcome::Empty);
        }
        self.last_load = Some(load.clone());
        Ok(PollOutcome::Delta(json!({ "load_average": load })))
    }
}
