//! Device plugins: samplers of local state that feed a session.

use std::sync::Arc;

use async_trait::async_trait;
use chroma_agent_core::Priority;
use serde_json::Value;

use crate::error::PluginResult;

/// What one call to [`DevicePlugin::update_session`] produced.
#[derive(Debug, Clone, PartialEq)]
pub enum PollOutcome {
    /// A full, self-contained view.
    Snapshot(Value),
    /// Changes since the previous report.
    Delta(Value),
    /// Several bodies emitted together at one priority (log-style streams).
    Batch { bodies: Vec<Value>, priority: Priority },
    /// Nothing changed this tick.
    Empty,
    /// The plugin skipped this tick.
    Yield,
}

#[async_trait]
pub trait DevicePlugin: Send {
    /// Full snapshot for a fresh session; `None` means "not ready yet".
    async fn start_session(&mut self) -> PluginResult<Option<Value>>;

    async fn update_session(&mut self) -> PluginResult<PollOutcome>;

    async fn teardown(&mut self) -> PluginResult<()> {
        Ok(())
    }

    /// Manager-to-agent `DATA` for this plugin's session.
    async fn on_message(&mut self, _body: Value) -> PluginResult<()> {
        Ok(())
    }
}

/// Builds a fresh plugin instance for every new session.
pub type DeviceFactory = Arc<dyn Fn() -> Box<dyn DevicePlugin> + Send + Sync>;
