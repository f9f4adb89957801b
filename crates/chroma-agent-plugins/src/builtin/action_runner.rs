//! `action_runner` device plugin.
//!
//! Produces no telemetry of its own. Its session is the channel the manager
//! sends `ACTION_INVOKE` on and the agent returns action results through.

use async_trait::async_trait;
use serde_json::{Value, json};

use crate::device::{DevicePlugin, PollOutcome};
use crate::error::PluginResult;

pub const NAME: &str = "action_runner";

#[derive(Debug, Default)]
pub struct ActionRunnerPlugin;

#[async_trait]
impl DevicePlugin for ActionRunnerPlugin {
    async fn start_session(&mut self) -> PluginResult<Option<Value>> {
        Ok(Some(json!({})))
    }

    async fn update_session(&mut self) -> PluginResult<PollOutcome> {
        Ok(PollOutcome::Yield)
    }
}
