//! `server_power` action plugin: reboot and power off.
//!
//! Both actions report success first and act afterwards, through a
//! post-response callback. The callback blocks on the command, so callers
//! must run it off the async executor (e.g. `spawn_blocking`).

use async_trait::async_trait;
use serde_json::Value;
use tokio::runtime::Handle;
use tracing::error;

use crate::action::{Action, ActionContext, ActionOutcome, ActionPlugin, AfterResponse, Args};
use crate::shell::CommandRecorder;

pub const NAME: &str = "server_power";

pub fn plugin() -> ActionPlugin {
    ActionPlugin::new(NAME)
        .capability("manage_server")
        .action(RebootServer)
        .action(ShutdownServer)
}

fn deferred(recorder: &CommandRecorder, command: &'static [&'static str]) -> ActionOutcome {
    let recorder = recorder.clone();
    let handle = Handle::current();
    ActionOutcome::PostResponse {
        result: Value::Null,
        callback: Box::new(move || match handle.block_on(recorder.try_run(command)) {
            Ok(_) => AfterResponse::Terminate { exit_code: 0 },
            Err(e) => {
                error!(command = ?command, error = %e, "power command failed");
                AfterResponse::Continue
            }
        }),
    }
}

pub struct RebootServer;

#[async_trait]
impl Action for RebootServer {
    fn name(&self) -> &'static str {
        "reboot_server"
    }

    async fn run(&self, ctx: &ActionContext, _args: &Args) -> anyhow::Result<ActionOutcome> {
        Ok(deferred(&ctx.recorder, &["shutdown", "-r", "now"]))
    }
}

pub struct ShutdownServer;

#[async_trait]
impl Action for ShutdownServer {
    fn name(&self) -> &'static str {
        "shutdown_server"
    }

    async fn run(&self, ctx: &ActionContext, _args: &Args) -> anyhow::Result<ActionOutcome> {
        Ok(deferred(&ctx.recorder, &["shutdown", "-H", "now"]))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::registry::PluginRegistry;
    use crate::shell::{CommandOutput, ScriptedExecutor};

    #[tokio::test]
    async fn reboot_defers_the_command() {
        let executor = Arc::new(ScriptedExecutor::new());
        let registry = PluginRegistry::new()
            .with_executor(executor.clone())
            .with_actions(plugin());

        let run = registry.run_action("reboot_server", &Args::new()).await;
        assert!(run.result.success);
        assert!(executor.calls().is_empty());

        let callback = run.callback.unwrap();
        let after = tokio::task::spawn_blocking(callback).await.unwrap();
        assert_eq!(after, AfterResponse::Terminate { exit_code: 0 });
        assert_eq!(executor.calls(), vec![vec!["shutdown", "-r", "now"]]);
    }

    #[tokio::test]
    async fn failed_power_command_keeps_running() {
        let executor = Arc::new(ScriptedExecutor::new());
        executor.answer(
            "shutdown",
            CommandOutput {
                rc: 1,
                stdout: String::new(),
                stderr: "denied".into(),
            },
        );
        let registry = PluginRegistry::new()
            .with_executor(executor)
            .with_actions(plugin());

        let run = registry.run_action("shutdown_server", &Args::new()).await;
        let after = tokio::task::spawn_blocking(run.callback.unwrap()).await.unwrap();
        assert_eq!(after, AfterResponse::Continue);
    }
}
