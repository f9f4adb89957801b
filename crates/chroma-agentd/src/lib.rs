//! chroma-agentd: the storage-server agent process.
//!
//! Wires persisted state, plugins and the manager transport together
//! ([`supervisor`]), handles process signals, and implements the one-shot
//! `register`, `reregister` and `invoke` commands.

pub mod cli;
pub mod error;
pub mod invoke;
pub mod logging;
pub mod properties;
pub mod register;
pub mod signals;
pub mod supervisor;

use std::sync::Arc;

use chroma_agent_plugins::builtin;
use tokio_util::sync::CancellationToken;

use crate::cli::{Cli, Command};
use crate::supervisor::Supervisor;

pub use error::{DaemonError, exit_code};

/// Run one CLI command to completion. Returns the process exit status.
pub async fn run(cli: Cli) -> anyhow::Result<i32> {
    let log = Arc::new(logging::init(cli.global.log_format)?);
    let global = cli.global;

    match cli.command {
        Command::Daemon => {
            let props = properties::detect().await?;
            let supervisor = Supervisor::load(
                &global.state_dir,
                global.config.as_deref(),
                &global.exclude_plugins,
                props,
            )?;
            let stop = CancellationToken::new();
            let signals = signals::spawn(stop.clone(), log)?;
            let code = supervisor.run(stop.clone()).await;
            stop.cancel();
            let _ = signals.await;
            code
        }
        Command::Register {
            url,
            secret,
            address,
        } => {
            let props = properties::detect().await?;
            let mut registry = builtin::registry();
            registry.exclude(&global.exclude_plugins);
            register::register(&global.state_dir, &url, &secret, address, props, &registry)
                .await?;
            Ok(0)
        }
        Command::Reregister { url, address } => {
            let props = properties::detect().await?;
            register::reregister(&global.state_dir, &url, &address, &props).await?;
            Ok(0)
        }
        Command::Invoke { action, args } => {
            let mut registry = builtin::registry();
            registry.exclude(&global.exclude_plugins);
            invoke::invoke(&registry, &action, &args).await
        }
    }
}
