//! `invoke`: run one action in the foreground, outside the daemon.

use chroma_agent_plugins::{AfterResponse, Args, PluginRegistry};
use serde_json::Value;
use tracing::info;

/// Parse `key=value` pairs. Values are JSON when they parse as JSON and
/// plain strings otherwise.
pub fn parse_args(pairs: &[String]) -> anyhow::Result<Args> {
    let mut args = Args::new();
    for pair in pairs {
        let Some((key, raw)) = pair.split_once('=') else {
            anyhow::bail!("argument `{pair}` is not of the form key=value");
        };
        if key.is_empty() {
            anyhow::bail!("argument `{pair}` has an empty key");
        }
        let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
        args.insert(key.to_string(), value);
    }
    Ok(args)
}

/// Run `action`, print its result body on stdout and return the exit status.
pub async fn invoke(registry: &PluginRegistry, action: &str, pairs: &[String]) -> anyhow::Result<i32> {
    let args = parse_args(pairs)?;
    let run = registry.run_action(action, &args).await;
    println!("{}", serde_json::to_string_pretty(&run.result.to_value())?);

    if !run.result.success {
        return Ok(1);
    }
    let Some(callback) = run.callback else {
        return Ok(0);
    };
    match tokio::task::spawn_blocking(callback).await? {
        AfterResponse::Continue => Ok(0),
        AfterResponse::Terminate { exit_code } => {
            info!(%action, exit_code, "action requested exit");
            Ok(exit_code)
        }
    }
}
