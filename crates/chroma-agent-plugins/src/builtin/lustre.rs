//! `lustre` action plugin: configuration parameters and client mounts.

use async_trait::async_trait;
use serde_json::Value;

use crate::action::{Action, ActionContext, ActionOutcome, ActionPlugin, Args, Param};
use crate::registry::unit;

pub const NAME: &str = "lustre";

pub fn plugin() -> ActionPlugin {
    ActionPlugin::new(NAME)
        .capability("manage_targets")
        .action(SetConfParam)
        .action(MountLustreFilesystem)
        .action(UnmountLustreFilesystem)
}

fn string_arg(args: &Args, name: &str) -> anyhow::Result<String> {
    match args.get(name) {
        Some(Value::String(s)) => Ok(s.clone()),
        Some(other) => anyhow::bail!("argument `{name}` must be a string, got {other}"),
        None => anyhow::bail!("argument `{name}` is missing"),
    }
}

/// `lctl conf_param key=value`, or `lctl conf_param -d key` to delete.
pub struct SetConfParam;

#[async_trait]
impl Action for SetConfParam {
    fn name(&self) -> &'static str {
        "set_conf_param"
    }

    fn params(&self) -> &'static [Param] {
        const PARAMS: &[Param] = &[Param::required("key"), Param::optional("value")];
        PARAMS
    }

    async fn run(&self, ctx: &ActionContext, args: &Args) -> anyhow::Result<ActionOutcome> {
        let key = string_arg(args, "key")?;
        let command = match args.get("value") {
            None | Some(Value::Null) => {
                vec!["lctl".to_string(), "conf_param".into(), "-d".into(), key]
            }
            Some(Value::String(value)) => {
                vec!["lctl".to_string(), "conf_param".into(), format!("{key}={value}")]
            }
            Some(value) => {
                vec!["lctl".to_string(), "conf_param".into(), format!("{key}={value}")]
            }
        };
        ctx.recorder.try_run(&command).await?;
        Ok(unit())
    }
}

pub struct MountLustreFilesystem;

#[async_trait]
impl Action for MountLustreFilesystem {
    fn name(&self) -> &'static str {
        "mount_lustre_filesystem"
    }

    fn params(&self) -> &'static [Param] {
        const PARAMS: &[Param] = &[Param::required("mountspec"), Param::required("mountpoint")];
        PARAMS
    }

    async fn run(&self, ctx: &ActionContext, args: &Args) -> anyhow::Result<ActionOutcome> {
        let mountspec = string_arg(args, "mountspec")?;
        let mountpoint = string_arg(args, "mountpoint")?;
        ctx.recorder.try_run(&["mkdir", "-p", mountpoint.as_str()]).await?;
        ctx.recorder
            .try_run(&["mount", "-t", "lustre", mountspec.as_str(), mountpoint.as_str()])
            .await?;
        Ok(unit())
    }
}

pub struct UnmountLustreFilesystem;

#[async_trait]
impl Action for UnmountLustreFilesystem {
    fn name(&self) -> &'static str {
        "unmount_lustre_filesystem"
    }

    fn params(&self) -> &'static [Param] {
        const PARAMS: &[Param] = &[Param::optional("mountspec"), Param::required("mountpoint")];
        PARAMS
    }

    async fn run(&self, ctx: &ActionContext, args: &Args) -> anyhow::Result<ActionOutcome> {
        let mountpoint = string_arg(args, "mountpoint")?;
        ctx.recorder.try_run(&["umount", mountpoint.as_str()]).await?;
        Ok(unit())
    }
}
