use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use crate::logging::LogFormat;

#[derive(Debug, Parser)]
#[command(
    name = "chroma-agent",
    about = "Storage-server agent for the Chroma Lustre manager",
    version,
    propagate_version = true
)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalArgs,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Args)]
pub struct GlobalArgs {
    /// Directory holding the agent identity and settings.
    #[arg(long, global = true, default_value = "/var/lib/chroma")]
    pub state_dir: PathBuf,

    /// TOML file overriding the stored agent settings.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,

    /// Do not load this plugin (repeatable).
    #[arg(long = "exclude-plugin", global = true, value_name = "NAME")]
    pub exclude_plugins: Vec<String>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the agent until signalled.
    Daemon,
    /// Register this server with a manager.
    Register {
        #[arg(long)]
        url: String,
        #[arg(long)]
        secret: String,
        /// Address the manager should use for this server (default: fqdn).
        #[arg(long)]
        address: Option<String>,
    },
    /// Report a new address to a (possibly moved) manager.
    Reregister {
        #[arg(long)]
        url: String,
        #[arg(long)]
        address: String,
    },
    /// Run one action locally and print its result.
    Invoke {
        #[arg(long)]
        action: String,
        /// `key=value`; values are parsed as JSON, falling back to strings.
        #[arg(long = "arg", value_name = "KEY=VALUE")]
        args: Vec<String>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn globals_apply_to_every_subcommand() {
        let cli = Cli::try_parse_from([
            "chroma-agent",
            "invoke",
            "--action",
            "set_conf_param",
            "--arg",
            "key=k",
            "--arg",
            "value=1",
            "--state-dir",
            "/tmp/agent",
            "--exclude-plugin",
            "host",
        ])
        .unwrap();

        assert_eq!(cli.global.state_dir, PathBuf::from("/tmp/agent"));
        assert_eq!(cli.global.exclude_plugins, vec!["host"]);
        assert_eq!(cli.global.log_format, LogFormat::Text);
        match cli.command {
            Command::Invoke { action, args } => {
                assert_eq!(action, "set_conf_param");
                assert_eq!(args, vec!["key=k", "value=1"]);
            }
            other => panic!("parsed {other:?}"),
        }
    }

    #[test]
    fn register_requires_url_and_secret() {
        assert!(Cli::try_parse_from(["chroma-agent", "register", "--url", "https://m/"]).is_err());
        let cli = Cli::try_parse_from([
            "chroma-agent",
            "--log-format",
            "json",
            "register",
            "--url",
            "https://m/",
            "--secret",
            "s",
        ])
        .unwrap();
        assert_eq!(cli.global.log_format, LogFormat::Json);
        assert!(matches!(cli.command, Command::Register { address: None, .. }));
        assert_eq!(cli.global.state_dir, PathBuf::from("/var/lib/chroma"));
    }
}
