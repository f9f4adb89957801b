//! Subprocess execution with per-invocation recording.
//!
//! Every action invocation gets its own [`CommandRecorder`]. Each command run
//! through it is captured as a [`SubprocessRecord`] and attached to the
//! action's result body so the manager can show exactly what ran.

use std::io;
use std::process::Stdio;
use std::sync::{Arc, Mutex};

use anyhow::bail;
use async_trait::async_trait;
use chroma_agent_core::SubprocessRecord;
use tokio::process::Command;
use tracing::debug;

/// Raw outcome of one process.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub rc: i32,
    pub stdout: String,
    pub stderr: String,
}

/// Seam between actions and the operating system.
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    async fn execute(&self, args: &[String]) -> io::Result<CommandOutput>;
}

/// Runs commands as child processes of the agent.
///
/// Children are spawned `kill_on_drop`, so dropping a cancelled invocation's
/// future kills whatever it was waiting on.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemExecutor;

#[async_trait]
impl CommandExecutor for SystemExecutor {
    async fn execute(&self, args: &[String]) -> io::Result<CommandOutput> {
        let (program, rest) = args
            .split_first()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "empty command line"))?;

        let output = Command::new(program)
            .args(rest)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await?;

        Ok(CommandOutput {
            // Killed by a signal: report the conventional shell value.
            rc: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

#[derive(Clone)]
pub struct CommandRecorder {
    executor: Arc<dyn CommandExecutor>,
    records: Arc<Mutex<Vec<SubprocessRecord>>>,
}

impl std::fmt::Debug for CommandRecorder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandRecorder")
            .field("records", &self.records())
            .finish()
    }
}

impl CommandRecorder {
    pub fn new(executor: Arc<dyn CommandExecutor>) -> Self {
        Self {
            executor,
            records: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Run a command and record it whatever its exit code.
    pub async fn run<S: AsRef<str>>(&self, args: &[S]) -> io::Result<SubprocessRecord> {
        let args: Vec<String> = args.iter().map(|a| a.as_ref().to_string()).collect();
        debug!(command = %args.join(" "), "running subprocess");
        let output = self.executor.execute(&args).await?;

        let record = SubprocessRecord {
            args,
            rc: output.rc,
            stdout: output.stdout,
            stderr: output.stderr,
        };
        self.records
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(record.clone());
        Ok(record)
    }

    /// Run a command and fail unless it exits 0. Returns stdout.
    pub async fn try_run<S: AsRef<str>>(&self, args: &[S]) -> anyhow::Result<String> {
        let record = self.run(args).await?;
        if record.rc != 0 {
            bail!(
                "`{}` exited {}: {}",
                record.args.join(" "),
                record.rc,
                record.stderr.trim()
            );
        }
        Ok(record.stdout)
    }

    /// Everything run so far, in order.
    pub fn records(&self) -> Vec<SubprocessRecord> {
        self.records
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }
}

/// Executor that records command lines and answers from a fixed script.
///
/// Commands without a scripted answer succeed with empty output.
#[derive(Debug, Default)]
pub struct ScriptedExecutor {
    calls: Mutex<Vec<Vec<String>>>,
    answers: Mutex<Vec<(String, CommandOutput)>>,
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer any command whose program is `program` with `output`.
    pub fn answer(&self, program: &str, output: CommandOutput) {
        self.answers
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push((program.to_string(), output));
    }

    pub fn calls(&self) -> Vec<Vec<String>> {
        self.calls.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }
}

#[async_trait]
impl CommandExecutor for ScriptedExecutor {
    async fn execute(&self, args: &[String]) -> io::Result<CommandOutput> {
        self.calls
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(args.to_vec());
        let answers = self.answers.lock().unwrap_or_else(|p| p.into_inner());
        let output = args
            .first()
            .and_then(|program| answers.iter().find(|(p, _)| p == program))
            .map(|(_, output)| output.clone())
            .unwrap_or_default();
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn records_every_command() {
        let executor = Arc::new(ScriptedExecutor::new());
        executor.answer(
            "false",
            CommandOutput {
                rc: 1,
                stdout: String::new(),
                stderr: "nope".into(),
            },
        );
        let recorder = CommandRecorder::new(executor.clone());

        recorder.run(&["true"]).await.unwrap();
        let err = recorder.try_run(&["false", "-x"]).await.unwrap_err();
        assert!(err.to_string().contains("exited 1"));

        let records = recorder.records();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].args, vec!["false", "-x"]);
        assert_eq!(records[1].stderr, "nope");
        assert_eq!(executor.calls().len(), 2);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn system_executor_captures_output() {
        let recorder = CommandRecorder::new(Arc::new(SystemExecutor));
        let stdout = recorder.try_run(&["echo", "hello"]).await.unwrap();
        assert_eq!(stdout.trim(), "hello");
        assert_eq!(recorder.records()[0].rc, 0);
    }

    #[tokio::test]
    async fn empty_command_is_an_error() {
        let recorder = CommandRecorder::new(Arc::new(SystemExecutor));
        let args: [&str; 0] = [];
        assert!(recorder.run(&args).await.is_err());
        assert!(recorder.records().is_empty());
    }
}
