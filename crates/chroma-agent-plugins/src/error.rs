//! Error types for device plugins and actions.

use std::time::Duration;

use chroma_agent_core::ErrorKind;
use thiserror::Error;

/// Result type alias for device plugin operations.
pub type PluginResult<T> = Result<T, PluginError>;

/// A device plugin failed to produce data.
#[derive(Debug, Error)]
pub enum PluginError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("could not parse {what}: {reason}")]
    Parse { what: &'static str, reason: String },

    #[error("{0}")]
    Failed(String),
}

impl PluginError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::PluginCrash
    }
}

/// Why an action invocation did not produce a value.
#[derive(Debug, Error)]
pub enum ActionError {
    #[error("unknown action `{0}`")]
    Unknown(String),

    #[error("{0}")]
    BadArgs(String),

    #[error("action `{0}` can only run inside the agent daemon")]
    DaemonOnly(String),

    #[error("action timed out after {0:?}")]
    TimedOut(Duration),

    #[error("action cancelled")]
    Cancelled,

    #[error(transparent)]
    Failed(#[from] anyhow::Error),
}

impl ActionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ActionError::Unknown(_) => ErrorKind::ActionUnknown,
            ActionError::BadArgs(_) | ActionError::DaemonOnly(_) => ErrorKind::ActionBadArgs,
            ActionError::TimedOut(_) | ActionError::Failed(_) => ErrorKind::ActionFailed,
            ActionError::Cancelled => ErrorKind::ActionCancelled,
        }
    }

    /// Rendering of the error chain reported alongside failed results.
    pub fn backtrace(&self) -> Option<String> {
        match self {
            ActionError::Failed(e) => Some(format!("{e:#?}")),
            _ => None,
        }
    }
}
