use chroma_agent_core::ErrorKind;
use chroma_agent_store::StoreError;
use thiserror::Error;

/// Exit status for a missing or incomplete configuration.
pub const EXIT_CONFIG_MISSING: i32 = 2;
/// Exit status for every other failure.
pub const EXIT_FAILURE: i32 = 1;

#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("agent is not configured: no manager URL in {0}")]
    ConfigMissing(String),

    #[error("agent has no certificate and no registration secret; run `chroma-agent register` first")]
    NotRegistered,

    #[error("agent is already registered with {0}")]
    AlreadyRegistered(String),
}

impl DaemonError {
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            DaemonError::ConfigMissing(_) | DaemonError::NotRegistered => {
                Some(ErrorKind::ConfigMissing)
            }
            DaemonError::AlreadyRegistered(_) => None,
        }
    }
}

/// Process exit status for a top-level failure.
pub fn exit_code(err: &anyhow::Error) -> i32 {
    let config_missing = err.chain().any(|cause| {
        cause
            .downcast_ref::<DaemonError>()
            .and_then(DaemonError::kind)
            .or_else(|| cause.downcast_ref::<StoreError>().and_then(StoreError::kind))
            == Some(ErrorKind::ConfigMissing)
    });
    if config_missing {
        EXIT_CONFIG_MISSING
    } else {
        EXIT_FAILURE
    }
}
