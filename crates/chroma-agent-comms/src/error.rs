//! Error types for the transport and plugin sessions.

use chroma_agent_core::ErrorKind;
use chroma_agent_plugins::PluginError;
use thiserror::Error;

/// Result type alias for transport operations.
pub type TransportResult<T> = Result<T, TransportError>;

/// Failure talking to the manager, classified by how the agent recovers.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    /// Network failure, timeout or non-auth HTTP error. Retried with backoff.
    #[error("transient transport error: {0}")]
    Transient(String),

    /// The manager refused our credentials.
    #[error("manager rejected the agent's credentials: {0}")]
    Auth(String),

    /// Unrecoverable: bad server certificate, schema mismatch, repeated auth
    /// failure, missing identity.
    #[error("fatal transport error: {0}")]
    Fatal(String),
}

impl TransportError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            TransportError::Transient(_) => ErrorKind::TransportTransient,
            TransportError::Auth(_) => ErrorKind::TransportAuth,
            TransportError::Fatal(_) => ErrorKind::TransportFatal,
        }
    }
}

/// A session could not process a poll.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Plugin(#[from] PluginError),

    #[error("message of {bytes} bytes exceeds the {limit} byte post limit")]
    Oversized { bytes: usize, limit: usize },
}

impl SessionError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::PluginCrash
    }
}
