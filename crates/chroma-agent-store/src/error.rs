//! Error types for the persisted agent state.

use std::path::PathBuf;

use chroma_agent_core::ErrorKind;
use thiserror::Error;

/// Result type alias for config store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Result type alias for crypto store operations.
pub type CryptoResult<T> = Result<T, CryptoError>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("i/o error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid section name `{0}`")]
    InvalidIdentifier(String),

    #[error("key `{key}` not found in section `{section}`")]
    NotFound { section: String, key: String },

    #[error("key `{key}` already exists in section `{section}`")]
    KeyExists { section: String, key: String },

    #[error("serialization error: {0}")]
    Serialize(String),

    #[error("malformed value in {path}: {reason}")]
    Deserialize { path: PathBuf, reason: String },

    #[error("manager URL is not configured")]
    ConfigMissing,
}

impl StoreError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        StoreError::Io {
            path: path.into(),
            source,
        }
    }

    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            StoreError::ConfigMissing => Some(ErrorKind::ConfigMissing),
            _ => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("identity file {path} is unreadable: {reason}")]
    Corrupt { path: PathBuf, reason: String },

    #[error("i/o error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("key generation failed: {0}")]
    KeyGeneration(#[from] openssl::error::ErrorStack),

    #[error("certificate request failed: {0}")]
    Csr(#[from] rcgen::Error),

    #[error("invalid PEM supplied: {0}")]
    InvalidPem(String),
}

impl CryptoError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        CryptoError::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn corrupt(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        CryptoError::Corrupt {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        ErrorKind::CryptoCorrupt
    }
}
