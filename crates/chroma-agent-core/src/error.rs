//! Error kinds reported by the agent and protocol decoding errors.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Abstract error categories.
///
/// The serialized form is the tag that appears in the `error_kind` field of
/// action result bodies, so the names are part of the wire contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    TransportTransient,
    TransportAuth,
    TransportFatal,
    SessionStale,
    ActionUnknown,
    ActionBadArgs,
    ActionFailed,
    ActionCancelled,
    PluginCrash,
    ConfigMissing,
    CryptoCorrupt,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::TransportTransient => "TRANSPORT_TRANSIENT",
            ErrorKind::TransportAuth => "TRANSPORT_AUTH",
            ErrorKind::TransportFatal => "TRANSPORT_FATAL",
            ErrorKind::SessionStale => "SESSION_STALE",
            ErrorKind::ActionUnknown => "ACTION_UNKNOWN",
            ErrorKind::ActionBadArgs => "ACTION_BAD_ARGS",
            ErrorKind::ActionFailed => "ACTION_FAILED",
            ErrorKind::ActionCancelled => "ACTION_CANCELLED",
            ErrorKind::PluginCrash => "PLUGIN_CRASH",
            ErrorKind::ConfigMissing => "CONFIG_MISSING",
            ErrorKind::CryptoCorrupt => "CRYPTO_CORRUPT",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An inbound envelope could not be turned into a typed [`crate::Message`].
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("{kind} message is missing field `{field}`")]
    MissingField {
        kind: &'static str,
        field: &'static str,
    },

    #[error("{kind} message has a malformed body: {reason}")]
    BadBody { kind: &'static str, reason: String },
}
