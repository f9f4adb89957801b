//! Wire envelope and typed messages exchanged with the manager.
//!
//! Both directions use the same `POST {manager}/message/` exchange: the agent
//! posts a [`Batch`] and the manager answers with a [`Batch`]. Each entry is a
//! flat [`Envelope`]; the agent converts inbound envelopes into [`Message`]
//! values and outbound messages back into envelopes with
//! [`Message::into_envelope`].

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::ProtocolError;

/// Envelope `type` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageType {
    SessionCreateRequest,
    SessionCreateResponse,
    SessionTerminate,
    SessionTerminateAll,
    Data,
    ActionInvoke,
    ActionCancel,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::SessionCreateRequest => "SESSION_CREATE_REQUEST",
            MessageType::SessionCreateResponse => "SESSION_CREATE_RESPONSE",
            MessageType::SessionTerminate => "SESSION_TERMINATE",
            MessageType::SessionTerminateAll => "SESSION_TERMINATE_ALL",
            MessageType::Data => "DATA",
            MessageType::ActionInvoke => "ACTION_INVOKE",
            MessageType::ActionCancel => "ACTION_CANCEL",
        }
    }
}

/// Admission priority of a buffered message.
///
/// Only affects which messages a full session buffer evicts and the order in
/// which buffers are drained; it never reorders a session's sequence numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
}

impl Priority {
    /// Highest first, the order buffers are drained in.
    pub const DRAIN_ORDER: [Priority; 3] = [Priority::High, Priority::Normal, Priority::Low];
}

/// Opaque identifier of one plugin session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    /// Number of random bytes in a locally generated id.
    pub const RANDOM_BYTES: usize = 16;

    /// Generate a fresh collision-resistant id (16 random bytes, hex encoded).
    pub fn generate() -> Self {
        let mut bytes = [0u8; Self::RANDOM_BYTES];
        if getrandom::getrandom(&mut bytes).is_err() {
            // Clock fallback, only unique within one agent process.
            let nanos = std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_nanos();
            bytes = nanos.to_le_bytes();
        }
        Self(hex::encode(bytes))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for SessionId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for SessionId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One message as it appears on the wire.
///
/// Every key is always present (null when not applicable); the manager reads
/// them positionally.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: MessageType,
    #[serde(default)]
    pub plugin: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub session_seq: Option<u64>,
    #[serde(default)]
    pub fqdn: Option<String>,
    #[serde(default)]
    pub body: Value,
}

/// Request and response body of the message endpoint.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Batch {
    pub messages: Vec<Envelope>,
    /// RFC 3339 boot time of the server, lets the manager detect reboots.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_boot_time: Option<String>,
    /// RFC 3339 start time of this agent process.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_start_time: Option<String>,
}

impl Batch {
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

/// Body of an `ACTION_INVOKE` message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionInvoke {
    pub id: String,
    pub action: String,
    #[serde(default)]
    pub args: Map<String, Value>,
    /// Set when the body named an invocation but its action or arguments
    /// were unusable; the invocation must fail with bad arguments.
    #[serde(skip)]
    pub rejected: Option<String>,
}

impl ActionInvoke {
    /// Read an invoke body. Only a missing `id` makes it unreadable; any
    /// other defect is kept in `rejected` so a result can still be sent.
    pub fn from_body(mut body: Value) -> Result<Self, String> {
        let id = match body.get("id") {
            Some(Value::String(id)) if !id.is_empty() => id.clone(),
            Some(Value::Number(n)) => n.to_string(),
            _ => return Err("body has no usable `id`".into()),
        };
        let action = body.get("action").and_then(Value::as_str).map(str::to_string);
        let args = body.get_mut("args").map(Value::take);

        let mut rejected = None;
        let args = match args {
            None => Map::new(),
            Some(Value::Object(args)) => args,
            Some(other) => {
                rejected = Some(format!("`args` must be an object, got {}", json_type(&other)));
                Map::new()
            }
        };
        if action.is_none() {
            rejected = Some("invocation names no action".into());
        }

        Ok(Self {
            id,
            action: action.unwrap_or_default(),
            args,
            rejected,
        })
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "a list",
        Value::Object(_) => "an object",
    }
}

/// Typed view of an [`Envelope`].
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// Agent asks the manager to accept a session for `plugin`.
    SessionCreateRequest {
        plugin: String,
        proposed_id: SessionId,
    },
    /// Manager accepted a session; `session_id` is authoritative.
    SessionCreateResponse {
        plugin: String,
        session_id: SessionId,
    },
    SessionTerminate {
        plugin: String,
        session_id: Option<SessionId>,
    },
    SessionTerminateAll,
    Data {
        plugin: String,
        session_id: SessionId,
        seq: u64,
        body: Value,
    },
    ActionInvoke {
        plugin: String,
        session_id: SessionId,
        seq: Option<u64>,
        invoke: ActionInvoke,
    },
    ActionCancel {
        plugin: String,
        session_id: SessionId,
        id: String,
    },
}

impl Message {
    pub fn kind(&self) -> MessageType {
        match self {
            Message::SessionCreateRequest { .. } => MessageType::SessionCreateRequest,
            Message::SessionCreateResponse { .. } => MessageType::SessionCreateResponse,
            Message::SessionTerminate { .. } => MessageType::SessionTerminate,
            Message::SessionTerminateAll => MessageType::SessionTerminateAll,
            Message::Data { .. } => MessageType::Data,
            Message::ActionInvoke { .. } => MessageType::ActionInvoke,
            Message::ActionCancel { .. } => MessageType::ActionCancel,
        }
    }

    /// Plugin the message belongs to (`None` only for `SESSION_TERMINATE_ALL`).
    pub fn plugin(&self) -> Option<&str> {
        match self {
            Message::SessionCreateRequest { plugin, .. }
            | Message::SessionCreateResponse { plugin, .. }
            | Message::SessionTerminate { plugin, .. }
            | Message::Data { plugin, .. }
            | Message::ActionInvoke { plugin, .. }
            | Message::ActionCancel { plugin, .. } => Some(plugin),
            Message::SessionTerminateAll => None,
        }
    }

    /// Convert to the wire shape, stamping the sender's fqdn.
    pub fn into_envelope(self, fqdn: &str) -> Envelope {
        let kind = self.kind();
        let (plugin, session_id, session_seq, body) = match self {
            Message::SessionCreateRequest {
                plugin,
                proposed_id,
            } => (
                Some(plugin),
                None,
                None,
                serde_json::json!({ "session_id": proposed_id }),
            ),
            Message::SessionCreateResponse { plugin, session_id } => {
                (Some(plugin), Some(session_id), None, Value::Null)
            }
            Message::SessionTerminate { plugin, session_id } => {
                (Some(plugin), session_id, None, Value::Null)
            }
            Message::SessionTerminateAll => (None, None, None, Value::Null),
            Message::Data {
                plugin,
                session_id,
                seq,
                body,
            } => (Some(plugin), Some(session_id), Some(seq), body),
            Message::ActionInvoke {
                plugin,
                session_id,
                seq,
                invoke,
            } => (
                Some(plugin),
                Some(session_id),
                seq,
                serde_json::to_value(invoke).unwrap_or(Value::Null),
            ),
            Message::ActionCancel {
                plugin,
                session_id,
                id,
            } => (
                Some(plugin),
                Some(session_id),
                None,
                serde_json::json!({ "id": id }),
            ),
        };

        Envelope {
            kind,
            plugin,
            session_id: session_id.map(|id| id.0),
            session_seq,
            fqdn: Some(fqdn.to_string()),
            body,
        }
    }
}

fn require<T>(value: Option<T>, kind: MessageType, field: &'static str) -> Result<T, ProtocolError> {
    value.ok_or(ProtocolError::MissingField {
        kind: kind.as_str(),
        field,
    })
}

impl TryFrom<Envelope> for Message {
    type Error = ProtocolError;

    fn try_from(env: Envelope) -> Result<Self, Self::Error> {
        let kind = env.kind;
        let message = match kind {
            MessageType::SessionTerminateAll => Message::SessionTerminateAll,
            MessageType::SessionCreateRequest => {
                let proposed_id = env
                    .body
                    .get("session_id")
                    .and_then(Value::as_str)
                    .map(SessionId::from)
                    .unwrap_or_else(SessionId::generate);
                Message::SessionCreateRequest {
                    plugin: require(env.plugin, kind, "plugin")?,
                    proposed_id,
                }
            }
            MessageType::SessionCreateResponse => Message::SessionCreateResponse {
                plugin: require(env.plugin, kind, "plugin")?,
                session_id: require(env.session_id, kind, "session_id")?.into(),
            },
            MessageType::SessionTerminate => Message::SessionTerminate {
                plugin: require(env.plugin, kind, "plugin")?,
                session_id: env.session_id.map(SessionId::from),
            },
            MessageType::Data => Message::Data {
                plugin: require(env.plugin, kind, "plugin")?,
                session_id: require(env.session_id, kind, "session_id")?.into(),
                seq: env.session_seq.unwrap_or_default(),
                body: env.body,
            },
            MessageType::ActionInvoke => {
                let invoke =
                    ActionInvoke::from_body(env.body).map_err(|reason| ProtocolError::BadBody {
                        kind: kind.as_str(),
                        reason,
                    })?;
                Message::ActionInvoke {
                    plugin: require(env.plugin, kind, "plugin")?,
                    session_id: require(env.session_id, kind, "session_id")?.into(),
                    seq: env.session_seq,
                    invoke,
                }
            }
            MessageType::ActionCancel => {
                let id = env
                    .body
                    .get("id")
                    .and_then(Value::as_str)
                    .map(str::to_string);
                Message::ActionCancel {
                    plugin: require(env.plugin, kind, "plugin")?,
                    session_id: require(env.session_id, kind, "session_id")?.into(),
                    id: require(id, kind, "body.id")?,
                }
            }
        };
        Ok(message)
    }
}
