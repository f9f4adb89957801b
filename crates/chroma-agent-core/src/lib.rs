//! chroma-agent-core: types shared by every part of the storage-server agent.
//!
//! The agent talks to the manager with batches of JSON envelopes. This crate
//! owns the wire shape of those envelopes ([`Envelope`], [`Batch`]), the typed
//! view the agent works with internally ([`Message`]), the action result
//! bodies, and the tunables ([`AgentConfig`]) the other crates read.

pub mod config;
pub mod error;
pub mod message;
pub mod properties;
pub mod result;

pub use config::AgentConfig;
pub use error::{ErrorKind, ProtocolError};
pub use message::*;
pub use properties::ServerProperties;
pub use result::{ActionResult, SubprocessRecord};
