//! chroma-agent-comms: the agent's conversation with the manager.
//!
//! Device plugins run inside [`Session`]s that buffer their output; the
//! [`ActionRunner`] executes invocations and reports back through the same
//! sessions. The [`Transport`] wires them to a [`ManagerLink`] with a writer
//! loop (batching, retry, backoff), a reader loop (routing, resync) and one
//! poller per device plugin.

pub mod backoff;
pub mod error;
pub mod https;
pub mod link;
pub mod outbound;
mod poller;
mod reader;
pub mod registration;
pub mod runner;
pub mod session;
pub mod table;
pub mod tls;
pub mod transport;
mod writer;

pub use backoff::Backoff;
pub use error::{SessionError, TransportError, TransportResult};
pub use https::{HttpsLink, ManagerUrl};
pub use link::ManagerLink;
pub use registration::{Registration, RegistrationResponse, register, reregister};
pub use runner::{ActionRunner, Invocation};
pub use session::{Admission, Session, SessionLimits};
pub use table::SessionTable;
pub use transport::{RunningTransport, Transport, TransportState};
