//! Reader loop: routes inbound manager messages and owns every change to
//! the session table.
//!
//! Work that could block (plugin callbacks, actions) is handed off to other
//! tasks so the reader keeps draining its intake.

use std::sync::Arc;

use chroma_agent_core::{Envelope, ErrorKind, Message, Priority, SessionId};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::runner::Invocation;
use crate::table::CreateOutcome;
use crate::transport::{Shared, TransportState};

/// Work for the reader.
#[derive(Debug)]
pub(crate) enum Intake {
    /// Messages from the manager's reply.
    Inbound(Vec<Envelope>),
    /// A session must be closed from the agent side.
    CloseSession {
        plugin: String,
        id: SessionId,
        reason: String,
    },
    /// The manager no longer knows our sessions.
    Resync,
}

pub(crate) async fn run(shared: Arc<Shared>, mut intake: mpsc::UnboundedReceiver<Intake>) {
    let reader = Reader { shared };
    loop {
        let item = tokio::select! {
            biased;
            _ = reader.shared.stop.cancelled() => break,
            item = intake.recv() => item,
        };
        match item {
            Some(Intake::Inbound(envelopes)) => {
                for envelope in envelopes {
                    reader.dispatch(envelope).await;
                }
            }
            Some(Intake::CloseSession { plugin, id, reason }) => {
                reader.close_local(&plugin, &id, &reason).await;
            }
            Some(Intake::Resync) => reader.resync("manager rejected the agent").await,
            None => break,
        }
    }
    debug!("reader stopped");
}

struct Reader {
    shared: Arc<Shared>,
}

impl Reader {
    async fn dispatch(&self, envelope: Envelope) {
        let kind = envelope.kind;
        let message = match Message::try_from(envelope) {
            Ok(message) => message,
            Err(e) => {
                warn!(kind = kind.as_str(), error = %e, "malformed message from manager dropped");
                return;
            }
        };

        match message {
            Message::SessionCreateResponse { plugin, session_id } => {
                self.session_created(&plugin, session_id).await;
            }
            Message::SessionTerminate { plugin, session_id } => {
                self.session_terminated(&plugin, session_id.as_ref()).await;
            }
            Message::SessionTerminateAll => self.resync("manager terminated all sessions").await,
            Message::ActionInvoke {
                plugin,
                session_id,
                invoke,
                ..
            } => {
                let Some(session) = self.shared.table.live(&plugin, &session_id).await else {
                    warn!(
                        kind = %ErrorKind::SessionStale,
                        %plugin,
                        %session_id,
                        id = %invoke.id,
                        action = %invoke.action,
                        "invocation for unknown session dropped"
                    );
                    self.stale(&plugin, &session_id).await;
                    return;
                };
                self.shared.runner.invoke(Invocation {
                    id: invoke.id,
                    action: invoke.action,
                    args: match invoke.rejected {
                        Some(reason) => Err(reason),
                        None => Ok(invoke.args),
                    },
                    session,
                });
            }
            Message::ActionCancel { id, .. } => {
                self.shared.runner.cancel(&id);
            }
            Message::Data {
                plugin,
                session_id,
                body,
                ..
            } => {
                let Some(session) = self.shared.table.live(&plugin, &session_id).await else {
                    warn!(kind = %ErrorKind::SessionStale, %plugin, %session_id, "data for unknown session dropped");
                    self.stale(&plugin, &session_id).await;
                    return;
                };
                tokio::spawn(async move {
                    if let Err(e) = session.deliver(body).await {
                        warn!(plugin = session.plugin(), error = %e, "plugin rejected manager data");
                    }
                });
            }
            Message::SessionCreateRequest { plugin, .. } => {
                debug!(%plugin, "ignoring agent-bound session request from manager");
            }
        }
    }

    async fn session_created(&self, plugin: &str, session_id: SessionId) {
        let Some(CreateOutcome { session, replaced }) =
            self.shared.table.create(plugin, session_id).await
        else {
            return;
        };
        if let Some(old) = replaced {
            info!(%plugin, old = %old.id(), new = %session.id(), "manager replaced session");
            self.shared.runner.cancel_session(plugin);
            old.close("replaced by manager");
        }
        // Requests still queued for this plugin are answered.
        self.shared.outbound.discard_plugin(plugin);

        if self.shared.state() == TransportState::Resync && self.shared.table.all_established().await {
            info!("all sessions re-established");
            self.shared
                .transition(TransportState::Resync, TransportState::Running);
        }
    }

    async fn session_terminated(&self, plugin: &str, session_id: Option<&SessionId>) {
        match self.shared.table.remove(plugin, session_id).await {
            Some(session) => {
                self.shared.runner.cancel_session(plugin);
                session.close("terminated by manager");
                self.shared.table.poke(plugin);
            }
            None => debug!(%plugin, "terminate for unknown session ignored"),
        }
    }

    /// A message named a session we do not have. Ids we closed ourselves
    /// are in-flight leftovers; anything else means the manager's view of
    /// our sessions has diverged.
    async fn stale(&self, plugin: &str, session_id: &SessionId) {
        if self.shared.table.was_retired(plugin, session_id)
            || self.shared.state() == TransportState::Resync
        {
            return;
        }
        self.resync("manager referenced an unknown session").await;
    }

    /// Close every session and request them all again.
    async fn resync(&self, reason: &str) {
        info!(%reason, "resynchronizing sessions");
        self.shared.set_state(TransportState::Resync);
        self.shared.runner.cancel_all();
        for session in self.shared.table.remove_all().await {
            session.close(reason);
        }
        self.shared.outbound.clear();
        self.shared.table.clear_requests();
        self.shared.table.poke_all();

        // Nothing to wait for without device plugins.
        if self.shared.table.all_established().await {
            self.shared
                .transition(TransportState::Resync, TransportState::Running);
        }
    }

    /// Close a session from the agent side and tell the manager.
    async fn close_local(&self, plugin: &str, id: &SessionId, reason: &str) {
        let Some(session) = self.shared.table.remove(plugin, Some(id)).await else {
            return;
        };
        self.shared.runner.cancel_session(plugin);
        session.close(reason);
        self.shared.outbound.push(
            Message::SessionTerminate {
                plugin: plugin.to_string(),
                session_id: Some(id.clone()),
            },
            Priority::High,
        );
        self.shared.table.defer_request(plugin);
        self.shared.table.poke(plugin);
    }
}
