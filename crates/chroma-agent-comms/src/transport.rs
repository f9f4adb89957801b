//! Message transport: state machine and task wiring.
//!
//! ```text
//!  IDLE ──start──▶ HANDSHAKING ──identity──▶ RUNNING
//!  RUNNING ──transient error──▶ BACKOFF ──timer──▶ RUNNING
//!  RUNNING ──manager resync──▶ RESYNC ──all sessions back──▶ RUNNING
//!  any ──stop / fatal──▶ STOPPED
//! ```
//!
//! One writer task owns the link, one reader task owns the session table, and
//! one poller task runs per device plugin. They share [`Shared`] and meet at
//! the intake channel (writer/pollers → reader) and the wake notifier
//! (sessions/outbound → writer).

use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use chroma_agent_core::properties::format_timestamp;
use chroma_agent_core::{AgentConfig, ServerProperties};
use chroma_agent_plugins::PluginRegistry;
use tokio::sync::{Notify, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::error::{TransportError, TransportResult};
use crate::link::ManagerLink;
use crate::outbound::OutboundQueue;
use crate::reader::{self, Intake};
use crate::runner::ActionRunner;
use crate::table::SessionTable;
use crate::{poller, writer};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    Idle,
    Handshaking,
    Running,
    Backoff,
    Resync,
    Stopped,
}

impl fmt::Display for TransportState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TransportState::Idle => "idle",
            TransportState::Handshaking => "handshaking",
            TransportState::Running => "running",
            TransportState::Backoff => "backoff",
            TransportState::Resync => "resync",
            TransportState::Stopped => "stopped",
        })
    }
}

// ── Shared state ─────────────────────────────────────────────────────

pub(crate) struct Shared {
    pub config: AgentConfig,
    pub props: ServerProperties,
    pub client_start_time: String,
    pub link: Arc<dyn ManagerLink>,
    pub table: SessionTable,
    pub outbound: OutboundQueue,
    pub runner: Arc<ActionRunner>,
    pub stop: CancellationToken,
    /// Writer wake-up: something was queued.
    pub wake: Arc<Notify>,
    state: watch::Sender<TransportState>,
    fatal: Mutex<Option<TransportError>>,
}

impl Shared {
    pub fn state(&self) -> TransportState {
        *self.state.borrow()
    }

    /// Move to `next` unless the transport already stopped.
    pub fn set_state(&self, next: TransportState) {
        self.state.send_if_modified(|current| {
            if *current == next || *current == TransportState::Stopped {
                return false;
            }
            debug!(from = %current, to = %next, "transport state change");
            *current = next;
            true
        });
    }

    /// Move to `to` only if currently in `from`.
    pub fn transition(&self, from: TransportState, to: TransportState) -> bool {
        self.state.send_if_modified(|current| {
            if *current != from {
                return false;
            }
            debug!(from = %current, to = %to, "transport state change");
            *current = to;
            true
        })
    }

    /// Record a fatal error and bring everything down.
    pub fn fail(&self, err: TransportError) {
        error!(kind = %err.kind(), error = %err, "transport stopped on fatal error");
        self.fatal
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get_or_insert(err);
        self.set_state(TransportState::Stopped);
        self.stop.cancel();
    }

    fn fatal_error(&self) -> Option<TransportError> {
        self.fatal.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }
}

// ── Transport ────────────────────────────────────────────────────────

/// A transport that has not been started yet.
pub struct Transport {
    shared: Arc<Shared>,
    registry: Arc<PluginRegistry>,
}

impl fmt::Debug for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transport")
            .field("state", &self.shared.state())
            .field("devices", &self.registry.device_names())
            .finish()
    }
}

impl Transport {
    pub fn new(
        link: Arc<dyn ManagerLink>,
        registry: Arc<PluginRegistry>,
        config: AgentConfig,
        props: ServerProperties,
    ) -> Self {
        let wake = Arc::new(Notify::new());
        let (state, _) = watch::channel(TransportState::Idle);
        let shared = Shared {
            client_start_time: format_timestamp(&Utc::now()),
            link,
            table: SessionTable::new(Arc::clone(&registry), config.clone(), Arc::clone(&wake)),
            outbound: OutboundQueue::new(Arc::clone(&wake)),
            runner: Arc::new(ActionRunner::new(Arc::clone(&registry), config.action_workers)),
            stop: CancellationToken::new(),
            wake,
            state,
            fatal: Mutex::new(None),
            config,
            props,
        };
        Self {
            shared: Arc::new(shared),
            registry,
        }
    }

    pub fn state(&self) -> TransportState {
        self.shared.state()
    }

    pub fn subscribe(&self) -> watch::Receiver<TransportState> {
        self.shared.state.subscribe()
    }

    /// Establish the agent's identity, then start the writer, reader and
    /// pollers.
    pub async fn start(self) -> TransportResult<RunningTransport> {
        let shared = self.shared;
        shared.set_state(TransportState::Handshaking);
        if let Err(e) = shared.link.ensure_identity().await {
            shared.fail(e.clone());
            return Err(e);
        }
        shared.set_state(TransportState::Running);

        let (intake_tx, intake_rx) = mpsc::unbounded_channel::<Intake>();
        let tasks = TaskTracker::new();

        let writer = {
            let shared = Arc::clone(&shared);
            let intake = intake_tx.clone();
            tokio::spawn(async move {
                let result = writer::Writer::new(Arc::clone(&shared), intake).run().await;
                if let Err(e) = &result {
                    shared.fail(e.clone());
                }
                result
            })
        };

        tasks.spawn(reader::run(Arc::clone(&shared), intake_rx));
        for plugin in self.registry.device_names() {
            tasks.spawn(poller::run(Arc::clone(&shared), plugin, intake_tx.clone()));
        }
        tasks.close();

        info!(
            devices = ?self.registry.device_names(),
            workers = shared.config.action_workers,
            "transport running"
        );
        Ok(RunningTransport {
            shared,
            writer,
            tasks,
        })
    }
}

/// Handle to a started transport.
pub struct RunningTransport {
    shared: Arc<Shared>,
    writer: JoinHandle<TransportResult<()>>,
    tasks: TaskTracker,
}

impl fmt::Debug for RunningTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunningTransport")
            .field("state", &self.shared.state())
            .field("tasks", &self.tasks.len())
            .finish()
    }
}

impl RunningTransport {
    pub fn state(&self) -> TransportState {
        self.shared.state()
    }

    pub fn subscribe(&self) -> watch::Receiver<TransportState> {
        self.shared.state.subscribe()
    }

    /// Exit codes requested by post-response callbacks.
    pub fn exit_requests(&self) -> watch::Receiver<Option<i32>> {
        self.shared.runner.exit_requests()
    }

    /// Resolves once the transport stops on its own (fatal error) or
    /// [`RunningTransport::stop`] has begun.
    pub async fn stopped(&self) {
        self.shared.stop.cancelled().await;
    }

    pub fn fatal_error(&self) -> Option<TransportError> {
        self.shared.fatal_error()
    }

    /// Stop all loops, cancel in-flight actions and tear the sessions down.
    ///
    /// No POST is started after this is called; one already in flight is
    /// allowed to finish within its request timeout. Exceeding `grace` is
    /// itself a fatal error.
    pub async fn stop(self, grace: Duration) -> TransportResult<()> {
        let RunningTransport {
            shared,
            writer,
            tasks,
        } = self;
        info!(?grace, "stopping transport");
        shared.stop.cancel();

        let drained = tokio::time::timeout(grace, async {
            let result = match writer.await {
                Ok(result) => result,
                Err(e) => Err(TransportError::Fatal(format!("writer task failed: {e}"))),
            };
            tasks.wait().await;

            let sessions = shared.table.remove_all().await;
            for session in &sessions {
                session.mark_closed("agent stopping");
            }
            shared.runner.shutdown().await;
            for session in &sessions {
                session.teardown().await;
            }
            result
        })
        .await;

        let result = match drained {
            Ok(result) => result,
            Err(_) => {
                warn!(?grace, "transport tasks did not exit in time");
                Err(TransportError::Fatal(format!(
                    "transport did not stop within {grace:?}"
                )))
            }
        };
        shared.set_state(TransportState::Stopped);
        info!("transport stopped");

        match (result, shared.fatal_error()) {
            (Err(e), _) | (Ok(()), Some(e)) => Err(e),
            (Ok(()), None) => Ok(()),
        }
    }
}
