//! Writer loop: builds batches, POSTs them, and feeds replies to the reader.
//!
//! A batch that failed transiently is retried as-is until the manager
//! accepts it, so sequence numbers reach the manager contiguous and in order.

use std::collections::VecDeque;
use std::sync::Arc;

use chroma_agent_core::{Batch, Envelope, Message, Priority, SessionId};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::backoff::Backoff;
use crate::error::{TransportError, TransportResult};
use crate::reader::Intake;
use crate::session::Session;
use crate::transport::{Shared, TransportState};

/// Room reserved for the batch wrapper and its timestamps.
pub const BATCH_OVERHEAD: usize = 128;

/// Messages drained from one session at a time.
const DRAIN_CHUNK: usize = 32;

/// An envelope waiting for a batch.
struct Staged {
    envelope: Envelope,
    bytes: usize,
    on_sent: Option<oneshot::Sender<()>>,
    session: Option<Arc<Session>>,
}

impl Staged {
    fn new(
        message: Message,
        fqdn: &str,
        on_sent: Option<oneshot::Sender<()>>,
        session: Option<Arc<Session>>,
    ) -> Self {
        let envelope = message.into_envelope(fqdn);
        // +1 for the separating comma.
        let bytes = serde_json::to_vec(&envelope).map_or(usize::MAX, |v| v.len() + 1);
        Self {
            envelope,
            bytes,
            on_sent,
            session,
        }
    }

    fn is_stale(&self) -> bool {
        self.session.as_ref().is_some_and(|s| s.is_closed())
    }
}

/// A batch on its way to the manager.
#[derive(Default)]
struct InFlight {
    messages: Vec<Envelope>,
    on_sent: Vec<oneshot::Sender<()>>,
}

enum Offer {
    Taken,
    Full(Staged),
    Oversized(Staged),
}

struct BatchBuilder {
    max_count: usize,
    max_bytes: usize,
    bytes: usize,
    batch: InFlight,
}

impl BatchBuilder {
    fn new(max_count: usize, max_bytes: usize) -> Self {
        Self {
            max_count: max_count.max(1),
            max_bytes,
            bytes: BATCH_OVERHEAD,
            batch: InFlight::default(),
        }
    }

    fn room(&self) -> usize {
        self.max_count.saturating_sub(self.batch.messages.len())
    }

    fn is_full(&self) -> bool {
        self.room() == 0
    }

    fn offer(&mut self, staged: Staged) -> Offer {
        if staged.bytes.saturating_add(BATCH_OVERHEAD) > self.max_bytes {
            return Offer::Oversized(staged);
        }
        if self.is_full() || self.bytes + staged.bytes > self.max_bytes {
            return Offer::Full(staged);
        }
        self.bytes += staged.bytes;
        self.batch.messages.push(staged.envelope);
        self.batch.on_sent.extend(staged.on_sent);
        Offer::Taken
    }

    fn finish(self) -> Option<InFlight> {
        (!self.batch.messages.is_empty()).then_some(self.batch)
    }
}

pub(crate) struct Writer {
    shared: Arc<Shared>,
    intake: mpsc::UnboundedSender<Intake>,
    backoff: Backoff,
    retry: Option<InFlight>,
    carry: VecDeque<Staged>,
    auth_retried: bool,
}

impl Writer {
    pub fn new(shared: Arc<Shared>, intake: mpsc::UnboundedSender<Intake>) -> Self {
        Self {
            backoff: Backoff::transport(&shared.config),
            shared,
            intake,
            retry: None,
            carry: VecDeque::new(),
            auth_retried: false,
        }
    }

    pub async fn run(mut self) -> TransportResult<()> {
        let keepalive = self.shared.config.keepalive;
        // Poll the manager right away; it may have queued work for us.
        let mut keepalive_at = Instant::now();

        loop {
            if self.shared.stop.is_cancelled() {
                break;
            }

            let batch = match self.next_batch().await {
                Some(batch) => batch,
                None if Instant::now() >= keepalive_at => InFlight::default(),
                None => {
                    tokio::select! {
                        biased;
                        _ = self.shared.stop.cancelled() => break,
                        _ = self.shared.wake.notified() => {}
                        _ = tokio::time::sleep_until(keepalive_at) => {}
                    }
                    continue;
                }
            };

            // Never start a request once stop was requested.
            if self.shared.stop.is_cancelled() {
                break;
            }
            let outcome = self.post(&batch.messages).await;
            keepalive_at = Instant::now() + keepalive;

            match outcome {
                Ok(reply) => self.delivered(batch, reply),
                Err(TransportError::Transient(reason)) => {
                    self.retry = Some(batch);
                    let delay = self.backoff.next_delay();
                    warn!(
                        error = %reason,
                        attempt = self.backoff.attempts(),
                        ?delay,
                        "post failed, backing off"
                    );
                    let previous = self.shared.state();
                    self.shared.set_state(TransportState::Backoff);
                    tokio::select! {
                        biased;
                        _ = self.shared.stop.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                    let resume = match previous {
                        TransportState::Backoff => TransportState::Running,
                        other => other,
                    };
                    self.shared.transition(TransportState::Backoff, resume);
                }
                Err(TransportError::Auth(reason)) => {
                    if self.auth_retried {
                        return Err(TransportError::Fatal(format!(
                            "manager still rejects the agent after reauthentication: {reason}"
                        )));
                    }
                    self.auth_retried = true;
                    warn!(error = %reason, "manager rejected the agent, resynchronizing");
                    self.shared.set_state(TransportState::Resync);
                    // Everything queued belongs to sessions the resync closes.
                    self.retry = None;
                    self.carry.clear();
                    let _ = self.intake.send(Intake::Resync);
                    self.shared.link.reauthenticate().await.map_err(|e| {
                        TransportError::Fatal(format!("reauthentication failed: {e}"))
                    })?;
                    info!("reauthenticated with manager");
                }
                Err(fatal @ TransportError::Fatal(_)) => return Err(fatal),
            }
        }

        debug!("writer stopped");
        Ok(())
    }

    async fn post(&self, messages: &[Envelope]) -> TransportResult<Batch> {
        let batch = Batch {
            messages: messages.to_vec(),
            server_boot_time: Some(self.shared.props.boot_time_rfc3339()),
            client_start_time: Some(self.shared.client_start_time.clone()),
        };
        trace!(count = batch.messages.len(), "posting batch");
        let timeout = self.shared.config.request_timeout + self.shared.config.keepalive;
        match tokio::time::timeout(timeout, self.shared.link.post(&batch)).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Transient(format!(
                "post timed out after {timeout:?}"
            ))),
        }
    }

    fn delivered(&mut self, batch: InFlight, reply: Batch) {
        if self.backoff.attempts() > 0 {
            info!(attempts = self.backoff.attempts(), "manager reachable again");
        }
        self.backoff.reset();
        self.auth_retried = false;
        self.shared
            .transition(TransportState::Backoff, TransportState::Running);

        debug!(
            sent = batch.messages.len(),
            received = reply.messages.len(),
            "batch delivered"
        );
        for on_sent in batch.on_sent {
            let _ = on_sent.send(());
        }
        if !reply.messages.is_empty() {
            let _ = self.intake.send(Intake::Inbound(reply.messages));
        }
    }

    // ── Batch construction ─────────────────────────────────────────

    /// The next batch to send: the failed one again, or a fresh one built
    /// from carried-over messages, control messages, then session data
    /// (highest priority first, sessions in plugin order).
    async fn next_batch(&mut self) -> Option<InFlight> {
        if let Some(batch) = self.retry.take() {
            return Some(batch);
        }

        let config = &self.shared.config;
        let mut builder = BatchBuilder::new(config.batch_size, config.max_bytes_per_post);

        while let Some(staged) = self.carry.pop_front() {
            if staged.is_stale() {
                continue;
            }
            if let Some(staged) = self.place(&mut builder, staged) {
                self.carry.push_front(staged);
                return builder.finish();
            }
        }

        let fqdn = self.shared.props.fqdn.clone();
        while !builder.is_full() {
            let Some((message, _)) = self.shared.outbound.pop() else {
                break;
            };
            if let Some(staged) = self.place(&mut builder, Staged::new(message, &fqdn, None, None)) {
                self.carry.push_back(staged);
                return builder.finish();
            }
        }

        let sessions = self.shared.table.sessions().await;
        for priority in Priority::DRAIN_ORDER {
            for session in &sessions {
                loop {
                    let room = builder.room().min(DRAIN_CHUNK);
                    if room == 0 {
                        return builder.finish();
                    }
                    let drained = session.drain_at(priority, room);
                    if drained.is_empty() {
                        break;
                    }
                    let mut overflow = false;
                    for outgoing in drained {
                        let staged = Staged::new(
                            outgoing.message,
                            &fqdn,
                            outgoing.on_sent,
                            Some(Arc::clone(session)),
                        );
                        if overflow {
                            self.carry.push_back(staged);
                        } else if let Some(staged) = self.place(&mut builder, staged) {
                            self.carry.push_back(staged);
                            overflow = true;
                        }
                    }
                    if overflow {
                        return builder.finish();
                    }
                }
            }
        }
        builder.finish()
    }

    /// Add `staged` to the batch. Returns it back if the batch is full.
    fn place(&self, builder: &mut BatchBuilder, staged: Staged) -> Option<Staged> {
        match builder.offer(staged) {
            Offer::Taken => None,
            Offer::Full(staged) => Some(staged),
            Offer::Oversized(staged) => {
                self.drop_oversized(staged);
                None
            }
        }
    }

    fn drop_oversized(&self, staged: Staged) {
        let envelope = &staged.envelope;
        warn!(
            plugin = envelope.plugin.as_deref().unwrap_or_default(),
            kind = envelope.kind.as_str(),
            bytes = staged.bytes,
            limit = self.shared.config.max_bytes_per_post,
            "message larger than a whole post, dropping"
        );
        if let Some(session) = staged.session {
            let _ = self.intake.send(Intake::CloseSession {
                plugin: session.plugin().to_string(),
                id: SessionId::clone(session.id()),
                reason: "message exceeds post size limit".into(),
            });
        }
    }
}
