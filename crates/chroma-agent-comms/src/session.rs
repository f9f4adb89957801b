//! Plugin session: one device plugin's conversation with the manager.
//!
//! A session owns the plugin instance and a bounded, priority-partitioned
//! buffer of bodies awaiting transmission. Sequence numbers are assigned
//! when the writer drains a body, so dropped bodies never leave gaps and the
//! first drained body of a session (its snapshot) always carries `seq = 0`.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use chroma_agent_core::{AgentConfig, Message, Priority, SessionId};
use chroma_agent_plugins::{DevicePlugin, PluginResult, PollOutcome};
use serde_json::Value;
use tokio::sync::{Notify, oneshot};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::SessionError;

/// Room left in a POST for the envelope around a body.
pub const ENVELOPE_MARGIN: usize = 512;

/// Buffered body plus an optional "was transmitted" notification.
#[derive(Debug)]
struct Pending {
    body: Value,
    on_sent: Option<oneshot::Sender<()>>,
}

/// A drained message ready for a batch.
#[derive(Debug)]
pub struct Outgoing {
    pub message: Message,
    pub on_sent: Option<oneshot::Sender<()>>,
}

/// Result of offering a body to the buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Accepted,
    /// The buffer was full and nothing of equal or lower priority could go.
    Dropped,
    Oversized,
    Closed,
}

#[derive(Debug, Clone, Copy)]
pub struct SessionLimits {
    pub buffer: usize,
    pub failsafe_threshold: u32,
    pub max_body_bytes: usize,
}

impl From<&AgentConfig> for SessionLimits {
    fn from(config: &AgentConfig) -> Self {
        Self {
            buffer: config.session_buffer_limit,
            failsafe_threshold: config.failsafe_threshold,
            max_body_bytes: config.max_bytes_per_post.saturating_sub(ENVELOPE_MARGIN),
        }
    }
}

#[derive(Debug, Default)]
struct SessionState {
    next_seq: u64,
    opened: bool,
    last_update_at: Option<Instant>,
    last_snapshot: Option<Value>,
    failsafe_counter: u32,
    /// Indexed by `Priority as usize`.
    buffers: [VecDeque<Pending>; 3],
}

impl SessionState {
    fn len(&self) -> usize {
        self.buffers.iter().map(VecDeque::len).sum()
    }

    fn queue(&mut self, priority: Priority) -> &mut VecDeque<Pending> {
        &mut self.buffers[priority as usize]
    }
}

pub struct Session {
    plugin: String,
    id: SessionId,
    limits: SessionLimits,
    state: Mutex<SessionState>,
    device: tokio::sync::Mutex<Box<dyn DevicePlugin>>,
    trigger_update: AtomicBool,
    closed: AtomicBool,
    /// Woken whenever buffer space frees up or the session closes.
    space: Notify,
    /// Writer wake-up.
    wake: Arc<Notify>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("plugin", &self.plugin)
            .field("id", &self.id)
            .field("open", &self.is_open())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Session {
    pub fn new(
        plugin: impl Into<String>,
        id: SessionId,
        device: Box<dyn DevicePlugin>,
        limits: SessionLimits,
        wake: Arc<Notify>,
    ) -> Self {
        let plugin = plugin.into();
        info!(%plugin, session_id = %id, "session created");
        Self {
            plugin,
            id,
            limits,
            state: Mutex::new(SessionState::default()),
            device: tokio::sync::Mutex::new(device),
            trigger_update: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            space: Notify::new(),
            wake,
        }
    }

    fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn plugin(&self) -> &str {
        &self.plugin
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    /// Open means a snapshot has been produced.
    pub fn is_open(&self) -> bool {
        self.lock().opened
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn buffered(&self) -> usize {
        self.lock().len()
    }

    pub fn last_update_at(&self) -> Option<Instant> {
        self.lock().last_update_at
    }

    /// Make the next poll send a fresh snapshot instead of an update.
    pub fn request_snapshot(&self) {
        self.trigger_update.store(true, Ordering::Release);
    }

    // ── Lifecycle ──────────────────────────────────────────────────

    /// Ask the plugin for its initial snapshot. Returns whether the session
    /// is now open; `false` means the plugin was not ready and the caller
    /// should retry later.
    pub async fn open(&self) -> Result<bool, SessionError> {
        let mut device = self.device.lock().await;
        self.open_locked(device.as_mut()).await
    }

    async fn open_locked(&self, device: &mut dyn DevicePlugin) -> Result<bool, SessionError> {
        if self.is_closed() {
            return Ok(false);
        }
        let Some(snapshot) = device.start_session().await? else {
            debug!(plugin = %self.plugin, "plugin not ready, session stays pending");
            return Ok(false);
        };
        self.check_size(&snapshot)?;

        let mut state = self.lock();
        if state.opened {
            return Ok(true);
        }
        state.opened = true;
        state.last_snapshot = Some(snapshot.clone());
        state.last_update_at = Some(Instant::now());
        // Front of the highest queue: first drained, so it gets seq 0.
        state.queue(Priority::High).push_front(Pending {
            body: snapshot,
            on_sent: None,
        });
        drop(state);

        info!(plugin = %self.plugin, session_id = %self.id, "session opened");
        self.wake.notify_one();
        Ok(true)
    }

    /// Stop the session: discard buffered bodies and release blocked
    /// producers. Returns whether this call did the closing.
    pub fn mark_closed(&self, reason: &str) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        let discarded = {
            let mut state = self.lock();
            let n = state.len();
            for queue in &mut state.buffers {
                queue.clear();
            }
            n
        };
        self.space.notify_waiters();
        info!(plugin = %self.plugin, session_id = %self.id, %reason, discarded, "session closed");
        true
    }

    /// Close and run the plugin's teardown in the background.
    pub fn close(self: &Arc<Self>, reason: &str) {
        if self.mark_closed(reason) {
            let session = Arc::clone(self);
            tokio::spawn(async move { session.teardown().await });
        }
    }

    /// Close and wait for the plugin's teardown.
    pub async fn close_now(&self, reason: &str) {
        if self.mark_closed(reason) {
            self.teardown().await;
        }
    }

    /// Run the plugin's teardown. Call after [`Session::mark_closed`].
    pub async fn teardown(&self) {
        let mut device = self.device.lock().await;
        if let Err(e) = device.teardown().await {
            warn!(plugin = %self.plugin, error = %e, "plugin teardown failed");
        }
    }

    // ── Polling ────────────────────────────────────────────────────

    /// One polling cycle.
    pub async fn poll(&self) -> Result<(), SessionError> {
        if self.is_closed() {
            return Ok(());
        }
        let mut device = self.device.lock().await;

        if !self.is_open() {
            self.open_locked(device.as_mut()).await?;
            return Ok(());
        }

        if self.trigger_update.swap(false, Ordering::AcqRel) {
            if let Some(snapshot) = device.start_session().await? {
                self.lock().last_snapshot = Some(snapshot.clone());
                self.reset_failsafe();
                self.admit(snapshot, Priority::Normal, None).await?;
            }
            self.touch();
            return Ok(());
        }

        match device.update_session().await? {
            PollOutcome::Snapshot(snapshot) => {
                self.lock().last_snapshot = Some(snapshot.clone());
                self.reset_failsafe();
                self.admit(snapshot, Priority::Normal, None).await?;
            }
            PollOutcome::Delta(delta) => {
                self.reset_failsafe();
                self.admit(delta, Priority::Normal, None).await?;
            }
            PollOutcome::Batch { bodies, priority } => {
                for body in bodies {
                    self.admit(body, priority, None).await?;
                }
            }
            PollOutcome::Empty => {
                let resend = {
                    let mut state = self.lock();
                    state.failsafe_counter += 1;
                    if state.failsafe_counter >= self.limits.failsafe_threshold {
                        state.failsafe_counter = 0;
                        state.last_snapshot.clone()
                    } else {
                        None
                    }
                };
                if let Some(snapshot) = resend {
                    debug!(plugin = %self.plugin, "failsafe snapshot resend");
                    self.admit(snapshot, Priority::Normal, None).await?;
                }
            }
            PollOutcome::Yield => {}
        }
        self.touch();
        Ok(())
    }

    /// Forward a manager `DATA` body to the plugin.
    pub async fn deliver(&self, body: Value) -> PluginResult<()> {
        self.device.lock().await.on_message(body).await
    }

    fn reset_failsafe(&self) {
        self.lock().failsafe_counter = 0;
    }

    fn touch(&self) {
        self.lock().last_update_at = Some(Instant::now());
    }

    pub fn failsafe_counter(&self) -> u32 {
        self.lock().failsafe_counter
    }

    // ── Buffer ─────────────────────────────────────────────────────

    fn check_size(&self, body: &Value) -> Result<(), SessionError> {
        let bytes = serde_json::to_vec(body).map(|v| v.len()).unwrap_or(usize::MAX);
        if bytes > self.limits.max_body_bytes {
            return Err(SessionError::Oversized {
                bytes,
                limit: self.limits.max_body_bytes,
            });
        }
        Ok(())
    }

    async fn admit(
        &self,
        body: Value,
        priority: Priority,
        on_sent: Option<oneshot::Sender<()>>,
    ) -> Result<Admission, SessionError> {
        self.check_size(&body)?;
        Ok(self.push(Pending { body, on_sent }, priority).await)
    }

    /// Buffer a body. `High` bodies wait for room rather than being dropped.
    pub async fn enqueue(&self, body: Value, priority: Priority) -> Admission {
        match self.admit(body, priority, None).await {
            Ok(admission) => admission,
            Err(_) => Admission::Oversized,
        }
    }

    /// Buffer a body and get notified once the batch carrying it was
    /// accepted by the manager.
    pub async fn enqueue_tracked(
        &self,
        body: Value,
        priority: Priority,
    ) -> (Admission, Option<oneshot::Receiver<()>>) {
        let (tx, rx) = oneshot::channel();
        match self.admit(body, priority, Some(tx)).await {
            Ok(Admission::Accepted) => (Admission::Accepted, Some(rx)),
            Ok(other) => (other, None),
            Err(_) => (Admission::Oversized, None),
        }
    }

    async fn push(&self, pending: Pending, priority: Priority) -> Admission {
        let mut pending = Some(pending);
        loop {
            let notified = self.space.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.lock();
                if self.is_closed() {
                    return Admission::Closed;
                }
                let Some(item) = pending.take() else {
                    return Admission::Closed;
                };

                if state.len() < self.limits.buffer {
                    state.queue(priority).push_back(item);
                    drop(state);
                    self.wake.notify_one();
                    return Admission::Accepted;
                }

                // Evict the oldest body of equal or lower priority, lowest first.
                // High bodies are never evicted.
                let evicted = [Priority::Low, Priority::Normal]
                    .into_iter()
                    .filter(|p| *p <= priority)
                    .find_map(|p| state.queue(p).pop_front().map(|_| p));
                if let Some(victim) = evicted {
                    state.queue(priority).push_back(item);
                    drop(state);
                    warn!(plugin = %self.plugin, ?victim, "session buffer full, evicted oldest message");
                    self.wake.notify_one();
                    return Admission::Accepted;
                }

                if priority != Priority::High {
                    warn!(plugin = %self.plugin, ?priority, "session buffer full, dropping message");
                    return Admission::Dropped;
                }
                pending = Some(item);
            }

            debug!(plugin = %self.plugin, "session buffer full, waiting for room");
            notified.await;
        }
    }

    /// Whether a drain would return anything.
    pub fn has_pending(&self) -> bool {
        let state = self.lock();
        state.opened && !self.is_closed() && state.len() > 0
    }

    /// Remove up to `max` bodies across all priorities, highest first.
    pub fn drain(&self, max: usize) -> Vec<Outgoing> {
        let mut out = Vec::new();
        for priority in Priority::DRAIN_ORDER {
            if out.len() >= max {
                break;
            }
            let room = max - out.len();
            out.extend(self.drain_at(priority, room));
        }
        out
    }

    /// Remove up to `max` bodies of one priority, FIFO, assigning `seq`.
    pub fn drain_at(&self, priority: Priority, max: usize) -> Vec<Outgoing> {
        let mut state = self.lock();
        if !state.opened || self.is_closed() || max == 0 {
            return Vec::new();
        }

        let mut out = Vec::new();
        while out.len() < max {
            let Some(pending) = state.queue(priority).pop_front() else {
                break;
            };
            let seq = state.next_seq;
            state.next_seq += 1;
            out.push(Outgoing {
                message: Message::Data {
                    plugin: self.plugin.clone(),
                    session_id: self.id.clone(),
                    seq,
                    body: pending.body,
                },
                on_sent: pending.on_sent,
            });
        }
        drop(state);

        if !out.is_empty() {
            self.space.notify_waiters();
        }
        out
    }
}
