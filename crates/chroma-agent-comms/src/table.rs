//! SessionTable: at most one live session per device plugin.
//!
//! Only the reader task inserts or removes sessions; pollers and the writer
//! take short read locks. Per-plugin request state throttles how often a
//! `SESSION_CREATE_REQUEST` is re-issued while the manager has not answered.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chroma_agent_core::{AgentConfig, SessionId};
use chroma_agent_plugins::PluginRegistry;
use tokio::sync::{Notify, RwLock};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::backoff::Backoff;
use crate::session::{Session, SessionLimits};

/// How many closed session ids are remembered.
const RETIRED_CAPACITY: usize = 64;

#[derive(Debug)]
struct RequestState {
    proposed: SessionId,
    next_at: Instant,
    backoff: Backoff,
}

pub struct SessionTable {
    registry: Arc<PluginRegistry>,
    config: AgentConfig,
    sessions: RwLock<HashMap<String, Arc<Session>>>,
    requests: Mutex<HashMap<String, RequestState>>,
    retired: Mutex<VecDeque<(String, SessionId)>>,
    pokes: HashMap<String, Arc<Notify>>,
    wake: Arc<Notify>,
}

impl std::fmt::Debug for SessionTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionTable")
            .field("plugins", &self.pokes.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl SessionTable {
    pub fn new(registry: Arc<PluginRegistry>, config: AgentConfig, wake: Arc<Notify>) -> Self {
        let pokes = registry
            .device_names()
            .into_iter()
            .map(|name| (name, Arc::new(Notify::new())))
            .collect();
        Self {
            registry,
            config,
            sessions: RwLock::new(HashMap::new()),
            requests: Mutex::new(HashMap::new()),
            retired: Mutex::new(VecDeque::new()),
            pokes,
            wake,
        }
    }

    pub fn device_names(&self) -> Vec<String> {
        self.registry.device_names()
    }

    // ── Lookup ─────────────────────────────────────────────────────

    pub async fn get(&self, plugin: &str) -> Option<Arc<Session>> {
        self.sessions.read().await.get(plugin).cloned()
    }

    /// The session for `plugin` if its id is `id`.
    pub async fn live(&self, plugin: &str, id: &SessionId) -> Option<Arc<Session>> {
        self.get(plugin).await.filter(|s| s.id() == id)
    }

    /// All sessions, ordered by plugin name.
    pub async fn sessions(&self) -> Vec<Arc<Session>> {
        let mut sessions: Vec<_> = self.sessions.read().await.values().cloned().collect();
        sessions.sort_by(|a, b| a.plugin().cmp(b.plugin()));
        sessions
    }

    /// Whether every device plugin has a session.
    pub async fn all_established(&self) -> bool {
        let sessions = self.sessions.read().await;
        self.pokes.keys().all(|name| sessions.contains_key(name))
    }

    // ── Mutation (reader only) ─────────────────────────────────────

    /// Install the session the manager accepted. Returns the session it
    /// replaced, if any; `None` with no insert if `id` is already live.
    pub async fn create(&self, plugin: &str, id: SessionId) -> Option<CreateOutcome> {
        let Some(factory) = self.registry.device_factory(plugin) else {
            warn!(%plugin, "session response for unknown plugin");
            return None;
        };

        let mut sessions = self.sessions.write().await;
        if sessions.get(plugin).is_some_and(|s| s.id() == &id) {
            debug!(%plugin, session_id = %id, "duplicate session response ignored");
            return None;
        }

        let session = Arc::new(Session::new(
            plugin,
            id,
            factory(),
            SessionLimits::from(&self.config),
            Arc::clone(&self.wake),
        ));
        let replaced = sessions.insert(plugin.to_string(), Arc::clone(&session));
        drop(sessions);
        if let Some(old) = &replaced {
            self.retire(old);
        }

        self.clear_request(plugin);
        self.poke(plugin);
        Some(CreateOutcome { session, replaced })
    }

    /// Remove the session for `plugin`, optionally only if its id matches.
    pub async fn remove(&self, plugin: &str, id: Option<&SessionId>) -> Option<Arc<Session>> {
        let mut sessions = self.sessions.write().await;
        let matches = match (sessions.get(plugin), id) {
            (Some(current), Some(id)) => current.id() == id,
            (Some(_), None) => true,
            (None, _) => false,
        };
        let removed = if matches { sessions.remove(plugin) } else { None };
        if let Some(session) = &removed {
            self.retire(session);
        }
        removed
    }

    pub async fn remove_all(&self) -> Vec<Arc<Session>> {
        let mut sessions = self.sessions.write().await;
        let mut removed: Vec<_> = sessions.drain().map(|(_, s)| s).collect();
        removed.sort_by(|a, b| a.plugin().cmp(b.plugin()));
        for session in &removed {
            self.retire(session);
        }
        removed
    }

    fn retire(&self, session: &Session) {
        let mut retired = self.retired.lock().unwrap_or_else(|p| p.into_inner());
        if retired.len() == RETIRED_CAPACITY {
            retired.pop_front();
        }
        retired.push_back((session.plugin().to_string(), session.id().clone()));
    }

    /// Whether `id` belonged to a session this agent has since closed.
    pub fn was_retired(&self, plugin: &str, id: &SessionId) -> bool {
        self.retired
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .any(|(p, i)| p == plugin && i == id)
    }

    // ── Session requests ───────────────────────────────────────────

    /// Proposed id to send in a `SESSION_CREATE_REQUEST` if one is due now.
    pub fn request_due(&self, plugin: &str) -> Option<SessionId> {
        let now = Instant::now();
        let mut requests = self.requests.lock().unwrap_or_else(|p| p.into_inner());
        let state = requests
            .entry(plugin.to_string())
            .or_insert_with(|| RequestState {
                proposed: SessionId::generate(),
                next_at: now,
                backoff: Backoff::session_request(&self.config),
            });
        if state.next_at > now {
            return None;
        }
        state.next_at = now + state.backoff.next_delay();
        Some(state.proposed.clone())
    }

    /// Time until the next request for `plugin` may be issued.
    pub fn request_wait(&self, plugin: &str) -> Option<Duration> {
        let requests = self.requests.lock().unwrap_or_else(|p| p.into_inner());
        requests
            .get(plugin)
            .map(|state| state.next_at.saturating_duration_since(Instant::now()))
    }

    /// Hold off the next request for `plugin`, e.g. after its session failed.
    pub fn defer_request(&self, plugin: &str) {
        let now = Instant::now();
        let mut requests = self.requests.lock().unwrap_or_else(|p| p.into_inner());
        let state = requests
            .entry(plugin.to_string())
            .or_insert_with(|| RequestState {
                proposed: SessionId::generate(),
                next_at: now,
                backoff: Backoff::session_request(&self.config),
            });
        state.next_at = now + state.backoff.next_delay();
    }

    pub fn clear_request(&self, plugin: &str) {
        self.requests
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(plugin);
    }

    /// Forget all request throttling, e.g. after the manager reset sessions.
    pub fn clear_requests(&self) {
        self.requests
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clear();
    }

    // ── Poller wake-ups ────────────────────────────────────────────

    pub fn poke_handle(&self, plugin: &str) -> Option<Arc<Notify>> {
        self.pokes.get(plugin).cloned()
    }

    pub fn poke(&self, plugin: &str) {
        if let Some(poke) = self.pokes.get(plugin) {
            poke.notify_one();
        }
    }

    pub fn poke_all(&self) {
        for poke in self.pokes.values() {
            poke.notify_one();
        }
    }
}

/// A newly installed session and the one it displaced.
#[derive(Debug)]
pub struct CreateOutcome {
    pub session: Arc<Session>,
    pub replaced: Option<Arc<Session>>,
}
