//! In-memory manager for end-to-end transport tests.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chroma_agent_comms::{ManagerLink, TransportError, TransportResult};
use chroma_agent_core::{AgentConfig, Batch, Envelope, MessageType, ServerProperties};
use chroma_agent_plugins::{DevicePlugin, PluginError, PluginResult, PollOutcome};
use chrono::{TimeZone, Utc};
use serde_json::{Value, json};

pub const FQDN: &str = "oss1.lab";

#[derive(Default)]
struct State {
    received: Vec<Envelope>,
    posts: usize,
    replies: VecDeque<Envelope>,
    fail_next: usize,
    auth_failures: usize,
    reauthentications: usize,
    next_id: u64,
    sessions: HashMap<String, String>,
}

/// Accepts every session request with a manager-chosen id and records
/// everything the agent sends.
#[derive(Default)]
pub struct FakeManager {
    state: Mutex<State>,
}

impl FakeManager {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    /// Queue a message for the agent; delivered with the next reply.
    pub fn send(&self, envelope: Value) {
        let envelope: Envelope = serde_json::from_value(envelope).unwrap();
        self.lock().replies.push_back(envelope);
    }

    pub fn invoke(&self, plugin: &str, id: &str, action: &str, args: Value) {
        let session = self.session(plugin).unwrap();
        self.send(json!({
            "type": "ACTION_INVOKE",
            "plugin": plugin,
            "session_id": session,
            "body": {"id": id, "action": action, "args": args},
        }));
    }

    /// Fail the next `n` posts as if the manager were down.
    pub fn fail_next(&self, n: usize) {
        self.lock().fail_next = n;
    }

    /// Reject the next `n` posts with an auth error.
    pub fn reject_next(&self, n: usize) {
        self.lock().auth_failures = n;
    }

    pub fn posts(&self) -> usize {
        self.lock().posts
    }

    pub fn reauthentications(&self) -> usize {
        self.lock().reauthentications
    }

    pub fn received(&self) -> Vec<Envelope> {
        self.lock().received.clone()
    }

    /// Current session id the manager handed out for `plugin`.
    pub fn session(&self, plugin: &str) -> Option<String> {
        self.lock().sessions.get(plugin).cloned()
    }

    pub fn requests(&self, plugin: &str) -> Vec<Envelope> {
        self.received()
            .into_iter()
            .filter(|e| e.kind == MessageType::SessionCreateRequest)
            .filter(|e| e.plugin.as_deref() == Some(plugin))
            .collect()
    }

    /// `SESSION_TERMINATE` messages the agent sent for `plugin`.
    pub fn terminates(&self, plugin: &str) -> Vec<Envelope> {
        self.received()
            .into_iter()
            .filter(|e| e.kind == MessageType::SessionTerminate)
            .filter(|e| e.plugin.as_deref() == Some(plugin))
            .collect()
    }

    /// Agent `DATA` for one session, in arrival order.
    pub fn data(&self, plugin: &str, session_id: &str) -> Vec<Envelope> {
        self.received()
            .into_iter()
            .filter(|e| e.kind == MessageType::Data)
            .filter(|e| e.plugin.as_deref() == Some(plugin))
            .filter(|e| e.session_id.as_deref() == Some(session_id))
            .collect()
    }

    /// Action result bodies carrying `id`.
    pub fn results(&self, id: &str) -> Vec<Value> {
        self.received()
            .into_iter()
            .filter(|e| e.kind == MessageType::Data && e.body.get("id") == Some(&json!(id)))
            .map(|e| e.body)
            .collect()
    }

    pub async fn wait_until(&self, what: &str, mut done: impl FnMut(&Self) -> bool) {
        let waited = tokio::time::timeout(Duration::from_secs(120), async {
            while !done(self) {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        })
        .await;
        assert!(waited.is_ok(), "timed out waiting for {what}");
    }
}

#[async_trait]
impl ManagerLink for FakeManager {
    async fn post(&self, batch: &Batch) -> TransportResult<Batch> {
        let mut state = self.lock();
        state.posts += 1;
        if state.fail_next > 0 {
            state.fail_next -= 1;
            return Err(TransportError::Transient("503 Service Unavailable".into()));
        }
        if state.auth_failures > 0 {
            state.auth_failures -= 1;
            return Err(TransportError::Auth("403 Forbidden".into()));
        }
        assert!(batch.server_boot_time.is_some());
        assert!(batch.client_start_time.is_some());

        for envelope in &batch.messages {
            assert_eq!(envelope.fqdn.as_deref(), Some(FQDN));
            state.received.push(envelope.clone());
            if envelope.kind == MessageType::SessionCreateRequest {
                let plugin = envelope.plugin.clone().unwrap();
                state.next_id += 1;
                let id = format!("{plugin}-{}", state.next_id);
                state.sessions.insert(plugin.clone(), id.clone());
                state.replies.push_back(Envelope {
                    kind: MessageType::SessionCreateResponse,
                    plugin: Some(plugin),
                    session_id: Some(id),
                    session_seq: None,
                    fqdn: None,
                    body: Value::Null,
                });
            }
        }
        Ok(Batch {
            messages: state.replies.drain(..).collect(),
            ..Batch::default()
        })
    }

    async fn reauthenticate(&self) -> TransportResult<()> {
        self.lock().reauthentications += 1;
        Ok(())
    }
}

// ── Test plugins ─────────────────────────────────────────────────────

/// Reports an ever-increasing counter as a delta every poll.
#[derive(Default)]
pub struct Counter {
    count: u64,
}

#[async_trait]
impl DevicePlugin for Counter {
    async fn start_session(&mut self) -> PluginResult<Option<Value>> {
        Ok(Some(json!({"snapshot": true, "count": self.count})))
    }

    async fn update_session(&mut self) -> PluginResult<PollOutcome> {
        self.count += 1;
        Ok(PollOutcome::Delta(json!({"count": self.count})))
    }
}

/// One snapshot, then nothing ever changes.
#[derive(Default)]
pub struct Quiet;

#[async_trait]
impl DevicePlugin for Quiet {
    async fn start_session(&mut self) -> PluginResult<Option<Value>> {
        Ok(Some(json!({"state": "steady"})))
    }

    async fn update_session(&mut self) -> PluginResult<PollOutcome> {
        Ok(PollOutcome::Empty)
    }
}

pub fn props() -> ServerProperties {
    ServerProperties::new(FQDN, "oss1", Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap())
}

/// Fast, deterministic timings.
pub fn config() -> AgentConfig {
    AgentConfig {
        poll_interval: Duration::from_secs(1),
        poll_jitter: Duration::ZERO,
        keepalive: Duration::from_secs(1),
        request_timeout: Duration::from_secs(5),
        session_backoff_min: Duration::from_secs(2),
        session_backoff_max: Duration::from_secs(8),
        backoff_jitter: 0.0,
        shutdown_grace: Duration::from_secs(30),
        ..AgentConfig::default()
    }
}

/// `seq` values of a run of data envelopes.
pub fn seqs(envelopes: &[Envelope]) -> Vec<u64> {
    envelopes.iter().map(|e| e.session_seq.unwrap()).collect()
}

/// What [`Misfire`] does on its third poll.
#[derive(Debug, Clone)]
pub enum Fault {
    Crash,
    /// A delta carrying a string of this many bytes.
    Payload(usize),
}

/// Counts like [`Counter`] but misbehaves on its third poll. The fault fires
/// once across every session built from the same factory.
pub struct Misfire {
    count: u64,
    fault: Fault,
    armed: Arc<AtomicBool>,
}

impl Misfire {
    pub fn factory(fault: Fault) -> impl Fn() -> Misfire + Send + Sync + 'static {
        let armed = Arc::new(AtomicBool::new(true));
        move || Misfire {
            count: 0,
            fault: fault.clone(),
            armed: Arc::clone(&armed),
        }
    }
}

#[async_trait]
impl DevicePlugin for Misfire {
    async fn start_session(&mut self) -> PluginResult<Option<Value>> {
        Ok(Some(json!({"snapshot": true, "count": self.count})))
    }

    async fn update_session(&mut self) -> PluginResult<PollOutcome> {
        self.count += 1;
        if self.count == 3 && self.armed.swap(false, Ordering::SeqCst) {
            return match self.fault {
                Fault::Crash => Err(PluginError::Failed("sensor went away".into())),
                Fault::Payload(bytes) => Ok(PollOutcome::Delta(json!("x".repeat(bytes)))),
            };
        }
        Ok(PollOutcome::Delta(json!({"count": self.count})))
    }
}
