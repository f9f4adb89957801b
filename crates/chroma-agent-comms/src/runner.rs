//! ActionRunner: bounded worker pool for manager-invoked actions.
//!
//! Each accepted invocation becomes one task; a semaphore caps how many run
//! at once. The result body goes back, at high priority, into the session
//! that was live when the invocation was accepted. Actions that return a
//! post-response callback have it run only after their success result was
//! confirmed by the manager.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chroma_agent_core::{ActionResult, ErrorKind, Priority};
use chroma_agent_plugins::{
    ActionContext, ActionError, ActionOutcome, AfterResponse, Args, PluginRegistry,
    PostResponseCallback,
};
use tokio::sync::{Semaphore, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::session::{Admission, Session};

/// One accepted `ACTION_INVOKE`.
#[derive(Debug)]
pub struct Invocation {
    pub id: String,
    pub action: String,
    /// `Err` carries why the manager's arguments could not be read.
    pub args: Result<Args, String>,
    /// Where the result is reported.
    pub session: Arc<Session>,
}

#[derive(Debug)]
struct Running {
    plugin: String,
    token: CancellationToken,
}

pub struct ActionRunner {
    registry: Arc<PluginRegistry>,
    permits: Arc<Semaphore>,
    running: Mutex<HashMap<String, Running>>,
    tracker: TaskTracker,
    exit: watch::Sender<Option<i32>>,
}

impl std::fmt::Debug for ActionRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActionRunner")
            .field("in_flight", &self.in_flight())
            .field("available_workers", &self.permits.available_permits())
            .finish()
    }
}

impl ActionRunner {
    pub fn new(registry: Arc<PluginRegistry>, workers: usize) -> Self {
        let (exit, _) = watch::channel(None);
        Self {
            registry,
            permits: Arc::new(Semaphore::new(workers.max(1))),
            running: Mutex::new(HashMap::new()),
            tracker: TaskTracker::new(),
            exit,
        }
    }

    fn running(&self) -> std::sync::MutexGuard<'_, HashMap<String, Running>> {
        self.running.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Exit code requested by a post-response callback, once one has run.
    pub fn exit_requests(&self) -> watch::Receiver<Option<i32>> {
        self.exit.subscribe()
    }

    pub fn in_flight(&self) -> usize {
        self.running().len()
    }

    // ── Invocation ─────────────────────────────────────────────────

    /// Accept an invocation. Returns `None` if one with the same id is
    /// already running; the duplicate produces no result.
    pub fn invoke(self: &Arc<Self>, invocation: Invocation) -> Option<JoinHandle<ActionResult>> {
        let token = CancellationToken::new();
        {
            let mut running = self.running();
            if running.contains_key(&invocation.id) {
                warn!(id = %invocation.id, action = %invocation.action, "duplicate invocation ignored");
                return None;
            }
            running.insert(
                invocation.id.clone(),
                Running {
                    plugin: invocation.session.plugin().to_string(),
                    token: token.clone(),
                },
            );
        }

        debug!(id = %invocation.id, action = %invocation.action, "invocation accepted");
        let runner = Arc::clone(self);
        Some(self.tracker.spawn(async move { runner.work(invocation, token).await }))
    }

    async fn work(&self, invocation: Invocation, token: CancellationToken) -> ActionResult {
        let Invocation {
            id,
            action,
            args,
            session,
        } = invocation;

        let ctx = ActionContext {
            recorder: self.registry.recorder(),
            cancel: token.clone(),
            in_daemon: true,
        };

        let outcome = match &args {
            Err(reason) => Err(ActionError::BadArgs(reason.clone())),
            Ok(args) => tokio::select! {
                biased;
                _ = token.cancelled() => Err(ActionError::Cancelled),
                permit = Arc::clone(&self.permits).acquire_owned() => match permit {
                    Ok(_permit) => tokio::select! {
                        biased;
                        _ = token.cancelled() => Err(ActionError::Cancelled),
                        outcome = self.registry.execute(&action, args, &ctx) => outcome,
                    },
                    Err(_) => Err(ActionError::Cancelled),
                },
            },
        };

        let (result, callback) = match outcome {
            Ok(ActionOutcome::Value(value)) => (ActionResult::success(&id, value), None),
            Ok(ActionOutcome::PostResponse { result, callback }) => {
                (ActionResult::success(&id, result), Some(callback))
            }
            Err(e) => {
                warn!(%id, %action, kind = %e.kind(), error = %e, "action failed");
                (
                    ActionResult::failure(&id, e.kind(), e.to_string(), e.backtrace()),
                    None,
                )
            }
        };
        let result = result.with_subprocesses(ctx.recorder.records());
        if result.success {
            info!(%id, %action, "action completed");
        }

        self.running().remove(&id);
        self.report(&session, &result, callback).await;
        result
    }

    async fn report(
        &self,
        session: &Session,
        result: &ActionResult,
        callback: Option<PostResponseCallback>,
    ) {
        let Some(callback) = callback else {
            let admission = session.enqueue(result.to_value(), Priority::High).await;
            if admission == Admission::Oversized {
                let failure = ActionResult::failure(
                    &result.id,
                    ErrorKind::ActionFailed,
                    "action result exceeds the post size limit",
                    None,
                );
                self.log_lost(session, &result.id, session.enqueue(failure.to_value(), Priority::High).await);
            } else {
                self.log_lost(session, &result.id, admission);
            }
            return;
        };

        let (admission, sent) = session.enqueue_tracked(result.to_value(), Priority::High).await;
        let Some(sent) = sent else {
            self.log_lost(session, &result.id, admission);
            warn!(id = %result.id, "post-response callback skipped");
            return;
        };
        if sent.await.is_err() {
            warn!(id = %result.id, "result never reached the manager, post-response callback skipped");
            return;
        }

        debug!(id = %result.id, "result confirmed, running post-response callback");
        match tokio::task::spawn_blocking(callback).await {
            Ok(AfterResponse::Continue) => {}
            Ok(AfterResponse::Terminate { exit_code }) => {
                info!(id = %result.id, exit_code, "post-response callback requested exit");
                self.exit.send_replace(Some(exit_code));
            }
            Err(e) => error!(id = %result.id, error = %e, "post-response callback panicked"),
        }
    }

    fn log_lost(&self, session: &Session, id: &str, admission: Admission) {
        if admission != Admission::Accepted {
            warn!(
                plugin = session.plugin(),
                session_id = %session.id(),
                %id,
                ?admission,
                "action result lost"
            );
        }
    }

    // ── Cancellation ───────────────────────────────────────────────

    /// Request cancellation of one invocation. Returns whether it was running.
    pub fn cancel(&self, id: &str) -> bool {
        match self.running().get(id) {
            Some(running) => {
                info!(%id, "cancelling action");
                running.token.cancel();
                true
            }
            None => {
                debug!(%id, "cancel for unknown invocation");
                false
            }
        }
    }

    /// Cancel every invocation whose result belongs to `plugin`'s session.
    pub fn cancel_session(&self, plugin: &str) {
        for (id, running) in self.running().iter() {
            if running.plugin == plugin {
                debug!(%id, %plugin, "cancelling action of closed session");
                running.token.cancel();
            }
        }
    }

    pub fn cancel_all(&self) {
        for running in self.running().values() {
            running.token.cancel();
        }
    }

    /// Cancel everything and wait for the workers to finish.
    pub async fn shutdown(&self) {
        self.cancel_all();
        self.tracker.close();
        self.tracker.wait().await;
    }
}
