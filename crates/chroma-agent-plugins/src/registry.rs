//! PluginRegistry: the closed set of plugins known to this agent.
//!
//! Built once at startup from explicit constructors; excluded plugins are
//! removed before anything else sees the registry.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chroma_agent_core::ActionResult;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::action::{Action, ActionContext, ActionOutcome, ActionPlugin, Args, PostResponseCallback, validate_args};
use crate::device::DeviceFactory;
use crate::error::ActionError;
use crate::shell::{CommandExecutor, CommandRecorder, SystemExecutor};

/// Outcome of running one action outside the daemon.
pub struct DirectRun {
    pub result: ActionResult,
    /// Deferred side effect; run it once `result` has been reported.
    pub callback: Option<PostResponseCallback>,
}

#[derive(Clone)]
pub struct PluginRegistry {
    devices: BTreeMap<String, DeviceFactory>,
    /// In registration order; the first plugin to declare an action owns it.
    action_plugins: Vec<ActionPlugin>,
    executor: Arc<dyn CommandExecutor>,
}

impl Default for PluginRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginRegistry")
            .field("devices", &self.devices.keys().collect::<Vec<_>>())
            .field("action_plugins", &self.action_plugins)
            .finish()
    }
}

impl PluginRegistry {
    /// An empty registry running commands on the local system.
    pub fn new() -> Self {
        Self {
            devices: BTreeMap::new(),
            action_plugins: Vec::new(),
            executor: Arc::new(SystemExecutor),
        }
    }

    pub fn with_executor(mut self, executor: Arc<dyn CommandExecutor>) -> Self {
        self.executor = executor;
        self
    }

    pub fn with_device(mut self, name: impl Into<String>, factory: DeviceFactory) -> Self {
        self.devices.insert(name.into(), factory);
        self
    }

    pub fn with_actions(mut self, plugin: ActionPlugin) -> Self {
        for (action, _) in plugin.actions() {
            if let Some(owner) = self.owner_of(action).filter(|owner| *owner != plugin.name()) {
                warn!(action, owner, plugin = plugin.name(), "duplicate action name, keeping first");
            }
        }
        match self.action_plugins.iter_mut().find(|p| p.name() == plugin.name()) {
            Some(slot) => *slot = plugin,
            None => self.action_plugins.push(plugin),
        }
        self
    }

    /// Drop the named plugins (device or action).
    pub fn exclude<S: AsRef<str>>(&mut self, names: &[S]) {
        for name in names {
            let name = name.as_ref();
            let before = self.action_plugins.len();
            self.action_plugins.retain(|p| p.name() != name);
            let removed =
                self.devices.remove(name).is_some() | (self.action_plugins.len() != before);
            if removed {
                debug!(plugin = name, "plugin excluded");
            } else {
                warn!(plugin = name, "cannot exclude unknown plugin");
            }
        }
    }

    // ── Discovery ──────────────────────────────────────────────────

    pub fn device_plugins(&self) -> &BTreeMap<String, DeviceFactory> {
        &self.devices
    }

    pub fn device_names(&self) -> Vec<String> {
        self.devices.keys().cloned().collect()
    }

    pub fn device_factory(&self, name: &str) -> Option<&DeviceFactory> {
        self.devices.get(name)
    }

    /// Action plugin name → its action names.
    pub fn action_plugins(&self) -> BTreeMap<&'static str, Vec<&'static str>> {
        self.action_plugins
            .iter()
            .map(|plugin| (plugin.name(), plugin.actions().map(|(a, _)| a).collect()))
            .collect()
    }

    pub fn capabilities(&self) -> BTreeSet<String> {
        self.action_plugins
            .iter()
            .flat_map(|p| p.capabilities().iter().cloned())
            .collect()
    }

    fn owner_of(&self, action: &str) -> Option<&'static str> {
        self.action_plugins
            .iter()
            .find(|p| p.actions().any(|(name, _)| name == action))
            .map(|p| p.name())
    }

    pub fn find_action(&self, name: &str) -> Option<Arc<dyn Action>> {
        self.action_plugins.iter().find_map(|plugin| {
            plugin
                .actions()
                .find(|(action, _)| *action == name)
                .map(|(_, a)| Arc::clone(a))
        })
    }

    /// A recorder for one invocation, bound to this registry's executor.
    pub fn recorder(&self) -> CommandRecorder {
        CommandRecorder::new(Arc::clone(&self.executor))
    }

    // ── Execution ──────────────────────────────────────────────────

    /// Resolve, validate and run an action, honoring its declared timeout.
    pub async fn execute(
        &self,
        name: &str,
        args: &Args,
        ctx: &ActionContext,
    ) -> Result<ActionOutcome, ActionError> {
        let action = self
            .find_action(name)
            .ok_or_else(|| ActionError::Unknown(name.to_string()))?;
        if action.requires_daemon() && !ctx.in_daemon {
            return Err(ActionError::DaemonOnly(name.to_string()));
        }
        validate_args(name, action.params(), args)?;

        let outcome = match action.timeout() {
            Some(limit) => tokio::time::timeout(limit, action.run(ctx, args))
                .await
                .map_err(|_| ActionError::TimedOut(limit))?,
            None => action.run(ctx, args).await,
        };
        Ok(outcome?)
    }

    /// Run one action directly (the CLI path).
    pub async fn run_action(&self, name: &str, args: &Args) -> DirectRun {
        let ctx = ActionContext {
            recorder: self.recorder(),
            cancel: CancellationToken::new(),
            in_daemon: false,
        };
        let (result, callback) = match self.execute(name, args, &ctx).await {
            Ok(ActionOutcome::Value(value)) => (ActionResult::success("cli", value), None),
            Ok(ActionOutcome::PostResponse { result, callback }) => {
                (ActionResult::success("cli", result), Some(callback))
            }
            Err(e) => (
                ActionResult::failure("cli", e.kind(), e.to_string(), e.backtrace()),
                None,
            ),
        };
        DirectRun {
            result: result.with_subprocesses(ctx.recorder.records()),
            callback,
        }
    }
}

/// Wrap a closure as a [`DeviceFactory`].
pub fn device_factory<F, P>(make: F) -> DeviceFactory
where
    F: Fn() -> P + Send + Sync + 'static,
    P: crate::device::DevicePlugin + 'static,
{
    Arc::new(move || Box::new(make()))
}

/// `null` for actions that return nothing.
pub fn unit() -> ActionOutcome {
    ActionOutcome::Value(Value::Null)
}
