//! Actions: named operations the manager can invoke on this server.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;

use crate::error::ActionError;
use crate::shell::CommandRecorder;

/// Arguments of one invocation, keyed by parameter name.
pub type Args = Map<String, Value>;

/// A formal parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Param {
    pub name: &'static str,
    pub required: bool,
}

impl Param {
    pub const fn required(name: &'static str) -> Self {
        Self {
            name,
            required: true,
        }
    }

    pub const fn optional(name: &'static str) -> Self {
        Self {
            name,
            required: false,
        }
    }
}

/// Check `args` against the formal parameter list.
pub fn validate_args(action: &str, params: &[Param], args: &Args) -> Result<(), ActionError> {
    for param in params.iter().filter(|p| p.required) {
        if !args.contains_key(param.name) {
            return Err(ActionError::BadArgs(format!(
                "{action}: missing required argument `{}`",
                param.name
            )));
        }
    }
    for name in args.keys() {
        if !params.iter().any(|p| p.name == name) {
            return Err(ActionError::BadArgs(format!(
                "{action}: unexpected argument `{name}`"
            )));
        }
    }
    Ok(())
}

/// What happens to the agent after a post-response callback ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AfterResponse {
    Continue,
    Terminate { exit_code: i32 },
}

/// Side effect deferred until the success result has reached the manager.
pub type PostResponseCallback = Box<dyn FnOnce() -> AfterResponse + Send>;

pub enum ActionOutcome {
    Value(Value),
    PostResponse {
        result: Value,
        callback: PostResponseCallback,
    },
}

impl fmt::Debug for ActionOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActionOutcome::Value(v) => f.debug_tuple("Value").field(v).finish(),
            ActionOutcome::PostResponse { result, .. } => f
                .debug_struct("PostResponse")
                .field("result", result)
                .finish_non_exhaustive(),
        }
    }
}

impl From<Value> for ActionOutcome {
    fn from(value: Value) -> Self {
        ActionOutcome::Value(value)
    }
}

/// Per-invocation context handed to [`Action::run`].
#[derive(Debug, Clone)]
pub struct ActionContext {
    pub recorder: CommandRecorder,
    pub cancel: CancellationToken,
    /// Whether the invocation came through the running agent daemon.
    pub in_daemon: bool,
}

#[async_trait]
pub trait Action: Send + Sync {
    fn name(&self) -> &'static str;

    fn params(&self) -> &'static [Param] {
        &[]
    }

    /// Actions that only make sense inside the daemon are refused on the CLI.
    fn requires_daemon(&self) -> bool {
        false
    }

    fn timeout(&self) -> Option<Duration> {
        None
    }

    async fn run(&self, ctx: &ActionContext, args: &Args) -> anyhow::Result<ActionOutcome>;
}

/// A named group of actions plus the capabilities it advertises.
#[derive(Clone)]
pub struct ActionPlugin {
    name: &'static str,
    capabilities: Vec<String>,
    actions: BTreeMap<&'static str, Arc<dyn Action>>,
}

impl fmt::Debug for ActionPlugin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActionPlugin")
            .field("name", &self.name)
            .field("capabilities", &self.capabilities)
            .field("actions", &self.actions.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl ActionPlugin {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            capabilities: Vec::new(),
            actions: BTreeMap::new(),
        }
    }

    pub fn capability(mut self, capability: impl Into<String>) -> Self {
        self.capabilities.push(capability.into());
        self
    }

    pub fn action(mut self, action: impl Action + 'static) -> Self {
        self.actions.insert(action.name(), Arc::new(action));
        self
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn capabilities(&self) -> &[String] {
        &self.capabilities
    }

    pub fn actions(&self) -> impl Iterator<Item = (&'static str, &Arc<dyn Action>)> {
        self.actions.iter().map(|(name, action)| (*name, action))
    }
}
