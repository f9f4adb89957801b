//! chroma-agent-plugins: what the agent can observe and do.
//!
//! Device plugins ([`DevicePlugin`]) sample local state for a session.
//! Actions ([`Action`]) are named operations the manager invokes, grouped
//! into [`ActionPlugin`]s. The [`PluginRegistry`] is the closed set of both,
//! built at startup.

pub mod action;
pub mod builtin;
pub mod device;
pub mod error;
pub mod registry;
pub mod shell;

pub use action::{
    Action, ActionContext, ActionOutcome, ActionPlugin, AfterResponse, Args, Param,
    PostResponseCallback,
};
pub use device::{DeviceFactory, DevicePlugin, PollOutcome};
pub use error::{ActionError, PluginError, PluginResult};
pub use registry::{DirectRun, PluginRegistry, device_factory};
pub use shell::{CommandExecutor, CommandOutput, CommandRecorder, ScriptedExecutor, SystemExecutor};
