//! Plugins shipped with the agent.

pub mod action_runner;
pub mod host;
pub mod lustre;
pub mod server_power;

use crate::registry::{PluginRegistry, device_factory};

/// Registry of every built-in plugin.
pub fn registry() -> PluginRegistry {
    PluginRegistry::new()
        .with_device(host::NAME, device_factory(host::HostPlugin::default))
        .with_device(
            action_runner::NAME,
            device_factory(|| action_runner::ActionRunnerPlugin),
        )
        .with_actions(lustre::plugin())
        .with_actions(server_power::plugin())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtins_are_registered() {
        let registry = registry();
        assert_eq!(registry.device_names(), vec!["action_runner", "host"]);
        assert!(registry.find_action("set_conf_param").is_some());
        assert!(registry.find_action("reboot_server").is_some());
        assert!(registry.capabilities().contains("manage_targets"));
    }
}
