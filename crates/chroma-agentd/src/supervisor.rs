//! Supervisor: assembles the agent from persisted state and runs the
//! transport until it is signalled, fails, or an action asks for an exit.

use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use chroma_agent_comms::{HttpsLink, ManagerUrl, Registration, Transport};
use chroma_agent_core::{AgentConfig, ServerProperties};
use chroma_agent_plugins::{PluginRegistry, builtin};
use chroma_agent_store::{ConfigStore, CryptoStore, ServerSettings};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::error::DaemonError;

/// Everything the daemon needs, loaded and validated before any task starts.
pub struct Supervisor {
    pub config: AgentConfig,
    pub server: ServerSettings,
    pub registry: PluginRegistry,
    crypto: Arc<CryptoStore>,
    props: ServerProperties,
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor")
            .field("url", &self.server.url)
            .field("fqdn", &self.props.fqdn)
            .field("devices", &self.registry.device_names())
            .finish_non_exhaustive()
    }
}

impl Supervisor {
    /// Load settings and identity from `state_dir`, layering the optional
    /// TOML file over the stored agent settings.
    pub fn load(
        state_dir: &Path,
        config_file: Option<&Path>,
        excluded: &[String],
        props: ServerProperties,
    ) -> anyhow::Result<Self> {
        let store = ConfigStore::open(state_dir)?;
        let server = match store.server_settings()? {
            Some(server) if !server.url.is_empty() => server,
            _ => return Err(DaemonError::ConfigMissing(state_dir.display().to_string()).into()),
        };

        let toml_text = config_file
            .map(|path| {
                std::fs::read_to_string(path)
                    .with_context(|| format!("reading config file {}", path.display()))
            })
            .transpose()?;
        let config = AgentConfig::layered(store.agent_settings()?.as_ref(), toml_text.as_deref())
            .context("resolving agent config")?;

        let crypto = CryptoStore::new(state_dir);
        if crypto.tls_material()?.is_none() && server.registration_secret.is_none() {
            return Err(DaemonError::NotRegistered.into());
        }
        if store.profile_managed()? {
            info!("server profile is managed");
        }

        let mut registry = builtin::registry();
        registry.exclude(excluded);

        Ok(Self {
            config,
            server,
            registry,
            crypto: Arc::new(crypto),
            props,
        })
    }

    /// Run until `stop` is cancelled or the transport gives up. Returns the
    /// process exit status.
    pub async fn run(self, stop: CancellationToken) -> anyhow::Result<i32> {
        let url = ManagerUrl::parse(&self.server.url)?;
        let mut link = HttpsLink::new(url.clone(), self.crypto, self.config.request_timeout);
        if let Some(secret) = self.server.registration_secret {
            link = link.with_registration(Registration {
                secret,
                address: self.props.fqdn.clone(),
                properties: self.props.clone(),
                capabilities: self.registry.capabilities().into_iter().collect(),
            });
        }

        info!(
            %url,
            fqdn = %self.props.fqdn,
            devices = ?self.registry.device_names(),
            "agent starting"
        );
        let grace = self.config.shutdown_grace;
        let transport = Transport::new(
            Arc::new(link),
            Arc::new(self.registry),
            self.config,
            self.props,
        )
        .start()
        .await?;

        let mut exit = transport.exit_requests();
        let requested = tokio::select! {
            _ = stop.cancelled() => None,
            _ = transport.stopped() => None,
            Ok(code) = exit.wait_for(Option::is_some) => *code,
        };

        let stopped = transport.stop(grace).await;
        match (requested, stopped) {
            (Some(code), Ok(())) => {
                info!(exit_code = code, "exiting at an action's request");
                Ok(code)
            }
            (Some(code), Err(e)) => {
                warn!(error = %e, "transport did not stop cleanly");
                Ok(code)
            }
            (None, Ok(())) => {
                info!("agent stopped");
                Ok(0)
            }
            (None, Err(e)) => {
                error!(kind = %e.kind(), error = %e, "transport failed");
                Err(e.into())
            }
        }
    }
}
