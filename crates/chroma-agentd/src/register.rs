//! One-shot `register` and `reregister` commands.

use std::path::Path;
use std::time::Duration;

use chroma_agent_comms::{ManagerUrl, Registration, RegistrationResponse};
use chroma_agent_core::ServerProperties;
use chroma_agent_plugins::PluginRegistry;
use chroma_agent_store::{ConfigStore, CryptoStore, ServerSettings};
use tracing::info;

use crate::error::DaemonError;

const TIMEOUT: Duration = Duration::from_secs(60);

/// Obtain an identity from the manager and persist it with the server
/// settings. Refuses if a certificate is already installed.
pub async fn register(
    state_dir: &Path,
    url: &str,
    secret: &str,
    address: Option<String>,
    props: ServerProperties,
    registry: &PluginRegistry,
) -> anyhow::Result<RegistrationResponse> {
    let store = ConfigStore::open(state_dir)?;
    let crypto = CryptoStore::new(state_dir);
    if crypto.certificate_path().is_some() {
        let current = store
            .server_settings()?
            .map(|s| s.url)
            .unwrap_or_else(|| "an unknown manager".into());
        return Err(DaemonError::AlreadyRegistered(current).into());
    }

    let manager = ManagerUrl::parse(url)?;
    let registration = Registration {
        secret: secret.to_string(),
        address: address.unwrap_or_else(|| props.fqdn.clone()),
        properties: props,
        capabilities: registry.capabilities().into_iter().collect(),
    };
    let response = chroma_agent_comms::register(&manager, &crypto, &registration, TIMEOUT).await?;

    store.set_server_settings(&ServerSettings {
        url: url.to_string(),
        registration_secret: Some(secret.to_string()),
    })?;
    info!(%manager, "registered");
    Ok(response)
}

/// Tell the manager this server moved, then point the stored settings at
/// the new manager URL.
pub async fn reregister(
    state_dir: &Path,
    url: &str,
    address: &str,
    props: &ServerProperties,
) -> anyhow::Result<()> {
    let store = ConfigStore::open(state_dir)?;
    let crypto = CryptoStore::new(state_dir);
    let Some(mut settings) = store.server_settings()? else {
        return Err(DaemonError::ConfigMissing(state_dir.display().to_string()).into());
    };
    if crypto.certificate_path().is_none() {
        return Err(DaemonError::NotRegistered.into());
    }

    let manager = ManagerUrl::parse(url)?;
    chroma_agent_comms::reregister(&manager, &crypto, &props.fqdn, address, TIMEOUT).await?;

    settings.url = url.to_string();
    store.set_server_settings(&settings)?;
    info!(%manager, %address, "re-registered");
    Ok(())
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};

    use super::*;
    use crate::error::exit_code;

    fn props() -> ServerProperties {
        ServerProperties::new("oss1.lab", "oss1", Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap())
    }

    #[tokio::test]
    async fn register_refuses_when_a_certificate_exists() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("self.crt"), "placeholder").unwrap();

        let err = register(
            dir.path(),
            "https://manager.lab/",
            "s3cret",
            None,
            props(),
            &PluginRegistry::new(),
        )
        .await
        .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<DaemonError>(),
            Some(DaemonError::AlreadyRegistered(_))
        ));
    }

    #[tokio::test]
    async fn reregister_needs_stored_settings() {
        let dir = tempfile::tempdir().unwrap();
        let err = reregister(dir.path(), "https://manager2.lab/", "10.0.0.5", &props())
            .await
            .unwrap_err();
        assert_eq!(exit_code(&err), 2);
    }

    #[tokio::test]
    async fn reregister_needs_an_identity() {
        let dir = tempfile::tempdir().unwrap();
        ConfigStore::open(dir.path())
            .unwrap()
            .set_server_settings(&ServerSettings {
                url: "https://manager.lab/".into(),
                registration_secret: None,
            })
            .unwrap();

        let err = reregister(dir.path(), "https://manager2.lab/", "10.0.0.5", &props())
            .await
            .unwrap_err();
        assert!(matches!(err.downcast_ref::<DaemonError>(), Some(DaemonError::NotRegistered)));
    }
}
