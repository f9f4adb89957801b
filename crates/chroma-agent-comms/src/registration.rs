//! First-time registration and address updates.
//!
//! Registration sends a CSR for the agent's key together with a description
//! of the server, and installs the certificate (and CA) the manager returns.

use std::time::Duration;

use chroma_agent_core::ServerProperties;
use chroma_agent_store::CryptoStore;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::info;

use crate::error::{TransportError, TransportResult};
use crate::https::{ManagerUrl, post_json};
use crate::tls::{client_config, registration_config};

pub const REREGISTER_PATH: &str = "reregister/";

/// Everything needed to register this server.
#[derive(Debug, Clone)]
pub struct Registration {
    pub secret: String,
    /// Address the manager should use to reach this server.
    pub address: String,
    pub properties: ServerProperties,
    pub capabilities: Vec<String>,
}

#[derive(Debug, Serialize)]
struct RegistrationRequest<'a> {
    address: &'a str,
    fqdn: &'a str,
    nodename: &'a str,
    capabilities: &'a [String],
    version: &'static str,
    csr: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RegistrationResponse {
    pub certificate: String,
    #[serde(default)]
    pub ca: Option<String>,
    #[serde(default)]
    pub host_id: Option<Value>,
    #[serde(default)]
    pub command_id: Option<Value>,
}

fn fatal(e: impl std::fmt::Display) -> TransportError {
    TransportError::Fatal(e.to_string())
}

pub async fn register(
    url: &ManagerUrl,
    crypto: &CryptoStore,
    registration: &Registration,
    timeout: Duration,
) -> TransportResult<RegistrationResponse> {
    let props = &registration.properties;
    if props.is_unconfigured() {
        return Err(TransportError::Fatal(format!(
            "refusing to register with unconfigured hostname `{}`",
            props.fqdn
        )));
    }

    let request = RegistrationRequest {
        address: &registration.address,
        fqdn: &props.fqdn,
        nodename: &props.nodename,
        capabilities: &registration.capabilities,
        version: env!("CARGO_PKG_VERSION"),
        csr: crypto.generate_csr(&props.fqdn).map_err(fatal)?,
    };
    let tls = registration_config(&crypto.ca_certificates().map_err(fatal)?)?;
    let path = url.endpoint(&format!("register/{}/", registration.secret));

    info!(%url, fqdn = %props.fqdn, "registering with manager");
    let response: RegistrationResponse = post_json(url, tls, &path, &request, timeout).await?;

    if let Some(ca) = &response.ca {
        crypto.install_ca(ca).map_err(fatal)?;
    }
    crypto
        .install_certificate(&response.certificate)
        .map_err(fatal)?;
    info!(host_id = ?response.host_id, command_id = ?response.command_id, "registration complete");
    Ok(response)
}

/// Tell the manager this server is now reachable at `address`.
pub async fn reregister(
    url: &ManagerUrl,
    crypto: &CryptoStore,
    fqdn: &str,
    address: &str,
    timeout: Duration,
) -> TransportResult<()> {
    let material = crypto
        .tls_material()
        .map_err(fatal)?
        .ok_or_else(|| TransportError::Fatal("agent is not registered".into()))?;
    let tls = client_config(&material)?;
    let body = json!({ "fqdn": fqdn, "address": address });

    info!(%url, %address, "re-registering with manager");
    let _: Value = post_json(url, tls, &url.endpoint(REREGISTER_PATH), &body, timeout).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;

    #[test]
    fn response_optional_fields() {
        let response: RegistrationResponse =
            serde_json::from_value(json!({"certificate": "PEM"})).unwrap();
        assert_eq!(response.certificate, "PEM");
        assert!(response.ca.is_none());
        assert!(response.host_id.is_none());
    }

    #[test]
    fn request_shape() {
        let caps = vec!["manage_targets".to_string()];
        let request = RegistrationRequest {
            address: "oss1",
            fqdn: "oss1.lab",
            nodename: "oss1",
            capabilities: &caps,
            version: "0.1.0",
            csr: "CSR".into(),
        };
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(
            value,
            json!({
                "address": "oss1",
                "fqdn": "oss1.lab",
                "nodename": "oss1",
                "capabilities": ["manage_targets"],
                "version": "0.1.0",
                "csr": "CSR",
            })
        );
    }

    #[tokio::test]
    async fn unconfigured_hostname_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let registration = Registration {
            secret: "s".into(),
            address: "localhost".into(),
            properties: ServerProperties::new(
                chroma_agent_core::properties::UNCONFIGURED_FQDN,
                "localhost",
                Utc::now(),
            ),
            capabilities: Vec::new(),
        };
        let err = register(
            &ManagerUrl::parse("https://manager.example/").unwrap(),
            &CryptoStore::new(dir.path()),
            &registration,
            Duration::from_secs(1),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, TransportError::Fatal(_)));
        assert!(!dir.path().join("private.pem").exists());
    }
}
