//! HTTPS link to the manager: hyper's HTTP/1 client over tokio-rustls.
//!
//! Every POST opens its own connection; the agent talks to the manager at
//! most once per writer tick, so there is nothing to gain from pooling.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chroma_agent_core::Batch;
use chroma_agent_store::CryptoStore;
use http::header::{CONTENT_TYPE, HOST, USER_AGENT};
use http::{Method, StatusCode, Uri};
use http_body_util::{BodyExt, Full};
use hyper_util::rt::TokioIo;
use rustls::ClientConfig;
use rustls::pki_types::ServerName;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, info, warn};

use crate::error::{TransportError, TransportResult};
use crate::link::ManagerLink;
use crate::registration::{self, Registration};
use crate::tls::client_config;

pub const MESSAGE_PATH: &str = "message/";

const AGENT_USER_AGENT: &str = concat!("chroma-agent/", env!("CARGO_PKG_VERSION"));

// ── ManagerUrl ───────────────────────────────────────────────────────

/// Base URL of the manager, e.g. `https://manager.example:443/agent/`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagerUrl {
    host: String,
    port: u16,
    /// Without trailing slash; empty for the root.
    base_path: String,
}

impl ManagerUrl {
    pub fn parse(url: &str) -> TransportResult<Self> {
        let uri: Uri = url
            .parse()
            .map_err(|e| TransportError::Fatal(format!("invalid manager url `{url}`: {e}")))?;
        if uri.scheme_str() != Some("https") {
            return Err(TransportError::Fatal(format!(
                "manager url `{url}` must use https"
            )));
        }
        let host = uri
            .host()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| TransportError::Fatal(format!("manager url `{url}` has no host")))?;
        Ok(Self {
            host: host.trim_start_matches('[').trim_end_matches(']').to_string(),
            port: uri.port_u16().unwrap_or(443),
            base_path: uri.path().trim_end_matches('/').to_string(),
        })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn authority(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// Absolute request path of an endpoint below the base, e.g. `message/`.
    pub fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.base_path, path.trim_start_matches('/'))
    }
}

impl std::fmt::Display for ManagerUrl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "https://{}{}/", self.authority(), self.base_path)
    }
}

// ── Request plumbing ─────────────────────────────────────────────────

fn classify_tls(err: std::io::Error) -> TransportError {
    match err
        .get_ref()
        .and_then(|inner| inner.downcast_ref::<rustls::Error>())
    {
        Some(rustls::Error::InvalidCertificate(reason)) => {
            TransportError::Fatal(format!("manager certificate rejected: {reason:?}"))
        }
        Some(tls) => TransportError::Auth(format!("tls handshake failed: {tls}")),
        None => TransportError::Transient(format!("tls handshake failed: {err}")),
    }
}

/// POST `body` as JSON to `path` and decode the JSON reply.
pub async fn post_json<B, R>(
    url: &ManagerUrl,
    tls: Arc<ClientConfig>,
    path: &str,
    body: &B,
    timeout: Duration,
) -> TransportResult<R>
where
    B: Serialize + ?Sized,
    R: DeserializeOwned,
{
    let payload = serde_json::to_vec(body)
        .map_err(|e| TransportError::Fatal(format!("cannot encode request: {e}")))?;

    let exchange = async {
        let stream = TcpStream::connect((url.host(), url.port()))
            .await
            .map_err(|e| TransportError::Transient(format!("connect {}: {e}", url.authority())))?;
        let server_name = ServerName::try_from(url.host().to_string())
            .map_err(|e| TransportError::Fatal(format!("invalid server name: {e}")))?;
        let stream = TlsConnector::from(tls)
            .connect(server_name, stream)
            .await
            .map_err(classify_tls)?;

        let io = TokioIo::new(stream);
        let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
            .await
            .map_err(|e| TransportError::Transient(format!("http handshake failed: {e}")))?;

        // Drive the connection in the background.
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!(error = %e, "manager connection closed with error");
            }
        });

        let request = http::Request::builder()
            .method(Method::POST)
            .uri(path)
            .header(HOST, url.authority())
            .header(USER_AGENT, AGENT_USER_AGENT)
            .header(CONTENT_TYPE, "application/json")
            .body(Full::new(Bytes::from(payload)))
            .map_err(|e| TransportError::Fatal(format!("cannot build request: {e}")))?;

        let response = sender
            .send_request(request)
            .await
            .map_err(|e| TransportError::Transient(format!("request failed: {e}")))?;
        let status = response.status();
        let body = response
            .into_body()
            .collect()
            .await
            .map_err(|e| TransportError::Transient(format!("reading response failed: {e}")))?
            .to_bytes();
        Ok::<_, TransportError>((status, body))
    };

    let (status, body) = tokio::time::timeout(timeout, exchange)
        .await
        .map_err(|_| TransportError::Transient(format!("request to {path} timed out")))??;

    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            Err(TransportError::Auth(format!("{path} returned {status}")))
        }
        s if !s.is_success() => {
            warn!(%path, status = %s, "manager returned an error status");
            Err(TransportError::Transient(format!("{path} returned {status}")))
        }
        // An empty reply decodes as JSON `null`.
        _ if body.is_empty() => serde_json::from_slice(b"null")
            .map_err(|e| TransportError::Fatal(format!("unexpected empty response from {path}: {e}"))),
        _ => serde_json::from_slice(&body)
            .map_err(|e| TransportError::Fatal(format!("unexpected response from {path}: {e}"))),
    }
}

// ── HttpsLink ────────────────────────────────────────────────────────

/// Production [`ManagerLink`].
pub struct HttpsLink {
    url: ManagerUrl,
    crypto: Arc<CryptoStore>,
    tls: RwLock<Option<Arc<ClientConfig>>>,
    registration: Option<Registration>,
    timeout: Duration,
}

impl std::fmt::Debug for HttpsLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpsLink")
            .field("url", &self.url)
            .field("can_register", &self.registration.is_some())
            .finish_non_exhaustive()
    }
}

impl HttpsLink {
    pub fn new(url: ManagerUrl, crypto: Arc<CryptoStore>, timeout: Duration) -> Self {
        Self {
            url,
            crypto,
            tls: RwLock::new(None),
            registration: None,
            timeout,
        }
    }

    /// Allow the link to register itself when no identity is installed.
    pub fn with_registration(mut self, registration: Registration) -> Self {
        self.registration = Some(registration);
        self
    }

    pub fn url(&self) -> &ManagerUrl {
        &self.url
    }

    /// Read the identity from disk and build a fresh client config.
    fn reload(&self) -> TransportResult<Arc<ClientConfig>> {
        let material = self
            .crypto
            .tls_material()
            .map_err(|e| TransportError::Fatal(e.to_string()))?
            .ok_or_else(|| TransportError::Fatal("agent is not registered".into()))?;
        let config = client_config(&material)?;
        *self.tls.write().unwrap_or_else(|p| p.into_inner()) = Some(Arc::clone(&config));
        Ok(config)
    }

    fn config(&self) -> TransportResult<Arc<ClientConfig>> {
        let cached = self.tls.read().unwrap_or_else(|p| p.into_inner()).clone();
        match cached {
            Some(config) => Ok(config),
            None => self.reload(),
        }
    }

    async fn register(&self) -> TransportResult<()> {
        let Some(registration) = &self.registration else {
            return Err(TransportError::Fatal(
                "agent is not registered and no registration secret is configured".into(),
            ));
        };
        registration::register(&self.url, &self.crypto, registration, self.timeout).await?;
        Ok(())
    }
}

#[async_trait]
impl ManagerLink for HttpsLink {
    async fn post(&self, batch: &Batch) -> TransportResult<Batch> {
        let tls = self.config()?;
        // An empty body means nothing for us.
        let reply: Option<Batch> =
            post_json(&self.url, tls, &self.url.endpoint(MESSAGE_PATH), batch, self.timeout)
                .await?;
        Ok(reply.unwrap_or_default())
    }

    async fn ensure_identity(&self) -> TransportResult<()> {
        if self.crypto.certificate_path().is_none() {
            info!(url = %self.url, "no agent certificate installed, registering");
            self.register().await?;
        }
        self.reload()?;
        if let Ok(Some(fingerprint)) = self.crypto.certificate_fingerprint() {
            info!(%fingerprint, "agent identity loaded");
        }
        Ok(())
    }

    async fn reauthenticate(&self) -> TransportResult<()> {
        if self.registration.is_some() {
            warn!("manager rejected the agent certificate, registering again");
            self.register().await?;
        } else {
            warn!("manager rejected the agent certificate, reloading identity");
        }
        self.reload().map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_base_url() {
        let url = ManagerUrl::parse("https://manager.example/agent/").unwrap();
        assert_eq!(url.host(), "manager.example");
        assert_eq!(url.port(), 443);
        assert_eq!(url.endpoint(MESSAGE_PATH), "/agent/message/");
        assert_eq!(url.endpoint("register/s3cret/"), "/agent/register/s3cret/");
        assert_eq!(url.to_string(), "https://manager.example:443/agent/");
    }

    #[test]
    fn root_url_and_explicit_port() {
        let url = ManagerUrl::parse("https://10.0.0.1:8443").unwrap();
        assert_eq!(url.authority(), "10.0.0.1:8443");
        assert_eq!(url.endpoint("message/"), "/message/");
    }

    #[test]
    fn rejects_plain_http_and_garbage() {
        assert!(matches!(
            ManagerUrl::parse("http://manager/"),
            Err(TransportError::Fatal(_))
        ));
        assert!(ManagerUrl::parse("not a url").is_err());
    }

    #[test]
    fn tls_errors_are_classified() {
        let bad_cert = std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            rustls::Error::InvalidCertificate(rustls::CertificateError::UnknownIssuer),
        );
        assert!(matches!(classify_tls(bad_cert), TransportError::Fatal(_)));

        let refused = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        assert!(matches!(classify_tls(refused), TransportError::Transient(_)));
    }

    #[tokio::test]
    async fn unregistered_link_without_secret_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let link = HttpsLink::new(
            ManagerUrl::parse("https://manager.example/").unwrap(),
            Arc::new(CryptoStore::new(dir.path())),
            Duration::from_secs(1),
        );
        assert!(matches!(
            link.ensure_identity().await,
            Err(TransportError::Fatal(_))
        ));
    }
}
