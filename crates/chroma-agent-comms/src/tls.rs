//! rustls client configurations for the manager link.
//!
//! Normal traffic authenticates the manager against the installed CA only and
//! presents the agent certificate. Registration happens before any identity
//! exists, so it goes without a client certificate and, when no CA has been
//! installed yet, trusts the manager on first use.

use std::sync::Arc;

use chroma_agent_store::TlsMaterial;
use rustls::pki_types::CertificateDer;
use rustls::{ClientConfig, RootCertStore};
use tracing::warn;

use crate::error::{TransportError, TransportResult};

fn builder() -> TransportResult<rustls::ConfigBuilder<ClientConfig, rustls::WantsVerifier>> {
    // TLS 1.2 and 1.3 only.
    ClientConfig::builder_with_provider(rustls::crypto::ring::default_provider().into())
        .with_safe_default_protocol_versions()
        .map_err(|e| TransportError::Fatal(format!("tls protocol version error: {e}")))
}

fn roots(ca_certificates: &[CertificateDer<'static>]) -> TransportResult<RootCertStore> {
    let mut store = RootCertStore::empty();
    let (added, ignored) = store.add_parsable_certificates(ca_certificates.iter().cloned());
    if ignored > 0 {
        warn!(ignored, "ignored unparsable CA certificates");
    }
    if added == 0 {
        return Err(TransportError::Fatal("no usable CA certificate installed".into()));
    }
    Ok(store)
}

/// Mutually authenticated configuration for normal traffic.
pub fn client_config(material: &TlsMaterial) -> TransportResult<Arc<ClientConfig>> {
    let config = builder()?
        .with_root_certificates(roots(&material.ca_certificates)?)
        .with_client_auth_cert(
            material.certificate_chain.clone(),
            material.private_key.clone_key(),
        )
        .map_err(|e| TransportError::Fatal(format!("unusable agent certificate: {e}")))?;
    Ok(Arc::new(config))
}

/// Configuration for the registration request.
pub fn registration_config(
    ca_certificates: &[CertificateDer<'static>],
) -> TransportResult<Arc<ClientConfig>> {
    let config = if ca_certificates.is_empty() {
        warn!("no CA installed, trusting the manager's certificate for registration");
        builder()?
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(danger::TrustOnFirstUse))
            .with_no_client_auth()
    } else {
        builder()?
            .with_root_certificates(roots(ca_certificates)?)
            .with_no_client_auth()
    };
    Ok(Arc::new(config))
}

// ── Trust-on-first-use verifier (registration only) ──────────────────

mod danger {
    use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
    use rustls::crypto::{verify_tls12_signature, verify_tls13_signature};
    use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
    use rustls::{DigitallySignedStruct, Error, SignatureScheme};

    /// Accepts any server certificate but still checks handshake signatures,
    /// so the peer must hold the key of the certificate it presented.
    #[derive(Debug)]
    pub struct TrustOnFirstUse;

    impl ServerCertVerifier for TrustOnFirstUse {
        fn verify_server_cert(
            &self,
            _end_entity: &CertificateDer<'_>,
            _intermediates: &[CertificateDer<'_>],
            _server_name: &ServerName<'_>,
            _ocsp_response: &[u8],
            _now: UnixTime,
        ) -> Result<ServerCertVerified, Error> {
            Ok(ServerCertVerified::assertion())
        }

        fn verify_tls12_signature(
            &self,
            message: &[u8],
            cert: &CertificateDer<'_>,
            dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, Error> {
            verify_tls12_signature(
                message,
                cert,
                dss,
                &rustls::crypto::ring::default_provider().signature_verification_algorithms,
            )
        }

        fn verify_tls13_signature(
            &self,
            message: &[u8],
            cert: &CertificateDer<'_>,
            dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, Error> {
            verify_tls13_signature(
                message,
                cert,
                dss,
                &rustls::crypto::ring::default_provider().signature_verification_algorithms,
            )
        }

        fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
            rustls::crypto::ring::default_provider()
                .signature_verification_algorithms
                .supported_schemes()
        }
    }
}

#[cfg(test)]
mod tests {
    use rustls::pki_types::{PrivateKeyDer, PrivatePkcs8KeyDer};

    use super::*;

    fn self_signed() -> (CertificateDer<'static>, PrivateKeyDer<'static>) {
        let key = rcgen::KeyPair::generate().unwrap();
        let cert = rcgen::CertificateParams::new(vec!["manager.local".to_string()])
            .unwrap()
            .self_signed(&key)
            .unwrap();
        (
            cert.der().clone(),
            PrivatePkcs8KeyDer::from(key.serialize_der()).into(),
        )
    }

    #[test]
    fn client_config_requires_a_ca() {
        let (cert, key) = self_signed();
        let material = TlsMaterial {
            certificate_chain: vec![cert],
            private_key: key,
            ca_certificates: Vec::new(),
        };
        let err = client_config(&material).unwrap_err();
        assert!(matches!(err, TransportError::Fatal(_)));
    }

    #[test]
    fn client_config_with_identity() {
        let (ca, _) = self_signed();
        let (cert, key) = self_signed();
        let material = TlsMaterial {
            certificate_chain: vec![cert],
            private_key: key,
            ca_certificates: vec![ca],
        };
        assert!(client_config(&material).is_ok());
    }

    #[test]
    fn registration_without_ca_uses_tofu() {
        assert!(registration_config(&[]).is_ok());
        let (ca, _) = self_signed();
        assert!(registration_config(&[ca]).is_ok());
    }
}
