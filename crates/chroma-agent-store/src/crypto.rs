//! CryptoStore: the agent's TLS identity on disk.
//!
//! Three files live in the state directory: `private.pem` (RSA key, PKCS#8),
//! `self.crt` (agent certificate issued by the manager) and `authority.crt`
//! (the manager's CA). The key is generated on first use; the certificate
//! and CA are installed by registration.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use openssl::pkey::PKey;
use openssl::rsa::Rsa;
use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use crate::atomic::write_owner_only;
use crate::error::{CryptoError, CryptoResult};

pub const PRIVATE_KEY_FILE: &str = "private.pem";
pub const CERTIFICATE_FILE: &str = "self.crt";
pub const CA_FILE: &str = "authority.crt";

const RSA_BITS: u32 = 2048;

/// Parsed identity, read once and handed to the TLS client by value.
#[derive(Debug)]
pub struct TlsMaterial {
    pub certificate_chain: Vec<CertificateDer<'static>>,
    pub private_key: PrivateKeyDer<'static>,
    /// Empty when no CA has been installed yet.
    pub ca_certificates: Vec<CertificateDer<'static>>,
}

impl Clone for TlsMaterial {
    fn clone(&self) -> Self {
        Self {
            certificate_chain: self.certificate_chain.clone(),
            private_key: self.private_key.clone_key(),
            ca_certificates: self.ca_certificates.clone(),
        }
    }
}

#[derive(Debug)]
pub struct CryptoStore {
    dir: PathBuf,
    keygen: Mutex<()>,
}

impl CryptoStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            keygen: Mutex::new(()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    fn existing(&self, name: &str) -> Option<PathBuf> {
        let path = self.path(name);
        path.exists().then_some(path)
    }

    /// Path of the private key, generating a fresh key if none exists.
    pub fn private_key_path(&self) -> CryptoResult<PathBuf> {
        let _guard = self.keygen.lock().unwrap_or_else(|p| p.into_inner());
        let path = self.path(PRIVATE_KEY_FILE);
        if path.exists() {
            return Ok(path);
        }

        fs::create_dir_all(&self.dir).map_err(|e| CryptoError::io(&self.dir, e))?;
        let rsa = Rsa::generate(RSA_BITS)?;
        let pem = PKey::from_rsa(rsa)?.private_key_to_pem_pkcs8()?;
        write_owner_only(&path, &pem).map_err(|e| CryptoError::io(&path, e))?;
        info!(path = %path.display(), bits = RSA_BITS, "generated agent private key");
        Ok(path)
    }

    pub fn certificate_path(&self) -> Option<PathBuf> {
        self.existing(CERTIFICATE_FILE)
    }

    pub fn ca_path(&self) -> Option<PathBuf> {
        self.existing(CA_FILE)
    }

    /// PEM certificate signing request for `common_name` using the stored key.
    pub fn generate_csr(&self, common_name: &str) -> CryptoResult<String> {
        let key_path = self.private_key_path()?;
        let key_pem = read_present(&key_path)?;
        let key_pair = KeyPair::from_pem(&key_pem).map_err(|e| CryptoError::corrupt(&key_path, e))?;

        let mut params = CertificateParams::new(Vec::<String>::new())?;
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, common_name);
        params.distinguished_name = dn;

        let csr = params.serialize_request(&key_pair)?;
        Ok(csr.pem()?)
    }

    pub fn install_ca(&self, pem: &str) -> CryptoResult<()> {
        self.install(CA_FILE, pem)
    }

    pub fn install_certificate(&self, pem: &str) -> CryptoResult<()> {
        self.install(CERTIFICATE_FILE, pem)
    }

    fn install(&self, name: &str, pem: &str) -> CryptoResult<()> {
        let certs = parse_certs(pem.as_bytes()).map_err(CryptoError::InvalidPem)?;
        if certs.is_empty() {
            return Err(CryptoError::InvalidPem(format!("no certificate in {name}")));
        }
        fs::create_dir_all(&self.dir).map_err(|e| CryptoError::io(&self.dir, e))?;
        let path = self.path(name);
        write_owner_only(&path, pem.as_bytes()).map_err(|e| CryptoError::io(&path, e))?;
        info!(path = %path.display(), "installed certificate");
        Ok(())
    }

    /// Remove key, certificate and CA. Absent files are ignored.
    pub fn forget(&self) -> CryptoResult<()> {
        for name in [PRIVATE_KEY_FILE, CERTIFICATE_FILE, CA_FILE] {
            let path = self.path(name);
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(CryptoError::io(&path, e)),
            }
        }
        warn!(dir = %self.dir.display(), "agent identity forgotten");
        Ok(())
    }

    /// Installed CA certificates, empty if none is installed.
    pub fn ca_certificates(&self) -> CryptoResult<Vec<CertificateDer<'static>>> {
        match self.ca_path() {
            Some(path) => read_certs(&path),
            None => Ok(Vec::new()),
        }
    }

    /// Load the full identity. `None` until a certificate is installed.
    pub fn tls_material(&self) -> CryptoResult<Option<TlsMaterial>> {
        let Some(cert_path) = self.certificate_path() else {
            return Ok(None);
        };
        let certificate_chain = read_certs(&cert_path)?;
        if certificate_chain.is_empty() {
            return Err(CryptoError::corrupt(&cert_path, "no certificate found"));
        }

        let key_path = self.path(PRIVATE_KEY_FILE);
        if !key_path.exists() {
            return Err(CryptoError::corrupt(
                &key_path,
                "certificate installed without a private key",
            ));
        }
        let key_pem = read_present(&key_path)?;
        let private_key = rustls_pemfile::private_key(&mut key_pem.as_bytes())
            .map_err(|e| CryptoError::corrupt(&key_path, e))?
            .ok_or_else(|| CryptoError::corrupt(&key_path, "no private key found"))?;

        Ok(Some(TlsMaterial {
            certificate_chain,
            private_key,
            ca_certificates: self.ca_certificates()?,
        }))
    }

    /// SHA-256 of the agent certificate (DER), hex encoded.
    pub fn certificate_fingerprint(&self) -> CryptoResult<Option<String>> {
        let Some(path) = self.certificate_path() else {
            return Ok(None);
        };
        let certs = read_certs(&path)?;
        let first = certs
            .first()
            .ok_or_else(|| CryptoError::corrupt(&path, "no certificate found"))?;
        Ok(Some(hex::encode(Sha256::digest(first.as_ref()))))
    }
}

fn read_present(path: &Path) -> CryptoResult<String> {
    fs::read_to_string(path).map_err(|e| CryptoError::corrupt(path, e))
}

fn read_certs(path: &Path) -> CryptoResult<Vec<CertificateDer<'static>>> {
    let pem = read_present(path)?;
    parse_certs(pem.as_bytes()).map_err(|reason| CryptoError::corrupt(path, reason))
}

fn parse_certs(mut pem: &[u8]) -> Result<Vec<CertificateDer<'static>>, String> {
    rustls_pemfile::certs(&mut pem)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| e.to_string())
}
