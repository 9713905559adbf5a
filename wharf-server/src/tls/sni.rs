//! SNI-based certificate selection during the TLS handshake.
//!
//! Loaded certificate material lives in a copy-on-write snapshot
//! (`RwLock<Arc<HashMap<...>>>`), swapped wholesale on every update, so the
//! handshake callback only ever takes a read lock for the instant it takes
//! to clone an `Arc` — never while touching disk.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use openssl::pkey::{PKey, Private};
use openssl::ssl::SslRef;
use openssl::x509::X509;
use parking_lot::RwLock;
use pingora_core::listeners::TlsAccept;

pub struct LoadedCert {
    pub cert: X509,
    pub key: PKey<Private>,
}

impl LoadedCert {
    pub fn from_pem(cert_pem: &[u8], key_pem: &[u8]) -> Result<Self, openssl::error::ErrorStack> {
        Ok(Self {
            cert: X509::from_pem(cert_pem)?,
            key: PKey::private_key_from_pem(key_pem)?,
        })
    }

    pub fn from_files(
        cert_path: &std::path::Path,
        key_path: &std::path::Path,
    ) -> std::io::Result<Self> {
        let cert_pem = std::fs::read(cert_path)?;
        let key_pem = std::fs::read(key_path)?;
        Self::from_pem(&cert_pem, &key_pem)
            .map_err(|e| std::io::Error::other(format!("failed to parse certificate material: {e}")))
    }
}

/// The copy-on-write snapshot the handshake callback reads.
pub struct SniStore {
    snapshot: RwLock<Arc<HashMap<String, Arc<LoadedCert>>>>,
}

impl Default for SniStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SniStore {
    pub fn new() -> Self {
        Self {
            snapshot: RwLock::new(Arc::new(HashMap::new())),
        }
    }

    pub fn get(&self, host: &str) -> Option<Arc<LoadedCert>> {
        self.snapshot.read().get(host).cloned()
    }

    pub fn any(&self) -> Option<Arc<LoadedCert>> {
        self.snapshot.read().values().next().cloned()
    }

    pub fn set(&self, host: String, loaded: LoadedCert) {
        let loaded = Arc::new(loaded);
        let mut guard = self.snapshot.write();
        let mut next = HashMap::clone(&guard);
        next.insert(host, loaded);
        *guard = Arc::new(next);
    }

    pub fn remove(&self, host: &str) {
        let mut guard = self.snapshot.write();
        if !guard.contains_key(host) {
            return;
        }
        let mut next = HashMap::clone(&guard);
        next.remove(host);
        *guard = Arc::new(next);
    }
}

pub struct SniCertResolver {
    store: Arc<SniStore>,
}

impl SniCertResolver {
    pub fn new(store: Arc<SniStore>) -> Self {
        Self { store }
    }
}

impl std::fmt::Debug for SniCertResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SniCertResolver").finish()
    }
}

#[async_trait]
impl TlsAccept for SniCertResolver {
    async fn certificate_callback(&self, ssl: &mut SslRef) {
        let sni_hostname = ssl
            .servername(openssl::ssl::NameType::HOST_NAME)
            .map(|n| n.to_string());

        let loaded = match &sni_hostname {
            Some(host) => self.store.get(host).or_else(|| self.store.any()),
            None => self.store.any(),
        };

        let Some(loaded) = loaded else {
            tracing::warn!(hostname = ?sni_hostname, "no certificate available for TLS handshake");
            return;
        };

        if let Err(e) = ssl.set_certificate(&loaded.cert) {
            tracing::error!(hostname = ?sni_hostname, error = %e, "failed to set certificate");
        }
        if let Err(e) = ssl.set_private_key(&loaded.key) {
            tracing::error!(hostname = ?sni_hostname, error = %e, "failed to set private key");
        }
    }
}

pub fn create_sni_callbacks(store: Arc<SniStore>) -> Box<dyn TlsAccept + Send + Sync> {
    Box::new(SniCertResolver::new(store))
}
