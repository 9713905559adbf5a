//! Certificate metadata and the flat on-disk certificate layout (§6).
//!
//! Certificates live as `<cert_dir>/<host>.crt` / `<cert_dir>/<host>.key` —
//! no per-domain subdirectory — so a listing of the directory is a listing
//! of every host with an issued certificate.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::RwLock;
use thiserror::Error;
use x509_parser::prelude::*;

use crate::defaults;

#[derive(Debug, Error)]
pub enum CertError {
    #[error("no certificate for host: {0}")]
    NotFound(String),
    #[error("failed to parse certificate: {0}")]
    Parse(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone)]
pub struct CertInfo {
    pub host: String,
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
    pub expires_at: Option<SystemTime>,
    pub self_signed: bool,
}

impl CertInfo {
    pub fn is_expired(&self) -> bool {
        self.expires_at.map(|exp| SystemTime::now() > exp).unwrap_or(false)
    }

    pub fn needs_renewal(&self) -> bool {
        if self.self_signed {
            return false;
        }
        self.expires_at
            .map(|exp| {
                let threshold = Duration::from_secs(defaults::CERT_RENEWAL_THRESHOLD_DAYS as u64 * 86400);
                SystemTime::now() + threshold > exp
            })
            .unwrap_or(false)
    }
}

fn read_cert_expiry(cert_path: &Path) -> Result<SystemTime, CertError> {
    let pem_data = std::fs::read(cert_path)?;
    for pem in Pem::iter_from_buffer(&pem_data) {
        let pem = pem.map_err(|e| CertError::Parse(e.to_string()))?;
        if pem.label == "CERTIFICATE" {
            let (_, cert) =
                X509Certificate::from_der(&pem.contents).map_err(|e| CertError::Parse(e.to_string()))?;
            let not_after = cert.validity().not_after.timestamp();
            return Ok(UNIX_EPOCH + Duration::from_secs(not_after.max(0) as u64));
        }
    }
    Err(CertError::Parse("no certificate in PEM file".to_string()))
}

/// Tracks certificate metadata for every host known on disk. Does not own
/// the TLS-handshake-facing snapshot — that lives in [`super::sni::SniStore`],
/// which the caller keeps in sync with `add`/`remove` here.
pub struct CertManager {
    cert_dir: PathBuf,
    certs: RwLock<HashMap<String, CertInfo>>,
}

impl CertManager {
    pub fn new(cert_dir: impl Into<PathBuf>) -> Self {
        Self {
            cert_dir: cert_dir.into(),
            certs: RwLock::new(HashMap::new()),
        }
    }

    pub fn cert_dir(&self) -> &Path {
        &self.cert_dir
    }

    pub fn cert_path(&self, host: &str) -> PathBuf {
        self.cert_dir.join(format!("{host}.crt"))
    }

    pub fn key_path(&self, host: &str) -> PathBuf {
        self.cert_dir.join(format!("{host}.key"))
    }

    /// Load every `<host>.crt` / `<host>.key` pair already on disk.
    pub fn init(&self) -> Result<(), CertError> {
        std::fs::create_dir_all(&self.cert_dir)?;
        let mut certs = self.certs.write();
        for entry in std::fs::read_dir(&self.cert_dir)? {
            let entry = entry?;
            let path = entry.path();
            let Some(host) = path
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(|n| n.strip_suffix(".crt"))
            else {
                continue;
            };
            let key_path = self.key_path(host);
            if !key_path.exists() {
                continue;
            }
            let expires_at = read_cert_expiry(&path).ok();
            certs.insert(
                host.to_string(),
                CertInfo {
                    host: host.to_string(),
                    cert_path: path,
                    key_path,
                    expires_at,
                    self_signed: false,
                },
            );
        }
        Ok(())
    }

    /// Write a newly-issued certificate/key pair to disk and register it.
    pub fn store_issued(&self, host: &str, cert_pem: &[u8], key_pem: &[u8]) -> Result<CertInfo, CertError> {
        let cert_path = self.cert_path(host);
        let key_path = self.key_path(host);
        std::fs::write(&cert_path, cert_pem)?;
        std::fs::write(&key_path, key_pem)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&key_path, std::fs::Permissions::from_mode(0o600))?;
        }

        let expires_at = read_cert_expiry(&cert_path).ok();
        let info = CertInfo {
            host: host.to_string(),
            cert_path,
            key_path,
            expires_at,
            self_signed: false,
        };
        self.certs.write().insert(host.to_string(), info.clone());
        Ok(info)
    }

    /// Register a self-signed fallback that was written elsewhere (by
    /// [`super::self_signed::SelfSignedGenerator`]).
    pub fn register_self_signed(&self, host: &str, cert_path: PathBuf, key_path: PathBuf) {
        self.certs.write().insert(
            host.to_string(),
            CertInfo {
                host: host.to_string(),
                cert_path,
                key_path,
                expires_at: None,
                self_signed: true,
            },
        );
    }

    pub fn get(&self, host: &str) -> Option<CertInfo> {
        self.certs.read().get(host).cloned()
    }

    pub fn remove(&self, host: &str) -> Option<CertInfo> {
        self.certs.write().remove(host)
    }

    pub fn list(&self) -> Vec<CertInfo> {
        self.certs.read().values().cloned().collect()
    }

    pub fn needing_renewal(&self) -> Vec<CertInfo> {
        self.certs.read().values().filter(|c| c.needs_renewal()).cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn store_issued_writes_flat_files_with_host_name() {
        let temp = TempDir::new().unwrap();
        let manager = CertManager::new(temp.path());
        manager.init().unwrap();

        manager
            .store_issued("app.example.com", b"fake cert", b"fake key")
            .unwrap();

        assert!(temp.path().join("app.example.com.crt").exists());
        assert!(temp.path().join("app.example.com.key").exists());
    }

    #[test]
    fn init_discovers_existing_flat_pairs() {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join("a.example.com.crt"), b"cert").unwrap();
        std::fs::write(temp.path().join("a.example.com.key"), b"key").unwrap();

        let manager = CertManager::new(temp.path());
        manager.init().unwrap();

        assert!(manager.get("a.example.com").is_some());
    }

    #[test]
    fn cert_within_threshold_of_expiry_needs_renewal() {
        let soon = CertInfo {
            host: "app.example.com".to_string(),
            cert_path: PathBuf::new(),
            key_path: PathBuf::new(),
            expires_at: Some(SystemTime::now() + Duration::from_secs(10 * 86400)),
            self_signed: false,
        };
        assert!(soon.needs_renewal());

        let far_out = CertInfo {
            expires_at: Some(SystemTime::now() + Duration::from_secs(90 * 86400)),
            ..soon
        };
        assert!(!far_out.needs_renewal());
    }

    #[test]
    fn self_signed_certs_never_need_renewal() {
        let temp = TempDir::new().unwrap();
        let manager = CertManager::new(temp.path());
        manager.register_self_signed(
            "dev.local",
            temp.path().join("dev.local.self-signed.crt"),
            temp.path().join("dev.local.self-signed.key"),
        );
        assert!(manager.needing_renewal().is_empty());
    }

    #[test]
    fn remove_forgets_the_host() {
        let temp = TempDir::new().unwrap();
        let manager = CertManager::new(temp.path());
        manager.store_issued("a.example.com", b"c", b"k").unwrap();
        assert!(manager.remove("a.example.com").is_some());
        assert!(manager.get("a.example.com").is_none());
    }
}
