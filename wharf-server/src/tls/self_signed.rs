//! Self-signed certificate generation — the fallback used for a hostname
//! that has no ACME-issued certificate yet, so a TLS handshake can still
//! complete while issuance is pending or retrying (§4.4).

use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SelfSignedError {
    #[error("failed to generate certificate: {0}")]
    Generation(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone)]
pub struct SelfSignedCert {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
    pub host: String,
}

impl SelfSignedCert {
    pub fn exists(&self) -> bool {
        self.cert_path.exists() && self.key_path.exists()
    }
}

/// Generates and caches self-signed certificates, one pair per hostname,
/// flat-named alongside real certificates (`<cert_dir>/<host>.self-signed.crt`).
pub struct SelfSignedGenerator {
    cert_dir: PathBuf,
}

impl SelfSignedGenerator {
    pub fn new(cert_dir: impl Into<PathBuf>) -> Self {
        Self {
            cert_dir: cert_dir.into(),
        }
    }

    pub fn cert_dir(&self) -> &Path {
        &self.cert_dir
    }

    fn paths_for(&self, host: &str) -> (PathBuf, PathBuf) {
        (
            self.cert_dir.join(format!("{host}.self-signed.crt")),
            self.cert_dir.join(format!("{host}.self-signed.key")),
        )
    }

    /// Get or create a self-signed certificate covering `host`.
    pub fn get_or_create(&self, host: &str) -> Result<SelfSignedCert, SelfSignedError> {
        let (cert_path, key_path) = self.paths_for(host);
        let cert = SelfSignedCert {
            cert_path,
            key_path,
            host: host.to_string(),
        };

        if cert.exists() {
            return Ok(cert);
        }

        self.generate(&cert)?;
        Ok(cert)
    }

    fn generate(&self, cert: &SelfSignedCert) -> Result<(), SelfSignedError> {
        std::fs::create_dir_all(&self.cert_dir)?;

        use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair, SanType};

        let mut params = CertificateParams::default();

        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, cert.host.as_str());
        dn.push(DnType::OrganizationName, "wharf");
        params.distinguished_name = dn;

        let mut sans = vec![
            SanType::DnsName(cert.host.clone().try_into().map_err(|_| {
                SelfSignedError::Generation(format!("{} is not a valid DNS name", cert.host))
            })?),
        ];
        if cert.host == "localhost" {
            sans.push(SanType::IpAddress(std::net::IpAddr::V4(
                std::net::Ipv4Addr::new(127, 0, 0, 1),
            )));
            sans.push(SanType::IpAddress(std::net::IpAddr::V6(
                std::net::Ipv6Addr::LOCALHOST,
            )));
        }
        params.subject_alt_names = sans;

        let key_pair = KeyPair::generate()
            .map_err(|e| SelfSignedError::Generation(format!("key pair generation: {e}")))?;
        let cert_der = params
            .self_signed(&key_pair)
            .map_err(|e| SelfSignedError::Generation(format!("self-signing: {e}")))?;

        std::fs::write(&cert.cert_path, cert_der.pem())?;
        std::fs::write(&cert.key_path, key_pair.serialize_pem())?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&cert.key_path, std::fs::Permissions::from_mode(0o600))?;
        }

        tracing::info!(host = %cert.host, cert_path = %cert.cert_path.display(), "generated self-signed fallback certificate");
        Ok(())
    }
}
