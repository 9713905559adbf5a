//! TLS termination and certificate lifecycle.
//!
//! - [`acme`]: ACME HTTP-01 issuance via `instant-acme`
//! - [`queue`]: persisted issuance retry queue
//! - [`manager`]: flat on-disk certificate metadata
//! - [`self_signed`]: fallback certs for hosts awaiting issuance
//! - [`sni`]: the copy-on-write snapshot the TLS handshake reads from

mod acme;
mod manager;
mod queue;
mod self_signed;
mod sni;

pub use acme::{AcmeClient, AcmeConfig, AcmeError, ChallengeHandler, ChallengeTokens};
pub use manager::{CertError, CertInfo, CertManager};
pub use queue::CertQueueWorker;
pub use self_signed::{SelfSignedCert, SelfSignedError, SelfSignedGenerator};
pub use sni::{LoadedCert, SniCertResolver, SniStore, create_sni_callbacks};
