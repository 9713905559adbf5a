//! Persisted certificate issuance retry queue and renewal sweep (§4.4).
//!
//! A daily sweep alone isn't enough: a transient ACME failure (rate limit,
//! a dropped HTTP-01 probe) needs to retry sooner than a day later, and
//! that retry state has to survive a restart. Entries live in the store's
//! `cert_queue` snapshot and this worker drains them on a short cadence.
//! The same worker also runs the slower sweep that looks for certificates
//! approaching expiry and re-issues them before they lapse.

use std::sync::Arc;

use wharf_core::CertQueueEntry;

use crate::defaults;
use crate::events::{DeploymentEvent, EventBus};
use crate::store::Store;
use crate::tls::acme::AcmeClient;
use crate::tls::manager::CertManager;
use crate::tls::sni::{LoadedCert, SniStore};

fn now_unix() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

pub struct CertQueueWorker {
    store: Arc<Store>,
    acme: Arc<AcmeClient>,
    cert_manager: Arc<CertManager>,
    sni: Arc<SniStore>,
    events: Arc<EventBus>,
}

impl CertQueueWorker {
    pub fn new(
        store: Arc<Store>,
        acme: Arc<AcmeClient>,
        cert_manager: Arc<CertManager>,
        sni: Arc<SniStore>,
        events: Arc<EventBus>,
    ) -> Self {
        Self {
            store,
            acme,
            cert_manager,
            sni,
            events,
        }
    }

    /// Queue a host for issuance if it isn't already queued.
    pub fn enqueue(&self, host: &str, contact_email: &str) {
        if self.store.get_cert_queue_entry(host).is_some() {
            return;
        }
        self.store.upsert_cert_queue_entry(CertQueueEntry {
            host: host.to_string(),
            contact_email: contact_email.to_string(),
            added_at: now_unix(),
            last_attempt_at: 0,
            attempts: 0,
        });
    }

    /// Run the retry loop forever; spawn as a background task.
    pub async fn run(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(defaults::CERT_RETRY_INTERVAL);
        loop {
            ticker.tick().await;
            self.sweep().await;
        }
    }

    /// Run the daily renewal sweep forever; spawn as a background task
    /// alongside [`Self::run`].
    pub async fn run_renewal_sweep(self: Arc<Self>, contact_email: String) {
        let mut ticker = tokio::time::interval(defaults::CERT_RENEWAL_SWEEP_INTERVAL);
        loop {
            ticker.tick().await;
            self.sweep_renewals(&contact_email).await;
        }
    }

    async fn sweep_renewals(&self, contact_email: &str) {
        for cert in self.cert_manager.needing_renewal() {
            tracing::info!(host = %cert.host, "certificate nearing expiry, re-issuing");
            match self.acme.issue(&cert.host).await {
                Ok((cert_pem, key_pem)) => {
                    match self
                        .cert_manager
                        .store_issued(&cert.host, cert_pem.as_bytes(), key_pem.as_bytes())
                    {
                        Ok(info) => match LoadedCert::from_files(&info.cert_path, &info.key_path) {
                            Ok(loaded) => {
                                self.sni.set(cert.host.clone(), loaded);
                                self.events
                                    .publish(DeploymentEvent::CertificateIssued { host: cert.host.clone() });
                            }
                            Err(e) => tracing::error!(host = %cert.host, error = %e, "renewed certificate could not be loaded"),
                        },
                        Err(e) => tracing::error!(host = %cert.host, error = %e, "failed to persist renewed certificate"),
                    }
                }
                Err(e) => {
                    tracing::warn!(host = %cert.host, error = %e, "renewal attempt failed, feeding retry queue");
                    self.enqueue(&cert.host, contact_email);
                }
            }
        }
    }

    async fn sweep(&self) {
        let now = now_unix();
        let retry_after = defaults::CERT_RETRY_INTERVAL.as_secs() as i64;
        for entry in self.store.list_cert_queue_entries() {
            if entry.last_attempt_at != 0 && now - entry.last_attempt_at < retry_after {
                continue;
            }
            self.attempt(entry).await;
        }
    }

    async fn attempt(&self, mut entry: CertQueueEntry) {
        entry.attempts += 1;
        entry.last_attempt_at = now_unix();

        match self.acme.issue(&entry.host).await {
            Ok((cert_pem, key_pem)) => {
                match self
                    .cert_manager
                    .store_issued(&entry.host, cert_pem.as_bytes(), key_pem.as_bytes())
                {
                    Ok(info) => match LoadedCert::from_files(&info.cert_path, &info.key_path) {
                        Ok(loaded) => self.sni.set(entry.host.clone(), loaded),
                        Err(e) => tracing::error!(host = %entry.host, error = %e, "issued certificate could not be loaded"),
                    },
                    Err(e) => tracing::error!(host = %entry.host, error = %e, "failed to persist issued certificate"),
                }
                self.store.remove_cert_queue_entry(&entry.host);
                tracing::info!(host = %entry.host, attempts = entry.attempts, "certificate issued");
                self.events
                    .publish(DeploymentEvent::CertificateIssued { host: entry.host.clone() });
            }
            Err(e) => {
                if entry.attempts >= defaults::CERT_RETRY_MAX_ATTEMPTS {
                    tracing::error!(host = %entry.host, attempts = entry.attempts, error = %e, "abandoning certificate issuance");
                    self.store.remove_cert_queue_entry(&entry.host);
                    self.events
                        .publish(DeploymentEvent::CertificateAbandoned { host: entry.host.clone() });
                } else {
                    tracing::warn!(host = %entry.host, attempts = entry.attempts, error = %e, "certificate issuance attempt failed, will retry");
                    self.store.upsert_cert_queue_entry(entry.clone());
                    self.events.publish(DeploymentEvent::CertificateRetryScheduled {
                        host: entry.host.clone(),
                        attempts: entry.attempts,
                    });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tls::acme::AcmeConfig;
    use std::time::Duration;
    use tempfile::TempDir;

    fn worker(temp: &TempDir) -> CertQueueWorker {
        let store = Store::open(temp.path()).unwrap();
        let acme = Arc::new(AcmeClient::new(AcmeConfig {
            staging: true,
            contact_email: Some("ops@example.com".to_string()),
            account_dir: temp.path().join("acme"),
            order_timeout: Duration::from_secs(5),
        }));
        let cert_manager = Arc::new(CertManager::new(temp.path().join("certs")));
        cert_manager.init().unwrap();
        let sni = Arc::new(SniStore::new());
        let events = Arc::new(EventBus::new());
        CertQueueWorker::new(store, acme, cert_manager, sni, events)
    }

    #[tokio::test]
    async fn enqueue_is_idempotent() {
        let temp = TempDir::new().unwrap();
        let worker = worker(&temp);
        worker.enqueue("app.example.com", "ops@example.com");
        worker.enqueue("app.example.com", "ops@example.com");
        assert_eq!(worker.store.list_cert_queue_entries().len(), 1);
    }

    #[tokio::test]
    async fn failed_attempt_increments_until_abandoned() {
        let temp = TempDir::new().unwrap();
        let worker = worker(&temp);
        worker.enqueue("app.example.com", "ops@example.com");

        // the ACME client has no account, so every attempt fails immediately.
        for _ in 0..defaults::CERT_RETRY_MAX_ATTEMPTS {
            let entry = worker.store.get_cert_queue_entry("app.example.com").unwrap();
            worker.attempt(entry).await;
        }

        assert!(worker.store.get_cert_queue_entry("app.example.com").is_none());
    }

    #[tokio::test]
    async fn renewal_sweep_is_a_noop_when_nothing_needs_renewal() {
        let temp = TempDir::new().unwrap();
        let worker = worker(&temp);
        worker
            .cert_manager
            .store_issued("app.example.com", b"fake cert", b"fake key")
            .unwrap();

        // the fake cert above can't be parsed for an expiry, so it never
        // shows up in `needing_renewal` and the sweep touches nothing.
        worker.sweep_renewals("ops@example.com").await;

        assert!(worker.store.get_cert_queue_entry("app.example.com").is_none());
    }

    #[tokio::test]
    async fn publishes_retry_scheduled_event_before_giving_up() {
        let temp = TempDir::new().unwrap();
        let worker = worker(&temp);
        let mut rx = worker.events.subscribe();
        worker.enqueue("app.example.com", "ops@example.com");

        let entry = worker.store.get_cert_queue_entry("app.example.com").unwrap();
        worker.attempt(entry).await;

        let event = rx.recv().await.unwrap();
        assert!(matches!(event, DeploymentEvent::CertificateRetryScheduled { .. }));
    }
}
