//! Persistent, concurrent-safe state for routes, deployments, and the
//! certificate retry queue (§3, §4.1).
//!
//! A single `RwLock`-guarded in-memory structure is the source of truth;
//! every mutation is mirrored to disk as an atomically-written JSON
//! snapshot, debounced to coalesce bursts of writes into one file write.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Notify;

use wharf_core::{CertQueueEntry, Deployment, Route};

use crate::defaults::SNAPSHOT_DEBOUNCE;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct RouteSnapshot {
    routes: HashMap<String, Route>,
    deployments: HashMap<String, Deployment>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct CertQueueSnapshot {
    entries: HashMap<String, CertQueueEntry>,
}

#[derive(Debug, Default)]
struct StoreState {
    routes: HashMap<String, Route>,
    deployments: HashMap<String, Deployment>,
    cert_queue: HashMap<String, CertQueueEntry>,
}

/// The readers-writer-locked state store described in §4.1.
pub struct Store {
    state: RwLock<StoreState>,
    state_path: PathBuf,
    cert_queue_path: PathBuf,
    state_dirty: Notify,
    cert_queue_dirty: Notify,
    state_writes_failed: AtomicBool,
}

fn now_unix() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

impl Store {
    /// Load the on-disk snapshots under `state_dir`, or start empty if they
    /// are missing or malformed — the store never aborts startup over a bad
    /// snapshot, it only logs a warning.
    pub fn open(state_dir: &Path) -> io::Result<Arc<Store>> {
        std::fs::create_dir_all(state_dir)?;
        let state_path = state_dir.join("state.json");
        let cert_queue_path = state_dir.join("cert-queue.json");

        let route_snapshot = load_snapshot::<RouteSnapshot>(&state_path);
        let cert_snapshot = load_snapshot::<CertQueueSnapshot>(&cert_queue_path);

        let store = Arc::new(Store {
            state: RwLock::new(StoreState {
                routes: route_snapshot.routes,
                deployments: route_snapshot.deployments,
                cert_queue: cert_snapshot.entries,
            }),
            state_path,
            cert_queue_path,
            state_dirty: Notify::new(),
            cert_queue_dirty: Notify::new(),
            state_writes_failed: AtomicBool::new(false),
        });

        store.clone().spawn_writers();
        Ok(store)
    }

    fn spawn_writers(self: Arc<Self>) {
        let state_writer = self.clone();
        tokio::spawn(async move {
            loop {
                state_writer.state_dirty.notified().await;
                tokio::time::sleep(SNAPSHOT_DEBOUNCE).await;
                state_writer.flush_state();
            }
        });

        let cert_writer = self.clone();
        tokio::spawn(async move {
            loop {
                cert_writer.cert_queue_dirty.notified().await;
                tokio::time::sleep(SNAPSHOT_DEBOUNCE).await;
                cert_writer.flush_cert_queue();
            }
        });
    }

    fn flush_state(&self) {
        let snapshot = {
            let state = self.state.read();
            RouteSnapshot {
                routes: state.routes.clone(),
                deployments: state.deployments.clone(),
            }
        };
        if let Err(e) = write_snapshot_atomic(&self.state_path, &snapshot) {
            tracing::warn!(error = %e, path = %self.state_path.display(), "failed to write state snapshot");
            self.state_writes_failed.store(true, Ordering::Relaxed);
        } else {
            self.state_writes_failed.store(false, Ordering::Relaxed);
        }
    }

    fn flush_cert_queue(&self) {
        let snapshot = {
            let state = self.state.read();
            CertQueueSnapshot {
                entries: state.cert_queue.clone(),
            }
        };
        if let Err(e) = write_snapshot_atomic(&self.cert_queue_path, &snapshot) {
            tracing::warn!(error = %e, path = %self.cert_queue_path.display(), "failed to write cert queue snapshot");
        }
    }

    /// True if the most recent attempt to write the route/deployment
    /// snapshot failed. In-memory state remains authoritative regardless.
    pub fn last_state_write_failed(&self) -> bool {
        self.state_writes_failed.load(Ordering::Relaxed)
    }

    pub fn get_route(&self, host: &str) -> Option<Route> {
        self.state.read().routes.get(host).cloned()
    }

    pub fn list_routes(&self) -> Vec<Route> {
        self.state.read().routes.values().cloned().collect()
    }

    /// Replace the route entry wholesale — never mutated field-by-field, so
    /// no reader ever observes a half-updated route (§4.3 ordering
    /// guarantee).
    pub fn upsert_route(&self, route: Route) {
        self.state.write().routes.insert(route.host.clone(), route);
        self.state_dirty.notify_one();
    }

    pub fn delete_route(&self, host: &str) {
        self.state.write().routes.remove(host);
        self.state_dirty.notify_one();
    }

    /// Fast path used by the health checker: snapshot only if the flag
    /// actually flipped.
    pub fn update_health(&self, host: &str, healthy: bool) -> bool {
        let mut state = self.state.write();
        let Some(route) = state.routes.get_mut(host) else {
            return false;
        };
        if route.healthy == healthy {
            return false;
        }
        route.healthy = healthy;
        route.updated_at = now_unix();
        drop(state);
        self.state_dirty.notify_one();
        true
    }

    pub fn get_deployment(&self, host: &str) -> Option<Deployment> {
        self.state.read().deployments.get(host).cloned()
    }

    pub fn upsert_deployment(&self, deployment: Deployment) {
        self.state
            .write()
            .deployments
            .insert(deployment.host.clone(), deployment);
        self.state_dirty.notify_one();
    }

    pub fn delete_deployment(&self, host: &str) {
        self.state.write().deployments.remove(host);
        self.state_dirty.notify_one();
    }

    pub fn get_cert_queue_entry(&self, host: &str) -> Option<CertQueueEntry> {
        self.state.read().cert_queue.get(host).cloned()
    }

    pub fn list_cert_queue_entries(&self) -> Vec<CertQueueEntry> {
        self.state.read().cert_queue.values().cloned().collect()
    }

    pub fn upsert_cert_queue_entry(&self, entry: CertQueueEntry) {
        self.state
            .write()
            .cert_queue
            .insert(entry.host.clone(), entry);
        self.cert_queue_dirty.notify_one();
    }

    pub fn remove_cert_queue_entry(&self, host: &str) {
        self.state.write().cert_queue.remove(host);
        self.cert_queue_dirty.notify_one();
    }

    /// Force an immediate (non-debounced) flush of both snapshots. Used on
    /// graceful shutdown.
    pub fn flush_now(&self) {
        self.flush_state();
        self.flush_cert_queue();
    }
}

fn load_snapshot<T: Default + for<'de> Deserialize<'de>>(path: &Path) -> T {
    match std::fs::read_to_string(path) {
        Ok(contents) => match serde_json::from_str(&contents) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "snapshot is malformed, starting empty");
                T::default()
            }
        },
        Err(e) if e.kind() == io::ErrorKind::NotFound => T::default(),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "failed to read snapshot, starting empty");
            T::default()
        }
    }
}

fn write_snapshot_atomic<T: Serialize>(path: &Path, value: &T) -> io::Result<()> {
    let tmp_path = path.with_extension("json.tmp");
    let json = serde_json::to_vec_pretty(value)?;
    {
        let mut file = std::fs::File::create(&tmp_path)?;
        std::io::Write::write_all(&mut file, &json)?;
        file.sync_all()?;
    }
    std::fs::rename(&tmp_path, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn route(host: &str, target: &str, healthy: bool) -> Route {
        Route {
            host: host.to_string(),
            target: target.to_string(),
            health_path: "/up".to_string(),
            healthy,
            project: "demo".to_string(),
            updated_at: 0,
        }
    }

    #[tokio::test]
    async fn starts_empty_when_no_snapshot_exists() {
        let dir = TempDir::new().unwrap();
        let store = Store::open(dir.path()).unwrap();
        assert!(store.list_routes().is_empty());
    }

    #[tokio::test]
    async fn starts_empty_and_warns_on_malformed_snapshot() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("state.json"), b"{not json}").unwrap();
        let store = Store::open(dir.path()).unwrap();
        assert!(store.list_routes().is_empty());
    }

    #[tokio::test]
    async fn upsert_and_get_route_round_trip() {
        let dir = TempDir::new().unwrap();
        let store = Store::open(dir.path()).unwrap();
        store.upsert_route(route("a.example.com", "10.0.0.1:3000", true));

        let got = store.get_route("a.example.com").unwrap();
        assert_eq!(got.target, "10.0.0.1:3000");
        assert!(got.healthy);
    }

    #[tokio::test]
    async fn delete_route_removes_it() {
        let dir = TempDir::new().unwrap();
        let store = Store::open(dir.path()).unwrap();
        store.upsert_route(route("a.example.com", "10.0.0.1:3000", true));
        store.delete_route("a.example.com");
        assert!(store.get_route("a.example.com").is_none());
    }

    #[tokio::test]
    async fn update_health_returns_false_when_flag_unchanged() {
        let dir = TempDir::new().unwrap();
        let store = Store::open(dir.path()).unwrap();
        store.upsert_route(route("a.example.com", "10.0.0.1:3000", true));
        assert!(!store.update_health("a.example.com", true));
        assert!(store.update_health("a.example.com", false));
        assert!(!store.get_route("a.example.com").unwrap().healthy);
    }

    #[tokio::test]
    async fn snapshot_round_trips_across_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let store = Store::open(dir.path()).unwrap();
            store.upsert_route(route("a.example.com", "10.0.0.1:3000", true));
            store.flush_now();
        }

        let reopened = Store::open(dir.path()).unwrap();
        let got = reopened.get_route("a.example.com").unwrap();
        assert_eq!(got.target, "10.0.0.1:3000");
    }

    #[tokio::test]
    async fn cert_queue_entries_persist_independently_of_state_json() {
        let dir = TempDir::new().unwrap();
        let store = Store::open(dir.path()).unwrap();
        store.upsert_cert_queue_entry(CertQueueEntry {
            host: "new.example.com".to_string(),
            contact_email: "ops@example.com".to_string(),
            added_at: 0,
            last_attempt_at: 0,
            attempts: 1,
        });
        store.flush_now();

        assert!(dir.path().join("cert-queue.json").exists());
        let reopened = Store::open(dir.path()).unwrap();
        let entry = reopened.get_cert_queue_entry("new.example.com").unwrap();
        assert_eq!(entry.attempts, 1);
    }

    #[tokio::test]
    async fn debounced_writes_eventually_land_on_disk() {
        let dir = TempDir::new().unwrap();
        let store = Store::open(dir.path()).unwrap();
        store.upsert_route(route("a.example.com", "10.0.0.1:3000", true));

        tokio::time::sleep(SNAPSHOT_DEBOUNCE * 3).await;
        let contents = std::fs::read_to_string(dir.path().join("state.json")).unwrap();
        assert!(contents.contains("a.example.com"));
    }
}
