//! Steady-state health checker (§4.5).
//!
//! Separate from the deploy-time polling in [`crate::deploy::controller`]:
//! this runs continuously against every route already serving traffic and
//! only ever flips a binary healthy/unhealthy flag — there is no dead or
//! stopped state here, and no consecutive-failure threshold. A single
//! failed probe flips the flag; a single successful probe flips it back.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::Mutex;
use tokio::time::interval;

use crate::defaults;
use crate::events::{DeploymentEvent, EventBus};
use crate::store::Store;

pub struct HealthChecker {
    store: Arc<Store>,
    events: Arc<EventBus>,
    http: reqwest::Client,
    check_interval: Duration,
    /// Per-host try-lock so a slow probe never blocks the scan loop from
    /// moving on to the next host.
    probing: DashMap<String, Arc<Mutex<()>>>,
}

impl HealthChecker {
    pub fn new(store: Arc<Store>, events: Arc<EventBus>) -> Self {
        Self::with_interval(store, events, defaults::HEALTH_CHECK_INTERVAL)
    }

    pub fn with_interval(store: Arc<Store>, events: Arc<EventBus>, check_interval: Duration) -> Self {
        let http = reqwest::Client::builder()
            .no_proxy()
            .timeout(defaults::HEALTH_PROBE_TIMEOUT)
            .build()
            .expect("failed to build health-probe http client");
        Self {
            store,
            events,
            http,
            check_interval,
            probing: DashMap::new(),
        }
    }

    /// Run the scan loop forever. Intended to be spawned as a background
    /// task for the lifetime of the daemon.
    pub async fn run(self: Arc<Self>) {
        let mut ticker = interval(self.check_interval);
        loop {
            ticker.tick().await;
            let routes = self.store.list_routes();
            for route in routes {
                let checker = self.clone();
                tokio::spawn(async move {
                    checker.probe_route(&route.host, &route.target, &route.health_path).await;
                });
            }
        }
    }

    async fn probe_route(&self, host: &str, target: &str, health_path: &str) {
        let lock = self
            .probing
            .entry(host.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let Ok(_guard) = lock.try_lock() else {
            // A probe for this host is already in flight; skip this tick.
            return;
        };

        let healthy = self.probe_once(target, health_path).await;
        if self.store.update_health(host, healthy) {
            tracing::info!(host, healthy, "route health changed");
            self.events.publish(DeploymentEvent::HealthChanged {
                host: host.to_string(),
                healthy,
            });
        }
    }

    async fn probe_once(&self, target: &str, health_path: &str) -> bool {
        let url = format!("http://{target}{health_path}");
        match self.http.get(&url).send().await {
            Ok(resp) => resp.status().is_success(),
            Err(_) => false,
        }
    }
}
