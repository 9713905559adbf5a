//! Blue-green deployment controller (§4.3).
//!
//! Exactly one of a hostname's two container slots serves traffic at a
//! time. A deploy starts the idle slot, polls it healthy, then flips the
//! `Route` to the new target in a single store write so no request is ever
//! routed to a half-started backend. Deploys to the same hostname are
//! serialized through a per-hostname lock; deploys to different hostnames
//! run fully concurrently.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::Mutex;

use wharf_core::{ActiveColor, Color, ContainerDescriptor, Deployment, HealthState, Route};

use crate::defaults;
use crate::deploy::driver::{ContainerDriver, DriverError};
use crate::events::{DeploymentEvent, EventBus};
use crate::routing::normalize_host;
use crate::store::Store;

#[derive(Debug, thiserror::Error)]
pub enum DeployError {
    #[error("no deployment exists for this host")]
    NotFound,
    #[error("container driver error: {0}")]
    Driver(#[from] DriverError),
    #[error("new container never became healthy within the poll budget")]
    HealthCheckFailed,
}

/// Timing knobs pulled out of [`crate::defaults`] so tests can run the same
/// state machine on a much shorter clock.
#[derive(Debug, Clone)]
pub struct ControllerTiming {
    pub poll_initial_backoff: Duration,
    pub poll_backoff_factor: f64,
    pub poll_backoff_cap: Duration,
    pub poll_total_budget: Duration,
    pub poll_consecutive_successes: u32,
    pub drain_budget: Duration,
}

impl Default for ControllerTiming {
    fn default() -> Self {
        Self {
            poll_initial_backoff: defaults::DEPLOY_POLL_INITIAL_BACKOFF,
            poll_backoff_factor: defaults::DEPLOY_POLL_BACKOFF_FACTOR,
            poll_backoff_cap: defaults::DEPLOY_POLL_BACKOFF_CAP,
            poll_total_budget: defaults::DEPLOY_POLL_TOTAL_BUDGET,
            poll_consecutive_successes: defaults::DEPLOY_POLL_CONSECUTIVE_SUCCESSES,
            drain_budget: defaults::REMOVE_DRAIN_BUDGET,
        }
    }
}

fn active_slot(active: ActiveColor) -> Option<Color> {
    match active {
        ActiveColor::Blue => Some(Color::Blue),
        ActiveColor::Green => Some(Color::Green),
        ActiveColor::None => None,
    }
}

fn now_unix() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

pub struct Controller {
    store: Arc<Store>,
    driver: Arc<dyn ContainerDriver>,
    events: Arc<EventBus>,
    http: reqwest::Client,
    timing: ControllerTiming,
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl Controller {
    pub fn new(store: Arc<Store>, driver: Arc<dyn ContainerDriver>, events: Arc<EventBus>) -> Self {
        Self::with_timing(store, driver, events, ControllerTiming::default())
    }

    pub fn with_timing(
        store: Arc<Store>,
        driver: Arc<dyn ContainerDriver>,
        events: Arc<EventBus>,
        timing: ControllerTiming,
    ) -> Self {
        let http = reqwest::Client::builder()
            .no_proxy()
            .timeout(defaults::HEALTH_PROBE_TIMEOUT)
            .build()
            .expect("failed to build health-probe http client");
        Self {
            store,
            driver,
            events,
            http,
            timing,
            locks: DashMap::new(),
        }
    }

    fn lock_for(&self, host: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(host.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Start the idle color, wait for it to pass health checks, then
    /// atomically switch traffic to it. Leaves the active route untouched
    /// if the new container never becomes healthy.
    pub async fn deploy(
        &self,
        host: &str,
        target: &str,
        project: &str,
        health_path: &str,
    ) -> Result<Route, DeployError> {
        let host = normalize_host(host);
        let lock = self.lock_for(&host);
        let _guard = lock.lock().await;

        let mut deployment = self.store.get_deployment(&host).unwrap_or_else(|| Deployment {
            id: wharf_core::sanitize_for_dns(&host),
            host: host.clone(),
            blue: ContainerDescriptor::empty(format!("{}-blue", wharf_core::sanitize_for_dns(&host)), health_path.to_string()),
            green: ContainerDescriptor::empty(format!("{}-green", wharf_core::sanitize_for_dns(&host)), health_path.to_string()),
            active: ActiveColor::None,
            updated_at: now_unix(),
        });

        let idle_color = match active_slot(deployment.active) {
            Some(active) => active.opposite(),
            None => Color::Blue,
        };
        let container_name = deployment.descriptor(idle_color).name.clone();

        self.events.publish(DeploymentEvent::DeploymentStarted {
            host: host.clone(),
            color: idle_color.as_str(),
        });

        if self.driver.exists(&container_name).await {
            self.driver.stop(&container_name).await?;
        }
        let resolved_target = self
            .driver
            .start(&container_name, target, &HashMap::new())
            .await?;

        {
            let descriptor = deployment.descriptor_mut(idle_color);
            descriptor.target = Some(resolved_target.clone());
            descriptor.health_path = health_path.to_string();
            descriptor.health_state = HealthState::Checking;
            descriptor.started_at = Some(now_unix());
        }
        self.store.upsert_deployment(deployment.clone());

        if !self.wait_until_healthy(&resolved_target, health_path).await {
            let _ = self.driver.stop(&container_name).await;
            {
                let descriptor = deployment.descriptor_mut(idle_color);
                descriptor.health_state = HealthState::Unhealthy;
                descriptor.target = None;
            }
            self.store.upsert_deployment(deployment);
            self.events.publish(DeploymentEvent::DeploymentFailed {
                host: host.clone(),
                reason: "new container failed to become healthy".to_string(),
            });
            return Err(DeployError::HealthCheckFailed);
        }

        let previous_active = active_slot(deployment.active);
        {
            let descriptor = deployment.descriptor_mut(idle_color);
            descriptor.health_state = HealthState::Healthy;
        }
        deployment.active = idle_color.into();
        deployment.updated_at = now_unix();
        self.store.upsert_deployment(deployment.clone());

        let route = Route {
            host: host.clone(),
            target: resolved_target.clone(),
            health_path: health_path.to_string(),
            healthy: true,
            project: project.to_string(),
            updated_at: now_unix(),
        };
        self.store.upsert_route(route.clone());

        self.events.publish(DeploymentEvent::TrafficSwitched {
            host: host.clone(),
            target: resolved_target,
        });
        self.events
            .publish(DeploymentEvent::DeploymentCompleted { host: host.clone() });

        if let Some(previous_color) = previous_active {
            self.drain_and_stop(&host, &deployment, previous_color).await;
        }

        Ok(route)
    }

    /// Stop both slots' containers (after a drain pause) and forget the
    /// deployment and its route entirely.
    pub async fn remove(&self, host: &str) -> Result<(), DeployError> {
        let host = normalize_host(host);
        let lock = self.lock_for(&host);
        let _guard = lock.lock().await;

        let deployment = self.store.get_deployment(&host).ok_or(DeployError::NotFound)?;
        self.store.delete_route(&host);
        self.events
            .publish(DeploymentEvent::HostRemoved { host: host.clone() });

        tokio::time::sleep(self.timing.drain_budget).await;

        for color in [Color::Blue, Color::Green] {
            let descriptor = deployment.descriptor(color);
            if self.driver.exists(&descriptor.name).await {
                let _ = self.driver.stop(&descriptor.name).await;
            }
        }
        self.store.delete_deployment(&host);
        Ok(())
    }

    async fn drain_and_stop(&self, host: &str, deployment: &Deployment, color: Color) {
        let descriptor = deployment.descriptor(color).clone();
        if descriptor.target.is_none() {
            return;
        }
        tracing::debug!(host, color = color.as_str(), name = %descriptor.name, "draining previous slot");
        tokio::time::sleep(self.timing.drain_budget).await;
        if let Err(e) = self.driver.stop(&descriptor.name).await {
            tracing::warn!(host, name = %descriptor.name, error = %e, "failed to stop drained container");
        }
    }

    async fn wait_until_healthy(&self, target: &str, health_path: &str) -> bool {
        let start = Instant::now();
        let mut backoff = self.timing.poll_initial_backoff;
        let mut consecutive = 0u32;

        loop {
            if start.elapsed() >= self.timing.poll_total_budget {
                return false;
            }
            if self.probe_once(target, health_path).await {
                consecutive += 1;
                if consecutive >= self.timing.poll_consecutive_successes {
                    return true;
                }
            } else {
                consecutive = 0;
            }
            tokio::time::sleep(backoff).await;
            backoff = backoff
                .mul_f64(self.timing.poll_backoff_factor)
                .min(self.timing.poll_backoff_cap);
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deploy::driver::MockDriver;
    use tempfile::TempDir;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    async fn spawn_ok_backend() -> String {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((mut sock, _)) = listener.accept().await else {
                    break;
                };
                let _ = sock
                    .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok")
                    .await;
            }
        });
        addr.to_string()
    }

    fn fast_timing() -> ControllerTiming {
        ControllerTiming {
            poll_initial_backoff: Duration::from_millis(5),
            poll_backoff_factor: 1.0,
            poll_backoff_cap: Duration::from_millis(5),
            poll_total_budget: Duration::from_secs(2),
            poll_consecutive_successes: 2,
            drain_budget: Duration::from_millis(1),
        }
    }

    fn make_controller() -> (Controller, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = Store::open(dir.path()).unwrap();
        let driver: Arc<dyn ContainerDriver> = Arc::new(MockDriver::new());
        let events = Arc::new(EventBus::new());
        (Controller::with_timing(store, driver, events, fast_timing()), dir)
    }

    #[tokio::test]
    async fn first_deploy_starts_blue_and_switches_traffic() {
        let (controller, _dir) = make_controller();
        let backend = spawn_ok_backend().await;

        let route = controller
            .deploy("App.Example.com", &backend, "demo", "/up")
            .await
            .unwrap();

        assert_eq!(route.host, "app.example.com");
        assert_eq!(route.target, backend);
        assert!(route.healthy);

        let deployment = controller.store.get_deployment("app.example.com").unwrap();
        assert_eq!(deployment.active, ActiveColor::Blue);
    }

    #[tokio::test]
    async fn second_deploy_switches_to_green_and_leaves_route_pointing_there() {
        let (controller, _dir) = make_controller();
        let first_backend = spawn_ok_backend().await;
        let second_backend = spawn_ok_backend().await;

        controller
            .deploy("app.example.com", &first_backend, "demo", "/up")
            .await
            .unwrap();
        let route = controller
            .deploy("app.example.com", &second_backend, "demo", "/up")
            .await
            .unwrap();

        assert_eq!(route.target, second_backend);
        let deployment = controller.store.get_deployment("app.example.com").unwrap();
        assert_eq!(deployment.active, ActiveColor::Green);
    }

    #[tokio::test]
    async fn third_deploy_reuses_the_stopped_blue_slot() {
        let (controller, _dir) = make_controller();
        let first_backend = spawn_ok_backend().await;
        let second_backend = spawn_ok_backend().await;
        let third_backend = spawn_ok_backend().await;

        controller
            .deploy("app.example.com", &first_backend, "demo", "/up")
            .await
            .unwrap();
        controller
            .deploy("app.example.com", &second_backend, "demo", "/up")
            .await
            .unwrap();
        let route = controller
            .deploy("app.example.com", &third_backend, "demo", "/up")
            .await
            .unwrap();

        assert_eq!(route.target, third_backend);
        let deployment = controller.store.get_deployment("app.example.com").unwrap();
        assert_eq!(deployment.active, ActiveColor::Blue);
    }

    #[tokio::test]
    async fn failed_health_check_leaves_existing_route_untouched() {
        let (controller, _dir) = make_controller();
        let good_backend = spawn_ok_backend().await;

        controller
            .deploy("app.example.com", &good_backend, "demo", "/up")
            .await
            .unwrap();

        // unreachable address: the probe will fail until the poll budget expires.
        let err = controller
            .deploy("app.example.com", "127.0.0.1:1", "demo", "/up")
            .await;

        assert!(matches!(err, Err(DeployError::HealthCheckFailed)));
        let route = controller.store.get_route("app.example.com").unwrap();
        assert_eq!(route.target, good_backend);
    }

    #[tokio::test]
    async fn remove_deletes_route_and_deployment() {
        let (controller, _dir) = make_controller();
        let backend = spawn_ok_backend().await;
        controller
            .deploy("app.example.com", &backend, "demo", "/up")
            .await
            .unwrap();

        controller.remove("app.example.com").await.unwrap();

        assert!(controller.store.get_route("app.example.com").is_none());
        assert!(controller.store.get_deployment("app.example.com").is_none());
    }

    #[tokio::test]
    async fn remove_unknown_host_fails() {
        let (controller, _dir) = make_controller();
        let err = controller.remove("ghost.example.com").await;
        assert!(matches!(err, Err(DeployError::NotFound)));
    }
}
