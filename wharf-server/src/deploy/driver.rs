//! Container driver abstraction (§4.3, §7).
//!
//! The controller never shells out to a container runtime directly — it
//! goes through this narrow trait so the blue-green state machine can be
//! exercised with a deterministic in-memory driver. A real Docker/Podman
//! implementation is out of scope here; only the seam and the test double
//! live in this crate.

use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerStatus {
    Running,
    Stopped,
}

#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    #[error("container {0} already exists")]
    AlreadyExists(String),
    #[error("container {0} not found")]
    NotFound(String),
    #[error("driver failed to start container {0}: {1}")]
    StartFailed(String, String),
}

/// Capability a container runtime must provide for the controller to drive
/// a blue-green rollout. `start` returns the resolved network target the
/// proxy should route to once the container is up.
#[async_trait]
pub trait ContainerDriver: Send + Sync {
    async fn start(
        &self,
        name: &str,
        image: &str,
        env: &HashMap<String, String>,
    ) -> Result<String, DriverError>;

    async fn stop(&self, name: &str) -> Result<(), DriverError>;

    async fn exists(&self, name: &str) -> bool;

    async fn inspect(&self, name: &str) -> Option<ContainerStatus>;
}

struct MockContainer {
    target: String,
    status: ContainerStatus,
}

/// Deterministic driver for tests and for running the daemon without a real
/// container runtime wired in. `start` resolves to the `image` argument
/// verbatim — callers that pass an already-resolved `host:port` as the
/// deploy target get that same address back as the route target.
#[derive(Default)]
pub struct MockDriver {
    containers: DashMap<String, MockContainer>,
}

impl MockDriver {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ContainerDriver for MockDriver {
    async fn start(
        &self,
        name: &str,
        image: &str,
        _env: &HashMap<String, String>,
    ) -> Result<String, DriverError> {
        if let Some(existing) = self.containers.get(name)
            && existing.status == ContainerStatus::Running
        {
            return Err(DriverError::AlreadyExists(name.to_string()));
        }
        self.containers.insert(
            name.to_string(),
            MockContainer {
                target: image.to_string(),
                status: ContainerStatus::Running,
            },
        );
        Ok(image.to_string())
    }

    async fn stop(&self, name: &str) -> Result<(), DriverError> {
        match self.containers.get_mut(name) {
            Some(mut entry) => {
                entry.status = ContainerStatus::Stopped;
                Ok(())
            }
            None => Err(DriverError::NotFound(name.to_string())),
        }
    }

    async fn exists(&self, name: &str) -> bool {
        self.containers.contains_key(name)
    }

    async fn inspect(&self, name: &str) -> Option<ContainerStatus> {
        self.containers.get(name).map(|c| c.status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn start_resolves_to_the_image_argument() {
        let driver = MockDriver::new();
        let target = driver
            .start("app-blue", "10.0.0.5:4000", &HashMap::new())
            .await
            .unwrap();
        assert_eq!(target, "10.0.0.5:4000");
    }

    #[tokio::test]
    async fn start_twice_with_same_name_fails() {
        let driver = MockDriver::new();
        driver.start("app-blue", "x", &HashMap::new()).await.unwrap();
        let err = driver.start("app-blue", "x", &HashMap::new()).await;
        assert!(matches!(err, Err(DriverError::AlreadyExists(_))));
    }

    #[tokio::test]
    async fn stop_marks_container_stopped() {
        let driver = MockDriver::new();
        driver.start("app-blue", "x", &HashMap::new()).await.unwrap();
        driver.stop("app-blue").await.unwrap();
        assert_eq!(driver.inspect("app-blue").await, Some(ContainerStatus::Stopped));
    }

    #[tokio::test]
    async fn stop_unknown_container_fails() {
        let driver = MockDriver::new();
        let err = driver.stop("ghost").await;
        assert!(matches!(err, Err(DriverError::NotFound(_))));
    }

    #[tokio::test]
    async fn start_after_stop_with_same_name_replaces_container() {
        let driver = MockDriver::new();
        driver.start("app-blue", "x", &HashMap::new()).await.unwrap();
        driver.stop("app-blue").await.unwrap();
        let target = driver
            .start("app-blue", "y", &HashMap::new())
            .await
            .unwrap();
        assert_eq!(target, "y");
        assert_eq!(driver.inspect("app-blue").await, Some(ContainerStatus::Running));
    }

    #[tokio::test]
    async fn exists_reflects_started_containers() {
        let driver = MockDriver::new();
        assert!(!driver.exists("app-blue").await);
        driver.start("app-blue", "x", &HashMap::new()).await.unwrap();
        assert!(driver.exists("app-blue").await);
    }
}
