//! In-process publish/subscribe for deployment lifecycle events.
//!
//! Purely for observability: nothing in the controller depends on whether
//! anyone is subscribed. Broadcast so more than one observer (a log
//! sink, a status endpoint, a test) can watch the same stream.

use tokio::sync::broadcast;

const CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq)]
pub enum DeploymentEvent {
    DeploymentStarted {
        host: String,
        color: &'static str,
    },
    DeploymentFailed {
        host: String,
        reason: String,
    },
    TrafficSwitched {
        host: String,
        target: String,
    },
    DeploymentCompleted {
        host: String,
    },
    HostRemoved {
        host: String,
    },
    HealthChanged {
        host: String,
        healthy: bool,
    },
    CertificateIssued {
        host: String,
    },
    CertificateRetryScheduled {
        host: String,
        attempts: u32,
    },
    CertificateAbandoned {
        host: String,
    },
}

pub struct EventBus {
    tx: broadcast::Sender<DeploymentEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(CHANNEL_CAPACITY);
        Self { tx }
    }

    /// Publish an event. A lack of subscribers is not an error.
    pub fn publish(&self, event: DeploymentEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DeploymentEvent> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_published_events() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        bus.publish(DeploymentEvent::DeploymentCompleted {
            host: "example.com".to_string(),
        });

        let event = rx.recv().await.unwrap();
        assert_eq!(
            event,
            DeploymentEvent::DeploymentCompleted {
                host: "example.com".to_string()
            }
        );
    }

    #[test]
    fn publishing_without_subscribers_does_not_panic() {
        let bus = EventBus::new();
        bus.publish(DeploymentEvent::HostRemoved {
            host: "example.com".to_string(),
        });
    }

    #[tokio::test]
    async fn multiple_subscribers_each_get_a_copy() {
        let bus = EventBus::new();
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();

        bus.publish(DeploymentEvent::HealthChanged {
            host: "h".to_string(),
            healthy: false,
        });

        assert_eq!(a.recv().await.unwrap(), b.recv().await.unwrap());
    }
}
