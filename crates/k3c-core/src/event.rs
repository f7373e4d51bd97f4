//! Structured cluster events.
//!
//! The core emits events over a broadcast bus; a sink (CLI output, log
//! shipper) subscribes and adapts them. Nothing in the core blocks on
//! delivery.

use k3c_types::Role;
use tokio::sync::broadcast;

/// Orchestration events.
#[derive(Debug, Clone)]
pub enum Event {
    /// Cluster create started.
    ClusterCreating { cluster: String },
    /// Cluster create finished successfully.
    ClusterCreated { cluster: String },
    /// Cluster deleted.
    ClusterDeleted { cluster: String },
    /// Node container created.
    NodeCreated {
        cluster: String,
        node: String,
        role: Role,
    },
    /// Node started.
    NodeStarted { cluster: String, node: String },
    /// Node passed its readiness probe.
    NodeReady { cluster: String, node: String },
    /// Node removed.
    NodeDeleted { cluster: String, node: String },
    /// A lifecycle hook failed but the run continues.
    HookWarning {
        node: String,
        description: String,
        message: String,
    },
    /// Load balancer configuration delivered and reloaded.
    LbConfigUpdated { cluster: String },
    /// Registry container created.
    RegistryCreated { registry: String },
    /// Rollback of a failed operation started.
    RollbackStarted { cluster: String },
    /// Rollback finished; `clean` is false when objects leaked.
    RollbackFinished { cluster: String, clean: bool },
}

/// Event bus for orchestration events.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<Event>,
}

impl EventBus {
    /// Creates a new event bus.
    #[must_use]
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(256);
        Self { sender }
    }

    /// Publishes an event. Never blocks; events without subscribers drop.
    pub fn publish(&self, event: Event) {
        let _ = self.sender.send(event);
    }

    /// Subscribes to events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_subscribe() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.publish(Event::ClusterCreated {
            cluster: "dev".to_string(),
        });
        match rx.recv().await.unwrap() {
            Event::ClusterCreated { cluster } => assert_eq!(cluster, "dev"),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn test_publish_without_subscribers_is_fine() {
        let bus = EventBus::new();
        bus.publish(Event::ClusterDeleted {
            cluster: "gone".to_string(),
        });
    }
}
