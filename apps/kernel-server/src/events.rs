// [[AXON]]/apps/kernel-server/src/events.rs
// Purpose: In-process domain event bus feeding session notifications.
// Architecture: Domain Event Layer
// Dependencies: Serde, Chrono, Uuid, tokio broadcast

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EventTopic {
    /// Task status transitions
    Task,
    /// Workflow execution progress
    Workflow,
    /// Shared document operations
    Document,
    /// Agent registration / heartbeat changes
    Agent,
    /// Gateway lifecycle (drain, shutdown)
    System,
}

impl EventTopic {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventTopic::Task => "task",
            EventTopic::Workflow => "workflow",
            EventTopic::Document => "document",
            EventTopic::Agent => "agent",
            EventTopic::System => "system",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainEvent {
    pub id: String,
    /// None for system-wide events (shutdown); sessions only receive
    /// tenant-scoped events for their own tenant.
    pub tenant_id: Option<Uuid>,
    pub topic: EventTopic,
    pub kind: String,
    pub payload: Value,
    pub timestamp: String,
}

impl DomainEvent {
    pub fn new(tenant_id: Option<Uuid>, topic: EventTopic, kind: &str, payload: Value) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            tenant_id,
            topic,
            kind: kind.to_string(),
            payload,
            timestamp: Utc::now().to_rfc3339(),
        }
    }
}

/// Broadcast bus. Subscribers (session writer pumps, the workflow executor
/// waiting on task completion) filter by tenant and topic on their side.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<DomainEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        EventBus { tx }
    }

    pub fn publish(&self, event: DomainEvent) {
        // No receivers is normal during boot and shutdown.
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DomainEvent> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn publish_reaches_subscribers() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();
        let tenant = Uuid::new_v4();
        bus.publish(DomainEvent::new(
            Some(tenant),
            EventTopic::Task,
            "task.status",
            json!({"status": "running"}),
        ));
        let event = rx.recv().await.unwrap();
        assert_eq!(event.tenant_id, Some(tenant));
        assert_eq!(event.topic, EventTopic::Task);
        assert_eq!(event.kind, "task.status");
    }

    #[tokio::test]
    async fn publish_without_subscribers_does_not_error() {
        let bus = EventBus::new(4);
        bus.publish(DomainEvent::new(None, EventTopic::System, "noop", json!({})));
    }
}
