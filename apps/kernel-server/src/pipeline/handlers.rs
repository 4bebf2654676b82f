// [[AXON]]/apps/kernel-server/src/pipeline/handlers.rs
// Purpose: Built-in stream event handlers.
// Architecture: Event Pipeline Layer
// Dependencies: async-trait

use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use std::sync::Arc;
use uuid::Uuid;

use super::consumer::EventHandler;
use crate::assignment::AssignmentEngine;
use crate::error::KernelError;
use crate::events::{DomainEvent, EventBus, EventTopic};
use crate::models::{EventRecord, Task, TaskPriority, TaskStatus};
use crate::repo::Repositories;

/// Fallback handler: forward the record onto the in-process bus so any
/// subscribed session sees it. Re-publishing the same record twice is
/// harmless, which keeps the at-least-once contract honest.
pub struct BusForwarder {
    pub events: EventBus,
}

#[async_trait]
impl EventHandler for BusForwarder {
    async fn handle(&self, record: &EventRecord) -> Result<(), KernelError> {
        self.events.publish(DomainEvent::new(
            Some(record.tenant_id),
            EventTopic::System,
            &format!("webhook.{}", record.event_type),
            json!({
                "event_id": record.id,
                "payload": record.payload,
                "first_seen_at": record.first_seen_at,
            }),
        ));
        Ok(())
    }
}

/// `task.requested` events create and route a task. The event id doubles
/// as the idempotency key, so a redelivered record cannot create a second
/// row.
pub struct TaskRequestHandler {
    pub repos: Repositories,
    pub engine: Arc<AssignmentEngine>,
}

#[async_trait]
impl EventHandler for TaskRequestHandler {
    async fn handle(&self, record: &EventRecord) -> Result<(), KernelError> {
        let task_type = record
            .payload
            .get("type")
            .and_then(|t| t.as_str())
            .ok_or_else(|| KernelError::InvalidInput("task.requested missing 'type'".into()))?;
        let title = record
            .payload
            .get("title")
            .and_then(|t| t.as_str())
            .unwrap_or(task_type);
        let priority: TaskPriority = record
            .payload
            .get("priority")
            .cloned()
            .map(serde_json::from_value)
            .transpose()
            .map_err(|e| KernelError::InvalidInput(format!("bad priority: {}", e)))?
            .unwrap_or_default();

        let task = Task {
            id: Uuid::new_v4(),
            tenant_id: record.tenant_id,
            task_type: task_type.to_string(),
            status: TaskStatus::Pending,
            priority,
            title: title.to_string(),
            parameters: record
                .payload
                .get("parameters")
                .cloned()
                .unwrap_or(json!({})),
            assigned_to: None,
            delegated_from: None,
            parent_id: None,
            created_by: "webhook".to_string(),
            idempotency_key: Some(format!("evt:{}", record.id)),
            version: 1,
            created_at: Utc::now(),
            assigned_at: None,
            accepted_at: None,
            started_at: None,
            completed_at: None,
            deadline: None,
            deleted_at: None,
        };
        let task = self.repos.tasks.create(&task).await?;
        if task.status == TaskStatus::Pending {
            if let Err(e) = self.engine.assign(&task, "webhook").await {
                // Routing failures leave the row pending; a later agent
                // registration picks it up.
                tracing::info!("webhook task {} left pending: {}", task.id, e);
            }
        }
        Ok(())
    }
}
