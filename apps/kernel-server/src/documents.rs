// [[AXON]]/apps/kernel-server/src/documents.rs
// Purpose: Shared-document service. Sequenced operations, vector clocks, advisory locks.
// Architecture: Domain Logic Layer
// Dependencies: repo, events

use chrono::{Duration as ChronoDuration, Utc};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::error::{KernelError, KernelResult};
use crate::events::{DomainEvent, EventBus, EventTopic};
use crate::models::{DocumentOpType, DocumentOperation, SharedDocument, VectorClock, Workspace};
use crate::repo::{RepoError, Repositories};
use crate::workflow::steps::{lookup_path, set_path};

const LOCK_TTL_SECS: i64 = 300;
const APPLY_RETRIES: usize = 3;

pub struct DocumentService {
    repos: Repositories,
    events: EventBus,
}

impl DocumentService {
    pub fn new(repos: Repositories, events: EventBus) -> Self {
        DocumentService { repos, events }
    }

    pub async fn get(&self, tenant_id: Uuid, id: Uuid) -> KernelResult<SharedDocument> {
        Ok(self.repos.documents.get(tenant_id, id).await?)
    }

    pub async fn operations_since(
        &self,
        tenant_id: Uuid,
        id: Uuid,
        after_sequence: i64,
    ) -> KernelResult<Vec<DocumentOperation>> {
        Ok(self
            .repos
            .documents
            .operations_since(tenant_id, id, after_sequence)
            .await?)
    }

    /// Apply one operation. Optimistic-lock conflicts retry with a fresh
    /// read a bounded number of times; the per-document sequence makes the
    /// final ordering total regardless of which writer wins. A client that
    /// tracked its own vector clock passes it in and gets it merged.
    pub async fn apply(
        &self,
        tenant_id: Uuid,
        document_id: Uuid,
        agent_id: &str,
        op_type: DocumentOpType,
        path: &str,
        value: Value,
        client_clock: Option<&VectorClock>,
    ) -> KernelResult<DocumentOperation> {
        for attempt in 0..APPLY_RETRIES {
            let mut doc = self.repos.documents.get(tenant_id, document_id).await?;
            if doc.lock_held_by_other(agent_id, Utc::now()) {
                return Err(KernelError::Conflict(format!(
                    "document locked by {}",
                    doc.lock_owner.as_deref().unwrap_or("unknown")
                )));
            }

            apply_to_content(&mut doc.content, op_type, path, &value)?;
            if let Some(client) = client_clock {
                if client.happened_before(&doc.clock) {
                    // The edit was made against an older view; the sequence
                    // still totally orders it, but flag the concurrency.
                    tracing::debug!(
                        "document {} received an edit based on a stale clock from {}",
                        document_id,
                        agent_id
                    );
                }
                doc.clock.merge(client);
            }
            doc.clock.tick(agent_id);

            match self
                .repos
                .documents
                .apply_operation(
                    &doc,
                    doc.version,
                    op_type,
                    path,
                    &value,
                    agent_id,
                    &doc.clock,
                )
                .await
            {
                Ok(op) => {
                    self.events.publish(DomainEvent::new(
                        Some(tenant_id),
                        EventTopic::Document,
                        "document.operation",
                        json!({
                            "document_id": document_id,
                            "sequence": op.sequence,
                            "op_type": op.op_type,
                            "agent_id": agent_id,
                        }),
                    ));
                    return Ok(op);
                }
                Err(RepoError::OptimisticLock) if attempt + 1 < APPLY_RETRIES => {
                    tracing::debug!(
                        "document {} apply raced (attempt {}), re-reading",
                        document_id,
                        attempt + 1
                    );
                    continue;
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(KernelError::OptimisticLock(format!(
            "document {} contended beyond retry budget",
            document_id
        )))
    }

    pub async fn acquire_lock(
        &self,
        tenant_id: Uuid,
        document_id: Uuid,
        agent_id: &str,
    ) -> KernelResult<bool> {
        let until = Utc::now() + ChronoDuration::seconds(LOCK_TTL_SECS);
        Ok(self
            .repos
            .documents
            .acquire_lock(tenant_id, document_id, agent_id, until)
            .await?)
    }

    pub async fn release_lock(
        &self,
        tenant_id: Uuid,
        document_id: Uuid,
        agent_id: &str,
    ) -> KernelResult<()> {
        Ok(self
            .repos
            .documents
            .release_lock(tenant_id, document_id, agent_id)
            .await?)
    }

    // === SHARED CONTEXTS ===
    // A context is a shared document in the tenant's built-in context
    // workspace, addressed by a caller-chosen id.

    fn context_workspace_id(tenant_id: Uuid) -> Uuid {
        // Deterministic per tenant: v5-style derivation over the tenant id.
        Uuid::new_v5(&Uuid::NAMESPACE_OID, format!("axon-ctx-{}", tenant_id).as_bytes())
    }

    async fn ensure_context_workspace(&self, tenant_id: Uuid) -> KernelResult<Uuid> {
        let ws_id = Self::context_workspace_id(tenant_id);
        match self.repos.workspaces.get(tenant_id, ws_id).await {
            Ok(_) => Ok(ws_id),
            Err(RepoError::NotFound) => {
                let now = Utc::now();
                let ws = Workspace {
                    id: ws_id,
                    tenant_id,
                    name: "shared-contexts".to_string(),
                    members: Default::default(),
                    version: 1,
                    created_at: now,
                    updated_at: now,
                };
                match self.repos.workspaces.create(&ws).await {
                    Ok(_) => Ok(ws_id),
                    // Lost the creation race: the other writer's row serves.
                    Err(RepoError::AlreadyExists) => Ok(ws_id),
                    Err(e) => Err(e.into()),
                }
            }
            Err(e) => Err(e.into()),
        }
    }

    fn context_document_id(tenant_id: Uuid, context_id: &str) -> Uuid {
        Uuid::new_v5(
            &Uuid::NAMESPACE_OID,
            format!("axon-ctx-doc-{}-{}", tenant_id, context_id).as_bytes(),
        )
    }

    pub async fn context_get(&self, tenant_id: Uuid, context_id: &str) -> KernelResult<Value> {
        let doc_id = Self::context_document_id(tenant_id, context_id);
        match self.repos.documents.get(tenant_id, doc_id).await {
            Ok(doc) => Ok(json!({
                "context_id": context_id,
                "content": doc.content,
                "version": doc.version,
                "clock": doc.clock,
                "last_modified_by": doc.last_modified_by,
            })),
            Err(RepoError::NotFound) => Ok(json!({
                "context_id": context_id,
                "content": Value::Null,
                "version": 0,
            })),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn context_update(
        &self,
        tenant_id: Uuid,
        context_id: &str,
        agent_id: &str,
        path: &str,
        value: Value,
    ) -> KernelResult<DocumentOperation> {
        let doc_id = Self::context_document_id(tenant_id, context_id);
        if let Err(RepoError::NotFound) = self.repos.documents.get(tenant_id, doc_id).await {
            let ws_id = self.ensure_context_workspace(tenant_id).await?;
            let now = Utc::now();
            let doc = SharedDocument {
                id: doc_id,
                workspace_id: ws_id,
                tenant_id,
                content: json!({}),
                content_type: "application/json".to_string(),
                clock: Default::default(),
                version: 1,
                last_sequence: 0,
                lock_owner: None,
                lock_expires_at: None,
                last_modified_by: None,
                created_at: now,
                updated_at: now,
            };
            match self.repos.documents.create(&doc).await {
                Ok(_) | Err(RepoError::AlreadyExists) => {}
                Err(e) => return Err(e.into()),
            }
        }
        self.apply(
            tenant_id,
            doc_id,
            agent_id,
            DocumentOpType::Replace,
            path,
            value,
            None,
        )
        .await
    }
}

/// Apply one operation to the document content in place.
pub fn apply_to_content(
    content: &mut Value,
    op_type: DocumentOpType,
    path: &str,
    value: &Value,
) -> KernelResult<()> {
    if path.is_empty() {
        return Err(KernelError::InvalidInput("empty operation path".into()));
    }
    match op_type {
        DocumentOpType::Insert | DocumentOpType::Replace => {
            set_path(content, path, value.clone());
            Ok(())
        }
        DocumentOpType::Delete => {
            remove_path(content, path);
            Ok(())
        }
        DocumentOpType::Move => {
            let target = value.as_str().ok_or_else(|| {
                KernelError::InvalidInput("move operation requires a target path string".into())
            })?;
            let moved = lookup_path(content, path).ok_or_else(|| {
                KernelError::InvalidInput(format!("move source '{}' does not exist", path))
            })?;
            remove_path(content, path);
            set_path(content, target, moved);
            Ok(())
        }
    }
}

fn remove_path(content: &mut Value, path: &str) {
    let segments: Vec<&str> = path.split('.').collect();
    let mut current = content;
    for (i, segment) in segments.iter().enumerate() {
        if i == segments.len() - 1 {
            if let Some(map) = current.as_object_mut() {
                map.remove(*segment);
            }
            return;
        }
        match current.get_mut(*segment) {
            Some(next) => current = next,
            None => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_and_replace_set_nested_values() {
        let mut content = json!({});
        apply_to_content(&mut content, DocumentOpType::Insert, "a.b", &json!(1)).unwrap();
        assert_eq!(content, json!({"a": {"b": 1}}));
        apply_to_content(&mut content, DocumentOpType::Replace, "a.b", &json!(2)).unwrap();
        assert_eq!(content["a"]["b"], 2);
    }

    #[test]
    fn delete_removes_leaf() {
        let mut content = json!({"a": {"b": 1, "c": 2}});
        apply_to_content(&mut content, DocumentOpType::Delete, "a.b", &Value::Null).unwrap();
        assert_eq!(content, json!({"a": {"c": 2}}));
        // Deleting a missing path is a no-op, not an error.
        apply_to_content(&mut content, DocumentOpType::Delete, "x.y", &Value::Null).unwrap();
    }

    #[test]
    fn move_relocates_subtree() {
        let mut content = json!({"draft": {"title": "hello"}});
        apply_to_content(
            &mut content,
            DocumentOpType::Move,
            "draft",
            &json!("published"),
        )
        .unwrap();
        assert_eq!(content, json!({"published": {"title": "hello"}}));
    }

    #[test]
    fn move_of_missing_source_errors() {
        let mut content = json!({});
        let err =
            apply_to_content(&mut content, DocumentOpType::Move, "ghost", &json!("x")).unwrap_err();
        assert_eq!(err.kind(), "invalid-input");
    }

    #[test]
    fn empty_path_rejected() {
        let mut content = json!({});
        let err =
            apply_to_content(&mut content, DocumentOpType::Insert, "", &json!(1)).unwrap_err();
        assert_eq!(err.kind(), "invalid-input");
    }

    #[test]
    fn context_ids_are_deterministic_and_tenant_scoped() {
        let t1 = Uuid::new_v4();
        let t2 = Uuid::new_v4();
        assert_eq!(
            DocumentService::context_document_id(t1, "shared"),
            DocumentService::context_document_id(t1, "shared")
        );
        assert_ne!(
            DocumentService::context_document_id(t1, "shared"),
            DocumentService::context_document_id(t2, "shared")
        );
        assert_ne!(
            DocumentService::context_document_id(t1, "a"),
            DocumentService::context_document_id(t1, "b")
        );
    }
}
