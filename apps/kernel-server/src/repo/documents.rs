// [[AXON]]/apps/kernel-server/src/repo/documents.rs
// Purpose: Workspaces, shared documents, and the per-document operation log.
// Architecture: Repository Layer
// Dependencies: sqlx

use chrono::{DateTime, Utc};
use sqlx::Row;
use uuid::Uuid;

use super::{enum_from_str, enum_to_str, Db, RepoError, RepoResult};
use crate::models::{
    DocumentOpType, DocumentOperation, SharedDocument, VectorClock, Workspace,
};

const DOC_COLUMNS: &str = "id, workspace_id, tenant_id, content, content_type, clock, version, \
     last_sequence, lock_owner, lock_expires_at, last_modified_by, created_at, updated_at";

pub struct WorkspaceRepo {
    db: Db,
}

impl WorkspaceRepo {
    pub fn new(db: Db) -> Self {
        WorkspaceRepo { db }
    }

    fn from_row(row: &sqlx::postgres::PgRow) -> RepoResult<Workspace> {
        let members: serde_json::Value = row.try_get("members")?;
        Ok(Workspace {
            id: row.try_get("id")?,
            tenant_id: row.try_get("tenant_id")?,
            name: row.try_get("name")?,
            members: serde_json::from_value(members)
                .map_err(|e| RepoError::Upstream(format!("corrupt members: {}", e)))?,
            version: row.try_get("version")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    pub async fn create(&self, ws: &Workspace) -> RepoResult<Workspace> {
        let row = self
            .db
            .bound(
                sqlx::query(
                    "INSERT INTO workspaces (id, tenant_id, name, members, version, created_at, \
                     updated_at) VALUES ($1, $2, $3, $4, 1, $5, $5) \
                     RETURNING id, tenant_id, name, members, version, created_at, updated_at",
                )
                .bind(ws.id)
                .bind(ws.tenant_id)
                .bind(&ws.name)
                .bind(serde_json::json!(ws.members))
                .bind(Utc::now())
                .fetch_one(self.db.writer()),
            )
            .await?;
        Self::from_row(&row)
    }

    pub async fn get(&self, tenant_id: Uuid, id: Uuid) -> RepoResult<Workspace> {
        let row = self
            .db
            .bound(
                sqlx::query(
                    "SELECT id, tenant_id, name, members, version, created_at, updated_at \
                     FROM workspaces WHERE tenant_id = $1 AND id = $2",
                )
                .bind(tenant_id)
                .bind(id)
                .fetch_optional(self.db.reader()),
            )
            .await?
            .ok_or(RepoError::NotFound)?;
        Self::from_row(&row)
    }

    /// Membership changes go through the optimistic version check.
    pub async fn update_members(
        &self,
        ws: &Workspace,
        expected_version: i64,
    ) -> RepoResult<Workspace> {
        let row = self
            .db
            .bound(
                sqlx::query(
                    "UPDATE workspaces SET members = $1, version = version + 1, updated_at = $2 \
                     WHERE tenant_id = $3 AND id = $4 AND version = $5 \
                     RETURNING id, tenant_id, name, members, version, created_at, updated_at",
                )
                .bind(serde_json::json!(ws.members))
                .bind(Utc::now())
                .bind(ws.tenant_id)
                .bind(ws.id)
                .bind(expected_version)
                .fetch_optional(self.db.writer()),
            )
            .await?;
        match row {
            Some(row) => Self::from_row(&row),
            None => Err(RepoError::OptimisticLock),
        }
    }
}

pub struct DocumentRepo {
    db: Db,
}

impl DocumentRepo {
    pub fn new(db: Db) -> Self {
        DocumentRepo { db }
    }

    fn from_row(row: &sqlx::postgres::PgRow) -> RepoResult<SharedDocument> {
        let clock: serde_json::Value = row.try_get("clock")?;
        Ok(SharedDocument {
            id: row.try_get("id")?,
            workspace_id: row.try_get("workspace_id")?,
            tenant_id: row.try_get("tenant_id")?,
            content: row.try_get("content")?,
            content_type: row.try_get("content_type")?,
            clock: serde_json::from_value(clock)
                .map_err(|e| RepoError::Upstream(format!("corrupt clock: {}", e)))?,
            version: row.try_get("version")?,
            last_sequence: row.try_get("last_sequence")?,
            lock_owner: row.try_get("lock_owner")?,
            lock_expires_at: row.try_get("lock_expires_at")?,
            last_modified_by: row.try_get("last_modified_by")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    pub async fn create(&self, doc: &SharedDocument) -> RepoResult<SharedDocument> {
        let row = self
            .db
            .bound(
                sqlx::query(&format!(
                    "INSERT INTO shared_documents (id, workspace_id, tenant_id, content, \
                     content_type, clock, version, last_sequence, created_at, updated_at) \
                     VALUES ($1, $2, $3, $4, $5, $6, 1, 0, $7, $7) RETURNING {}",
                    DOC_COLUMNS
                ))
                .bind(doc.id)
                .bind(doc.workspace_id)
                .bind(doc.tenant_id)
                .bind(&doc.content)
                .bind(&doc.content_type)
                .bind(serde_json::json!(doc.clock))
                .bind(Utc::now())
                .fetch_one(self.db.writer()),
            )
            .await?;
        Self::from_row(&row)
    }

    pub async fn get(&self, tenant_id: Uuid, id: Uuid) -> RepoResult<SharedDocument> {
        let row = self
            .db
            .bound(
                sqlx::query(&format!(
                    "SELECT {} FROM shared_documents WHERE tenant_id = $1 AND id = $2",
                    DOC_COLUMNS
                ))
                .bind(tenant_id)
                .bind(id)
                .fetch_optional(self.db.reader()),
            )
            .await?
            .ok_or(RepoError::NotFound)?;
        Self::from_row(&row)
    }

    pub async fn list_for_workspace(
        &self,
        tenant_id: Uuid,
        workspace_id: Uuid,
    ) -> RepoResult<Vec<SharedDocument>> {
        let rows = self
            .db
            .bound(
                sqlx::query(&format!(
                    "SELECT {} FROM shared_documents \
                     WHERE tenant_id = $1 AND workspace_id = $2 ORDER BY updated_at DESC",
                    DOC_COLUMNS
                ))
                .bind(tenant_id)
                .bind(workspace_id)
                .fetch_all(self.db.reader()),
            )
            .await?;
        rows.iter().map(Self::from_row).collect()
    }

    /// Apply one operation: bump the document sequence atomically on the
    /// row, append to the operation log, and update content under the
    /// optimistic version check. One transaction for the lot.
    pub async fn apply_operation(
        &self,
        doc: &SharedDocument,
        expected_version: i64,
        op_type: DocumentOpType,
        path: &str,
        value: &serde_json::Value,
        agent_id: &str,
        clock: &VectorClock,
    ) -> RepoResult<DocumentOperation> {
        let now = Utc::now();
        let mut tx = self.db.begin().await?;

        let row = sqlx::query(
            "UPDATE shared_documents SET content = $1, clock = $2, version = version + 1, \
             last_sequence = last_sequence + 1, last_modified_by = $3, updated_at = $4 \
             WHERE tenant_id = $5 AND id = $6 AND version = $7 \
             RETURNING last_sequence",
        )
        .bind(&doc.content)
        .bind(serde_json::json!(clock))
        .bind(agent_id)
        .bind(now)
        .bind(doc.tenant_id)
        .bind(doc.id)
        .bind(expected_version)
        .fetch_optional(&mut *tx)
        .await?;
        let Some(row) = row else {
            tx.rollback().await?;
            return Err(RepoError::OptimisticLock);
        };
        let sequence: i64 = row.try_get("last_sequence")?;

        sqlx::query(
            "INSERT INTO document_operations (document_id, tenant_id, sequence, op_type, path, \
             value, agent_id, clock, applied_at) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
        )
        .bind(doc.id)
        .bind(doc.tenant_id)
        .bind(sequence)
        .bind(enum_to_str(&op_type))
        .bind(path)
        .bind(value)
        .bind(agent_id)
        .bind(serde_json::json!(clock))
        .bind(now)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(DocumentOperation {
            document_id: doc.id,
            sequence,
            op_type,
            path: path.to_string(),
            value: value.clone(),
            agent_id: agent_id.to_string(),
            clock: clock.clone(),
            applied_at: now,
        })
    }

    pub async fn operations_since(
        &self,
        tenant_id: Uuid,
        document_id: Uuid,
        after_sequence: i64,
    ) -> RepoResult<Vec<DocumentOperation>> {
        let rows = self
            .db
            .bound(
                sqlx::query(
                    "SELECT document_id, sequence, op_type, path, value, agent_id, clock, \
                     applied_at FROM document_operations \
                     WHERE tenant_id = $1 AND document_id = $2 AND sequence > $3 \
                     ORDER BY sequence ASC",
                )
                .bind(tenant_id)
                .bind(document_id)
                .bind(after_sequence)
                .fetch_all(self.db.reader()),
            )
            .await?;
        rows.iter()
            .map(|row| {
                let op_type: String = row.try_get("op_type")?;
                let clock: serde_json::Value = row.try_get("clock")?;
                Ok(DocumentOperation {
                    document_id: row.try_get("document_id")?,
                    sequence: row.try_get("sequence")?,
                    op_type: enum_from_str::<DocumentOpType>(&op_type)?,
                    path: row.try_get("path")?,
                    value: row.try_get("value")?,
                    agent_id: row.try_get("agent_id")?,
                    clock: serde_json::from_value(clock)
                        .map_err(|e| RepoError::Upstream(format!("corrupt clock: {}", e)))?,
                    applied_at: row.try_get("applied_at")?,
                })
            })
            .collect()
    }

    /// Advisory lock acquisition. Succeeds when the lock is free, expired,
    /// or already held by the requester (refresh).
    pub async fn acquire_lock(
        &self,
        tenant_id: Uuid,
        id: Uuid,
        agent_id: &str,
        until: DateTime<Utc>,
    ) -> RepoResult<bool> {
        let result = self
            .db
            .bound(
                sqlx::query(
                    "UPDATE shared_documents SET lock_owner = $1, lock_expires_at = $2 \
                     WHERE tenant_id = $3 AND id = $4 AND \
                     (lock_owner IS NULL OR lock_owner = $1 OR lock_expires_at < $5)",
                )
                .bind(agent_id)
                .bind(until)
                .bind(tenant_id)
                .bind(id)
                .bind(Utc::now())
                .execute(self.db.writer()),
            )
            .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn release_lock(&self, tenant_id: Uuid, id: Uuid, agent_id: &str) -> RepoResult<()> {
        self.db
            .bound(
                sqlx::query(
                    "UPDATE shared_documents SET lock_owner = NULL, lock_expires_at = NULL \
                     WHERE tenant_id = $1 AND id = $2 AND lock_owner = $3",
                )
                .bind(tenant_id)
                .bind(id)
                .bind(agent_id)
                .execute(self.db.writer()),
            )
            .await?;
        Ok(())
    }
}
