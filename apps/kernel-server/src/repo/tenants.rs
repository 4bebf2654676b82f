// [[AXON]]/apps/kernel-server/src/repo/tenants.rs
// Purpose: Tenant rows and their feature flags.
// Architecture: Repository Layer
// Dependencies: sqlx

use chrono::{DateTime, Utc};
use sqlx::Row;
use uuid::Uuid;

use super::{Db, RepoError, RepoResult};

#[derive(Debug, Clone)]
pub struct TenantRow {
    pub id: Uuid,
    pub name: String,
    /// Feature flags: {"semantic_cache": bool, "tool_providers": [..]}.
    pub features: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TenantRow {
    pub fn cache_enabled(&self) -> bool {
        self.features
            .get("semantic_cache")
            .and_then(|v| v.as_bool())
            .unwrap_or(true)
    }

    pub fn enabled_providers(&self) -> Option<Vec<String>> {
        self.features
            .get("tool_providers")
            .and_then(|v| v.as_array())
            .map(|list| {
                list.iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect()
            })
    }
}

pub struct TenantRepo {
    db: Db,
}

impl TenantRepo {
    pub fn new(db: Db) -> Self {
        TenantRepo { db }
    }

    fn from_row(row: &sqlx::postgres::PgRow) -> RepoResult<TenantRow> {
        Ok(TenantRow {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            features: row.try_get("features")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    pub async fn create(&self, id: Uuid, name: &str) -> RepoResult<TenantRow> {
        let row = self
            .db
            .bound(
                sqlx::query(
                    "INSERT INTO tenants (id, name, features, created_at, updated_at) \
                     VALUES ($1, $2, '{}'::jsonb, $3, $3) \
                     RETURNING id, name, features, created_at, updated_at",
                )
                .bind(id)
                .bind(name)
                .bind(Utc::now())
                .fetch_one(self.db.writer()),
            )
            .await?;
        Self::from_row(&row)
    }

    pub async fn get(&self, id: Uuid) -> RepoResult<TenantRow> {
        let row = self
            .db
            .bound(
                sqlx::query(
                    "SELECT id, name, features, created_at, updated_at FROM tenants WHERE id = $1",
                )
                .bind(id)
                .fetch_optional(self.db.reader()),
            )
            .await?
            .ok_or(RepoError::NotFound)?;
        Self::from_row(&row)
    }

    pub async fn list(&self) -> RepoResult<Vec<TenantRow>> {
        let rows = self
            .db
            .bound(
                sqlx::query(
                    "SELECT id, name, features, created_at, updated_at FROM tenants ORDER BY name",
                )
                .fetch_all(self.db.reader()),
            )
            .await?;
        rows.iter().map(Self::from_row).collect()
    }

    pub async fn update_features(
        &self,
        id: Uuid,
        features: &serde_json::Value,
    ) -> RepoResult<TenantRow> {
        let row = self
            .db
            .bound(
                sqlx::query(
                    "UPDATE tenants SET features = $1, updated_at = $2 WHERE id = $3 \
                     RETURNING id, name, features, created_at, updated_at",
                )
                .bind(features)
                .bind(Utc::now())
                .bind(id)
                .fetch_optional(self.db.writer()),
            )
            .await?
            .ok_or(RepoError::NotFound)?;
        Self::from_row(&row)
    }

    /// Tenant removal cascades over every owned entity; agents and sessions
    /// exist only under a tenant.
    pub async fn delete(&self, id: Uuid) -> RepoResult<()> {
        let mut tx = self.db.begin().await?;
        for table in [
            "document_operations",
            "shared_documents",
            "workspaces",
            "workflow_transitions",
            "workflow_executions",
            "workflows",
            "task_delegations",
            "task_transitions",
            "tasks",
            "sessions",
            "agents",
            "cache_metadata",
        ] {
            sqlx::query(&format!("DELETE FROM {} WHERE tenant_id = $1", table))
                .bind(id)
                .execute(&mut *tx)
                .await?;
        }
        let result = sqlx::query("DELETE FROM tenants WHERE id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        if result.rows_affected() == 0 {
            return Err(RepoError::NotFound);
        }
        Ok(())
    }
}
