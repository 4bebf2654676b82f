// [[AXON]]/apps/kernel-server/src/repo/mod.rs
// Purpose: Relational storage access. Pools, transactions, typed errors.
// Architecture: Repository Layer
// Dependencies: sqlx (postgres), tokio

pub mod agents;
pub mod cache_meta;
pub mod documents;
pub mod tasks;
pub mod tenants;
pub mod workflows;

use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, Transaction};
use thiserror::Error;

use crate::config::DatabaseConfig;
use crate::error::KernelError;

#[derive(Error, Debug)]
pub enum RepoError {
    #[error("row not found")]
    NotFound,
    #[error("row already exists")]
    AlreadyExists,
    #[error("optimistic lock failed")]
    OptimisticLock,
    #[error("foreign key violation: {0}")]
    ForeignKey(String),
    #[error("query timed out")]
    Timeout,
    #[error("storage upstream failed: {0}")]
    Upstream(String),
}

impl From<sqlx::Error> for RepoError {
    fn from(e: sqlx::Error) -> Self {
        match &e {
            sqlx::Error::RowNotFound => RepoError::NotFound,
            sqlx::Error::Database(db) => match db.code().as_deref() {
                Some("23505") => RepoError::AlreadyExists,
                Some("23503") => RepoError::ForeignKey(db.message().to_string()),
                _ => RepoError::Upstream(db.message().to_string()),
            },
            _ => RepoError::Upstream(e.to_string()),
        }
    }
}

impl From<RepoError> for KernelError {
    fn from(e: RepoError) -> Self {
        match e {
            RepoError::NotFound => KernelError::NotFound("row not found".into()),
            RepoError::AlreadyExists => KernelError::Conflict("already exists".into()),
            RepoError::OptimisticLock => KernelError::OptimisticLock("stale version".into()),
            RepoError::ForeignKey(m) => KernelError::InvalidInput(format!("missing reference: {}", m)),
            RepoError::Timeout => KernelError::Upstream("database timeout".into()),
            RepoError::Upstream(m) => KernelError::Upstream(format!("database: {}", m)),
        }
    }
}

pub type RepoResult<T> = Result<T, RepoError>;

pub type Tx = Transaction<'static, Postgres>;

/// Pools for the relational store. Reads go to the replica pool when one is
/// configured; writes and transactions always hit the primary.
#[derive(Clone)]
pub struct Db {
    writer: PgPool,
    reader: PgPool,
    query_timeout: Duration,
}

impl Db {
    pub async fn connect(
        write_url: &str,
        read_url: Option<&str>,
        cfg: &DatabaseConfig,
    ) -> RepoResult<Self> {
        let writer = PgPoolOptions::new()
            .max_connections(cfg.max_connections)
            .connect(write_url)
            .await?;
        let reader = match read_url {
            Some(url) => {
                PgPoolOptions::new()
                    .max_connections(cfg.max_connections)
                    .connect(url)
                    .await?
            }
            None => writer.clone(),
        };
        Ok(Db {
            writer,
            reader,
            query_timeout: Duration::from_secs(cfg.query_timeout_secs),
        })
    }

    pub fn writer(&self) -> &PgPool {
        &self.writer
    }

    pub fn reader(&self) -> &PgPool {
        &self.reader
    }

    /// Begin a transaction on the primary. Nested `begin` on the returned
    /// transaction opens a savepoint; the outer commit wins only if no
    /// inner rollback ran.
    pub async fn begin(&self) -> RepoResult<Tx> {
        Ok(self.writer.begin().await?)
    }

    /// Every repository call runs under this deadline; a slow replica
    /// surfaces as `Timeout`, not an unbounded stall.
    pub async fn bound<T, F>(&self, fut: F) -> RepoResult<T>
    where
        F: std::future::Future<Output = Result<T, sqlx::Error>>,
    {
        match tokio::time::timeout(self.query_timeout, fut).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(RepoError::Timeout),
        }
    }
}

/// All repositories, constructed once at boot.
#[derive(Clone)]
pub struct Repositories {
    pub tenants: Arc<tenants::TenantRepo>,
    pub tasks: Arc<tasks::TaskRepo>,
    pub workflows: Arc<workflows::WorkflowRepo>,
    pub agents: Arc<agents::AgentRepo>,
    pub sessions: Arc<agents::SessionRepo>,
    pub documents: Arc<documents::DocumentRepo>,
    pub workspaces: Arc<documents::WorkspaceRepo>,
    pub cache_meta: Arc<cache_meta::CacheMetaRepo>,
}

impl Repositories {
    pub fn new(db: Db) -> Self {
        Repositories {
            tenants: Arc::new(tenants::TenantRepo::new(db.clone())),
            tasks: Arc::new(tasks::TaskRepo::new(db.clone())),
            workflows: Arc::new(workflows::WorkflowRepo::new(db.clone())),
            agents: Arc::new(agents::AgentRepo::new(db.clone())),
            sessions: Arc::new(agents::SessionRepo::new(db.clone())),
            documents: Arc::new(documents::DocumentRepo::new(db.clone())),
            workspaces: Arc::new(documents::WorkspaceRepo::new(db.clone())),
            cache_meta: Arc::new(cache_meta::CacheMetaRepo::new(db)),
        }
    }
}

// Status enums cross the TEXT column boundary through their serde names so
// the wire spelling and the stored spelling can never drift apart.
pub(crate) fn enum_to_str<T: Serialize>(v: &T) -> String {
    match serde_json::to_value(v) {
        Ok(serde_json::Value::String(s)) => s,
        _ => String::new(),
    }
}

pub(crate) fn enum_from_str<T: DeserializeOwned>(s: &str) -> RepoResult<T> {
    serde_json::from_value(serde_json::Value::String(s.to_string()))
        .map_err(|e| RepoError::Upstream(format!("corrupt enum column '{}': {}", s, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{TaskPriority, TaskStatus};

    #[test]
    fn enum_round_trip_matches_wire_spelling() {
        assert_eq!(enum_to_str(&TaskStatus::Running), "running");
        assert_eq!(enum_to_str(&TaskPriority::Urgent), "urgent");
        let parsed: TaskStatus = enum_from_str("assigned").unwrap();
        assert_eq!(parsed, TaskStatus::Assigned);
    }

    #[test]
    fn corrupt_enum_is_an_upstream_error() {
        let parsed: RepoResult<TaskStatus> = enum_from_str("limbo");
        assert!(matches!(parsed, Err(RepoError::Upstream(_))));
    }
}
