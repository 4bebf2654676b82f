// [[AXON]]/apps/kernel-server/src/repo/tasks.rs
// Purpose: Task rows, status transitions, delegation records.
// Architecture: Repository Layer
// Dependencies: sqlx

use chrono::Utc;
use sqlx::Row;
use uuid::Uuid;

use super::{enum_from_str, enum_to_str, Db, RepoError, RepoResult};
use crate::models::{DelegationRecord, DelegationStatus, Task, TaskStatus, TaskTransition};

const SELECT_COLUMNS: &str = "id, tenant_id, task_type, status, priority, title, parameters, \
     assigned_to, delegated_from, parent_id, created_by, idempotency_key, version, \
     created_at, assigned_at, accepted_at, started_at, completed_at, deadline, deleted_at";

#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub status: Option<TaskStatus>,
    pub task_type: Option<String>,
    pub assigned_to: Option<String>,
    pub parent_id: Option<Uuid>,
    /// Soft-deleted rows stay hidden unless the caller asks for archives.
    pub include_archived: bool,
    pub limit: i64,
}

pub struct TaskRepo {
    db: Db,
}

impl TaskRepo {
    pub fn new(db: Db) -> Self {
        TaskRepo { db }
    }

    fn from_row(row: &sqlx::postgres::PgRow) -> RepoResult<Task> {
        let status: String = row.try_get("status")?;
        let priority: String = row.try_get("priority")?;
        Ok(Task {
            id: row.try_get("id")?,
            tenant_id: row.try_get("tenant_id")?,
            task_type: row.try_get("task_type")?,
            status: enum_from_str(&status)?,
            priority: enum_from_str(&priority)?,
            title: row.try_get("title")?,
            parameters: row.try_get("parameters")?,
            assigned_to: row.try_get("assigned_to")?,
            delegated_from: row.try_get("delegated_from")?,
            parent_id: row.try_get("parent_id")?,
            created_by: row.try_get("created_by")?,
            idempotency_key: row.try_get("idempotency_key")?,
            version: row.try_get("version")?,
            created_at: row.try_get("created_at")?,
            assigned_at: row.try_get("assigned_at")?,
            accepted_at: row.try_get("accepted_at")?,
            started_at: row.try_get("started_at")?,
            completed_at: row.try_get("completed_at")?,
            deadline: row.try_get("deadline")?,
            deleted_at: row.try_get("deleted_at")?,
        })
    }

    /// Insert honoring the idempotency key: repeated calls with the same
    /// (tenant, creator, key) return the original row and create nothing.
    pub async fn create(&self, task: &Task) -> RepoResult<Task> {
        if let Some(key) = &task.idempotency_key {
            let existing = self
                .db
                .bound(
                    sqlx::query(&format!(
                        "SELECT {} FROM tasks WHERE tenant_id = $1 AND created_by = $2 \
                         AND idempotency_key = $3 AND deleted_at IS NULL",
                        SELECT_COLUMNS
                    ))
                    .bind(task.tenant_id)
                    .bind(&task.created_by)
                    .bind(key)
                    .fetch_optional(self.db.writer()),
                )
                .await?;
            if let Some(row) = existing {
                return Self::from_row(&row);
            }
        }

        let row = self
            .db
            .bound(
                sqlx::query(&format!(
                    "INSERT INTO tasks (id, tenant_id, task_type, status, priority, title, \
                     parameters, assigned_to, delegated_from, parent_id, created_by, \
                     idempotency_key, version, created_at, deadline) \
                     VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, 1, $13, $14) \
                     ON CONFLICT (tenant_id, created_by, idempotency_key) \
                     WHERE idempotency_key IS NOT NULL DO NOTHING \
                     RETURNING {}",
                    SELECT_COLUMNS
                ))
                .bind(task.id)
                .bind(task.tenant_id)
                .bind(&task.task_type)
                .bind(enum_to_str(&task.status))
                .bind(enum_to_str(&task.priority))
                .bind(&task.title)
                .bind(&task.parameters)
                .bind(&task.assigned_to)
                .bind(&task.delegated_from)
                .bind(task.parent_id)
                .bind(&task.created_by)
                .bind(&task.idempotency_key)
                .bind(task.created_at)
                .bind(task.deadline)
                .fetch_optional(self.db.writer()),
            )
            .await?;

        match row {
            Some(row) => Self::from_row(&row),
            // Conflict raced between our probe and the insert: fetch the winner.
            None => {
                let key = task
                    .idempotency_key
                    .as_deref()
                    .ok_or(RepoError::AlreadyExists)?;
                self.get_by_idempotency_key(task.tenant_id, &task.created_by, key)
                    .await
            }
        }
    }

    pub async fn get(&self, tenant_id: Uuid, id: Uuid) -> RepoResult<Task> {
        let row = self
            .db
            .bound(
                sqlx::query(&format!(
                    "SELECT {} FROM tasks WHERE tenant_id = $1 AND id = $2 AND deleted_at IS NULL",
                    SELECT_COLUMNS
                ))
                .bind(tenant_id)
                .bind(id)
                .fetch_optional(self.db.reader()),
            )
            .await?
            .ok_or(RepoError::NotFound)?;
        Self::from_row(&row)
    }

    pub async fn get_by_idempotency_key(
        &self,
        tenant_id: Uuid,
        created_by: &str,
        key: &str,
    ) -> RepoResult<Task> {
        let row = self
            .db
            .bound(
                sqlx::query(&format!(
                    "SELECT {} FROM tasks WHERE tenant_id = $1 AND created_by = $2 \
                     AND idempotency_key = $3 AND deleted_at IS NULL",
                    SELECT_COLUMNS
                ))
                .bind(tenant_id)
                .bind(created_by)
                .bind(key)
                .fetch_optional(self.db.writer()),
            )
            .await?
            .ok_or(RepoError::NotFound)?;
        Self::from_row(&row)
    }

    pub async fn list(&self, tenant_id: Uuid, filter: &TaskFilter) -> RepoResult<Vec<Task>> {
        let mut sql = format!(
            "SELECT {} FROM tasks WHERE tenant_id = $1",
            SELECT_COLUMNS
        );
        if !filter.include_archived {
            sql.push_str(" AND deleted_at IS NULL");
        }
        if filter.status.is_some() {
            sql.push_str(" AND status = $2");
        } else {
            sql.push_str(" AND ($2::text IS NULL)");
        }
        if filter.task_type.is_some() {
            sql.push_str(" AND task_type = $3");
        } else {
            sql.push_str(" AND ($3::text IS NULL)");
        }
        if filter.assigned_to.is_some() {
            sql.push_str(" AND assigned_to = $4");
        } else {
            sql.push_str(" AND ($4::text IS NULL)");
        }
        if filter.parent_id.is_some() {
            sql.push_str(" AND parent_id = $5");
        } else {
            sql.push_str(" AND ($5::uuid IS NULL)");
        }
        sql.push_str(" ORDER BY created_at DESC LIMIT $6");

        let limit = if filter.limit <= 0 { 100 } else { filter.limit };
        let rows = self
            .db
            .bound(
                sqlx::query(&sql)
                    .bind(tenant_id)
                    .bind(filter.status.map(|s| enum_to_str(&s)))
                    .bind(&filter.task_type)
                    .bind(&filter.assigned_to)
                    .bind(filter.parent_id)
                    .bind(limit)
                    .fetch_all(self.db.reader()),
            )
            .await?;
        rows.iter().map(Self::from_row).collect()
    }

    /// Atomic status transition. The predicate carries both the expected
    /// version and the tenant, so a concurrent writer or a cross-tenant id
    /// probe both surface as failures, not silent overwrites.
    pub async fn transition(
        &self,
        tenant_id: Uuid,
        id: Uuid,
        from: TaskStatus,
        to: TaskStatus,
        expected_version: i64,
        actor: &str,
        assigned_to: Option<&str>,
    ) -> RepoResult<Task> {
        if !from.can_transition_to(to) {
            return Err(RepoError::Upstream(format!(
                "illegal transition {} -> {}",
                enum_to_str(&from),
                enum_to_str(&to)
            )));
        }
        let now = Utc::now();
        let mut tx = self.db.begin().await?;

        let stamp_column = match to {
            TaskStatus::Assigned => "assigned_at",
            TaskStatus::Accepted => "accepted_at",
            TaskStatus::Running => "started_at",
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled => "completed_at",
            TaskStatus::Pending => "assigned_at", // cleared below on reject
        };
        let sql = format!(
            "UPDATE tasks SET status = $1, version = version + 1, {} = $2, \
             assigned_to = CASE WHEN $3::text IS NULL THEN assigned_to ELSE $3 END \
             WHERE tenant_id = $4 AND id = $5 AND status = $6 AND version = $7 \
             AND deleted_at IS NULL \
             RETURNING {}",
            stamp_column, SELECT_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(enum_to_str(&to))
            .bind(now)
            .bind(assigned_to)
            .bind(tenant_id)
            .bind(id)
            .bind(enum_to_str(&from))
            .bind(expected_version)
            .fetch_optional(&mut *tx)
            .await?;
        let Some(row) = row else {
            tx.rollback().await?;
            return Err(RepoError::OptimisticLock);
        };
        let mut task = Self::from_row(&row)?;

        // Reject path clears the assignment.
        if to == TaskStatus::Pending {
            let row = sqlx::query(&format!(
                "UPDATE tasks SET assigned_to = NULL, assigned_at = NULL \
                 WHERE tenant_id = $1 AND id = $2 RETURNING {}",
                SELECT_COLUMNS
            ))
            .bind(tenant_id)
            .bind(id)
            .fetch_one(&mut *tx)
            .await?;
            task = Self::from_row(&row)?;
        }

        sqlx::query(
            "INSERT INTO task_transitions (task_id, tenant_id, from_status, to_status, actor, at) \
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(id)
        .bind(tenant_id)
        .bind(enum_to_str(&from))
        .bind(enum_to_str(&to))
        .bind(actor)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(task)
    }

    pub async fn transitions(&self, tenant_id: Uuid, id: Uuid) -> RepoResult<Vec<TaskTransition>> {
        let rows = self
            .db
            .bound(
                sqlx::query(
                    "SELECT task_id, from_status, to_status, actor, at FROM task_transitions \
                     WHERE tenant_id = $1 AND task_id = $2 ORDER BY at ASC",
                )
                .bind(tenant_id)
                .bind(id)
                .fetch_all(self.db.reader()),
            )
            .await?;
        rows.iter()
            .map(|row| {
                let from: String = row.try_get("from_status")?;
                let to: String = row.try_get("to_status")?;
                Ok(TaskTransition {
                    task_id: row.try_get("task_id")?,
                    from: enum_from_str(&from)?,
                    to: enum_from_str(&to)?,
                    actor: row.try_get("actor")?,
                    at: row.try_get("at")?,
                })
            })
            .collect()
    }

    pub async fn set_delegated_from(
        &self,
        tenant_id: Uuid,
        id: Uuid,
        from_agent: &str,
    ) -> RepoResult<()> {
        self.db
            .bound(
                sqlx::query(
                    "UPDATE tasks SET delegated_from = $1 WHERE tenant_id = $2 AND id = $3",
                )
                .bind(from_agent)
                .bind(tenant_id)
                .bind(id)
                .execute(self.db.writer()),
            )
            .await?;
        Ok(())
    }

    pub async fn record_delegation(&self, record: &DelegationRecord) -> RepoResult<()> {
        self.db
            .bound(
                sqlx::query(
                    "INSERT INTO task_delegations (id, task_id, tenant_id, from_agent, to_agent, \
                     reason, status, result, at) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
                )
                .bind(record.id)
                .bind(record.task_id)
                .bind(record.tenant_id)
                .bind(&record.from_agent)
                .bind(&record.to_agent)
                .bind(&record.reason)
                .bind(enum_to_str(&record.status))
                .bind(&record.result)
                .bind(record.at)
                .execute(self.db.writer()),
            )
            .await?;
        Ok(())
    }

    pub async fn delegations_for_tenant(&self, tenant_id: Uuid) -> RepoResult<Vec<DelegationRecord>> {
        let rows = self
            .db
            .bound(
                sqlx::query(
                    "SELECT id, task_id, tenant_id, from_agent, to_agent, reason, status, result, at \
                     FROM task_delegations WHERE tenant_id = $1 AND status = 'open'",
                )
                .bind(tenant_id)
                .fetch_all(self.db.reader()),
            )
            .await?;
        rows.iter()
            .map(|row| {
                let status: String = row.try_get("status")?;
                Ok(DelegationRecord {
                    id: row.try_get("id")?,
                    task_id: row.try_get("task_id")?,
                    tenant_id: row.try_get("tenant_id")?,
                    from_agent: row.try_get("from_agent")?,
                    to_agent: row.try_get("to_agent")?,
                    reason: row.try_get("reason")?,
                    status: enum_from_str::<DelegationStatus>(&status)?,
                    result: row.try_get("result")?,
                    at: row.try_get("at")?,
                })
            })
            .collect()
    }

    pub async fn soft_delete(&self, tenant_id: Uuid, id: Uuid) -> RepoResult<()> {
        let result = self
            .db
            .bound(
                sqlx::query(
                    "UPDATE tasks SET deleted_at = $1 WHERE tenant_id = $2 AND id = $3 \
                     AND deleted_at IS NULL",
                )
                .bind(Utc::now())
                .bind(tenant_id)
                .bind(id)
                .execute(self.db.writer()),
            )
            .await?;
        if result.rows_affected() == 0 {
            return Err(RepoError::NotFound);
        }
        Ok(())
    }

    /// Bulk insert. Multi-row statements above the chunk threshold keep the
    /// round-trip count bounded for large imports.
    pub async fn create_batch(&self, tasks: &[Task]) -> RepoResult<u64> {
        const CHUNK: usize = 100;
        let mut inserted = 0u64;
        let mut tx = self.db.begin().await?;
        for chunk in tasks.chunks(CHUNK) {
            let mut sql = String::from(
                "INSERT INTO tasks (id, tenant_id, task_type, status, priority, title, \
                 parameters, created_by, version, created_at) VALUES ",
            );
            for (i, _) in chunk.iter().enumerate() {
                if i > 0 {
                    sql.push_str(", ");
                }
                let base = i * 10;
                sql.push_str(&format!(
                    "(${}, ${}, ${}, ${}, ${}, ${}, ${}, ${}, ${}, ${})",
                    base + 1,
                    base + 2,
                    base + 3,
                    base + 4,
                    base + 5,
                    base + 6,
                    base + 7,
                    base + 8,
                    base + 9,
                    base + 10
                ));
            }
            let mut query = sqlx::query(&sql);
            for task in chunk {
                query = query
                    .bind(task.id)
                    .bind(task.tenant_id)
                    .bind(&task.task_type)
                    .bind(enum_to_str(&task.status))
                    .bind(enum_to_str(&task.priority))
                    .bind(&task.title)
                    .bind(&task.parameters)
                    .bind(&task.created_by)
                    .bind(task.version)
                    .bind(task.created_at);
            }
            inserted += query.execute(&mut *tx).await?.rows_affected();
        }
        tx.commit().await?;
        Ok(inserted)
    }
}
