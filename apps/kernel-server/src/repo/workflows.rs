// [[AXON]]/apps/kernel-server/src/repo/workflows.rs
// Purpose: Workflow definitions, executions, and the transition audit table.
// Architecture: Repository Layer
// Dependencies: sqlx, dashmap

use chrono::Utc;
use dashmap::DashMap;
use sqlx::Row;
use std::sync::Arc;
use uuid::Uuid;

use super::{enum_from_str, enum_to_str, Db, RepoError, RepoResult, Tx};
use crate::models::{
    ExecutionStatus, StepResult, VectorClock, Workflow, WorkflowExecution, WorkflowStep,
    WorkflowType,
};

const WF_COLUMNS: &str =
    "id, tenant_id, name, workflow_type, steps, version, created_at, updated_at, deleted_at";
const EXEC_COLUMNS: &str = "id, workflow_id, tenant_id, status, cursor, step_results, context, \
     clock, version, started_at, completed_at";

pub struct WorkflowRepo {
    db: Db,
    /// Hot read path for the executor; invalidated on every write.
    by_id: DashMap<Uuid, Arc<Workflow>>,
}

impl WorkflowRepo {
    pub fn new(db: Db) -> Self {
        WorkflowRepo {
            db,
            by_id: DashMap::new(),
        }
    }

    fn workflow_from_row(row: &sqlx::postgres::PgRow) -> RepoResult<Workflow> {
        let wf_type: String = row.try_get("workflow_type")?;
        let steps: serde_json::Value = row.try_get("steps")?;
        let steps: Vec<WorkflowStep> = serde_json::from_value(steps)
            .map_err(|e| RepoError::Upstream(format!("corrupt steps column: {}", e)))?;
        Ok(Workflow {
            id: row.try_get("id")?,
            tenant_id: row.try_get("tenant_id")?,
            name: row.try_get("name")?,
            workflow_type: enum_from_str::<WorkflowType>(&wf_type)?,
            steps,
            version: row.try_get("version")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
            deleted_at: row.try_get("deleted_at")?,
        })
    }

    fn execution_from_row(row: &sqlx::postgres::PgRow) -> RepoResult<WorkflowExecution> {
        let status: String = row.try_get("status")?;
        let step_results: serde_json::Value = row.try_get("step_results")?;
        let step_results: Vec<StepResult> = serde_json::from_value(step_results)
            .map_err(|e| RepoError::Upstream(format!("corrupt step_results: {}", e)))?;
        let clock: serde_json::Value = row.try_get("clock")?;
        let clock: VectorClock = serde_json::from_value(clock)
            .map_err(|e| RepoError::Upstream(format!("corrupt clock: {}", e)))?;
        let cursor: i64 = row.try_get("cursor")?;
        Ok(WorkflowExecution {
            id: row.try_get("id")?,
            workflow_id: row.try_get("workflow_id")?,
            tenant_id: row.try_get("tenant_id")?,
            status: enum_from_str::<ExecutionStatus>(&status)?,
            cursor: cursor.max(0) as usize,
            step_results,
            context: row.try_get("context")?,
            clock,
            version: row.try_get("version")?,
            started_at: row.try_get("started_at")?,
            completed_at: row.try_get("completed_at")?,
        })
    }

    pub async fn create(&self, wf: &Workflow) -> RepoResult<Workflow> {
        let steps = serde_json::to_value(&wf.steps)
            .map_err(|e| RepoError::Upstream(format!("encode steps: {}", e)))?;
        let row = self
            .db
            .bound(
                sqlx::query(&format!(
                    "INSERT INTO workflows (id, tenant_id, name, workflow_type, steps, version, \
                     created_at, updated_at) VALUES ($1, $2, $3, $4, $5, 1, $6, $6) RETURNING {}",
                    WF_COLUMNS
                ))
                .bind(wf.id)
                .bind(wf.tenant_id)
                .bind(&wf.name)
                .bind(enum_to_str(&wf.workflow_type))
                .bind(steps)
                .bind(Utc::now())
                .fetch_one(self.db.writer()),
            )
            .await?;
        Self::workflow_from_row(&row)
    }

    pub async fn get(&self, tenant_id: Uuid, id: Uuid) -> RepoResult<Arc<Workflow>> {
        if let Some(wf) = self.by_id.get(&id) {
            if wf.tenant_id == tenant_id {
                return Ok(wf.clone());
            }
            // A cached row for another tenant is indistinguishable from a
            // missing row to the caller.
            return Err(RepoError::NotFound);
        }
        let row = self
            .db
            .bound(
                sqlx::query(&format!(
                    "SELECT {} FROM workflows WHERE tenant_id = $1 AND id = $2 \
                     AND deleted_at IS NULL",
                    WF_COLUMNS
                ))
                .bind(tenant_id)
                .bind(id)
                .fetch_optional(self.db.reader()),
            )
            .await?
            .ok_or(RepoError::NotFound)?;
        let wf = Arc::new(Self::workflow_from_row(&row)?);
        self.by_id.insert(id, wf.clone());
        Ok(wf)
    }

    pub async fn list(&self, tenant_id: Uuid, include_archived: bool) -> RepoResult<Vec<Workflow>> {
        let mut sql = format!("SELECT {} FROM workflows WHERE tenant_id = $1", WF_COLUMNS);
        if !include_archived {
            sql.push_str(" AND deleted_at IS NULL");
        }
        sql.push_str(" ORDER BY updated_at DESC LIMIT 200");
        let rows = self
            .db
            .bound(sqlx::query(&sql).bind(tenant_id).fetch_all(self.db.reader()))
            .await?;
        rows.iter().map(Self::workflow_from_row).collect()
    }

    /// Definition update under optimistic lock; bumps the monotonic version.
    pub async fn update(&self, wf: &Workflow, expected_version: i64) -> RepoResult<Workflow> {
        let steps = serde_json::to_value(&wf.steps)
            .map_err(|e| RepoError::Upstream(format!("encode steps: {}", e)))?;
        let row = self
            .db
            .bound(
                sqlx::query(&format!(
                    "UPDATE workflows SET name = $1, workflow_type = $2, steps = $3, \
                     version = version + 1, updated_at = $4 \
                     WHERE tenant_id = $5 AND id = $6 AND version = $7 AND deleted_at IS NULL \
                     RETURNING {}",
                    WF_COLUMNS
                ))
                .bind(&wf.name)
                .bind(enum_to_str(&wf.workflow_type))
                .bind(steps)
                .bind(Utc::now())
                .bind(wf.tenant_id)
                .bind(wf.id)
                .bind(expected_version)
                .fetch_optional(self.db.writer()),
            )
            .await?;
        self.by_id.remove(&wf.id);
        match row {
            Some(row) => Self::workflow_from_row(&row),
            None => Err(RepoError::OptimisticLock),
        }
    }

    pub async fn soft_delete(&self, tenant_id: Uuid, id: Uuid) -> RepoResult<()> {
        let result = self
            .db
            .bound(
                sqlx::query(
                    "UPDATE workflows SET deleted_at = $1 WHERE tenant_id = $2 AND id = $3 \
                     AND deleted_at IS NULL",
                )
                .bind(Utc::now())
                .bind(tenant_id)
                .bind(id)
                .execute(self.db.writer()),
            )
            .await?;
        self.by_id.remove(&id);
        if result.rows_affected() == 0 {
            return Err(RepoError::NotFound);
        }
        Ok(())
    }

    // === EXECUTIONS ===

    pub async fn create_execution(&self, exec: &WorkflowExecution) -> RepoResult<()> {
        self.db
            .bound(
                sqlx::query(
                    "INSERT INTO workflow_executions (id, workflow_id, tenant_id, status, cursor, \
                     step_results, context, clock, version, started_at) \
                     VALUES ($1, $2, $3, $4, $5, $6, $7, $8, 1, $9)",
                )
                .bind(exec.id)
                .bind(exec.workflow_id)
                .bind(exec.tenant_id)
                .bind(enum_to_str(&exec.status))
                .bind(exec.cursor as i64)
                .bind(serde_json::json!(exec.step_results))
                .bind(&exec.context)
                .bind(serde_json::json!(exec.clock))
                .bind(exec.started_at)
                .execute(self.db.writer()),
            )
            .await?;
        Ok(())
    }

    pub async fn get_execution(&self, tenant_id: Uuid, id: Uuid) -> RepoResult<WorkflowExecution> {
        let row = self
            .db
            .bound(
                sqlx::query(&format!(
                    "SELECT {} FROM workflow_executions WHERE tenant_id = $1 AND id = $2",
                    EXEC_COLUMNS
                ))
                .bind(tenant_id)
                .bind(id)
                .fetch_optional(self.db.reader()),
            )
            .await?
            .ok_or(RepoError::NotFound)?;
        Self::execution_from_row(&row)
    }

    /// Persist one execution state change plus its audit row in a single
    /// transaction; rollback discards both.
    pub async fn persist_transition(
        &self,
        exec: &WorkflowExecution,
        expected_version: i64,
        from: ExecutionStatus,
        detail: &str,
    ) -> RepoResult<i64> {
        let mut tx = self.db.begin().await?;
        let new_version = self
            .persist_transition_tx(&mut tx, exec, expected_version, from, detail)
            .await?;
        tx.commit().await?;
        Ok(new_version)
    }

    pub async fn persist_transition_tx(
        &self,
        tx: &mut Tx,
        exec: &WorkflowExecution,
        expected_version: i64,
        from: ExecutionStatus,
        detail: &str,
    ) -> RepoResult<i64> {
        let row = sqlx::query(
            "UPDATE workflow_executions SET status = $1, cursor = $2, step_results = $3, \
             context = $4, clock = $5, version = version + 1, completed_at = $6 \
             WHERE tenant_id = $7 AND id = $8 AND version = $9 RETURNING version",
        )
        .bind(enum_to_str(&exec.status))
        .bind(exec.cursor as i64)
        .bind(serde_json::json!(exec.step_results))
        .bind(&exec.context)
        .bind(serde_json::json!(exec.clock))
        .bind(exec.completed_at)
        .bind(exec.tenant_id)
        .bind(exec.id)
        .bind(expected_version)
        .fetch_optional(&mut **tx)
        .await?;
        let Some(row) = row else {
            return Err(RepoError::OptimisticLock);
        };
        let new_version: i64 = row.try_get("version")?;

        sqlx::query(
            "INSERT INTO workflow_transitions (execution_id, tenant_id, from_status, to_status, \
             cursor, detail, at) VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(exec.id)
        .bind(exec.tenant_id)
        .bind(enum_to_str(&from))
        .bind(enum_to_str(&exec.status))
        .bind(exec.cursor as i64)
        .bind(detail)
        .bind(Utc::now())
        .execute(&mut **tx)
        .await?;

        Ok(new_version)
    }

    /// Executions that were mid-flight when the previous process died.
    /// Boot recovery walks these; suspended executions are excluded since
    /// they are legitimately parked awaiting approval.
    pub async fn list_stranded(&self) -> RepoResult<Vec<WorkflowExecution>> {
        let rows = self
            .db
            .bound(
                sqlx::query(&format!(
                    "SELECT {} FROM workflow_executions \
                     WHERE status IN ('running', 'compensating', 'pending') \
                     ORDER BY started_at ASC",
                    EXEC_COLUMNS
                ))
                .fetch_all(self.db.writer()),
            )
            .await?;
        rows.iter().map(Self::execution_from_row).collect()
    }
}
