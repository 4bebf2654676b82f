// [[AXON]]/apps/kernel-server/src/repo/agents.rs
// Purpose: Agent registry rows and session records.
// Architecture: Repository Layer
// Dependencies: sqlx

use chrono::Utc;
use sqlx::Row;
use std::collections::HashSet;
use uuid::Uuid;

use super::{enum_from_str, enum_to_str, Db, RepoError, RepoResult};
use crate::models::{Agent, AgentStatus, Session, SessionMode};

const AGENT_COLUMNS: &str = "id, tenant_id, capabilities, status, active_tasks, queued_tasks, \
     success_rate, avg_completion_secs, availability, cost_rate, last_heartbeat, registered_at";

pub struct AgentRepo {
    db: Db,
}

impl AgentRepo {
    pub fn new(db: Db) -> Self {
        AgentRepo { db }
    }

    fn from_row(row: &sqlx::postgres::PgRow) -> RepoResult<Agent> {
        let status: String = row.try_get("status")?;
        let capabilities: Vec<String> = row.try_get("capabilities")?;
        let active_tasks: i32 = row.try_get("active_tasks")?;
        let queued_tasks: i32 = row.try_get("queued_tasks")?;
        Ok(Agent {
            id: row.try_get("id")?,
            tenant_id: row.try_get("tenant_id")?,
            capabilities: capabilities.into_iter().collect::<HashSet<_>>(),
            status: enum_from_str::<AgentStatus>(&status)?,
            active_tasks: active_tasks.max(0) as u32,
            queued_tasks: queued_tasks.max(0) as u32,
            success_rate: row.try_get("success_rate")?,
            avg_completion_secs: row.try_get("avg_completion_secs")?,
            availability: row.try_get("availability")?,
            cost_rate: row.try_get("cost_rate")?,
            last_heartbeat: row.try_get("last_heartbeat")?,
            registered_at: row.try_get("registered_at")?,
        })
    }

    /// Register or refresh an agent on connection. Capability and status
    /// updates ride along; counters are preserved across reconnects.
    pub async fn upsert(&self, agent: &Agent) -> RepoResult<Agent> {
        let caps: Vec<String> = agent.capabilities.iter().cloned().collect();
        let row = self
            .db
            .bound(
                sqlx::query(&format!(
                    "INSERT INTO agents (id, tenant_id, capabilities, status, active_tasks, \
                     queued_tasks, success_rate, avg_completion_secs, availability, cost_rate, \
                     last_heartbeat, registered_at) \
                     VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $11) \
                     ON CONFLICT (tenant_id, id) DO UPDATE SET \
                     capabilities = EXCLUDED.capabilities, status = EXCLUDED.status, \
                     cost_rate = EXCLUDED.cost_rate, last_heartbeat = EXCLUDED.last_heartbeat \
                     RETURNING {}",
                    AGENT_COLUMNS
                ))
                .bind(&agent.id)
                .bind(agent.tenant_id)
                .bind(caps)
                .bind(enum_to_str(&agent.status))
                .bind(agent.active_tasks as i32)
                .bind(agent.queued_tasks as i32)
                .bind(agent.success_rate)
                .bind(agent.avg_completion_secs)
                .bind(agent.availability)
                .bind(agent.cost_rate)
                .bind(Utc::now())
                .fetch_one(self.db.writer()),
            )
            .await?;
        Self::from_row(&row)
    }

    pub async fn get(&self, tenant_id: Uuid, id: &str) -> RepoResult<Agent> {
        let row = self
            .db
            .bound(
                sqlx::query(&format!(
                    "SELECT {} FROM agents WHERE tenant_id = $1 AND id = $2",
                    AGENT_COLUMNS
                ))
                .bind(tenant_id)
                .bind(id)
                .fetch_optional(self.db.reader()),
            )
            .await?
            .ok_or(RepoError::NotFound)?;
        Self::from_row(&row)
    }

    pub async fn list(&self, tenant_id: Uuid) -> RepoResult<Vec<Agent>> {
        let rows = self
            .db
            .bound(
                sqlx::query(&format!(
                    "SELECT {} FROM agents WHERE tenant_id = $1 ORDER BY id",
                    AGENT_COLUMNS
                ))
                .bind(tenant_id)
                .fetch_all(self.db.reader()),
            )
            .await?;
        rows.iter().map(Self::from_row).collect()
    }

    pub async fn heartbeat(&self, tenant_id: Uuid, id: &str, status: AgentStatus) -> RepoResult<()> {
        let result = self
            .db
            .bound(
                sqlx::query(
                    "UPDATE agents SET last_heartbeat = $1, status = $2 \
                     WHERE tenant_id = $3 AND id = $4",
                )
                .bind(Utc::now())
                .bind(enum_to_str(&status))
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

    /// Flip agents whose heartbeat lapsed past the window to offline.
    /// Returns the ids that changed.
    pub async fn sweep_offline(&self, window_secs: u64) -> RepoResult<Vec<(Uuid, String)>> {
        let cutoff = Utc::now() - chrono::Duration::seconds(window_secs as i64);
        let rows = self
            .db
            .bound(
                sqlx::query(
                    "UPDATE agents SET status = 'offline' \
                     WHERE status <> 'offline' AND last_heartbeat < $1 \
                     RETURNING tenant_id, id",
                )
                .bind(cutoff)
                .fetch_all(self.db.writer()),
            )
            .await?;
        rows.iter()
            .map(|row| Ok((row.try_get("tenant_id")?, row.try_get("id")?)))
            .collect()
    }

    /// Workload counter updates are additive so concurrent transitions from
    /// different gateway handlers never clobber each other.
    pub async fn adjust_workload(
        &self,
        tenant_id: Uuid,
        id: &str,
        active_delta: i32,
        queued_delta: i32,
    ) -> RepoResult<()> {
        self.db
            .bound(
                sqlx::query(
                    "UPDATE agents SET \
                     active_tasks = GREATEST(active_tasks + $1, 0), \
                     queued_tasks = GREATEST(queued_tasks + $2, 0) \
                     WHERE tenant_id = $3 AND id = $4",
                )
                .bind(active_delta)
                .bind(queued_delta)
                .bind(tenant_id)
                .bind(id)
                .execute(self.db.writer()),
            )
            .await?;
        Ok(())
    }

    /// Fold one terminal task outcome into the rolling performance
    /// aggregates (exponential moving average, alpha 0.1).
    pub async fn record_outcome(
        &self,
        tenant_id: Uuid,
        id: &str,
        success: bool,
        completion_secs: f64,
    ) -> RepoResult<()> {
        self.db
            .bound(
                sqlx::query(
                    "UPDATE agents SET \
                     success_rate = success_rate * 0.9 + $1 * 0.1, \
                     avg_completion_secs = CASE WHEN avg_completion_secs = 0 THEN $2 \
                         ELSE avg_completion_secs * 0.9 + $2 * 0.1 END \
                     WHERE tenant_id = $3 AND id = $4",
                )
                .bind(if success { 1.0f64 } else { 0.0f64 })
                .bind(completion_secs)
                .bind(tenant_id)
                .bind(id)
                .execute(self.db.writer()),
            )
            .await?;
        Ok(())
    }
}

// === SESSIONS ===

const SESSION_COLUMNS: &str = "id, agent_id, tenant_id, mode, created_at, last_activity, \
     ttl_secs, refresh_token_hash, subscriptions";

pub struct SessionRepo {
    db: Db,
}

impl SessionRepo {
    pub fn new(db: Db) -> Self {
        SessionRepo { db }
    }

    fn from_row(row: &sqlx::postgres::PgRow) -> RepoResult<Session> {
        let mode: String = row.try_get("mode")?;
        let subscriptions: Vec<String> = row.try_get("subscriptions")?;
        let ttl_secs: i64 = row.try_get("ttl_secs")?;
        Ok(Session {
            id: row.try_get("id")?,
            agent_id: row.try_get("agent_id")?,
            tenant_id: row.try_get("tenant_id")?,
            mode: enum_from_str::<SessionMode>(&mode)?,
            created_at: row.try_get("created_at")?,
            last_activity: row.try_get("last_activity")?,
            ttl_secs: ttl_secs.max(0) as u64,
            refresh_token_hash: row.try_get("refresh_token_hash")?,
            subscriptions: subscriptions.into_iter().collect(),
        })
    }

    pub async fn create(&self, session: &Session) -> RepoResult<()> {
        let subs: Vec<String> = session.subscriptions.iter().cloned().collect();
        self.db
            .bound(
                sqlx::query(
                    "INSERT INTO sessions (id, agent_id, tenant_id, mode, created_at, \
                     last_activity, ttl_secs, refresh_token_hash, subscriptions) \
                     VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
                )
                .bind(session.id)
                .bind(&session.agent_id)
                .bind(session.tenant_id)
                .bind(enum_to_str(&session.mode))
                .bind(session.created_at)
                .bind(session.last_activity)
                .bind(session.ttl_secs as i64)
                .bind(&session.refresh_token_hash)
                .bind(subs)
                .execute(self.db.writer()),
            )
            .await?;
        Ok(())
    }

    pub async fn touch(&self, id: Uuid) -> RepoResult<()> {
        self.db
            .bound(
                sqlx::query("UPDATE sessions SET last_activity = $1 WHERE id = $2")
                    .bind(Utc::now())
                    .bind(id)
                    .execute(self.db.writer()),
            )
            .await?;
        Ok(())
    }

    pub async fn set_refresh_token_hash(&self, id: Uuid, hash: &str) -> RepoResult<()> {
        self.db
            .bound(
                sqlx::query("UPDATE sessions SET refresh_token_hash = $1 WHERE id = $2")
                    .bind(hash)
                    .bind(id)
                    .execute(self.db.writer()),
            )
            .await?;
        Ok(())
    }

    pub async fn set_subscriptions(&self, id: Uuid, subs: &[String]) -> RepoResult<()> {
        self.db
            .bound(
                sqlx::query("UPDATE sessions SET subscriptions = $1 WHERE id = $2")
                    .bind(subs.to_vec())
                    .bind(id)
                    .execute(self.db.writer()),
            )
            .await?;
        Ok(())
    }

    pub async fn delete(&self, id: Uuid) -> RepoResult<()> {
        self.db
            .bound(
                sqlx::query("DELETE FROM sessions WHERE id = $1")
                    .bind(id)
                    .execute(self.db.writer()),
            )
            .await?;
        Ok(())
    }

    pub async fn list(&self, tenant_id: Uuid) -> RepoResult<Vec<Session>> {
        let rows = self
            .db
            .bound(
                sqlx::query(&format!(
                    "SELECT {} FROM sessions WHERE tenant_id = $1 ORDER BY created_at DESC",
                    SESSION_COLUMNS
                ))
                .bind(tenant_id)
                .fetch_all(self.db.reader()),
            )
            .await?;
        rows.iter().map(Self::from_row).collect()
    }

    /// Remove rows whose TTL lapsed; the gateway prunes its in-memory table
    /// on the same sweep.
    pub async fn sweep_expired(&self) -> RepoResult<u64> {
        let result = self
            .db
            .bound(
                sqlx::query(
                    "DELETE FROM sessions \
                     WHERE last_activity + make_interval(secs => ttl_secs) < $1",
                )
                .bind(Utc::now())
                .execute(self.db.writer()),
            )
            .await?;
        Ok(result.rows_affected())
    }
}
