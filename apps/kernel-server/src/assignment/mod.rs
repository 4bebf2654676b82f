// [[AXON]]/apps/kernel-server/src/assignment/mod.rs
// Purpose: Task routing. Strategy selection, workload snapshots, delegation ledger.
// Architecture: Domain Logic Layer
// Dependencies: dashmap, rand, repo

pub mod delegation;
pub mod rules;
pub mod strategies;

use chrono::Utc;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use uuid::Uuid;

use crate::config::AssignmentConfig;
use crate::error::KernelError;
use crate::models::{Agent, AgentStatus, DelegationRecord, DelegationStatus, Task, TaskStatus};
use crate::repo::{RepoError, Repositories};
use delegation::DelegationGraph;
use rules::RuleBook;
use strategies::Strategy;

#[derive(Error, Debug)]
pub enum AssignError {
    #[error("no eligible agent")]
    NoEligibleAgent,
    #[error("all eligible agents are overloaded")]
    AllOverloaded,
    #[error("no agent matches the required capabilities")]
    NoMatchingCapability,
    #[error(transparent)]
    Storage(#[from] RepoError),
}

impl From<AssignError> for KernelError {
    fn from(e: AssignError) -> Self {
        match e {
            AssignError::Storage(inner) => inner.into(),
            other => KernelError::Conflict(other.to_string()),
        }
    }
}

pub struct AssignmentEngine {
    repos: Repositories,
    cfg: AssignmentConfig,
    pub rules: RuleBook,
    rr_cursors: DashMap<Uuid, usize>,
    /// Workload snapshots per tenant; refreshed lazily, bounded by the
    /// snapshot TTL so assignment never hammers the agents table.
    snapshots: DashMap<Uuid, (Instant, Arc<Vec<Agent>>)>,
}

impl AssignmentEngine {
    pub fn new(repos: Repositories, cfg: AssignmentConfig) -> Self {
        AssignmentEngine {
            repos,
            cfg,
            rules: RuleBook::with_defaults(),
            rr_cursors: DashMap::new(),
            snapshots: DashMap::new(),
        }
    }

    pub fn select_strategy(&self, task: &Task) -> Strategy {
        strategies::select(task, &self.rules)
    }

    async fn snapshot(&self, tenant_id: Uuid) -> Result<Arc<Vec<Agent>>, AssignError> {
        let ttl = Duration::from_secs(self.cfg.workload_snapshot_ttl_secs);
        if let Some(entry) = self.snapshots.get(&tenant_id) {
            let (taken, agents) = entry.value();
            if taken.elapsed() < ttl {
                return Ok(agents.clone());
            }
        }
        let agents = Arc::new(self.repos.agents.list(tenant_id).await?);
        self.snapshots
            .insert(tenant_id, (Instant::now(), agents.clone()));
        Ok(agents)
    }

    pub fn invalidate_snapshot(&self, tenant_id: Uuid) {
        self.snapshots.remove(&tenant_id);
    }

    /// Pick an agent for the task. Pure selection: the caller owns the
    /// status transition that records the assignment.
    pub async fn pick_agent(&self, task: &Task) -> Result<String, AssignError> {
        let agents = self.snapshot(task.tenant_id).await?;
        let eligible: Vec<&Agent> = agents
            .iter()
            .filter(|a| a.status == AgentStatus::Active)
            .collect();
        if eligible.is_empty() {
            return Err(AssignError::NoEligibleAgent);
        }
        if eligible
            .iter()
            .all(|a| a.active_tasks >= self.cfg.overload_threshold)
        {
            return Err(AssignError::AllOverloaded);
        }

        let strategy = self.select_strategy(task);
        let mut cursor = self.rr_cursors.entry(task.tenant_id).or_insert(0);
        let chosen = strategies::pick(strategy, task, &eligible, &self.cfg, &mut cursor)?;
        metrics::counter!(
            "assignments_total",
            "strategy" => strategy.label(),
            "status" => "ok"
        )
        .increment(1);
        Ok(chosen)
    }

    /// Assign a pending task end-to-end: pick, transition pending->assigned
    /// under optimistic locking, bump the chosen agent's queue depth.
    pub async fn assign(&self, task: &Task, actor: &str) -> Result<Task, KernelError> {
        let agent_id = self.pick_agent(task).await.map_err(|e| {
            metrics::counter!("assignments_total", "strategy" => "none", "status" => "failed")
                .increment(1);
            KernelError::from(e)
        })?;
        let updated = self
            .repos
            .tasks
            .transition(
                task.tenant_id,
                task.id,
                TaskStatus::Pending,
                TaskStatus::Assigned,
                task.version,
                actor,
                Some(&agent_id),
            )
            .await
            .map_err(KernelError::from)?;
        self.repos
            .agents
            .adjust_workload(task.tenant_id, &agent_id, 0, 1)
            .await
            .map_err(KernelError::from)?;
        self.invalidate_snapshot(task.tenant_id);
        Ok(updated)
    }

    /// Delegate an assigned task to another agent. Refuses edges that would
    /// close a cycle among currently-open delegations.
    pub async fn delegate(
        &self,
        task: &Task,
        from_agent: &str,
        to_agent: &str,
        reason: &str,
    ) -> Result<DelegationRecord, KernelError> {
        // The handover rides the assigned -> pending reject edge, so only a
        // task that is assigned but not yet accepted can change hands.
        // Accepted or running work must be rejected or finished first.
        if task.status != TaskStatus::Assigned {
            return Err(KernelError::Conflict(format!(
                "only an assigned task can be delegated; this one is {}",
                crate::repo::enum_to_str(&task.status)
            )));
        }
        if task.assigned_to.as_deref() != Some(from_agent) {
            return Err(KernelError::Forbidden(
                "only the assigned agent may delegate".into(),
            ));
        }
        if from_agent == to_agent {
            return Err(KernelError::InvalidInput("self-delegation".into()));
        }

        // Build the open-delegation graph and test the new edge.
        let open = self
            .repos
            .tasks
            .delegations_for_tenant(task.tenant_id)
            .await
            .map_err(KernelError::from)?;
        let mut graph = DelegationGraph::new();
        for record in &open {
            graph.add_edge(&record.from_agent, &record.to_agent);
        }
        if graph.would_create_cycle(from_agent, to_agent) {
            return Err(KernelError::Conflict(format!(
                "delegation {} -> {} would create a cycle",
                from_agent, to_agent
            )));
        }

        // Reassign: back to pending, then to the delegate. The ledger row
        // lands only once the handover actually happened.
        let task = self
            .repos
            .tasks
            .transition(
                task.tenant_id,
                task.id,
                task.status,
                TaskStatus::Pending,
                task.version,
                from_agent,
                None,
            )
            .await
            .map_err(KernelError::from)?;
        self.repos
            .tasks
            .transition(
                task.tenant_id,
                task.id,
                TaskStatus::Pending,
                TaskStatus::Assigned,
                task.version,
                from_agent,
                Some(to_agent),
            )
            .await
            .map_err(KernelError::from)?;
        self.repos
            .tasks
            .set_delegated_from(task.tenant_id, task.id, from_agent)
            .await
            .map_err(KernelError::from)?;

        let record = DelegationRecord {
            id: Uuid::new_v4(),
            task_id: task.id,
            tenant_id: task.tenant_id,
            from_agent: from_agent.to_string(),
            to_agent: to_agent.to_string(),
            reason: reason.to_string(),
            status: DelegationStatus::Open,
            result: None,
            at: Utc::now(),
        };
        self.repos
            .tasks
            .record_delegation(&record)
            .await
            .map_err(KernelError::from)?;

        self.repos
            .agents
            .adjust_workload(record.tenant_id, from_agent, 0, -1)
            .await
            .map_err(KernelError::from)?;
        self.repos
            .agents
            .adjust_workload(record.tenant_id, to_agent, 0, 1)
            .await
            .map_err(KernelError::from)?;
        self.invalidate_snapshot(record.tenant_id);

        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TaskPriority;
    use std::collections::HashSet;

    pub(crate) fn agent(id: &str, caps: &[&str]) -> Agent {
        Agent {
            id: id.to_string(),
            tenant_id: Uuid::nil(),
            capabilities: caps.iter().map(|c| c.to_string()).collect::<HashSet<_>>(),
            status: AgentStatus::Active,
            active_tasks: 0,
            queued_tasks: 0,
            success_rate: 1.0,
            avg_completion_secs: 60.0,
            availability: 1.0,
            cost_rate: Some(10.0),
            last_heartbeat: Utc::now(),
            registered_at: Utc::now(),
        }
    }

    pub(crate) fn task_with(params: serde_json::Value, priority: TaskPriority) -> Task {
        Task {
            id: Uuid::new_v4(),
            tenant_id: Uuid::nil(),
            task_type: "build".to_string(),
            status: TaskStatus::Pending,
            priority,
            title: "t".to_string(),
            parameters: params,
            assigned_to: None,
            delegated_from: None,
            parent_id: None,
            created_by: "creator".to_string(),
            idempotency_key: None,
            version: 1,
            created_at: Utc::now(),
            assigned_at: None,
            accepted_at: None,
            started_at: None,
            completed_at: None,
            deadline: None,
            deleted_at: None,
        }
    }
}
