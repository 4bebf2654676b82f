// [[AXON]]/apps/kernel-server/src/models.rs
// Purpose: Core data models shared across gateway, assignment, workflow and storage.
// Architecture: Shared Data Layer
// Dependencies: Serde, Uuid, Chrono

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

// === AGENTS ===

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Active,
    Draining,
    Offline,
}

/// A durable participant that claims work. Registered on first authenticated
/// connection; flipped offline after the heartbeat window lapses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub id: String,
    pub tenant_id: Uuid,
    pub capabilities: HashSet<String>,
    pub status: AgentStatus,
    pub active_tasks: u32,
    pub queued_tasks: u32,
    /// Fraction of terminal tasks that completed successfully, in [0, 1].
    pub success_rate: f64,
    pub avg_completion_secs: f64,
    pub availability: f64,
    pub cost_rate: Option<f64>,
    pub last_heartbeat: DateTime<Utc>,
    pub registered_at: DateTime<Utc>,
}

impl Agent {
    pub fn workload_score(&self) -> f64 {
        0.7 * f64::from(self.active_tasks) + 0.3 * f64::from(self.queued_tasks)
    }
}

// === SESSIONS ===

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum SessionMode {
    ClaudeCode,
    Ide,
    Agent,
    Standard,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: Uuid,
    pub agent_id: String,
    pub tenant_id: Uuid,
    pub mode: SessionMode,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub ttl_secs: u64,
    /// SHA-256 of the refresh token; the token itself is never stored.
    pub refresh_token_hash: Option<String>,
    pub subscriptions: HashSet<String>,
}

impl Session {
    pub fn expired_at(&self, now: DateTime<Utc>) -> bool {
        let age = now.signed_duration_since(self.last_activity);
        age.num_seconds() >= 0 && age.num_seconds() as u64 > self.ttl_secs
    }
}

// === TASKS ===

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Assigned,
    Accepted,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    /// Legal transitions of the task state machine:
    ///   pending -> assigned -> accepted -> running -> {completed, failed, cancelled}
    ///   pending -> cancelled
    ///   assigned -> pending   (agent reject)
    ///   running -> failed     (error or deadline)
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, next),
            (Pending, Assigned)
                | (Pending, Cancelled)
                | (Assigned, Accepted)
                | (Assigned, Pending)
                | (Assigned, Cancelled)
                | (Accepted, Running)
                | (Accepted, Cancelled)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Cancelled)
        )
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum TaskPriority {
    Low,
    Normal,
    High,
    Urgent,
}

impl Default for TaskPriority {
    fn default() -> Self {
        TaskPriority::Normal
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub task_type: String,
    pub status: TaskStatus,
    #[serde(default)]
    pub priority: TaskPriority,
    pub title: String,
    /// Opaque structured blob; validated at handler entry, never re-typed
    /// across layers.
    #[serde(default)]
    pub parameters: serde_json::Value,
    pub assigned_to: Option<String>,
    pub delegated_from: Option<String>,
    pub parent_id: Option<Uuid>,
    pub created_by: String,
    pub idempotency_key: Option<String>,
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub assigned_at: Option<DateTime<Utc>>,
    pub accepted_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub deadline: Option<DateTime<Utc>>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Task {
    /// Capabilities the task demands: parsed from the type plus the
    /// explicit `parameters.required_capabilities` list.
    pub fn required_capabilities(&self) -> HashSet<String> {
        let mut caps = HashSet::new();
        if !self.task_type.is_empty() {
            caps.insert(self.task_type.clone());
        }
        if let Some(list) = self
            .parameters
            .get("required_capabilities")
            .and_then(|v| v.as_array())
        {
            for cap in list.iter().filter_map(|v| v.as_str()) {
                caps.insert(cap.to_string());
            }
        }
        caps
    }

    pub fn is_cost_sensitive(&self) -> bool {
        self.parameters
            .get("cost_sensitive")
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
    }

    pub fn estimated_hours(&self) -> f64 {
        self.parameters
            .get("estimated_hours")
            .and_then(|v| v.as_f64())
            .unwrap_or(1.0)
    }
}

/// One recorded status transition. The full sequence forms a path through
/// the legal state machine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskTransition {
    pub task_id: Uuid,
    pub from: TaskStatus,
    pub to: TaskStatus,
    pub actor: String,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DelegationStatus {
    Open,
    Completed,
    Rejected,
}

/// Handing an already-assigned task to another agent, recorded as an edge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DelegationRecord {
    pub id: Uuid,
    pub task_id: Uuid,
    pub tenant_id: Uuid,
    pub from_agent: String,
    pub to_agent: String,
    pub reason: String,
    pub status: DelegationStatus,
    pub result: Option<serde_json::Value>,
    pub at: DateTime<Utc>,
}

// === VECTOR CLOCK ===

/// Per-entity logical timestamp used for ordering concurrent edits.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct VectorClock(pub HashMap<String, u64>);

impl VectorClock {
    pub fn tick(&mut self, actor: &str) {
        *self.0.entry(actor.to_string()).or_insert(0) += 1;
    }

    /// Pointwise maximum; used when two replicas of an entity reconcile.
    pub fn merge(&mut self, other: &VectorClock) {
        for (actor, &n) in &other.0 {
            let slot = self.0.entry(actor.clone()).or_insert(0);
            if n > *slot {
                *slot = n;
            }
        }
    }

    /// True when every component of `self` is <= the matching component of
    /// `other`, and the clocks are not equal.
    pub fn happened_before(&self, other: &VectorClock) -> bool {
        for (actor, &n) in &self.0 {
            if n > other.0.get(actor).copied().unwrap_or(0) {
                return false;
            }
        }
        self != other
    }
}

// === WORKFLOWS ===

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum WorkflowType {
    Sequential,
    Parallel,
    Conditional,
    Approval,
    Composite,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum StepType {
    Task,
    Script,
    Approval,
    Webhook,
    ParallelFanOut,
    ConditionalBranch,
    CompensationHook,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRetryPolicy {
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_cap_ms: u64,
}

impl Default for StepRetryPolicy {
    fn default() -> Self {
        StepRetryPolicy {
            max_attempts: 1,
            backoff_base_ms: 1000,
            backoff_cap_ms: 60_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowStep {
    pub id: String,
    pub step_type: StepType,
    #[serde(default)]
    pub config: serde_json::Value,
    #[serde(default)]
    pub retry: StepRetryPolicy,
    /// Branch table for conditional steps: predicate outcome -> step id.
    #[serde(default)]
    pub next: HashMap<String, String>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub name: String,
    pub workflow_type: WorkflowType,
    pub steps: Vec<WorkflowStep>,
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Suspended,
    Completed,
    Failed,
    Compensating,
}

impl ExecutionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, ExecutionStatus::Completed | ExecutionStatus::Failed)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Succeeded,
    Failed,
    Skipped,
    Compensated,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepResult {
    pub step_id: String,
    pub status: StepStatus,
    pub output: serde_json::Value,
    pub attempts: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowExecution {
    pub id: Uuid,
    pub workflow_id: Uuid,
    pub tenant_id: Uuid,
    pub status: ExecutionStatus,
    /// Index into the step list. Never decreases except while compensating.
    pub cursor: usize,
    pub step_results: Vec<StepResult>,
    pub context: serde_json::Value,
    pub clock: VectorClock,
    pub version: i64,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

// === WORKSPACES & SHARED DOCUMENTS ===

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workspace {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub name: String,
    /// member agent id -> role
    pub members: HashMap<String, String>,
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SharedDocument {
    pub id: Uuid,
    pub workspace_id: Uuid,
    pub tenant_id: Uuid,
    pub content: serde_json::Value,
    pub content_type: String,
    pub clock: VectorClock,
    pub version: i64,
    pub last_sequence: i64,
    pub lock_owner: Option<String>,
    pub lock_expires_at: Option<DateTime<Utc>>,
    pub last_modified_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SharedDocument {
    pub fn lock_held_by_other(&self, agent: &str, now: DateTime<Utc>) -> bool {
        match (&self.lock_owner, self.lock_expires_at) {
            (Some(owner), Some(exp)) => owner != agent && exp > now,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DocumentOpType {
    Insert,
    Delete,
    Replace,
    Move,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentOperation {
    pub document_id: Uuid,
    /// Monotonic per document; totally orders all edits to one document.
    pub sequence: i64,
    pub op_type: DocumentOpType,
    pub path: String,
    pub value: serde_json::Value,
    pub agent_id: String,
    pub clock: VectorClock,
    pub applied_at: DateTime<Utc>,
}

// === EVENT RECORDS (durable pipeline) ===

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRecord {
    pub id: String,
    pub tenant_id: Uuid,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub attempts: u32,
    pub first_seen_at: DateTime<Utc>,
    pub last_error: Option<String>,
}

// === EMBEDDING MODEL CATALOG ===

/// Read-mostly registry of embedding models the platform can route to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingModel {
    pub provider: String,
    pub model: String,
    pub version: String,
    pub dimensions: u32,
    pub min_dimensions: Option<u32>,
    pub token_limit: u32,
    pub cost_per_million_tokens: f64,
}

pub fn builtin_model_catalog() -> Vec<EmbeddingModel> {
    vec![
        EmbeddingModel {
            provider: "openai".to_string(),
            model: "text-embedding-3-small".to_string(),
            version: "3".to_string(),
            dimensions: 1536,
            min_dimensions: Some(256),
            token_limit: 8191,
            cost_per_million_tokens: 0.02,
        },
        EmbeddingModel {
            provider: "openai".to_string(),
            model: "text-embedding-3-large".to_string(),
            version: "3".to_string(),
            dimensions: 3072,
            min_dimensions: Some(256),
            token_limit: 8191,
            cost_per_million_tokens: 0.13,
        },
        EmbeddingModel {
            provider: "voyage".to_string(),
            model: "voyage-3".to_string(),
            version: "3".to_string(),
            dimensions: 1024,
            min_dimensions: None,
            token_limit: 32_000,
            cost_per_million_tokens: 0.06,
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_task(params: serde_json::Value) -> Task {
        Task {
            id: Uuid::new_v4(),
            tenant_id: Uuid::new_v4(),
            task_type: "build".to_string(),
            status: TaskStatus::Pending,
            priority: TaskPriority::Normal,
            title: "t".to_string(),
            parameters: params,
            assigned_to: None,
            delegated_from: None,
            parent_id: None,
            created_by: "a1".to_string(),
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

    #[test]
    fn task_state_machine_legal_paths() {
        use TaskStatus::*;
        assert!(Pending.can_transition_to(Assigned));
        assert!(Pending.can_transition_to(Cancelled));
        assert!(Assigned.can_transition_to(Pending)); // agent reject
        assert!(Running.can_transition_to(Failed));
        assert!(Running.can_transition_to(Completed));

        assert!(!Pending.can_transition_to(Running));
        assert!(!Completed.can_transition_to(Running));
        assert!(!Cancelled.can_transition_to(Pending));
        assert!(!Failed.can_transition_to(Completed));
    }

    #[test]
    fn required_capabilities_merge_type_and_params() {
        let task = sample_task(serde_json::json!({
            "required_capabilities": ["test", "build"]
        }));
        let caps = task.required_capabilities();
        assert_eq!(caps.len(), 2);
        assert!(caps.contains("build") && caps.contains("test"));
    }

    #[test]
    fn cost_sensitivity_read_from_parameters() {
        assert!(sample_task(serde_json::json!({ "cost_sensitive": true })).is_cost_sensitive());
        assert!(!sample_task(serde_json::json!({})).is_cost_sensitive());
    }

    #[test]
    fn vector_clock_merge_takes_pointwise_max() {
        let mut a = VectorClock::default();
        a.tick("x");
        a.tick("x");
        let mut b = VectorClock::default();
        b.tick("x");
        b.tick("y");

        a.merge(&b);
        assert_eq!(a.0["x"], 2);
        assert_eq!(a.0["y"], 1);
    }

    #[test]
    fn vector_clock_ordering() {
        let mut a = VectorClock::default();
        a.tick("x");
        let mut b = a.clone();
        b.tick("x");
        assert!(a.happened_before(&b));
        assert!(!b.happened_before(&a));
    }

    #[test]
    fn priority_ordering_supports_strategy_selection() {
        assert!(TaskPriority::Urgent > TaskPriority::High);
        assert!(TaskPriority::High > TaskPriority::Normal);
    }

    #[test]
    fn session_ttl_expiry() {
        let mut s = Session {
            id: Uuid::new_v4(),
            agent_id: "a1".to_string(),
            tenant_id: Uuid::new_v4(),
            mode: SessionMode::Agent,
            created_at: Utc::now(),
            last_activity: Utc::now(),
            ttl_secs: 60,
            refresh_token_hash: None,
            subscriptions: HashSet::new(),
        };
        assert!(!s.expired_at(Utc::now()));
        s.last_activity = Utc::now() - chrono::Duration::seconds(120);
        assert!(s.expired_at(Utc::now()));
    }
}
