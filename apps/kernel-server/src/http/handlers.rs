// [[AXON]]/apps/kernel-server/src/http/handlers.rs
// Purpose: Admin REST handlers.
// Architecture: API Layer
// Dependencies: axum, serde

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashSet;
use uuid::Uuid;

use super::AdminState;
use crate::assignment::rules::AssignmentRule;
use crate::assignment::strategies::Strategy;
use crate::auth::AdminPrincipal;
use crate::error::{KernelError, KernelResult};
use crate::models::{Agent, AgentStatus, TaskStatus, Workflow, WorkflowStep, WorkflowType};
use crate::pipeline::producer::IngestOutcome;

pub async fn health(State(state): State<AdminState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "service": "axon-kernel",
        "version": env!("CARGO_PKG_VERSION"),
        "connections": state.kernel.sessions.count(),
        "draining": state.kernel.is_draining(),
    }))
}

pub async fn metrics(State(state): State<AdminState>) -> String {
    state.metrics.render()
}

// === WEBHOOK INGRESS ===

pub async fn ingest_webhook(
    State(state): State<AdminState>,
    Path(source): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> KernelResult<(StatusCode, Json<Value>)> {
    let signature = headers
        .get("x-webhook-signature")
        .and_then(|h| h.to_str().ok())
        .ok_or_else(|| KernelError::Unauthorized("missing X-Webhook-Signature".into()))?;
    state.producer.verify(&body, signature)?;

    let tenant_id: Uuid = headers
        .get("x-tenant-id")
        .and_then(|h| h.to_str().ok())
        .ok_or_else(|| KernelError::InvalidInput("missing X-Tenant-Id".into()))?
        .parse()
        .map_err(|_| KernelError::InvalidInput("malformed X-Tenant-Id".into()))?;
    let idempotency_key = headers
        .get("x-idempotency-key")
        .and_then(|h| h.to_str().ok())
        .ok_or_else(|| KernelError::InvalidInput("missing X-Idempotency-Key".into()))?;
    let event_type = headers
        .get("x-event-type")
        .and_then(|h| h.to_str().ok())
        .map(str::to_string)
        .unwrap_or_else(|| source.clone());

    let payload: Value = serde_json::from_slice(&body)
        .map_err(|e| KernelError::InvalidInput(format!("body is not JSON: {}", e)))?;

    match state
        .producer
        .ingest(tenant_id, &event_type, payload, idempotency_key)
        .await?
    {
        IngestOutcome::Accepted { id } => Ok((
            StatusCode::ACCEPTED,
            Json(json!({"status": "accepted", "event_id": id})),
        )),
        IngestOutcome::AlreadyAccepted => Ok((
            StatusCode::OK,
            Json(json!({"status": "already-accepted"})),
        )),
    }
}

// === TENANTS ===

#[derive(Deserialize)]
pub struct CreateTenantBody {
    pub name: String,
    #[serde(default)]
    pub id: Option<Uuid>,
}

pub async fn create_tenant(
    State(state): State<AdminState>,
    AdminPrincipal(principal): AdminPrincipal,
    Json(body): Json<CreateTenantBody>,
) -> KernelResult<(StatusCode, Json<Value>)> {
    if !principal.has_scope("admin") {
        return Err(KernelError::Forbidden("tenant creation requires admin".into()));
    }
    let id = body.id.unwrap_or_else(Uuid::new_v4);
    let tenant = state.kernel.repos.tenants.create(id, &body.name).await?;
    Ok((
        StatusCode::CREATED,
        Json(json!({"id": tenant.id, "name": tenant.name})),
    ))
}

pub async fn list_tenants(
    State(state): State<AdminState>,
    AdminPrincipal(principal): AdminPrincipal,
) -> KernelResult<Json<Value>> {
    if !principal.has_scope("admin") {
        return Err(KernelError::Forbidden("tenant listing requires admin".into()));
    }
    let tenants = state.kernel.repos.tenants.list().await?;
    let out: Vec<Value> = tenants
        .iter()
        .map(|t| json!({"id": t.id, "name": t.name, "features": t.features}))
        .collect();
    Ok(Json(json!({"tenants": out})))
}

pub async fn get_tenant(
    State(state): State<AdminState>,
    AdminPrincipal(principal): AdminPrincipal,
    Path(id): Path<Uuid>,
) -> KernelResult<Json<Value>> {
    if id != principal.tenant_id && !principal.has_scope("admin") {
        return Err(KernelError::Forbidden("cross-tenant read".into()));
    }
    let tenant = state.kernel.repos.tenants.get(id).await?;
    Ok(Json(json!({
        "id": tenant.id,
        "name": tenant.name,
        "features": tenant.features,
        "created_at": tenant.created_at,
    })))
}

/// Feature updates take effect immediately: cache enablement and the tool
/// provider allow-list are pushed into the live registries.
pub async fn update_tenant_features(
    State(state): State<AdminState>,
    AdminPrincipal(principal): AdminPrincipal,
    Path(id): Path<Uuid>,
    Json(features): Json<Value>,
) -> KernelResult<Json<Value>> {
    if !principal.has_scope("admin") {
        return Err(KernelError::Forbidden("feature updates require admin".into()));
    }
    let tenant = state
        .kernel
        .repos
        .tenants
        .update_features(id, &features)
        .await?;
    state.kernel.cache.set_tenant_disabled(id, !tenant.cache_enabled());
    if let Some(providers) = tenant.enabled_providers() {
        state.kernel.tools.set_tenant_enablement(id, providers);
    }
    Ok(Json(json!({"id": tenant.id, "features": tenant.features})))
}

pub async fn delete_tenant(
    State(state): State<AdminState>,
    AdminPrincipal(principal): AdminPrincipal,
    Path(id): Path<Uuid>,
) -> KernelResult<StatusCode> {
    if !principal.has_scope("admin") {
        return Err(KernelError::Forbidden("tenant removal requires admin".into()));
    }
    state.kernel.repos.tenants.delete(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

// === AGENTS ===

pub async fn list_agents(
    State(state): State<AdminState>,
    AdminPrincipal(principal): AdminPrincipal,
) -> KernelResult<Json<Value>> {
    let agents = state.kernel.repos.agents.list(principal.tenant_id).await?;
    Ok(Json(json!({"agents": agents})))
}

#[derive(Deserialize)]
pub struct RegisterAgentBody {
    pub id: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub cost_rate: Option<f64>,
}

pub async fn register_agent(
    State(state): State<AdminState>,
    AdminPrincipal(principal): AdminPrincipal,
    Json(body): Json<RegisterAgentBody>,
) -> KernelResult<(StatusCode, Json<Value>)> {
    let now = Utc::now();
    let agent = Agent {
        id: body.id,
        tenant_id: principal.tenant_id,
        capabilities: body.capabilities.into_iter().collect::<HashSet<_>>(),
        status: AgentStatus::Active,
        active_tasks: 0,
        queued_tasks: 0,
        success_rate: 1.0,
        avg_completion_secs: 0.0,
        availability: 1.0,
        cost_rate: body.cost_rate,
        last_heartbeat: now,
        registered_at: now,
    };
    let agent = state.kernel.repos.agents.upsert(&agent).await?;
    state.kernel.engine.invalidate_snapshot(principal.tenant_id);
    Ok((StatusCode::CREATED, Json(serde_json::to_value(&agent).unwrap_or_default())))
}

#[derive(Deserialize)]
pub struct HeartbeatBody {
    #[serde(default)]
    pub status: Option<AgentStatus>,
}

pub async fn agent_heartbeat(
    State(state): State<AdminState>,
    AdminPrincipal(principal): AdminPrincipal,
    Path(id): Path<String>,
    Json(body): Json<HeartbeatBody>,
) -> KernelResult<Json<Value>> {
    let status = body.status.unwrap_or(AgentStatus::Active);
    state
        .kernel
        .repos
        .agents
        .heartbeat(principal.tenant_id, &id, status)
        .await?;
    state.kernel.engine.invalidate_snapshot(principal.tenant_id);
    Ok(Json(json!({"agent": id, "status": status})))
}

// === TASKS ===

#[derive(Deserialize)]
pub struct TransitionBody {
    pub to: TaskStatus,
}

/// Operator/agent-driven status transition. Legality is enforced by the
/// state machine; staleness by the version predicate.
pub async fn transition_task(
    State(state): State<AdminState>,
    AdminPrincipal(principal): AdminPrincipal,
    Path(id): Path<Uuid>,
    Json(body): Json<TransitionBody>,
) -> KernelResult<Json<Value>> {
    let tenant_id = principal.tenant_id;
    let task = state.kernel.repos.tasks.get(tenant_id, id).await?;
    if !task.status.can_transition_to(body.to) {
        return Err(KernelError::Conflict(format!(
            "illegal transition {:?} -> {:?}",
            task.status, body.to
        )));
    }
    let before = task.status;
    let updated = state
        .kernel
        .repos
        .tasks
        .transition(
            tenant_id,
            id,
            task.status,
            body.to,
            task.version,
            &principal.agent_id,
            None,
        )
        .await?;

    // Keep workload counters and performance aggregates in step.
    if let Some(agent) = updated.assigned_to.clone() {
        let repos = &state.kernel.repos;
        match body.to {
            TaskStatus::Running => {
                repos.agents.adjust_workload(tenant_id, &agent, 1, -1).await?;
            }
            TaskStatus::Completed | TaskStatus::Failed => {
                let delta_queued = if before == TaskStatus::Running { 0 } else { -1 };
                let delta_active = if before == TaskStatus::Running { -1 } else { 0 };
                repos
                    .agents
                    .adjust_workload(tenant_id, &agent, delta_active, delta_queued)
                    .await?;
                let completion_secs = updated
                    .started_at
                    .map(|s| (Utc::now() - s).num_seconds().max(0) as f64)
                    .unwrap_or(0.0);
                repos
                    .agents
                    .record_outcome(
                        tenant_id,
                        &agent,
                        body.to == TaskStatus::Completed,
                        completion_secs,
                    )
                    .await?;
            }
            _ => {}
        }
        state.kernel.engine.invalidate_snapshot(tenant_id);
    }
    state.kernel.events.publish(crate::events::DomainEvent::new(
        Some(tenant_id),
        crate::events::EventTopic::Task,
        "task.status",
        json!({"task_id": updated.id, "from": before, "to": updated.status}),
    ));
    Ok(Json(serde_json::to_value(&updated).unwrap_or_default()))
}

#[derive(Deserialize)]
pub struct DelegateBody {
    pub to_agent: String,
    #[serde(default)]
    pub reason: String,
}

pub async fn delegate_task(
    State(state): State<AdminState>,
    AdminPrincipal(principal): AdminPrincipal,
    Path(id): Path<Uuid>,
    Json(body): Json<DelegateBody>,
) -> KernelResult<Json<Value>> {
    let task = state.kernel.repos.tasks.get(principal.tenant_id, id).await?;
    let record = state
        .kernel
        .engine
        .delegate(&task, &principal.agent_id, &body.to_agent, &body.reason)
        .await?;
    Ok(Json(serde_json::to_value(&record).unwrap_or_default()))
}

#[derive(Deserialize)]
pub struct BatchTaskItem {
    #[serde(rename = "type")]
    pub task_type: String,
    pub title: String,
    #[serde(default)]
    pub parameters: Value,
    #[serde(default)]
    pub priority: crate::models::TaskPriority,
}

/// Bulk import: rows land pending and route through the engine on demand.
pub async fn create_tasks_batch(
    State(state): State<AdminState>,
    AdminPrincipal(principal): AdminPrincipal,
    Json(items): Json<Vec<BatchTaskItem>>,
) -> KernelResult<(StatusCode, Json<Value>)> {
    if items.is_empty() {
        return Err(KernelError::InvalidInput("empty batch".into()));
    }
    if items.len() > 10_000 {
        return Err(KernelError::InvalidInput("batch exceeds 10000 rows".into()));
    }
    let now = Utc::now();
    let tasks: Vec<crate::models::Task> = items
        .into_iter()
        .map(|item| crate::models::Task {
            id: Uuid::new_v4(),
            tenant_id: principal.tenant_id,
            task_type: item.task_type,
            status: TaskStatus::Pending,
            priority: item.priority,
            title: item.title,
            parameters: if item.parameters.is_null() {
                json!({})
            } else {
                item.parameters
            },
            assigned_to: None,
            delegated_from: None,
            parent_id: None,
            created_by: principal.agent_id.clone(),
            idempotency_key: None,
            version: 1,
            created_at: now,
            assigned_at: None,
            accepted_at: None,
            started_at: None,
            completed_at: None,
            deadline: None,
            deleted_at: None,
        })
        .collect();
    let inserted = state.kernel.repos.tasks.create_batch(&tasks).await?;
    Ok((StatusCode::CREATED, Json(json!({"inserted": inserted}))))
}

pub async fn archive_task(
    State(state): State<AdminState>,
    AdminPrincipal(principal): AdminPrincipal,
    Path(id): Path<Uuid>,
) -> KernelResult<StatusCode> {
    state
        .kernel
        .repos
        .tasks
        .soft_delete(principal.tenant_id, id)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

// === WORKFLOWS ===

#[derive(Deserialize)]
pub struct WorkflowBody {
    pub name: String,
    pub workflow_type: WorkflowType,
    pub steps: Vec<WorkflowStep>,
}

pub async fn create_workflow(
    State(state): State<AdminState>,
    AdminPrincipal(principal): AdminPrincipal,
    Json(body): Json<WorkflowBody>,
) -> KernelResult<(StatusCode, Json<Value>)> {
    if body.steps.is_empty() {
        return Err(KernelError::InvalidInput("workflow needs at least one step".into()));
    }
    let now = Utc::now();
    let workflow = Workflow {
        id: Uuid::new_v4(),
        tenant_id: principal.tenant_id,
        name: body.name,
        workflow_type: body.workflow_type,
        steps: body.steps,
        version: 1,
        created_at: now,
        updated_at: now,
        deleted_at: None,
    };
    let workflow = state.kernel.repos.workflows.create(&workflow).await?;
    Ok((StatusCode::CREATED, Json(serde_json::to_value(&workflow).unwrap_or_default())))
}

#[derive(Deserialize)]
pub struct ListQuery {
    #[serde(default)]
    pub include_archived: bool,
}

pub async fn list_workflows(
    State(state): State<AdminState>,
    AdminPrincipal(principal): AdminPrincipal,
    Query(q): Query<ListQuery>,
) -> KernelResult<Json<Value>> {
    let workflows = state
        .kernel
        .repos
        .workflows
        .list(principal.tenant_id, q.include_archived)
        .await?;
    Ok(Json(json!({"workflows": workflows})))
}

pub async fn get_workflow(
    State(state): State<AdminState>,
    AdminPrincipal(principal): AdminPrincipal,
    Path(id): Path<Uuid>,
) -> KernelResult<Json<Value>> {
    let workflow = state.kernel.repos.workflows.get(principal.tenant_id, id).await?;
    Ok(Json(serde_json::to_value(workflow.as_ref()).unwrap_or_default()))
}

#[derive(Deserialize)]
pub struct UpdateWorkflowBody {
    pub name: String,
    pub workflow_type: WorkflowType,
    pub steps: Vec<WorkflowStep>,
    pub expected_version: i64,
}

pub async fn update_workflow(
    State(state): State<AdminState>,
    AdminPrincipal(principal): AdminPrincipal,
    Path(id): Path<Uuid>,
    Json(body): Json<UpdateWorkflowBody>,
) -> KernelResult<Json<Value>> {
    let existing = state.kernel.repos.workflows.get(principal.tenant_id, id).await?;
    let updated = Workflow {
        id,
        tenant_id: principal.tenant_id,
        name: body.name,
        workflow_type: body.workflow_type,
        steps: body.steps,
        version: existing.version,
        created_at: existing.created_at,
        updated_at: Utc::now(),
        deleted_at: None,
    };
    let workflow = state
        .kernel
        .repos
        .workflows
        .update(&updated, body.expected_version)
        .await?;
    Ok(Json(serde_json::to_value(&workflow).unwrap_or_default()))
}

pub async fn delete_workflow(
    State(state): State<AdminState>,
    AdminPrincipal(principal): AdminPrincipal,
    Path(id): Path<Uuid>,
) -> KernelResult<StatusCode> {
    state
        .kernel
        .repos
        .workflows
        .soft_delete(principal.tenant_id, id)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
pub struct ExecuteBody {
    #[serde(default)]
    pub context: Value,
}

pub async fn execute_workflow(
    State(state): State<AdminState>,
    AdminPrincipal(principal): AdminPrincipal,
    Path(id): Path<Uuid>,
    Json(body): Json<ExecuteBody>,
) -> KernelResult<(StatusCode, Json<Value>)> {
    let workflow = state.kernel.repos.workflows.get(principal.tenant_id, id).await?;
    let context = if body.context.is_null() { json!({}) } else { body.context };
    let execution_id = state.kernel.executor.start(workflow, context).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({"execution_id": execution_id})),
    ))
}

pub async fn get_execution(
    State(state): State<AdminState>,
    AdminPrincipal(principal): AdminPrincipal,
    Path(id): Path<Uuid>,
) -> KernelResult<Json<Value>> {
    let exec = state
        .kernel
        .repos
        .workflows
        .get_execution(principal.tenant_id, id)
        .await?;
    Ok(Json(serde_json::to_value(&exec).unwrap_or_default()))
}

#[derive(Deserialize)]
pub struct ApproveBody {
    pub approve: bool,
}

pub async fn approve_execution(
    State(state): State<AdminState>,
    AdminPrincipal(principal): AdminPrincipal,
    Path(id): Path<Uuid>,
    Json(body): Json<ApproveBody>,
) -> KernelResult<Json<Value>> {
    state
        .kernel
        .executor
        .resolve_approval(
            principal.tenant_id,
            id,
            body.approve,
            &principal.agent_id,
            principal.has_scope("admin"),
        )
        .await?;
    Ok(Json(json!({"execution_id": id, "approved": body.approve})))
}

pub async fn cancel_execution(
    State(state): State<AdminState>,
    AdminPrincipal(_principal): AdminPrincipal,
    Path(id): Path<Uuid>,
) -> KernelResult<Json<Value>> {
    let cancelled = state.kernel.executor.cancel(id);
    if !cancelled {
        return Err(KernelError::NotFound("no live execution with that id".into()));
    }
    Ok(Json(json!({"execution_id": id, "cancelling": true})))
}

// === WORKSPACES & SHARED DOCUMENTS ===

#[derive(Deserialize)]
pub struct WorkspaceBody {
    pub name: String,
    #[serde(default)]
    pub members: std::collections::HashMap<String, String>,
}

pub async fn create_workspace(
    State(state): State<AdminState>,
    AdminPrincipal(principal): AdminPrincipal,
    Json(body): Json<WorkspaceBody>,
) -> KernelResult<(StatusCode, Json<Value>)> {
    let now = Utc::now();
    let ws = crate::models::Workspace {
        id: Uuid::new_v4(),
        tenant_id: principal.tenant_id,
        name: body.name,
        members: body.members,
        version: 1,
        created_at: now,
        updated_at: now,
    };
    let ws = state.kernel.repos.workspaces.create(&ws).await?;
    Ok((StatusCode::CREATED, Json(serde_json::to_value(&ws).unwrap_or_default())))
}

pub async fn get_workspace(
    State(state): State<AdminState>,
    AdminPrincipal(principal): AdminPrincipal,
    Path(id): Path<Uuid>,
) -> KernelResult<Json<Value>> {
    let ws = state.kernel.repos.workspaces.get(principal.tenant_id, id).await?;
    Ok(Json(serde_json::to_value(&ws).unwrap_or_default()))
}

#[derive(Deserialize)]
pub struct MembersBody {
    pub members: std::collections::HashMap<String, String>,
    pub expected_version: i64,
}

pub async fn update_workspace_members(
    State(state): State<AdminState>,
    AdminPrincipal(principal): AdminPrincipal,
    Path(id): Path<Uuid>,
    Json(body): Json<MembersBody>,
) -> KernelResult<Json<Value>> {
    let mut ws = state.kernel.repos.workspaces.get(principal.tenant_id, id).await?;
    ws.members = body.members;
    let ws = state
        .kernel
        .repos
        .workspaces
        .update_members(&ws, body.expected_version)
        .await?;
    Ok(Json(serde_json::to_value(&ws).unwrap_or_default()))
}

#[derive(Deserialize)]
pub struct DocumentBody {
    #[serde(default)]
    pub content: Value,
    #[serde(default = "default_content_type")]
    pub content_type: String,
}

fn default_content_type() -> String {
    "application/json".to_string()
}

pub async fn create_document(
    State(state): State<AdminState>,
    AdminPrincipal(principal): AdminPrincipal,
    Path(workspace_id): Path<Uuid>,
    Json(body): Json<DocumentBody>,
) -> KernelResult<(StatusCode, Json<Value>)> {
    // The workspace row must exist and belong to the tenant.
    state
        .kernel
        .repos
        .workspaces
        .get(principal.tenant_id, workspace_id)
        .await?;
    let now = Utc::now();
    let doc = crate::models::SharedDocument {
        id: Uuid::new_v4(),
        workspace_id,
        tenant_id: principal.tenant_id,
        content: if body.content.is_null() { json!({}) } else { body.content },
        content_type: body.content_type,
        clock: Default::default(),
        version: 1,
        last_sequence: 0,
        lock_owner: None,
        lock_expires_at: None,
        last_modified_by: None,
        created_at: now,
        updated_at: now,
    };
    let doc = state.kernel.repos.documents.create(&doc).await?;
    Ok((StatusCode::CREATED, Json(serde_json::to_value(&doc).unwrap_or_default())))
}

pub async fn list_documents(
    State(state): State<AdminState>,
    AdminPrincipal(principal): AdminPrincipal,
    Path(workspace_id): Path<Uuid>,
) -> KernelResult<Json<Value>> {
    let docs = state
        .kernel
        .repos
        .documents
        .list_for_workspace(principal.tenant_id, workspace_id)
        .await?;
    Ok(Json(json!({"documents": docs})))
}

pub async fn get_document(
    State(state): State<AdminState>,
    AdminPrincipal(principal): AdminPrincipal,
    Path(id): Path<Uuid>,
) -> KernelResult<Json<Value>> {
    let doc = state.kernel.documents.get(principal.tenant_id, id).await?;
    Ok(Json(serde_json::to_value(&doc).unwrap_or_default()))
}

#[derive(Deserialize)]
pub struct DocumentOpBody {
    pub op_type: crate::models::DocumentOpType,
    pub path: String,
    #[serde(default)]
    pub value: Value,
    /// The client's vector clock at edit time, if it tracks one.
    #[serde(default)]
    pub clock: Option<crate::models::VectorClock>,
}

pub async fn apply_document_op(
    State(state): State<AdminState>,
    AdminPrincipal(principal): AdminPrincipal,
    Path(id): Path<Uuid>,
    Json(body): Json<DocumentOpBody>,
) -> KernelResult<Json<Value>> {
    let op = state
        .kernel
        .documents
        .apply(
            principal.tenant_id,
            id,
            &principal.agent_id,
            body.op_type,
            &body.path,
            body.value,
            body.clock.as_ref(),
        )
        .await?;
    Ok(Json(serde_json::to_value(&op).unwrap_or_default()))
}

#[derive(Deserialize)]
pub struct OpsQuery {
    #[serde(default)]
    pub after_sequence: i64,
}

pub async fn list_document_ops(
    State(state): State<AdminState>,
    AdminPrincipal(principal): AdminPrincipal,
    Path(id): Path<Uuid>,
    Query(q): Query<OpsQuery>,
) -> KernelResult<Json<Value>> {
    let ops = state
        .kernel
        .documents
        .operations_since(principal.tenant_id, id, q.after_sequence)
        .await?;
    Ok(Json(json!({"operations": ops})))
}

pub async fn lock_document(
    State(state): State<AdminState>,
    AdminPrincipal(principal): AdminPrincipal,
    Path(id): Path<Uuid>,
) -> KernelResult<Json<Value>> {
    let acquired = state
        .kernel
        .documents
        .acquire_lock(principal.tenant_id, id, &principal.agent_id)
        .await?;
    if !acquired {
        return Err(KernelError::Conflict("document is locked by another agent".into()));
    }
    Ok(Json(json!({"locked": true})))
}

pub async fn unlock_document(
    State(state): State<AdminState>,
    AdminPrincipal(principal): AdminPrincipal,
    Path(id): Path<Uuid>,
) -> KernelResult<Json<Value>> {
    state
        .kernel
        .documents
        .release_lock(principal.tenant_id, id, &principal.agent_id)
        .await?;
    Ok(Json(json!({"locked": false})))
}

// === SESSIONS ===

pub async fn list_sessions(
    State(state): State<AdminState>,
    AdminPrincipal(principal): AdminPrincipal,
) -> KernelResult<Json<Value>> {
    let sessions = state.kernel.repos.sessions.list(principal.tenant_id).await?;
    Ok(Json(json!({
        "sessions": sessions,
        "live": state.kernel.sessions.count_for_tenant(principal.tenant_id),
    })))
}

pub async fn revoke_session(
    State(state): State<AdminState>,
    AdminPrincipal(principal): AdminPrincipal,
    Path(id): Path<Uuid>,
) -> KernelResult<StatusCode> {
    if let Some(entry) = state.kernel.sessions.get(id) {
        if entry.tenant_id() != principal.tenant_id && !principal.has_scope("admin") {
            return Err(KernelError::Forbidden("cross-tenant revocation".into()));
        }
        state.kernel.sessions.remove(id);
    }
    state.kernel.repos.sessions.delete(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

// === ASSIGNMENT RULES ===

#[derive(Deserialize)]
pub struct RuleBody {
    pub id: String,
    pub name: String,
    pub task_type: String,
    pub strategy: String,
}

pub async fn list_rules(
    State(state): State<AdminState>,
    AdminPrincipal(_principal): AdminPrincipal,
) -> KernelResult<Json<Value>> {
    let rules: Vec<Value> = state
        .kernel
        .engine
        .rules
        .list()
        .iter()
        .map(|r| {
            json!({
                "id": r.id,
                "name": r.name,
                "task_type": r.task_type,
                "strategy": r.strategy.label(),
            })
        })
        .collect();
    Ok(Json(json!({"rules": rules})))
}

pub async fn create_rule(
    State(state): State<AdminState>,
    AdminPrincipal(principal): AdminPrincipal,
    Json(body): Json<RuleBody>,
) -> KernelResult<(StatusCode, Json<Value>)> {
    if !principal.has_scope("admin") {
        return Err(KernelError::Forbidden("rule changes require admin".into()));
    }
    let strategy = match body.strategy.as_str() {
        "round-robin" => Strategy::RoundRobin,
        "least-loaded" => Strategy::LeastLoaded,
        "capability-match" => Strategy::CapabilityMatch,
        "cost-optimized" => Strategy::CostOptimized,
        "performance-based" => Strategy::PerformanceBased,
        other => {
            return Err(KernelError::InvalidInput(format!(
                "unknown strategy '{}'",
                other
            )))
        }
    };
    state.kernel.engine.rules.register(AssignmentRule {
        id: body.id.clone(),
        name: body.name,
        task_type: body.task_type,
        strategy,
    });
    Ok((StatusCode::CREATED, Json(json!({"id": body.id}))))
}

pub async fn delete_rule(
    State(state): State<AdminState>,
    AdminPrincipal(principal): AdminPrincipal,
    Path(id): Path<String>,
) -> KernelResult<StatusCode> {
    if !principal.has_scope("admin") {
        return Err(KernelError::Forbidden("rule changes require admin".into()));
    }
    if state.kernel.engine.rules.remove(&id) {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(KernelError::NotFound(format!("rule '{}'", id)))
    }
}

// === CACHE ===

#[derive(Deserialize)]
pub struct TopQuery {
    #[serde(default = "default_k")]
    pub k: usize,
}

fn default_k() -> usize {
    10
}

pub async fn cache_top_queries(
    State(state): State<AdminState>,
    AdminPrincipal(principal): AdminPrincipal,
    Query(q): Query<TopQuery>,
) -> KernelResult<Json<Value>> {
    let top = state
        .kernel
        .cache
        .top_queries(principal.tenant_id, q.k.min(100));
    let out: Vec<Value> = top
        .iter()
        .map(|(query, hits)| json!({"query": query, "hits": hits}))
        .collect();
    Ok(Json(json!({"top": out})))
}

pub async fn cache_stats(
    State(state): State<AdminState>,
    AdminPrincipal(principal): AdminPrincipal,
) -> KernelResult<Json<Value>> {
    let (entries, bytes) = state.kernel.cache.tenant_stats(principal.tenant_id).await?;
    Ok(Json(json!({
        "entries": entries,
        "payload_bytes": bytes,
    })))
}
