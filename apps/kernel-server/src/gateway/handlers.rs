// [[AXON]]/apps/kernel-server/src/gateway/handlers.rs
// Purpose: Method handlers behind the gateway registry.
// Architecture: Gateway Layer
// Dependencies: serde, serde_json

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashSet;
use uuid::Uuid;

use super::registry::{HandlerCtx, MethodHandler};
use crate::error::{KernelError, KernelResult};
use crate::events::{DomainEvent, EventTopic};
use crate::models::{builtin_model_catalog, Task, TaskPriority, TaskStatus};
use crate::repo::tasks::TaskFilter;
use crate::tools::ToolContext;

fn parse_params<T: for<'de> Deserialize<'de>>(params: Value) -> KernelResult<T> {
    serde_json::from_value(params).map_err(|e| KernelError::InvalidInput(format!("params: {}", e)))
}

// === CONTROL ===

pub struct Initialize;

#[async_trait]
impl MethodHandler for Initialize {
    async fn handle(&self, ctx: &HandlerCtx, params: Value) -> KernelResult<Value> {
        #[derive(Deserialize)]
        struct InitializeParams {
            #[serde(default)]
            client_info: Option<Value>,
            #[serde(default)]
            protocol_version: Option<String>,
        }
        let p: InitializeParams = parse_params(params)?;
        if let Some(info) = &p.client_info {
            tracing::info!(
                "session {} initialize from client {}",
                ctx.session_id,
                info.get("name").and_then(|n| n.as_str()).unwrap_or("unknown")
            );
        }

        // Issue the session refresh token; only its hash is retained.
        let refresh_token = Uuid::new_v4().to_string();
        let hash = crate::auth::hash_refresh_token(&refresh_token);
        if let Some(entry) = ctx.kernel.sessions.get(ctx.session_id) {
            let mut session = entry.session.lock().unwrap_or_else(|e| e.into_inner());
            session.refresh_token_hash = Some(hash.clone());
        }
        if let Err(e) = ctx
            .kernel
            .repos
            .sessions
            .set_refresh_token_hash(ctx.session_id, &hash)
            .await
        {
            tracing::debug!("refresh token persist failed: {}", e);
        }

        Ok(json!({
            "session_id": ctx.session_id,
            "refresh_token": refresh_token,
            "protocol_version": p.protocol_version.unwrap_or_else(|| "mcp.v1".to_string()),
            "server": {
                "name": "axon-kernel",
                "version": env!("CARGO_PKG_VERSION"),
            },
            "capabilities": {
                "tools": true,
                "resources": {"subscribe": true},
                "prompts": true,
                "tasks": true,
                "workflows": true,
            },
            "methods": ctx.kernel.registry.method_names(),
        }))
    }
}

pub struct Ping;

#[async_trait]
impl MethodHandler for Ping {
    async fn handle(&self, ctx: &HandlerCtx, _params: Value) -> KernelResult<Value> {
        // Client ping refreshes the session TTL, live table first.
        if let Some(entry) = ctx.kernel.sessions.get(ctx.session_id) {
            entry.touch();
        }
        if let Err(e) = ctx.kernel.repos.sessions.touch(ctx.session_id).await {
            tracing::debug!("session row refresh failed: {}", e);
        }
        Ok(json!({"pong": true, "time": Utc::now().to_rfc3339()}))
    }
}

/// Client-requested session close; the connection loop closes cleanly
/// after the response is flushed.
pub struct Shutdown;

#[async_trait]
impl MethodHandler for Shutdown {
    async fn handle(&self, _ctx: &HandlerCtx, _params: Value) -> KernelResult<Value> {
        Ok(json!({"closing": true}))
    }
}

// === TOOLS ===

pub fn tools_call_schema() -> Value {
    json!({
        "type": "object",
        "required": ["name"],
        "properties": {
            "name": {"type": "string"},
            "arguments": {"type": "object"},
        }
    })
}

pub struct ToolsList;

#[async_trait]
impl MethodHandler for ToolsList {
    async fn handle(&self, ctx: &HandlerCtx, _params: Value) -> KernelResult<Value> {
        Ok(json!({"tools": ctx.kernel.tools.list(ctx.principal.tenant_id)}))
    }
}

pub struct ToolsCall;

#[async_trait]
impl MethodHandler for ToolsCall {
    async fn handle(&self, ctx: &HandlerCtx, params: Value) -> KernelResult<Value> {
        #[derive(Deserialize)]
        struct CallParams {
            name: String,
            #[serde(default)]
            arguments: Value,
        }
        let p: CallParams = parse_params(params)?;
        let tool_ctx = ToolContext {
            tenant_id: ctx.principal.tenant_id,
            agent_id: ctx.principal.agent_id.clone(),
        };
        let result = ctx
            .kernel
            .tools
            .call(&tool_ctx, &p.name, p.arguments)
            .await?;
        Ok(json!({"content": result}))
    }
}

// === RESOURCES & PROMPTS ===

pub fn resources_read_schema() -> Value {
    json!({
        "type": "object",
        "required": ["uri"],
        "properties": {"uri": {"type": "string"}}
    })
}

pub fn resources_subscribe_schema() -> Value {
    json!({
        "type": "object",
        "required": ["topics"],
        "properties": {"topics": {"type": "array", "items": {"type": "string"}}}
    })
}

pub struct ResourcesList;

#[async_trait]
impl MethodHandler for ResourcesList {
    async fn handle(&self, _ctx: &HandlerCtx, _params: Value) -> KernelResult<Value> {
        Ok(json!({
            "resources": [
                {
                    "uri": "models://catalog",
                    "name": "Embedding model catalog",
                    "mime_type": "application/json",
                },
                {
                    "uri": "context://{context_id}",
                    "name": "Shared context",
                    "mime_type": "application/json",
                },
                {
                    "uri": "document://{document_id}",
                    "name": "Shared document",
                    "mime_type": "application/json",
                },
            ]
        }))
    }
}

pub struct ResourcesRead;

#[async_trait]
impl MethodHandler for ResourcesRead {
    async fn handle(&self, ctx: &HandlerCtx, params: Value) -> KernelResult<Value> {
        #[derive(Deserialize)]
        struct ReadParams {
            uri: String,
        }
        let p: ReadParams = parse_params(params)?;
        let tenant_id = ctx.principal.tenant_id;

        if p.uri == "models://catalog" {
            return Ok(json!({"contents": builtin_model_catalog()}));
        }
        if let Some(context_id) = p.uri.strip_prefix("context://") {
            let content = ctx.kernel.documents.context_get(tenant_id, context_id).await?;
            return Ok(json!({"contents": content}));
        }
        if let Some(raw) = p.uri.strip_prefix("document://") {
            let document_id: Uuid = raw
                .parse()
                .map_err(|_| KernelError::InvalidInput("malformed document id".into()))?;
            let doc = ctx.kernel.documents.get(tenant_id, document_id).await?;
            return Ok(json!({"contents": doc}));
        }
        Err(KernelError::NotFound(format!("resource '{}'", p.uri)))
    }
}

pub struct ResourcesSubscribe;

#[async_trait]
impl MethodHandler for ResourcesSubscribe {
    async fn handle(&self, ctx: &HandlerCtx, params: Value) -> KernelResult<Value> {
        #[derive(Deserialize)]
        struct SubscribeParams {
            topics: Vec<String>,
        }
        let p: SubscribeParams = parse_params(params)?;
        const KNOWN: [&str; 5] = ["task", "workflow", "document", "agent", "system"];
        for topic in &p.topics {
            if !KNOWN.contains(&topic.as_str()) {
                return Err(KernelError::InvalidInput(format!("unknown topic '{}'", topic)));
            }
        }
        let entry = ctx
            .kernel
            .sessions
            .get(ctx.session_id)
            .ok_or_else(|| KernelError::NotFound("session".into()))?;
        let topics: HashSet<String> = p.topics.iter().cloned().collect();
        entry.set_subscriptions(topics);

        // Durable copy is best-effort; the live table is authoritative.
        if let Err(e) = ctx
            .kernel
            .repos
            .sessions
            .set_subscriptions(ctx.session_id, &p.topics)
            .await
        {
            tracing::debug!("session subscription persist failed: {}", e);
        }
        Ok(json!({"subscribed": p.topics}))
    }
}

pub struct PromptsList;

#[async_trait]
impl MethodHandler for PromptsList {
    async fn handle(&self, _ctx: &HandlerCtx, _params: Value) -> KernelResult<Value> {
        Ok(json!({
            "prompts": [
                {
                    "name": "summarize-task",
                    "description": "Summarize a task and its transition history",
                    "arguments": [{"name": "task_id", "required": true}],
                },
                {
                    "name": "triage-failure",
                    "description": "Triage a failed workflow execution",
                    "arguments": [{"name": "execution_id", "required": true}],
                },
            ]
        }))
    }
}

// === TASKS ===

pub fn task_create_schema() -> Value {
    json!({
        "type": "object",
        "required": ["type", "title"],
        "properties": {
            "type": {"type": "string"},
            "title": {"type": "string"},
            "parameters": {"type": "object"},
            "priority": {"enum": ["low", "normal", "high", "urgent"]},
            "idempotency_key": {"type": "string"},
            "parent_id": {"type": "string"},
            "deadline": {"type": "string", "format": "date-time"},
        }
    })
}

pub fn task_id_schema() -> Value {
    json!({
        "type": "object",
        "required": ["task_id"],
        "properties": {"task_id": {"type": "string"}}
    })
}

pub struct TaskCreate;

#[async_trait]
impl MethodHandler for TaskCreate {
    async fn handle(&self, ctx: &HandlerCtx, params: Value) -> KernelResult<Value> {
        #[derive(Deserialize)]
        struct CreateParams {
            #[serde(rename = "type")]
            task_type: String,
            title: String,
            #[serde(default)]
            parameters: Value,
            #[serde(default)]
            priority: TaskPriority,
            #[serde(default)]
            idempotency_key: Option<String>,
            #[serde(default)]
            parent_id: Option<Uuid>,
            #[serde(default)]
            deadline: Option<DateTime<Utc>>,
        }
        let p: CreateParams = parse_params(params)?;
        if p.task_type.is_empty() || p.title.is_empty() {
            return Err(KernelError::InvalidInput("type and title must be non-empty".into()));
        }

        let task = Task {
            id: Uuid::new_v4(),
            tenant_id: ctx.principal.tenant_id,
            task_type: p.task_type,
            status: TaskStatus::Pending,
            priority: p.priority,
            title: p.title,
            parameters: if p.parameters.is_null() { json!({}) } else { p.parameters },
            assigned_to: None,
            delegated_from: None,
            parent_id: p.parent_id,
            created_by: ctx.principal.agent_id.clone(),
            idempotency_key: p.idempotency_key,
            version: 1,
            created_at: Utc::now(),
            assigned_at: None,
            accepted_at: None,
            started_at: None,
            completed_at: None,
            deadline: p.deadline,
            deleted_at: None,
        };
        let task = ctx.kernel.repos.tasks.create(&task).await?;

        // A pending row routes immediately; no eligible agent just leaves
        // it queued for the next registration.
        let task = if task.status == TaskStatus::Pending {
            match ctx.kernel.engine.assign(&task, &ctx.principal.agent_id).await {
                Ok(assigned) => assigned,
                Err(e) => {
                    tracing::info!("task {} left pending: {}", task.id, e);
                    task
                }
            }
        } else {
            task
        };
        ctx.kernel.events.publish(DomainEvent::new(
            Some(task.tenant_id),
            EventTopic::Task,
            "task.created",
            json!({"task_id": task.id, "status": task.status, "assigned_to": task.assigned_to}),
        ));
        Ok(serde_json::to_value(&task).unwrap_or_default())
    }
}

pub struct TaskStatusQuery;

#[async_trait]
impl MethodHandler for TaskStatusQuery {
    async fn handle(&self, ctx: &HandlerCtx, params: Value) -> KernelResult<Value> {
        #[derive(Deserialize)]
        struct StatusParams {
            task_id: Uuid,
        }
        let p: StatusParams = parse_params(params)?;
        let tenant_id = ctx.principal.tenant_id;
        let task = ctx.kernel.repos.tasks.get(tenant_id, p.task_id).await?;
        let transitions = ctx.kernel.repos.tasks.transitions(tenant_id, p.task_id).await?;
        Ok(json!({"task": task, "transitions": transitions}))
    }
}

pub struct TaskCancel;

#[async_trait]
impl MethodHandler for TaskCancel {
    async fn handle(&self, ctx: &HandlerCtx, params: Value) -> KernelResult<Value> {
        #[derive(Deserialize)]
        struct CancelParams {
            task_id: Uuid,
        }
        let p: CancelParams = parse_params(params)?;
        let tenant_id = ctx.principal.tenant_id;
        let task = ctx.kernel.repos.tasks.get(tenant_id, p.task_id).await?;
        if !task.status.can_transition_to(TaskStatus::Cancelled) {
            return Err(KernelError::Conflict(format!(
                "task in status {:?} cannot be cancelled",
                task.status
            )));
        }
        let task = ctx
            .kernel
            .repos
            .tasks
            .transition(
                tenant_id,
                task.id,
                task.status,
                TaskStatus::Cancelled,
                task.version,
                &ctx.principal.agent_id,
                None,
            )
            .await?;
        if let Some(agent) = &task.assigned_to {
            let _ = ctx
                .kernel
                .repos
                .agents
                .adjust_workload(tenant_id, agent, 0, -1)
                .await;
        }
        ctx.kernel.events.publish(DomainEvent::new(
            Some(tenant_id),
            EventTopic::Task,
            "task.cancelled",
            json!({"task_id": task.id, "actor": ctx.principal.agent_id}),
        ));
        Ok(serde_json::to_value(&task).unwrap_or_default())
    }
}

pub struct TaskList;

#[async_trait]
impl MethodHandler for TaskList {
    async fn handle(&self, ctx: &HandlerCtx, params: Value) -> KernelResult<Value> {
        #[derive(Deserialize)]
        struct ListParams {
            #[serde(default)]
            status: Option<TaskStatus>,
            #[serde(rename = "type", default)]
            task_type: Option<String>,
            #[serde(default)]
            assigned_to: Option<String>,
            #[serde(default)]
            include_archived: bool,
            #[serde(default)]
            limit: Option<i64>,
        }
        let p: ListParams = parse_params(params)?;
        let filter = TaskFilter {
            status: p.status,
            task_type: p.task_type,
            assigned_to: p.assigned_to,
            parent_id: None,
            include_archived: p.include_archived,
            limit: p.limit.unwrap_or(100).clamp(1, 500),
        };
        let tasks = ctx
            .kernel
            .repos
            .tasks
            .list(ctx.principal.tenant_id, &filter)
            .await?;
        Ok(json!({"tasks": tasks}))
    }
}

// === WORKFLOWS ===

pub fn workflow_execute_schema() -> Value {
    json!({
        "type": "object",
        "required": ["workflow_id"],
        "properties": {
            "workflow_id": {"type": "string"},
            "context": {"type": "object"},
        }
    })
}

pub struct WorkflowExecute;

#[async_trait]
impl MethodHandler for WorkflowExecute {
    async fn handle(&self, ctx: &HandlerCtx, params: Value) -> KernelResult<Value> {
        #[derive(Deserialize)]
        struct ExecuteParams {
            workflow_id: Uuid,
            #[serde(default)]
            context: Value,
        }
        let p: ExecuteParams = parse_params(params)?;
        let workflow = ctx
            .kernel
            .repos
            .workflows
            .get(ctx.principal.tenant_id, p.workflow_id)
            .await?;
        let context = if p.context.is_null() { json!({}) } else { p.context };
        let execution_id = ctx.kernel.executor.start(workflow, context).await?;
        Ok(json!({"execution_id": execution_id, "status": "pending"}))
    }
}

pub struct WorkflowList;

#[async_trait]
impl MethodHandler for WorkflowList {
    async fn handle(&self, ctx: &HandlerCtx, params: Value) -> KernelResult<Value> {
        #[derive(Deserialize)]
        struct ListParams {
            #[serde(default)]
            include_archived: bool,
        }
        let p: ListParams = parse_params(params)?;
        let workflows = ctx
            .kernel
            .repos
            .workflows
            .list(ctx.principal.tenant_id, p.include_archived)
            .await?;
        Ok(json!({"workflows": workflows}))
    }
}

// === CONTEXTS & SEARCH ===

pub fn context_update_schema() -> Value {
    json!({
        "type": "object",
        "required": ["context_id", "path", "value"],
        "properties": {
            "context_id": {"type": "string"},
            "path": {"type": "string"},
            "value": {},
        }
    })
}

pub fn context_get_schema() -> Value {
    json!({
        "type": "object",
        "required": ["context_id"],
        "properties": {"context_id": {"type": "string"}}
    })
}

pub fn search_schema() -> Value {
    json!({
        "type": "object",
        "required": ["query"],
        "properties": {
            "query": {"type": "string"},
            "embedding": {"type": "array", "items": {"type": "number"}},
        }
    })
}

pub struct ContextUpdate;

#[async_trait]
impl MethodHandler for ContextUpdate {
    async fn handle(&self, ctx: &HandlerCtx, params: Value) -> KernelResult<Value> {
        #[derive(Deserialize)]
        struct UpdateParams {
            context_id: String,
            path: String,
            value: Value,
        }
        let p: UpdateParams = parse_params(params)?;
        if p.context_id.is_empty() {
            return Err(KernelError::InvalidInput("empty context id".into()));
        }
        let op = ctx
            .kernel
            .documents
            .context_update(
                ctx.principal.tenant_id,
                &p.context_id,
                &ctx.principal.agent_id,
                &p.path,
                p.value,
            )
            .await?;
        Ok(json!({"sequence": op.sequence, "clock": op.clock}))
    }
}

pub struct ContextGet;

#[async_trait]
impl MethodHandler for ContextGet {
    async fn handle(&self, ctx: &HandlerCtx, params: Value) -> KernelResult<Value> {
        #[derive(Deserialize)]
        struct GetParams {
            context_id: String,
        }
        let p: GetParams = parse_params(params)?;
        ctx.kernel
            .documents
            .context_get(ctx.principal.tenant_id, &p.context_id)
            .await
    }
}

pub struct SearchSemantic;

#[async_trait]
impl MethodHandler for SearchSemantic {
    async fn handle(&self, ctx: &HandlerCtx, params: Value) -> KernelResult<Value> {
        #[derive(Deserialize)]
        struct SearchParams {
            query: String,
            #[serde(default)]
            embedding: Option<Vec<f32>>,
        }
        let p: SearchParams = parse_params(params)?;
        let outcome = ctx
            .kernel
            .cache
            .get(
                ctx.principal.tenant_id,
                &p.query,
                p.embedding.as_deref(),
            )
            .await?;
        // Embedding inference is the provider's job; a miss is a miss.
        Ok(match outcome {
            crate::cache::CacheOutcome::Hit { payload, similarity } => json!({
                "result": "hit",
                "payload": payload,
                "similarity": similarity,
            }),
            crate::cache::CacheOutcome::Miss => json!({"result": "miss"}),
            crate::cache::CacheOutcome::Disabled => json!({"result": "disabled"}),
        })
    }
}
