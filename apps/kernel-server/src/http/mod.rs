// [[AXON]]/apps/kernel-server/src/http/mod.rs
// Purpose: Admin REST surface on its own port. CRUD, health, metrics, webhook ingress.
// Architecture: API Layer
// Dependencies: axum, tower-http

pub mod handlers;

use axum::extract::FromRef;
use axum::routing::{delete, get, post, put};
use axum::Router;
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::auth::Authenticator;
use crate::kernel::Kernel;
use crate::pipeline::producer::WebhookProducer;

#[derive(Clone)]
pub struct AdminState {
    pub kernel: Arc<Kernel>,
    pub producer: Arc<WebhookProducer>,
    pub metrics: PrometheusHandle,
}

impl FromRef<AdminState> for Arc<Authenticator> {
    fn from_ref(state: &AdminState) -> Arc<Authenticator> {
        state.kernel.auth.clone()
    }
}

pub fn router(state: AdminState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handlers::health))
        .route("/metrics", get(handlers::metrics))
        .route("/webhooks/:source", post(handlers::ingest_webhook))
        // Tenants
        .route("/api/tenants", post(handlers::create_tenant).get(handlers::list_tenants))
        .route("/api/tenants/:id", get(handlers::get_tenant).delete(handlers::delete_tenant))
        .route("/api/tenants/:id/features", put(handlers::update_tenant_features))
        // Agents
        .route("/api/agents", get(handlers::list_agents).post(handlers::register_agent))
        .route("/api/agents/:id/heartbeat", post(handlers::agent_heartbeat))
        // Tasks (operator surface; agent flows run over the gateway)
        .route("/api/tasks/batch", post(handlers::create_tasks_batch))
        .route("/api/tasks/:id", delete(handlers::archive_task))
        .route("/api/tasks/:id/transition", post(handlers::transition_task))
        .route("/api/tasks/:id/delegate", post(handlers::delegate_task))
        // Workflows
        .route("/api/workflows", post(handlers::create_workflow).get(handlers::list_workflows))
        .route(
            "/api/workflows/:id",
            get(handlers::get_workflow)
                .put(handlers::update_workflow)
                .delete(handlers::delete_workflow),
        )
        .route("/api/workflows/:id/execute", post(handlers::execute_workflow))
        .route("/api/executions/:id", get(handlers::get_execution))
        .route("/api/executions/:id/approve", post(handlers::approve_execution))
        .route("/api/executions/:id/cancel", post(handlers::cancel_execution))
        // Workspaces & shared documents
        .route("/api/workspaces", post(handlers::create_workspace))
        .route("/api/workspaces/:id", get(handlers::get_workspace))
        .route("/api/workspaces/:id/members", put(handlers::update_workspace_members))
        .route(
            "/api/workspaces/:id/documents",
            post(handlers::create_document).get(handlers::list_documents),
        )
        .route("/api/documents/:id", get(handlers::get_document))
        .route("/api/documents/:id/operations", post(handlers::apply_document_op).get(handlers::list_document_ops))
        .route("/api/documents/:id/lock", post(handlers::lock_document).delete(handlers::unlock_document))
        // Sessions
        .route("/api/sessions", get(handlers::list_sessions))
        .route("/api/sessions/:id", delete(handlers::revoke_session))
        // Assignment rules (tool configs live in tenant features)
        .route("/api/rules", get(handlers::list_rules).post(handlers::create_rule))
        .route("/api/rules/:id", delete(handlers::delete_rule))
        // Cache statistics
        .route("/api/cache/top", get(handlers::cache_top_queries))
        .route("/api/cache/stats", get(handlers::cache_stats))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Serve the admin surface until shutdown.
pub async fn serve(state: AdminState) -> anyhow::Result<()> {
    let port = state.kernel.cfg.admin.port;
    let shutdown = state.kernel.shutdown.clone();
    let addr = format!("0.0.0.0:{}", port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("admin surface listening on http://{}", addr);
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}
