// [[AXON]]/apps/kernel-server/src/main.rs
// Purpose: Entry point. Builds the kernel, spawns the listeners and loops, drives drain.
// Architecture: Application Boot
// Dependencies: Tokio, Axum, sqlx, redis

mod assignment;
mod auth;
mod cache;
mod config;
mod documents;
mod error;
mod events;
mod gateway;
mod http;
mod kernel;
mod models;
mod observability;
mod pipeline;
mod protocol;
mod redis_client;
mod repo;
mod resilience;
mod tools;
mod workflow;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::assignment::AssignmentEngine;
use crate::auth::Authenticator;
use crate::cache::eviction::spawn_eviction_loop;
use crate::cache::SemanticCache;
use crate::config::{AppConfig, Secrets};
use crate::documents::DocumentService;
use crate::events::EventBus;
use crate::kernel::Kernel;
use crate::pipeline::consumer::{EventHandler, StreamConsumer};
use crate::pipeline::handlers::{BusForwarder, TaskRequestHandler};
use crate::pipeline::producer::WebhookProducer;
use crate::redis_client::RedisClient;
use crate::repo::{Db, Repositories};
use crate::resilience::{BreakerRegistry, RateLimiterSet};
use crate::tools::{providers::builtin_providers, ToolRegistry};
use crate::workflow::steps::ScriptRegistry;
use crate::workflow::WorkflowExecutor;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("axon_kernel=debug".parse()?)
                .add_directive("tower_http=info".parse()?),
        )
        .init();

    tracing::info!("Initializing AXON Kernel...");

    let cfg = AppConfig::load()?;
    let secrets = Secrets::from_env()?;
    let metrics_handle = observability::init_metrics()?;

    // === STORAGE & UPSTREAMS ===
    let breakers = Arc::new(BreakerRegistry::new(cfg.breaker.clone()));
    let db = Db::connect(
        &secrets.database_url,
        secrets.database_read_url.as_deref(),
        &cfg.database,
    )
    .await
    .map_err(|e| anyhow::anyhow!("database init failed: {}", e))?;
    let repos = Repositories::new(db);

    let redis = RedisClient::connect(&secrets.redis_url, &breakers)
        .await
        .map_err(|e| anyhow::anyhow!("redis init failed: {}", e))?;

    // === SERVICES ===
    let events = EventBus::new(1024);
    let limits = Arc::new(RateLimiterSet::new(cfg.rate_limit.clone()));
    let engine = Arc::new(AssignmentEngine::new(repos.clone(), cfg.assignment.clone()));
    let cache = Arc::new(SemanticCache::new(
        cfg.cache.clone(),
        Some(redis.clone()),
        Some(repos.cache_meta.clone()),
        limits.clone(),
        &secrets.tenant_master_key,
    ));
    let http_client = reqwest::Client::builder()
        .timeout(Duration::from_secs(30))
        .build()?;
    let tools = Arc::new(ToolRegistry::new(builtin_providers(
        http_client.clone(),
        &breakers,
    )));
    let executor = WorkflowExecutor::new(
        repos.clone(),
        engine.clone(),
        breakers.clone(),
        http_client,
        events.clone(),
        cfg.workflow.clone(),
        ScriptRegistry::new(),
    );
    let documents = Arc::new(DocumentService::new(repos.clone(), events.clone()));
    let auth = Arc::new(Authenticator::new(&secrets.jwt_secret));

    // === RECOVERY ===
    // A previous process may have died mid-execution; settle those rows
    // before accepting new work, and rebuild the similarity index from the
    // durable cache metadata.
    match executor.recover_stranded().await {
        Ok(0) => {}
        Ok(n) => tracing::warn!("recovered {} stranded workflow executions", n),
        Err(e) => tracing::warn!("stranded-execution recovery failed: {}", e),
    }
    match cache.rebuild_index().await {
        Ok(0) => {}
        Ok(n) => tracing::info!("rebuilt semantic cache index with {} embeddings", n),
        Err(e) => tracing::warn!("cache index rebuild failed: {}", e),
    }

    let kernel = Kernel::new(
        cfg.clone(),
        repos.clone(),
        Some(redis.clone()),
        events.clone(),
        engine.clone(),
        executor,
        cache.clone(),
        tools,
        documents,
        breakers,
        limits,
        auth,
    );

    // === EVENT PIPELINE ===
    let producer = Arc::new(WebhookProducer::new(
        redis.clone(),
        cfg.pipeline.clone(),
        secrets.webhook_secret.clone(),
    ));
    let mut stream_handlers: HashMap<String, Arc<dyn EventHandler>> = HashMap::new();
    stream_handlers.insert(
        "task.requested".to_string(),
        Arc::new(TaskRequestHandler {
            repos: repos.clone(),
            engine: engine.clone(),
        }),
    );
    stream_handlers.insert(
        "*".to_string(),
        Arc::new(BusForwarder {
            events: events.clone(),
        }),
    );
    let consumer = StreamConsumer::new(redis, cfg.pipeline.clone(), stream_handlers);
    if let Err(e) = consumer.ensure_group().await {
        tracing::warn!("consumer group setup failed (stream may appear later): {}", e);
    }
    let worker_handles = consumer.spawn_workers(kernel.shutdown.clone());

    // === BACKGROUND LOOPS ===
    let eviction_handle = spawn_eviction_loop(cache, kernel.shutdown.clone());
    let sweeper_handle = spawn_sweepers(kernel.clone());

    // === LISTENERS ===
    let gateway_task = tokio::spawn(gateway::serve(kernel.clone()));
    let admin_task = tokio::spawn(http::serve(http::AdminState {
        kernel: kernel.clone(),
        producer,
        metrics: metrics_handle,
    }));

    // === SHUTDOWN ===
    wait_for_signal().await;
    tracing::info!(
        "termination signal received; draining for {:?}",
        kernel.cfg.drain_window()
    );
    kernel.begin_drain();
    tokio::time::sleep(kernel.cfg.drain_window()).await;
    kernel.shutdown.cancel();

    for handle in worker_handles {
        let _ = handle.await;
    }
    let _ = eviction_handle.await;
    sweeper_handle.abort();
    let _ = tokio::time::timeout(Duration::from_secs(5), gateway_task).await;
    let _ = tokio::time::timeout(Duration::from_secs(5), admin_task).await;

    tracing::info!("AXON Kernel stopped cleanly");
    Ok(())
}

async fn wait_for_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut term = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}

/// Periodic maintenance: expired sessions leave both tables; agents whose
/// heartbeat lapsed go offline and drop out of assignment snapshots.
fn spawn_sweepers(kernel: Arc<Kernel>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(30));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = kernel.shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let swept = kernel.sessions.sweep_expired();
                    if !swept.is_empty() {
                        tracing::info!("swept {} expired sessions", swept.len());
                    }
                    if let Err(e) = kernel.repos.sessions.sweep_expired().await {
                        tracing::debug!("session row sweep failed: {}", e);
                    }
                    match kernel
                        .repos
                        .agents
                        .sweep_offline(kernel.cfg.assignment.heartbeat_window_secs)
                        .await
                    {
                        Ok(flipped) if !flipped.is_empty() => {
                            for (tenant_id, agent_id) in &flipped {
                                tracing::info!("agent {} marked offline", agent_id);
                                kernel.engine.invalidate_snapshot(*tenant_id);
                                kernel.events.publish(crate::events::DomainEvent::new(
                                    Some(*tenant_id),
                                    crate::events::EventTopic::Agent,
                                    "agent.offline",
                                    serde_json::json!({"agent_id": agent_id}),
                                ));
                            }
                        }
                        Ok(_) => {}
                        Err(e) => tracing::debug!("agent offline sweep failed: {}", e),
                    }
                }
            }
        }
    })
}
