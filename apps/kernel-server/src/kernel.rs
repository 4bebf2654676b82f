// [[AXON]]/apps/kernel-server/src/kernel.rs
// Purpose: Process-wide service aggregate. Built once at boot, shared via Arc.
// Architecture: Composition Root
// Dependencies: all domain layers

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::assignment::AssignmentEngine;
use crate::auth::Authenticator;
use crate::cache::SemanticCache;
use crate::config::AppConfig;
use crate::documents::DocumentService;
use crate::events::EventBus;
use crate::gateway::registry::HandlerRegistry;
use crate::gateway::sessions::SessionTable;
use crate::redis_client::RedisClient;
use crate::repo::Repositories;
use crate::resilience::{BreakerRegistry, RateLimiterSet};
use crate::tools::ToolRegistry;
use crate::workflow::WorkflowExecutor;

pub struct Kernel {
    pub cfg: AppConfig,
    pub repos: Repositories,
    pub redis: Option<RedisClient>,
    pub events: EventBus,
    pub sessions: SessionTable,
    pub engine: Arc<AssignmentEngine>,
    pub executor: Arc<WorkflowExecutor>,
    pub cache: Arc<SemanticCache>,
    pub tools: Arc<ToolRegistry>,
    pub documents: Arc<DocumentService>,
    pub breakers: Arc<BreakerRegistry>,
    pub limits: Arc<RateLimiterSet>,
    pub auth: Arc<Authenticator>,
    pub registry: HandlerRegistry,
    /// Cancelled when draining begins: connections notify their clients and
    /// stop accepting new requests.
    pub drain: CancellationToken,
    /// Root cancellation: everything long-running observes this.
    pub shutdown: CancellationToken,
    draining: AtomicBool,
}

impl Kernel {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cfg: AppConfig,
        repos: Repositories,
        redis: Option<RedisClient>,
        events: EventBus,
        engine: Arc<AssignmentEngine>,
        executor: Arc<WorkflowExecutor>,
        cache: Arc<SemanticCache>,
        tools: Arc<ToolRegistry>,
        documents: Arc<DocumentService>,
        breakers: Arc<BreakerRegistry>,
        limits: Arc<RateLimiterSet>,
        auth: Arc<Authenticator>,
    ) -> Arc<Self> {
        let sessions = SessionTable::new(
            cfg.gateway.max_connections,
            cfg.gateway.max_sessions_per_tenant,
        );
        Arc::new(Kernel {
            cfg,
            repos,
            redis,
            events,
            sessions,
            engine,
            executor,
            cache,
            tools,
            documents,
            breakers,
            limits,
            auth,
            registry: HandlerRegistry::builtin(),
            drain: CancellationToken::new(),
            shutdown: CancellationToken::new(),
            draining: AtomicBool::new(false),
        })
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::Acquire)
    }

    /// Flip into draining: no new connections or requests, in-flight work
    /// keeps running until the drain window lapses.
    pub fn begin_drain(&self) {
        self.draining.store(true, Ordering::Release);
        self.drain.cancel();
    }
}
