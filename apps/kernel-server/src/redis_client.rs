// [[AXON]]/apps/kernel-server/src/redis_client.rs
// Purpose: Resilience-wrapped Redis access. Handlers never touch redis-rs directly.
// Architecture: Infrastructure Layer
// Dependencies: redis (tokio-comp, connection-manager), resilience

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use redis::aio::ConnectionManager;

use crate::error::KernelError;
use crate::resilience::{retry, BreakerError, BreakerRegistry, CircuitBreaker, RetryPolicy};

#[derive(Clone)]
pub struct RedisClient {
    manager: ConnectionManager,
    breaker: Arc<CircuitBreaker>,
    retry_policy: RetryPolicy,
}

impl RedisClient {
    pub async fn connect(url: &str, breakers: &BreakerRegistry) -> Result<Self, KernelError> {
        let client = redis::Client::open(url)
            .map_err(|e| KernelError::Upstream(format!("redis url: {}", e)))?;
        let manager = ConnectionManager::new(client)
            .await
            .map_err(|e| KernelError::Upstream(format!("redis connect: {}", e)))?;
        Ok(RedisClient {
            manager,
            breaker: breakers.get("redis"),
            retry_policy: RetryPolicy::new(3, Duration::from_millis(50), Duration::from_secs(1)),
        })
    }

    /// Run one Redis interaction under breaker + retry. The closure receives
    /// its own manager clone per attempt; the manager reconnects internally.
    pub async fn run<T, F, Fut>(&self, op_name: &'static str, f: F) -> Result<T, KernelError>
    where
        F: Fn(ConnectionManager) -> Fut,
        Fut: Future<Output = redis::RedisResult<T>>,
    {
        let result = retry(
            &self.retry_policy,
            |e: &BreakerError<redis::RedisError>| match e {
                // An open circuit means stop hammering, not retry harder.
                BreakerError::Open(_) => false,
                BreakerError::Inner(inner) => {
                    inner.is_timeout() || inner.is_connection_dropped() || inner.is_io_error()
                }
            },
            || self.breaker.call(|| f(self.manager.clone())),
        )
        .await;

        result.map_err(|e| match e {
            BreakerError::Open(name) => KernelError::CircuitOpen(name),
            BreakerError::Inner(inner) => {
                tracing::warn!("redis {} failed: {}", op_name, inner);
                KernelError::Upstream(format!("redis {}: {}", op_name, inner))
            }
        })
    }
}
