// [[AXON]]/apps/kernel-server/src/resilience/mod.rs
// Purpose: Resilience primitives shared by every upstream call path.
// Architecture: Infrastructure Layer
// Dependencies: dashmap, tokio

pub mod circuit_breaker;
pub mod rate_limit;
pub mod retry;

pub use circuit_breaker::{BreakerError, BreakerRegistry, BreakerState, CircuitBreaker};
pub use rate_limit::{RateLimiterSet, TokenBucket};
pub use retry::{retry, RetryPolicy};
