// [[AXON]]/apps/kernel-server/src/resilience/rate_limit.rs
// Purpose: Token-bucket rate limiting, per-identity and global.
// Architecture: Infrastructure Layer
// Dependencies: dashmap, std

use std::sync::Arc;
use std::sync::Mutex;
use std::time::Instant;

use dashmap::DashMap;

use crate::config::RateLimitConfig;
use crate::error::KernelError;

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// A token bucket: capacity tokens, refilled at a steady per-second rate.
/// The Nth token in a bucket of capacity N is granted; the (N+1)th within
/// the same window is refused with a retry-after hint.
pub struct TokenBucket {
    capacity: f64,
    refill_per_sec: f64,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    pub fn new(capacity: u64, refill_per_sec: f64) -> Self {
        TokenBucket {
            capacity: capacity as f64,
            refill_per_sec,
            state: Mutex::new(BucketState {
                tokens: capacity as f64,
                last_refill: Instant::now(),
            }),
        }
    }

    pub fn try_acquire(&self) -> Result<(), KernelError> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let elapsed = state.last_refill.elapsed().as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        state.last_refill = Instant::now();

        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            Ok(())
        } else {
            let deficit = 1.0 - state.tokens;
            let retry_after_secs = (deficit / self.refill_per_sec).ceil().max(0.0) as u64;
            Err(KernelError::RateLimited { retry_after_secs })
        }
    }

    #[cfg(test)]
    fn drain(&self) {
        let mut state = self.state.lock().unwrap();
        state.tokens = 0.0;
        state.last_refill = Instant::now();
    }
}

/// Keyed buckets plus one global bucket. Keys are caller-defined identities
/// such as `session:{id}:{method_class}` or `tenant:{id}`.
pub struct RateLimiterSet {
    cfg: RateLimitConfig,
    buckets: DashMap<String, Arc<TokenBucket>>,
    global: TokenBucket,
}

impl RateLimiterSet {
    pub fn new(cfg: RateLimitConfig) -> Self {
        let global = TokenBucket::new(
            cfg.global_per_minute,
            cfg.global_per_minute as f64 / 60.0,
        );
        RateLimiterSet {
            cfg,
            buckets: DashMap::new(),
            global,
        }
    }

    /// Check the identity bucket and the global bucket. A token is consumed
    /// from both or neither error path matters: the identity bucket is the
    /// stricter admission gate and is checked first.
    pub fn check(&self, identity: &str) -> Result<(), KernelError> {
        let bucket = self
            .buckets
            .entry(identity.to_string())
            .or_insert_with(|| {
                Arc::new(TokenBucket::new(
                    self.cfg.burst,
                    self.cfg.per_minute as f64 / 60.0,
                ))
            })
            .clone();
        bucket.try_acquire()?;
        self.global.try_acquire()
    }

    /// Drop buckets that belong to closed sessions.
    pub fn forget_prefix(&self, prefix: &str) {
        self.buckets.retain(|k, _| !k.starts_with(prefix));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nth_token_granted_n_plus_first_refused() {
        let bucket = TokenBucket::new(5, 0.001);
        for _ in 0..5 {
            assert!(bucket.try_acquire().is_ok());
        }
        let refused = bucket.try_acquire();
        match refused {
            Err(KernelError::RateLimited { retry_after_secs }) => {
                assert!(retry_after_secs >= 1);
            }
            other => panic!("expected rate-limited, got {:?}", other),
        }
    }

    #[test]
    fn refill_restores_tokens() {
        let bucket = TokenBucket::new(10, 1000.0);
        bucket.drain();
        assert!(bucket.try_acquire().is_err());
        std::thread::sleep(std::time::Duration::from_millis(5));
        assert!(bucket.try_acquire().is_ok());
    }

    #[test]
    fn identities_get_independent_buckets() {
        let set = RateLimiterSet::new(RateLimitConfig {
            per_minute: 60,
            burst: 1,
            global_per_minute: 1000,
        });
        assert!(set.check("session:a:tools").is_ok());
        assert!(set.check("session:a:tools").is_err());
        assert!(set.check("session:b:tools").is_ok());
    }

    #[test]
    fn forget_prefix_drops_session_buckets() {
        let set = RateLimiterSet::new(RateLimitConfig::default());
        let _ = set.check("session:a:tools");
        let _ = set.check("session:b:tools");
        set.forget_prefix("session:a:");
        assert_eq!(set.buckets.len(), 1);
    }
}
