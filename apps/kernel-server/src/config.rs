// [[AXON]]/apps/kernel-server/src/config.rs
// Purpose: Layered configuration. Defaults <- axon.toml <- AXON_* env overrides.
// Architecture: Configuration Layer
// Dependencies: config, serde

use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

/// Secrets are never part of the layered file config; they are read from the
/// process environment only, at boot.
#[derive(Debug, Clone)]
pub struct Secrets {
    pub database_url: String,
    pub database_read_url: Option<String>,
    pub redis_url: String,
    pub jwt_secret: String,
    pub tenant_master_key: String,
    pub webhook_secret: String,
}

impl Secrets {
    pub fn from_env() -> Result<Self, config::ConfigError> {
        let require = |key: &str| {
            env::var(key).map_err(|_| {
                config::ConfigError::Message(format!("missing required env var {}", key))
            })
        };
        Ok(Secrets {
            database_url: require("AXON_DATABASE_URL")?,
            database_read_url: env::var("AXON_DATABASE_READ_URL").ok(),
            redis_url: require("AXON_REDIS_URL")?,
            jwt_secret: require("AXON_JWT_SECRET")?,
            tenant_master_key: require("AXON_TENANT_MASTER_KEY")?,
            webhook_secret: require("AXON_WEBHOOK_SECRET")?,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub port: u16,
    pub max_connections: usize,
    pub max_sessions_per_tenant: usize,
    pub send_queue_capacity: usize,
    pub recv_queue_capacity: usize,
    pub read_buffer_size: usize,
    pub write_buffer_size: usize,
    pub max_message_size: usize,
    pub ping_interval_secs: u64,
    pub pong_timeout_secs: u64,
    pub session_ttl_secs: u64,
    pub drain_window_secs: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        GatewayConfig {
            port: 3000,
            max_connections: 10_000,
            max_sessions_per_tenant: 100,
            send_queue_capacity: 256,
            recv_queue_capacity: 256,
            read_buffer_size: 64 * 1024,
            write_buffer_size: 64 * 1024,
            max_message_size: 1024 * 1024,
            ping_interval_secs: 30,
            pong_timeout_secs: 60,
            session_ttl_secs: 3600,
            drain_window_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Sustained budget per bucket, tokens per minute.
    pub per_minute: u64,
    /// Burst capacity on top of the sustained rate.
    pub burst: u64,
    /// Global bucket capacity shared by everything in the process.
    pub global_per_minute: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        RateLimitConfig {
            per_minute: 1000,
            burst: 100,
            global_per_minute: 50_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AdminConfig {
    pub port: u16,
}

impl Default for AdminConfig {
    fn default() -> Self {
        AdminConfig { port: 8081 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum EvictionStrategy {
    Lru,
    Lfu,
    Ttl,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,
    pub ttl_secs: u64,
    pub max_entries_per_tenant: usize,
    pub max_memory_mb_per_tenant: usize,
    pub max_query_length: usize,
    pub similarity_threshold: f32,
    pub eviction_strategy: EvictionStrategy,
    pub eviction_interval_secs: u64,
    /// Substrings that mark a payload as sensitive and force encryption.
    pub sensitive_markers: Vec<String>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            enabled: true,
            ttl_secs: 3600,
            max_entries_per_tenant: 10_000,
            max_memory_mb_per_tenant: 256,
            max_query_length: 1000,
            similarity_threshold: 0.7,
            eviction_strategy: EvictionStrategy::Lru,
            eviction_interval_secs: 300,
            sensitive_markers: vec![
                "password".to_string(),
                "secret".to_string(),
                "api_key".to_string(),
                "token".to_string(),
            ],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub stream: String,
    pub consumer_group: Option<String>,
    pub workers: usize,
    pub max_attempts: u32,
    pub block_ms: u64,
    pub claim_batch: usize,
    pub backoff_base_ms: u64,
    pub backoff_cap_ms: u64,
    pub dedup_ttl_secs: u64,
    /// Idle time after which a pending record is reclaimed from a dead worker.
    pub reclaim_idle_ms: u64,
}

impl PipelineConfig {
    pub fn group(&self) -> String {
        self.consumer_group
            .clone()
            .unwrap_or_else(|| format!("{}_workers", self.stream))
    }

    pub fn dlq_stream(&self) -> String {
        format!("{}_dlq", self.stream)
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        PipelineConfig {
            stream: "webhook_events".to_string(),
            consumer_group: None,
            workers: 4,
            max_attempts: 5,
            block_ms: 5000,
            claim_batch: 10,
            backoff_base_ms: 500,
            backoff_cap_ms: 30_000,
            dedup_ttl_secs: 600,
            reclaim_idle_ms: 60_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    pub window_size: usize,
    pub min_requests: usize,
    pub failure_ratio: f64,
    pub timeout_streak: u32,
    pub reset_timeout_secs: u64,
    pub success_threshold: u32,
    pub half_open_max_calls: usize,
    pub call_timeout_secs: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        BreakerConfig {
            window_size: 20,
            min_requests: 10,
            failure_ratio: 0.6,
            timeout_streak: 3,
            reset_timeout_secs: 30,
            success_threshold: 2,
            half_open_max_calls: 5,
            call_timeout_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AssignmentConfig {
    /// Weights for the performance-based strategy: success rate,
    /// inverse completion time, availability.
    pub performance_weights: [f64; 3],
    pub workload_snapshot_ttl_secs: u64,
    pub heartbeat_window_secs: u64,
    /// An agent above this active-task count is considered overloaded.
    pub overload_threshold: u32,
}

impl Default for AssignmentConfig {
    fn default() -> Self {
        AssignmentConfig {
            performance_weights: [0.5, 0.3, 0.2],
            workload_snapshot_ttl_secs: 30,
            heartbeat_window_secs: 60,
            overload_threshold: 50,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub max_connections: u32,
    pub query_timeout_secs: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        DatabaseConfig {
            max_connections: 20,
            query_timeout_secs: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkflowConfig {
    pub default_step_timeout_secs: u64,
    pub task_poll_interval_ms: u64,
    pub max_parallel_children: usize,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        WorkflowConfig {
            default_step_timeout_secs: 300,
            task_poll_interval_ms: 500,
            max_parallel_children: 16,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub gateway: GatewayConfig,
    pub admin: AdminConfig,
    pub rate_limit: RateLimitConfig,
    pub cache: CacheConfig,
    pub pipeline: PipelineConfig,
    pub breaker: BreakerConfig,
    pub assignment: AssignmentConfig,
    pub database: DatabaseConfig,
    pub workflow: WorkflowConfig,
}

impl AppConfig {
    /// Layered load: built-in defaults, then an optional `axon.toml`, then
    /// AXON_* environment overrides (AXON_GATEWAY__PORT=4000 style).
    pub fn load() -> Result<Self, config::ConfigError> {
        let defaults = config::Config::try_from(&AppConfig::default())?;
        config::Config::builder()
            .add_source(defaults)
            .add_source(config::File::with_name("axon").required(false))
            .add_source(config::Environment::with_prefix("AXON").separator("__"))
            .build()?
            .try_deserialize()
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.gateway.ping_interval_secs)
    }

    pub fn pong_timeout(&self) -> Duration {
        Duration::from_secs(self.gateway.pong_timeout_secs)
    }

    pub fn drain_window(&self) -> Duration {
        Duration::from_secs(self.gateway.drain_window_secs)
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_secs(self.database.query_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_contract() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.gateway.max_sessions_per_tenant, 100);
        assert_eq!(cfg.gateway.send_queue_capacity, 256);
        assert_eq!(cfg.rate_limit.per_minute, 1000);
        assert_eq!(cfg.rate_limit.burst, 100);
        assert_eq!(cfg.cache.max_query_length, 1000);
        assert!((cfg.cache.similarity_threshold - 0.7).abs() < f32::EPSILON);
        assert_eq!(cfg.pipeline.max_attempts, 5);
        assert_eq!(cfg.pipeline.dedup_ttl_secs, 600);
        assert_eq!(cfg.breaker.reset_timeout_secs, 30);
        assert_eq!(cfg.breaker.success_threshold, 2);
        assert_eq!(cfg.breaker.half_open_max_calls, 5);
        assert_eq!(cfg.assignment.performance_weights, [0.5, 0.3, 0.2]);
    }

    #[test]
    fn pipeline_derived_names() {
        let cfg = PipelineConfig::default();
        assert_eq!(cfg.group(), "webhook_events_workers");
        assert_eq!(cfg.dlq_stream(), "webhook_events_dlq");
    }
}
