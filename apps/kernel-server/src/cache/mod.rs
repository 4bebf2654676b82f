// [[AXON]]/apps/kernel-server/src/cache/mod.rs
// Purpose: Tenant-partitioned semantic cache for embedding query results.
// Architecture: Domain Logic Layer
// Dependencies: dashmap, redis, sha2

pub mod crypto;
pub mod eviction;
pub mod vector;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BinaryHeap;
use std::cmp::Reverse;
use std::sync::Arc;
use uuid::Uuid;

use crate::config::CacheConfig;
use crate::error::KernelError;
use crate::redis_client::RedisClient;
use crate::repo::cache_meta::{CacheMetaRepo, CacheMetaRow};
use crate::resilience::RateLimiterSet;
use crypto::PayloadCipher;
use vector::TenantVectorIndex;

#[derive(Debug, Clone, PartialEq)]
pub enum CacheOutcome {
    Hit {
        payload: serde_json::Value,
        /// Present when the hit came from the vector fallback.
        similarity: Option<f32>,
    },
    Miss,
    Disabled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub tenant_id: Uuid,
    pub key: String,
    pub query_hash: String,
    pub normalized_query: String,
    pub payload: String,
    pub encrypted: bool,
    pub payload_bytes: usize,
    pub created_at: DateTime<Utc>,
    pub last_accessed: DateTime<Utc>,
    pub hit_count: u64,
    pub ttl_secs: u64,
}

impl CacheEntry {
    /// The in-process tier honors the same per-entry TTL Redis enforces
    /// with EX; age runs from creation, not last access.
    pub fn expired_at(&self, now: DateTime<Utc>) -> bool {
        let age = now.signed_duration_since(self.created_at);
        age.num_seconds() >= 0 && age.num_seconds() as u64 > self.ttl_secs
    }
}

/// Lowercase, trimmed, whitespace-collapsed form used for keying.
pub fn normalize(query: &str) -> String {
    let mut out = String::with_capacity(query.len());
    let mut last_was_space = true;
    for c in query.trim().chars() {
        if c.is_whitespace() {
            if !last_was_space {
                out.push(' ');
                last_was_space = true;
            }
        } else {
            for lower in c.to_lowercase() {
                out.push(lower);
            }
            last_was_space = false;
        }
    }
    if out.ends_with(' ') {
        out.pop();
    }
    out
}

/// Strip anything unsafe for the key space; spaces become underscores.
pub fn sanitize(s: &str) -> String {
    s.chars()
        .map(|c| {
            if c.is_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

fn query_hash(normalized: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(normalized.as_bytes());
    hex::encode(hasher.finalize())
}

/// Hash tags around the tenant id force cluster co-location of one
/// tenant's keys; the tenant id prefix makes cross-tenant reads
/// impossible by construction.
pub fn key_for(tenant_id: Uuid, normalized: &str) -> String {
    format!("cache:{{{}}}:q:{}", tenant_id, sanitize(normalized))
}

pub struct SemanticCache {
    cfg: CacheConfig,
    /// Copy-on-write entry store: values are replaced wholesale on hit so
    /// concurrent readers never observe a half-updated entry.
    entries: DashMap<String, Arc<CacheEntry>>,
    /// (tenant, query_hash) -> key, for vector-fallback resolution.
    by_hash: DashMap<(Uuid, String), String>,
    index: TenantVectorIndex,
    redis: Option<RedisClient>,
    crypto: PayloadCipher,
    limiter: Arc<RateLimiterSet>,
    meta: Option<Arc<CacheMetaRepo>>,
    /// Tenants whose feature flags disable the cache.
    disabled_tenants: DashMap<Uuid, ()>,
}

impl SemanticCache {
    pub fn new(
        cfg: CacheConfig,
        redis: Option<RedisClient>,
        meta: Option<Arc<CacheMetaRepo>>,
        limiter: Arc<RateLimiterSet>,
        master_key: &str,
    ) -> Self {
        SemanticCache {
            cfg,
            entries: DashMap::new(),
            by_hash: DashMap::new(),
            index: TenantVectorIndex::new(),
            redis,
            crypto: PayloadCipher::new(master_key),
            limiter,
            meta,
            disabled_tenants: DashMap::new(),
        }
    }

    pub fn set_tenant_disabled(&self, tenant_id: Uuid, disabled: bool) {
        if disabled {
            self.disabled_tenants.insert(tenant_id, ());
        } else {
            self.disabled_tenants.remove(&tenant_id);
        }
    }

    fn enabled_for(&self, tenant_id: Uuid) -> bool {
        self.cfg.enabled && !self.disabled_tenants.contains_key(&tenant_id)
    }

    fn validate_query(&self, query: &str) -> Result<(), KernelError> {
        if query.len() > self.cfg.max_query_length {
            return Err(KernelError::InvalidInput(format!(
                "query of {} bytes exceeds max_length {}",
                query.len(),
                self.cfg.max_query_length
            )));
        }
        if query.chars().any(|c| c.is_control() && c != '\n' && c != '\t') {
            return Err(KernelError::InvalidInput(
                "query contains control characters".into(),
            ));
        }
        Ok(())
    }

    fn is_sensitive(&self, query: &str, payload: &str) -> bool {
        let q = query.to_ascii_lowercase();
        let p = payload.to_ascii_lowercase();
        self.cfg
            .sensitive_markers
            .iter()
            .any(|m| q.contains(m) || p.contains(m))
    }

    fn decode_payload(&self, entry: &CacheEntry) -> Result<serde_json::Value, KernelError> {
        let raw = if entry.encrypted {
            let bytes = self.crypto.decrypt(entry.tenant_id, &entry.payload)?;
            String::from_utf8(bytes)
                .map_err(|_| KernelError::Internal("cached payload is not utf-8".into()))?
        } else {
            entry.payload.clone()
        };
        serde_json::from_str(&raw)
            .map_err(|e| KernelError::Internal(format!("cached payload decode: {}", e)))
    }

    /// Drop one entry from the entry store, the hash map and the vector
    /// index together (metadata and Redis age out on their own TTLs).
    fn drop_expired(&self, entry: &CacheEntry) {
        self.entries.remove(&entry.key);
        self.by_hash
            .remove(&(entry.tenant_id, entry.query_hash.clone()));
        self.index
            .remove_batch(entry.tenant_id, &[entry.query_hash.clone()]);
        metrics::counter!("cache_expirations_total").increment(1);
    }

    /// Replace the stored entry with a bumped copy and return the payload.
    /// An entry past its TTL is dropped instead of served, so the read
    /// falls through to the Redis and vector tiers.
    fn register_hit(&self, key: &str) -> Option<Arc<CacheEntry>> {
        let entry = self.entries.get(key)?.clone();
        if entry.expired_at(Utc::now()) {
            self.drop_expired(&entry);
            return None;
        }
        let mut bumped = (*entry).clone();
        bumped.hit_count += 1;
        bumped.last_accessed = Utc::now();
        let bumped = Arc::new(bumped);
        self.entries.insert(key.to_string(), bumped.clone());

        if let Some(meta) = &self.meta {
            let meta = meta.clone();
            let tenant_id = bumped.tenant_id;
            let hash = bumped.query_hash.clone();
            tokio::spawn(async move {
                if let Err(e) = meta.touch(tenant_id, &hash).await {
                    tracing::debug!("cache metadata touch failed: {}", e);
                }
            });
        }
        Some(bumped)
    }

    pub async fn get(
        &self,
        tenant_id: Uuid,
        query: &str,
        embedding: Option<&[f32]>,
    ) -> Result<CacheOutcome, KernelError> {
        self.limiter.check(&format!("cache:{}:read", tenant_id))?;
        if !self.enabled_for(tenant_id) {
            return Ok(CacheOutcome::Disabled);
        }
        self.validate_query(query)?;

        let normalized = normalize(query);
        let key = key_for(tenant_id, &normalized);

        // 1. Exact match, in-process.
        if let Some(entry) = self.register_hit(&key) {
            metrics::counter!("cache_requests_total", "outcome" => "hit").increment(1);
            return Ok(CacheOutcome::Hit {
                payload: self.decode_payload(&entry)?,
                similarity: None,
            });
        }

        // 2. Exact match, Redis (another instance may have written it).
        // A degraded Redis downgrades this tier to a miss; it never takes
        // the read path down.
        if let Some(redis) = &self.redis {
            let redis_key = key.clone();
            let stored: Option<String> = match redis
                .run("cache_get", move |mut con| {
                    let key = redis_key.clone();
                    async move { redis::AsyncCommands::get(&mut con, key).await }
                })
                .await
            {
                Ok(stored) => stored,
                Err(e) => {
                    tracing::warn!("cache redis lookup degraded: {}", e);
                    None
                }
            };
            if let Some(raw) = stored {
                match serde_json::from_str::<CacheEntry>(&raw) {
                    Ok(entry) if entry.tenant_id == tenant_id => {
                        self.adopt(entry);
                        if let Some(entry) = self.register_hit(&key) {
                            metrics::counter!("cache_requests_total", "outcome" => "hit")
                                .increment(1);
                            return Ok(CacheOutcome::Hit {
                                payload: self.decode_payload(&entry)?,
                                similarity: None,
                            });
                        }
                    }
                    Ok(_) => {
                        tracing::warn!("cache key {} held a foreign tenant entry; ignoring", key);
                    }
                    Err(e) => {
                        // Locally recoverable: treat an undecodable entry as a miss.
                        tracing::debug!("cache entry decode failed for {}: {}", key, e);
                    }
                }
            }
        }

        // 3. Approximate match within this tenant's index.
        if let Some(vector) = embedding {
            if let Some((hash, score)) =
                self.index
                    .search(tenant_id, vector, self.cfg.similarity_threshold)
            {
                if let Some(similar_key) = self
                    .by_hash
                    .get(&(tenant_id, hash))
                    .map(|k| k.value().clone())
                {
                    if let Some(entry) = self.register_hit(&similar_key) {
                        metrics::counter!("cache_requests_total", "outcome" => "similarity_hit")
                            .increment(1);
                        return Ok(CacheOutcome::Hit {
                            payload: self.decode_payload(&entry)?,
                            similarity: Some(score),
                        });
                    }
                }
            }
        }

        metrics::counter!("cache_requests_total", "outcome" => "miss").increment(1);
        Ok(CacheOutcome::Miss)
    }

    pub async fn put(
        &self,
        tenant_id: Uuid,
        query: &str,
        embedding: Vec<f32>,
        payload: &serde_json::Value,
    ) -> Result<(), KernelError> {
        self.limiter.check(&format!("cache:{}:write", tenant_id))?;
        if !self.enabled_for(tenant_id) {
            return Ok(());
        }
        self.validate_query(query)?;

        let normalized = normalize(query);
        let hash = query_hash(&normalized);
        let key = key_for(tenant_id, &normalized);
        let raw = payload.to_string();
        let payload_bytes = raw.len();

        let (stored_payload, encrypted) = if self.is_sensitive(query, &raw) {
            (self.crypto.encrypt(tenant_id, raw.as_bytes())?, true)
        } else {
            (raw, false)
        };

        let now = Utc::now();
        let entry = CacheEntry {
            tenant_id,
            key: key.clone(),
            query_hash: hash.clone(),
            normalized_query: normalized.clone(),
            payload: stored_payload,
            encrypted,
            payload_bytes,
            created_at: now,
            last_accessed: now,
            hit_count: 0,
            ttl_secs: self.cfg.ttl_secs,
        };

        self.index.insert(tenant_id, &hash, embedding.clone());
        self.by_hash.insert((tenant_id, hash.clone()), key.clone());
        self.entries.insert(key.clone(), Arc::new(entry.clone()));

        // Write-through to Redis with per-entry TTL. The in-process copy
        // keeps serving if Redis is degraded.
        if let Some(redis) = &self.redis {
            let serialized = serde_json::to_string(&entry)
                .map_err(|e| KernelError::Internal(format!("encode cache entry: {}", e)))?;
            let ttl = self.cfg.ttl_secs as u64;
            let redis_key = key.clone();
            if let Err(e) = redis
                .run("cache_set", move |mut con| {
                    let key = redis_key.clone();
                    let value = serialized.clone();
                    async move {
                        redis::AsyncCommands::set_ex::<_, _, ()>(&mut con, key, value, ttl).await
                    }
                })
                .await
            {
                tracing::warn!("cache write-through failed: {}", e);
            }
        }

        if let Some(meta) = &self.meta {
            let row = CacheMetaRow {
                tenant_id,
                query_hash: hash,
                normalized_query: normalized,
                embedding,
                payload_bytes: payload_bytes as i64,
                created_at: now,
                last_accessed: now,
                hit_count: 0,
            };
            if let Err(e) = meta.upsert(&row).await {
                tracing::warn!("cache metadata upsert failed: {}", e);
            }
        }

        metrics::counter!("cache_writes_total").increment(1);
        Ok(())
    }

    fn adopt(&self, entry: CacheEntry) {
        self.by_hash
            .insert((entry.tenant_id, entry.query_hash.clone()), entry.key.clone());
        self.entries.insert(entry.key.clone(), Arc::new(entry));
    }

    /// Rebuild the vector index from the durable metadata rows after a
    /// restart. Entry payloads stay in Redis; the similarity tier works
    /// again immediately, and exact lookups fall through to Redis.
    pub async fn rebuild_index(&self) -> Result<usize, KernelError> {
        let Some(meta) = &self.meta else {
            return Ok(0);
        };
        let mut restored = 0usize;
        for tenant_id in meta.tenants().await? {
            for row in meta.load_tenant(tenant_id).await? {
                self.index.insert(tenant_id, &row.query_hash, row.embedding);
                self.by_hash.insert(
                    (tenant_id, row.query_hash),
                    key_for(tenant_id, &row.normalized_query),
                );
                restored += 1;
            }
        }
        Ok(restored)
    }

    /// Durable per-tenant usage counters for the admin surface.
    pub async fn tenant_stats(&self, tenant_id: Uuid) -> Result<(i64, i64), KernelError> {
        let Some(meta) = &self.meta else {
            let entries = self.entries_for_tenant(tenant_id);
            let bytes: usize = entries.iter().map(|e| e.payload_bytes).sum();
            return Ok((entries.len() as i64, bytes as i64));
        };
        let count = meta.count_for_tenant(tenant_id).await?;
        let bytes = meta.bytes_for_tenant(tenant_id).await?;
        Ok((count, bytes))
    }

    /// Remove a batch of entries from the entry store, the vector index,
    /// Redis and the metadata rows together.
    pub async fn delete_batch(&self, tenant_id: Uuid, hashes: &[String]) -> Result<u64, KernelError> {
        if hashes.is_empty() {
            return Ok(0);
        }
        let mut keys = Vec::with_capacity(hashes.len());
        for hash in hashes {
            if let Some((_, key)) = self.by_hash.remove(&(tenant_id, hash.clone())) {
                self.entries.remove(&key);
                keys.push(key);
            }
        }
        self.index.remove_batch(tenant_id, hashes);

        if let Some(redis) = &self.redis {
            if !keys.is_empty() {
                let del_keys = keys.clone();
                if let Err(e) = redis
                    .run("cache_del", move |mut con| {
                        let keys = del_keys.clone();
                        async move { redis::AsyncCommands::del::<_, u64>(&mut con, keys).await }
                    })
                    .await
                {
                    tracing::warn!("cache batch delete in redis failed: {}", e);
                }
            }
        }
        if let Some(meta) = &self.meta {
            meta.delete_batch(tenant_id, hashes).await.map_err(KernelError::from)?;
        }
        Ok(keys.len() as u64)
    }

    /// Top-k queries by hit count for one tenant. Min-heap of size k over
    /// the entry store: O(n log k).
    pub fn top_queries(&self, tenant_id: Uuid, k: usize) -> Vec<(String, u64)> {
        if k == 0 {
            return Vec::new();
        }
        let mut heap: BinaryHeap<Reverse<(u64, String)>> = BinaryHeap::with_capacity(k + 1);
        for entry in self.entries.iter() {
            if entry.tenant_id != tenant_id {
                continue;
            }
            heap.push(Reverse((entry.hit_count, entry.normalized_query.clone())));
            if heap.len() > k {
                heap.pop();
            }
        }
        let mut out: Vec<(String, u64)> = heap
            .into_iter()
            .map(|Reverse((hits, query))| (query, hits))
            .collect();
        out.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        out
    }

    pub fn tenant_ids(&self) -> Vec<Uuid> {
        let mut tenants: Vec<Uuid> = self.entries.iter().map(|e| e.tenant_id).collect();
        tenants.sort();
        tenants.dedup();
        tenants
    }

    pub fn entries_for_tenant(&self, tenant_id: Uuid) -> Vec<Arc<CacheEntry>> {
        self.entries
            .iter()
            .filter(|e| e.tenant_id == tenant_id)
            .map(|e| e.value().clone())
            .collect()
    }

    pub fn config(&self) -> &CacheConfig {
        &self.cfg
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RateLimitConfig;
    use serde_json::json;

    pub(crate) fn bare_cache(cfg: CacheConfig) -> SemanticCache {
        let limiter = Arc::new(RateLimiterSet::new(RateLimitConfig {
            per_minute: 100_000,
            burst: 100_000,
            global_per_minute: 1_000_000,
        }));
        SemanticCache::new(cfg, None, None, limiter, "test-master-key")
    }

    #[test]
    fn normalization_collapses_case_and_whitespace() {
        assert_eq!(normalize("  Hello   World  "), "hello world");
        assert_eq!(normalize("Hello\n\tWorld"), "hello world");
    }

    #[test]
    fn sanitization_strips_unsafe_characters() {
        assert_eq!(sanitize("hello world"), "hello_world");
        assert_eq!(sanitize("a{b}:c"), "a_b__c");
        assert_eq!(sanitize("safe-name_1.2"), "safe-name_1.2");
    }

    #[test]
    fn key_carries_tenant_hash_tag() {
        let tenant = Uuid::nil();
        let key = key_for(tenant, "hello world");
        assert_eq!(
            key,
            "cache:{00000000-0000-0000-0000-000000000000}:q:hello_world"
        );
    }

    #[tokio::test]
    async fn exact_hit_after_put() {
        let cache = bare_cache(CacheConfig::default());
        let tenant = Uuid::new_v4();
        cache
            .put(tenant, "Hello World", vec![1.0, 0.0], &json!({"answer": 42}))
            .await
            .unwrap();
        let outcome = cache.get(tenant, "hello   world", None).await.unwrap();
        match outcome {
            CacheOutcome::Hit { payload, similarity } => {
                assert_eq!(payload, json!({"answer": 42}));
                assert!(similarity.is_none());
            }
            other => panic!("expected hit, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn tenant_isolation_on_reads() {
        let cache = bare_cache(CacheConfig::default());
        let t1 = Uuid::new_v4();
        let t2 = Uuid::new_v4();
        cache
            .put(t1, "hello", vec![1.0, 0.0], &json!({"r": 1}))
            .await
            .unwrap();
        assert_eq!(
            cache.get(t2, "hello", Some(&[1.0, 0.0])).await.unwrap(),
            CacheOutcome::Miss
        );
        assert!(matches!(
            cache.get(t1, "hello", Some(&[1.0, 0.0])).await.unwrap(),
            CacheOutcome::Hit { .. }
        ));
    }

    #[tokio::test]
    async fn similarity_fallback_hits_within_threshold() {
        let cache = bare_cache(CacheConfig::default());
        let tenant = Uuid::new_v4();
        cache
            .put(tenant, "list repositories", vec![1.0, 0.0], &json!({"r": "repos"}))
            .await
            .unwrap();
        let outcome = cache
            .get(tenant, "show repositories", Some(&[0.95, 0.05]))
            .await
            .unwrap();
        match outcome {
            CacheOutcome::Hit { similarity, .. } => {
                assert!(similarity.unwrap() >= 0.7);
            }
            other => panic!("expected similarity hit, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn oversized_query_rejected_at_boundary() {
        let cache = bare_cache(CacheConfig::default());
        let tenant = Uuid::new_v4();
        let max = cache.config().max_query_length;

        let at_limit = "a".repeat(max);
        assert!(cache.put(tenant, &at_limit, vec![1.0], &json!({})).await.is_ok());

        let over = "a".repeat(max + 1);
        assert!(matches!(
            cache.put(tenant, &over, vec![1.0], &json!({})).await,
            Err(KernelError::InvalidInput(_))
        ));
    }

    #[tokio::test]
    async fn disabled_tenant_short_circuits() {
        let cache = bare_cache(CacheConfig::default());
        let tenant = Uuid::new_v4();
        cache.set_tenant_disabled(tenant, true);
        assert_eq!(
            cache.get(tenant, "anything", None).await.unwrap(),
            CacheOutcome::Disabled
        );
    }

    #[tokio::test]
    async fn sensitive_payloads_are_encrypted_at_rest() {
        let cache = bare_cache(CacheConfig::default());
        let tenant = Uuid::new_v4();
        cache
            .put(tenant, "what is the api_key", vec![1.0], &json!({"api_key": "sk-123"}))
            .await
            .unwrap();

        let entries = cache.entries_for_tenant(tenant);
        assert_eq!(entries.len(), 1);
        assert!(entries[0].encrypted);
        assert!(!entries[0].payload.contains("sk-123"));

        // And the read path transparently decrypts.
        match cache.get(tenant, "what is the api_key", None).await.unwrap() {
            CacheOutcome::Hit { payload, .. } => assert_eq!(payload["api_key"], "sk-123"),
            other => panic!("expected hit, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn hit_count_survives_copy_on_write_updates() {
        let cache = bare_cache(CacheConfig::default());
        let tenant = Uuid::new_v4();
        cache.put(tenant, "popular", vec![1.0], &json!({})).await.unwrap();
        for _ in 0..3 {
            let _ = cache.get(tenant, "popular", None).await.unwrap();
        }
        let entries = cache.entries_for_tenant(tenant);
        assert_eq!(entries[0].hit_count, 3);
    }

    #[tokio::test]
    async fn top_queries_returns_k_most_hit() {
        let cache = bare_cache(CacheConfig::default());
        let tenant = Uuid::new_v4();
        for (query, hits) in [("alpha", 5), ("beta", 2), ("gamma", 9), ("delta", 1)] {
            cache.put(tenant, query, vec![1.0], &json!({})).await.unwrap();
            for _ in 0..hits {
                let _ = cache.get(tenant, query, None).await.unwrap();
            }
        }
        let top = cache.top_queries(tenant, 2);
        assert_eq!(top.len(), 2);
        assert_eq!(top[0].0, "gamma");
        assert_eq!(top[0].1, 9);
        assert_eq!(top[1].0, "alpha");
    }

    fn aged_entry(tenant: Uuid, query: &str, age_secs: i64, ttl_secs: u64) -> CacheEntry {
        let now = Utc::now();
        let normalized = normalize(query);
        CacheEntry {
            tenant_id: tenant,
            key: key_for(tenant, &normalized),
            query_hash: query_hash(&normalized),
            normalized_query: normalized,
            payload: "{}".to_string(),
            encrypted: false,
            payload_bytes: 2,
            created_at: now - chrono::Duration::seconds(age_secs),
            last_accessed: now - chrono::Duration::seconds(age_secs),
            hit_count: 0,
            ttl_secs,
        }
    }

    #[test]
    fn entry_expiry_runs_from_creation() {
        let tenant = Uuid::new_v4();
        let now = Utc::now();
        assert!(aged_entry(tenant, "q", 7200, 3600).expired_at(now));
        assert!(!aged_entry(tenant, "q", 60, 3600).expired_at(now));
    }

    #[tokio::test]
    async fn expired_entries_are_dropped_on_read() {
        let cache = bare_cache(CacheConfig::default());
        let tenant = Uuid::new_v4();
        let stale = aged_entry(tenant, "old news", 7200, 3600);
        let hash = stale.query_hash.clone();
        cache.index.insert(tenant, &hash, vec![1.0, 0.0]);
        cache.adopt(stale);

        // Exact lookup must not serve the stale entry, and the entry (and
        // its index slot) must be gone afterwards.
        assert_eq!(
            cache.get(tenant, "old news", Some(&[1.0, 0.0])).await.unwrap(),
            CacheOutcome::Miss
        );
        assert!(cache.entries_for_tenant(tenant).is_empty());
        assert_eq!(cache.index.len(tenant), 0);
    }

    #[tokio::test]
    async fn fresh_entries_still_hit_after_expiry_check() {
        let cache = bare_cache(CacheConfig::default());
        let tenant = Uuid::new_v4();
        cache.adopt(aged_entry(tenant, "recent", 60, 3600));
        assert!(matches!(
            cache.get(tenant, "recent", None).await.unwrap(),
            CacheOutcome::Hit { .. }
        ));
    }

    #[tokio::test]
    async fn delete_batch_clears_store_and_index() {
        let cache = bare_cache(CacheConfig::default());
        let tenant = Uuid::new_v4();
        cache.put(tenant, "doomed", vec![1.0, 0.0], &json!({})).await.unwrap();
        let hash = query_hash(&normalize("doomed"));
        let removed = cache.delete_batch(tenant, &[hash]).await.unwrap();
        assert_eq!(removed, 1);
        assert_eq!(cache.get(tenant, "doomed", Some(&[1.0, 0.0])).await.unwrap(), CacheOutcome::Miss);
    }
}
