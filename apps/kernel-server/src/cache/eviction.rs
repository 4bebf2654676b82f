// [[AXON]]/apps/kernel-server/src/cache/eviction.rs
// Purpose: Background eviction sweep with per-tenant caps.
// Architecture: Domain Logic Layer
// Dependencies: tokio, tokio-util

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::{CacheEntry, SemanticCache};
use crate::config::EvictionStrategy;

const BATCH: usize = 100;
const CAP_RATIO: f64 = 0.9;

/// Order entries for eviction according to the configured strategy.
/// First in the returned order is evicted first.
fn eviction_order(strategy: &EvictionStrategy, entries: &mut Vec<Arc<CacheEntry>>) {
    match strategy {
        EvictionStrategy::Lru => entries.sort_by_key(|e| e.last_accessed),
        EvictionStrategy::Lfu => entries.sort_by_key(|e| (e.hit_count, e.last_accessed)),
        EvictionStrategy::Ttl => entries.sort_by_key(|e| e.created_at),
    }
}

async fn sweep_tenant(cache: &SemanticCache, tenant_id: Uuid) {
    let cfg = cache.config().clone();
    let mut entries = cache.entries_for_tenant(tenant_id);

    // Age expiry first, independent of capacity: an under-cap tenant still
    // loses entries that outlived their TTL.
    let now = chrono::Utc::now();
    let expired: Vec<String> = entries
        .iter()
        .filter(|e| e.expired_at(now))
        .map(|e| e.query_hash.clone())
        .collect();
    if !expired.is_empty() {
        tracing::debug!(
            "cache sweep for tenant {}: {} entries past TTL",
            tenant_id,
            expired.len()
        );
        for batch in expired.chunks(BATCH) {
            if let Err(e) = cache.delete_batch(tenant_id, batch).await {
                tracing::warn!("cache TTL sweep batch failed for {}: {}", tenant_id, e);
                break;
            }
            metrics::counter!("cache_expirations_total").increment(batch.len() as u64);
        }
        entries.retain(|e| !e.expired_at(now));
    }

    let count = entries.len();
    let bytes: usize = entries.iter().map(|e| e.payload_bytes).sum();

    let entry_cap = (cfg.max_entries_per_tenant as f64 * CAP_RATIO) as usize;
    let byte_cap = (cfg.max_memory_mb_per_tenant as f64 * CAP_RATIO * 1024.0 * 1024.0) as usize;

    let over_entries = count.saturating_sub(entry_cap);
    let over_bytes = bytes.saturating_sub(byte_cap);
    if over_entries == 0 && over_bytes == 0 {
        return;
    }

    eviction_order(&cfg.eviction_strategy, &mut entries);

    // Walk the eviction order until both budgets are satisfied.
    let mut to_delete: Vec<String> = Vec::new();
    let mut reclaimed_bytes = 0usize;
    for entry in &entries {
        let entries_ok = to_delete.len() >= over_entries;
        let bytes_ok = reclaimed_bytes >= over_bytes;
        if entries_ok && bytes_ok {
            break;
        }
        reclaimed_bytes += entry.payload_bytes;
        to_delete.push(entry.query_hash.clone());
    }

    tracing::info!(
        "cache eviction for tenant {}: {} entries over budget, deleting {}",
        tenant_id,
        over_entries,
        to_delete.len()
    );

    for batch in to_delete.chunks(BATCH) {
        match cache.delete_batch(tenant_id, batch).await {
            Ok(n) => {
                metrics::counter!("cache_evictions_total").increment(n);
            }
            Err(e) => {
                tracing::warn!("cache eviction batch failed for {}: {}", tenant_id, e);
                break;
            }
        }
    }
}

async fn sweep(cache: &Arc<SemanticCache>) {
    for tenant_id in cache.tenant_ids() {
        sweep_tenant(cache, tenant_id).await;
    }
}

/// Run the eviction loop until shutdown. Each sweep executes inside its own
/// task so a panic is contained and reported; the loop itself survives.
pub fn spawn_eviction_loop(
    cache: Arc<SemanticCache>,
    shutdown: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let interval = Duration::from_secs(cache.config().eviction_interval_secs.max(1));
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("cache eviction loop stopping");
                    break;
                }
                _ = ticker.tick() => {
                    let cache = cache.clone();
                    let sweep_task = tokio::spawn(async move { sweep(&cache).await });
                    if let Err(e) = sweep_task.await {
                        if e.is_panic() {
                            metrics::counter!("cache_eviction_panics_total").increment(1);
                            tracing::error!("cache eviction sweep panicked; loop continues");
                        }
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::tests::bare_cache;
    use crate::config::CacheConfig;
    use serde_json::json;

    #[tokio::test]
    async fn sweep_deletes_oldest_down_to_cap() {
        let cfg = CacheConfig {
            max_entries_per_tenant: 10,
            ..CacheConfig::default()
        };
        let cache = Arc::new(bare_cache(cfg));
        let tenant = Uuid::new_v4();

        for i in 0..12 {
            cache
                .put(tenant, &format!("query number {}", i), vec![1.0], &json!({"i": i}))
                .await
                .unwrap();
            // Touch the later entries so LRU order favors keeping them.
            if i >= 6 {
                let _ = cache.get(tenant, &format!("query number {}", i), None).await;
            }
        }
        assert_eq!(cache.entries_for_tenant(tenant).len(), 12);

        sweep(&cache).await;

        // 90% of 10 = 9 entries retained.
        let remaining = cache.entries_for_tenant(tenant);
        assert_eq!(remaining.len(), 9);
        // The recently-touched entries survived.
        assert!(remaining
            .iter()
            .any(|e| e.normalized_query == "query number 11"));
    }

    #[tokio::test]
    async fn under_cap_tenant_is_untouched() {
        let cache = Arc::new(bare_cache(CacheConfig::default()));
        let tenant = Uuid::new_v4();
        for i in 0..5 {
            cache
                .put(tenant, &format!("q{}", i), vec![1.0], &json!({}))
                .await
                .unwrap();
        }
        sweep(&cache).await;
        assert_eq!(cache.entries_for_tenant(tenant).len(), 5);
    }

    #[tokio::test]
    async fn sweep_expires_by_age_even_under_cap() {
        let cache = Arc::new(bare_cache(CacheConfig::default()));
        let tenant = Uuid::new_v4();
        // Well under the entry cap: only the TTL pass should fire.
        cache.put(tenant, "fresh", vec![1.0], &json!({})).await.unwrap();
        let now = chrono::Utc::now();
        let mut stale = entry_with_hits("stale", 0);
        stale.tenant_id = tenant;
        stale.created_at = now - chrono::Duration::seconds(7200);
        stale.ttl_secs = 3600;
        cache.adopt(stale);
        assert_eq!(cache.entries_for_tenant(tenant).len(), 2);

        sweep(&cache).await;

        let remaining = cache.entries_for_tenant(tenant);
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].normalized_query, "fresh");
    }

    #[test]
    fn lfu_order_prefers_cold_entries() {
        let mut entries = vec![
            Arc::new(entry_with_hits("hot", 10)),
            Arc::new(entry_with_hits("cold", 0)),
            Arc::new(entry_with_hits("warm", 3)),
        ];
        eviction_order(&EvictionStrategy::Lfu, &mut entries);
        assert_eq!(entries[0].normalized_query, "cold");
        assert_eq!(entries[2].normalized_query, "hot");
    }

    fn entry_with_hits(query: &str, hits: u64) -> CacheEntry {
        let now = chrono::Utc::now();
        CacheEntry {
            tenant_id: Uuid::nil(),
            key: format!("k:{}", query),
            query_hash: query.to_string(),
            normalized_query: query.to_string(),
            payload: "{}".to_string(),
            encrypted: false,
            payload_bytes: 2,
            created_at: now,
            last_accessed: now,
            hit_count: hits,
            ttl_secs: 60,
        }
    }
}
