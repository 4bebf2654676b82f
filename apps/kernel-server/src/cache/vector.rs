// [[AXON]]/apps/kernel-server/src/cache/vector.rs
// Purpose: In-process vector index, partitioned by tenant.
// Architecture: Domain Logic Layer
// Dependencies: dashmap

use dashmap::DashMap;
use uuid::Uuid;

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

#[derive(Debug, Clone)]
struct IndexedEmbedding {
    query_hash: String,
    vector: Vec<f32>,
}

/// Per-tenant embedding lists. Partitioning by tenant id at the map level
/// makes a cross-tenant similarity hit structurally impossible: a search
/// only ever scans its own tenant's bucket.
#[derive(Default)]
pub struct TenantVectorIndex {
    by_tenant: DashMap<Uuid, Vec<IndexedEmbedding>>,
}

impl TenantVectorIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, tenant_id: Uuid, query_hash: &str, vector: Vec<f32>) {
        let mut bucket = self.by_tenant.entry(tenant_id).or_default();
        if let Some(existing) = bucket.iter_mut().find(|e| e.query_hash == query_hash) {
            existing.vector = vector;
        } else {
            bucket.push(IndexedEmbedding {
                query_hash: query_hash.to_string(),
                vector,
            });
        }
    }

    pub fn remove_batch(&self, tenant_id: Uuid, hashes: &[String]) {
        if let Some(mut bucket) = self.by_tenant.get_mut(&tenant_id) {
            bucket.retain(|e| !hashes.contains(&e.query_hash));
        }
    }

    /// Best match at or above the threshold, linear scan over the tenant's
    /// bucket.
    pub fn search(
        &self,
        tenant_id: Uuid,
        vector: &[f32],
        threshold: f32,
    ) -> Option<(String, f32)> {
        let bucket = self.by_tenant.get(&tenant_id)?;
        let mut best: Option<(String, f32)> = None;
        for entry in bucket.iter() {
            let score = cosine_similarity(vector, &entry.vector);
            if score >= threshold {
                match &best {
                    Some((_, top)) if score <= *top => {}
                    _ => best = Some((entry.query_hash.clone(), score)),
                }
            }
        }
        best
    }

    pub fn len(&self, tenant_id: Uuid) -> usize {
        self.by_tenant.get(&tenant_id).map(|b| b.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cosine_of_identical_vectors_is_one() {
        let v = vec![0.5, 0.2, 0.8];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn cosine_of_orthogonal_vectors_is_zero() {
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
    }

    #[test]
    fn mismatched_dimensions_score_zero() {
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[1.0]), 0.0);
    }

    #[test]
    fn search_respects_threshold() {
        let index = TenantVectorIndex::new();
        let tenant = Uuid::new_v4();
        index.insert(tenant, "h1", vec![1.0, 0.0]);
        assert!(index.search(tenant, &[0.0, 1.0], 0.7).is_none());
        let (hash, score) = index.search(tenant, &[1.0, 0.1], 0.7).unwrap();
        assert_eq!(hash, "h1");
        assert!(score > 0.9);
    }

    #[test]
    fn search_never_crosses_tenants() {
        let index = TenantVectorIndex::new();
        let t1 = Uuid::new_v4();
        let t2 = Uuid::new_v4();
        index.insert(t1, "h1", vec![1.0, 0.0]);
        assert!(index.search(t2, &[1.0, 0.0], 0.5).is_none());
        assert!(index.search(t1, &[1.0, 0.0], 0.5).is_some());
    }

    #[test]
    fn remove_batch_prunes_bucket() {
        let index = TenantVectorIndex::new();
        let tenant = Uuid::new_v4();
        index.insert(tenant, "h1", vec![1.0]);
        index.insert(tenant, "h2", vec![0.5]);
        index.remove_batch(tenant, &["h1".to_string()]);
        assert_eq!(index.len(tenant), 1);
    }

    #[test]
    fn insert_replaces_same_hash() {
        let index = TenantVectorIndex::new();
        let tenant = Uuid::new_v4();
        index.insert(tenant, "h1", vec![1.0, 0.0]);
        index.insert(tenant, "h1", vec![0.0, 1.0]);
        assert_eq!(index.len(tenant), 1);
        let (_, score) = index.search(tenant, &[0.0, 1.0], 0.9).unwrap();
        assert!(score > 0.99);
    }
}
