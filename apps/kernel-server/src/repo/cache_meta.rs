// [[AXON]]/apps/kernel-server/src/repo/cache_meta.rs
// Purpose: Durable metadata for semantic-cache entries; rebuild source for the vector index.
// Architecture: Repository Layer
// Dependencies: sqlx

use chrono::{DateTime, Utc};
use sqlx::Row;
use uuid::Uuid;

use super::{Db, RepoResult};

#[derive(Debug, Clone)]
pub struct CacheMetaRow {
    pub tenant_id: Uuid,
    pub query_hash: String,
    pub normalized_query: String,
    pub embedding: Vec<f32>,
    pub payload_bytes: i64,
    pub created_at: DateTime<Utc>,
    pub last_accessed: DateTime<Utc>,
    pub hit_count: i64,
}

pub struct CacheMetaRepo {
    db: Db,
}

impl CacheMetaRepo {
    pub fn new(db: Db) -> Self {
        CacheMetaRepo { db }
    }

    pub async fn upsert(&self, row: &CacheMetaRow) -> RepoResult<()> {
        self.db
            .bound(
                sqlx::query(
                    "INSERT INTO cache_metadata (tenant_id, query_hash, normalized_query, \
                     embedding, payload_bytes, created_at, last_accessed, hit_count) \
                     VALUES ($1, $2, $3, $4, $5, $6, $6, 0) \
                     ON CONFLICT (tenant_id, query_hash) DO UPDATE SET \
                     embedding = EXCLUDED.embedding, payload_bytes = EXCLUDED.payload_bytes, \
                     last_accessed = EXCLUDED.last_accessed",
                )
                .bind(row.tenant_id)
                .bind(&row.query_hash)
                .bind(&row.normalized_query)
                .bind(&row.embedding)
                .bind(row.payload_bytes)
                .bind(row.created_at)
                .execute(self.db.writer()),
            )
            .await?;
        Ok(())
    }

    pub async fn touch(&self, tenant_id: Uuid, query_hash: &str) -> RepoResult<()> {
        self.db
            .bound(
                sqlx::query(
                    "UPDATE cache_metadata SET last_accessed = $1, hit_count = hit_count + 1 \
                     WHERE tenant_id = $2 AND query_hash = $3",
                )
                .bind(Utc::now())
                .bind(tenant_id)
                .bind(query_hash)
                .execute(self.db.writer()),
            )
            .await?;
        Ok(())
    }

    pub async fn delete_batch(&self, tenant_id: Uuid, hashes: &[String]) -> RepoResult<u64> {
        if hashes.is_empty() {
            return Ok(0);
        }
        let result = self
            .db
            .bound(
                sqlx::query(
                    "DELETE FROM cache_metadata WHERE tenant_id = $1 AND query_hash = ANY($2)",
                )
                .bind(tenant_id)
                .bind(hashes)
                .execute(self.db.writer()),
            )
            .await?;
        Ok(result.rows_affected())
    }

    pub async fn count_for_tenant(&self, tenant_id: Uuid) -> RepoResult<i64> {
        let row = self
            .db
            .bound(
                sqlx::query("SELECT COUNT(*) AS n FROM cache_metadata WHERE tenant_id = $1")
                    .bind(tenant_id)
                    .fetch_one(self.db.reader()),
            )
            .await?;
        Ok(row.try_get("n")?)
    }

    pub async fn bytes_for_tenant(&self, tenant_id: Uuid) -> RepoResult<i64> {
        let row = self
            .db
            .bound(
                sqlx::query(
                    "SELECT COALESCE(SUM(payload_bytes), 0)::bigint AS n \
                     FROM cache_metadata WHERE tenant_id = $1",
                )
                .bind(tenant_id)
                .fetch_one(self.db.reader()),
            )
            .await?;
        Ok(row.try_get("n")?)
    }

    pub async fn tenants(&self) -> RepoResult<Vec<Uuid>> {
        let rows = self
            .db
            .bound(
                sqlx::query("SELECT DISTINCT tenant_id FROM cache_metadata")
                    .fetch_all(self.db.reader()),
            )
            .await?;
        rows.iter()
            .map(|row| Ok(row.try_get::<Uuid, _>("tenant_id")?))
            .collect()
    }

    pub async fn load_tenant(&self, tenant_id: Uuid) -> RepoResult<Vec<CacheMetaRow>> {
        let rows = self
            .db
            .bound(
                sqlx::query(
                    "SELECT tenant_id, query_hash, normalized_query, embedding, payload_bytes, \
                     created_at, last_accessed, hit_count FROM cache_metadata WHERE tenant_id = $1",
                )
                .bind(tenant_id)
                .fetch_all(self.db.reader()),
            )
            .await?;
        rows.iter()
            .map(|row| {
                Ok(CacheMetaRow {
                    tenant_id: row.try_get("tenant_id")?,
                    query_hash: row.try_get("query_hash")?,
                    normalized_query: row.try_get("normalized_query")?,
                    embedding: row.try_get("embedding")?,
                    payload_bytes: row.try_get("payload_bytes")?,
                    created_at: row.try_get("created_at")?,
                    last_accessed: row.try_get("last_accessed")?,
                    hit_count: row.try_get("hit_count")?,
                })
            })
            .collect()
    }
}
