// [[AXON]]/apps/kernel-server/src/pipeline/producer.rs
// Purpose: Webhook ingress. Signature check, idempotency dedup, stream append.
// Architecture: Event Pipeline Layer
// Dependencies: redis (streams), hmac, sha2

use chrono::Utc;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use uuid::Uuid;

use super::record_to_fields;
use crate::config::PipelineConfig;
use crate::error::KernelError;
use crate::models::EventRecord;
use crate::redis_client::RedisClient;

type HmacSha256 = Hmac<Sha256>;

/// Constant-time HMAC-SHA256 check over the raw request body. Accepts the
/// bare hex digest or the `sha256=` prefixed form.
pub fn verify_signature(secret: &str, raw_body: &[u8], signature_hex: &str) -> Result<(), KernelError> {
    let presented = signature_hex
        .strip_prefix("sha256=")
        .unwrap_or(signature_hex);
    let presented = hex::decode(presented)
        .map_err(|_| KernelError::Unauthorized("malformed webhook signature".into()))?;
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| KernelError::Internal("webhook secret unusable".into()))?;
    mac.update(raw_body);
    mac.verify_slice(&presented)
        .map_err(|_| KernelError::Unauthorized("webhook signature mismatch".into()))
}

#[derive(Debug, PartialEq, Eq)]
pub enum IngestOutcome {
    Accepted { id: String },
    /// Duplicate idempotency key inside the dedup window.
    AlreadyAccepted,
}

pub struct WebhookProducer {
    redis: RedisClient,
    cfg: PipelineConfig,
    secret: String,
}

impl WebhookProducer {
    pub fn new(redis: RedisClient, cfg: PipelineConfig, secret: String) -> Self {
        WebhookProducer { redis, cfg, secret }
    }

    pub fn verify(&self, raw_body: &[u8], signature_hex: &str) -> Result<(), KernelError> {
        verify_signature(&self.secret, raw_body, signature_hex)
    }

    /// Append to the primary stream unless the idempotency key was already
    /// seen inside the dedup window.
    pub async fn ingest(
        &self,
        tenant_id: Uuid,
        event_type: &str,
        payload: serde_json::Value,
        idempotency_key: &str,
    ) -> Result<IngestOutcome, KernelError> {
        if idempotency_key.is_empty() {
            return Err(KernelError::InvalidInput("empty idempotency key".into()));
        }

        // SET NX EX marks the key; losing the race means a duplicate.
        let dedup_key = format!("webhook:dedup:{{{}}}:{}", tenant_id, idempotency_key);
        let ttl = self.cfg.dedup_ttl_secs;
        let fresh: bool = self
            .redis
            .run("webhook_dedup", move |mut con| {
                let key = dedup_key.clone();
                async move {
                    redis::cmd("SET")
                        .arg(&key)
                        .arg(1)
                        .arg("NX")
                        .arg("EX")
                        .arg(ttl)
                        .query_async::<_, Option<String>>(&mut con)
                        .await
                        .map(|reply| reply.is_some())
                }
            })
            .await?;
        if !fresh {
            metrics::counter!("webhook_ingest_total", "outcome" => "duplicate").increment(1);
            return Ok(IngestOutcome::AlreadyAccepted);
        }

        let record = EventRecord {
            id: Uuid::new_v4().to_string(),
            tenant_id,
            event_type: event_type.to_string(),
            payload,
            attempts: 0,
            first_seen_at: Utc::now(),
            last_error: None,
        };
        let stream = self.cfg.stream.clone();
        let fields = record_to_fields(&record);
        let stream_id: String = self
            .redis
            .run("webhook_xadd", move |mut con| {
                let stream = stream.clone();
                let fields = fields.clone();
                async move { redis::AsyncCommands::xadd(&mut con, stream, "*", &fields).await }
            })
            .await?;

        tracing::debug!(
            "webhook {} accepted as {} on stream {}",
            record.id,
            stream_id,
            self.cfg.stream
        );
        metrics::counter!("webhook_ingest_total", "outcome" => "accepted").increment(1);
        Ok(IngestOutcome::Accepted { id: record.id })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mac_hex(secret: &str, body: &[u8]) -> String {
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(body);
        hex::encode(mac.finalize().into_bytes())
    }

    #[test]
    fn valid_signature_accepted() {
        let sig = mac_hex("s3cret", b"payload-bytes");
        assert!(verify_signature("s3cret", b"payload-bytes", &sig).is_ok());
        assert!(verify_signature("s3cret", b"payload-bytes", &format!("sha256={}", sig)).is_ok());
    }

    #[test]
    fn wrong_secret_rejected() {
        let sig = mac_hex("other", b"payload-bytes");
        assert!(verify_signature("s3cret", b"payload-bytes", &sig).is_err());
    }

    #[test]
    fn tampered_body_rejected() {
        let sig = mac_hex("s3cret", b"payload-bytes");
        assert!(verify_signature("s3cret", b"payload-bytez", &sig).is_err());
    }

    #[test]
    fn garbage_signature_is_unauthorized_not_panic() {
        let err = verify_signature("s3cret", b"x", "not-hex!").unwrap_err();
        assert_eq!(err.kind(), "unauthorized");
    }
}
