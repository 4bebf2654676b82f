// [[AXON]]/apps/kernel-server/src/pipeline/consumer.rs
// Purpose: Consumer-group worker pool. At-least-once delivery, retries, DLQ.
// Architecture: Event Pipeline Layer
// Dependencies: redis (streams), tokio, tokio-util

use async_trait::async_trait;
use redis::streams::{StreamReadOptions, StreamReadReply};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use super::{record_from_fields, record_to_fields, F_ATTEMPTS, F_LAST_ERROR};
use crate::config::PipelineConfig;
use crate::error::KernelError;
use crate::models::EventRecord;
use crate::redis_client::RedisClient;

/// Type-specific event handler. Delivery is at-least-once and ordering
/// across workers is not guaranteed, so implementations MUST be idempotent.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, record: &EventRecord) -> Result<(), KernelError>;
}

pub struct StreamConsumer {
    redis: RedisClient,
    cfg: PipelineConfig,
    handlers: HashMap<String, Arc<dyn EventHandler>>,
}

impl StreamConsumer {
    pub fn new(
        redis: RedisClient,
        cfg: PipelineConfig,
        handlers: HashMap<String, Arc<dyn EventHandler>>,
    ) -> Arc<Self> {
        Arc::new(StreamConsumer {
            redis,
            cfg,
            handlers,
        })
    }

    /// Create the consumer group if this is the first boot against the
    /// stream. BUSYGROUP means someone else already did.
    pub async fn ensure_group(&self) -> Result<(), KernelError> {
        let stream = self.cfg.stream.clone();
        let group = self.cfg.group();
        let result = self
            .redis
            .run("xgroup_create", move |mut con| {
                let stream = stream.clone();
                let group = group.clone();
                async move {
                    redis::AsyncCommands::xgroup_create_mkstream::<_, _, _, String>(
                        &mut con, stream, group, "$",
                    )
                    .await
                }
            })
            .await;
        match result {
            Ok(_) => Ok(()),
            Err(KernelError::Upstream(msg)) if msg.contains("BUSYGROUP") => Ok(()),
            Err(e) => Err(e),
        }
    }

    pub fn spawn_workers(
        self: &Arc<Self>,
        shutdown: CancellationToken,
    ) -> Vec<tokio::task::JoinHandle<()>> {
        (0..self.cfg.workers.max(1))
            .map(|i| {
                let consumer = self.clone();
                let shutdown = shutdown.clone();
                tokio::spawn(async move {
                    consumer.worker_loop(i, shutdown).await;
                })
            })
            .collect()
    }

    async fn worker_loop(self: Arc<Self>, worker_id: usize, shutdown: CancellationToken) {
        let consumer_name = format!("{}-{}", self.cfg.group(), worker_id);
        tracing::info!("stream worker {} starting", consumer_name);
        loop {
            if shutdown.is_cancelled() {
                break;
            }
            tokio::select! {
                _ = shutdown.cancelled() => break,
                result = self.poll_once(&consumer_name) => {
                    if let Err(e) = result {
                        tracing::warn!("worker {} poll failed: {}", consumer_name, e);
                        tokio::time::sleep(Duration::from_millis(self.cfg.backoff_base_ms)).await;
                    }
                }
            }
            // Worker 0 also reports stream depth and reclaims stale records.
            if worker_id == 0 {
                self.observe_depth().await;
                if let Err(e) = self.reclaim_stale(&consumer_name).await {
                    tracing::debug!("pending reclaim failed: {}", e);
                }
            }
        }
        tracing::info!("stream worker {} stopped", consumer_name);
    }

    async fn poll_once(&self, consumer_name: &str) -> Result<(), KernelError> {
        let stream = self.cfg.stream.clone();
        let group = self.cfg.group();
        let consumer = consumer_name.to_string();
        let count = self.cfg.claim_batch;
        let block = self.cfg.block_ms as usize;

        let reply: StreamReadReply = self
            .redis
            .run("xreadgroup", move |mut con| {
                let stream = stream.clone();
                let group = group.clone();
                let consumer = consumer.clone();
                async move {
                    let opts = StreamReadOptions::default()
                        .group(group, consumer)
                        .count(count)
                        .block(block);
                    redis::AsyncCommands::xread_options(&mut con, &[stream], &[">"], &opts).await
                }
            })
            .await?;

        for key in reply.keys {
            for entry in key.ids {
                self.process_entry(&entry.id, &entry.map).await;
            }
        }
        Ok(())
    }

    async fn process_entry(&self, stream_id: &str, fields: &HashMap<String, redis::Value>) {
        let Some(record) = record_from_fields(fields) else {
            tracing::error!("undecodable stream record {}; moving to DLQ", stream_id);
            let mut raw_fields: Vec<(&'static str, String)> = vec![(F_LAST_ERROR, "undecodable record".to_string())];
            if let Some(attempts) = super::field_str(fields, F_ATTEMPTS) {
                raw_fields.push((F_ATTEMPTS, attempts));
            }
            let _ = self.append(&self.cfg.dlq_stream(), raw_fields).await;
            let _ = self.ack(stream_id).await;
            return;
        };

        let started = std::time::Instant::now();
        let outcome = self.dispatch(&record).await;
        metrics::histogram!(
            "event_handler_duration_seconds",
            "type" => record.event_type.clone()
        )
        .record(started.elapsed().as_secs_f64());

        match outcome {
            Ok(()) => {
                if let Err(e) = self.ack(stream_id).await {
                    // The handler succeeded but the ack didn't: the record
                    // redelivers later and idempotency absorbs it.
                    tracing::warn!("ack failed for {}: {}", stream_id, e);
                }
                metrics::counter!("events_processed_total", "outcome" => "acked").increment(1);
            }
            Err(e) => {
                self.handle_failure(stream_id, record, e).await;
            }
        }
    }

    /// Dispatch inside a spawned task so a panicking handler is contained
    /// and counted as a failure instead of killing the worker.
    async fn dispatch(&self, record: &EventRecord) -> Result<(), KernelError> {
        let handler = self
            .handlers
            .get(&record.event_type)
            .or_else(|| self.handlers.get("*"))
            .cloned()
            .ok_or_else(|| {
                KernelError::NotFound(format!("no handler for event type {}", record.event_type))
            })?;
        let record = record.clone();
        let task = tokio::spawn(async move { handler.handle(&record).await });
        match task.await {
            Ok(result) => result,
            Err(join_err) if join_err.is_panic() => {
                metrics::counter!("event_handler_panics_total").increment(1);
                Err(KernelError::Internal("event handler panicked".into()))
            }
            Err(_) => Err(KernelError::Internal("event handler cancelled".into())),
        }
    }

    async fn handle_failure(&self, stream_id: &str, mut record: EventRecord, error: KernelError) {
        record.attempts += 1;
        record.last_error = Some(error.to_string());

        if record.attempts < self.cfg.max_attempts {
            // Re-queue with backoff: the record re-enters the stream tail
            // with its attempt counter bumped, and the original delivery is
            // acknowledged so it leaves the pending list.
            let delay = Duration::from_millis(
                (self.cfg.backoff_base_ms * 2u64.saturating_pow(record.attempts.saturating_sub(1)))
                    .min(self.cfg.backoff_cap_ms),
            );
            tracing::warn!(
                "event {} failed (attempt {}/{}): {}; re-queueing after {:?}",
                record.id,
                record.attempts,
                self.cfg.max_attempts,
                error,
                delay
            );
            tokio::time::sleep(delay).await;
            if self
                .append(&self.cfg.stream, record_to_fields(&record))
                .await
                .is_ok()
            {
                let _ = self.ack(stream_id).await;
            }
            metrics::counter!("events_processed_total", "outcome" => "requeued").increment(1);
        } else {
            tracing::error!(
                "event {} exhausted {} attempts: {}; moving to DLQ",
                record.id,
                record.attempts,
                error
            );
            if self
                .append(&self.cfg.dlq_stream(), record_to_fields(&record))
                .await
                .is_ok()
            {
                let _ = self.ack(stream_id).await;
            }
            metrics::counter!("events_processed_total", "outcome" => "dlq").increment(1);
        }
    }

    async fn append(
        &self,
        stream: &str,
        fields: Vec<(&'static str, String)>,
    ) -> Result<String, KernelError> {
        let stream = stream.to_string();
        self.redis
            .run("xadd", move |mut con| {
                let stream = stream.clone();
                let fields = fields.clone();
                async move { redis::AsyncCommands::xadd(&mut con, stream, "*", &fields).await }
            })
            .await
    }

    async fn ack(&self, stream_id: &str) -> Result<(), KernelError> {
        let stream = self.cfg.stream.clone();
        let group = self.cfg.group();
        let id = stream_id.to_string();
        let _: u64 = self
            .redis
            .run("xack", move |mut con| {
                let stream = stream.clone();
                let group = group.clone();
                let id = id.clone();
                async move { redis::AsyncCommands::xack(&mut con, stream, group, &[id]).await }
            })
            .await?;
        Ok(())
    }

    /// Claim records stuck in another (dead) consumer's pending list and
    /// run them through the normal path.
    async fn reclaim_stale(&self, consumer_name: &str) -> Result<(), KernelError> {
        use redis::streams::{StreamClaimReply, StreamPendingCountReply};

        let stream = self.cfg.stream.clone();
        let group = self.cfg.group();
        let count = self.cfg.claim_batch;
        let pending: StreamPendingCountReply = self
            .redis
            .run("xpending", move |mut con| {
                let stream = stream.clone();
                let group = group.clone();
                async move {
                    redis::AsyncCommands::xpending_count(&mut con, stream, group, "-", "+", count)
                        .await
                }
            })
            .await?;

        let stale_ids: Vec<String> = pending
            .ids
            .iter()
            .filter(|p| p.last_delivered_ms as u64 > self.cfg.reclaim_idle_ms)
            .map(|p| p.id.clone())
            .collect();
        if stale_ids.is_empty() {
            return Ok(());
        }
        metrics::gauge!("consumer_lag_records").set(pending.ids.len() as f64);

        let stream = self.cfg.stream.clone();
        let group = self.cfg.group();
        let consumer = consumer_name.to_string();
        let min_idle = self.cfg.reclaim_idle_ms as usize;
        let ids = stale_ids.clone();
        let claimed: StreamClaimReply = self
            .redis
            .run("xclaim", move |mut con| {
                let stream = stream.clone();
                let group = group.clone();
                let consumer = consumer.clone();
                let ids = ids.clone();
                async move {
                    redis::AsyncCommands::xclaim(&mut con, stream, group, consumer, min_idle, &ids)
                        .await
                }
            })
            .await?;

        for entry in claimed.ids {
            tracing::warn!("reclaimed stale record {}", entry.id);
            self.process_entry(&entry.id, &entry.map).await;
        }
        Ok(())
    }

    async fn observe_depth(&self) {
        let stream = self.cfg.stream.clone();
        if let Ok(depth) = self
            .redis
            .run("xlen", move |mut con| {
                let stream = stream.clone();
                async move { redis::AsyncCommands::xlen::<_, u64>(&mut con, stream).await }
            })
            .await
        {
            metrics::gauge!("stream_depth", "stream" => self.cfg.stream.clone()).set(depth as f64);
        }
        let dlq = self.cfg.dlq_stream();
        let dlq_name = dlq.clone();
        if let Ok(depth) = self
            .redis
            .run("xlen_dlq", move |mut con| {
                let dlq = dlq.clone();
                async move { redis::AsyncCommands::xlen::<_, u64>(&mut con, dlq).await }
            })
            .await
        {
            metrics::gauge!("stream_depth", "stream" => dlq_name).set(depth as f64);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::sync::atomic::{AtomicU32, Ordering};
    use uuid::Uuid;

    struct CountingHandler {
        calls: AtomicU32,
        fail_first: u32,
    }

    #[async_trait]
    impl EventHandler for CountingHandler {
        async fn handle(&self, _record: &EventRecord) -> Result<(), KernelError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_first {
                Err(KernelError::Upstream("transient".into()))
            } else {
                Ok(())
            }
        }
    }

    fn record() -> EventRecord {
        EventRecord {
            id: "evt".to_string(),
            tenant_id: Uuid::new_v4(),
            event_type: "push".to_string(),
            payload: serde_json::json!({}),
            attempts: 0,
            first_seen_at: Utc::now(),
            last_error: None,
        }
    }

    // The dispatch path (handler lookup, panic containment) is testable
    // without Redis through the handler trait directly.
    #[tokio::test]
    async fn handler_retries_are_driven_by_attempt_counter() {
        let handler = Arc::new(CountingHandler {
            calls: AtomicU32::new(0),
            fail_first: 2,
        });
        let r = record();
        assert!(handler.handle(&r).await.is_err());
        assert!(handler.handle(&r).await.is_err());
        assert!(handler.handle(&r).await.is_ok());
    }

    struct PanickingHandler;

    #[async_trait]
    impl EventHandler for PanickingHandler {
        async fn handle(&self, _record: &EventRecord) -> Result<(), KernelError> {
            panic!("handler bug");
        }
    }

    #[tokio::test]
    async fn panicking_handler_is_contained_by_spawn() {
        let handler: Arc<dyn EventHandler> = Arc::new(PanickingHandler);
        let r = record();
        let task = tokio::spawn(async move { handler.handle(&r).await });
        let joined = task.await;
        assert!(joined.is_err());
        assert!(joined.unwrap_err().is_panic());
    }

    #[test]
    fn backoff_schedule_is_capped() {
        let cfg = PipelineConfig::default();
        let delay_for = |attempts: u32| {
            (cfg.backoff_base_ms * 2u64.saturating_pow(attempts.saturating_sub(1)))
                .min(cfg.backoff_cap_ms)
        };
        assert_eq!(delay_for(1), 500);
        assert_eq!(delay_for(2), 1000);
        assert_eq!(delay_for(4), 4000);
        assert_eq!(delay_for(12), 30_000);
    }
}
