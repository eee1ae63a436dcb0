//! Stream Dispatcher (C5): claims outbox rows and publishes them to the
//! stream, one tick at a time.
//!
//! The run loop's shape — `interval.tick()` raced against a
//! `CancellationToken`, backoff on recoverable failures — is the same one
//! this codebase already used for its (now removed) outbound delivery
//! retry worker; only the work done per tick has changed.

use std::time::Duration;

use redis::AsyncCommands;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};
use uuid::Uuid;

use std::sync::Arc;

use crate::config::QueueConfig;
use crate::db::DbPool;
use crate::error::CoreError;
use crate::health::PipelineHealth;
use crate::models::OutboxEvent;

pub struct StreamDispatcher {
    pool: DbPool,
    redis: redis::aio::ConnectionManager,
    config: QueueConfig,
    health: Arc<PipelineHealth>,
}

impl StreamDispatcher {
    pub fn new(
        pool: DbPool,
        redis: redis::aio::ConnectionManager,
        config: QueueConfig,
        health: Arc<PipelineHealth>,
    ) -> Self {
        Self { pool, redis, config, health }
    }

    /// Runs until `shutdown` is cancelled. If a tick drains a full batch the
    /// next tick runs immediately; otherwise the loop sleeps `tickMs`.
    pub async fn run(&mut self, shutdown: CancellationToken) {
        loop {
            if shutdown.is_cancelled() {
                break;
            }

            let tick_start = std::time::Instant::now();
            let drained_full_batch = tokio::select! {
                result = self.tick(&shutdown) => result,
                _ = shutdown.cancelled() => break,
            };
            metrics::histogram!("dispatcher_tick_duration_seconds", tick_start.elapsed().as_secs_f64());

            if !drained_full_batch {
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_millis(self.config.tick_ms)) => {}
                    _ = shutdown.cancelled() => break,
                }
            }
        }
        debug!("stream dispatcher stopped");
    }

    /// One claim-publish-settle cycle. Returns whether the batch was full
    /// (signals the caller to tick again immediately).
    async fn tick(&mut self, shutdown: &CancellationToken) -> bool {
        self.health.mark_dispatcher_tick();
        let now = chrono::Utc::now();
        let claimed = match crate::db::claim(&self.pool, self.config.batch_size as i64, now).await {
            Ok(rows) => rows,
            Err(e) => {
                error!(error = %e, "failed to claim outbox batch");
                return false;
            }
        };

        metrics::counter!("outbox_claimed_total", claimed.len() as u64);
        let full_batch = claimed.len() as i64 == self.config.batch_size as i64;
        let mut sent_ids = Vec::new();

        for event in claimed {
            if shutdown.is_cancelled() {
                // Release this row and everything after it back to pending
                // rather than leaving it stuck in `picked`.
                if let Err(e) = release_to_pending(&self.pool, event.id).await {
                    error!(error = %e, outbox_id = %event.id, "failed to release claim on shutdown");
                }
                continue;
            }

            match self.publish(&event).await {
                Ok(()) => sent_ids.push(event.id),
                Err(PublishOutcome::Recoverable(reason)) => {
                    warn!(outbox_id = %event.id, reason = %reason, "recoverable publish failure");
                    if let Err(e) = crate::db::mark_failed(&self.pool, event.id, &reason, self.config.max_attempts).await {
                        error!(error = %e, outbox_id = %event.id, "failed to record publish failure");
                    }
                }
                Err(PublishOutcome::Schema(reason)) => {
                    warn!(outbox_id = %event.id, reason = %reason, "schema/parse error, routing to DLQ");
                    let _ = crate::db::insert_dlq_record(
                        &self.pool,
                        &self.config.stream_key,
                        &self.config.group,
                        event.event_id,
                        &event.aggregate_id,
                        &event.payload,
                        &reason,
                    )
                    .await;
                    if let Err(e) = crate::db::mark_failed(&self.pool, event.id, &reason, 0).await {
                        error!(error = %e, outbox_id = %event.id, "failed to dead-letter outbox row");
                    } else {
                        metrics::counter!("outbox_dead_total", 1);
                    }
                }
            }
        }

        if !sent_ids.is_empty() {
            if let Err(e) = crate::db::mark_sent(&self.pool, &sent_ids, chrono::Utc::now()).await {
                error!(error = %e, "failed to mark outbox rows sent");
            } else {
                metrics::counter!("outbox_sent_total", sent_ids.len() as u64);
            }
        }

        full_batch
    }

    /// Publishes one event to its partition (`aggregateId`'s stream entry).
    /// Partitioning is by field, not by separate stream name, so ordering
    /// within an aggregate is visible to a single consumer-group read.
    async fn publish(&mut self, event: &OutboxEvent) -> Result<(), PublishOutcome> {
        let payload_bytes = serde_json::to_vec(&event.payload)
            .map_err(|e| PublishOutcome::Schema(format!("payload serialization failed: {e}")))?;

        let result: Result<String, redis::RedisError> = self
            .redis
            .xadd(
                &self.config.stream_key,
                "*",
                &[
                    ("eventId", event.event_id.to_string().as_bytes()),
                    ("messageId", event.message_id.to_string().as_bytes()),
                    ("aggregateId", event.aggregate_id.as_bytes()),
                    ("payload", payload_bytes.as_slice()),
                ],
            )
            .await;

        result
            .map(|_| ())
            .map_err(|e| PublishOutcome::Recoverable(e.to_string()))
    }
}

enum PublishOutcome {
    Recoverable(String),
    Schema(String),
}

async fn release_to_pending(pool: &DbPool, id: Uuid) -> Result<(), CoreError> {
    sqlx::query("UPDATE message_outbox SET status = 'pending' WHERE id = $1")
        .bind(id)
        .execute(pool)
        .await
        .map_err(|e| CoreError::Transient(e.to_string()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    // Dispatcher ticks need a live Postgres and Redis; covered by the
    // integration harness rather than unit tests here.
}
