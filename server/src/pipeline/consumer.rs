//! Stream Consumer (C6): reads pipeline entries via a consumer group,
//! deduplicates and reorders them per aggregate, and hands ready entries to
//! the Hub for delivery.
//!
//! Per-tick state machine: `Idle -> Reading -> Delivering -> Acking -> Idle`,
//! folded into the same `select!`-raced-against-`CancellationToken` loop
//! shape the dispatcher uses. A second, slower interval drives idle-pending
//! reclaim so one stalled consumer's entries eventually reach another.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use moka::sync::Cache;
use redis::streams::{StreamReadOptions, StreamReadReply};
use redis::{AsyncCommands, Value};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::config::QueueConfig;
use crate::db::DbPool;
use crate::health::PipelineHealth;
use crate::models::DeliveryEnvelope;

/// Whether a `Broadcaster::broadcast` call landed or was rejected under
/// backpressure. `Overloaded` tells the consumer to back off and leave the
/// entry unacked rather than treat delivery as having succeeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BroadcastOutcome {
    Delivered,
    Overloaded,
}

/// Handoff to the WebSocket hub. Implemented by whatever holds the
/// connection registry; the consumer itself knows nothing about sockets.
#[async_trait]
pub trait Broadcaster: Send + Sync {
    async fn broadcast(&self, partition_key: &str, envelope: DeliveryEnvelope) -> BroadcastOutcome;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerStatus {
    Idle,
    Reading,
    Delivering,
    Acking,
    Paused,
}

impl From<u8> for ConsumerStatus {
    fn from(v: u8) -> Self {
        match v {
            1 => ConsumerStatus::Reading,
            2 => ConsumerStatus::Delivering,
            3 => ConsumerStatus::Acking,
            4 => ConsumerStatus::Paused,
            _ => ConsumerStatus::Idle,
        }
    }
}

/// Local dedupe entries and consumer-position advisories don't need to
/// outlive a restart, so a plain constant is enough; the persistent
/// dedupe key in Redis carries the same TTL.
const DEDUPE_TTL_SECS: u64 = 3600;

#[derive(Clone)]
struct ParsedEntry {
    redis_id: String,
    event_id: Uuid,
    message_id: Uuid,
    aggregate_id: String,
    seq: i64,
    payload: serde_json::Value,
}

struct AggregateBuffer {
    next_seq: i64,
    pending: BTreeMap<i64, ParsedEntry>,
    buffered_since: Instant,
}

pub struct StreamConsumer<B: Broadcaster> {
    redis: redis::aio::ConnectionManager,
    pool: DbPool,
    config: QueueConfig,
    broadcaster: Arc<B>,
    seen_local: Cache<Uuid, ()>,
    reorder: HashMap<String, AggregateBuffer>,
    reclaim_attempts: HashMap<String, u32>,
    /// Aggregates the Hub rejected under backpressure, and when. Delivery
    /// attempts for a paused aggregate are skipped until `claim_idle_ms`
    /// elapses; the unacked entries stay claimed in its PEL in the meantime
    /// and become eligible for `reclaim_idle_pending` once it does.
    paused: HashMap<String, Instant>,
    status: AtomicU8,
    health: Arc<PipelineHealth>,
}

impl<B: Broadcaster> StreamConsumer<B> {
    pub fn new(
        redis: redis::aio::ConnectionManager,
        pool: DbPool,
        config: QueueConfig,
        broadcaster: Arc<B>,
        health: Arc<PipelineHealth>,
    ) -> Self {
        let seen_local = Cache::builder()
            .max_capacity(50_000)
            .time_to_live(Duration::from_secs(DEDUPE_TTL_SECS))
            .build();
        Self {
            redis,
            pool,
            config,
            broadcaster,
            seen_local,
            reorder: HashMap::new(),
            reclaim_attempts: HashMap::new(),
            paused: HashMap::new(),
            status: AtomicU8::new(0),
            health,
        }
    }

    pub fn status(&self) -> ConsumerStatus {
        ConsumerStatus::from(self.status.load(Ordering::Relaxed))
    }

    fn set_status(&self, status: ConsumerStatus) {
        self.status.store(status as u8, Ordering::Relaxed);
    }

    /// Runs until `shutdown` fires, then drains in-flight state and returns.
    pub async fn run(&mut self, shutdown: CancellationToken) {
        let mut reclaim_interval =
            tokio::time::interval(Duration::from_millis(self.config.claim_idle_ms.max(1) as u64));
        reclaim_interval.tick().await;

        loop {
            if shutdown.is_cancelled() {
                break;
            }
            tokio::select! {
                _ = self.tick() => {}
                _ = reclaim_interval.tick() => self.reclaim_idle_pending().await,
                _ = shutdown.cancelled() => break,
            }
        }

        self.flush_reorder_buffers_on_shutdown().await;
        debug!("stream consumer stopped");
    }

    /// One read-dedupe-reorder-deliver-ack cycle.
    async fn tick(&mut self) {
        self.health.mark_consumer_tick();
        self.set_status(ConsumerStatus::Reading);
        let opts = StreamReadOptions::default()
            .group(&self.config.group, &self.config.consumer_name)
            .count(self.config.batch_size)
            .block(self.config.block_ms);

        let reply: StreamReadReply = match self
            .redis
            .xread_options(&[&self.config.stream_key], &[">"], &opts)
            .await
        {
            Ok(reply) => reply,
            Err(e) => {
                error!(error = %e, "xreadgroup failed");
                self.set_status(ConsumerStatus::Idle);
                return;
            }
        };

        let mut to_ack = Vec::new();
        self.set_status(ConsumerStatus::Delivering);

        for stream_key in reply.keys {
            for entry in stream_key.ids {
                let redis_id = entry.id.clone();
                match parse_entry(&redis_id, &entry.map) {
                    Ok(parsed) => {
                        if self.is_duplicate(parsed.event_id).await {
                            to_ack.push(redis_id);
                            continue;
                        }
                        self.buffer_entry(parsed);
                    }
                    Err(reason) => {
                        warn!(redis_id = %redis_id, reason = %reason, "malformed stream entry, routing to DLQ");
                        self.dead_letter_raw(&redis_id, &entry.map, &reason).await;
                        to_ack.push(redis_id);
                    }
                }
            }
        }

        let delivered_ids = self.drain_ready_entries().await;
        to_ack.extend(delivered_ids);

        self.set_status(ConsumerStatus::Acking);
        self.ack(&to_ack).await;
        self.set_status(ConsumerStatus::Idle);

        let lag: usize = self.reorder.values().map(|b| b.pending.len()).sum();
        metrics::gauge!("consumer_lag", lag as f64);
    }

    async fn is_duplicate(&mut self, event_id: Uuid) -> bool {
        if self.seen_local.contains_key(&event_id) {
            return true;
        }
        let key = format!("dedupe:{event_id}");
        let set: Option<String> = redis::cmd("SET")
            .arg(&key)
            .arg(1)
            .arg("NX")
            .arg("EX")
            .arg(DEDUPE_TTL_SECS)
            .query_async(&mut self.redis)
            .await
            .unwrap_or(None);
        self.seen_local.insert(event_id, ());
        set.is_none()
    }

    fn buffer_entry(&mut self, entry: ParsedEntry) {
        let buf = self
            .reorder
            .entry(entry.aggregate_id.clone())
            .or_insert_with(|| AggregateBuffer {
                next_seq: entry.seq,
                pending: BTreeMap::new(),
                buffered_since: Instant::now(),
            });
        buf.pending.insert(entry.seq, entry);
    }

    /// Flushes every aggregate's contiguous prefix starting at `next_seq`.
    /// An aggregate stuck on a gap past `reorderTimeoutMs` is force-flushed
    /// out of order, bumping `gap_detected`.
    async fn drain_ready_entries(&mut self) -> Vec<String> {
        let mut acked = Vec::new();
        let reorder_timeout = Duration::from_millis(self.config.reorder_timeout_ms);
        let pause_backoff = Duration::from_millis(self.config.claim_idle_ms.max(0) as u64);

        let aggregate_ids: Vec<String> = self.reorder.keys().cloned().collect();
        for aggregate_id in aggregate_ids {
            if let Some(paused_at) = self.paused.get(&aggregate_id) {
                if paused_at.elapsed() < pause_backoff {
                    continue;
                }
                self.paused.remove(&aggregate_id);
            }

            loop {
                let ready = {
                    let buf = self.reorder.get(&aggregate_id).unwrap();
                    buf.pending
                        .first_key_value()
                        .filter(|(seq, _)| **seq == buf.next_seq)
                        .map(|(seq, entry)| (*seq, entry.clone()))
                };
                let Some((seq, entry)) = ready else { break };
                match self.deliver(entry).await {
                    Some(redis_id) => {
                        let buf = self.reorder.get_mut(&aggregate_id).unwrap();
                        buf.pending.remove(&seq);
                        buf.next_seq = seq + 1;
                        buf.buffered_since = Instant::now();
                        acked.push(redis_id);
                    }
                    None => {
                        warn!(aggregate_id = %aggregate_id, "hub overloaded, pausing partition");
                        self.paused.insert(aggregate_id.clone(), Instant::now());
                        break;
                    }
                }
            }

            if self.paused.contains_key(&aggregate_id) {
                continue;
            }

            let should_force = self
                .reorder
                .get(&aggregate_id)
                .map(|buf| !buf.pending.is_empty() && buf.buffered_since.elapsed() > reorder_timeout)
                .unwrap_or(false);

            if should_force {
                metrics::counter!("consumer_gap_detected_total", 1);
                warn!(aggregate_id = %aggregate_id, "reorder timeout exceeded, delivering out of order");
                let forced = self
                    .reorder
                    .get(&aggregate_id)
                    .and_then(|buf| buf.pending.first_key_value().map(|(seq, entry)| (*seq, entry.clone())));
                if let Some((seq, entry)) = forced {
                    match self.deliver(entry).await {
                        Some(redis_id) => {
                            let buf = self.reorder.get_mut(&aggregate_id).unwrap();
                            buf.pending.remove(&seq);
                            buf.next_seq = seq + 1;
                            buf.buffered_since = Instant::now();
                            acked.push(redis_id);
                        }
                        None => {
                            self.paused.insert(aggregate_id.clone(), Instant::now());
                        }
                    }
                }
            }

            if self
                .reorder
                .get(&aggregate_id)
                .map(|buf| buf.pending.is_empty())
                .unwrap_or(false)
            {
                self.reorder.remove(&aggregate_id);
            }
        }

        acked
    }

    /// Returns `None` if the Hub rejected the broadcast under backpressure;
    /// the caller must leave the entry unacked rather than treat this as a
    /// successful delivery.
    async fn deliver(&self, entry: ParsedEntry) -> Option<String> {
        let envelope = DeliveryEnvelope {
            seq: entry.seq,
            conversation_id: entry.aggregate_id.clone(),
            message_id: entry.message_id,
            payload: entry.payload,
        };
        match self
            .broadcaster
            .broadcast(&entry.aggregate_id, envelope)
            .await
        {
            BroadcastOutcome::Delivered => Some(entry.redis_id),
            BroadcastOutcome::Overloaded => {
                self.set_status(ConsumerStatus::Paused);
                None
            }
        }
    }

    async fn ack(&mut self, ids: &[String]) {
        if ids.is_empty() {
            return;
        }
        let result: Result<i64, redis::RedisError> = self
            .redis
            .xack(&self.config.stream_key, &self.config.group, ids)
            .await;
        if let Err(e) = result {
            error!(error = %e, count = ids.len(), "xack failed");
        }
    }

    async fn dead_letter_raw(&self, redis_id: &str, map: &HashMap<String, Value>, reason: &str) {
        let event_id = field_str(map, "eventId")
            .and_then(|s| Uuid::parse_str(&s).ok())
            .unwrap_or_else(Uuid::new_v4);
        let aggregate_id = field_str(map, "aggregateId").unwrap_or_default();
        let payload = field_bytes(map, "payload")
            .and_then(|b| serde_json::from_slice(b).ok())
            .unwrap_or(serde_json::Value::Null);

        if let Err(e) = crate::db::insert_dlq_record(
            &self.pool,
            &self.config.stream_key,
            &self.config.group,
            event_id,
            &aggregate_id,
            &payload,
            reason,
        )
        .await
        {
            error!(error = %e, redis_id = %redis_id, "failed to persist dlq record for malformed entry");
        }
    }

    /// Idle-pending reclaim: entries claimed by a consumer that died before
    /// acking. Anything reclaimed past `maxAttempts` goes straight to the
    /// DLQ instead of being retried indefinitely.
    async fn reclaim_idle_pending(&mut self) {
        self.set_status(ConsumerStatus::Reading);
        let reply: Value = match redis::cmd("XAUTOCLAIM")
            .arg(&self.config.stream_key)
            .arg(&self.config.group)
            .arg(&self.config.consumer_name)
            .arg(self.config.claim_idle_ms)
            .arg("0-0")
            .arg("COUNT")
            .arg(self.config.batch_size)
            .query_async(&mut self.redis)
            .await
        {
            Ok(v) => v,
            Err(e) => {
                error!(error = %e, "xautoclaim failed");
                self.set_status(ConsumerStatus::Idle);
                return;
            }
        };

        let claimed = match reply {
            Value::Bulk(items) if items.len() >= 2 => items,
            _ => {
                self.set_status(ConsumerStatus::Idle);
                return;
            }
        };

        let entries = match &claimed[1] {
            Value::Bulk(entries) => entries.clone(),
            _ => Vec::new(),
        };

        let mut to_ack = Vec::new();
        for entry in entries {
            let Value::Bulk(pair) = entry else { continue };
            if pair.len() != 2 {
                continue;
            }
            let redis_id = match &pair[0] {
                Value::Data(bytes) => String::from_utf8_lossy(bytes).to_string(),
                _ => continue,
            };
            let map = match &pair[1] {
                Value::Bulk(fields) => fields_to_map(fields),
                _ => HashMap::new(),
            };

            let attempts = self.reclaim_attempts.entry(redis_id.clone()).or_insert(0);
            *attempts += 1;

            if *attempts as i32 > self.config.max_attempts {
                self.dead_letter_raw(&redis_id, &map, "max reclaim attempts exceeded")
                    .await;
                to_ack.push(redis_id.clone());
                self.reclaim_attempts.remove(&redis_id);
                continue;
            }

            match parse_entry(&redis_id, &map) {
                Ok(parsed) => {
                    if !self.is_duplicate(parsed.event_id).await {
                        self.buffer_entry(parsed);
                    } else {
                        to_ack.push(redis_id.clone());
                    }
                }
                Err(reason) => {
                    self.dead_letter_raw(&redis_id, &map, &reason).await;
                    to_ack.push(redis_id.clone());
                }
            }
        }

        let delivered = self.drain_ready_entries().await;
        to_ack.extend(delivered);
        self.set_status(ConsumerStatus::Acking);
        self.ack(&to_ack).await;
        self.set_status(ConsumerStatus::Idle);
    }

    /// On shutdown, force-flush whatever survived reordering rather than
    /// leaving it unacked forever; a resumed connection will catch any gap
    /// via `lastServerSeq` reconciliation.
    async fn flush_reorder_buffers_on_shutdown(&mut self) {
        let aggregate_ids: Vec<String> = self.reorder.keys().cloned().collect();
        let mut to_ack = Vec::new();
        for aggregate_id in aggregate_ids {
            if let Some(mut buf) = self.reorder.remove(&aggregate_id) {
                while let Some((&seq, _)) = buf.pending.first_key_value() {
                    let entry = buf.pending.remove(&seq).unwrap();
                    if let Some(redis_id) = self.deliver(entry).await {
                        to_ack.push(redis_id);
                    }
                }
            }
        }
        self.ack(&to_ack).await;
    }
}

fn field_bytes<'a>(map: &'a HashMap<String, Value>, key: &str) -> Option<&'a [u8]> {
    match map.get(key) {
        Some(Value::Data(bytes)) => Some(bytes.as_slice()),
        _ => None,
    }
}

fn field_str(map: &HashMap<String, Value>, key: &str) -> Option<String> {
    field_bytes(map, key).map(|b| String::from_utf8_lossy(b).to_string())
}

fn fields_to_map(fields: &[Value]) -> HashMap<String, Value> {
    let mut map = HashMap::new();
    let mut iter = fields.iter().cloned();
    while let (Some(Value::Data(k)), Some(v)) = (iter.next(), iter.next()) {
        map.insert(String::from_utf8_lossy(&k).to_string(), v);
    }
    map
}

fn parse_entry(redis_id: &str, map: &HashMap<String, Value>) -> Result<ParsedEntry, String> {
    let event_id = field_str(map, "eventId")
        .ok_or("missing eventId")?
        .parse::<Uuid>()
        .map_err(|e| format!("invalid eventId: {e}"))?;
    let message_id = field_str(map, "messageId")
        .ok_or("missing messageId")?
        .parse::<Uuid>()
        .map_err(|e| format!("invalid messageId: {e}"))?;
    let aggregate_id = field_str(map, "aggregateId").ok_or("missing aggregateId")?;
    let payload_bytes = field_bytes(map, "payload").ok_or("missing payload")?;
    let payload: serde_json::Value = serde_json::from_slice(payload_bytes)
        .map_err(|e| format!("invalid payload json: {e}"))?;
    let seq = payload
        .get("seq")
        .and_then(|v| v.as_i64())
        .ok_or("payload missing seq")?;

    Ok(ParsedEntry {
        redis_id: redis_id.to_string(),
        event_id,
        message_id,
        aggregate_id,
        seq,
        payload,
    })
}
