//! Database-row and wire-adjacent value types for messages, the outbox, and
//! the dead-letter table. Plain `FromRow` structs, no external schema
//! coupling — the row shapes here are this crate's own.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub conversation_id: String,
    pub sender_id: String,
    #[sqlx(rename = "type")]
    pub kind: String,
    pub status: String,
    pub seq: i64,
    pub encrypted_content: Vec<u8>,
    pub metadata: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

/// A row in `message_outbox`. Carries everything the dispatcher needs to
/// publish without a second round-trip to `messages`.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct OutboxEvent {
    pub id: Uuid,
    pub event_id: Uuid,
    pub message_id: Uuid,
    pub aggregate_id: String,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub status: String,
    pub attempts: i32,
    pub occurred_at: DateTime<Utc>,
    pub picked_at: Option<DateTime<Utc>>,
    pub dispatched_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub dedupe_key: Option<String>,
}

/// Arguments to enqueue a new outbox row, always written in the same
/// transaction as the `messages` insert that produced it.
#[derive(Debug, Clone)]
pub struct NewOutboxEvent {
    pub event_id: Uuid,
    pub message_id: Uuid,
    pub aggregate_id: String,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub dedupe_key: Option<String>,
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct DlqRecord {
    pub id: Uuid,
    pub source_stream: String,
    pub group_name: String,
    pub event_id: Uuid,
    pub aggregate_id: String,
    pub payload: serde_json::Value,
    pub reason: String,
    pub attempts: i32,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
}

/// Short-TTL snapshot of a connection's delivery state, keyed by resume
/// token in the resume store (not a DB table).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResumeSnapshot {
    pub account_id: String,
    pub device_id: String,
    pub last_server_seq: u64,
    pub pending_tail: Vec<DeliveryEnvelope>,
}

/// Handoff from the Consumer to the Hub for one partition delivery. `seq`
/// is the aggregate-level (per-conversation) sequence the Consumer
/// reordered on; it is carried through for resume reconciliation, but it is
/// NOT the wire-level `serverSeq` — that one is assigned per-connection by
/// the Hub when the envelope is actually sent to a socket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryEnvelope {
    pub seq: i64,
    pub conversation_id: String,
    pub message_id: Uuid,
    pub payload: serde_json::Value,
}

/// Verified bearer-token identity, produced by the authenticator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Identity {
    pub account_id: String,
    pub device_id: String,
    pub session_id: String,
    pub scope: Vec<String>,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}
