//! Postgres access: message storage and the transactional outbox (C4).
//!
//! Mirrors the connection-pool setup the rest of this codebase expects
//! (`PgPoolOptions` sized from `Config::db`) but the query surface below is
//! scoped to what the realtime core itself needs — message persistence and
//! the outbox/DLQ tables — not general conversation/membership CRUD, which
//! is an external collaborator per this system's scope.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, Row, Transaction};
use std::time::Duration;
use uuid::Uuid;

use crate::config::DbTuning;
use crate::models::{DlqRecord, Message, NewOutboxEvent, OutboxEvent};

pub type DbPool = PgPool;

pub async fn init_db(tuning: &DbTuning) -> Result<DbPool> {
    let pool = PgPoolOptions::new()
        .max_connections(tuning.pool_max)
        .min_connections(tuning.pool_min)
        .acquire_timeout(tuning.acquire_timeout)
        .connect(&tuning.url)
        .await
        .context("failed to connect to database")?;

    Ok(pool)
}

pub async fn health_check(pool: &DbPool) -> Result<bool> {
    let row = sqlx::query("SELECT 1").fetch_one(pool).await?;
    Ok(row.try_get::<i32, _>(0).unwrap_or(0) == 1)
}

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

/// Inserts a message and its outbox event in one transaction, so the
/// outbox-commit-follows-message-commit invariant can never be violated by
/// a partial write. `seq` is allocated as `max(seq)+1` for the conversation
/// inside the same transaction, so it is also the value copied into the
/// outbox payload (see the design note on `message_outbox` vs `messages`
/// `seq` columns).
pub async fn insert_message_with_outbox(
    pool: &DbPool,
    conversation_id: &str,
    sender_id: &str,
    kind: &str,
    encrypted_content: &[u8],
    metadata: Option<serde_json::Value>,
    event_type: &str,
    dedupe_key: Option<String>,
) -> Result<(Message, OutboxEvent)> {
    let mut tx = pool.begin().await.context("failed to start transaction")?;

    let message_id = Uuid::new_v4();
    let now = Utc::now();

    let seq: i64 = sqlx::query_scalar(
        "SELECT COALESCE(MAX(seq), 0) + 1 FROM messages WHERE conversation_id = $1 FOR UPDATE",
    )
    .bind(conversation_id)
    .fetch_one(&mut *tx)
    .await
    .context("failed to allocate sequence")?;

    let message = sqlx::query_as::<_, Message>(
        r#"
        INSERT INTO messages
            (id, conversation_id, sender_id, type, status, seq, encrypted_content, metadata, created_at, updated_at)
        VALUES ($1, $2, $3, $4, 'sent', $5, $6, $7, $8, $8)
        RETURNING id, conversation_id, sender_id, type, status, seq, encrypted_content, metadata, created_at, updated_at, deleted_at
        "#,
    )
    .bind(message_id)
    .bind(conversation_id)
    .bind(sender_id)
    .bind(kind)
    .bind(seq)
    .bind(encrypted_content)
    .bind(&metadata)
    .bind(now)
    .fetch_one(&mut *tx)
    .await
    .context("failed to insert message")?;

    let payload = serde_json::json!({
        "messageId": message_id,
        "conversationId": conversation_id,
        "seq": seq,
        "senderId": sender_id,
    });

    let outbox_event = NewOutboxEvent {
        event_id: Uuid::new_v4(),
        message_id,
        aggregate_id: conversation_id.to_string(),
        event_type: event_type.to_string(),
        payload,
        dedupe_key,
    };
    let outbox = enqueue(&mut tx, &outbox_event).await?;

    tx.commit().await.context("failed to commit message+outbox transaction")?;

    Ok((message, outbox))
}

pub async fn get_messages_since_seq(
    pool: &DbPool,
    conversation_id: &str,
    since_seq: i64,
    limit: i64,
) -> Result<Vec<Message>> {
    let messages = sqlx::query_as::<_, Message>(
        r#"
        SELECT id, conversation_id, sender_id, type, status, seq, encrypted_content, metadata, created_at, updated_at, deleted_at
        FROM messages
        WHERE conversation_id = $1 AND seq > $2 AND deleted_at IS NULL
        ORDER BY seq ASC
        LIMIT $3
        "#,
    )
    .bind(conversation_id)
    .bind(since_seq)
    .bind(limit)
    .fetch_all(pool)
    .await
    .context("failed to fetch messages since cursor")?;

    Ok(messages)
}

// ---------------------------------------------------------------------------
// Outbox Repository (C4)
// ---------------------------------------------------------------------------

/// MUST be called inside the caller's message-write transaction.
pub async fn enqueue(
    tx: &mut Transaction<'_, Postgres>,
    event: &NewOutboxEvent,
) -> Result<OutboxEvent> {
    let now = Utc::now();
    let outbox = sqlx::query_as::<_, OutboxEvent>(
        r#"
        INSERT INTO message_outbox
            (id, event_id, message_id, aggregate_id, event_type, payload, status, attempts, occurred_at, dedupe_key)
        VALUES ($1, $2, $3, $4, $5, $6, 'pending', 0, $7, $8)
        RETURNING id, event_id, message_id, aggregate_id, event_type, payload, status, attempts, occurred_at, picked_at, dispatched_at, last_error, dedupe_key
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(event.event_id)
    .bind(event.message_id)
    .bind(&event.aggregate_id)
    .bind(&event.event_type)
    .bind(&event.payload)
    .bind(now)
    .bind(&event.dedupe_key)
    .fetch_one(&mut **tx)
    .await
    .context("failed to enqueue outbox event")?;

    Ok(outbox)
}

/// Atomically selects up to `batch` pending rows ordered by `(occurred_at,
/// id)`, marks them `picked`, and returns them. `FOR UPDATE SKIP LOCKED`
/// lets multiple dispatcher replicas claim concurrently without blocking
/// on each other's in-flight claims.
pub async fn claim(pool: &DbPool, batch: i64, now: DateTime<Utc>) -> Result<Vec<OutboxEvent>> {
    let mut tx = pool.begin().await.context("failed to start claim transaction")?;

    let claimed = sqlx::query_as::<_, OutboxEvent>(
        r#"
        UPDATE message_outbox
        SET status = 'picked', picked_at = $2, attempts = attempts + 1
        WHERE id IN (
            SELECT id FROM message_outbox
            WHERE status = 'pending'
            ORDER BY occurred_at, id
            LIMIT $1
            FOR UPDATE SKIP LOCKED
        )
        RETURNING id, event_id, message_id, aggregate_id, event_type, payload, status, attempts, occurred_at, picked_at, dispatched_at, last_error, dedupe_key
        "#,
    )
    .bind(batch)
    .bind(now)
    .fetch_all(&mut *tx)
    .await
    .context("failed to claim outbox rows")?;

    tx.commit().await.context("failed to commit claim transaction")?;
    Ok(claimed)
}

pub async fn mark_sent(pool: &DbPool, ids: &[Uuid], dispatched_at: DateTime<Utc>) -> Result<()> {
    sqlx::query(
        "UPDATE message_outbox SET status = 'sent', dispatched_at = $2 WHERE id = ANY($1)",
    )
    .bind(ids)
    .bind(dispatched_at)
    .execute(pool)
    .await
    .context("failed to mark outbox rows sent")?;
    Ok(())
}

/// `attempts < maxAttempts` returns the row to `pending` with `lastError`
/// set; otherwise it is marked `dead` and copied into the DLQ table.
pub async fn mark_failed(pool: &DbPool, id: Uuid, reason: &str, max_attempts: i32) -> Result<()> {
    let mut tx = pool.begin().await.context("failed to start mark_failed transaction")?;

    let row = sqlx::query_as::<_, OutboxEvent>(
        r#"
        SELECT id, event_id, message_id, aggregate_id, event_type, payload, status, attempts, occurred_at, picked_at, dispatched_at, last_error, dedupe_key
        FROM message_outbox WHERE id = $1 FOR UPDATE
        "#,
    )
    .bind(id)
    .fetch_one(&mut *tx)
    .await
    .context("failed to load outbox row for mark_failed")?;

    if row.attempts < max_attempts {
        sqlx::query("UPDATE message_outbox SET status = 'pending', last_error = $2 WHERE id = $1")
            .bind(id)
            .bind(reason)
            .execute(&mut *tx)
            .await
            .context("failed to requeue failed outbox row")?;
    } else {
        sqlx::query("UPDATE message_outbox SET status = 'dead', last_error = $2 WHERE id = $1")
            .bind(id)
            .bind(reason)
            .execute(&mut *tx)
            .await
            .context("failed to dead-letter outbox row")?;

        let now = Utc::now();
        sqlx::query(
            r#"
            INSERT INTO message_dlq (id, source_stream, group_name, event_id, aggregate_id, payload, reason, attempts, first_seen_at, last_seen_at)
            VALUES ($1, 'outbox', 'dispatcher', $2, $3, $4, $5, $6, $7, $7)
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(row.event_id)
        .bind(&row.aggregate_id)
        .bind(&row.payload)
        .bind(reason)
        .bind(row.attempts)
        .bind(now)
        .execute(&mut *tx)
        .await
        .context("failed to write DLQ record")?;
    }

    tx.commit().await.context("failed to commit mark_failed transaction")?;
    Ok(())
}

pub async fn prune(pool: &DbPool, retention: Duration) -> Result<u64> {
    let cutoff = Utc::now() - chrono::Duration::from_std(retention).unwrap_or(chrono::Duration::days(7));
    let result = sqlx::query(
        "DELETE FROM message_outbox WHERE status IN ('sent', 'dead') AND occurred_at < $1",
    )
    .bind(cutoff)
    .execute(pool)
    .await
    .context("failed to prune outbox")?;

    Ok(result.rows_affected())
}

pub async fn insert_dlq_record(
    pool: &DbPool,
    source_stream: &str,
    group_name: &str,
    event_id: Uuid,
    aggregate_id: &str,
    payload: &serde_json::Value,
    reason: &str,
) -> Result<DlqRecord> {
    let now = Utc::now();
    let record = sqlx::query_as::<_, DlqRecord>(
        r#"
        INSERT INTO message_dlq (id, source_stream, group_name, event_id, aggregate_id, payload, reason, attempts, first_seen_at, last_seen_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, 0, $8, $8)
        RETURNING id, source_stream, group_name, event_id, aggregate_id, payload, reason, attempts, first_seen_at, last_seen_at
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(source_stream)
    .bind(group_name)
    .bind(event_id)
    .bind(aggregate_id)
    .bind(payload)
    .bind(reason)
    .bind(now)
    .fetch_one(pool)
    .await
    .context("failed to insert DLQ record")?;

    Ok(record)
}
