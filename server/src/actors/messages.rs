use tokio::sync::oneshot;

use crate::error::CoreError;
use crate::models::{Message, OutboxEvent};

/// Messages sent to a [`ConversationActor`](super::conversation::ConversationActor).
///
/// All messages to a single actor are processed sequentially, which is what
/// gives the outbox its per-aggregate FIFO ordering guarantee: two writers
/// racing to send into the same conversation are serialized through one
/// mailbox rather than through row locks alone.
#[derive(Debug)]
pub enum ConvoMessage {
    /// Persists a message and its outbox event in one transaction, then
    /// replies with both rows.
    SendMessage {
        sender_id: String,
        kind: String,
        encrypted_content: Vec<u8>,
        metadata: Option<serde_json::Value>,
        event_type: String,
        dedupe_key: Option<String>,
        reply: oneshot::Sender<Result<(Message, OutboxEvent), CoreError>>,
    },

    /// Fire-and-forget request to stop the actor once its mailbox drains.
    Shutdown,
}
