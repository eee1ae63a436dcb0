use async_trait::async_trait;
use ractor::{Actor, ActorProcessingErr, ActorRef};
use sqlx::PgPool;
use tracing::info;

use super::messages::ConvoMessage;
use crate::error::CoreError;

/// Serializes all writes for one conversation (one aggregate). Spawned
/// lazily by [`ActorRegistry`](super::registry::ActorRegistry) and kept
/// alive for the conversation's lifetime; every `SendMessage` that reaches
/// it is handled to completion before the next one starts, which is what
/// guarantees the message-insert/outbox-insert pair for two concurrent
/// senders in the same conversation never interleaves.
pub struct ConversationActor;

pub struct ConvoActorArgs {
    pub convo_id: String,
    pub db_pool: PgPool,
}

pub struct ConversationActorState {
    convo_id: String,
    db_pool: PgPool,
}

#[async_trait]
impl Actor for ConversationActor {
    type Msg = ConvoMessage;
    type State = ConversationActorState;
    type Arguments = ConvoActorArgs;

    async fn pre_start(
        &self,
        _myself: ActorRef<Self::Msg>,
        args: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        info!(convo_id = %args.convo_id, "conversation actor starting");
        Ok(ConversationActorState {
            convo_id: args.convo_id,
            db_pool: args.db_pool,
        })
    }

    async fn handle(
        &self,
        myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            ConvoMessage::SendMessage {
                sender_id,
                kind,
                encrypted_content,
                metadata,
                event_type,
                dedupe_key,
                reply,
            } => {
                let result = crate::db::insert_message_with_outbox(
                    &state.db_pool,
                    &state.convo_id,
                    &sender_id,
                    &kind,
                    &encrypted_content,
                    metadata,
                    &event_type,
                    dedupe_key,
                )
                .await
                .map_err(|e| CoreError::Transient(e.to_string()));

                let _ = reply.send(result);
            }
            ConvoMessage::Shutdown => {
                myself.stop(None);
            }
        }
        Ok(())
    }
}
