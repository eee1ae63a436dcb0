use dashmap::DashMap;
use ractor::ActorRef;
use sqlx::PgPool;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::conversation::{ConversationActor, ConvoActorArgs};
use super::messages::ConvoMessage;

/// Lazily spawns and caches one [`ConversationActor`] per conversation.
#[derive(Clone)]
pub struct ActorRegistry {
    actors: Arc<DashMap<String, ActorRef<ConvoMessage>>>,
    db_pool: PgPool,
}

impl ActorRegistry {
    pub fn new(db_pool: PgPool) -> Self {
        Self {
            actors: Arc::new(DashMap::new()),
            db_pool,
        }
    }

    pub async fn get_or_spawn(&self, convo_id: &str) -> anyhow::Result<ActorRef<ConvoMessage>> {
        if let Some(actor_ref) = self.actors.get(convo_id) {
            return Ok(actor_ref.clone());
        }

        let args = ConvoActorArgs {
            convo_id: convo_id.to_string(),
            db_pool: self.db_pool.clone(),
        };

        let (actor_ref, _handle) = ractor::Actor::spawn(None, ConversationActor, args)
            .await
            .map_err(|e| anyhow::anyhow!("failed to spawn conversation actor: {}", e))?;

        self.actors.insert(convo_id.to_string(), actor_ref.clone());
        debug!(convo_id, active = self.actor_count(), "spawned conversation actor");

        Ok(actor_ref)
    }

    pub fn actor_count(&self) -> usize {
        self.actors.len()
    }

    pub fn remove_actor(&self, convo_id: &str) {
        if self.actors.remove(convo_id).is_none() {
            warn!(convo_id, "attempted to remove non-existent conversation actor");
        }
    }

    pub async fn shutdown_all(&self) {
        info!(count = self.actor_count(), "shutting down conversation actors");
        for entry in self.actors.iter() {
            let _ = entry.value().cast(ConvoMessage::Shutdown);
        }
        self.actors.clear();
    }
}
