mod conversation;
mod messages;
mod registry;

pub use conversation::{ConversationActor, ConvoActorArgs};
pub use messages::ConvoMessage;
pub use registry::ActorRegistry;
