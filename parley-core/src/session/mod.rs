//! Conversation data model and the session store
//!
//! Sessions are held in memory by [`SessionStore`] and persisted as a whole
//! through [`crate::persist`].

pub mod events;
pub mod manager;
pub mod mask;
pub mod message;
pub mod model_config;
pub mod store;

pub use events::StoreEvent;
pub use manager::{ChatState, SessionStore, UndoToken};
pub use mask::Mask;
pub use message::{new_id, ChatMessage, ContentPart, ImageUrl, MessageContent, Role};
pub use model_config::{ModelConfig, ModelConfigPatch};
pub use store::{
    count_messages, ChatStat, Session, DEFAULT_TOPIC, MEMORY_PROMPT_ID, MEMORY_PROMPT_PREFIX,
};
