//! Named configuration overlays for new sessions

use serde::{Deserialize, Serialize};

use super::message::{new_id, ChatMessage};
use super::model_config::ModelConfigPatch;

/// A named overlay: static context messages plus model settings that win
/// over the global defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mask {
    #[serde(default = "new_id")]
    pub id: String,
    pub name: String,
    /// Sent verbatim at the head of every context window
    #[serde(default)]
    pub context: Vec<ChatMessage>,
    #[serde(default)]
    pub model_config: ModelConfigPatch,
}

impl Mask {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: new_id(),
            name: name.into(),
            context: Vec::new(),
            model_config: ModelConfigPatch::default(),
        }
    }

    pub fn with_context(mut self, message: ChatMessage) -> Self {
        self.context.push(message);
        self
    }
}
