//! Session data structures

use chrono::Utc;
use serde::{Deserialize, Serialize};

use super::mask::Mask;
use super::message::{new_id, ChatMessage, Role};
use super::model_config::ModelConfig;
use crate::token::TokenEstimator;

/// Topic a session carries until one is derived or set
pub const DEFAULT_TOPIC: &str = "New Conversation";

/// Prefix wrapped around the memory digest when it is sent as context
pub const MEMORY_PROMPT_PREFIX: &str = "This is a summary of the chat history as a recap: ";

/// Fixed id of the synthetic memory-prompt message
pub const MEMORY_PROMPT_ID: &str = "memory-prompt";

/// Running counters for committed assistant output
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatStat {
    pub token_count: usize,
    pub word_count: usize,
    pub char_count: usize,
}

/// A conversation session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    #[serde(default = "new_id")]
    pub id: String,
    #[serde(default = "default_topic")]
    pub topic: String,
    /// Model-written digest of messages below `last_summarize_index`
    #[serde(default)]
    pub memory_prompt: String,
    #[serde(default)]
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub stat: ChatStat,
    /// Milliseconds since the Unix epoch
    #[serde(default = "now_millis")]
    pub last_update: i64,
    /// Messages below this index are folded into `memory_prompt`
    #[serde(default)]
    pub last_summarize_index: usize,
    /// User-set floor below which messages are never sent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clear_context_index: Option<usize>,
    /// Name of the mask this session was created from, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mask_name: Option<String>,
    /// Static context messages, sent at the head of every window
    #[serde(default)]
    pub context: Vec<ChatMessage>,
    #[serde(default)]
    pub model_config: ModelConfig,
    /// Fields written by other versions, kept on round-trip
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

fn default_topic() -> String {
    DEFAULT_TOPIC.to_string()
}

pub(crate) fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

impl Session {
    /// Create an empty session using the given model settings
    pub fn new(model_config: ModelConfig) -> Self {
        Self {
            id: new_id(),
            topic: default_topic(),
            memory_prompt: String::new(),
            messages: Vec::new(),
            stat: ChatStat::default(),
            last_update: now_millis(),
            last_summarize_index: 0,
            clear_context_index: None,
            mask_name: None,
            context: Vec::new(),
            model_config,
            extra: serde_json::Map::new(),
        }
    }

    /// Create a session seeded from a mask over the global defaults
    pub fn from_mask(mask: &Mask, defaults: &ModelConfig) -> Self {
        let mut session = Self::new(defaults.merged_with(&mask.model_config));
        session.topic = mask.name.clone();
        session.mask_name = Some(mask.name.clone());
        session.context = mask.context.clone();
        session
    }

    /// Append a message and bump `last_update`
    pub fn push_message(&mut self, message: ChatMessage) {
        self.messages.push(message);
        self.touch();
    }

    pub fn touch(&mut self) {
        self.last_update = now_millis();
    }

    pub fn message_mut(&mut self, message_id: &str) -> Option<&mut ChatMessage> {
        self.messages.iter_mut().find(|m| m.id == message_id)
    }

    pub fn has_default_topic(&self) -> bool {
        self.topic == DEFAULT_TOPIC
    }

    /// Effective user-set floor (0 when unset)
    pub fn clear_context_floor(&self) -> usize {
        self.clear_context_index.unwrap_or(0)
    }

    /// The digest wrapped as a system message, if there is one
    pub fn memory_prompt_message(&self) -> Option<ChatMessage> {
        if self.memory_prompt.is_empty() {
            return None;
        }
        Some(ChatMessage::synthetic(
            MEMORY_PROMPT_ID,
            Role::System,
            format!("{}{}", MEMORY_PROMPT_PREFIX, self.memory_prompt),
        ))
    }

    /// Fold a committed message into the running counters
    pub fn record_stat(&mut self, message: &ChatMessage, estimator: &dyn TokenEstimator) {
        let text = message.text();
        self.stat.char_count += text.chars().count();
        self.stat.word_count += text.split_whitespace().count();
        self.stat.token_count += estimator.estimate(&text);
    }

    /// Drop history and digest, keeping identity and configuration
    pub fn reset(&mut self) {
        self.messages.clear();
        self.memory_prompt.clear();
        self.last_summarize_index = 0;
        self.clear_context_index = None;
        self.touch();
    }
}

/// Estimated token cost of a message list
pub fn count_messages(messages: &[ChatMessage], estimator: &dyn TokenEstimator) -> usize {
    messages
        .iter()
        .map(|message| estimator.estimate(&message.text()))
        .sum()
}
