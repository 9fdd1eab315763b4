//! Chat message types

use chrono::Local;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Who authored a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Image reference inside a multimodal message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageUrl {
    pub url: String,
}

/// One part of a multimodal message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
}

/// Message body: plain text, or ordered text/image parts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

impl MessageContent {
    /// Text view used for display and token estimation; image parts are ignored.
    pub fn text(&self) -> String {
        match self {
            MessageContent::Text(text) => text.clone(),
            MessageContent::Parts(parts) => parts
                .iter()
                .filter_map(|part| match part {
                    ContentPart::Text { text } => Some(text.as_str()),
                    ContentPart::ImageUrl { .. } => None,
                })
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }

    /// Text plus attached image URLs as a multimodal body
    pub fn with_images(text: impl Into<String>, images: &[String]) -> Self {
        let text = text.into();
        if images.is_empty() {
            return MessageContent::Text(text);
        }
        let mut parts = vec![ContentPart::Text { text }];
        parts.extend(images.iter().map(|url| ContentPart::ImageUrl {
            image_url: ImageUrl { url: url.clone() },
        }));
        MessageContent::Parts(parts)
    }

    /// Append text; a multimodal body gets the text added to its first text part.
    pub fn push_text(&mut self, extra: &str) {
        match self {
            MessageContent::Text(text) => text.push_str(extra),
            MessageContent::Parts(parts) => {
                let first_text = parts.iter_mut().find_map(|part| match part {
                    ContentPart::Text { text } => Some(text),
                    ContentPart::ImageUrl { .. } => None,
                });
                match first_text {
                    Some(text) => text.push_str(extra),
                    None => parts.push(ContentPart::Text {
                        text: extra.to_string(),
                    }),
                }
            }
        }
    }
}

impl Default for MessageContent {
    fn default() -> Self {
        MessageContent::Text(String::new())
    }
}

impl From<String> for MessageContent {
    fn from(text: String) -> Self {
        MessageContent::Text(text)
    }
}

impl From<&str> for MessageContent {
    fn from(text: &str) -> Self {
        MessageContent::Text(text.to_string())
    }
}

/// A chat message.
///
/// Mutated in place while `streaming` is set (content is replaced wholesale
/// on every update), frozen afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    #[serde(default)]
    pub id: String,
    pub role: Role,
    #[serde(default)]
    pub content: MessageContent,
    #[serde(default)]
    pub date: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub streaming: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_error: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Fields written by other versions, kept on round-trip
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl ChatMessage {
    /// Create a message with a fresh id and the current local time
    pub fn new(role: Role, content: impl Into<MessageContent>) -> Self {
        Self {
            id: new_id(),
            role,
            content: content.into(),
            date: Local::now().format("%Y-%m-%d %H:%M:%S").to_string(),
            streaming: false,
            is_error: false,
            model: None,
            extra: serde_json::Map::new(),
        }
    }

    pub fn user(content: impl Into<MessageContent>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<MessageContent>) -> Self {
        Self::new(Role::Assistant, content)
    }

    pub fn system(content: impl Into<MessageContent>) -> Self {
        Self::new(Role::System, content)
    }

    /// Synthetic message with a fixed id and no date, so repeated builds compare equal
    pub fn synthetic(id: &str, role: Role, content: impl Into<MessageContent>) -> Self {
        Self {
            id: id.to_string(),
            role,
            content: content.into(),
            date: String::new(),
            streaming: false,
            is_error: false,
            model: None,
            extra: serde_json::Map::new(),
        }
    }

    /// Empty assistant placeholder that will receive streamed content
    pub fn streaming_placeholder(model: impl Into<String>) -> Self {
        let mut message = Self::assistant("");
        message.streaming = true;
        message.model = Some(model.into());
        message
    }

    pub fn text(&self) -> String {
        self.content.text()
    }
}

/// Fresh identifier for sessions and messages
pub fn new_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}
