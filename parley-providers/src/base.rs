//! Base trait for model backends

use async_trait::async_trait;
use futures::stream::{self, Stream};
use parley_core::{ChatMessage, MessageContent, ModelConfig};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::pin::Pin;
use thiserror::Error;

/// Error type for provider operations
#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("HTTP request failed: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("JSON parsing failed: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("API error: {0}")]
    ApiError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),
}

impl ProviderError {
    /// Transport-level failure, as opposed to an error reported by the backend
    pub fn is_network(&self) -> bool {
        matches!(self, ProviderError::HttpError(_))
    }
}

pub type ProviderResult<T> = Result<T, ProviderError>;

pub type ProviderEventStream = Pin<Box<dyn Stream<Item = ProviderResult<LLMStreamEvent>> + Send>>;

/// A message on the wire
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: String,
    pub content: MessageContent,
}

impl Message {
    pub fn user(content: impl Into<MessageContent>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<MessageContent>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<MessageContent>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }
}

impl From<&ChatMessage> for Message {
    fn from(message: &ChatMessage) -> Self {
        Self {
            role: message.role.as_str().to_string(),
            content: message.content.clone(),
        }
    }
}

/// Generation parameters for one request
#[derive(Debug, Clone, PartialEq)]
pub struct LLMConfig {
    pub model: String,
    pub temperature: f32,
    pub top_p: f32,
    /// `None` leaves the completion length to the backend
    pub max_tokens: Option<usize>,
    pub presence_penalty: f32,
    pub frequency_penalty: f32,
    pub stream: bool,
}

impl From<&ModelConfig> for LLMConfig {
    fn from(config: &ModelConfig) -> Self {
        Self {
            model: config.model.clone(),
            temperature: config.temperature,
            top_p: config.top_p,
            max_tokens: Some(config.max_tokens),
            presence_penalty: config.presence_penalty,
            frequency_penalty: config.frequency_penalty,
            stream: false,
        }
    }
}

impl LLMConfig {
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn streaming(mut self, stream: bool) -> Self {
        self.stream = stream;
        self
    }

    pub fn without_max_tokens(mut self) -> Self {
        self.max_tokens = None;
        self
    }
}

/// Response from a model backend
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LLMResponse {
    pub content: Option<String>,
    #[serde(default = "default_finish_reason")]
    pub finish_reason: String,
    #[serde(default)]
    pub usage: HashMap<String, i64>,
}

fn default_finish_reason() -> String {
    "stop".to_string()
}

impl LLMResponse {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: Some(content.into()),
            finish_reason: default_finish_reason(),
            usage: HashMap::new(),
        }
    }

    pub fn total_tokens(&self) -> i64 {
        self.usage.get("total_tokens").copied().unwrap_or(0)
    }
}

/// Streaming event emitted by providers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum LLMStreamEvent {
    /// Incremental assistant text output
    TextDelta(String),
    /// Final completed response
    Completed(LLMResponse),
}

/// Account usage against the quota
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LLMUsage {
    pub used: u64,
    pub total: u64,
}

/// A model the backend can serve
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LLMModel {
    pub name: String,
    pub display_name: String,
    pub available: bool,
    pub provider_id: String,
}

/// Trait for model backends
#[async_trait]
pub trait LLMProvider: Send + Sync {
    /// Send a chat completion request
    async fn chat(&self, messages: Vec<Message>, config: &LLMConfig) -> ProviderResult<LLMResponse>;

    /// Send a streaming chat completion request.
    ///
    /// Default behavior falls back to non-streaming chat and emits one text delta.
    async fn chat_stream(
        &self,
        messages: Vec<Message>,
        config: &LLMConfig,
    ) -> ProviderResult<ProviderEventStream> {
        let response = self.chat(messages, config).await?;

        let mut events = Vec::new();
        if let Some(content) = response.content.clone() {
            if !content.is_empty() {
                events.push(Ok(LLMStreamEvent::TextDelta(content)));
            }
        }
        events.push(Ok(LLMStreamEvent::Completed(response)));

        Ok(Box::pin(stream::iter(events)))
    }

    /// Quota consumption
    async fn usage(&self) -> ProviderResult<LLMUsage>;

    /// Models the backend lists
    async fn models(&self) -> ProviderResult<Vec<LLMModel>>;

    /// Get the default model for this provider
    fn get_default_model(&self) -> String;
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use parley_core::Role;

    struct EchoProvider;

    #[async_trait]
    impl LLMProvider for EchoProvider {
        async fn chat(&self, messages: Vec<Message>, _config: &LLMConfig) -> ProviderResult<LLMResponse> {
            let last = messages.last().map(|m| m.content.text()).unwrap_or_default();
            Ok(LLMResponse::text(last))
        }

        async fn usage(&self) -> ProviderResult<LLMUsage> {
            Ok(LLMUsage::default())
        }

        async fn models(&self) -> ProviderResult<Vec<LLMModel>> {
            Ok(Vec::new())
        }

        fn get_default_model(&self) -> String {
            "echo".to_string()
        }
    }

    #[test]
    fn test_message_from_chat_message() {
        let chat = ChatMessage::new(Role::Assistant, "hi");
        let message = Message::from(&chat);
        assert_eq!(message.role, "assistant");
        assert_eq!(message.content.text(), "hi");
    }

    #[test]
    fn test_config_from_model_config() {
        let config = LLMConfig::from(&ModelConfig::default())
            .with_model("gpt-4")
            .streaming(true)
            .without_max_tokens();
        assert_eq!(config.model, "gpt-4");
        assert!(config.stream);
        assert!(config.max_tokens.is_none());
    }

    #[tokio::test]
    async fn test_default_stream_falls_back_to_chat() {
        let config = LLMConfig::from(&ModelConfig::default());
        let mut stream = EchoProvider
            .chat_stream(vec![Message::user("ping")], &config)
            .await
            .unwrap();

        match stream.next().await {
            Some(Ok(LLMStreamEvent::TextDelta(text))) => assert_eq!(text, "ping"),
            other => panic!("unexpected event: {:?}", other),
        }
        assert!(matches!(
            stream.next().await,
            Some(Ok(LLMStreamEvent::Completed(_)))
        ));
        assert!(stream.next().await.is_none());
    }
}
