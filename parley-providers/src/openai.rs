//! OpenAI-compatible HTTP client

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

use crate::base::{
    LLMConfig, LLMModel, LLMProvider, LLMResponse, LLMStreamEvent, LLMUsage, Message,
    ProviderError, ProviderEventStream, ProviderResult,
};

/// Chat completion request body
#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: Vec<Message>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<usize>,
    temperature: f32,
    top_p: f32,
    presence_penalty: f32,
    frequency_penalty: f32,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Usage,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct Usage {
    #[serde(default)]
    prompt_tokens: i64,
    #[serde(default)]
    completion_tokens: i64,
    #[serde(default)]
    total_tokens: i64,
}

impl Usage {
    fn into_map(self) -> HashMap<String, i64> {
        HashMap::from([
            ("prompt_tokens".to_string(), self.prompt_tokens),
            ("completion_tokens".to_string(), self.completion_tokens),
            ("total_tokens".to_string(), self.total_tokens),
        ])
    }
}

#[derive(Debug, Deserialize)]
struct StreamChunk {
    choices: Vec<StreamChoice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: StreamDelta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ModelList {
    #[serde(default)]
    data: Vec<ModelEntry>,
}

#[derive(Debug, Deserialize)]
struct ModelEntry {
    id: String,
    #[serde(default)]
    owned_by: Option<String>,
}

/// Client for any backend speaking the OpenAI chat completions protocol
pub struct OpenAiCompatClient {
    client: Client,
    api_base: String,
    api_key: Option<String>,
    default_model: String,
    provider_name: String,
    quota_tokens: u64,
    used_tokens: Arc<AtomicU64>,
}

impl OpenAiCompatClient {
    /// Create a new client; a trailing slash on `api_base` is ignored
    pub fn new(
        api_base: impl Into<String>,
        api_key: Option<String>,
        default_model: impl Into<String>,
    ) -> Self {
        let api_base = api_base.into().trim_end_matches('/').to_string();
        Self {
            client: Client::builder()
                .http1_only() // Force HTTP/1.1 to avoid issues with some local servers
                .build()
                .unwrap_or_else(|_| Client::new()),
            api_base,
            api_key: api_key.filter(|key| !key.trim().is_empty()),
            default_model: default_model.into(),
            provider_name: "OpenAI".to_string(),
            quota_tokens: 0,
            used_tokens: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn with_provider_name(mut self, provider_name: impl Into<String>) -> Self {
        self.provider_name = provider_name.into();
        self
    }

    pub fn with_quota(mut self, quota_tokens: u64) -> Self {
        self.quota_tokens = quota_tokens;
        self
    }

    /// Start counting from a total carried over from an earlier run
    pub fn with_used_tokens(self, used_tokens: u64) -> Self {
        self.used_tokens.store(used_tokens, Ordering::Relaxed);
        self
    }

    /// Tokens consumed so far, seed included
    pub fn used_tokens(&self) -> u64 {
        self.used_tokens.load(Ordering::Relaxed)
    }

    fn apply_headers(&self, mut req_builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        if let Some(api_key) = &self.api_key {
            req_builder = req_builder.header("Authorization", format!("Bearer {}", api_key));
        }
        req_builder
    }

    fn build_request<'a>(
        messages: Vec<Message>,
        config: &'a LLMConfig,
        stream: bool,
    ) -> ChatCompletionRequest<'a> {
        ChatCompletionRequest {
            model: &config.model,
            messages,
            stream: if stream { Some(true) } else { None },
            max_tokens: config.max_tokens,
            temperature: config.temperature,
            top_p: config.top_p,
            presence_penalty: config.presence_penalty,
            frequency_penalty: config.frequency_penalty,
        }
    }

    async fn send(&self, request: &ChatCompletionRequest<'_>) -> ProviderResult<reqwest::Response> {
        let url = format!("{}/chat/completions", self.api_base);
        debug!(
            "Sending chat request to {} with model {}",
            self.api_base, request.model
        );
        let response = self
            .apply_headers(self.client.post(&url).json(request))
            .send()
            .await?;
        Self::check_status(response).await
    }

    async fn check_status(response: reqwest::Response) -> ProviderResult<reqwest::Response> {
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status();
        let error_text = response
            .text()
            .await
            .unwrap_or_else(|_| "Unknown error".to_string());
        Err(ProviderError::ApiError(format!(
            "HTTP {}: {}",
            status, error_text
        )))
    }

    fn record_usage(used_tokens: &AtomicU64, total_tokens: i64) {
        if total_tokens > 0 {
            used_tokens.fetch_add(total_tokens as u64, Ordering::Relaxed);
        }
    }

    fn parse_response(response: ChatCompletionResponse) -> ProviderResult<LLMResponse> {
        let ChatCompletionResponse { choices, usage } = response;
        let choice = choices
            .into_iter()
            .next()
            .ok_or_else(|| ProviderError::InvalidResponse("No choices in response".to_string()))?;

        Ok(LLMResponse {
            content: choice.message.content,
            finish_reason: choice.finish_reason.unwrap_or_else(|| "stop".to_string()),
            usage: usage.into_map(),
        })
    }

    fn finalize_partial_response(
        content: String,
        finish_reason: Option<String>,
        usage: Option<Usage>,
    ) -> LLMResponse {
        LLMResponse {
            content: if content.is_empty() {
                None
            } else {
                Some(content)
            },
            finish_reason: finish_reason.unwrap_or_else(|| "stop".to_string()),
            usage: usage.map(Usage::into_map).unwrap_or_default(),
        }
    }

    /// Drain every complete event from `buffer`, leaving a partial one in place.
    ///
    /// Events are only decoded once whole, so a character split across two
    /// network chunks is never cut in half.
    fn parse_sse_events(buffer: &mut Vec<u8>) -> Vec<String> {
        let mut events = Vec::new();
        while let Some(pos) = buffer.windows(2).position(|pair| pair == b"\n\n") {
            let raw: Vec<u8> = buffer.drain(..pos + 2).take(pos).collect();
            let raw = String::from_utf8_lossy(&raw);

            let mut data_lines = Vec::new();
            for line in raw.lines() {
                if let Some(rest) = line.strip_prefix("data:") {
                    data_lines.push(rest.trim().to_string());
                }
            }

            if !data_lines.is_empty() {
                events.push(data_lines.join("\n"));
            }
        }
        events
    }
}

#[async_trait]
impl LLMProvider for OpenAiCompatClient {
    async fn chat(&self, messages: Vec<Message>, config: &LLMConfig) -> ProviderResult<LLMResponse> {
        let request = Self::build_request(messages, config, false);
        let response = self.send(&request).await?;

        let response_data: ChatCompletionResponse = response.json().await?;
        let parsed = Self::parse_response(response_data)?;
        Self::record_usage(&self.used_tokens, parsed.total_tokens());
        Ok(parsed)
    }

    async fn chat_stream(
        &self,
        messages: Vec<Message>,
        config: &LLMConfig,
    ) -> ProviderResult<ProviderEventStream> {
        let request = Self::build_request(messages, config, true);
        let response = self.send(&request).await?;

        let used_tokens = Arc::clone(&self.used_tokens);
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        tokio::spawn(async move {
            let mut response = response;
            let mut buffer: Vec<u8> = Vec::new();
            let mut content = String::new();
            let mut finish_reason: Option<String> = None;
            let mut usage: Option<Usage> = None;

            loop {
                let chunk = match response.chunk().await {
                    Ok(Some(bytes)) => bytes,
                    Ok(None) => break,
                    Err(err) => {
                        let _ = tx.send(Err(ProviderError::HttpError(err)));
                        return;
                    }
                };

                buffer.extend_from_slice(&chunk);

                for payload in Self::parse_sse_events(&mut buffer) {
                    if payload == "[DONE]" {
                        let final_response =
                            Self::finalize_partial_response(content, finish_reason, usage);
                        Self::record_usage(&used_tokens, final_response.total_tokens());
                        let _ = tx.send(Ok(LLMStreamEvent::Completed(final_response)));
                        return;
                    }

                    let parsed = match serde_json::from_str::<StreamChunk>(&payload) {
                        Ok(chunk) => chunk,
                        Err(err) => {
                            let _ = tx.send(Err(ProviderError::JsonError(err)));
                            return;
                        }
                    };

                    if parsed.usage.is_some() {
                        usage = parsed.usage;
                    }

                    if let Some(choice) = parsed.choices.first() {
                        if let Some(reason) = &choice.finish_reason {
                            finish_reason = Some(reason.clone());
                        }
                        if let Some(delta_text) = &choice.delta.content {
                            content.push_str(delta_text);
                            if tx.send(Ok(LLMStreamEvent::TextDelta(delta_text.clone()))).is_err() {
                                // receiver dropped: the request was abandoned
                                return;
                            }
                        }
                    }
                }
            }

            let final_response = Self::finalize_partial_response(content, finish_reason, usage);
            Self::record_usage(&used_tokens, final_response.total_tokens());
            let _ = tx.send(Ok(LLMStreamEvent::Completed(final_response)));
        });

        Ok(Box::pin(futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        })))
    }

    async fn usage(&self) -> ProviderResult<LLMUsage> {
        Ok(LLMUsage {
            used: self.used_tokens.load(Ordering::Relaxed),
            total: self.quota_tokens,
        })
    }

    async fn models(&self) -> ProviderResult<Vec<LLMModel>> {
        let url = format!("{}/models", self.api_base);
        let response = self.apply_headers(self.client.get(&url)).send().await?;
        let response = Self::check_status(response).await?;
        let list: ModelList = response.json().await?;

        Ok(list
            .data
            .into_iter()
            .map(|entry| LLMModel {
                display_name: entry.id.clone(),
                name: entry.id,
                available: true,
                provider_id: entry
                    .owned_by
                    .unwrap_or_else(|| self.provider_name.clone()),
            })
            .collect())
    }

    fn get_default_model(&self) -> String {
        self.default_model.clone()
    }
}
