//! Streaming dispatcher: one model request with abortable progress reporting.
//!
//! For every call the observer sees `on_controller` first, then zero or more
//! `on_update` calls carrying the full text so far, then exactly one of
//! `on_finish` / `on_error`. Once the handle is aborted no further updates
//! are delivered and the call ends with [`DispatchError::Aborted`].

use futures::StreamExt;
use parley_core::AbortHandle;
use parley_providers::{LLMConfig, LLMProvider, LLMStreamEvent, Message, ProviderError};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

/// Why a dispatch ended without a result
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    /// Transport-level failure
    #[error("network failure: {0}")]
    Network(String),

    /// The backend answered with an error
    #[error("backend error: {0}")]
    Backend(String),

    /// Cancelled through the request's abort handle
    #[error("the request was aborted")]
    Aborted,
}

impl DispatchError {
    pub fn is_abort(&self) -> bool {
        matches!(self, DispatchError::Aborted)
    }
}

impl From<ProviderError> for DispatchError {
    fn from(err: ProviderError) -> Self {
        if err.is_network() {
            DispatchError::Network(err.to_string())
        } else {
            DispatchError::Backend(err.to_string())
        }
    }
}

/// Receives the progress of one dispatch
pub trait ChatObserver: Send {
    /// The request's abort handle; always the first call
    fn on_controller(&mut self, handle: AbortHandle);

    /// Complete text received so far
    fn on_update(&mut self, _text: &str) {}

    fn on_finish(&mut self, text: &str);

    fn on_error(&mut self, error: &DispatchError);
}

/// Issues chat requests against a provider
#[derive(Clone)]
pub struct Dispatcher {
    provider: Arc<dyn LLMProvider>,
}

impl Dispatcher {
    pub fn new(provider: Arc<dyn LLMProvider>) -> Self {
        Self { provider }
    }

    pub fn provider(&self) -> &Arc<dyn LLMProvider> {
        &self.provider
    }

    /// Run one request to completion, reporting progress to `observer`.
    ///
    /// The return value mirrors the terminal callback.
    pub async fn chat<O>(
        &self,
        messages: Vec<Message>,
        config: &LLMConfig,
        observer: &mut O,
    ) -> Result<String, DispatchError>
    where
        O: ChatObserver + ?Sized,
    {
        let handle = AbortHandle::new();
        observer.on_controller(handle.clone());

        let result = if config.stream {
            self.run_stream(messages, config, &handle, observer).await
        } else {
            self.run_once(messages, config, &handle).await
        };

        match &result {
            Ok(text) => {
                debug!(model = %config.model, chars = text.len(), "dispatch finished");
                observer.on_finish(text);
            }
            Err(err) => {
                if err.is_abort() {
                    debug!(model = %config.model, "dispatch aborted");
                } else {
                    warn!(model = %config.model, error = %err, "dispatch failed");
                }
                observer.on_error(err);
            }
        }
        result
    }

    async fn run_once(
        &self,
        messages: Vec<Message>,
        config: &LLMConfig,
        handle: &AbortHandle,
    ) -> Result<String, DispatchError> {
        let response = tokio::select! {
            biased;
            _ = handle.aborted() => return Err(DispatchError::Aborted),
            response = self.provider.chat(messages, config) => response?,
        };
        Ok(response.content.unwrap_or_default())
    }

    async fn run_stream<O>(
        &self,
        messages: Vec<Message>,
        config: &LLMConfig,
        handle: &AbortHandle,
        observer: &mut O,
    ) -> Result<String, DispatchError>
    where
        O: ChatObserver + ?Sized,
    {
        let mut stream = tokio::select! {
            biased;
            _ = handle.aborted() => return Err(DispatchError::Aborted),
            stream = self.provider.chat_stream(messages, config) => stream?,
        };

        let mut text = String::new();
        loop {
            let event = tokio::select! {
                biased;
                _ = handle.aborted() => return Err(DispatchError::Aborted),
                event = stream.next() => event,
            };

            match event {
                Some(Ok(LLMStreamEvent::TextDelta(delta))) => {
                    text.push_str(&delta);
                    observer.on_update(&text);
                }
                Some(Ok(LLMStreamEvent::Completed(response))) => {
                    if text.is_empty() {
                        text = response.content.unwrap_or_default();
                    }
                    break;
                }
                Some(Err(err)) => return Err(err.into()),
                None => break,
            }
        }

        if handle.is_aborted() {
            return Err(DispatchError::Aborted);
        }
        Ok(text)
    }
}
