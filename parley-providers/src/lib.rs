//! Model backend integrations for parley
//!
//! The rest of the workspace talks to models only through [`LLMProvider`];
//! [`OpenAiCompatClient`] covers OpenAI and the many gateways that mimic it.

pub mod base;
pub mod openai;

pub use base::{
    LLMConfig, LLMModel, LLMProvider, LLMResponse, LLMStreamEvent, LLMUsage, Message,
    ProviderError, ProviderEventStream, ProviderResult,
};
pub use openai::OpenAiCompatClient;
