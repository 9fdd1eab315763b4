//! Conversation logic for parley
//!
//! This crate builds context windows, dispatches streaming requests and
//! compacts long histories into a rolling digest.

pub mod chat;
pub mod context;
pub mod dispatch;
pub mod summarizer;

pub use chat::{ChatService, TurnOutcome};
pub use context::ContextBuilder;
pub use dispatch::{ChatObserver, DispatchError, Dispatcher};
pub use summarizer::{trim_topic, CompactionPlan, Summarizer};
