//! Core types for parley
//!
//! This crate owns the conversation data model and everything that mutates
//! it: the session store, the cancellation registry, token estimation,
//! template substitution, persistence with versioned migration, and the
//! shared configuration and logging setup used by the other crates.

pub mod config;
pub mod error;
pub mod logging;
pub mod persist;
pub mod registry;
pub mod session;
pub mod template;
pub mod token;
pub mod utils;

pub use error::{Error, Result};
pub use persist::FileStateStore;
pub use registry::{AbortHandle, ControllerRegistry};
pub use session::{
    ChatMessage, ChatStat, ChatState, Mask, MessageContent, ModelConfig, ModelConfigPatch, Role,
    Session, SessionStore, StoreEvent, UndoToken,
};
pub use token::{estimate_token_length, HeuristicEstimator, TokenEstimator};
