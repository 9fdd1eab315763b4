//! Change notifications emitted by the session store

use serde::{Deserialize, Serialize};

/// What changed in the store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StoreEvent {
    /// Sessions were added, removed, reordered or replaced
    SessionsChanged,
    /// A different session is now current
    SelectionChanged { index: usize },
    /// Session-level fields (topic, digest, indices, message list) changed
    SessionUpdated { session_id: String },
    /// One message changed in place, e.g. a streaming update
    MessageUpdated {
        session_id: String,
        message_id: String,
    },
}
