//! Session store: the ordered session list, the current selection, and the
//! mutation API every higher-level flow goes through.
//!
//! All state sits behind one lock, so concurrent mutators (a streaming turn
//! and a background summarization, say) are serialized. Mutator closures run
//! under that lock and must not call back into the store.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::broadcast;
use tracing::debug;

use super::events::StoreEvent;
use super::mask::Mask;
use super::message::ChatMessage;
use super::model_config::ModelConfig;
use super::store::Session;

const EVENT_CAPACITY: usize = 256;

/// Serializable store contents
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatState {
    pub sessions: Vec<Session>,
    #[serde(default)]
    pub current_session_index: usize,
    /// Backend tokens consumed across runs
    #[serde(default)]
    pub used_tokens: u64,
    /// Fields written by other versions, kept on round-trip
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl ChatState {
    /// One empty session, selected
    pub fn new(defaults: &ModelConfig) -> Self {
        Self {
            sessions: vec![Session::new(defaults.clone())],
            current_session_index: 0,
            used_tokens: 0,
            extra: serde_json::Map::new(),
        }
    }

    /// Restore the store invariants: at least one session, selection in range
    fn normalize(&mut self, defaults: &ModelConfig) {
        if self.sessions.is_empty() {
            self.sessions.push(Session::new(defaults.clone()));
        }
        self.current_session_index = self.current_session_index.min(self.sessions.len() - 1);
    }
}

/// Ticket for reverting the most recent deletion
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UndoToken(u64);

struct PendingUndo {
    token: UndoToken,
    snapshot: ChatState,
}

/// Owns every session; see the module docs for the locking discipline
pub struct SessionStore {
    state: Mutex<ChatState>,
    defaults: ModelConfig,
    pending_undo: Mutex<Option<PendingUndo>>,
    undo_seq: AtomicU64,
    events: broadcast::Sender<StoreEvent>,
}

impl SessionStore {
    /// Create a store holding one empty session
    pub fn new(defaults: ModelConfig) -> Self {
        let state = ChatState::new(&defaults);
        Self::from_state(state, defaults)
    }

    /// Create a store from persisted state
    pub fn from_state(mut state: ChatState, defaults: ModelConfig) -> Self {
        state.normalize(&defaults);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            state: Mutex::new(state),
            defaults,
            pending_undo: Mutex::new(None),
            undo_seq: AtomicU64::new(0),
            events,
        }
    }

    /// Receive change notifications
    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: StoreEvent) {
        // no subscribers is fine
        let _ = self.events.send(event);
    }

    /// Global model defaults new sessions start from
    pub fn defaults(&self) -> &ModelConfig {
        &self.defaults
    }

    /// Copy of the full state, for persistence
    pub fn snapshot(&self) -> ChatState {
        self.state.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.state.lock().sessions.len()
    }

    /// Never true: the store always holds at least one session
    pub fn is_empty(&self) -> bool {
        self.state.lock().sessions.is_empty()
    }

    pub fn sessions(&self) -> Vec<Session> {
        self.state.lock().sessions.clone()
    }

    /// Current selection, clamped into range
    pub fn current_index(&self) -> usize {
        let mut state = self.state.lock();
        Self::clamp_selection(&mut state)
    }

    fn clamp_selection(state: &mut ChatState) -> usize {
        let max = state.sessions.len().saturating_sub(1);
        if state.current_session_index > max {
            state.current_session_index = max;
        }
        state.current_session_index
    }

    /// The current session (a copy); clamps the selection first
    pub fn current_session(&self) -> Session {
        let mut state = self.state.lock();
        let index = Self::clamp_selection(&mut state);
        state.sessions[index].clone()
    }

    pub fn current_session_id(&self) -> String {
        let mut state = self.state.lock();
        let index = Self::clamp_selection(&mut state);
        state.sessions[index].id.clone()
    }

    /// Copy of the session with the given id
    pub fn session(&self, session_id: &str) -> Option<Session> {
        self.state
            .lock()
            .sessions
            .iter()
            .find(|s| s.id == session_id)
            .cloned()
    }

    /// Append a message to the current session
    pub fn add_message(&self, message: ChatMessage) {
        let session_id = self.update_current_session(|session| {
            session.push_message(message);
            session.id.clone()
        });
        debug!(session_id = %session_id, "message added");
    }

    /// Insert a fresh session at the front and select it.
    ///
    /// With a mask, the mask's model settings are laid over the global
    /// defaults and its context and name are copied in.
    pub fn new_session(&self, mask: Option<&Mask>) -> String {
        let session = match mask {
            Some(mask) => Session::from_mask(mask, &self.defaults),
            None => Session::new(self.defaults.clone()),
        };
        let id = session.id.clone();
        {
            let mut state = self.state.lock();
            state.sessions.insert(0, session);
            state.current_session_index = 0;
        }
        debug!(session_id = %id, "session created");
        self.emit(StoreEvent::SessionsChanged);
        self.emit(StoreEvent::SelectionChanged { index: 0 });
        id
    }

    /// Select a session; out-of-range indices are clamped
    pub fn select_session(&self, index: usize) {
        let selected = {
            let mut state = self.state.lock();
            state.current_session_index = index;
            Self::clamp_selection(&mut state)
        };
        self.emit(StoreEvent::SelectionChanged { index: selected });
    }

    /// Move the selection by `delta`, wrapping in either direction
    pub fn next_session(&self, delta: isize) {
        let selected = {
            let mut state = self.state.lock();
            let n = state.sessions.len() as isize;
            let current = Self::clamp_selection(&mut state) as isize;
            let next = (current + delta).rem_euclid(n) as usize;
            state.current_session_index = next;
            next
        };
        self.emit(StoreEvent::SelectionChanged { index: selected });
    }

    /// Reorder sessions, keeping the previously selected session selected.
    ///
    /// Returns false when either index is out of range.
    pub fn move_session(&self, from: usize, to: usize) -> bool {
        {
            let mut state = self.state.lock();
            let len = state.sessions.len();
            if from >= len || to >= len {
                return false;
            }

            let old_index = Self::clamp_selection(&mut state);
            let session = state.sessions.remove(from);
            state.sessions.insert(to, session);

            let mut new_index = if old_index == from { to } else { old_index };
            if old_index > from && old_index <= to {
                new_index -= 1;
            } else if old_index < from && old_index >= to {
                new_index += 1;
            }
            state.current_session_index = new_index;
        }
        self.emit(StoreEvent::SessionsChanged);
        true
    }

    /// Remove a session.
    ///
    /// Deleting the only session substitutes a fresh empty one. The prior
    /// state is kept until [`undo_delete`](Self::undo_delete),
    /// [`dismiss_undo`](Self::dismiss_undo), or the next deletion.
    pub fn delete_session(&self, index: usize) -> Option<UndoToken> {
        let token = UndoToken(self.undo_seq.fetch_add(1, Ordering::Relaxed) + 1);
        let selected = {
            let mut state = self.state.lock();
            if index >= state.sessions.len() {
                return None;
            }
            let snapshot = state.clone();
            let deleting_last = state.sessions.len() == 1;
            let current = Self::clamp_selection(&mut state);

            let removed = state.sessions.remove(index);
            debug!(session_id = %removed.id, index, "session deleted");

            let next = if deleting_last {
                state.sessions.push(Session::new(self.defaults.clone()));
                0
            } else {
                let shifted = if index <= current {
                    current.saturating_sub(1)
                } else {
                    current
                };
                shifted.min(state.sessions.len() - 1)
            };
            state.current_session_index = next;

            *self.pending_undo.lock() = Some(PendingUndo { token, snapshot });
            next
        };
        self.emit(StoreEvent::SessionsChanged);
        self.emit(StoreEvent::SelectionChanged { index: selected });
        Some(token)
    }

    /// Revert the deletion identified by `token`, if it is still the latest one
    pub fn undo_delete(&self, token: UndoToken) -> bool {
        let pending = {
            let mut pending = self.pending_undo.lock();
            match pending.as_ref() {
                Some(p) if p.token == token => pending.take(),
                _ => None,
            }
        };
        let Some(pending) = pending else {
            return false;
        };

        let selected = {
            let mut state = self.state.lock();
            *state = pending.snapshot;
            state.normalize(&self.defaults);
            state.current_session_index
        };
        debug!("session deletion reverted");
        self.emit(StoreEvent::SessionsChanged);
        self.emit(StoreEvent::SelectionChanged { index: selected });
        true
    }

    /// Forget the retained deletion snapshot
    pub fn dismiss_undo(&self) {
        self.pending_undo.lock().take();
    }

    /// Token of the deletion that can still be reverted
    pub fn pending_undo(&self) -> Option<UndoToken> {
        self.pending_undo.lock().as_ref().map(|p| p.token)
    }

    /// Mutate the current session in place
    pub fn update_current_session<R>(&self, f: impl FnOnce(&mut Session) -> R) -> R {
        let (result, session_id) = {
            let mut state = self.state.lock();
            let index = Self::clamp_selection(&mut state);
            let session = &mut state.sessions[index];
            (f(session), session.id.clone())
        };
        self.emit(StoreEvent::SessionUpdated { session_id });
        result
    }

    /// Mutate the session with the given id; `None` if it no longer exists
    pub fn update_session<R>(&self, session_id: &str, f: impl FnOnce(&mut Session) -> R) -> Option<R> {
        let result = {
            let mut state = self.state.lock();
            let session = state.sessions.iter_mut().find(|s| s.id == session_id)?;
            f(session)
        };
        self.emit(StoreEvent::SessionUpdated {
            session_id: session_id.to_string(),
        });
        Some(result)
    }

    /// Mutate a message by position. The mutator receives `None` when either
    /// index is out of range and must guard for it.
    pub fn update_message(
        &self,
        session_index: usize,
        message_index: usize,
        f: impl FnOnce(Option<&mut ChatMessage>),
    ) {
        let ids = {
            let mut state = self.state.lock();
            let message = state
                .sessions
                .get_mut(session_index)
                .and_then(|session| {
                    let session_id = session.id.clone();
                    session
                        .messages
                        .get_mut(message_index)
                        .map(|message| (session_id, message))
                });
            match message {
                Some((session_id, message)) => {
                    f(Some(&mut *message));
                    Some((session_id, message.id.clone()))
                }
                None => {
                    f(None);
                    None
                }
            }
        };
        if let Some((session_id, message_id)) = ids {
            self.emit(StoreEvent::MessageUpdated {
                session_id,
                message_id,
            });
        }
    }

    /// Mutate a message by id; returns false if the session or message is gone
    pub fn update_message_by_id(
        &self,
        session_id: &str,
        message_id: &str,
        f: impl FnOnce(&mut ChatMessage),
    ) -> bool {
        let found = {
            let mut state = self.state.lock();
            match state
                .sessions
                .iter_mut()
                .find(|s| s.id == session_id)
                .and_then(|s| s.message_mut(message_id))
            {
                Some(message) => {
                    f(message);
                    true
                }
                None => false,
            }
        };
        if found {
            self.emit(StoreEvent::MessageUpdated {
                session_id: session_id.to_string(),
                message_id: message_id.to_string(),
            });
        }
        found
    }

    /// Clear messages and digest of the current session
    pub fn reset_session(&self) {
        self.update_current_session(Session::reset);
    }

    /// Replace everything with one empty session
    pub fn clear_sessions(&self) {
        {
            let mut state = self.state.lock();
            let used_tokens = state.used_tokens;
            *state = ChatState::new(&self.defaults);
            state.used_tokens = used_tokens;
        }
        self.pending_undo.lock().take();
        self.emit(StoreEvent::SessionsChanged);
        self.emit(StoreEvent::SelectionChanged { index: 0 });
    }

    /// Toggle the context floor of the current session at its end.
    ///
    /// Returns the new floor, or `None` when it was unset.
    pub fn clear_context(&self) -> Option<usize> {
        self.update_current_session(|session| {
            let end = session.messages.len();
            session.clear_context_index = if session.clear_context_index == Some(end) {
                None
            } else {
                Some(end)
            };
            session.clear_context_index
        })
    }
}
