//! Cancellation registry for in-flight generation requests.
//!
//! Handles are keyed by `(session_id, message_id)`. The registry only tracks
//! and exposes them; aborting is up to whoever looks a handle up.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

static NEXT_HANDLE_ID: AtomicU64 = AtomicU64::new(1);

/// Abortable token for one in-flight request.
///
/// Clones share the same underlying token and compare equal.
#[derive(Debug, Clone)]
pub struct AbortHandle {
    id: u64,
    token: CancellationToken,
}

impl AbortHandle {
    pub fn new() -> Self {
        Self {
            id: NEXT_HANDLE_ID.fetch_add(1, Ordering::Relaxed),
            token: CancellationToken::new(),
        }
    }

    /// Identity of this handle; distinct for every [`AbortHandle::new`]
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn abort(&self) {
        self.token.cancel();
    }

    pub fn is_aborted(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once [`abort`](Self::abort) has been called
    pub async fn aborted(&self) {
        self.token.cancelled().await
    }
}

impl Default for AbortHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl PartialEq for AbortHandle {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for AbortHandle {}

/// Registry key: `(session_id, message_id)`
pub type ControllerKey = (String, String);

/// Tracks one live handle per `(session, message)` slot
#[derive(Debug, Clone, Default)]
pub struct ControllerRegistry {
    controllers: Arc<Mutex<HashMap<ControllerKey, AbortHandle>>>,
}

impl ControllerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(session_id: &str, message_id: &str) -> ControllerKey {
        (session_id.to_string(), message_id.to_string())
    }

    /// Register a handle; an existing entry for the same key is replaced
    pub fn add_controller(&self, session_id: &str, message_id: &str, handle: AbortHandle) {
        let previous = self
            .controllers
            .lock()
            .insert(Self::key(session_id, message_id), handle);
        if previous.is_some() {
            debug!(session_id, message_id, "replaced controller");
        }
    }

    pub fn get(&self, session_id: &str, message_id: &str) -> Option<AbortHandle> {
        self.controllers
            .lock()
            .get(&Self::key(session_id, message_id))
            .cloned()
    }

    /// Remove the entry for a key; absent keys are ignored
    pub fn remove(&self, session_id: &str, message_id: &str) {
        self.controllers
            .lock()
            .remove(&Self::key(session_id, message_id));
    }

    /// Remove the entry only if it still holds `handle`.
    ///
    /// A request finishing late must not evict the handle of a newer request
    /// registered under the same key.
    pub fn remove_if_current(&self, session_id: &str, message_id: &str, handle: &AbortHandle) -> bool {
        let mut controllers = self.controllers.lock();
        let key = Self::key(session_id, message_id);
        if controllers.get(&key) == Some(handle) {
            controllers.remove(&key);
            true
        } else {
            false
        }
    }

    /// Abort one request; returns false if nothing is registered for the key
    pub fn stop(&self, session_id: &str, message_id: &str) -> bool {
        match self.get(session_id, message_id) {
            Some(handle) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    /// Abort every registered request
    pub fn stop_all(&self) {
        let handles: Vec<AbortHandle> = self.controllers.lock().values().cloned().collect();
        debug!(count = handles.len(), "stopping all controllers");
        for handle in handles {
            handle.abort();
        }
    }

    /// Whether any request is registered for the session
    pub fn has_pending(&self, session_id: &str) -> bool {
        self.controllers
            .lock()
            .keys()
            .any(|(sid, _)| sid == session_id)
    }

    pub fn len(&self) -> usize {
        self.controllers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.controllers.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_last_write_wins() {
        let registry = ControllerRegistry::new();
        let h1 = AbortHandle::new();
        let h2 = AbortHandle::new();

        registry.add_controller("s", "m", h1.clone());
        registry.add_controller("s", "m", h2.clone());

        assert_eq!(registry.get("s", "m"), Some(h2));
        assert_ne!(registry.get("s", "m"), Some(h1));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_remove_is_idempotent() {
        let registry = ControllerRegistry::new();
        registry.add_controller("s", "m", AbortHandle::new());
        registry.remove("s", "m");
        registry.remove("s", "m");
        assert!(registry.get("s", "m").is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_remove_if_current_spares_newer_handle() {
        let registry = ControllerRegistry::new();
        let old = AbortHandle::new();
        let new = AbortHandle::new();
        registry.add_controller("s", "m", old.clone());
        registry.add_controller("s", "m", new.clone());

        assert!(!registry.remove_if_current("s", "m", &old));
        assert_eq!(registry.get("s", "m"), Some(new.clone()));
        assert!(registry.remove_if_current("s", "m", &new));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_stop_aborts_without_removing() {
        let registry = ControllerRegistry::new();
        let handle = AbortHandle::new();
        registry.add_controller("s", "m", handle.clone());

        assert!(registry.stop("s", "m"));
        assert!(handle.is_aborted());
        assert!(registry.get("s", "m").is_some());
        assert!(!registry.stop("s", "other"));
    }

    #[test]
    fn test_stop_all_and_pending() {
        let registry = ControllerRegistry::new();
        let a = AbortHandle::new();
        let b = AbortHandle::new();
        registry.add_controller("s1", "m1", a.clone());
        registry.add_controller("s2", "m2", b.clone());

        assert!(registry.has_pending("s1"));
        assert!(!registry.has_pending("s3"));

        registry.stop_all();
        assert!(a.is_aborted());
        assert!(b.is_aborted());
    }

    #[tokio::test]
    async fn test_aborted_future_resolves() {
        let handle = AbortHandle::new();
        let waiter = handle.clone();
        let task = tokio::spawn(async move { waiter.aborted().await });
        handle.abort();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_concurrent_insert_and_remove() {
        let registry = ControllerRegistry::new();
        let mut tasks = Vec::new();
        for i in 0..32 {
            let registry = registry.clone();
            tasks.push(tokio::spawn(async move {
                let message_id = format!("m{}", i % 4);
                registry.add_controller("s", &message_id, AbortHandle::new());
                registry.remove("s", &message_id);
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        assert!(registry.len() <= 4);
    }
}
