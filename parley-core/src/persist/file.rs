//! JSON file persistence for the session store

use serde::Serialize;
use serde_json::Value;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use super::migration::{self, CURRENT_VERSION};
use crate::error::{Error, Result};
use crate::session::{ChatState, ModelConfig};

const STATE_FILE: &str = "chat.json";

#[derive(Serialize)]
struct PersistedRef<'a> {
    version: f64,
    state: &'a ChatState,
}

/// Loads and saves the full [`ChatState`] as one versioned JSON document
#[derive(Debug, Clone)]
pub struct FileStateStore {
    path: PathBuf,
    defaults: ModelConfig,
}

impl FileStateStore {
    /// Store state in `dir/chat.json`
    pub fn new<P: AsRef<Path>>(dir: P, defaults: ModelConfig) -> Self {
        Self {
            path: dir.as_ref().join(STATE_FILE),
            defaults,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load state, migrating older documents. A missing file yields a fresh state.
    pub fn load(&self) -> Result<ChatState> {
        if !self.path.exists() {
            debug!(path = %self.path.display(), "no saved state, starting fresh");
            return Ok(ChatState::new(&self.defaults));
        }

        let content = std::fs::read_to_string(&self.path)?;
        let document: Value = serde_json::from_str(&content)?;

        let version = document
            .get("version")
            .and_then(Value::as_f64)
            .unwrap_or(0.0);
        // documents without an envelope are the bare legacy state
        let raw_state = match document {
            Value::Object(mut object) if object.contains_key("state") => {
                object.remove("state").unwrap_or(Value::Null)
            }
            other => other,
        };

        let migrated = migration::migrate(raw_state, version, &self.defaults)?;
        let state: ChatState = serde_json::from_value(migrated)
            .map_err(|e| Error::Serialization(format!("invalid chat state: {}", e)))?;

        if version < CURRENT_VERSION {
            info!(from = version, to = CURRENT_VERSION, "migrated chat state");
        }
        Ok(state)
    }

    /// Write state atomically: temp file in the same directory, then rename
    pub fn save(&self, state: &ChatState) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let document = PersistedRef {
            version: CURRENT_VERSION,
            state,
        };
        let content = serde_json::to_string_pretty(&document)?;

        let tmp_path = self.path.with_extension("json.tmp");
        std::fs::write(&tmp_path, content)?;
        std::fs::rename(&tmp_path, &self.path)?;
        debug!(path = %self.path.display(), sessions = state.sessions.len(), "saved chat state");
        Ok(())
    }
}
