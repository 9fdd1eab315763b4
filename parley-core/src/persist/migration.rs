//! Versioned migration of persisted chat state.
//!
//! Each step is a pure transform over the raw JSON state, applied when the
//! stored version is below the step's version. Steps only add or normalize
//! fields; anything they do not recognize is carried through untouched.

use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::session::{new_id, ModelConfig, Session};

/// Version written by this build
pub const CURRENT_VERSION: f64 = 3.1;

type StepFn = fn(Value, &ModelConfig) -> Result<Value>;

/// One version-gated transform
pub struct MigrationStep {
    pub version: f64,
    pub name: &'static str,
    pub apply: StepFn,
}

/// All steps, oldest first
pub const STEPS: &[MigrationStep] = &[
    MigrationStep {
        version: 2.0,
        name: "rebuild-legacy-sessions",
        apply: rebuild_legacy_sessions,
    },
    MigrationStep {
        version: 3.0,
        name: "assign-missing-ids",
        apply: assign_missing_ids,
    },
    MigrationStep {
        version: 3.1,
        name: "seed-inject-system-prompts",
        apply: seed_inject_system_prompts,
    },
];

/// Bring a state stored at `from_version` up to [`CURRENT_VERSION`]
pub fn migrate(mut state: Value, from_version: f64, defaults: &ModelConfig) -> Result<Value> {
    if from_version > CURRENT_VERSION {
        warn!(
            from_version,
            current = CURRENT_VERSION,
            "state was written by a newer version, loading as-is"
        );
        return Ok(state);
    }

    for step in STEPS.iter().filter(|step| from_version < step.version) {
        debug!(step = step.name, "applying migration");
        state = (step.apply)(state, defaults)
            .map_err(|e| Error::Migration(format!("{}: {}", step.name, e)))?;
    }
    Ok(state)
}

fn sessions_mut(state: &mut Value) -> Result<&mut Vec<Value>> {
    let object = state
        .as_object_mut()
        .ok_or_else(|| Error::Migration("state is not an object".to_string()))?;
    let sessions = object
        .entry("sessions")
        .or_insert_with(|| Value::Array(Vec::new()));
    sessions
        .as_array_mut()
        .ok_or_else(|| Error::Migration("sessions is not an array".to_string()))
}

fn model_config_mut(session: &mut Map<String, Value>) -> Result<&mut Map<String, Value>> {
    session
        .entry("model_config")
        .or_insert_with(|| Value::Object(Map::new()))
        .as_object_mut()
        .ok_or_else(|| Error::Migration("model_config is not an object".to_string()))
}

/// `< 2`: rebuild every session on top of a fresh one, forcing the memory knobs
fn rebuild_legacy_sessions(mut state: Value, defaults: &ModelConfig) -> Result<Value> {
    for session in sessions_mut(&mut state)?.iter_mut() {
        let Value::Object(old) = session.take() else {
            return Err(Error::Migration("session is not an object".to_string()));
        };

        let Value::Object(mut rebuilt) = serde_json::to_value(Session::new(defaults.clone()))? else {
            return Err(Error::Internal("session did not serialize to an object".to_string()));
        };
        // drop the fresh id so legacy sessions are handled by the id step
        rebuilt.remove("id");

        let mut fresh_config = match rebuilt.remove("model_config") {
            Some(Value::Object(config)) => config,
            _ => Map::new(),
        };
        for (key, value) in old {
            if key == "model_config" {
                if let Value::Object(config) = value {
                    fresh_config.extend(config);
                }
            } else {
                rebuilt.insert(key, value);
            }
        }
        fresh_config.insert("send_memory".to_string(), Value::Bool(true));
        fresh_config.insert("history_message_count".to_string(), Value::from(4));
        fresh_config.insert(
            "compress_message_length_threshold".to_string(),
            Value::from(1000),
        );
        rebuilt.insert("model_config".to_string(), Value::Object(fresh_config));

        *session = Value::Object(rebuilt);
    }
    Ok(state)
}

/// `< 3`: give sessions and messages without an id a fresh one
fn assign_missing_ids(mut state: Value, _defaults: &ModelConfig) -> Result<Value> {
    fn ensure_id(object: &mut Map<String, Value>) {
        let missing = match object.get("id") {
            Some(Value::String(id)) => id.is_empty(),
            _ => true,
        };
        if missing {
            object.insert("id".to_string(), Value::String(new_id()));
        }
    }

    for session in sessions_mut(&mut state)?.iter_mut() {
        let Some(session) = session.as_object_mut() else {
            continue;
        };
        ensure_id(session);
        if let Some(Value::Array(messages)) = session.get_mut("messages") {
            for message in messages.iter_mut().filter_map(Value::as_object_mut) {
                ensure_id(message);
            }
        }
    }
    Ok(state)
}

/// `< 3.1`: seed `enable_inject_system_prompts` from the current defaults
fn seed_inject_system_prompts(mut state: Value, defaults: &ModelConfig) -> Result<Value> {
    for session in sessions_mut(&mut state)?.iter_mut() {
        let Some(session) = session.as_object_mut() else {
            continue;
        };
        let config = model_config_mut(session)?;
        config
            .entry("enable_inject_system_prompts")
            .or_insert(Value::Bool(defaults.enable_inject_system_prompts));
    }
    Ok(state)
}
