//! Per-session generation parameters and memory-management knobs

use serde::{Deserialize, Serialize};

/// Resolved generation settings for one session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default)]
    pub provider_name: Option<String>,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_top_p")]
    pub top_p: f32,
    /// Context token ceiling for the window builder
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,
    #[serde(default)]
    pub presence_penalty: f32,
    #[serde(default)]
    pub frequency_penalty: f32,
    /// Whether the memory digest may be sent and maintained
    #[serde(default = "default_send_memory")]
    pub send_memory: bool,
    /// Short-term window size in messages
    #[serde(default = "default_history_message_count")]
    pub history_message_count: usize,
    /// Estimated token count of unsummarized history that triggers compaction
    #[serde(default = "default_compress_threshold")]
    pub compress_message_length_threshold: usize,
    #[serde(default = "default_inject_system_prompts")]
    pub enable_inject_system_prompts: bool,
    /// Input template; `{{input}}` is replaced by the user's text
    #[serde(default = "default_template")]
    pub template: String,
}

fn default_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_temperature() -> f32 {
    0.5
}

fn default_top_p() -> f32 {
    1.0
}

fn default_max_tokens() -> usize {
    4000
}

fn default_send_memory() -> bool {
    true
}

fn default_history_message_count() -> usize {
    4
}

fn default_compress_threshold() -> usize {
    1000
}

fn default_inject_system_prompts() -> bool {
    true
}

fn default_template() -> String {
    crate::template::DEFAULT_INPUT_TEMPLATE.to_string()
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            model: default_model(),
            provider_name: None,
            temperature: default_temperature(),
            top_p: default_top_p(),
            max_tokens: default_max_tokens(),
            presence_penalty: 0.0,
            frequency_penalty: 0.0,
            send_memory: default_send_memory(),
            history_message_count: default_history_message_count(),
            compress_message_length_threshold: default_compress_threshold(),
            enable_inject_system_prompts: default_inject_system_prompts(),
            template: default_template(),
        }
    }
}

impl ModelConfig {
    /// Overlay a mask's settings on top of these defaults; set fields in the patch win.
    pub fn merged_with(&self, patch: &ModelConfigPatch) -> ModelConfig {
        let mut merged = self.clone();
        if let Some(model) = &patch.model {
            merged.model = model.clone();
        }
        if let Some(provider_name) = &patch.provider_name {
            merged.provider_name = Some(provider_name.clone());
        }
        if let Some(v) = patch.temperature {
            merged.temperature = v;
        }
        if let Some(v) = patch.top_p {
            merged.top_p = v;
        }
        if let Some(v) = patch.max_tokens {
            merged.max_tokens = v;
        }
        if let Some(v) = patch.presence_penalty {
            merged.presence_penalty = v;
        }
        if let Some(v) = patch.frequency_penalty {
            merged.frequency_penalty = v;
        }
        if let Some(v) = patch.send_memory {
            merged.send_memory = v;
        }
        if let Some(v) = patch.history_message_count {
            merged.history_message_count = v;
        }
        if let Some(v) = patch.compress_message_length_threshold {
            merged.compress_message_length_threshold = v;
        }
        if let Some(v) = patch.enable_inject_system_prompts {
            merged.enable_inject_system_prompts = v;
        }
        if let Some(template) = &patch.template {
            merged.template = template.clone();
        }
        merged
    }
}

/// Partial [`ModelConfig`] carried by a mask
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelConfigPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub presence_penalty: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frequency_penalty: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub send_memory: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub history_message_count: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compress_message_length_threshold: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enable_inject_system_prompts: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_patch_fields_win() {
        let defaults = ModelConfig::default();
        let patch = ModelConfigPatch {
            model: Some("gpt-4".to_string()),
            history_message_count: Some(10),
            send_memory: Some(false),
            ..Default::default()
        };

        let merged = defaults.merged_with(&patch);
        assert_eq!(merged.model, "gpt-4");
        assert_eq!(merged.history_message_count, 10);
        assert!(!merged.send_memory);
        assert_eq!(merged.max_tokens, defaults.max_tokens);
        assert_eq!(merged.template, defaults.template);
    }

    #[test]
    fn test_empty_patch_is_identity() {
        let defaults = ModelConfig::default();
        assert_eq!(defaults.merged_with(&ModelConfigPatch::default()), defaults);
    }

    #[test]
    fn test_missing_fields_deserialize_to_defaults() {
        let config: ModelConfig = serde_json::from_str(r#"{"model":"claude-3"}"#).unwrap();
        assert_eq!(config.model, "claude-3");
        assert_eq!(config.compress_message_length_threshold, 1000);
        assert!(config.enable_inject_system_prompts);
    }
}
