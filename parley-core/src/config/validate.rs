//! Configuration validation rules.

use super::schema::Config;
use crate::session::ModelConfig;

/// Validate configuration and return aggregated validation errors.
pub fn validate_config(config: &Config) -> crate::Result<()> {
    let mut errors = Vec::new();

    collect_model_errors("model", &config.model, &mut errors);

    for mask in &config.masks {
        if mask.name.trim().is_empty() {
            errors.push("masks[].name must not be empty".to_string());
            continue;
        }
        let resolved = config.model.merged_with(&mask.model_config);
        collect_model_errors(
            &format!("masks.{}.model_config", mask.name),
            &resolved,
            &mut errors,
        );
    }

    if config.app.summarize_model.trim().is_empty() {
        errors.push("app.summarize_model must not be empty".to_string());
    }
    if config.provider.api_base.trim().is_empty() {
        errors.push("provider.api_base must not be empty".to_string());
    }
    if config.storage.dir.trim().is_empty() {
        errors.push("storage.dir must not be empty".to_string());
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(crate::Error::Validation(errors.join("; ")))
    }
}

fn collect_model_errors(prefix: &str, model: &ModelConfig, errors: &mut Vec<String>) {
    if model.model.trim().is_empty() {
        errors.push(format!("{prefix}.model must not be empty"));
    }
    if model.max_tokens == 0 {
        errors.push(format!("{prefix}.max_tokens must be > 0"));
    }
    if !(0.0..=2.0).contains(&model.temperature) {
        errors.push(format!("{prefix}.temperature must be in [0.0, 2.0]"));
    }
    if !(0.0..=1.0).contains(&model.top_p) {
        errors.push(format!("{prefix}.top_p must be in [0.0, 1.0]"));
    }
    if model.history_message_count == 0 {
        errors.push(format!("{prefix}.history_message_count must be > 0"));
    }
    if model.compress_message_length_threshold == 0 {
        errors.push(format!("{prefix}.compress_message_length_threshold must be > 0"));
    }
}
