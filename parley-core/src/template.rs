//! `{{var}}` template substitution for user input and the injected system prompt

use chrono::{DateTime, Local};
use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use tracing::debug;

use crate::session::ModelConfig;

/// Placeholder for the user's input
pub const INPUT_VAR: &str = "{{input}}";

/// Template applied to user input when a session sets none
pub const DEFAULT_INPUT_TEMPLATE: &str = "{{input}}";

/// Template for the injected system prompt
pub const DEFAULT_SYSTEM_TEMPLATE: &str = "You are a helpful assistant served by {{ServiceProvider}}.
Knowledge cutoff: {{cutoff}}
Current model: {{model}}
Current time: {{time}}
Reply in the user's language (interface language: {{lang}}).";

const DEFAULT_SERVICE_PROVIDER: &str = "OpenAI";
const DEFAULT_CUTOFF: &str = "2021-09";

const KNOWLEDGE_CUTOFF: &[(&str, &str)] = &[
    ("gpt-4-turbo", "2023-12"),
    ("gpt-4-turbo-preview", "2023-12"),
    ("gpt-4-1106-preview", "2023-04"),
    ("gpt-4-0125-preview", "2023-12"),
    ("gpt-4-vision-preview", "2023-04"),
    ("gpt-4o", "2023-10"),
    ("gpt-4o-mini", "2023-10"),
    ("gemini-pro", "2023-12"),
];

static VAR_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{\{(\w+)\}\}").expect("template variable pattern is valid"));

/// Knowledge cutoff date for a model, falling back to a default
pub fn knowledge_cutoff(model: &str) -> &'static str {
    KNOWLEDGE_CUTOFF
        .iter()
        .find(|(name, _)| *name == model)
        .map(|(_, cutoff)| *cutoff)
        .unwrap_or(DEFAULT_CUTOFF)
}

/// Whether the injected system prompt applies to this model
pub fn supports_system_prompt(model: &str) -> bool {
    model.starts_with("gpt-")
}

/// Values available to a template
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateVars {
    pub service_provider: String,
    pub cutoff: String,
    pub model: String,
    pub time: String,
    pub lang: String,
    pub input: String,
}

impl TemplateVars {
    /// Variables for a session's model settings at time `now`
    pub fn new(config: &ModelConfig, lang: &str, now: DateTime<Local>, input: impl Into<String>) -> Self {
        Self {
            service_provider: config
                .provider_name
                .clone()
                .unwrap_or_else(|| DEFAULT_SERVICE_PROVIDER.to_string()),
            cutoff: knowledge_cutoff(&config.model).to_string(),
            model: config.model.clone(),
            time: now.format("%a %b %d %Y %H:%M:%S %z").to_string(),
            lang: lang.to_string(),
            input: input.into(),
        }
    }

    fn lookup(&self, name: &str) -> Option<&str> {
        match name {
            "ServiceProvider" => Some(&self.service_provider),
            "cutoff" => Some(&self.cutoff),
            "model" => Some(&self.model),
            "time" => Some(&self.time),
            "lang" => Some(&self.lang),
            "input" => Some(&self.input),
            _ => None,
        }
    }
}

/// Substitute `vars` into `template`.
///
/// The template is dropped when the input already starts with it, and
/// `{{input}}` is appended on a new line when the template lacks it.
/// Unknown placeholders are left in place.
pub fn render(template: &str, vars: &TemplateVars) -> String {
    let mut output = if vars.input.starts_with(template) {
        String::new()
    } else {
        template.to_string()
    };

    if !output.contains(INPUT_VAR) {
        output.push('\n');
        output.push_str(INPUT_VAR);
    }

    VAR_PATTERN
        .replace_all(&output, |caps: &Captures<'_>| match vars.lookup(&caps[1]) {
            Some(value) => {
                if value.is_empty() {
                    debug!(var = &caps[1], "empty template variable");
                }
                value.to_string()
            }
            None => {
                debug!(var = &caps[1], "skipping unsupported template variable");
                caps[0].to_string()
            }
        })
        .into_owned()
}

/// Render user input through the session's template
pub fn fill_template_with(input: &str, config: &ModelConfig, lang: &str, now: DateTime<Local>) -> String {
    render(&config.template, &TemplateVars::new(config, lang, now, input))
}

/// The injected system prompt for a session (system template, empty input)
pub fn system_prompt(config: &ModelConfig, lang: &str, now: DateTime<Local>) -> String {
    render(DEFAULT_SYSTEM_TEMPLATE, &TemplateVars::new(config, lang, now, ""))
}
