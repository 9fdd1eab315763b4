//! Context window assembly

use chrono::{DateTime, Local};
use parley_core::template::{supports_system_prompt, system_prompt};
use parley_core::{ChatMessage, HeuristicEstimator, Role, Session, TokenEstimator};
use parley_providers::Message;
use std::sync::Arc;
use tracing::debug;

/// Fixed id of the injected system prompt message
pub const SYSTEM_PROMPT_ID: &str = "system-prompt";

/// Builds the exact ordered message list sent to the model for one turn
#[derive(Clone)]
pub struct ContextBuilder {
    estimator: Arc<dyn TokenEstimator>,
    lang: String,
}

impl ContextBuilder {
    /// Create a builder using the heuristic token estimator
    pub fn new(lang: impl Into<String>) -> Self {
        Self::with_estimator(lang, Arc::new(HeuristicEstimator))
    }

    pub fn with_estimator(lang: impl Into<String>, estimator: Arc<dyn TokenEstimator>) -> Self {
        Self {
            estimator,
            lang: lang.into(),
        }
    }

    pub fn estimator(&self) -> &Arc<dyn TokenEstimator> {
        &self.estimator
    }

    pub fn lang(&self) -> &str {
        &self.lang
    }

    /// Assemble the window for `session` as of `now`.
    ///
    /// Order: injected system prompt, memory digest, static context, then the
    /// most recent messages that fit the token budget. Error messages are
    /// never included. Same session and `now` give the same output.
    pub fn build(&self, session: &Session, now: DateTime<Local>) -> Vec<ChatMessage> {
        let config = &session.model_config;
        let clear_context_index = session.clear_context_floor();
        let total = session.messages.len();
        let mut window = Vec::new();

        if config.enable_inject_system_prompts && supports_system_prompt(&config.model) {
            let prompt = system_prompt(config, &self.lang, now);
            debug!(model = %config.model, "injecting system prompt");
            window.push(ChatMessage::synthetic(SYSTEM_PROMPT_ID, Role::System, prompt));
        }

        let send_long_term_memory = config.send_memory
            && !session.memory_prompt.is_empty()
            && session.last_summarize_index > clear_context_index;
        if send_long_term_memory {
            window.extend(session.memory_prompt_message());
        }

        window.extend(session.context.iter().cloned());

        let short_term_start = total.saturating_sub(config.history_message_count);
        let memory_start = if send_long_term_memory {
            session.last_summarize_index.min(short_term_start)
        } else {
            short_term_start
        };
        let start = clear_context_index.max(memory_start).min(total);

        let mut recent = Vec::new();
        let mut token_count = 0;
        for message in session.messages[start..].iter().rev() {
            if token_count >= config.max_tokens {
                break;
            }
            if message.is_error {
                continue;
            }
            token_count += self.estimator.estimate(&message.text());
            recent.push(message.clone());
        }
        recent.reverse();

        debug!(
            session_id = %session.id,
            start,
            recent = recent.len(),
            token_count,
            "built context window"
        );
        window.extend(recent);
        window
    }

    /// Convert a window to wire messages
    pub fn to_wire(messages: &[ChatMessage]) -> Vec<Message> {
        messages.iter().map(Message::from).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use parley_core::session::{MEMORY_PROMPT_ID, MEMORY_PROMPT_PREFIX};
    use parley_core::ModelConfig;

    fn now() -> DateTime<Local> {
        Local.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).earliest().unwrap()
    }

    fn plain_config() -> ModelConfig {
        ModelConfig {
            model: "test-model".to_string(),
            send_memory: false,
            ..Default::default()
        }
    }

    fn session_with(count: usize, config: ModelConfig) -> Session {
        let mut session = Session::new(config);
        for i in 0..count {
            let message = if i % 2 == 0 {
                ChatMessage::user(format!("question {i}"))
            } else {
                ChatMessage::assistant(format!("answer {i}"))
            };
            session.push_message(message);
        }
        session
    }

    fn texts(window: &[ChatMessage]) -> Vec<String> {
        window.iter().map(ChatMessage::text).collect()
    }

    #[test]
    fn test_last_n_messages_in_order() {
        let session = session_with(10, plain_config());
        let window = ContextBuilder::new("en").build(&session, now());
        assert_eq!(
            texts(&window),
            vec!["question 6", "answer 7", "question 8", "answer 9"]
        );
    }

    #[test]
    fn test_build_is_deterministic() {
        let mut config = ModelConfig {
            model: "gpt-4o".to_string(),
            ..Default::default()
        };
        config.send_memory = true;
        let mut session = session_with(6, config);
        session.memory_prompt = "earlier we discussed lifetimes".to_string();
        session.last_summarize_index = 2;

        let builder = ContextBuilder::new("en");
        assert_eq!(builder.build(&session, now()), builder.build(&session, now()));
    }

    #[test]
    fn test_error_messages_never_included() {
        let mut session = session_with(6, plain_config());
        session.messages[4].is_error = true;
        session.messages[5].is_error = true;

        for max_tokens in [1, 5, 4000] {
            session.model_config.max_tokens = max_tokens;
            let window = ContextBuilder::new("en").build(&session, now());
            assert!(window.iter().all(|m| !m.is_error));
        }
    }

    #[test]
    fn test_memory_gated_by_send_memory() {
        let mut session = session_with(8, plain_config());
        session.memory_prompt = "digest".to_string();
        session.last_summarize_index = 6;

        let builder = ContextBuilder::new("en");
        let window = builder.build(&session, now());
        assert!(window.iter().all(|m| m.id != MEMORY_PROMPT_ID));

        session.model_config.send_memory = true;
        let window = builder.build(&session, now());
        assert_eq!(window[0].id, MEMORY_PROMPT_ID);
        assert_eq!(window[0].text(), format!("{}digest", MEMORY_PROMPT_PREFIX));
    }

    #[test]
    fn test_memory_requires_summary_above_clear_floor() {
        let mut config = plain_config();
        config.send_memory = true;
        let mut session = session_with(8, config);
        session.memory_prompt = "digest".to_string();
        session.last_summarize_index = 3;
        session.clear_context_index = Some(3);

        let window = ContextBuilder::new("en").build(&session, now());
        assert!(window.iter().all(|m| m.id != MEMORY_PROMPT_ID));
    }

    #[test]
    fn test_long_term_memory_extends_window_back_to_summary_index() {
        let mut config = plain_config();
        config.send_memory = true;
        let mut session = session_with(10, config);
        session.memory_prompt = "digest".to_string();
        session.last_summarize_index = 4;

        let window = ContextBuilder::new("en").build(&session, now());
        // memory message + messages 4..10
        assert_eq!(window.len(), 7);
        assert_eq!(window[1].text(), "question 4");
    }

    #[test]
    fn test_clear_context_floor_is_respected() {
        let mut config = plain_config();
        config.history_message_count = 10;
        let mut session = session_with(10, config);
        session.clear_context_index = Some(7);

        let window = ContextBuilder::new("en").build(&session, now());
        assert_eq!(texts(&window), vec!["answer 7", "question 8", "answer 9"]);
    }

    #[test]
    fn test_token_budget_admits_one_boundary_message() {
        let mut config = plain_config();
        config.history_message_count = 100;
        let mut session = Session::new(config);
        for _ in 0..10 {
            // 8 letters -> 2 tokens each
            session.push_message(ChatMessage::user("abcdefgh"));
        }
        session.model_config.max_tokens = 5;

        let window = ContextBuilder::new("en").build(&session, now());
        // 2 + 2 = 4 < 5, the third message pushes it to 6 and stops the walk
        assert_eq!(window.len(), 3);
    }

    #[test]
    fn test_final_order() {
        let config = ModelConfig {
            model: "gpt-4o".to_string(),
            send_memory: true,
            ..Default::default()
        };
        let mut session = session_with(6, config);
        session.context = vec![ChatMessage::system("You translate to French.")];
        session.memory_prompt = "digest".to_string();
        session.last_summarize_index = 2;

        let window = ContextBuilder::new("en").build(&session, now());
        assert_eq!(window[0].id, SYSTEM_PROMPT_ID);
        assert_eq!(window[1].id, MEMORY_PROMPT_ID);
        assert_eq!(window[2].text(), "You translate to French.");
        assert_eq!(window[3].text(), "question 2");
        assert_eq!(window.last().unwrap().text(), "answer 5");
    }

    #[test]
    fn test_system_prompt_only_for_supported_models() {
        let mut session = session_with(2, plain_config());
        session.model_config.model = "claude-3".to_string();
        let window = ContextBuilder::new("en").build(&session, now());
        assert!(window.iter().all(|m| m.id != SYSTEM_PROMPT_ID));

        session.model_config.model = "gpt-4o".to_string();
        session.model_config.enable_inject_system_prompts = false;
        let window = ContextBuilder::new("en").build(&session, now());
        assert!(window.iter().all(|m| m.id != SYSTEM_PROMPT_ID));
    }

    #[test]
    fn test_static_context_ignores_budget() {
        let mut session = session_with(4, plain_config());
        session.context = vec![ChatMessage::system("a long static instruction block")];
        session.model_config.max_tokens = 0;

        let window = ContextBuilder::new("en").build(&session, now());
        assert_eq!(window.len(), 1);
        assert_eq!(window[0].text(), "a long static instruction block");
    }
}
