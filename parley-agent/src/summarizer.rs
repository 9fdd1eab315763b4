//! Background compaction: topic titles and the rolling memory digest.
//!
//! Both flows are best-effort. Failures are logged and never touch the chat
//! turn that triggered them; all writes go through the session id so a
//! session moved or deleted in the meantime is handled correctly.

use parley_core::config::AppConfig;
use parley_core::session::{count_messages, DEFAULT_TOPIC};
use parley_core::{
    AbortHandle, ChatMessage, ControllerRegistry, Role, Session, SessionStore, TokenEstimator,
};
use parking_lot::Mutex;
use parley_providers::LLMConfig;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::context::ContextBuilder;
use crate::dispatch::{ChatObserver, DispatchError, Dispatcher};

/// Instruction appended to the history when asking for a title
pub const TOPIC_PROMPT: &str = "Please generate a four to five word title summarizing our \
conversation without any lead-in, punctuation, quotation marks, periods, symbols, bold text, \
or additional text. Remove enclosing quotation marks.";

/// Instruction appended to the candidates when asking for a digest
pub const SUMMARIZE_PROMPT: &str = "Summarize the discussion briefly in 200 words or less \
to use as a prompt for future context.";

/// Estimated history size below which no title is requested
pub const SUMMARIZE_MIN_TOKENS: usize = 50;

/// Summarize model used for gemini sessions
pub const GEMINI_SUMMARIZE_MODEL: &str = "gemini-pro";

/// Registry slots for background requests, next to the per-message slots
pub const TOPIC_SLOT: &str = "topic";
pub const SUMMARIZE_SLOT: &str = "summarize";

const TOPIC_PROMPT_ID: &str = "topic-prompt";
const SUMMARIZE_PROMPT_ID: &str = "summarize-prompt";

/// Strip enclosing quotes/asterisks and trailing punctuation from a model-written title
pub fn trim_topic(topic: &str) -> String {
    let quotes = |c: char| matches!(c, '"' | '“' | '”' | '*');
    let trailing =
        |c: char| matches!(c, '，' | '。' | '！' | '？' | '”' | '“' | '"' | '、' | ',' | '.' | '!' | '?' | '*');

    topic
        .trim()
        .trim_matches(quotes)
        .trim_end_matches(trailing)
        .trim()
        .to_string()
}

/// Messages to fold into the digest, and their estimated size before truncation
#[derive(Debug, Clone, PartialEq)]
pub struct CompactionPlan {
    pub messages: Vec<ChatMessage>,
    pub history_tokens: usize,
    /// `last_summarize_index` to commit on success
    pub summarize_index: usize,
}

impl CompactionPlan {
    /// Pick the candidates from a session snapshot
    pub fn for_session(session: &Session, estimator: &dyn TokenEstimator) -> Self {
        let config = &session.model_config;
        let floor = session
            .last_summarize_index
            .max(session.clear_context_floor())
            .min(session.messages.len());

        let mut messages: Vec<ChatMessage> = session.messages[floor..]
            .iter()
            .filter(|m| !m.is_error)
            .cloned()
            .collect();
        let history_tokens = count_messages(&messages, estimator);

        if history_tokens > config.max_tokens {
            let keep_from = messages.len().saturating_sub(config.history_message_count);
            messages.drain(..keep_from);
        }

        if let Some(memory) = session.memory_prompt_message() {
            messages.insert(0, memory);
        }

        Self {
            messages,
            history_tokens,
            summarize_index: session.messages.len(),
        }
    }

    /// Whether the candidates are large enough to compact
    pub fn should_compact(&self, session: &Session) -> bool {
        session.model_config.send_memory
            && self.history_tokens > session.model_config.compress_message_length_threshold
    }
}

/// Holds a registry slot for the lifetime of one background request
struct Slot<'a> {
    registry: &'a ControllerRegistry,
    session_id: &'a str,
    key: &'static str,
    handle: Option<AbortHandle>,
}

impl<'a> Slot<'a> {
    fn new(registry: &'a ControllerRegistry, session_id: &'a str, key: &'static str) -> Self {
        Self {
            registry,
            session_id,
            key,
            handle: None,
        }
    }

    fn register(&mut self, handle: AbortHandle) {
        self.registry
            .add_controller(self.session_id, self.key, handle.clone());
        self.handle = Some(handle);
    }

    fn release(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.registry
                .remove_if_current(self.session_id, self.key, &handle);
        }
    }
}

struct TopicObserver<'a> {
    store: &'a SessionStore,
    slot: Slot<'a>,
}

impl ChatObserver for TopicObserver<'_> {
    fn on_controller(&mut self, handle: AbortHandle) {
        self.slot.register(handle);
    }

    fn on_finish(&mut self, text: &str) {
        self.slot.release();
        let topic = if text.is_empty() {
            DEFAULT_TOPIC.to_string()
        } else {
            trim_topic(text)
        };
        let updated = self.store.update_session(self.slot.session_id, |session| {
            // a title set while the request was running wins
            if session.has_default_topic() {
                session.topic = topic.clone();
            }
        });
        if updated.is_some() {
            info!(session_id = self.slot.session_id, topic = %topic, "derived session topic");
        }
    }

    fn on_error(&mut self, error: &DispatchError) {
        self.slot.release();
        warn!(session_id = self.slot.session_id, error = %error, "topic derivation failed");
    }
}

struct MemoryObserver<'a> {
    store: &'a SessionStore,
    slot: Slot<'a>,
    previous_digest: String,
    summarize_index: usize,
    /// Last partial digest this request streamed into the session
    last_written: Option<String>,
}

impl MemoryObserver<'_> {
    /// Undo this request's partial digest, unless something replaced it since
    fn restore_digest(&self) {
        let Some(written) = self.last_written.as_deref() else {
            return;
        };
        let previous = &self.previous_digest;
        self.store.update_session(self.slot.session_id, |session| {
            if session.memory_prompt == written {
                session.memory_prompt = previous.clone();
            }
        });
    }
}

impl ChatObserver for MemoryObserver<'_> {
    fn on_controller(&mut self, handle: AbortHandle) {
        self.slot.register(handle);
    }

    fn on_update(&mut self, text: &str) {
        self.store.update_session(self.slot.session_id, |session| {
            session.memory_prompt = text.to_string();
        });
        self.last_written = Some(text.to_string());
    }

    fn on_finish(&mut self, text: &str) {
        self.slot.release();
        if text.trim().is_empty() {
            warn!(session_id = self.slot.session_id, "empty summary, keeping previous digest");
            self.restore_digest();
            return;
        }
        let summarize_index = self.summarize_index;
        let committed = self.store.update_session(self.slot.session_id, |session| {
            session.last_summarize_index = summarize_index;
            session.memory_prompt = text.to_string();
        });
        if committed.is_some() {
            info!(
                session_id = self.slot.session_id,
                summarize_index, "memory digest updated"
            );
        }
    }

    fn on_error(&mut self, error: &DispatchError) {
        self.slot.release();
        self.restore_digest();
        if error.is_abort() {
            debug!(session_id = self.slot.session_id, "summarization aborted");
        } else {
            warn!(session_id = self.slot.session_id, error = %error, "summarization failed");
        }
    }
}

/// Marks a session as compacting until dropped
struct CompactionClaim<'a> {
    compacting: &'a Mutex<HashSet<String>>,
    session_id: String,
}

impl Drop for CompactionClaim<'_> {
    fn drop(&mut self) {
        self.compacting.lock().remove(&self.session_id);
    }
}

/// Runs topic derivation and memory compaction for a session
pub struct Summarizer {
    store: Arc<SessionStore>,
    registry: ControllerRegistry,
    dispatcher: Dispatcher,
    estimator: Arc<dyn TokenEstimator>,
    app: AppConfig,
    compacting: Mutex<HashSet<String>>,
}

impl Summarizer {
    pub fn new(
        store: Arc<SessionStore>,
        registry: ControllerRegistry,
        dispatcher: Dispatcher,
        context: &ContextBuilder,
        app: AppConfig,
    ) -> Self {
        Self {
            store,
            registry,
            dispatcher,
            estimator: Arc::clone(context.estimator()),
            app,
            compacting: Mutex::new(HashSet::new()),
        }
    }

    /// At most one compaction per session: a second one would start from the
    /// first one's partial digest
    fn claim_compaction(&self, session_id: &str) -> Option<CompactionClaim<'_>> {
        if !self.compacting.lock().insert(session_id.to_string()) {
            return None;
        }
        Some(CompactionClaim {
            compacting: &self.compacting,
            session_id: session_id.to_string(),
        })
    }

    /// Model to summarize a session running `current_model` with
    pub async fn summarize_model(&self, current_model: &str) -> String {
        if current_model.starts_with("gpt") {
            match self.dispatcher.provider().models().await {
                Ok(models) => {
                    let listed = models
                        .iter()
                        .any(|m| m.name == self.app.summarize_model && m.available);
                    if listed {
                        return self.app.summarize_model.clone();
                    }
                }
                Err(e) => debug!(error = %e, "could not list models, summarizing with session model"),
            }
            return current_model.to_string();
        }
        if current_model.starts_with("gemini") {
            return GEMINI_SUMMARIZE_MODEL.to_string();
        }
        current_model.to_string()
    }

    fn wants_topic(&self, session: &Session) -> bool {
        if !self.app.enable_auto_generate_title || !session.has_default_topic() {
            return false;
        }
        let history: Vec<ChatMessage> = session
            .messages
            .iter()
            .filter(|m| !m.is_error)
            .cloned()
            .collect();
        count_messages(&history, self.estimator.as_ref()) >= SUMMARIZE_MIN_TOKENS
    }

    /// Run both flows for the session as it is now
    pub async fn summarize_session(&self, session_id: &str) {
        let Some(session) = self.store.session(session_id) else {
            debug!(session_id, "session gone, skipping summarization");
            return;
        };

        let wants_topic = self.wants_topic(&session);
        // index snapshot is taken here, before any request goes out
        let plan = CompactionPlan::for_session(&session, self.estimator.as_ref());
        let claim = if plan.should_compact(&session) {
            let claim = self.claim_compaction(session_id);
            if claim.is_none() {
                debug!(session_id, "memory compaction already running, skipping");
            }
            claim
        } else {
            None
        };
        let wants_memory = claim.is_some();
        if !wants_topic && !wants_memory {
            return;
        }

        let model = self.summarize_model(&session.model_config.model).await;
        debug!(session_id, model = %model, wants_topic, wants_memory, "summarizing session");

        tokio::join!(
            async {
                if wants_topic {
                    self.derive_topic(&session, &model).await;
                }
            },
            async {
                if wants_memory {
                    self.compact_memory(&session, plan, &model).await;
                }
            }
        );
    }

    async fn derive_topic(&self, session: &Session, model: &str) {
        let mut messages: Vec<ChatMessage> = session
            .messages
            .iter()
            .filter(|m| !m.is_error)
            .cloned()
            .collect();
        messages.push(ChatMessage::synthetic(TOPIC_PROMPT_ID, Role::User, TOPIC_PROMPT));

        let config = LLMConfig::from(&session.model_config)
            .with_model(model)
            .streaming(false);
        let mut observer = TopicObserver {
            store: &self.store,
            slot: Slot::new(&self.registry, &session.id, TOPIC_SLOT),
        };
        let _ = self
            .dispatcher
            .chat(ContextBuilder::to_wire(&messages), &config, &mut observer)
            .await;
    }

    async fn compact_memory(&self, session: &Session, plan: CompactionPlan, model: &str) {
        let mut messages = plan.messages;
        messages.push(ChatMessage::synthetic(
            SUMMARIZE_PROMPT_ID,
            Role::System,
            SUMMARIZE_PROMPT,
        ));

        let config = LLMConfig::from(&session.model_config)
            .with_model(model)
            .without_max_tokens()
            .streaming(true);
        let mut observer = MemoryObserver {
            store: &self.store,
            slot: Slot::new(&self.registry, &session.id, SUMMARIZE_SLOT),
            previous_digest: session.memory_prompt.clone(),
            summarize_index: plan.summarize_index,
            last_written: None,
        };
        let _ = self
            .dispatcher
            .chat(ContextBuilder::to_wire(&messages), &config, &mut observer)
            .await;
    }
}
