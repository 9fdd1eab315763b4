//! One conversational turn: window, dispatch, commit, compaction.

use chrono::Local;
use parley_core::template::fill_template_with;
use parley_core::{
    AbortHandle, ChatMessage, ControllerRegistry, MessageContent, SessionStore, TokenEstimator,
};
use parley_providers::LLMConfig;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::context::ContextBuilder;
use crate::dispatch::{ChatObserver, DispatchError, Dispatcher};
use crate::summarizer::Summarizer;

/// Result of [`ChatService::on_user_input`]
#[derive(Debug, Clone)]
pub struct TurnOutcome {
    pub session_id: String,
    pub user_message_id: String,
    pub bot_message_id: String,
    pub result: Result<String, DispatchError>,
}

impl TurnOutcome {
    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }
}

/// Error block appended to a failed assistant message
fn error_block(error: &DispatchError) -> String {
    let body = serde_json::json!({
        "error": true,
        "message": error.to_string(),
    });
    let pretty = serde_json::to_string_pretty(&body).unwrap_or_else(|_| body.to_string());
    format!("```json\n{pretty}\n```")
}

/// Applies dispatch progress to the turn's two messages
struct TurnObserver<'a> {
    store: &'a SessionStore,
    registry: &'a ControllerRegistry,
    estimator: &'a dyn TokenEstimator,
    session_id: &'a str,
    user_message_id: &'a str,
    bot_message_id: &'a str,
    handle: Option<AbortHandle>,
    committed: bool,
}

impl TurnObserver<'_> {
    fn release(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.registry
                .remove_if_current(self.session_id, self.bot_message_id, &handle);
        }
    }

    fn aborted(&self) -> bool {
        self.handle.as_ref().is_some_and(AbortHandle::is_aborted)
    }
}

impl ChatObserver for TurnObserver<'_> {
    fn on_controller(&mut self, handle: AbortHandle) {
        self.registry
            .add_controller(self.session_id, self.bot_message_id, handle.clone());
        self.handle = Some(handle);
    }

    fn on_update(&mut self, text: &str) {
        // late update racing an abort
        if self.aborted() {
            return;
        }
        self.store
            .update_message_by_id(self.session_id, self.bot_message_id, |message| {
                message.content = MessageContent::from(text);
            });
    }

    fn on_finish(&mut self, text: &str) {
        self.release();
        let bot_message_id = self.bot_message_id;
        let estimator = self.estimator;
        let committed = self.store.update_session(self.session_id, |session| {
            let message = session.message_mut(bot_message_id)?;
            message.streaming = false;
            if text.is_empty() {
                return None;
            }
            message.content = MessageContent::from(text);
            let message = message.clone();
            session.record_stat(&message, estimator);
            session.touch();
            Some(())
        });
        self.committed = matches!(committed, Some(Some(())));
        if !self.committed {
            debug!(session_id = self.session_id, "empty reply, nothing committed");
        }
    }

    fn on_error(&mut self, error: &DispatchError) {
        self.release();
        let aborted = error.is_abort();
        let block = error_block(error);
        let (user_message_id, bot_message_id) = (self.user_message_id, self.bot_message_id);
        self.store.update_session(self.session_id, |session| {
            if let Some(message) = session.message_mut(bot_message_id) {
                message.content.push_text(&format!("\n\n{block}"));
                message.streaming = false;
                message.is_error = !aborted;
            }
            if let Some(message) = session.message_mut(user_message_id) {
                message.is_error = !aborted;
            }
        });
    }
}

/// Drop background tasks that already ended
fn reap_finished(tasks: &mut JoinSet<()>) {
    while let Some(joined) = tasks.try_join_next() {
        if let Err(e) = joined {
            warn!(error = %e, "background summarization task failed");
        }
    }
}

/// Runs chat turns against the session store and schedules compaction
pub struct ChatService {
    store: Arc<SessionStore>,
    registry: ControllerRegistry,
    dispatcher: Dispatcher,
    context: ContextBuilder,
    summarizer: Arc<Summarizer>,
    background: Mutex<JoinSet<()>>,
}

impl ChatService {
    pub fn new(
        store: Arc<SessionStore>,
        registry: ControllerRegistry,
        dispatcher: Dispatcher,
        context: ContextBuilder,
        summarizer: Summarizer,
    ) -> Self {
        Self {
            store,
            registry,
            dispatcher,
            context,
            summarizer: Arc::new(summarizer),
            background: Mutex::new(JoinSet::new()),
        }
    }

    pub fn store(&self) -> &Arc<SessionStore> {
        &self.store
    }

    pub fn registry(&self) -> &ControllerRegistry {
        &self.registry
    }

    /// Send `content` (and optional image urls) in the current session.
    ///
    /// Failures end up on the messages and in the outcome; this never
    /// returns early without committing the turn's messages.
    pub async fn on_user_input(&self, content: &str, images: &[String]) -> TurnOutcome {
        let now = Local::now();
        let session = self.store.current_session();
        let session_id = session.id.clone();
        let config = &session.model_config;

        let rendered = fill_template_with(content, config, self.context.lang(), now);
        let user_content = if images.is_empty() {
            MessageContent::from(rendered)
        } else {
            MessageContent::with_images(rendered, images)
        };
        let user_message = ChatMessage::user(user_content);
        let bot_message = ChatMessage::streaming_placeholder(config.model.clone());
        let user_message_id = user_message.id.clone();
        let bot_message_id = bot_message.id.clone();

        let mut window = self.context.build(&session, now);
        window.push(user_message.clone());

        let appended = self.store.update_session(&session_id, |session| {
            session.push_message(user_message);
            session.push_message(bot_message);
        });
        if appended.is_none() {
            warn!(session_id = %session_id, "session disappeared before the turn started");
        }

        info!(
            session_id = %session_id,
            model = %config.model,
            window = window.len(),
            "dispatching chat turn"
        );

        let llm_config = LLMConfig::from(config).streaming(true);
        let mut observer = TurnObserver {
            store: &self.store,
            registry: &self.registry,
            estimator: self.context.estimator().as_ref(),
            session_id: &session_id,
            user_message_id: &user_message_id,
            bot_message_id: &bot_message_id,
            handle: None,
            committed: false,
        };
        let result = self
            .dispatcher
            .chat(ContextBuilder::to_wire(&window), &llm_config, &mut observer)
            .await;

        if observer.committed {
            self.spawn_summarization(&session_id);
        }

        TurnOutcome {
            session_id,
            user_message_id,
            bot_message_id,
            result,
        }
    }

    fn spawn_summarization(&self, session_id: &str) {
        let summarizer = Arc::clone(&self.summarizer);
        let session_id = session_id.to_string();
        let mut tasks = self.background.lock();
        reap_finished(&mut tasks);
        tasks.spawn(async move {
            summarizer.summarize_session(&session_id).await;
        });
    }

    /// Abort the request generating `message_id`; false if none is running
    pub fn stop(&self, session_id: &str, message_id: &str) -> bool {
        self.registry.stop(session_id, message_id)
    }

    /// Abort every in-flight request, background ones included
    pub fn stop_all(&self) {
        self.registry.stop_all();
    }

    /// Wait for all scheduled compaction work to finish
    pub async fn wait_for_background(&self) {
        let mut tasks = std::mem::take(&mut *self.background.lock());
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                warn!(error = %e, "background summarization task failed");
            }
        }
    }
}
