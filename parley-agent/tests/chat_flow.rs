use async_trait::async_trait;
use futures::stream;
use futures::StreamExt;
use parley_agent::summarizer::{SUMMARIZE_PROMPT, TOPIC_PROMPT};
use parley_agent::{ChatService, ContextBuilder, DispatchError, Dispatcher, Summarizer};
use parley_core::config::AppConfig;
use parley_core::session::DEFAULT_TOPIC;
use parley_core::{ChatMessage, ControllerRegistry, FileStateStore, ModelConfig, SessionStore};
use parley_providers::{
    LLMConfig, LLMModel, LLMProvider, LLMResponse, LLMStreamEvent, LLMUsage, Message,
    ProviderError, ProviderEventStream, ProviderResult,
};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

#[derive(Clone)]
enum Reply {
    Text(Vec<&'static str>),
    Fail(&'static str),
    /// Streams the deltas, then never completes
    Hang(Vec<&'static str>),
    /// Waits for the provider's gate before answering
    Gated(&'static str),
    /// Streams the first delta, then waits for the gate before the second
    Paused(&'static str, &'static str),
    /// Streams the delta, then fails once the gate opens
    PausedFail(&'static str, &'static str),
}

/// Provider answering from per-purpose queues, routed by the last message
#[derive(Default)]
struct ScriptedProvider {
    chat: Mutex<VecDeque<Reply>>,
    topics: Mutex<VecDeque<Reply>>,
    summaries: Mutex<VecDeque<Reply>>,
    chat_requests: Mutex<Vec<Vec<Message>>>,
    summary_requests: Mutex<Vec<Vec<Message>>>,
    summary_started: Arc<Notify>,
    gate: Arc<Notify>,
}

impl ScriptedProvider {
    fn with_chat(replies: Vec<Reply>) -> Self {
        let provider = Self::default();
        provider.chat.lock().unwrap().extend(replies);
        provider
    }

    fn push_topic(&self, reply: Reply) {
        self.topics.lock().unwrap().push_back(reply);
    }

    fn push_summary(&self, reply: Reply) {
        self.summaries.lock().unwrap().push_back(reply);
    }

    fn next_reply(&self, messages: &[Message]) -> Reply {
        let last = messages.last().map(|m| m.content.text()).unwrap_or_default();
        let queue = if last == TOPIC_PROMPT {
            &self.topics
        } else if last == SUMMARIZE_PROMPT {
            self.summary_requests.lock().unwrap().push(messages.to_vec());
            self.summary_started.notify_one();
            &self.summaries
        } else {
            self.chat_requests.lock().unwrap().push(messages.to_vec());
            &self.chat
        };
        queue
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Reply::Fail("no scripted reply"))
    }

    fn chat_request_texts(&self, index: usize) -> Vec<String> {
        self.chat_requests.lock().unwrap()[index]
            .iter()
            .map(|m| m.content.text())
            .collect()
    }
}

#[async_trait]
impl LLMProvider for ScriptedProvider {
    async fn chat(&self, messages: Vec<Message>, _config: &LLMConfig) -> ProviderResult<LLMResponse> {
        match self.next_reply(&messages) {
            Reply::Text(parts) => Ok(LLMResponse::text(parts.concat())),
            Reply::Fail(msg) => Err(ProviderError::ApiError(msg.to_string())),
            Reply::Hang(_) => futures::future::pending().await,
            Reply::Gated(text) => {
                self.gate.notified().await;
                Ok(LLMResponse::text(text))
            }
            Reply::Paused(first, rest) => {
                self.gate.notified().await;
                Ok(LLMResponse::text(format!("{first}{rest}")))
            }
            Reply::PausedFail(_, msg) => {
                self.gate.notified().await;
                Err(ProviderError::ApiError(msg.to_string()))
            }
        }
    }

    async fn chat_stream(
        &self,
        messages: Vec<Message>,
        _config: &LLMConfig,
    ) -> ProviderResult<ProviderEventStream> {
        let deltas = |parts: &[&'static str]| -> Vec<ProviderResult<LLMStreamEvent>> {
            parts
                .iter()
                .map(|p| Ok(LLMStreamEvent::TextDelta(p.to_string())))
                .collect()
        };
        match self.next_reply(&messages) {
            Reply::Text(parts) => {
                let done = Ok(LLMStreamEvent::Completed(LLMResponse::text(parts.concat())));
                Ok(Box::pin(
                    stream::iter(deltas(&parts)).chain(stream::once(async move { done })),
                ))
            }
            Reply::Fail(msg) => Err(ProviderError::ApiError(msg.to_string())),
            Reply::Hang(parts) => Ok(Box::pin(stream::iter(deltas(&parts)).chain(stream::pending()))),
            Reply::Gated(text) => {
                let gate = Arc::clone(&self.gate);
                let delayed = stream::once(async move {
                    gate.notified().await;
                    Ok(LLMStreamEvent::TextDelta(text.to_string()))
                });
                let done = Ok(LLMStreamEvent::Completed(LLMResponse::text(text)));
                Ok(Box::pin(delayed.chain(stream::once(async move { done }))))
            }
            Reply::Paused(first, rest) => {
                let gate = Arc::clone(&self.gate);
                let tail = stream::once(async move {
                    gate.notified().await;
                    Ok(LLMStreamEvent::TextDelta(rest.to_string()))
                });
                let done = Ok(LLMStreamEvent::Completed(LLMResponse::text(format!(
                    "{first}{rest}"
                ))));
                Ok(Box::pin(
                    stream::iter(deltas(&[first]))
                        .chain(tail)
                        .chain(stream::once(async move { done })),
                ))
            }
            Reply::PausedFail(first, msg) => {
                let gate = Arc::clone(&self.gate);
                let failure = stream::once(async move {
                    gate.notified().await;
                    Err(ProviderError::ApiError(msg.to_string()))
                });
                Ok(Box::pin(stream::iter(deltas(&[first])).chain(failure)))
            }
        }
    }

    async fn usage(&self) -> ProviderResult<LLMUsage> {
        Ok(LLMUsage::default())
    }

    async fn models(&self) -> ProviderResult<Vec<LLMModel>> {
        Ok(Vec::new())
    }

    fn get_default_model(&self) -> String {
        "scripted".to_string()
    }
}

fn defaults() -> ModelConfig {
    ModelConfig {
        model: "scripted-model".to_string(),
        send_memory: false,
        ..Default::default()
    }
}

fn quiet_app() -> AppConfig {
    AppConfig {
        enable_auto_generate_title: false,
        ..Default::default()
    }
}

fn service(provider: Arc<ScriptedProvider>, defaults: ModelConfig, app: AppConfig) -> Arc<ChatService> {
    let store = Arc::new(SessionStore::new(defaults));
    let registry = ControllerRegistry::new();
    let backend: Arc<dyn LLMProvider> = provider;
    let dispatcher = Dispatcher::new(backend);
    let context = ContextBuilder::new("en");
    let summarizer = Summarizer::new(
        Arc::clone(&store),
        registry.clone(),
        dispatcher.clone(),
        &context,
        app,
    );
    Arc::new(ChatService::new(store, registry, dispatcher, context, summarizer))
}

#[tokio::test]
async fn test_turn_commits_reply_and_stats() {
    let provider = Arc::new(ScriptedProvider::with_chat(vec![Reply::Text(vec![
        "Hello", " there",
    ])]));
    let chat = service(provider.clone(), defaults(), quiet_app());

    let outcome = chat.on_user_input("hi", &[]).await;
    assert_eq!(outcome.result, Ok("Hello there".to_string()));

    let session = chat.store().current_session();
    assert_eq!(session.messages.len(), 2);
    assert_eq!(session.messages[0].text(), "hi");
    let reply = &session.messages[1];
    assert_eq!(reply.id, outcome.bot_message_id);
    assert_eq!(reply.text(), "Hello there");
    assert!(!reply.streaming);
    assert_eq!(reply.model.as_deref(), Some("scripted-model"));
    assert_eq!(session.stat.char_count, "Hello there".len());
    assert_eq!(session.stat.word_count, 2);
    assert!(chat.registry().is_empty());
}

#[tokio::test]
async fn test_provider_receives_last_messages_plus_input() {
    let provider = Arc::new(ScriptedProvider::with_chat(vec![
        Reply::Text(vec!["a1"]),
        Reply::Text(vec!["a2"]),
        Reply::Text(vec!["a3"]),
        Reply::Text(vec!["a4"]),
    ]));
    let chat = service(provider.clone(), defaults(), quiet_app());

    for input in ["q1", "q2", "q3", "q4"] {
        assert!(chat.on_user_input(input, &[]).await.is_ok());
    }

    // history_message_count = 4 over the six messages before q4
    assert_eq!(
        provider.chat_request_texts(3),
        vec!["q2", "a2", "q3", "a3", "q4"]
    );
}

#[tokio::test]
async fn test_backend_error_flags_both_messages() {
    let provider = Arc::new(ScriptedProvider::with_chat(vec![
        Reply::Text(vec!["fine"]),
        Reply::Fail("quota exceeded"),
        Reply::Text(vec!["recovered"]),
    ]));
    let chat = service(provider.clone(), defaults(), quiet_app());

    chat.on_user_input("first", &[]).await;
    let outcome = chat.on_user_input("doomed", &[]).await;
    assert!(matches!(outcome.result, Err(DispatchError::Backend(_))));

    let session = chat.store().current_session();
    let user = &session.messages[2];
    let bot = &session.messages[3];
    assert!(user.is_error);
    assert!(bot.is_error);
    assert!(!bot.streaming);
    assert!(bot.text().contains("```json"));
    assert!(bot.text().contains("quota exceeded"));
    assert!(chat.registry().is_empty());

    chat.on_user_input("again", &[]).await;
    let sent = provider.chat_request_texts(2);
    assert_eq!(sent, vec!["first", "fine", "again"]);
}

#[tokio::test]
async fn test_abort_is_not_an_error() {
    let provider = Arc::new(ScriptedProvider::with_chat(vec![Reply::Hang(vec!["partial"])]));
    let chat = service(provider.clone(), defaults(), quiet_app());
    let session_id = chat.store().current_session_id();

    let turn = {
        let chat = Arc::clone(&chat);
        tokio::spawn(async move { chat.on_user_input("long question", &[]).await })
    };

    let streamed = |chat: &ChatService| {
        chat.store()
            .current_session()
            .messages
            .get(1)
            .is_some_and(|m| m.text() == "partial")
    };
    for _ in 0..200 {
        if streamed(chat.as_ref()) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(streamed(chat.as_ref()));
    assert!(chat.registry().has_pending(&session_id));
    chat.stop_all();

    let outcome = tokio::time::timeout(Duration::from_secs(5), turn)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(outcome.result, Err(DispatchError::Aborted));

    let session = chat.store().current_session();
    assert!(session.messages.iter().all(|m| !m.is_error));
    assert!(!session.messages[1].streaming);
    assert!(session.messages[1].text().starts_with("partial"));
    assert!(chat.registry().is_empty());
}

#[tokio::test]
async fn test_compaction_commits_index_snapshot() {
    let config = ModelConfig {
        send_memory: true,
        compress_message_length_threshold: 1,
        ..defaults()
    };
    let provider = Arc::new(ScriptedProvider::with_chat(vec![Reply::Text(vec![
        "ownership moves values",
    ])]));
    provider.push_summary(Reply::Gated("user asked about ownership"));
    let chat = service(provider.clone(), config, quiet_app());

    chat.on_user_input("explain ownership", &[]).await;
    provider.summary_started.notified().await;

    // messages arriving while the summary is in flight stay outside it
    chat.store().add_message(ChatMessage::user("and borrowing?"));
    chat.store().add_message(ChatMessage::assistant("borrowing lends access"));
    provider.gate.notify_one();
    chat.wait_for_background().await;

    let session = chat.store().current_session();
    assert_eq!(session.last_summarize_index, 2);
    assert_eq!(session.memory_prompt, "user asked about ownership");
    assert_eq!(session.messages.len(), 4);

    let summary_request = provider.summary_requests.lock().unwrap()[0].clone();
    assert_eq!(summary_request.len(), 3);
    assert_eq!(summary_request[2].role, "system");
}

#[tokio::test]
async fn test_failed_compaction_keeps_previous_digest() {
    let config = ModelConfig {
        send_memory: true,
        compress_message_length_threshold: 1,
        ..defaults()
    };
    let provider = Arc::new(ScriptedProvider::with_chat(vec![Reply::Text(vec!["reply"])]));
    provider.push_summary(Reply::Fail("summarizer down"));
    let chat = service(provider.clone(), config, quiet_app());
    chat.store().update_current_session(|s| s.memory_prompt = "old digest".to_string());

    let outcome = chat.on_user_input("question", &[]).await;
    chat.wait_for_background().await;

    assert!(outcome.is_ok());
    let session = chat.store().current_session();
    assert_eq!(session.memory_prompt, "old digest");
    assert_eq!(session.last_summarize_index, 0);
    assert!(session.messages.iter().all(|m| !m.is_error));
}

fn compacting_config() -> ModelConfig {
    ModelConfig {
        send_memory: true,
        compress_message_length_threshold: 1,
        ..defaults()
    }
}

async fn wait_for_digest(chat: &ChatService, expected: &str) {
    for _ in 0..200 {
        if chat.store().current_session().memory_prompt == expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("digest never became {expected:?}");
}

#[tokio::test]
async fn test_second_compaction_waits_for_the_running_one() {
    let provider = Arc::new(ScriptedProvider::with_chat(vec![
        Reply::Text(vec!["first reply"]),
        Reply::Text(vec!["second reply"]),
    ]));
    provider.push_summary(Reply::Paused("partial", " digest"));
    provider.push_summary(Reply::Fail("summarizer down"));
    let chat = service(provider.clone(), compacting_config(), quiet_app());

    chat.on_user_input("first question", &[]).await;
    provider.summary_started.notified().await;
    wait_for_digest(&chat, "partial").await;

    // this turn's compaction finds the first one still streaming
    assert!(chat.on_user_input("second question", &[]).await.is_ok());
    tokio::time::sleep(Duration::from_millis(20)).await;

    provider.gate.notify_one();
    chat.wait_for_background().await;

    let session = chat.store().current_session();
    assert_eq!(session.memory_prompt, "partial digest");
    assert_eq!(session.last_summarize_index, 2);
    assert_eq!(provider.summary_requests.lock().unwrap().len(), 1);
    assert!(chat.registry().is_empty());
}

#[tokio::test]
async fn test_failed_compaction_leaves_newer_digest_alone() {
    let provider = Arc::new(ScriptedProvider::with_chat(vec![Reply::Text(vec!["reply"])]));
    provider.push_summary(Reply::PausedFail("half a digest", "summarizer down"));
    let chat = service(provider.clone(), compacting_config(), quiet_app());
    chat.store().update_current_session(|s| s.memory_prompt = "old digest".to_string());

    chat.on_user_input("question", &[]).await;
    wait_for_digest(&chat, "half a digest").await;

    chat.store().update_current_session(|s| s.memory_prompt = "written meanwhile".to_string());
    provider.gate.notify_one();
    chat.wait_for_background().await;

    let session = chat.store().current_session();
    assert_eq!(session.memory_prompt, "written meanwhile");
    assert_eq!(session.last_summarize_index, 0);
}

#[tokio::test]
async fn test_failed_compaction_rolls_back_its_partial_digest() {
    let provider = Arc::new(ScriptedProvider::with_chat(vec![Reply::Text(vec!["reply"])]));
    provider.push_summary(Reply::PausedFail("half a digest", "summarizer down"));
    let chat = service(provider.clone(), compacting_config(), quiet_app());
    chat.store().update_current_session(|s| s.memory_prompt = "old digest".to_string());

    chat.on_user_input("question", &[]).await;
    wait_for_digest(&chat, "half a digest").await;
    provider.gate.notify_one();
    chat.wait_for_background().await;

    assert_eq!(chat.store().current_session().memory_prompt, "old digest");
}

#[tokio::test]
async fn test_topic_derived_once_history_is_long_enough() {
    let provider = Arc::new(ScriptedProvider::with_chat(vec![
        Reply::Text(vec!["ok"]),
        Reply::Text(vec![
            "Ownership is how Rust manages memory without a garbage collector, ",
            "and borrowing lets code use a value without taking ownership of it.",
        ]),
    ]));
    provider.push_topic(Reply::Text(vec!["\"Rust Ownership Basics\"."]));
    let chat = service(provider.clone(), defaults(), AppConfig::default());

    chat.on_user_input("hi", &[]).await;
    chat.wait_for_background().await;
    assert_eq!(chat.store().current_session().topic, DEFAULT_TOPIC);

    chat.on_user_input(
        "Could you explain how ownership and borrowing work together in Rust programs?",
        &[],
    )
    .await;
    chat.wait_for_background().await;
    assert_eq!(chat.store().current_session().topic, "Rust Ownership Basics");
}

#[tokio::test]
async fn test_turn_survives_save_and_reload() {
    let dir = tempfile::tempdir().unwrap();
    let provider = Arc::new(ScriptedProvider::with_chat(vec![Reply::Text(vec!["persisted"])]));
    let chat = service(provider, defaults(), quiet_app());
    chat.on_user_input("remember me", &[]).await;

    let files = FileStateStore::new(dir.path(), defaults());
    files.save(&chat.store().snapshot()).unwrap();
    let reloaded = SessionStore::from_state(files.load().unwrap(), defaults());

    let session = reloaded.current_session();
    assert_eq!(session.messages.len(), 2);
    assert_eq!(session.messages[1].text(), "persisted");
}
