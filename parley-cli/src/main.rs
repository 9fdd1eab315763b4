//! CLI entry point for parley

mod repl;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use console::style;
use parley_agent::{ChatService, ContextBuilder, Dispatcher, Summarizer};
use parley_core::config::{Config, ConfigLoader};
use parley_core::logging::init_logging;
use parley_core::utils::preview;
use parley_core::{ControllerRegistry, FileStateStore, SessionStore};
use parley_providers::{LLMProvider, OpenAiCompatClient};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, error, info};

#[derive(Parser)]
#[command(name = "parley")]
#[command(about = "Multi-session chat against OpenAI-compatible backends")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration directory
    #[arg(short, long, global = true)]
    config_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Chat in the current session; interactive without --message
    Chat {
        /// Send one message and exit
        #[arg(short, long)]
        message: Option<String>,
        /// Image URL to attach (repeatable)
        #[arg(short, long)]
        image: Vec<String>,
    },
    /// List sessions
    Sessions,
    /// Start a new session and select it
    New {
        /// Mask to start from
        #[arg(short, long)]
        mask: Option<String>,
    },
    /// Delete a session by its list index
    Delete { index: usize },
    /// List the models the backend offers
    Models,
    /// Show token usage against the configured quota
    Usage,
}

/// Everything a command needs, wired from the loaded configuration
pub(crate) struct App {
    pub config: Config,
    pub files: FileStateStore,
    pub chat: Arc<ChatService>,
    pub provider: Arc<OpenAiCompatClient>,
}

impl App {
    fn build(config: Config) -> Result<Self> {
        let files = FileStateStore::new(config.storage.resolved_dir(), config.model.clone());
        let state = files
            .load()
            .with_context(|| format!("failed to load chat state from {}", files.path().display()))?;
        let used_tokens = state.used_tokens;
        let store = Arc::new(SessionStore::from_state(state, config.model.clone()));

        let provider = Arc::new(
            OpenAiCompatClient::new(
                config.provider.api_base.clone(),
                Some(config.provider.api_key.clone()),
                config.model.model.clone(),
            )
            .with_provider_name(config.provider.provider_name.clone())
            .with_quota(config.provider.quota_tokens)
            .with_used_tokens(used_tokens),
        );

        let registry = ControllerRegistry::new();
        let backend: Arc<dyn LLMProvider> = provider.clone();
        let dispatcher = Dispatcher::new(backend);
        let context = ContextBuilder::new(config.app.lang.clone());
        let summarizer = Summarizer::new(
            Arc::clone(&store),
            registry.clone(),
            dispatcher.clone(),
            &context,
            config.app.clone(),
        );
        let chat = Arc::new(ChatService::new(store, registry, dispatcher, context, summarizer));

        Ok(Self {
            config,
            files,
            chat,
            provider,
        })
    }

    pub fn store(&self) -> &SessionStore {
        self.chat.store()
    }

    pub fn save(&self) -> Result<()> {
        let mut state = self.store().snapshot();
        state.used_tokens = self.provider.used_tokens();
        self.files
            .save(&state)
            .with_context(|| format!("failed to save chat state to {}", self.files.path().display()))?;
        debug!(path = %self.files.path().display(), "chat state saved");
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config_loader = if let Some(dir) = cli.config_dir {
        ConfigLoader::with_dir(dir)
    } else {
        ConfigLoader::new()
    };

    let config = config_loader.load().context("failed to load configuration")?;
    let _log_guard = init_logging(&config.logging);
    info!(config_dir = %config_loader.config_dir().display(), "configuration loaded");

    let app = App::build(config)?;

    match cli.command {
        Commands::Chat { message, image } => match message {
            Some(message) => run_once(&app, &message, &image).await?,
            None => repl::run(&app).await?,
        },
        Commands::Sessions => print_sessions(&app),
        Commands::New { mask } => run_new(&app, mask.as_deref())?,
        Commands::Delete { index } => run_delete(&app, index)?,
        Commands::Models => run_models(&app).await?,
        Commands::Usage => run_usage(&app).await?,
    }

    Ok(())
}

async fn run_once(app: &App, message: &str, images: &[String]) -> Result<()> {
    let outcome = repl::send(app, message, images).await;
    // compaction must land before the state is written
    app.chat.wait_for_background().await;
    app.save()?;

    if let Err(e) = outcome.result {
        error!(error = %e, "chat turn failed");
        anyhow::bail!("chat turn failed: {}", e);
    }
    Ok(())
}

pub(crate) fn print_sessions(app: &App) {
    let current = app.store().current_index();
    println!("{}", style("Sessions").bold().cyan());
    for (index, session) in app.store().sessions().iter().enumerate() {
        let marker = if index == current { ">" } else { " " };
        let last = session
            .messages
            .last()
            .map(|m| preview(&m.text(), 48))
            .unwrap_or_default();
        println!(
            "{} {:>3}  {}  {}  {}",
            style(marker).green().bold(),
            index,
            style(&session.topic).bold(),
            style(format!("({} messages)", session.messages.len())).dim(),
            style(last).dim()
        );
    }
}

pub(crate) fn new_session(app: &App, mask: Option<&str>) -> Result<()> {
    let mask = match mask {
        Some(name) => Some(
            app.config
                .find_mask(name)
                .with_context(|| format!("no mask named '{}'", name))?,
        ),
        None => None,
    };
    let id = app.store().new_session(mask);
    info!(session_id = %id, "new session");
    println!("{}", style("Started a new session.").green());
    Ok(())
}

fn run_new(app: &App, mask: Option<&str>) -> Result<()> {
    new_session(app, mask)?;
    app.save()
}

fn run_delete(app: &App, index: usize) -> Result<()> {
    if index >= app.store().len() {
        anyhow::bail!("no session at index {}", index);
    }
    app.store().delete_session(index);
    app.save()?;
    println!("{}", style(format!("Deleted session {}.", index)).yellow());
    Ok(())
}

async fn run_models(app: &App) -> Result<()> {
    let models = app
        .provider
        .models()
        .await
        .context("failed to list models")?;
    println!("{}", style("Models").bold().cyan());
    for model in models {
        let status = if model.available {
            style("available").green()
        } else {
            style("unavailable").dim()
        };
        println!("  {}: {}", model.name, status);
    }
    Ok(())
}

async fn run_usage(app: &App) -> Result<()> {
    let usage = app.provider.usage().await.context("failed to read usage")?;
    println!("{}", style("Usage").bold().cyan());
    println!("  Used: {}", usage.used);
    if usage.total > 0 {
        println!("  Quota: {}", usage.total);
    } else {
        println!("  Quota: {}", style("unlimited").dim());
    }
    Ok(())
}
