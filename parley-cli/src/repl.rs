//! Interactive chat loop and streamed reply printing

use anyhow::Result;
use console::style;
use parley_agent::TurnOutcome;
use parley_core::{SessionStore, StoreEvent};
use std::io::Write;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tracing::debug;

use crate::{new_session, print_sessions, App};

/// A slash command typed at the prompt
#[derive(Debug, Clone, PartialEq, Eq)]
enum Command {
    New(Option<String>),
    Next,
    Prev,
    Select(usize),
    Move(usize, usize),
    Delete(Option<usize>),
    Undo,
    Reset,
    Clear,
    Sessions,
    Help,
    Quit,
}

impl Command {
    /// `Ok(None)` for plain chat input
    fn parse(line: &str) -> Result<Option<Self>, String> {
        let Some(rest) = line.strip_prefix('/') else {
            return Ok(None);
        };
        let mut parts = rest.split_whitespace();
        let name = parts.next().unwrap_or_default();
        let args: Vec<&str> = parts.collect();

        let index = |arg: &str| {
            arg.parse::<usize>()
                .map_err(|_| format!("'{}' is not a session index", arg))
        };

        let command = match (name, args.as_slice()) {
            ("new", []) => Command::New(None),
            ("new", [mask]) => Command::New(Some(mask.to_string())),
            ("next", []) => Command::Next,
            ("prev", []) => Command::Prev,
            ("select", [n]) => Command::Select(index(n)?),
            ("move", [from, to]) => Command::Move(index(from)?, index(to)?),
            ("delete", []) => Command::Delete(None),
            ("delete", [n]) => Command::Delete(Some(index(n)?)),
            ("undo", []) => Command::Undo,
            ("reset", []) => Command::Reset,
            ("clear", []) => Command::Clear,
            ("sessions", []) => Command::Sessions,
            ("help", []) => Command::Help,
            ("quit" | "exit", []) => Command::Quit,
            _ => return Err(format!("unknown command: {}", line)),
        };
        Ok(Some(command))
    }
}

const HELP: &str = "\
/new [mask]   start a session (optionally from a mask)
/next, /prev  switch sessions
/select N     select session N
/move A B     move session A to position B
/delete [N]   delete session N (default: current)
/undo         restore the last deleted session
/reset        clear the current session's history
/clear        toggle the context floor at the end of the history
/sessions     list sessions
/quit         leave";

/// Prints the growing reply of a streaming message
#[derive(Default)]
struct StreamPrinter {
    printed: usize,
}

impl StreamPrinter {
    fn show(&mut self, text: &str) {
        if text.len() <= self.printed || !text.is_char_boundary(self.printed) {
            return;
        }
        print!("{}", &text[self.printed..]);
        let _ = std::io::stdout().flush();
        self.printed = text.len();
    }

    fn finish(&mut self, text: &str) {
        self.show(text);
        println!();
    }
}

fn message_text(store: &SessionStore, session_id: &str, message_id: &str) -> Option<String> {
    store
        .session(session_id)?
        .messages
        .iter()
        .find(|m| m.id == message_id)
        .map(|m| m.text())
}

fn streaming_text(store: &SessionStore, session_id: &str, message_id: &str) -> Option<String> {
    store
        .session(session_id)?
        .messages
        .iter()
        .find(|m| m.id == message_id && m.streaming)
        .map(|m| m.text())
}

/// Run one turn in the current session, printing the reply as it streams
pub(crate) async fn send(app: &App, message: &str, images: &[String]) -> TurnOutcome {
    let store = app.store();
    let session_id = store.current_session_id();
    let mut events = store.subscribe();
    let mut printer = StreamPrinter::default();

    println!("{}", style("Assistant:").bold());
    let turn = app.chat.on_user_input(message, images);
    tokio::pin!(turn);

    let mut listening = true;
    let outcome = loop {
        tokio::select! {
            outcome = &mut turn => break outcome,
            event = events.recv(), if listening => match event {
                Ok(StoreEvent::MessageUpdated { session_id: sid, message_id }) if sid == session_id => {
                    if let Some(text) = streaming_text(store, &sid, &message_id) {
                        printer.show(&text);
                    }
                }
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => debug!(skipped, "reply printer lagged"),
                Err(RecvError::Closed) => listening = false,
            },
        }
    };

    match &outcome.result {
        Ok(_) => {
            let text = message_text(store, &outcome.session_id, &outcome.bot_message_id)
                .unwrap_or_default();
            printer.finish(&text);
        }
        Err(e) if e.is_abort() => println!("\n{}", style("(stopped)").dim()),
        Err(e) => println!("\n{}", style(format!("Error: {}", e)).red()),
    }
    outcome
}

fn print_current(app: &App) {
    let session = app.store().current_session();
    println!(
        "{} {} {}",
        style("Session:").bold(),
        style(&session.topic).cyan(),
        style(format!("({} messages)", session.messages.len())).dim()
    );
}

fn execute(app: &App, command: Command) -> Result<()> {
    let store = app.store();
    match command {
        Command::New(mask) => new_session(app, mask.as_deref())?,
        Command::Next => store.next_session(1),
        Command::Prev => store.next_session(-1),
        Command::Select(index) => store.select_session(index),
        Command::Move(from, to) => {
            if !store.move_session(from, to) {
                anyhow::bail!("cannot move session {} to {}", from, to);
            }
        }
        Command::Delete(index) => {
            let index = index.unwrap_or_else(|| store.current_index());
            if index >= store.len() {
                anyhow::bail!("no session at index {}", index);
            }
            store.delete_session(index);
            println!("{}", style("Session deleted. /undo to restore it.").yellow());
        }
        Command::Undo => match store.pending_undo() {
            Some(token) if store.undo_delete(token) => {
                println!("{}", style("Session restored.").green());
            }
            _ => println!("{}", style("Nothing to undo.").dim()),
        },
        Command::Reset => store.reset_session(),
        Command::Clear => match store.clear_context() {
            Some(_) => println!("{}", style("Earlier messages will no longer be sent.").dim()),
            None => println!("{}", style("Context floor removed.").dim()),
        },
        Command::Sessions => {
            print_sessions(app);
            return Ok(());
        }
        Command::Help => {
            println!("{}", HELP);
            return Ok(());
        }
        Command::Quit => return Ok(()),
    }
    print_current(app);
    Ok(())
}

/// Interactive loop; state is saved after every line
pub(crate) async fn run(app: &App) -> Result<()> {
    println!("{}", style("parley").bold().cyan());
    println!("{}", style("Type a message, or /help for commands.").dim());
    print_current(app);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("{} ", style(">").green().bold());
        let _ = std::io::stdout().flush();

        let Some(line) = lines.next_line().await? else {
            break;
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        match Command::parse(line) {
            Ok(Some(Command::Quit)) => break,
            Ok(Some(command)) => {
                if let Err(e) = execute(app, command) {
                    println!("{}", style(e).red());
                }
            }
            Ok(None) => {
                send(app, line, &[]).await;
            }
            Err(message) => println!("{}", style(message).red()),
        }
        app.save()?;
    }

    app.chat.wait_for_background().await;
    app.save()
}
