//! Switchboard demo bot
//!
//! Reads updates as JSON lines on stdin (a bare text line becomes a message
//! in chat 1) and writes every outbound message as a JSON line on stdout.
//! Logs go to stderr.

use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use switchboard::handler::{message_handler, one_step, reply_handler};
use switchboard::store::{FileMedium, SqliteMedium};
use switchboard::transport::{InlineButton, SentMessage};
use switchboard::{
    CommandRouter, Dispatcher, EngineConfig, Handler, HandlerArgs, HandlerFactory, OutboundMessage, ReplyMarkup, Selector,
    SessionStore, Step, StepAction, StepContext, StepMachine, Transport, TransportError, Update,
};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio_stream::wrappers::LinesStream;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const CONSOLE_CHAT: i64 = 1;

// ============================================================================
// Console transport
// ============================================================================

/// Transport printing outbound messages as JSON lines
struct ConsoleTransport {
    out: Mutex<tokio::io::Stdout>,
    next_message_id: AtomicI64,
}

#[derive(Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum ConsoleLine<'a> {
    AnswerCallback { callback_id: &'a str },
}

impl ConsoleTransport {
    fn new() -> Self {
        Self {
            out: Mutex::new(tokio::io::stdout()),
            next_message_id: AtomicI64::new(1),
        }
    }

    async fn write_json(&self, value: &impl Serialize) -> Result<(), TransportError> {
        let mut line = serde_json::to_vec(value).map_err(|e| TransportError::new(e.to_string()))?;
        line.push(b'\n');
        let mut out = self.out.lock().await;
        out.write_all(&line)
            .await
            .map_err(|e| TransportError::retryable(e.to_string()))?;
        out.flush()
            .await
            .map_err(|e| TransportError::retryable(e.to_string()))
    }
}

#[async_trait]
impl Transport for ConsoleTransport {
    async fn send(&self, message: OutboundMessage) -> Result<SentMessage, TransportError> {
        self.write_json(&message).await?;
        let message_id = match message {
            OutboundMessage::EditText { message_id, .. }
            | OutboundMessage::EditMarkup { message_id, .. }
            | OutboundMessage::Delete { message_id, .. } => message_id,
            OutboundMessage::Text { .. } | OutboundMessage::Photo { .. } => {
                self.next_message_id.fetch_add(1, Ordering::SeqCst)
            }
        };
        Ok(SentMessage { message_id })
    }

    async fn answer_callback(&self, callback_id: &str) -> Result<(), TransportError> {
        self.write_json(&ConsoleLine::AnswerCallback { callback_id })
            .await
    }
}

fn parse_line(line: &str, next_id: &mut i64) -> Option<Update> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    *next_id += 1;
    if line.starts_with('{') {
        match serde_json::from_str(line) {
            Ok(update) => Some(update),
            Err(e) => {
                tracing::warn!(error = %e, "Ignoring malformed update");
                None
            }
        }
    } else {
        Some(Update::text_message(*next_id, CONSOLE_CHAT, line))
    }
}

// ============================================================================
// Demo conversations
// ============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Introduction {
    name: String,
    age: Option<u32>,
}

fn introduction() -> HandlerFactory {
    Arc::new(|args: HandlerArgs| {
        let ask_name = Step::new("ask_name", |cx: StepContext<Introduction>| async move {
            cx.session().send_text("What is your name?").await?;
            let Some(answer) = cx.next_event().await else {
                return Ok(StepAction::End);
            };
            let name = answer.text().trim().to_string();
            if name.is_empty() {
                cx.session().send_text("I need a name in plain text.").await?;
                return Ok(StepAction::Repeat);
            }
            cx.with_data(|d| d.name = name);
            Ok(StepAction::Next)
        });
        let ask_age = Step::new("ask_age", |cx: StepContext<Introduction>| async move {
            let name = cx.with_data(|d| d.name.clone());
            cx.session()
                .send_text(format!("Nice to meet you, <b>{name}</b>. How old are you?"))
                .await?;
            let Some(answer) = cx.next_event().await else {
                return Ok(StepAction::End);
            };
            match answer.text().trim().parse::<u32>() {
                Ok(age) => {
                    cx.with_data(|d| d.age = Some(age));
                    Ok(StepAction::Next)
                }
                Err(_) => {
                    cx.session().send_text("Please answer with a number.").await?;
                    Ok(StepAction::Repeat)
                }
            }
        });
        let summary = Step::new("summary", |cx: StepContext<Introduction>| async move {
            let intro = cx.data();
            cx.session()
                .send_text(format!(
                    "Noted: {} is {} years old.",
                    intro.name,
                    intro.age.unwrap_or_default()
                ))
                .await?;
            Ok(StepAction::End)
        });
        Box::new(StepMachine::stateful(
            args,
            Introduction::default(),
            vec![ask_name, ask_age, summary],
        )) as Box<dyn Handler>
    })
}

fn menu() -> HandlerFactory {
    one_step(|cx: StepContext<()>| async move {
        let buttons = ReplyMarkup::Inline {
            rows: vec![vec![
                InlineButton::new("Tea", "menu:tea"),
                InlineButton::new("Coffee", "menu:coffee"),
            ]],
        };
        cx.session().send_text_with_markup("Pick a drink", buttons).await?;
        Ok(())
    })
}

fn menu_choice() -> HandlerFactory {
    one_step(|cx: StepContext<()>| async move {
        let Some(callback) = cx.first_event().callback_query.clone() else {
            return Ok(());
        };
        cx.session().answer_callback(&callback.id).await?;
        let choice = callback.data.trim_start_matches("menu:").to_string();
        if let Some(message) = callback.message {
            cx.session()
                .edit_message_text(message.message_id, format!("You picked {choice}."))
                .await?;
        }
        Ok(())
    })
}

fn demo_router() -> Result<CommandRouter, switchboard::routing::RoutingError> {
    Ok(CommandRouter::new(message_handler("Unknown command. Try /name or /menu."))
        .global(Selector::command("start"), message_handler("Hello! Try /name or /menu."))
        .global(Selector::command("cancel"), message_handler("Cancelled."))
        .route(Selector::command("name"), introduction())
        .route(Selector::command("menu"), menu())
        .route(Selector::callback_matches("^menu:")?, menu_choice())
        .route(Selector::has_photo(), reply_handler("Nice picture!")))
}

fn open_store(path: Option<&Path>) -> Result<SessionStore, switchboard::StoreError> {
    let Some(path) = path else {
        return Ok(SessionStore::in_memory());
    };
    let is_sqlite = path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| matches!(e, "db" | "sqlite" | "sqlite3"));
    if is_sqlite {
        Ok(SessionStore::new(SqliteMedium::open(path)?))
    } else {
        Ok(SessionStore::new(FileMedium::new(path)))
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "switchboard=info".into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(std::io::stderr)
                .with_current_span(false)
                .with_span_list(false),
        )
        .init();

    let config = EngineConfig::from_env()?;
    let store = Arc::new(open_store(config.state_file.as_deref())?);
    tracing::info!(
        mailbox_capacity = config.mailbox_capacity,
        max_open_sessions = config.max_open_sessions,
        state_file = ?config.state_file,
        "Configuration loaded"
    );

    let dispatcher = Arc::new(
        Dispatcher::new(config, demo_router()?, Arc::new(ConsoleTransport::new()), store)
            .with_global_keyboard(|_chat| Some(ReplyMarkup::single_row_keyboard(true, &["/name", "/menu", "/cancel"]))),
    );
    dispatcher.start().await;

    let stdin = tokio::io::BufReader::new(tokio::io::stdin());
    let mut next_id = 0;
    let updates = LinesStream::new(stdin.lines())
        .filter_map(move |line| {
            let update = match line {
                Ok(line) => parse_line(&line, &mut next_id),
                Err(e) => {
                    tracing::error!(error = %e, "Cannot read stdin");
                    None
                }
            };
            futures::future::ready(update)
        });

    tokio::select! {
        () = dispatcher.run(Box::pin(updates)) => tracing::info!("Input closed"),
        result = tokio::signal::ctrl_c() => {
            result?;
            tracing::info!("Interrupted");
        }
    }

    dispatcher.shutdown().await?;
    Ok(())
}
