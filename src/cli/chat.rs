//! Line-oriented chat loop
//!
//! Reads one line at a time. Lines starting with `/` are commands, anything
//! else is sent as a user turn together with any pending attachments.

use std::error::Error;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::cli::ask::{cancel_on_interrupt, StreamPrinter};
use crate::core::attachments::{Attachment, UserTurn};
use crate::core::conversation::{ConversationManager, TurnOutcome};
use crate::core::message::Conversation;
use crate::core::session::SessionContext;
use crate::utils::logging::TranscriptLog;

const HELP: &str = "\
Commands:
  /regen          Regenerate the last response
  /image <path>   Attach an image to the next message
  /file <path>    Attach a text file to the next message
  /model <id>     Switch model for the following turns
  /save <path>    Save the conversation as JSON
  /help           Show this help
  /quit           Leave the chat";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatInput {
    Message(String),
    Regenerate,
    Image(PathBuf),
    File(PathBuf),
    Model(String),
    Save(PathBuf),
    Help,
    Quit,
    Empty,
    Invalid(String),
}

pub fn parse_input(line: &str) -> ChatInput {
    let line = line.trim();
    if line.is_empty() {
        return ChatInput::Empty;
    }
    let Some(command) = line.strip_prefix('/') else {
        return ChatInput::Message(line.to_string());
    };
    let (name, argument) = match command.split_once(char::is_whitespace) {
        Some((name, rest)) => (name, rest.trim()),
        None => (command, ""),
    };
    let needs_argument = |usage: &str| ChatInput::Invalid(format!("Usage: {usage}"));
    match name {
        "regen" | "retry" => ChatInput::Regenerate,
        "help" => ChatInput::Help,
        "quit" | "exit" => ChatInput::Quit,
        "image" if argument.is_empty() => needs_argument("/image <path>"),
        "image" => ChatInput::Image(PathBuf::from(argument)),
        "file" if argument.is_empty() => needs_argument("/file <path>"),
        "file" => ChatInput::File(PathBuf::from(argument)),
        "model" if argument.is_empty() => needs_argument("/model <id>"),
        "model" => ChatInput::Model(argument.to_string()),
        "save" if argument.is_empty() => needs_argument("/save <path>"),
        "save" => ChatInput::Save(PathBuf::from(argument)),
        other => ChatInput::Invalid(format!("Unknown command: /{other}. Type /help for commands.")),
    }
}

/// Reads a conversation saved with `/save`, or a bare message array.
pub fn load_conversation(path: &Path, model: &str) -> Result<Conversation, Box<dyn Error>> {
    let contents = std::fs::read_to_string(path)?;
    match Conversation::from_json(&contents) {
        Ok(conversation) => Ok(conversation),
        Err(full_err) => {
            debug!(error = %full_err, "Not a full conversation, trying a message array");
            Ok(Conversation::from_messages_json(model, &contents)?)
        }
    }
}

pub struct ChatLoop<'a> {
    session: &'a SessionContext,
    manager: ConversationManager,
    model: String,
    pending: Vec<Attachment>,
    log: Option<&'a TranscriptLog>,
}

impl<'a> ChatLoop<'a> {
    pub fn new(
        session: &'a SessionContext,
        model: &str,
        conversation: Option<Conversation>,
        log: Option<&'a TranscriptLog>,
    ) -> Self {
        let manager = match conversation {
            Some(conversation) => session.manage(conversation),
            None => session.new_conversation(model),
        };
        Self {
            session,
            manager,
            model: model.to_string(),
            pending: Vec::new(),
            log,
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn conversation(&self) -> &Conversation {
        self.manager.conversation()
    }

    /// Attachments waiting for the next message.
    pub fn pending_attachments(&self) -> &[Attachment] {
        &self.pending
    }

    /// Runs until `/quit`, end of input or Ctrl+C at the prompt.
    pub async fn run<R: AsyncBufRead + Unpin>(&mut self, input: R) -> Result<(), Box<dyn Error>> {
        let mut lines = input.lines();
        println!("💬 Chatting with {}. Type /help for commands.", self.model);
        loop {
            print!("> ");
            io::stdout().flush()?;
            let line = tokio::select! {
                line = lines.next_line() => line?,
                _ = tokio::signal::ctrl_c() => None,
            };
            let Some(line) = line else {
                println!();
                return Ok(());
            };
            if !self.handle(parse_input(&line)).await? {
                return Ok(());
            }
        }
    }

    /// Returns false when the loop should stop.
    pub async fn handle(&mut self, input: ChatInput) -> Result<bool, Box<dyn Error>> {
        match input {
            ChatInput::Empty => {}
            ChatInput::Quit => return Ok(false),
            ChatInput::Help => println!("{HELP}"),
            ChatInput::Invalid(message) => eprintln!("❌ {message}"),
            ChatInput::Image(path) => match Attachment::image_from_path(&path) {
                Ok(image) => {
                    self.warn_if_text_only();
                    self.pending.push(image);
                    println!("📎 Attached {}", path.display());
                }
                Err(err) => eprintln!("❌ {err}"),
            },
            ChatInput::File(path) => match Attachment::file_from_path(&path) {
                Ok(file) => {
                    self.pending.push(file);
                    println!("📎 Attached {}", path.display());
                }
                Err(err) => eprintln!("❌ {err}"),
            },
            ChatInput::Model(model) => match self.session.turn_context(&model).map(|_| ()) {
                Ok(()) => {
                    println!("🔁 Switched to {model}");
                    self.model = model;
                }
                Err(err) => eprintln!("❌ {err}"),
            },
            ChatInput::Save(path) => match self.save(&path) {
                Ok(()) => println!("💾 Saved conversation to {}", path.display()),
                Err(err) => eprintln!("❌ Failed to save {}: {err}", path.display()),
            },
            ChatInput::Regenerate => self.run_turn(None).await?,
            ChatInput::Message(text) => self.run_turn(Some(text)).await?,
        }
        Ok(true)
    }

    fn warn_if_text_only(&self) {
        let accepts_images = self
            .session
            .registry()
            .capability(&self.model)
            .is_some_and(|capability| capability.supports_images);
        if !accepts_images {
            eprintln!("⚠️  {} does not accept images; a placeholder will be sent", self.model);
        }
    }

    fn save(&self, path: &Path) -> Result<(), Box<dyn Error>> {
        std::fs::write(path, self.manager.conversation().to_json()?)?;
        Ok(())
    }

    /// Sends `text` with the pending attachments, or regenerates the last
    /// response for `None`. Attachments stay pending if the model cannot be
    /// used.
    async fn run_turn(&mut self, text: Option<String>) -> Result<(), Box<dyn Error>> {
        let session = self.session;
        let ctx = match session.turn_context(&self.model) {
            Ok(ctx) => ctx,
            Err(err) => {
                eprintln!("❌ {err}");
                return Ok(());
            }
        };
        let turn = text.map(|text| {
            self.pending
                .drain(..)
                .fold(UserTurn::text(text), UserTurn::with_attachment)
        });

        let regenerating = turn.is_none();
        let before = self.manager.conversation().len();
        let cancel = CancellationToken::new();
        let interrupt = cancel_on_interrupt(cancel.clone());
        let mut printer = StreamPrinter::stdio().with_cancel(cancel);

        let result = match turn {
            Some(turn) => self.manager.submit(ctx, turn, Some(&mut printer)).await,
            None => self.manager.regenerate(ctx, Some(&mut printer)).await,
        };
        interrupt.abort();
        printer.finish_line();

        if let Some(log) = self.log {
            let messages = self.manager.conversation().messages();
            if regenerating {
                log.rewrite(messages)?;
            } else if let Some(added) = messages.get(before..) {
                log.append(added)?;
            }
        }

        match result {
            Ok(TurnOutcome::Completed) => {
                if !printer.printed() {
                    if let Some(last) = self.manager.conversation().last() {
                        println!("{}", last.text());
                    }
                }
            }
            Ok(TurnOutcome::ErrorTurn(err)) => eprintln!("❌ {err}"),
            Ok(TurnOutcome::Cancelled) => eprintln!("⏹️  Cancelled"),
            Err(err) => eprintln!("❌ {err}"),
        }
        Ok(())
    }
}
