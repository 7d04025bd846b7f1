//! One-shot `ask` command

use std::error::Error;
use std::io::{self, Write};
use std::path::PathBuf;

use tokio_util::sync::CancellationToken;

use crate::core::attachments::{Attachment, UserTurn};
use crate::core::conversation::{TurnListener, TurnOutcome};
use crate::core::error::ChatError;
use crate::core::message::ToolCallRequest;
use crate::core::session::SessionContext;
use crate::core::tools::ToolOutput;
use crate::utils::logging::TranscriptLog;

/// Prints streamed text to `out` and tool activity to `notes`.
pub struct StreamPrinter<W: Write + Send, N: Write + Send> {
    out: W,
    notes: N,
    cancel: Option<CancellationToken>,
    printed: bool,
}

impl StreamPrinter<io::Stdout, io::Stderr> {
    pub fn stdio() -> Self {
        Self::new(io::stdout(), io::stderr())
    }
}

impl<W: Write + Send, N: Write + Send> StreamPrinter<W, N> {
    pub fn new(out: W, notes: N) -> Self {
        Self {
            out,
            notes,
            cancel: None,
            printed: false,
        }
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    /// Whether any text reached `out` since the last [`Self::reset`].
    pub fn printed(&self) -> bool {
        self.printed
    }

    pub fn reset(&mut self) {
        self.printed = false;
    }

    /// Terminates the streamed line.
    pub fn finish_line(&mut self) {
        if self.printed {
            let _ = writeln!(self.out);
            let _ = self.out.flush();
        }
    }

    pub fn into_parts(self) -> (W, N) {
        (self.out, self.notes)
    }
}

impl<W: Write + Send, N: Write + Send> TurnListener for StreamPrinter<W, N> {
    fn on_text_delta(&mut self, delta: &str) {
        self.printed = true;
        let _ = write!(self.out, "{delta}");
        let _ = self.out.flush();
    }

    fn on_tool_call(&mut self, call: &ToolCallRequest) {
        self.finish_line();
        self.printed = false;
        let _ = writeln!(self.notes, "🔧 Calling tool `{}`", call.name);
    }

    fn on_tool_result(&mut self, call: &ToolCallRequest, output: &ToolOutput) {
        if output.is_error {
            let _ = writeln!(self.notes, "⚠️  Tool `{}` failed: {}", call.name, output.payload);
        }
    }

    fn should_cancel(&mut self) -> bool {
        self.cancel
            .as_ref()
            .is_some_and(CancellationToken::is_cancelled)
    }

    fn cancellation(&self) -> Option<CancellationToken> {
        self.cancel.clone()
    }
}

/// Cancels `token` when Ctrl+C arrives. Abort the handle once the turn ends.
pub(crate) fn cancel_on_interrupt(token: CancellationToken) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            token.cancel();
        }
    })
}

pub(crate) fn load_attachments(
    images: &[PathBuf],
    files: &[PathBuf],
) -> Result<Vec<Attachment>, ChatError> {
    let mut attachments = Vec::with_capacity(images.len() + files.len());
    for path in images {
        attachments.push(Attachment::image_from_path(path)?);
    }
    for path in files {
        attachments.push(Attachment::file_from_path(path)?);
    }
    Ok(attachments)
}

pub async fn run_ask(
    session: &SessionContext,
    model: &str,
    prompt: &str,
    attachments: Vec<Attachment>,
    log: Option<&TranscriptLog>,
) -> Result<(), Box<dyn Error>> {
    let mut turn = UserTurn::text(prompt);
    for attachment in attachments {
        turn = turn.with_attachment(attachment);
    }

    let mut manager = session.new_conversation(model);
    let ctx = session.turn_context(model)?;
    let cancel = CancellationToken::new();
    let interrupt = cancel_on_interrupt(cancel.clone());
    let mut printer = StreamPrinter::stdio().with_cancel(cancel);

    let outcome = manager.submit(ctx, turn, Some(&mut printer)).await;
    interrupt.abort();
    printer.finish_line();

    if let Some(log) = log {
        log.append(manager.conversation().messages())?;
    }

    match outcome? {
        TurnOutcome::Completed => {
            if !printer.printed() {
                if let Some(last) = manager.conversation().last() {
                    println!("{}", last.text());
                }
            }
            Ok(())
        }
        TurnOutcome::ErrorTurn(err) => Err(err.into()),
        TurnOutcome::Cancelled => {
            eprintln!("⏹️  Cancelled");
            Ok(())
        }
    }
}
