//! Pull-based streaming of provider replies.
//!
//! A [`TurnStream`] is fed by a background task that reads the HTTP body,
//! frames it into lines and hands each line to a provider-specific
//! [`StreamDecoder`]. Dropping or cancelling the stream stops the task and
//! closes the connection.

use futures_util::StreamExt;
use memchr::memchr;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::core::error::ProviderError;
use crate::core::message::{FinishReason, TokenUsage, ToolCallRequest};
use crate::core::providers::http::transport_error;
use crate::core::providers::{ProviderKind, ProviderReply, ReplyKind};

#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    TextDelta(String),
    ToolCall(ToolCallRequest),
    Usage(TokenUsage),
    Finished(FinishReason),
}

/// Turns framed lines of one provider's streaming body into events.
pub trait StreamDecoder: Send + 'static {
    /// Returns `Ok(true)` once the provider signalled the end of the reply.
    fn decode_line(&mut self, line: &str, out: &mut Vec<StreamEvent>)
        -> Result<bool, ProviderError>;

    /// Flushes anything still buffered when the body ends. Decoders whose
    /// protocol has an end marker fail here when it never arrived.
    fn finish(&mut self, _out: &mut Vec<StreamEvent>) -> Result<(), ProviderError> {
        Ok(())
    }
}

type EventResult = Result<StreamEvent, ProviderError>;

/// Lazy, finite, non-restartable sequence of reply events.
pub struct TurnStream {
    rx: mpsc::UnboundedReceiver<EventResult>,
    cancel: CancellationToken,
}

impl TurnStream {
    pub(crate) fn spawn<D: StreamDecoder>(
        provider: ProviderKind,
        response: reqwest::Response,
        decoder: D,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = pump(provider, response, decoder, &tx) => {}
                _ = token.cancelled() => {
                    debug!(provider = %provider, "Provider stream cancelled");
                }
            }
        });
        Self { rx, cancel }
    }

    /// A stream that yields an already complete reply.
    pub fn from_reply(reply: ProviderReply) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let ProviderReply {
            kind,
            usage,
            finish_reason,
        } = reply;
        let (text, calls) = match kind {
            ReplyKind::AssistantTurn { text } => (text, Vec::new()),
            ReplyKind::ToolCallRequest { text, calls } => (text, calls),
        };
        if !text.is_empty() {
            let _ = tx.send(Ok(StreamEvent::TextDelta(text)));
        }
        for call in calls {
            let _ = tx.send(Ok(StreamEvent::ToolCall(call)));
        }
        let _ = tx.send(Ok(StreamEvent::Usage(usage)));
        let _ = tx.send(Ok(StreamEvent::Finished(finish_reason)));
        Self {
            rx,
            cancel: CancellationToken::new(),
        }
    }

    /// Next event, or `None` once the reply is complete or cancelled.
    pub async fn next_event(&mut self) -> Option<EventResult> {
        if self.cancel.is_cancelled() {
            return None;
        }
        self.rx.recv().await
    }

    /// Abandons the stream. Buffered output is discarded.
    pub fn cancel(&mut self) {
        self.cancel.cancel();
        self.rx.close();
    }

    /// Drains the stream into a complete reply.
    pub async fn collect(mut self) -> Result<ProviderReply, ProviderError> {
        let mut assembler = ReplyAssembler::default();
        while let Some(event) = self.next_event().await {
            assembler.push(event?);
        }
        Ok(assembler.finish())
    }
}

impl Drop for TurnStream {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn pump<D: StreamDecoder>(
    provider: ProviderKind,
    response: reqwest::Response,
    mut decoder: D,
    tx: &mpsc::UnboundedSender<EventResult>,
) {
    let mut stream = response.bytes_stream();
    let mut buffer: Vec<u8> = Vec::new();
    let mut events = Vec::new();
    let mut finished = false;

    'body: while let Some(chunk) = stream.next().await {
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(err) => {
                let _ = tx.send(Err(transport_error(provider, &err)));
                return;
            }
        };
        buffer.extend_from_slice(&chunk);

        while let Some(newline_pos) = memchr(b'\n', &buffer) {
            let line = String::from_utf8_lossy(&buffer[..newline_pos])
                .trim()
                .to_string();
            buffer.drain(..=newline_pos);
            if line.is_empty() {
                continue;
            }
            match decoder.decode_line(&line, &mut events) {
                Ok(done) => {
                    if !forward(&mut events, tx) {
                        return;
                    }
                    if done {
                        finished = true;
                        break 'body;
                    }
                }
                Err(err) => {
                    let _ = tx.send(Err(err));
                    return;
                }
            }
        }
    }

    let trailing = String::from_utf8_lossy(&buffer).trim().to_string();
    if !finished && !trailing.is_empty() {
        if let Err(err) = decoder.decode_line(&trailing, &mut events) {
            let _ = tx.send(Err(err));
            return;
        }
    }
    match decoder.finish(&mut events) {
        Ok(()) => {
            forward(&mut events, tx);
        }
        Err(err) => {
            let _ = tx.send(Err(err));
        }
    }
}

/// Returns false when the receiver has gone away.
fn forward(events: &mut Vec<StreamEvent>, tx: &mpsc::UnboundedSender<EventResult>) -> bool {
    for event in events.drain(..) {
        if tx.send(Ok(event)).is_err() {
            return false;
        }
    }
    true
}

/// Folds stream events into a [`ProviderReply`].
#[derive(Debug, Default)]
pub struct ReplyAssembler {
    text: String,
    calls: Vec<ToolCallRequest>,
    usage: TokenUsage,
    finish_reason: Option<FinishReason>,
}

impl ReplyAssembler {
    pub fn push(&mut self, event: StreamEvent) {
        match event {
            StreamEvent::TextDelta(delta) => self.text.push_str(&delta),
            StreamEvent::ToolCall(call) => self.calls.push(call),
            StreamEvent::Usage(usage) => self.usage.add(usage),
            StreamEvent::Finished(reason) => self.finish_reason = Some(reason),
        }
    }

    pub fn finish(self) -> ProviderReply {
        let kind = if self.calls.is_empty() {
            ReplyKind::AssistantTurn { text: self.text }
        } else {
            ReplyKind::ToolCallRequest {
                text: self.text,
                calls: self.calls,
            }
        };
        let default_reason = match kind {
            ReplyKind::ToolCallRequest { .. } => FinishReason::ToolCalls,
            ReplyKind::AssistantTurn { .. } => FinishReason::Stop,
        };
        ProviderReply {
            kind,
            usage: self.usage,
            finish_reason: self.finish_reason.unwrap_or(default_reason),
        }
    }
}

/// The body closed before the provider's end-of-reply marker.
pub(crate) fn truncated(provider: ProviderKind) -> ProviderError {
    ProviderError::api(provider, "stream ended before completion")
}

pub(crate) fn sse_data(line: &str) -> Option<&str> {
    line.strip_prefix("data:").map(str::trim_start)
}

pub(crate) fn extract_error_summary(value: &serde_json::Value) -> Option<String> {
    let summary = value
        .pointer("/error/message")
        .and_then(|v| v.as_str())
        .map(str::to_owned)
        .or_else(|| {
            value.get("error").and_then(|v| match v {
                serde_json::Value::String(s) => Some(s.clone()),
                _ => None,
            })
        })
        .or_else(|| {
            value
                .get("errors")
                .and_then(|errors| errors.pointer("/0/message"))
                .and_then(|v| v.as_str().map(str::to_owned))
        })
        .or_else(|| {
            value
                .get("errorMessage")
                .and_then(|v| v.as_str().map(str::to_owned))
        })
        .or_else(|| {
            value
                .get("message")
                .and_then(|v| v.as_str().map(str::to_owned))
        });

    summary
        .map(|text| text.split_whitespace().collect::<Vec<_>>().join(" "))
        .filter(|text| !text.is_empty())
}

/// Human-readable message for an error body.
pub(crate) fn api_error_message(body: &str) -> String {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return "<empty response body>".to_string();
    }
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(trimmed) {
        if let Some(summary) = extract_error_summary(&value) {
            return summary;
        }
    }
    trimmed.split_whitespace().collect::<Vec<_>>().join(" ")
}
