//! MCP streamable HTTP: every client message is a POST to the server URL.
//! Replies arrive either as a JSON body or as an event stream whose first
//! response or error message answers the request.

use async_trait::async_trait;
use futures_util::StreamExt;
use rust_mcp_schema::schema_utils::{
    ClientMessage, FromMessage, MessageFromClient, NotificationFromClient, RequestFromClient,
    ServerMessage,
};
use rust_mcp_schema::RequestId;
use tracing::debug;

use super::McpTransport;

const SESSION_HEADER: &str = "mcp-session-id";
const PROTOCOL_VERSION_HEADER: &str = "MCP-Protocol-Version";

pub struct StreamableHttpTransport {
    server_id: String,
    client: reqwest::Client,
    url: String,
    session_id: Option<String>,
    protocol_version: String,
    next_request_id: i64,
}

impl StreamableHttpTransport {
    pub fn new(
        server_id: &str,
        client: reqwest::Client,
        url: impl Into<String>,
        protocol_version: impl Into<String>,
    ) -> Self {
        Self {
            server_id: server_id.to_string(),
            client,
            url: url.into(),
            session_id: None,
            protocol_version: protocol_version.into(),
            next_request_id: 0,
        }
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    fn with_session(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        let request = request.header(PROTOCOL_VERSION_HEADER, &self.protocol_version);
        match &self.session_id {
            Some(session_id) => request.header(SESSION_HEADER, session_id),
            None => request,
        }
    }

    async fn post(&mut self, message: &ClientMessage) -> Result<reqwest::Response, String> {
        let payload = serde_json::to_string(message).map_err(|err| err.to_string())?;
        debug!(server_id = %self.server_id, url = %self.url, bytes = payload.len(), "Sending MCP HTTP message");
        let request = self
            .client
            .post(&self.url)
            .header("Accept", "application/json, text/event-stream")
            .header("Content-Type", "application/json")
            .body(payload);
        let response = self
            .with_session(request)
            .send()
            .await
            .map_err(|err| err.to_string())?;
        if !response.status().is_success() {
            return Err(format!("HTTP error: {}", response.status()));
        }
        if let Some(session_id) = response
            .headers()
            .get(SESSION_HEADER)
            .and_then(|value| value.to_str().ok())
        {
            self.session_id = Some(session_id.to_string());
        }
        Ok(response)
    }
}

#[async_trait]
impl McpTransport for StreamableHttpTransport {
    async fn send_request(&mut self, request: RequestFromClient) -> Result<ServerMessage, String> {
        let request_id = RequestId::Integer(self.next_request_id);
        self.next_request_id += 1;
        let message = ClientMessage::from_message(
            MessageFromClient::RequestFromClient(request),
            Some(request_id),
        )
        .map_err(|err| err.to_string())?;

        let response = self.post(&message).await?;
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or("")
            .to_string();

        if is_event_stream_content_type(&content_type) {
            let server_id = self.server_id.clone();
            next_sse_server_message(response, move |message| {
                if !matches!(message, ServerMessage::Response(_) | ServerMessage::Error(_)) {
                    debug!(server_id = %server_id, "Skipping MCP server message on request stream");
                }
            })
            .await
        } else {
            let body = response.bytes().await.map_err(|err| err.to_string())?;
            serde_json::from_slice::<ServerMessage>(&body).map_err(|err| err.to_string())
        }
    }

    async fn send_notification(
        &mut self,
        notification: NotificationFromClient,
    ) -> Result<(), String> {
        let message = ClientMessage::from_message(
            MessageFromClient::NotificationFromClient(notification),
            None,
        )
        .map_err(|err| err.to_string())?;
        self.post(&message).await.map(|_| ())
    }

    fn set_protocol_version(&mut self, version: &str) {
        if !version.trim().is_empty() {
            self.protocol_version = version.to_string();
        }
    }

    /// Ends the server-side session. Servers may refuse with 405, which is fine.
    async fn close(&mut self) {
        let Some(session_id) = self.session_id.take() else {
            return;
        };
        debug!(server_id = %self.server_id, "Closing MCP HTTP session");
        let _ = self
            .client
            .delete(&self.url)
            .header(SESSION_HEADER, session_id)
            .header(PROTOCOL_VERSION_HEADER, &self.protocol_version)
            .send()
            .await;
    }
}

/// Splits an event stream into trimmed, non-empty lines across chunk
/// boundaries.
#[derive(Default)]
pub struct SseLineBuffer {
    buffer: Vec<u8>,
}

impl SseLineBuffer {
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);
        self.drain_lines(false)
    }

    pub fn finish(&mut self) -> Vec<String> {
        self.drain_lines(true)
    }

    fn drain_lines(&mut self, flush: bool) -> Vec<String> {
        let mut lines = Vec::new();
        let mut start = 0;

        while let Some(offset) = memchr::memchr(b'\n', &self.buffer[start..]) {
            let end = start + offset;
            push_line(&mut lines, &self.buffer[start..end]);
            start = end + 1;
        }

        if flush {
            push_line(&mut lines, &self.buffer[start..]);
            self.buffer.clear();
        } else if start > 0 {
            self.buffer.drain(..start);
        }

        lines
    }
}

fn push_line(lines: &mut Vec<String>, bytes: &[u8]) {
    if let Ok(text) = std::str::from_utf8(bytes) {
        let trimmed = text.trim();
        if !trimmed.is_empty() {
            lines.push(trimmed.to_string());
        }
    }
}

pub fn is_event_stream_content_type(content_type: &str) -> bool {
    content_type
        .split(';')
        .next()
        .map(str::trim)
        .is_some_and(|value| value.eq_ignore_ascii_case("text/event-stream"))
}

pub fn sse_data_payload(line: &str) -> Option<&str> {
    line.strip_prefix("data:").map(str::trim)
}

/// Reads the stream until a response or error arrives. Every decoded
/// message is shown to `on_message` first.
pub async fn next_sse_server_message(
    response: reqwest::Response,
    mut on_message: impl FnMut(&ServerMessage),
) -> Result<ServerMessage, String> {
    let mut stream = response.bytes_stream();
    let mut buffer = SseLineBuffer::default();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|err| err.to_string())?;
        for line in buffer.push(&chunk) {
            if let Some(message) = decode_sse_line(&line)? {
                on_message(&message);
                if is_reply(&message) {
                    return Ok(message);
                }
            }
        }
    }

    for line in buffer.finish() {
        if let Some(message) = decode_sse_line(&line)? {
            on_message(&message);
            if is_reply(&message) {
                return Ok(message);
            }
        }
    }

    Err("Empty event-stream response.".to_string())
}

fn is_reply(message: &ServerMessage) -> bool {
    matches!(
        message,
        ServerMessage::Response(_) | ServerMessage::Error(_)
    )
}

fn decode_sse_line(line: &str) -> Result<Option<ServerMessage>, String> {
    let Some(payload) = sse_data_payload(line) else {
        return Ok(None);
    };

    if payload.is_empty() {
        return Ok(None);
    }

    serde_json::from_str::<ServerMessage>(payload)
        .map(Some)
        .map_err(|err| err.to_string())
}
