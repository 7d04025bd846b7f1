//! Shared MCP transport abstractions.
//!
//! Implementations carry `rust_mcp_schema` JSON-RPC messages and hide the
//! framing differences between a spawned process and a streamable HTTP
//! endpoint from the connection layer.

use async_trait::async_trait;
use rust_mcp_schema::schema_utils::{NotificationFromClient, RequestFromClient, ServerMessage};

use crate::core::config::data::McpServerConfig;

pub mod stdio;
pub mod streamable_http;

pub use stdio::StdioTransport;
pub use streamable_http::StreamableHttpTransport;

/// JSON-RPC code used by servers to indicate unsupported methods.
pub const MCP_METHOD_NOT_FOUND: i64 = -32601;

/// Supported MCP transport backends.
///
/// - [`McpTransportKind::Stdio`] for locally spawned processes.
/// - [`McpTransportKind::StreamableHttp`] for remote servers over HTTP/SSE.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum McpTransportKind {
    StreamableHttp,
    Stdio,
}

impl McpTransportKind {
    /// A `command` means stdio, a `url` means streamable HTTP.
    pub fn from_config(config: &McpServerConfig) -> Result<Self, String> {
        let has_command = config
            .command
            .as_deref()
            .is_some_and(|command| !command.trim().is_empty());
        let has_url = config
            .url
            .as_deref()
            .is_some_and(|url| !url.trim().is_empty());
        match (has_command, has_url) {
            (true, false) => Ok(McpTransportKind::Stdio),
            (false, true) => Ok(McpTransportKind::StreamableHttp),
            (true, true) => Err("MCP server sets both command and url.".to_string()),
            (false, false) => Err("MCP server needs either a command or a url.".to_string()),
        }
    }
}

/// Transport contract used by [`crate::mcp::client::McpServerConnection`].
///
/// Calls take `&mut self`: a connection is only ever driven by one caller
/// at a time.
#[async_trait]
pub trait McpTransport: Send {
    /// Sends a request and waits for the matching response or error.
    async fn send_request(&mut self, request: RequestFromClient) -> Result<ServerMessage, String>;

    async fn send_notification(&mut self, notification: NotificationFromClient)
        -> Result<(), String>;

    /// Records the protocol version the server agreed to on `initialize`.
    fn set_protocol_version(&mut self, _version: &str) {}

    /// Releases the underlying process or session.
    async fn close(&mut self);
}

/// Returns true when a server reports the JSON-RPC method-not-found code.
pub fn is_method_not_found(message: &ServerMessage) -> bool {
    matches!(
        message,
        ServerMessage::Error(error) if error.error.code == MCP_METHOD_NOT_FOUND
    )
}
