//! Stdio transport: one JSON-RPC message per line on a spawned server's
//! stdin and stdout. Responses are matched to waiting requests by id.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use rust_mcp_schema::schema_utils::{
    ClientMessage, FromMessage, MessageFromClient, NotificationFromClient, RequestFromClient,
    ServerMessage,
};
use rust_mcp_schema::RequestId;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::oneshot;
use tracing::debug;

use super::McpTransport;
use crate::core::config::data::McpServerConfig;

const STDIO_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);
const STDIO_WRITE_TIMEOUT: Duration = Duration::from_secs(10);
const STDIO_EXIT_GRACE: Duration = Duration::from_secs(2);

type PendingMap = Arc<Mutex<HashMap<RequestId, oneshot::Sender<ServerMessage>>>>;

fn lock(pending: &PendingMap) -> MutexGuard<'_, HashMap<RequestId, oneshot::Sender<ServerMessage>>> {
    pending.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Removes a waiting request's entry when its caller stops waiting,
/// including when the request future is dropped mid-flight.
struct PendingEntry {
    pending: PendingMap,
    id: RequestId,
}

impl Drop for PendingEntry {
    fn drop(&mut self) {
        lock(&self.pending).remove(&self.id);
    }
}

pub fn require_stdio_command(config: &McpServerConfig) -> Result<&str, String> {
    config
        .command
        .as_deref()
        .filter(|command| !command.trim().is_empty())
        .ok_or_else(|| "MCP command is required for stdio transport.".to_string())
}

pub struct StdioTransport {
    server_id: String,
    child: Child,
    stdin: ChildStdin,
    pending: PendingMap,
    next_request_id: i64,
    request_timeout: Duration,
}

impl StdioTransport {
    /// Starts the configured command with piped stdio. The child is killed
    /// when the transport is dropped.
    pub fn spawn(server_id: &str, config: &McpServerConfig) -> Result<Self, String> {
        let command = require_stdio_command(config)?;
        debug!(server_id = %server_id, command = %command, args = ?config.args, "Starting MCP stdio server");
        let mut child = Command::new(command)
            .args(&config.args)
            .envs(&config.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| format!("Failed to start `{command}`: {err}"))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| "Unable to retrieve stdin.".to_string())?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| "Unable to retrieve stdout.".to_string())?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| "Unable to retrieve stderr.".to_string())?;

        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        spawn_stdout_reader(server_id.to_string(), stdout, pending.clone());
        spawn_stderr_drain(server_id.to_string(), stderr);

        Ok(Self {
            server_id: server_id.to_string(),
            child,
            stdin,
            pending,
            next_request_id: 0,
            request_timeout: STDIO_REQUEST_TIMEOUT,
        })
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    fn next_request_id(&mut self) -> RequestId {
        let id = self.next_request_id;
        self.next_request_id += 1;
        RequestId::Integer(id)
    }

    async fn write_message(&mut self, message: &ClientMessage) -> Result<(), String> {
        let mut payload = serde_json::to_string(message).map_err(|err| err.to_string())?;
        payload.push('\n');
        debug!(server_id = %self.server_id, bytes = payload.len(), "Writing MCP stdio message");
        tokio::time::timeout(STDIO_WRITE_TIMEOUT, async {
            self.stdin.write_all(payload.as_bytes()).await?;
            self.stdin.flush().await
        })
        .await
        .map_err(|_| "Timed out writing MCP stdio message.".to_string())?
        .map_err(|err| format!("Failed to write to MCP stdio server: {err}"))
    }
}

#[async_trait]
impl McpTransport for StdioTransport {
    async fn send_request(&mut self, request: RequestFromClient) -> Result<ServerMessage, String> {
        let request_id = self.next_request_id();
        let message = ClientMessage::from_message(
            MessageFromClient::RequestFromClient(request),
            Some(request_id.clone()),
        )
        .map_err(|err| err.to_string())?;

        let (tx, rx) = oneshot::channel();
        lock(&self.pending).insert(request_id.clone(), tx);
        let _entry = PendingEntry {
            pending: self.pending.clone(),
            id: request_id.clone(),
        };
        self.write_message(&message).await?;

        match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(message)) => Ok(message),
            Ok(Err(_)) => Err("MCP stdio server exited before responding.".to_string()),
            Err(_) => {
                debug!(server_id = %self.server_id, request_id = ?request_id, "MCP stdio request timed out");
                Err("MCP stdio request timed out.".to_string())
            }
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
        self.write_message(&message).await
    }

    async fn close(&mut self) {
        debug!(server_id = %self.server_id, "Stopping MCP stdio server");
        let _ = self.stdin.shutdown().await;
        if tokio::time::timeout(STDIO_EXIT_GRACE, self.child.wait())
            .await
            .is_err()
        {
            let _ = self.child.kill().await;
        }
        lock(&self.pending).clear();
    }
}

fn spawn_stdout_reader(server_id: String, stdout: ChildStdout, pending: PendingMap) {
    tokio::spawn(async move {
        let mut reader = BufReader::new(stdout).lines();
        while let Ok(Some(line)) = reader.next_line().await {
            let value = match serde_json::from_str::<serde_json::Value>(&line) {
                Ok(value) => value,
                Err(_) => {
                    debug!(server_id = %server_id, "Skipping non-JSON line from MCP stdio server");
                    continue;
                }
            };
            let items = match value {
                serde_json::Value::Array(items) => items,
                other => vec![other],
            };
            for item in items {
                if let Ok(message) = serde_json::from_value::<ServerMessage>(item) {
                    dispatch_message(&server_id, &pending, message);
                }
            }
        }
        debug!(server_id = %server_id, "MCP stdio server closed stdout");
        lock(&pending).clear();
    });
}

fn spawn_stderr_drain(server_id: String, stderr: ChildStderr) {
    tokio::spawn(async move {
        let mut reader = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = reader.next_line().await {
            debug!(server_id = %server_id, line = %line, "MCP stdio stderr");
        }
    });
}

fn dispatch_message(server_id: &str, pending: &PendingMap, message: ServerMessage) {
    let request_id = match &message {
        ServerMessage::Response(response) => Some(response.id.clone()),
        ServerMessage::Error(error) => {
            debug!(
                server_id = %server_id,
                error_id = ?error.id,
                error_code = error.error.code,
                "Received MCP stdio error"
            );
            error.id.clone()
        }
        ServerMessage::Request(request) => {
            debug!(server_id = %server_id, method = %request.method(), "Ignoring MCP server request");
            None
        }
        ServerMessage::Notification(_) => {
            debug!(server_id = %server_id, "Received MCP stdio notification");
            None
        }
    };
    if let Some(id) = request_id {
        let waiting = lock(pending).remove(&id);
        if let Some(tx) = waiting {
            let _ = tx.send(message);
        }
    }
}
