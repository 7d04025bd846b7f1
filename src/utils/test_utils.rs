//! Scripted collaborators for conversation and session tests.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rust_mcp_schema::schema_utils::{NotificationFromClient, RequestFromClient, ServerMessage};
use serde_json::{json, Map, Value};

use crate::core::error::{ProviderError, ToolExecutionError, ToolFailure};
use crate::core::message::{Message, ToolCallRequest};
use crate::core::providers::{ChatProvider, ProviderKind, ProviderReply, TurnRequest};
use crate::core::tools::{ToolDescriptor, ToolExecutor, ToolOutput};
use crate::mcp::transport::McpTransport;

/// What a [`ScriptedProvider`] saw on one call.
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub model: String,
    pub messages: Vec<Message>,
    pub tools: Vec<String>,
    pub system_prompt: Option<String>,
}

enum Script {
    Queue(VecDeque<Result<ProviderReply, ProviderError>>),
    /// Requests the same tool forever with a fresh call id each round.
    AlwaysTool { name: String, arguments: Value },
}

pub struct ScriptedProvider {
    script: Mutex<Script>,
    requests: Mutex<Vec<RecordedRequest>>,
}

impl ScriptedProvider {
    pub fn new(replies: impl IntoIterator<Item = Result<ProviderReply, ProviderError>>) -> Self {
        Self {
            script: Mutex::new(Script::Queue(replies.into_iter().collect())),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn replying(replies: impl IntoIterator<Item = ProviderReply>) -> Self {
        Self::new(replies.into_iter().map(Ok))
    }

    pub fn always_tool(name: &str, arguments: Value) -> Self {
        Self {
            script: Mutex::new(Script::AlwaysTool {
                name: name.to_string(),
                arguments,
            }),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

#[async_trait]
impl ChatProvider for ScriptedProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Ollama
    }

    async fn send_turn(&self, request: &TurnRequest<'_>) -> Result<ProviderReply, ProviderError> {
        let round = {
            let mut requests = self.requests.lock().unwrap();
            requests.push(RecordedRequest {
                model: request.model.to_string(),
                messages: request.transmitted().cloned().collect(),
                tools: request.tools.iter().map(|tool| tool.name.clone()).collect(),
                system_prompt: request.system_prompt.map(str::to_string),
            });
            requests.len()
        };
        request.check_content(self.kind())?;

        let mut script = self.script.lock().unwrap();
        match &mut *script {
            Script::Queue(replies) => replies
                .pop_front()
                .unwrap_or_else(|| Ok(ProviderReply::text("(script exhausted)"))),
            Script::AlwaysTool { name, arguments } => Ok(ProviderReply::tool_calls(vec![
                ToolCallRequest {
                    id: format!("call_{round}"),
                    name: name.clone(),
                    arguments: arguments.clone(),
                },
            ])),
        }
    }
}

pub fn tool_call(id: &str, name: &str, arguments: Value) -> ToolCallRequest {
    ToolCallRequest {
        id: id.to_string(),
        name: name.to_string(),
        arguments,
    }
}

pub fn descriptor(name: &str, server: &str) -> ToolDescriptor {
    ToolDescriptor {
        name: name.to_string(),
        description: Some(format!("{name} tool")),
        input_schema: json!({"type": "object"}),
        server_origin: server.to_string(),
    }
}

/// Executor with canned results per tool name. Unknown names are refused.
#[derive(Default)]
pub struct FakeTools {
    tools: Vec<ToolDescriptor>,
    results: HashMap<String, Result<ToolOutput, ToolFailure>>,
    invoked: Mutex<Vec<ToolCallRequest>>,
}

impl FakeTools {
    pub fn with_result(mut self, name: &str, payload: &str) -> Self {
        self.tools.push(descriptor(name, "fake"));
        self.results.insert(
            name.to_string(),
            Ok(ToolOutput {
                payload: payload.to_string(),
                is_error: false,
            }),
        );
        self
    }

    pub fn with_failure(mut self, name: &str, failure: ToolFailure) -> Self {
        self.tools.push(descriptor(name, "fake"));
        self.results.insert(name.to_string(), Err(failure));
        self
    }

    pub fn with_timeout(self, name: &str) -> Self {
        self.with_failure(name, ToolFailure::Timeout(Duration::from_secs(1)))
    }

    pub fn invoked(&self) -> Vec<ToolCallRequest> {
        self.invoked.lock().unwrap().clone()
    }
}

#[async_trait]
impl ToolExecutor for FakeTools {
    fn exposed_tools(&self) -> Vec<ToolDescriptor> {
        self.tools.clone()
    }

    async fn invoke(&self, call: &ToolCallRequest) -> Result<ToolOutput, ToolExecutionError> {
        self.invoked.lock().unwrap().push(call.clone());
        match self.results.get(&call.name) {
            Some(Ok(output)) => Ok(output.clone()),
            Some(Err(failure)) => Err(ToolExecutionError::new(
                &call.id,
                &call.name,
                failure.clone(),
            )),
            None => Err(ToolExecutionError::new(
                &call.id,
                &call.name,
                ToolFailure::NotAllowed,
            )),
        }
    }
}

/// What a [`ScriptedMcpServer`] observed.
#[derive(Default)]
pub struct ToolServerStats {
    pub calls: Mutex<Vec<(String, Option<Map<String, Value>>)>>,
    in_flight: AtomicUsize,
    pub max_in_flight: AtomicUsize,
    pub closed: AtomicBool,
}

impl ToolServerStats {
    pub fn call_names(&self) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .map(|(name, _)| name.clone())
            .collect()
    }
}

/// In-process MCP server speaking through the [`McpTransport`] seam.
pub struct ScriptedMcpServer {
    tools: Vec<Value>,
    results: HashMap<String, Value>,
    delays: HashMap<String, Duration>,
    page_size: Option<usize>,
    lists_tools: bool,
    stats: Arc<ToolServerStats>,
}

impl ScriptedMcpServer {
    pub fn new() -> Self {
        Self {
            tools: Vec::new(),
            results: HashMap::new(),
            delays: HashMap::new(),
            page_size: None,
            lists_tools: true,
            stats: Arc::new(ToolServerStats::default()),
        }
    }

    pub fn with_tool(mut self, name: &str, input_schema: Value) -> Self {
        self.tools.push(json!({
            "name": name,
            "description": format!("{name} tool"),
            "inputSchema": input_schema,
        }));
        self
    }

    /// `result` is the raw `tools/call` result object.
    pub fn with_result(mut self, name: &str, result: Value) -> Self {
        self.results.insert(name.to_string(), result);
        self
    }

    pub fn with_delay(mut self, name: &str, delay: Duration) -> Self {
        self.delays.insert(name.to_string(), delay);
        self
    }

    pub fn with_page_size(mut self, size: usize) -> Self {
        self.page_size = Some(size);
        self
    }

    pub fn without_tool_listing(mut self) -> Self {
        self.lists_tools = false;
        self
    }

    pub fn into_transport(self) -> (Box<dyn McpTransport>, Arc<ToolServerStats>) {
        let stats = self.stats.clone();
        (
            Box::new(ScriptedTransport {
                server: self,
                next_id: 0,
            }),
            stats,
        )
    }

    fn list_page(&self, cursor: Option<String>) -> Value {
        let start = cursor.and_then(|cursor| cursor.parse().ok()).unwrap_or(0usize);
        let end = match self.page_size {
            Some(size) => (start + size).min(self.tools.len()),
            None => self.tools.len(),
        };
        let mut page = json!({"tools": self.tools[start..end].to_vec()});
        if end < self.tools.len() {
            page["nextCursor"] = json!(end.to_string());
        }
        page
    }
}

struct ScriptedTransport {
    server: ScriptedMcpServer,
    next_id: i64,
}

fn response(id: i64, result: Value) -> ServerMessage {
    serde_json::from_value(json!({"jsonrpc": "2.0", "id": id, "result": result}))
        .expect("scripted response")
}

fn rpc_error(id: i64, code: i64, message: &str) -> ServerMessage {
    serde_json::from_value(json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": {"code": code, "message": message}
    }))
    .expect("scripted error")
}

#[async_trait]
impl McpTransport for ScriptedTransport {
    async fn send_request(&mut self, request: RequestFromClient) -> Result<ServerMessage, String> {
        let id = self.next_id;
        self.next_id += 1;
        let server = &self.server;
        match request {
            RequestFromClient::InitializeRequest(_) => Ok(response(
                id,
                json!({
                    "protocolVersion": "2025-06-18",
                    "capabilities": {"tools": {}},
                    "serverInfo": {"name": "scripted", "version": "0.0.1"}
                }),
            )),
            RequestFromClient::ListToolsRequest(params) if server.lists_tools => Ok(response(
                id,
                server.list_page(params.and_then(|params| params.cursor)),
            )),
            RequestFromClient::CallToolRequest(params) => {
                let stats = &server.stats;
                stats
                    .calls
                    .lock()
                    .unwrap()
                    .push((params.name.clone(), params.arguments.clone()));
                let running = stats.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                stats.max_in_flight.fetch_max(running, Ordering::SeqCst);
                if let Some(delay) = server.delays.get(&params.name) {
                    tokio::time::sleep(*delay).await;
                }
                stats.in_flight.fetch_sub(1, Ordering::SeqCst);
                let result = server.results.get(&params.name).cloned().unwrap_or_else(
                    || json!({"content": [{"type": "text", "text": "ok"}]}),
                );
                Ok(response(id, result))
            }
            _ => Ok(rpc_error(id, -32601, "Method not found")),
        }
    }

    async fn send_notification(
        &mut self,
        _notification: NotificationFromClient,
    ) -> Result<(), String> {
        Ok(())
    }

    async fn close(&mut self) {
        self.server.stats.closed.store(true, Ordering::SeqCst);
    }
}
