//! The tool bridge: discovers tools from every configured MCP server and
//! executes provider tool calls against the server that owns them.
//!
//! Only tools named in a server's allow-list are ever exposed, and calls are
//! checked against the exposed set and the tool's input schema before
//! anything is sent to a server.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use rust_mcp_schema::{CallToolResult, ContentBlock as McpContent, Tool};
use serde_json::{Map, Value};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::core::config::data::Config;
use crate::core::constants::DEFAULT_TOOL_TIMEOUT;
use crate::core::error::{ToolDiscoveryError, ToolExecutionError, ToolFailure};
use crate::core::message::ToolCallRequest;
use crate::core::tools::{ToolDescriptor, ToolExecutor, ToolOutput};
use crate::mcp::client::McpServerConnection;
use crate::mcp::permissions::ToolAllowList;

struct BridgedTool {
    descriptor: ToolDescriptor,
    validator: jsonschema::Validator,
}

impl BridgedTool {
    fn new(server_id: &str, tool: Tool) -> Result<Self, String> {
        let input_schema = serde_json::to_value(&tool.input_schema).map_err(|err| err.to_string())?;
        let validator = jsonschema::validator_for(&input_schema)
            .map_err(|err| format!("tool `{}` has an unusable input schema: {err}", tool.name))?;
        Ok(Self {
            descriptor: ToolDescriptor {
                name: tool.name,
                description: tool.description,
                input_schema,
                server_origin: server_id.to_string(),
            },
            validator,
        })
    }

    /// Missing arguments count as an empty object.
    fn check_arguments(&self, arguments: &Value) -> Result<Map<String, Value>, String> {
        let empty = Value::Object(Map::new());
        let instance = match arguments {
            Value::Null => &empty,
            Value::Object(_) => arguments,
            other => return Err(format!("expected a JSON object, got {other}")),
        };
        let problems: Vec<String> = self
            .validator
            .iter_errors(instance)
            .map(|err| err.to_string())
            .collect();
        if !problems.is_empty() {
            return Err(problems.join("; "));
        }
        Ok(instance.as_object().cloned().unwrap_or_default())
    }
}

pub struct ToolBridge {
    /// Each connection sits behind its own lock so calls to one server are
    /// serialized. `None` once shut down.
    servers: BTreeMap<String, Mutex<Option<McpServerConnection>>>,
    tools: Vec<BridgedTool>,
    problems: Vec<ToolDiscoveryError>,
    timeout: Duration,
}

impl Default for ToolBridge {
    fn default() -> Self {
        Self::new(DEFAULT_TOOL_TIMEOUT)
    }
}

impl ToolBridge {
    pub fn new(timeout: Duration) -> Self {
        Self {
            servers: BTreeMap::new(),
            tools: Vec::new(),
            problems: Vec::new(),
            timeout,
        }
    }

    /// Connects to every enabled server in id order. A server that fails
    /// to start, connect or list is recorded as a problem and contributes
    /// no tools.
    pub async fn discover(config: &Config, http_client: &reqwest::Client) -> Self {
        let mut bridge = Self::new(config.tool_timeout());
        for (id, server) in config.enabled_mcp_servers() {
            let allow = ToolAllowList::from_config(server);
            if allow.is_empty() {
                warn!(server_id = %id, "MCP server has no allowed_tools; not connecting");
                continue;
            }
            let connected = tokio::time::timeout(
                bridge.timeout,
                McpServerConnection::connect(id, server, http_client),
            )
            .await;
            match connected {
                Ok(Ok(connection)) => bridge.attach(id, &allow, connection).await,
                Ok(Err(message)) => bridge.record_problem(id, message),
                Err(_) => {
                    let message = format!("timed out connecting after {:?}", bridge.timeout);
                    bridge.record_problem(id, message);
                }
            }
        }
        debug!(
            servers = bridge.servers.len(),
            tools = bridge.tools.len(),
            problems = bridge.problems.len(),
            "Tool discovery finished"
        );
        bridge
    }

    /// Lists the connection's tools and exposes the permitted ones.
    pub(crate) async fn attach(
        &mut self,
        id: &str,
        allow: &ToolAllowList,
        mut connection: McpServerConnection,
    ) {
        let listed = match tokio::time::timeout(self.timeout, connection.list_tools()).await {
            Ok(Ok(tools)) => tools,
            Ok(Err(message)) => {
                connection.close().await;
                self.record_problem(id, format!("failed to list tools: {message}"));
                return;
            }
            Err(_) => {
                connection.close().await;
                self.record_problem(id, format!("timed out listing tools after {:?}", self.timeout));
                return;
            }
        };

        let offered = listed.len();
        let before = self.tools.len();
        for tool in listed {
            if !allow.permits(&tool.name) {
                debug!(server_id = %id, tool = %tool.name, "Tool not in allow-list; withheld");
                continue;
            }
            if let Some(owner) = self.owner_of(&tool.name) {
                let message = format!(
                    "tool `{}` is already provided by server {owner}; skipped",
                    tool.name
                );
                self.record_problem(id, message);
                continue;
            }
            match BridgedTool::new(id, tool) {
                Ok(tool) => self.tools.push(tool),
                Err(message) => self.record_problem(id, message),
            }
        }
        debug!(
            server_id = %id,
            server = %connection.server_name(),
            offered,
            exposed = self.tools.len() - before,
            "Attached MCP server"
        );
        self.servers
            .insert(id.to_string(), Mutex::new(Some(connection)));
    }

    fn owner_of(&self, tool_name: &str) -> Option<String> {
        self.find(tool_name)
            .map(|tool| tool.descriptor.server_origin.clone())
    }

    fn find(&self, tool_name: &str) -> Option<&BridgedTool> {
        self.tools
            .iter()
            .find(|tool| tool.descriptor.name == tool_name)
    }

    fn record_problem(&mut self, server_id: &str, message: String) {
        warn!(server_id = %server_id, error = %message, "MCP server unavailable for tools");
        self.problems.push(ToolDiscoveryError {
            server_id: server_id.to_string(),
            message,
        });
    }

    pub fn problems(&self) -> &[ToolDiscoveryError] {
        &self.problems
    }

    pub fn server_ids(&self) -> impl Iterator<Item = &str> {
        self.servers.keys().map(String::as_str)
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Closes every connection. Later invocations fail as unavailable.
    pub async fn shutdown(&self) {
        for (id, slot) in &self.servers {
            if let Some(mut connection) = slot.lock().await.take() {
                debug!(server_id = %id, "Closing MCP server");
                connection.close().await;
            }
        }
    }
}

#[async_trait]
impl ToolExecutor for ToolBridge {
    fn exposed_tools(&self) -> Vec<ToolDescriptor> {
        self.tools
            .iter()
            .map(|tool| tool.descriptor.clone())
            .collect()
    }

    async fn invoke(&self, call: &ToolCallRequest) -> Result<ToolOutput, ToolExecutionError> {
        let fail = |kind: ToolFailure| ToolExecutionError::new(&call.id, &call.name, kind);

        let Some(tool) = self.find(&call.name) else {
            warn!(tool = %call.name, call_id = %call.id, "Refusing call to a tool that is not exposed");
            return Err(fail(ToolFailure::NotAllowed));
        };
        let arguments = tool
            .check_arguments(&call.arguments)
            .map_err(|detail| fail(ToolFailure::InvalidArguments(detail)))?;

        let server_id = &tool.descriptor.server_origin;
        let unavailable = || {
            fail(ToolFailure::ServerUnavailable {
                server_id: server_id.clone(),
            })
        };
        let slot = self.servers.get(server_id).ok_or_else(unavailable)?;
        let mut guard = slot.lock().await;
        let connection = guard.as_mut().ok_or_else(unavailable)?;

        let result = tokio::time::timeout(
            self.timeout,
            connection.call_tool(&call.name, Some(arguments)),
        )
        .await
        .map_err(|_| fail(ToolFailure::Timeout(self.timeout)))?
        .map_err(|message| fail(ToolFailure::Server(message)))?;

        Ok(tool_output(result))
    }
}

/// Text content is joined with newlines; anything else is kept as JSON.
fn tool_output(result: CallToolResult) -> ToolOutput {
    let payload = result
        .content
        .iter()
        .map(|block| match block {
            McpContent::TextContent(text) => text.text.clone(),
            other => serde_json::to_string(other).unwrap_or_default(),
        })
        .collect::<Vec<_>>()
        .join("\n");
    ToolOutput {
        payload,
        is_error: result.is_error.unwrap_or(false),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::data::McpServerConfig;
    use crate::utils::test_utils::{tool_call, ScriptedMcpServer, ToolServerStats};
    use serde_json::json;
    use std::sync::atomic::Ordering;
    use std::sync::Arc;

    async fn connection(
        id: &str,
        server: ScriptedMcpServer,
    ) -> (McpServerConnection, Arc<ToolServerStats>) {
        let (transport, stats) = server.into_transport();
        let config = McpServerConfig::stdio("unused", Vec::new());
        let connection = McpServerConnection::initialize(id, &config, transport)
            .await
            .expect("initialize");
        (connection, stats)
    }

    fn adder_schema() -> Value {
        json!({
            "type": "object",
            "properties": {"a": {"type": "number"}, "b": {"type": "number"}},
            "required": ["a", "b"]
        })
    }

    #[tokio::test]
    async fn only_allowed_tools_are_exposed_or_called() {
        let (calc, stats) = connection(
            "calc",
            ScriptedMcpServer::new()
                .with_tool("add", adder_schema())
                .with_tool("delete_everything", json!({"type": "object"})),
        )
        .await;
        let mut bridge = ToolBridge::default();
        bridge
            .attach("calc", &ToolAllowList::new(["add"]), calc)
            .await;

        let names: Vec<String> = bridge
            .exposed_tools()
            .into_iter()
            .map(|tool| tool.name)
            .collect();
        assert_eq!(names, vec!["add"]);
        assert_eq!(bridge.exposed_tools()[0].server_origin, "calc");

        let err = bridge
            .invoke(&tool_call("call_1", "delete_everything", json!({})))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ToolFailure::NotAllowed);
        assert_eq!(err.call_id, "call_1");
        assert!(stats.call_names().is_empty());
    }

    #[tokio::test]
    async fn first_server_keeps_a_duplicate_name() {
        let (alpha, alpha_stats) = connection(
            "alpha",
            ScriptedMcpServer::new().with_tool("search", json!({"type": "object"})),
        )
        .await;
        let (beta, beta_stats) = connection(
            "beta",
            ScriptedMcpServer::new().with_tool("search", json!({"type": "object"})),
        )
        .await;
        let allow = ToolAllowList::new(["search"]);
        let mut bridge = ToolBridge::default();
        bridge.attach("alpha", &allow, alpha).await;
        bridge.attach("beta", &allow, beta).await;

        assert_eq!(bridge.exposed_tools().len(), 1);
        assert_eq!(bridge.problems().len(), 1);
        assert_eq!(bridge.problems()[0].server_id, "beta");
        assert!(bridge.problems()[0].message.contains("alpha"));

        bridge
            .invoke(&tool_call("call_1", "search", json!({})))
            .await
            .expect("invoke");
        assert_eq!(alpha_stats.call_names(), vec!["search"]);
        assert!(beta_stats.call_names().is_empty());
    }

    #[tokio::test]
    async fn arguments_are_validated_before_execution() {
        let (calc, stats) = connection(
            "calc",
            ScriptedMcpServer::new().with_tool("add", adder_schema()),
        )
        .await;
        let mut bridge = ToolBridge::default();
        bridge
            .attach("calc", &ToolAllowList::new(["add"]), calc)
            .await;

        let err = bridge
            .invoke(&tool_call("call_1", "add", json!({"a": "two"})))
            .await
            .unwrap_err();
        assert!(matches!(err.kind, ToolFailure::InvalidArguments(_)));

        let err = bridge
            .invoke(&tool_call("call_2", "add", json!("a=2, b=2")))
            .await
            .unwrap_err();
        assert!(matches!(err.kind, ToolFailure::InvalidArguments(_)));
        assert!(stats.call_names().is_empty());

        bridge
            .invoke(&tool_call("call_3", "add", json!({"a": 2, "b": 2})))
            .await
            .expect("valid call");
        let calls = stats.calls.lock().unwrap().clone();
        assert_eq!(calls[0].1, json!({"a": 2, "b": 2}).as_object().cloned());
    }

    #[tokio::test]
    async fn result_content_is_flattened_and_error_flag_kept() {
        let (server, _) = connection(
            "media",
            ScriptedMcpServer::new()
                .with_tool("describe", json!({"type": "object"}))
                .with_tool("fail", json!({"type": "object"}))
                .with_result(
                    "describe",
                    json!({"content": [
                        {"type": "text", "text": "first"},
                        {"type": "text", "text": "second"},
                        {"type": "image", "data": "AQID", "mimeType": "image/png"}
                    ]}),
                )
                .with_result(
                    "fail",
                    json!({"content": [{"type": "text", "text": "disk full"}], "isError": true}),
                ),
        )
        .await;
        let mut bridge = ToolBridge::default();
        bridge
            .attach("media", &ToolAllowList::new(["describe", "fail"]), server)
            .await;

        let output = bridge
            .invoke(&tool_call("call_1", "describe", Value::Null))
            .await
            .expect("invoke");
        let lines: Vec<&str> = output.payload.lines().collect();
        assert_eq!(&lines[..2], &["first", "second"]);
        let image: Value = serde_json::from_str(lines[2]).expect("image block as JSON");
        assert_eq!(image["mimeType"], "image/png");
        assert!(!output.is_error);

        let output = bridge
            .invoke(&tool_call("call_2", "fail", json!({})))
            .await
            .expect("invoke");
        assert_eq!(output.payload, "disk full");
        assert!(output.is_error);
    }

    #[tokio::test]
    async fn slow_tool_times_out() {
        let (server, _) = connection(
            "slow",
            ScriptedMcpServer::new()
                .with_tool("sleep", json!({"type": "object"}))
                .with_delay("sleep", Duration::from_secs(5)),
        )
        .await;
        let mut bridge = ToolBridge::new(Duration::from_millis(50));
        bridge
            .attach("slow", &ToolAllowList::new(["sleep"]), server)
            .await;

        let err = bridge
            .invoke(&tool_call("call_9", "sleep", json!({})))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ToolFailure::Timeout(Duration::from_millis(50)));
        assert_eq!(err.call_id, "call_9");
    }

    #[tokio::test]
    async fn calls_to_one_server_are_serialized() {
        let (server, stats) = connection(
            "calc",
            ScriptedMcpServer::new()
                .with_tool("add", json!({"type": "object"}))
                .with_delay("add", Duration::from_millis(30)),
        )
        .await;
        let mut bridge = ToolBridge::default();
        bridge
            .attach("calc", &ToolAllowList::new(["add"]), server)
            .await;

        let first = tool_call("call_1", "add", json!({}));
        let second = tool_call("call_2", "add", json!({}));
        let (a, b) = tokio::join!(bridge.invoke(&first), bridge.invoke(&second));
        assert!(a.is_ok() && b.is_ok());
        assert_eq!(stats.call_names().len(), 2);
        assert_eq!(stats.max_in_flight.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn shutdown_closes_servers() {
        let (server, stats) = connection(
            "calc",
            ScriptedMcpServer::new().with_tool("add", json!({"type": "object"})),
        )
        .await;
        let mut bridge = ToolBridge::default();
        bridge
            .attach("calc", &ToolAllowList::new(["add"]), server)
            .await;

        bridge.shutdown().await;
        assert!(stats.closed.load(Ordering::SeqCst));
        let err = bridge
            .invoke(&tool_call("call_1", "add", json!({})))
            .await
            .unwrap_err();
        assert_eq!(
            err.kind,
            ToolFailure::ServerUnavailable {
                server_id: "calc".to_string()
            }
        );
    }

    #[tokio::test]
    async fn discovery_records_unreachable_servers() {
        let mut config = Config::default();
        config.mcp_servers.insert(
            "broken".to_string(),
            McpServerConfig::stdio("/definitely-missing-command", Vec::new())
                .with_allowed_tools(["add"]),
        );
        config.mcp_servers.insert(
            "unlisted".to_string(),
            McpServerConfig::stdio("/also-missing", Vec::new()),
        );
        config.mcp_servers.insert(
            "off".to_string(),
            McpServerConfig {
                enabled: Some(false),
                ..McpServerConfig::stdio("/also-missing", Vec::new()).with_allowed_tools(["x"])
            },
        );

        let bridge = ToolBridge::discover(&config, &reqwest::Client::new()).await;
        assert!(bridge.exposed_tools().is_empty());
        assert_eq!(bridge.server_ids().count(), 0);
        let ids: Vec<&str> = bridge
            .problems()
            .iter()
            .map(|problem| problem.server_id.as_str())
            .collect();
        assert_eq!(ids, vec!["broken"]);
    }
}
