//! A live connection to one MCP server.
//!
//! [`McpServerConnection::connect`] picks the transport from the server's
//! config, performs the `initialize` handshake and then exposes the two
//! operations the tool bridge needs: listing tools and calling one.

use rust_mcp_schema::schema_utils::{NotificationFromClient, RequestFromClient};
use rust_mcp_schema::{CallToolRequestParams, CallToolResult, InitializeResult, Tool};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::core::config::data::McpServerConfig;
use crate::core::constants::MCP_MAX_TOOL_LIST;
use crate::mcp::transport::{
    is_method_not_found, McpTransport, McpTransportKind, StdioTransport, StreamableHttpTransport,
};

pub(crate) mod protocol;

pub struct McpServerConnection {
    id: String,
    transport: Box<dyn McpTransport>,
    server_details: InitializeResult,
}

impl McpServerConnection {
    /// Starts or reaches the server and completes the handshake.
    pub async fn connect(
        id: &str,
        config: &McpServerConfig,
        http_client: &reqwest::Client,
    ) -> Result<Self, String> {
        let transport: Box<dyn McpTransport> = match McpTransportKind::from_config(config)? {
            McpTransportKind::Stdio => Box::new(StdioTransport::spawn(id, config)?),
            McpTransportKind::StreamableHttp => {
                let url = config
                    .url
                    .clone()
                    .ok_or_else(|| "MCP url is required for HTTP transports.".to_string())?;
                Box::new(StreamableHttpTransport::new(
                    id,
                    http_client.clone(),
                    url,
                    protocol::requested_protocol_version(config),
                ))
            }
        };
        Self::initialize(id, config, transport).await
    }

    /// Runs `initialize` followed by `notifications/initialized`.
    pub(crate) async fn initialize(
        id: &str,
        config: &McpServerConfig,
        mut transport: Box<dyn McpTransport>,
    ) -> Result<Self, String> {
        let response = transport
            .send_request(RequestFromClient::InitializeRequest(
                protocol::client_details_for(config),
            ))
            .await?;
        let server_details = protocol::parse_initialize_result(response)?;
        transport.set_protocol_version(&server_details.protocol_version);
        transport
            .send_notification(NotificationFromClient::InitializedNotification(None))
            .await?;
        debug!(
            server_id = %id,
            server = %server_details.server_info.name,
            protocol_version = %server_details.protocol_version,
            "MCP server initialized"
        );
        Ok(Self {
            id: id.to_string(),
            transport,
            server_details,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn server_name(&self) -> &str {
        &self.server_details.server_info.name
    }

    pub fn protocol_version(&self) -> &str {
        &self.server_details.protocol_version
    }

    /// Collects every page of `tools/list`. A server that does not
    /// implement the method simply has no tools.
    pub async fn list_tools(&mut self) -> Result<Vec<Tool>, String> {
        let mut tools = Vec::new();
        let mut cursor = None;

        for _ in 0..MCP_MAX_TOOL_LIST {
            let response = self
                .transport
                .send_request(RequestFromClient::ListToolsRequest(
                    protocol::paginated_params(cursor.take()),
                ))
                .await?;
            if is_method_not_found(&response) {
                debug!(server_id = %self.id, "MCP server does not list tools");
                return Ok(tools);
            }
            let page = protocol::parse_list_tools(response)?;
            tools.extend(page.tools);
            match page.next_cursor {
                Some(next) if !next.is_empty() => cursor = Some(next),
                _ => return Ok(tools),
            }
        }

        warn!(
            server_id = %self.id,
            pages = MCP_MAX_TOOL_LIST,
            "Stopped listing MCP tools at the page limit"
        );
        Ok(tools)
    }

    pub async fn call_tool(
        &mut self,
        name: &str,
        arguments: Option<Map<String, Value>>,
    ) -> Result<CallToolResult, String> {
        let mut params = CallToolRequestParams::new(name);
        if let Some(arguments) = arguments {
            params = params.with_arguments(arguments);
        }
        debug!(server_id = %self.id, tool = %name, "Calling MCP tool");
        let response = self
            .transport
            .send_request(RequestFromClient::CallToolRequest(params))
            .await?;
        protocol::parse_call_tool(response)
    }

    pub async fn close(&mut self) {
        self.transport.close().await;
    }
}
