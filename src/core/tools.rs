use async_trait::async_trait;
use serde_json::Value;

use crate::core::error::ToolExecutionError;
use crate::core::message::ToolCallRequest;

/// A tool exposed to providers, with the id of the server that owns it.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: Option<String>,
    pub input_schema: Value,
    pub server_origin: String,
}

/// Successful tool output in the form fed back to the model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolOutput {
    pub payload: String,
    /// The server ran the tool but reported a failure.
    pub is_error: bool,
}

/// Executes provider tool calls. Implemented by the MCP tool bridge.
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    /// Descriptors currently advertised to providers.
    fn exposed_tools(&self) -> Vec<ToolDescriptor>;

    async fn invoke(&self, call: &ToolCallRequest) -> Result<ToolOutput, ToolExecutionError>;
}

/// Executor used when tools are disabled for a turn.
pub struct NoTools;

#[async_trait]
impl ToolExecutor for NoTools {
    fn exposed_tools(&self) -> Vec<ToolDescriptor> {
        Vec::new()
    }

    async fn invoke(&self, call: &ToolCallRequest) -> Result<ToolOutput, ToolExecutionError> {
        Err(ToolExecutionError::new(
            &call.id,
            &call.name,
            crate::core::error::ToolFailure::NotAllowed,
        ))
    }
}
