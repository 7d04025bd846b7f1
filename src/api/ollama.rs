//! Ollama `/api/chat`, `/api/tags` and `/api/show` payloads.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::ChatToolDefinition;

#[derive(Serialize)]
pub struct OllamaChatRequest {
    pub model: String,
    pub messages: Vec<OllamaMessage>,
    pub stream: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<ChatToolDefinition>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub options: Option<OllamaOptions>,
}

#[derive(Serialize)]
pub struct OllamaOptions {
    pub num_ctx: u32,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
pub struct OllamaMessage {
    pub role: String,
    #[serde(default)]
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<OllamaToolCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct OllamaToolCall {
    pub function: OllamaFunctionCall,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct OllamaFunctionCall {
    pub name: String,
    #[serde(default)]
    pub arguments: Value,
}

/// Both the non-streaming body and each streamed line.
#[derive(Debug, Deserialize)]
pub struct OllamaChatResponse {
    #[serde(default)]
    pub message: Option<OllamaMessage>,
    #[serde(default)]
    pub done: bool,
    #[serde(default)]
    pub done_reason: Option<String>,
    #[serde(default)]
    pub prompt_eval_count: Option<u64>,
    #[serde(default)]
    pub eval_count: Option<u64>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct OllamaTags {
    #[serde(default)]
    pub models: Vec<OllamaModelTag>,
}

#[derive(Debug, Deserialize)]
pub struct OllamaModelTag {
    pub name: String,
}

#[derive(Serialize)]
pub struct OllamaShowRequest<'a> {
    pub model: &'a str,
}

#[derive(Debug, Deserialize, Default)]
pub struct OllamaShowResponse {
    #[serde(default)]
    pub details: OllamaModelDetails,
    #[serde(default)]
    pub model_info: serde_json::Map<String, Value>,
}

#[derive(Debug, Deserialize, Default)]
pub struct OllamaModelDetails {
    #[serde(default)]
    pub family: Option<String>,
}

impl OllamaShowResponse {
    /// The trained context window, keyed by architecture family in
    /// `model_info` (for example `llama.context_length`).
    pub fn context_length(&self) -> Option<u32> {
        let family = self.details.family.as_deref()?;
        let length = self
            .model_info
            .get(&format!("{family}.context_length"))?
            .as_u64()?;
        Some(u32::try_from(length).unwrap_or(u32::MAX))
    }
}
