//! watsonx.ai text chat and IBM Cloud IAM payloads.
//!
//! Chat messages and replies reuse the chat-completions types.

use serde::{Deserialize, Serialize};

use super::{ChatMessage, ChatToolDefinition};

#[derive(Serialize)]
pub struct WatsonxChatRequest {
    pub model_id: String,
    pub project_id: String,
    pub messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<ChatToolDefinition>>,
    pub max_tokens: u32,
}

#[derive(Debug, Deserialize)]
pub struct IamTokenResponse {
    pub access_token: String,
    /// Unix seconds.
    #[serde(default)]
    pub expiration: Option<i64>,
    #[serde(default)]
    pub expires_in: Option<i64>,
}
