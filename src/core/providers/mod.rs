//! Provider adapters
//!
//! Each adapter translates the neutral message sequence into one provider's
//! wire call and maps the reply back. The set of adapters is closed: adding
//! a provider means adding a [`ProviderKind`] and a [`Provider`] variant.

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::core::chat_stream::TurnStream;
use crate::core::error::ProviderError;
use crate::core::message::{ContentBlock, FinishReason, Message, TokenUsage, ToolCallRequest};
use crate::core::registry::ProviderCapability;
use crate::core::tools::ToolDescriptor;

pub mod anthropic;
pub(crate) mod http;
pub mod ollama;
pub mod openai;
pub mod watsonx;

pub use anthropic::AnthropicProvider;
pub use ollama::OllamaProvider;
pub use openai::OpenAiProvider;
pub use watsonx::WatsonxProvider;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Ollama,
    Anthropic,
    OpenAi,
    Watsonx,
}

impl ProviderKind {
    pub const ALL: [ProviderKind; 4] = [
        ProviderKind::Ollama,
        ProviderKind::Anthropic,
        ProviderKind::OpenAi,
        ProviderKind::Watsonx,
    ];

    pub fn id(self) -> &'static str {
        match self {
            ProviderKind::Ollama => "ollama",
            ProviderKind::Anthropic => "anthropic",
            ProviderKind::OpenAi => "openai",
            ProviderKind::Watsonx => "watsonx",
        }
    }

    pub fn display_name(self) -> &'static str {
        match self {
            ProviderKind::Ollama => "Ollama",
            ProviderKind::Anthropic => "Anthropic",
            ProviderKind::OpenAi => "OpenAI",
            ProviderKind::Watsonx => "watsonx",
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.display_name())
    }
}

impl FromStr for ProviderKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        ProviderKind::ALL
            .into_iter()
            .find(|kind| kind.id().eq_ignore_ascii_case(value.trim()))
            .ok_or_else(|| format!("unknown provider: {value}"))
    }
}

/// Everything an adapter needs for one call.
#[derive(Debug, Clone, Copy)]
pub struct TurnRequest<'a> {
    pub model: &'a str,
    pub messages: &'a [Message],
    pub tools: &'a [ToolDescriptor],
    pub capability: ProviderCapability,
    pub system_prompt: Option<&'a str>,
    pub context_length: Option<u32>,
}

impl<'a> TurnRequest<'a> {
    pub fn new(model: &'a str, messages: &'a [Message], capability: ProviderCapability) -> Self {
        Self {
            model,
            messages,
            tools: &[],
            capability,
            system_prompt: None,
            context_length: None,
        }
    }

    pub fn with_tools(mut self, tools: &'a [ToolDescriptor]) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_system_prompt(mut self, system_prompt: Option<&'a str>) -> Self {
        self.system_prompt = system_prompt;
        self
    }

    pub fn with_context_length(mut self, context_length: Option<u32>) -> Self {
        self.context_length = context_length;
        self
    }

    /// Messages that belong on the wire.
    pub fn transmitted(&self) -> impl Iterator<Item = &'a Message> {
        let messages: &'a [Message] = self.messages;
        messages.iter().filter(|message| message.is_transmitted())
    }

    /// Tools are only sent to models that can call them.
    pub fn wire_tools(&self) -> &'a [ToolDescriptor] {
        if self.capability.supports_tools {
            self.tools
        } else {
            &[]
        }
    }

    /// Rejects image blocks for models without image input.
    pub fn check_content(&self, provider: ProviderKind) -> Result<(), ProviderError> {
        if self.capability.supports_images {
            return Ok(());
        }
        let has_image = self
            .transmitted()
            .flat_map(|message| message.content.iter())
            .any(ContentBlock::is_image);
        if has_image {
            return Err(ProviderError::UnsupportedContent {
                provider,
                model: self.model.to_string(),
                detail: "model does not accept image input".to_string(),
            });
        }
        Ok(())
    }
}

/// Discriminated outcome of one provider call.
#[derive(Debug, Clone, PartialEq)]
pub enum ReplyKind {
    AssistantTurn {
        text: String,
    },
    /// The provider wants tools run. `text` is any prose emitted alongside.
    ToolCallRequest {
        text: String,
        calls: Vec<ToolCallRequest>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProviderReply {
    pub kind: ReplyKind,
    pub usage: TokenUsage,
    pub finish_reason: FinishReason,
}

impl ProviderReply {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            kind: ReplyKind::AssistantTurn { text: text.into() },
            usage: TokenUsage::default(),
            finish_reason: FinishReason::Stop,
        }
    }

    pub fn tool_calls(calls: Vec<ToolCallRequest>) -> Self {
        Self {
            kind: ReplyKind::ToolCallRequest {
                text: String::new(),
                calls,
            },
            usage: TokenUsage::default(),
            finish_reason: FinishReason::ToolCalls,
        }
    }

    pub fn with_usage(mut self, usage: TokenUsage) -> Self {
        self.usage = usage;
        self
    }
}

pub(crate) fn finish_reason_from(raw: Option<&str>) -> FinishReason {
    match raw {
        None | Some("stop") | Some("end_turn") | Some("stop_sequence") => FinishReason::Stop,
        Some("length") | Some("max_tokens") => FinishReason::Length,
        Some("tool_calls") | Some("tool_use") | Some("function_call") => FinishReason::ToolCalls,
        Some(_) => FinishReason::Other,
    }
}

/// Tool arguments arrive as JSON text. Anything unparsable is kept as a
/// string so schema validation rejects it with a visible error.
pub(crate) fn parse_tool_arguments(raw: &str) -> serde_json::Value {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return serde_json::Value::Object(serde_json::Map::new());
    }
    serde_json::from_str(trimmed).unwrap_or_else(|_| serde_json::Value::String(trimmed.to_string()))
}

/// Capability interface every adapter implements.
#[async_trait]
pub trait ChatProvider: Send + Sync {
    fn kind(&self) -> ProviderKind;

    async fn send_turn(&self, request: &TurnRequest<'_>) -> Result<ProviderReply, ProviderError>;

    /// Adapters without native streaming yield the whole reply at once.
    async fn stream_turn(&self, request: &TurnRequest<'_>) -> Result<TurnStream, ProviderError> {
        let reply = self.send_turn(request).await?;
        Ok(TurnStream::from_reply(reply))
    }
}

pub enum Provider {
    Ollama(OllamaProvider),
    Anthropic(AnthropicProvider),
    OpenAi(OpenAiProvider),
    Watsonx(WatsonxProvider),
}

impl Provider {
    /// Builds the adapter for `kind`, reading credentials through `lookup`.
    pub fn connect(
        kind: ProviderKind,
        client: reqwest::Client,
        base_url: String,
        lookup: &dyn Fn(&str) -> Option<String>,
    ) -> Result<Self, ProviderError> {
        Ok(match kind {
            ProviderKind::Ollama => Provider::Ollama(OllamaProvider::new(client, base_url)),
            ProviderKind::Anthropic => {
                Provider::Anthropic(AnthropicProvider::from_env(client, base_url, lookup)?)
            }
            ProviderKind::OpenAi => {
                Provider::OpenAi(OpenAiProvider::from_env(client, base_url, lookup)?)
            }
            ProviderKind::Watsonx => {
                Provider::Watsonx(WatsonxProvider::from_env(client, base_url, lookup)?)
            }
        })
    }

    fn inner(&self) -> &dyn ChatProvider {
        match self {
            Provider::Ollama(provider) => provider,
            Provider::Anthropic(provider) => provider,
            Provider::OpenAi(provider) => provider,
            Provider::Watsonx(provider) => provider,
        }
    }
}

#[async_trait]
impl ChatProvider for Provider {
    fn kind(&self) -> ProviderKind {
        self.inner().kind()
    }

    async fn send_turn(&self, request: &TurnRequest<'_>) -> Result<ProviderReply, ProviderError> {
        self.inner().send_turn(request).await
    }

    async fn stream_turn(&self, request: &TurnRequest<'_>) -> Result<TurnStream, ProviderError> {
        self.inner().stream_turn(request).await
    }
}
