//! Anthropic Messages API adapter.
//!
//! The system prompt travels in its own field, tool results are user-role
//! content blocks, and consecutive messages with the same wire role are
//! merged because the API requires strict alternation.

use std::collections::BTreeMap;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use tracing::debug;

use super::http::{self, construct_api_url, with_auth};
use super::{
    finish_reason_from, parse_tool_arguments, ChatProvider, ProviderKind, ProviderReply,
    ReplyKind, TurnRequest,
};
use crate::api::anthropic::{
    AnthropicContent, AnthropicMessage, AnthropicTool, BlockDelta, CacheControl, DocumentSource,
    ImageSource, MessagesRequest, MessagesResponse, ResponseBlock, StreamPayload,
};
use crate::core::chat_stream::{
    api_error_message, sse_data, truncated, StreamDecoder, StreamEvent, TurnStream,
};
use crate::core::error::ProviderError;
use crate::core::message::{ContentBlock, FinishReason, Role, TokenUsage, ToolCallRequest};

const KIND: ProviderKind = ProviderKind::Anthropic;
const MAX_TOKENS: u32 = 8192;
pub const ANTHROPIC_API_KEY_ENV: &str = "ANTHROPIC_API_KEY";

pub struct AnthropicProvider {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl AnthropicProvider {
    pub fn new(client: reqwest::Client, base_url: String, api_key: String) -> Self {
        Self {
            client,
            base_url,
            api_key,
        }
    }

    pub fn from_env(
        client: reqwest::Client,
        base_url: String,
        lookup: &dyn Fn(&str) -> Option<String>,
    ) -> Result<Self, ProviderError> {
        let api_key = http::require_env(KIND, lookup, ANTHROPIC_API_KEY_ENV)?;
        Ok(Self::new(client, base_url, api_key))
    }

    fn build_request(&self, request: &TurnRequest<'_>, stream: bool) -> MessagesRequest {
        MessagesRequest {
            model: request.model.to_string(),
            max_tokens: MAX_TOKENS,
            system: request.system_prompt.map(str::to_string),
            messages: to_anthropic_messages(request),
            tools: request
                .wire_tools()
                .iter()
                .map(|tool| AnthropicTool {
                    name: tool.name.clone(),
                    description: tool.description.clone(),
                    input_schema: tool.input_schema.clone(),
                })
                .collect(),
            stream,
        }
    }

    async fn post(&self, body: &MessagesRequest) -> Result<reqwest::Response, ProviderError> {
        debug!(
            model = %body.model,
            messages = body.messages.len(),
            tools = body.tools.len(),
            stream = body.stream,
            "Sending Anthropic messages request"
        );
        let url = construct_api_url(&self.base_url, "messages");
        let request = with_auth(self.client.post(url), KIND, &self.api_key).json(body);
        http::send(KIND, request).await
    }
}

#[async_trait]
impl ChatProvider for AnthropicProvider {
    fn kind(&self) -> ProviderKind {
        KIND
    }

    async fn send_turn(&self, request: &TurnRequest<'_>) -> Result<ProviderReply, ProviderError> {
        request.check_content(KIND)?;
        let body = self.build_request(request, false);
        let response = self.post(&body).await?;
        let reply: MessagesResponse = http::read_json(KIND, response).await?;

        let mut text = String::new();
        let mut calls = Vec::new();
        for block in reply.content {
            match block {
                ResponseBlock::Text { text: chunk } => text.push_str(&chunk),
                ResponseBlock::ToolUse { id, name, input } => calls.push(ToolCallRequest {
                    id,
                    name,
                    arguments: input,
                }),
                ResponseBlock::Other => {}
            }
        }
        let kind = if calls.is_empty() {
            ReplyKind::AssistantTurn { text }
        } else {
            ReplyKind::ToolCallRequest { text, calls }
        };
        Ok(ProviderReply {
            kind,
            usage: TokenUsage {
                input_tokens: reply.usage.input_tokens,
                output_tokens: reply.usage.output_tokens,
            },
            finish_reason: finish_reason_from(reply.stop_reason.as_deref()),
        })
    }

    async fn stream_turn(&self, request: &TurnRequest<'_>) -> Result<TurnStream, ProviderError> {
        request.check_content(KIND)?;
        let body = self.build_request(request, true);
        let response = self.post(&body).await?;
        Ok(TurnStream::spawn(
            KIND,
            response,
            AnthropicStreamDecoder::default(),
        ))
    }
}

fn to_anthropic_messages(request: &TurnRequest<'_>) -> Vec<AnthropicMessage> {
    let mut messages: Vec<AnthropicMessage> = Vec::new();
    for message in request.transmitted() {
        let (role, content): (&'static str, Vec<AnthropicContent>) = match message.role {
            Role::User => ("user", message.content.iter().filter_map(to_content).collect()),
            Role::Assistant => (
                "assistant",
                message.content.iter().filter_map(to_content).collect(),
            ),
            Role::Tool => (
                "user",
                message
                    .content
                    .iter()
                    .filter_map(|block| match block {
                        ContentBlock::ToolResult {
                            call_id,
                            payload,
                            is_error,
                        } => Some(AnthropicContent::ToolResult {
                            tool_use_id: call_id.clone(),
                            content: payload.clone(),
                            is_error: *is_error,
                            cache_control: None,
                        }),
                        _ => None,
                    })
                    .collect(),
            ),
        };
        if content.is_empty() {
            continue;
        }
        match messages.last_mut() {
            Some(last) if last.role == role => last.content.extend(content),
            _ => messages.push(AnthropicMessage { role, content }),
        }
    }
    set_cache_point(&mut messages);
    messages
}

/// Caches the prompt up to the end of a trailing user message.
fn set_cache_point(messages: &mut [AnthropicMessage]) {
    let Some(last) = messages.last_mut().filter(|message| message.role == "user") else {
        return;
    };
    if let Some(block) = last.content.last_mut() {
        block.set_cache_point(CacheControl::EPHEMERAL);
    }
}

fn to_content(block: &ContentBlock) -> Option<AnthropicContent> {
    match block {
        ContentBlock::Text { text } if text.is_empty() => None,
        ContentBlock::Text { text } => Some(AnthropicContent::text(text.clone())),
        ContentBlock::File { name, contents } => Some(AnthropicContent::Document {
            source: DocumentSource::plain_text(contents.clone()),
            title: Some(name.clone()),
            cache_control: None,
        }),
        ContentBlock::Image {
            mime_type, data, ..
        } => Some(AnthropicContent::Image {
            source: ImageSource {
                kind: "base64",
                media_type: mime_type.clone(),
                data: STANDARD.encode(data),
            },
            cache_control: None,
        }),
        ContentBlock::ToolCall {
            id,
            name,
            arguments,
        } => Some(AnthropicContent::ToolUse {
            id: id.clone(),
            name: name.clone(),
            input: arguments.clone(),
        }),
        ContentBlock::ToolResult { .. } => None,
    }
}

#[derive(Debug)]
struct PendingToolUse {
    id: String,
    name: String,
    initial_input: serde_json::Value,
    partial_json: String,
}

impl PendingToolUse {
    fn into_request(self) -> ToolCallRequest {
        let arguments = if self.partial_json.trim().is_empty() {
            match self.initial_input {
                serde_json::Value::Null => serde_json::Value::Object(serde_json::Map::new()),
                input => input,
            }
        } else {
            parse_tool_arguments(&self.partial_json)
        };
        ToolCallRequest {
            id: self.id,
            name: self.name,
            arguments,
        }
    }
}

/// Event-stream state machine. Tool input arrives as JSON fragments which
/// are only parsed once their block closes.
#[derive(Debug, Default)]
struct AnthropicStreamDecoder {
    tool_blocks: BTreeMap<usize, PendingToolUse>,
    usage: TokenUsage,
    stop_reason: Option<String>,
    stopped: bool,
}

impl StreamDecoder for AnthropicStreamDecoder {
    fn decode_line(
        &mut self,
        line: &str,
        out: &mut Vec<StreamEvent>,
    ) -> Result<bool, ProviderError> {
        let Some(payload) = sse_data(line) else {
            return Ok(false);
        };
        let event: StreamPayload = serde_json::from_str(payload)
            .map_err(|_| ProviderError::api(KIND, api_error_message(payload)))?;

        match event {
            StreamPayload::MessageStart { message } => {
                self.usage.input_tokens = message.usage.input_tokens;
                self.usage.output_tokens = message.usage.output_tokens;
            }
            StreamPayload::ContentBlockStart {
                index,
                content_block,
            } => match content_block {
                ResponseBlock::Text { text } if !text.is_empty() => {
                    out.push(StreamEvent::TextDelta(text))
                }
                ResponseBlock::ToolUse { id, name, input } => {
                    self.tool_blocks.insert(
                        index,
                        PendingToolUse {
                            id,
                            name,
                            initial_input: input,
                            partial_json: String::new(),
                        },
                    );
                }
                _ => {}
            },
            StreamPayload::ContentBlockDelta { index, delta } => match delta {
                BlockDelta::TextDelta { text } => {
                    if !text.is_empty() {
                        out.push(StreamEvent::TextDelta(text));
                    }
                }
                BlockDelta::InputJsonDelta { partial_json } => {
                    if let Some(block) = self.tool_blocks.get_mut(&index) {
                        block.partial_json.push_str(&partial_json);
                    }
                }
                BlockDelta::Other => {}
            },
            StreamPayload::ContentBlockStop { index } => {
                if let Some(block) = self.tool_blocks.remove(&index) {
                    out.push(StreamEvent::ToolCall(block.into_request()));
                }
            }
            StreamPayload::MessageDelta { delta, usage } => {
                if delta.stop_reason.is_some() {
                    self.stop_reason = delta.stop_reason;
                }
                if let Some(usage) = usage {
                    self.usage.output_tokens = usage.output_tokens;
                }
            }
            StreamPayload::MessageStop => {
                self.stopped = true;
                self.flush(out);
                return Ok(true);
            }
            StreamPayload::Error { error } => {
                return Err(match error.kind.as_str() {
                    "rate_limit_error" => ProviderError::RateLimited {
                        provider: KIND,
                        retry_after: None,
                        message: error.message,
                    },
                    "authentication_error" | "permission_error" => {
                        ProviderError::Authentication {
                            provider: KIND,
                            message: error.message,
                        }
                    }
                    _ => ProviderError::api(KIND, error.message),
                });
            }
            StreamPayload::Ping => {}
        }
        Ok(false)
    }

    fn finish(&mut self, _out: &mut Vec<StreamEvent>) -> Result<(), ProviderError> {
        if self.stopped {
            Ok(())
        } else {
            Err(truncated(KIND))
        }
    }
}

impl AnthropicStreamDecoder {
    fn flush(&mut self, out: &mut Vec<StreamEvent>) {
        for (_, block) in std::mem::take(&mut self.tool_blocks) {
            out.push(StreamEvent::ToolCall(block.into_request()));
        }
        out.push(StreamEvent::Usage(self.usage));
        let reason = finish_reason_from(self.stop_reason.take().as_deref());
        out.push(StreamEvent::Finished(reason));
    }
}
