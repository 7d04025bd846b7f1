//! OpenAI chat completions adapter.
//!
//! The message translation here is shared with watsonx, which accepts the
//! same schema.

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
use crate::api::{
    ChatCompletion, ChatContent, ChatContentPart, ChatImageUrl, ChatMessage, ChatRequest,
    ChatResponse, ChatStreamOptions, ChatToolCall, ChatToolCallFunction, ChatToolDefinition,
    ChatToolFunction, ChatUsage,
};
use crate::core::chat_stream::{
    api_error_message, sse_data, truncated, StreamDecoder, StreamEvent, TurnStream,
};
use crate::core::error::ProviderError;
use crate::core::message::{ContentBlock, FinishReason, Message, Role, TokenUsage, ToolCallRequest};
use crate::core::tools::ToolDescriptor;

const KIND: ProviderKind = ProviderKind::OpenAi;
pub const OPENAI_API_KEY_ENV: &str = "OPENAI_API_KEY";

pub struct OpenAiProvider {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl OpenAiProvider {
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
        let api_key = http::require_env(KIND, lookup, OPENAI_API_KEY_ENV)?;
        Ok(Self::new(client, base_url, api_key))
    }

    fn build_request(&self, request: &TurnRequest<'_>, stream: bool) -> ChatRequest {
        ChatRequest {
            model: request.model.to_string(),
            messages: to_chat_messages(request),
            stream,
            stream_options: stream.then_some(ChatStreamOptions {
                include_usage: true,
            }),
            tools: to_chat_tools(request.wire_tools()),
        }
    }

    async fn post(&self, body: &ChatRequest) -> Result<reqwest::Response, ProviderError> {
        debug!(
            model = %body.model,
            messages = body.messages.len(),
            tools = body.tools.as_ref().map_or(0, Vec::len),
            stream = body.stream,
            "Sending OpenAI chat request"
        );
        let url = construct_api_url(&self.base_url, "chat/completions");
        let request = with_auth(self.client.post(url), KIND, &self.api_key).json(body);
        http::send(KIND, request).await
    }
}

#[async_trait]
impl ChatProvider for OpenAiProvider {
    fn kind(&self) -> ProviderKind {
        KIND
    }

    async fn send_turn(&self, request: &TurnRequest<'_>) -> Result<ProviderReply, ProviderError> {
        request.check_content(KIND)?;
        let body = self.build_request(request, false);
        let response = self.post(&body).await?;
        let completion: ChatCompletion = http::read_json(KIND, response).await?;
        reply_from_completion(KIND, completion)
    }

    async fn stream_turn(&self, request: &TurnRequest<'_>) -> Result<TurnStream, ProviderError> {
        request.check_content(KIND)?;
        let body = self.build_request(request, true);
        let response = self.post(&body).await?;
        Ok(TurnStream::spawn(KIND, response, OpenAiStreamDecoder::default()))
    }
}

/// Neutral history to chat-completions messages. Each tool result becomes
/// its own `tool` message.
pub(crate) fn to_chat_messages(request: &TurnRequest<'_>) -> Vec<ChatMessage> {
    let mut messages = Vec::new();
    if let Some(system) = request.system_prompt {
        messages.push(ChatMessage::text("system", system));
    }
    for message in request.transmitted() {
        match message.role {
            Role::User => messages.push(user_message(message)),
            Role::Assistant => messages.push(assistant_message(message)),
            Role::Tool => {
                for block in &message.content {
                    if let ContentBlock::ToolResult {
                        call_id, payload, ..
                    } = block
                    {
                        messages.push(ChatMessage {
                            tool_call_id: Some(call_id.clone()),
                            ..ChatMessage::text("tool", payload.clone())
                        });
                    }
                }
            }
        }
    }
    messages
}

fn user_message(message: &Message) -> ChatMessage {
    if !message.has_images() {
        return ChatMessage::text("user", message.text());
    }
    let parts = message
        .content
        .iter()
        .filter_map(|block| match block {
            ContentBlock::Text { .. } | ContentBlock::File { .. } => {
                block.as_text().map(|text| ChatContentPart::Text {
                    text: text.into_owned(),
                })
            }
            ContentBlock::Image {
                mime_type, data, ..
            } => Some(ChatContentPart::ImageUrl {
                image_url: ChatImageUrl {
                    url: format!("data:{mime_type};base64,{}", STANDARD.encode(data)),
                },
            }),
            _ => None,
        })
        .collect();
    ChatMessage {
        role: "user".to_string(),
        content: Some(ChatContent::Parts(parts)),
        tool_call_id: None,
        tool_calls: None,
    }
}

fn assistant_message(message: &Message) -> ChatMessage {
    let tool_calls: Vec<ChatToolCall> = message
        .tool_calls()
        .map(|(id, name, arguments)| ChatToolCall {
            id: id.to_string(),
            kind: "function".to_string(),
            function: ChatToolCallFunction {
                name: name.to_string(),
                arguments: match arguments {
                    serde_json::Value::String(raw) => raw.clone(),
                    other => other.to_string(),
                },
            },
        })
        .collect();
    let text = message.text();
    ChatMessage {
        role: "assistant".to_string(),
        content: (!text.is_empty() || tool_calls.is_empty()).then_some(ChatContent::Text(text)),
        tool_call_id: None,
        tool_calls: (!tool_calls.is_empty()).then_some(tool_calls),
    }
}

pub(crate) fn to_chat_tools(tools: &[ToolDescriptor]) -> Option<Vec<ChatToolDefinition>> {
    if tools.is_empty() {
        return None;
    }
    Some(
        tools
            .iter()
            .map(|tool| ChatToolDefinition {
                kind: "function".to_string(),
                function: ChatToolFunction {
                    name: tool.name.clone(),
                    description: tool.description.clone(),
                    parameters: tool.input_schema.clone(),
                },
            })
            .collect(),
    )
}

fn usage_from(usage: Option<ChatUsage>) -> TokenUsage {
    usage
        .map(|usage| TokenUsage {
            input_tokens: usage.prompt_tokens,
            output_tokens: usage.completion_tokens,
        })
        .unwrap_or_default()
}

pub(crate) fn reply_from_completion(
    provider: ProviderKind,
    completion: ChatCompletion,
) -> Result<ProviderReply, ProviderError> {
    let usage = usage_from(completion.usage);
    let choice = completion
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| ProviderError::api(provider, "response contained no choices"))?;
    let text = choice.message.content.unwrap_or_default();
    let calls: Vec<ToolCallRequest> = choice
        .message
        .tool_calls
        .into_iter()
        .map(|call| ToolCallRequest {
            id: call.id,
            name: call.function.name,
            arguments: parse_tool_arguments(&call.function.arguments),
        })
        .collect();
    let kind = if calls.is_empty() {
        ReplyKind::AssistantTurn { text }
    } else {
        ReplyKind::ToolCallRequest { text, calls }
    };
    Ok(ProviderReply {
        kind,
        usage,
        finish_reason: finish_reason_from(choice.finish_reason.as_deref()),
    })
}

#[derive(Debug, Default)]
struct PendingToolCall {
    id: Option<String>,
    name: Option<String>,
    arguments: String,
}

/// SSE decoder. Tool calls arrive as fragments keyed by index and are
/// emitted once the body ends. A reply is complete after `[DONE]` or a
/// choice carrying a finish reason.
#[derive(Debug, Default)]
pub(crate) struct OpenAiStreamDecoder {
    pending: BTreeMap<u32, PendingToolCall>,
    usage: TokenUsage,
    finish_reason: Option<FinishReason>,
    done: bool,
}

impl StreamDecoder for OpenAiStreamDecoder {
    fn decode_line(
        &mut self,
        line: &str,
        out: &mut Vec<StreamEvent>,
    ) -> Result<bool, ProviderError> {
        let Some(payload) = sse_data(line) else {
            return Ok(false);
        };
        if payload == "[DONE]" {
            self.done = true;
            return Ok(true);
        }

        let value: serde_json::Value = serde_json::from_str(payload)
            .map_err(|_| ProviderError::api(KIND, api_error_message(payload)))?;
        if value.get("error").is_some() {
            return Err(ProviderError::api(KIND, api_error_message(payload)));
        }
        let chunk: ChatResponse = serde_json::from_value(value)
            .map_err(|err| ProviderError::api(KIND, format!("invalid stream chunk: {err}")))?;

        for choice in chunk.choices {
            if let Some(content) = choice.delta.content {
                if !content.is_empty() {
                    out.push(StreamEvent::TextDelta(content));
                }
            }
            for delta in choice.delta.tool_calls.unwrap_or_default() {
                let entry = self.pending.entry(delta.index.unwrap_or(0)).or_default();
                if let Some(id) = delta.id {
                    entry.id = Some(id);
                }
                if let Some(function) = delta.function {
                    if let Some(name) = function.name {
                        entry.name = Some(name);
                    }
                    if let Some(arguments) = function.arguments {
                        entry.arguments.push_str(&arguments);
                    }
                }
            }
            if let Some(reason) = choice.finish_reason {
                self.finish_reason = Some(finish_reason_from(Some(&reason)));
            }
        }
        if chunk.usage.is_some() {
            self.usage = usage_from(chunk.usage);
        }
        Ok(false)
    }

    fn finish(&mut self, out: &mut Vec<StreamEvent>) -> Result<(), ProviderError> {
        if !self.done && self.finish_reason.is_none() {
            return Err(truncated(KIND));
        }
        for (index, call) in std::mem::take(&mut self.pending) {
            out.push(StreamEvent::ToolCall(ToolCallRequest {
                id: call.id.unwrap_or_else(|| format!("tool-call-{index}")),
                name: call.name.unwrap_or_default(),
                arguments: parse_tool_arguments(&call.arguments),
            }));
        }
        out.push(StreamEvent::Usage(self.usage));
        if let Some(reason) = self.finish_reason {
            out.push(StreamEvent::Finished(reason));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::registry::ProviderCapability;
    use serde_json::json;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const VISION: ProviderCapability = ProviderCapability {
        supports_images: true,
        supports_tools: true,
    };

    fn history() -> Vec<Message> {
        vec![
            Message::user(vec![
                ContentBlock::Image {
                    mime_type: "image/png".to_string(),
                    data: vec![1, 2, 3],
                    name: Some("a.png".to_string()),
                },
                ContentBlock::text("what is this?"),
            ]),
            Message::new(
                Role::Assistant,
                vec![ContentBlock::ToolCall {
                    id: "call_1".to_string(),
                    name: "lookup".to_string(),
                    arguments: json!({"q": "x"}),
                }],
            ),
            Message::tool_result("call_1", "a square", false),
            Message::error_turn("rate limited"),
        ]
    }

    fn provider(base_url: String) -> OpenAiProvider {
        OpenAiProvider::new(reqwest::Client::new(), base_url, "sk-test".to_string())
    }

    #[test]
    fn request_encodes_images_tools_and_results() {
        let messages = history();
        let tools = vec![ToolDescriptor {
            name: "lookup".to_string(),
            description: Some("Look things up".to_string()),
            input_schema: json!({"type": "object"}),
            server_origin: "search".to_string(),
        }];
        let request = TurnRequest::new("gpt-4o", &messages, VISION)
            .with_tools(&tools)
            .with_system_prompt(Some("be brief"));
        let body = serde_json::to_value(provider(String::new()).build_request(&request, false))
            .unwrap();

        let wire = body["messages"].as_array().unwrap();
        assert_eq!(wire.len(), 4, "error turn must be skipped");
        assert_eq!(wire[0], json!({"role": "system", "content": "be brief"}));
        assert_eq!(
            wire[1]["content"][0],
            json!({"type": "image_url", "image_url": {"url": "data:image/png;base64,AQID"}})
        );
        assert_eq!(wire[1]["content"][1], json!({"type": "text", "text": "what is this?"}));
        assert!(wire[2].get("content").is_none());
        assert_eq!(wire[2]["tool_calls"][0]["function"]["arguments"], r#"{"q":"x"}"#);
        assert_eq!(
            wire[3],
            json!({"role": "tool", "content": "a square", "tool_call_id": "call_1"})
        );
        assert_eq!(body["tools"][0]["function"]["name"], "lookup");
        assert!(body.get("stream_options").is_none());
    }

    #[tokio::test]
    async fn send_turn_returns_tool_call_request() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(header("Authorization", "Bearer sk-test"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "choices": [{
                    "message": {
                        "role": "assistant",
                        "content": null,
                        "tool_calls": [{
                            "id": "call_9",
                            "type": "function",
                            "function": {"name": "add", "arguments": "{\"a\":2,\"b\":2}"}
                        }]
                    },
                    "finish_reason": "tool_calls"
                }],
                "usage": {"prompt_tokens": 12, "completion_tokens": 5}
            })))
            .mount(&server)
            .await;

        let messages = vec![Message::user(vec![ContentBlock::text("What's 2+2?")])];
        let request = TurnRequest::new("gpt-4.1", &messages, VISION);
        let reply = provider(server.uri()).send_turn(&request).await.unwrap();
        assert_eq!(reply.usage.input_tokens, 12);
        assert_eq!(reply.finish_reason, FinishReason::ToolCalls);
        assert_eq!(
            reply.kind,
            ReplyKind::ToolCallRequest {
                text: String::new(),
                calls: vec![ToolCallRequest {
                    id: "call_9".to_string(),
                    name: "add".to_string(),
                    arguments: json!({"a": 2, "b": 2}),
                }],
            }
        );
    }

    #[tokio::test]
    async fn stream_turn_yields_deltas_and_assembles_tool_calls() {
        let body = [
            r#"data: {"choices":[{"delta":{"content":"Hel"}}]}"#,
            r#"data:{"choices":[{"delta":{"content":"lo"}}]}"#,
            r#"data: {"choices":[{"delta":{"tool_calls":[{"index":0,"id":"call_1","function":{"name":"add","arguments":"{\"a\":"}}]}}]}"#,
            r#"data: {"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"arguments":"2}"}}]},"finish_reason":"tool_calls"}]}"#,
            r#"data: {"choices":[],"usage":{"prompt_tokens":3,"completion_tokens":4}}"#,
            "data: [DONE]",
            "",
        ]
        .join("\n\n");
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/event-stream")
                    .set_body_string(body),
            )
            .mount(&server)
            .await;

        let messages = vec![Message::user(vec![ContentBlock::text("hi")])];
        let request = TurnRequest::new("gpt-4.1", &messages, VISION);
        let mut stream = provider(server.uri()).stream_turn(&request).await.unwrap();

        let mut deltas = Vec::new();
        let mut calls = Vec::new();
        let mut usage = None;
        while let Some(event) = stream.next_event().await {
            match event.unwrap() {
                StreamEvent::TextDelta(text) => deltas.push(text),
                StreamEvent::ToolCall(call) => calls.push(call),
                StreamEvent::Usage(value) => usage = Some(value),
                StreamEvent::Finished(reason) => assert_eq!(reason, FinishReason::ToolCalls),
            }
        }
        assert_eq!(deltas, vec!["Hel", "lo"]);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].arguments, json!({"a": 2}));
        assert_eq!(usage.unwrap().output_tokens, 4);
    }

    #[test]
    fn included_files_are_inlined_as_text() {
        let messages = vec![Message::user(vec![
            ContentBlock::File {
                name: "notes.txt".to_string(),
                contents: "buy milk".to_string(),
            },
            ContentBlock::text("summarize"),
        ])];
        let request = TurnRequest::new("gpt-4o", &messages, VISION);
        let body = serde_json::to_value(provider(String::new()).build_request(&request, false))
            .unwrap();
        assert_eq!(
            body["messages"][0]["content"],
            "`notes.txt`\n---\nbuy milk\n---\n\nsummarize"
        );
    }

    #[test]
    fn stream_needs_done_or_a_finish_reason() {
        let mut decoder = OpenAiStreamDecoder::default();
        let mut out = Vec::new();
        decoder
            .decode_line(r#"data: {"choices":[{"delta":{"content":"Hal"}}]}"#, &mut out)
            .unwrap();
        assert!(matches!(
            decoder.finish(&mut out),
            Err(ProviderError::Api { ref message, .. }) if message.contains("stream ended")
        ));

        let mut decoder = OpenAiStreamDecoder::default();
        decoder
            .decode_line(
                r#"data: {"choices":[{"delta":{"content":"Hi"},"finish_reason":"stop"}]}"#,
                &mut out,
            )
            .unwrap();
        assert!(decoder.finish(&mut out).is_ok());
    }

    #[test]
    fn stream_error_payload_is_an_api_error() {
        let mut decoder = OpenAiStreamDecoder::default();
        let mut out = Vec::new();
        let err = decoder
            .decode_line(r#"data: {"error":{"message":"internal server error"}}"#, &mut out)
            .unwrap_err();
        assert!(matches!(err, ProviderError::Api { ref message, .. } if message == "internal server error"));
    }

    #[test]
    fn missing_key_fails_construction() {
        let lookup = |_: &str| None;
        assert!(matches!(
            OpenAiProvider::from_env(reqwest::Client::new(), String::new(), &lookup),
            Err(ProviderError::Authentication { .. })
        ));
    }
}
