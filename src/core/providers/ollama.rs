//! Local inference server adapter, speaking Ollama's native `/api/chat`.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use chrono::Utc;
use tracing::debug;

use super::http::{self, construct_api_url};
use crate::api::models::fetch_ollama_context_length;
use super::openai::to_chat_tools;
use super::{finish_reason_from, ChatProvider, ProviderKind, ProviderReply, ReplyKind, TurnRequest};
use crate::api::ollama::{
    OllamaChatRequest, OllamaChatResponse, OllamaFunctionCall, OllamaMessage, OllamaOptions,
    OllamaToolCall,
};
use crate::core::chat_stream::{truncated, StreamDecoder, StreamEvent, TurnStream};
use crate::core::error::ProviderError;
use crate::core::message::{ContentBlock, FinishReason, Role, TokenUsage, ToolCallRequest};

const KIND: ProviderKind = ProviderKind::Ollama;

/// Upper bound on the context window requested from the local server.
const MAX_NUM_CTX: u32 = 2048;

pub struct OllamaProvider {
    client: reqwest::Client,
    base_url: String,
    /// Context windows learned from `/api/show`, per model.
    context_lengths: Mutex<HashMap<String, Option<u32>>>,
}

impl OllamaProvider {
    pub fn new(client: reqwest::Client, base_url: String) -> Self {
        Self {
            client,
            base_url,
            context_lengths: Mutex::new(HashMap::new()),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn build_request(
        &self,
        request: &TurnRequest<'_>,
        stream: bool,
        context_length: Option<u32>,
    ) -> OllamaChatRequest {
        OllamaChatRequest {
            model: request.model.to_string(),
            messages: to_ollama_messages(request),
            stream,
            tools: to_chat_tools(request.wire_tools()).unwrap_or_default(),
            options: context_length.map(|length| OllamaOptions {
                num_ctx: length.min(MAX_NUM_CTX),
            }),
        }
    }

    /// The catalog length when there is one, otherwise what the server
    /// reports for the model.
    async fn context_length(&self, request: &TurnRequest<'_>) -> Option<u32> {
        if request.context_length.is_some() {
            return request.context_length;
        }
        let cached = self.lengths().get(request.model).copied();
        if let Some(known) = cached {
            return known;
        }
        match fetch_ollama_context_length(&self.client, &self.base_url, request.model).await {
            Ok(length) => {
                debug!(model = request.model, ?length, "Learned model context length");
                self.lengths().insert(request.model.to_string(), length);
                length
            }
            Err(err) => {
                debug!(model = request.model, error = %err, "Model details unavailable");
                None
            }
        }
    }

    fn lengths(&self) -> std::sync::MutexGuard<'_, HashMap<String, Option<u32>>> {
        self.context_lengths
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    async fn post(&self, body: &OllamaChatRequest) -> Result<reqwest::Response, ProviderError> {
        debug!(
            model = %body.model,
            messages = body.messages.len(),
            tools = body.tools.len(),
            stream = body.stream,
            "Sending Ollama chat request"
        );
        let url = construct_api_url(&self.base_url, "api/chat");
        http::send(KIND, self.client.post(url).json(body)).await
    }
}

#[async_trait]
impl ChatProvider for OllamaProvider {
    fn kind(&self) -> ProviderKind {
        KIND
    }

    async fn send_turn(&self, request: &TurnRequest<'_>) -> Result<ProviderReply, ProviderError> {
        request.check_content(KIND)?;
        let context_length = self.context_length(request).await;
        let body = self.build_request(request, false, context_length);
        let response = self.post(&body).await?;
        let reply: OllamaChatResponse = http::read_json(KIND, response).await?;
        if let Some(error) = reply.error {
            return Err(ProviderError::api(KIND, error));
        }

        let stamp = Utc::now().timestamp_micros();
        let message = reply.message.unwrap_or_default();
        let calls: Vec<ToolCallRequest> = message
            .tool_calls
            .into_iter()
            .enumerate()
            .map(|(index, call)| to_call_request(stamp, index, call))
            .collect();
        let kind = if calls.is_empty() {
            ReplyKind::AssistantTurn {
                text: message.content,
            }
        } else {
            ReplyKind::ToolCallRequest {
                text: message.content,
                calls,
            }
        };
        let finish_reason = if matches!(kind, ReplyKind::ToolCallRequest { .. }) {
            FinishReason::ToolCalls
        } else {
            finish_reason_from(reply.done_reason.as_deref())
        };
        Ok(ProviderReply {
            kind,
            usage: TokenUsage {
                input_tokens: reply.prompt_eval_count.unwrap_or(0),
                output_tokens: reply.eval_count.unwrap_or(0),
            },
            finish_reason,
        })
    }

    async fn stream_turn(&self, request: &TurnRequest<'_>) -> Result<TurnStream, ProviderError> {
        request.check_content(KIND)?;
        let context_length = self.context_length(request).await;
        let body = self.build_request(request, true, context_length);
        let response = self.post(&body).await?;
        Ok(TurnStream::spawn(KIND, response, OllamaStreamDecoder::new()))
    }
}

/// The local server does not assign call ids, so they are minted here.
fn to_call_request(stamp: i64, index: usize, call: OllamaToolCall) -> ToolCallRequest {
    let arguments = match call.function.arguments {
        serde_json::Value::Null => serde_json::Value::Object(serde_json::Map::new()),
        other => other,
    };
    ToolCallRequest {
        id: format!("call_{stamp:x}_{index}"),
        name: call.function.name,
        arguments,
    }
}

fn to_ollama_messages(request: &TurnRequest<'_>) -> Vec<OllamaMessage> {
    let mut messages = Vec::new();
    if let Some(system) = request.system_prompt {
        messages.push(OllamaMessage {
            role: "system".to_string(),
            content: system.to_string(),
            ..OllamaMessage::default()
        });
    }

    // Tool results are matched back to the call by tool name.
    let mut call_names: HashMap<&str, &str> = HashMap::new();
    for message in request.transmitted() {
        match message.role {
            Role::User => {
                let images = message
                    .content
                    .iter()
                    .filter_map(|block| match block {
                        ContentBlock::Image { data, .. } => Some(STANDARD.encode(data)),
                        _ => None,
                    })
                    .collect();
                messages.push(OllamaMessage {
                    role: "user".to_string(),
                    content: message.text(),
                    images,
                    ..OllamaMessage::default()
                });
            }
            Role::Assistant => {
                let tool_calls = message
                    .tool_calls()
                    .map(|(id, name, arguments)| {
                        call_names.insert(id, name);
                        OllamaToolCall {
                            function: OllamaFunctionCall {
                                name: name.to_string(),
                                arguments: arguments.clone(),
                            },
                        }
                    })
                    .collect();
                messages.push(OllamaMessage {
                    role: "assistant".to_string(),
                    content: message.text(),
                    tool_calls,
                    ..OllamaMessage::default()
                });
            }
            Role::Tool => {
                for block in &message.content {
                    if let ContentBlock::ToolResult {
                        call_id, payload, ..
                    } = block
                    {
                        messages.push(OllamaMessage {
                            role: "tool".to_string(),
                            content: payload.clone(),
                            tool_name: call_names.get(call_id.as_str()).map(|name| name.to_string()),
                            ..OllamaMessage::default()
                        });
                    }
                }
            }
        }
    }
    messages
}

/// Newline-delimited JSON, one [`OllamaChatResponse`] per line.
struct OllamaStreamDecoder {
    stamp: i64,
    next_index: usize,
    done: bool,
}

impl OllamaStreamDecoder {
    fn new() -> Self {
        Self {
            stamp: Utc::now().timestamp_micros(),
            next_index: 0,
            done: false,
        }
    }
}

impl StreamDecoder for OllamaStreamDecoder {
    fn decode_line(
        &mut self,
        line: &str,
        out: &mut Vec<StreamEvent>,
    ) -> Result<bool, ProviderError> {
        let chunk: OllamaChatResponse = serde_json::from_str(line)
            .map_err(|err| ProviderError::api(KIND, format!("invalid stream line: {err}")))?;
        if let Some(error) = chunk.error {
            return Err(ProviderError::api(KIND, error));
        }

        if let Some(message) = chunk.message {
            if !message.content.is_empty() {
                out.push(StreamEvent::TextDelta(message.content));
            }
            for call in message.tool_calls {
                out.push(StreamEvent::ToolCall(to_call_request(
                    self.stamp,
                    self.next_index,
                    call,
                )));
                self.next_index += 1;
            }
        }

        if !chunk.done {
            return Ok(false);
        }
        self.done = true;
        out.push(StreamEvent::Usage(TokenUsage {
            input_tokens: chunk.prompt_eval_count.unwrap_or(0),
            output_tokens: chunk.eval_count.unwrap_or(0),
        }));
        let reason = if self.next_index > 0 {
            FinishReason::ToolCalls
        } else {
            finish_reason_from(chunk.done_reason.as_deref())
        };
        out.push(StreamEvent::Finished(reason));
        Ok(true)
    }

    fn finish(&mut self, _out: &mut Vec<StreamEvent>) -> Result<(), ProviderError> {
        if self.done {
            Ok(())
        } else {
            Err(truncated(KIND))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::message::Message;
    use crate::core::registry::ProviderCapability;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const LOCAL: ProviderCapability = ProviderCapability {
        supports_images: true,
        supports_tools: true,
    };

    #[test]
    fn request_carries_images_tool_names_and_context_cap() {
        let messages = vec![
            Message::user(vec![
                ContentBlock::text("describe"),
                ContentBlock::Image {
                    mime_type: "image/png".to_string(),
                    data: vec![1, 2, 3],
                    name: None,
                },
            ]),
            Message::new(
                Role::Assistant,
                vec![ContentBlock::ToolCall {
                    id: "call_1".to_string(),
                    name: "add".to_string(),
                    arguments: json!({"a": 2, "b": 2}),
                }],
            ),
            Message::tool_result("call_1", "4", false),
        ];
        let request = TurnRequest::new("llava", &messages, LOCAL).with_context_length(Some(8192));
        let provider = OllamaProvider::new(reqwest::Client::new(), String::new());
        let body = serde_json::to_value(provider.build_request(&request, true, Some(8192))).unwrap();

        assert_eq!(body["options"]["num_ctx"], 2048);
        assert_eq!(body["messages"][0]["images"], json!(["AQID"]));
        assert_eq!(
            body["messages"][1]["tool_calls"][0]["function"],
            json!({"name": "add", "arguments": {"a": 2, "b": 2}})
        );
        assert_eq!(
            body["messages"][2],
            json!({"role": "tool", "content": "4", "tool_name": "add"})
        );
        assert!(body.get("tools").is_none());
    }

    #[tokio::test]
    async fn send_turn_mints_ids_for_tool_calls() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/chat"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "message": {
                    "role": "assistant",
                    "content": "",
                    "tool_calls": [{"function": {"name": "add", "arguments": {"a": 2, "b": 2}}}]
                },
                "done": true,
                "done_reason": "stop",
                "prompt_eval_count": 20,
                "eval_count": 7
            })))
            .mount(&server)
            .await;

        let messages = vec![Message::user(vec![ContentBlock::text("What's 2+2?")])];
        let provider = OllamaProvider::new(reqwest::Client::new(), server.uri());
        let reply = provider
            .send_turn(&TurnRequest::new("llama3.1", &messages, LOCAL))
            .await
            .unwrap();

        assert_eq!(reply.finish_reason, FinishReason::ToolCalls);
        assert_eq!(reply.usage.output_tokens, 7);
        match reply.kind {
            ReplyKind::ToolCallRequest { calls, .. } => {
                assert_eq!(calls.len(), 1);
                assert!(calls[0].id.starts_with("call_"));
                assert!(calls[0].id.ends_with("_0"));
                assert_eq!(calls[0].arguments, json!({"a": 2, "b": 2}));
            }
            other => panic!("expected tool calls, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn stream_turn_reads_ndjson() {
        let body = [
            r#"{"message":{"role":"assistant","content":"The answer"},"done":false}"#,
            r#"{"message":{"role":"assistant","content":" is 4."},"done":false}"#,
            r#"{"message":{"role":"assistant","content":""},"done":true,"done_reason":"stop","prompt_eval_count":9,"eval_count":4}"#,
        ]
        .join("\n");
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/chat"))
            .respond_with(ResponseTemplate::new(200).set_body_string(body))
            .mount(&server)
            .await;

        let messages = vec![Message::user(vec![ContentBlock::text("What's 2+2?")])];
        let provider = OllamaProvider::new(reqwest::Client::new(), server.uri());
        let stream = provider
            .stream_turn(&TurnRequest::new("llama3.1", &messages, LOCAL))
            .await
            .unwrap();
        let reply = stream.collect().await.unwrap();
        assert_eq!(
            reply.kind,
            ReplyKind::AssistantTurn {
                text: "The answer is 4.".to_string()
            }
        );
        assert_eq!(reply.usage.input_tokens, 9);
    }

    #[tokio::test]
    async fn discovered_models_send_the_server_reported_context() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/show"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "details": {"family": "llama"},
                "model_info": {"llama.context_length": 131072}
            })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/chat"))
            .and(body_partial_json(json!({"options": {"num_ctx": 2048}})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "message": {"role": "assistant", "content": "hi"},
                "done": true
            })))
            .expect(2)
            .mount(&server)
            .await;

        let messages = vec![Message::user(vec![ContentBlock::text("hello")])];
        let provider = OllamaProvider::new(reqwest::Client::new(), server.uri());
        let request = TurnRequest::new("llama3.1:8b", &messages, LOCAL);
        for _ in 0..2 {
            let reply = provider.send_turn(&request).await.unwrap();
            assert_eq!(reply.kind, ReplyKind::AssistantTurn { text: "hi".to_string() });
        }
    }

    #[test]
    fn body_without_done_line_is_truncated() {
        let mut decoder = OllamaStreamDecoder::new();
        let mut out = Vec::new();
        decoder
            .decode_line(
                r#"{"message":{"role":"assistant","content":"The answer"},"done":false}"#,
                &mut out,
            )
            .unwrap();
        let err = decoder.finish(&mut out).unwrap_err();
        assert!(!err.is_session_scoped());
        assert!(err.to_string().contains("stream ended before completion"));
    }

    #[tokio::test]
    async fn server_error_field_becomes_api_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/chat"))
            .respond_with(
                ResponseTemplate::new(404).set_body_json(json!({"error": "model 'nope' not found"})),
            )
            .mount(&server)
            .await;

        let messages = vec![Message::user(vec![ContentBlock::text("hi")])];
        let provider = OllamaProvider::new(reqwest::Client::new(), server.uri());
        let err = provider
            .send_turn(&TurnRequest::new("nope", &messages, LOCAL))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ProviderError::Api { status: Some(404), ref message, .. } if message == "model 'nope' not found"
        ));
    }

    #[tokio::test]
    async fn unreachable_server_is_unavailable() {
        let provider = OllamaProvider::new(reqwest::Client::new(), "http://127.0.0.1:9".to_string());
        let messages = vec![Message::user(vec![ContentBlock::text("hi")])];
        let err = provider
            .send_turn(&TurnRequest::new("llama3.1", &messages, LOCAL))
            .await
            .unwrap_err();
        assert!(err.is_session_scoped());
    }
}
