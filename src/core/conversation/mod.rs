//! Turn resolution.
//!
//! [`ConversationManager`] owns the [`Conversation`] and drives the loop
//! `AwaitingUserInput -> ProviderCall -> {ToolExecution -> ProviderCall}* -> TurnComplete`.
//! Adapter failures are sorted at this boundary: session-scoped errors stop
//! the turn and reach the caller, call-scoped errors are appended as a
//! visible error turn and the conversation carries on.

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::core::attachments::{normalize_turn, request_view, UserTurn};
use crate::core::chat_stream::{ReplyAssembler, StreamEvent};
use crate::core::constants::MAX_TOOL_ITERATIONS;
use crate::core::error::{ChatError, ProviderError};
use crate::core::message::{ContentBlock, Conversation, Message, Role, ToolCallRequest};
use crate::core::providers::{ChatProvider, ProviderReply, ReplyKind, TurnRequest};
use crate::core::registry::ProviderCapability;
use crate::core::tools::{ToolExecutor, ToolOutput};


const TOOL_CANCELLED: &str = "Tool call cancelled by the user";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnState {
    AwaitingUserInput,
    ProviderCall,
    ToolExecution,
    TurnComplete,
}

/// Everything one turn needs from the session.
#[derive(Clone, Copy)]
pub struct TurnContext<'a> {
    pub provider: &'a dyn ChatProvider,
    pub model: &'a str,
    pub capability: ProviderCapability,
    pub tools: &'a dyn ToolExecutor,
    pub system_prompt: Option<&'a str>,
    pub context_length: Option<u32>,
}

/// Observer for a turn in progress. Supplying one switches the provider
/// call to streaming.
pub trait TurnListener: Send {
    fn on_state(&mut self, _state: TurnState) {}

    fn on_text_delta(&mut self, _delta: &str) {}

    fn on_tool_call(&mut self, _call: &ToolCallRequest) {}

    fn on_tool_result(&mut self, _call: &ToolCallRequest, _output: &ToolOutput) {}

    /// Polled before the provider call, after every streamed event and
    /// before each tool. Returning true abandons the turn and discards any
    /// partial output.
    fn should_cancel(&mut self) -> bool {
        false
    }

    /// A token raced against every wait in the turn: the provider call, each
    /// stream event and each tool invocation.
    fn cancellation(&self) -> Option<CancellationToken> {
        None
    }
}

/// How a turn ended when it did not fail outright.
#[derive(Debug)]
pub enum TurnOutcome {
    /// A final assistant message was appended.
    Completed,
    /// A call-scoped failure was appended as an error turn.
    ErrorTurn(ProviderError),
    /// The listener abandoned the turn. Nothing was appended for the
    /// abandoned provider call, and interrupted tool calls got a cancelled
    /// error result.
    Cancelled,
}

pub struct ConversationManager {
    conversation: Conversation,
    max_tool_iterations: usize,
    state: TurnState,
}

impl ConversationManager {
    pub fn new(conversation: Conversation) -> Self {
        Self {
            conversation,
            max_tool_iterations: MAX_TOOL_ITERATIONS,
            state: TurnState::AwaitingUserInput,
        }
    }

    pub fn with_max_tool_iterations(mut self, limit: usize) -> Self {
        self.max_tool_iterations = limit;
        self
    }

    pub fn conversation(&self) -> &Conversation {
        &self.conversation
    }

    pub fn into_conversation(self) -> Conversation {
        self.conversation
    }

    pub fn state(&self) -> TurnState {
        self.state
    }

    pub fn set_model(&mut self, model: &str) {
        self.conversation.model = model.to_string();
    }

    /// Appends the user turn and resolves it to a final assistant message.
    pub async fn submit(
        &mut self,
        ctx: TurnContext<'_>,
        turn: UserTurn,
        listener: Option<&mut dyn TurnListener>,
    ) -> Result<TurnOutcome, ChatError> {
        let content = normalize_turn(turn, ctx.capability, ctx.model);
        self.conversation.push(Message::user(content));
        self.set_model(ctx.model);
        self.resolve(ctx, listener).await
    }

    /// Drops everything after the most recent user message and runs the
    /// provider again from there.
    pub async fn regenerate(
        &mut self,
        ctx: TurnContext<'_>,
        listener: Option<&mut dyn TurnListener>,
    ) -> Result<TurnOutcome, ChatError> {
        let user_index = self
            .conversation
            .last_user_index()
            .ok_or(ChatError::NothingToRegenerate)?;
        debug!(
            dropped = self.conversation.len() - user_index - 1,
            "Regenerating last response"
        );
        self.conversation.truncate(user_index + 1);
        self.set_model(ctx.model);
        self.resolve(ctx, listener).await
    }

    fn enter(&mut self, state: TurnState, listener: &mut Option<&mut dyn TurnListener>) {
        self.state = state;
        if let Some(listener) = listener.as_deref_mut() {
            listener.on_state(state);
        }
    }

    async fn resolve(
        &mut self,
        ctx: TurnContext<'_>,
        mut listener: Option<&mut dyn TurnListener>,
    ) -> Result<TurnOutcome, ChatError> {
        let tools = if ctx.capability.supports_tools {
            ctx.tools.exposed_tools()
        } else {
            Vec::new()
        };
        let cancel = listener.as_ref().and_then(|listener| listener.cancellation());
        let mut tool_rounds = 0usize;

        loop {
            self.enter(TurnState::ProviderCall, &mut listener);
            let result = {
                let view = request_view(self.conversation.messages(), ctx.capability, ctx.model);
                let request = TurnRequest::new(ctx.model, &view, ctx.capability)
                    .with_tools(&tools)
                    .with_system_prompt(ctx.system_prompt)
                    .with_context_length(ctx.context_length);
                call_provider(ctx.provider, &request, listener.as_deref_mut(), cancel.as_ref())
                    .await
            };

            let reply = match result {
                Ok(Some(reply)) => reply,
                Ok(None) => {
                    debug!(model = ctx.model, "Turn cancelled by listener");
                    self.enter(TurnState::AwaitingUserInput, &mut listener);
                    return Ok(TurnOutcome::Cancelled);
                }
                Err(err) if err.is_session_scoped() => {
                    warn!(provider = %err.provider(), error = %err, "Provider call failed");
                    self.enter(TurnState::AwaitingUserInput, &mut listener);
                    return Err(err.into());
                }
                Err(err) => {
                    warn!(provider = %err.provider(), error = %err, "Provider call failed; recording error turn");
                    self.conversation.push(Message::error_turn(err.to_string()));
                    self.enter(TurnState::TurnComplete, &mut listener);
                    return Ok(TurnOutcome::ErrorTurn(err));
                }
            };
            self.conversation.usage.add(reply.usage);

            let (text, calls) = match reply.kind {
                ReplyKind::AssistantTurn { text } => {
                    self.conversation.push(Message::assistant_text(text));
                    self.enter(TurnState::TurnComplete, &mut listener);
                    return Ok(TurnOutcome::Completed);
                }
                ReplyKind::ToolCallRequest { text, calls } => (text, calls),
            };

            tool_rounds += 1;
            if tool_rounds > self.max_tool_iterations {
                warn!(
                    limit = self.max_tool_iterations,
                    "Tool loop exceeded without a final answer"
                );
                self.enter(TurnState::AwaitingUserInput, &mut listener);
                return Err(ChatError::ToolLoopExceeded {
                    limit: self.max_tool_iterations,
                });
            }

            let mut content = Vec::with_capacity(calls.len() + 1);
            if !text.is_empty() {
                content.push(ContentBlock::text(text));
            }
            content.extend(calls.iter().map(ToolCallRequest::to_block));
            self.conversation.push(Message::new(Role::Assistant, content));

            self.enter(TurnState::ToolExecution, &mut listener);
            for (index, call) in calls.iter().enumerate() {
                let stop_requested = listener
                    .as_deref_mut()
                    .is_some_and(|listener| listener.should_cancel());
                let output = if stop_requested {
                    None
                } else {
                    if let Some(listener) = listener.as_deref_mut() {
                        listener.on_tool_call(call);
                    }
                    tokio::select! {
                        biased;
                        _ = cancelled(cancel.as_ref()) => None,
                        output = run_tool(ctx.tools, call) => Some(output),
                    }
                };
                let Some(output) = output else {
                    debug!(tool = %call.name, "Tool execution cancelled");
                    // Each call keeps a matching result.
                    for call in &calls[index..] {
                        self.conversation
                            .push(Message::tool_result(&call.id, TOOL_CANCELLED, true));
                    }
                    self.enter(TurnState::AwaitingUserInput, &mut listener);
                    return Ok(TurnOutcome::Cancelled);
                };
                if let Some(listener) = listener.as_deref_mut() {
                    listener.on_tool_result(call, &output);
                }
                self.conversation
                    .push(Message::tool_result(&call.id, output.payload, output.is_error));
            }
        }
    }
}

/// Tool failures never abort the turn: they become an error result the
/// model can see.
async fn run_tool(tools: &dyn ToolExecutor, call: &ToolCallRequest) -> ToolOutput {
    debug!(tool = %call.name, call_id = %call.id, "Invoking tool");
    match tools.invoke(call).await {
        Ok(output) => output,
        Err(err) => {
            warn!(tool = %call.name, call_id = %call.id, error = %err, "Tool call failed");
            ToolOutput {
                payload: err.to_string(),
                is_error: true,
            }
        }
    }
}

/// Resolves when `token` is cancelled, never without one.
async fn cancelled(token: Option<&CancellationToken>) {
    match token {
        Some(token) => token.cancelled().await,
        None => std::future::pending().await,
    }
}

/// `Ok(None)` means the listener cancelled the call.
async fn call_provider<'l>(
    provider: &dyn ChatProvider,
    request: &TurnRequest<'_>,
    listener: Option<&mut (dyn TurnListener + 'l)>,
    cancel: Option<&CancellationToken>,
) -> Result<Option<ProviderReply>, ProviderError> {
    let Some(listener) = listener else {
        return provider.send_turn(request).await.map(Some);
    };
    if listener.should_cancel() {
        return Ok(None);
    }

    let mut stream = tokio::select! {
        biased;
        _ = cancelled(cancel) => return Ok(None),
        stream = provider.stream_turn(request) => stream?,
    };
    let mut assembler = ReplyAssembler::default();
    loop {
        let event = tokio::select! {
            biased;
            _ = cancelled(cancel) => None,
            event = stream.next_event() => Some(event),
        };
        let Some(event) = event else {
            stream.cancel();
            return Ok(None);
        };
        let Some(event) = event else {
            break;
        };
        let event = event?;
        if let StreamEvent::TextDelta(delta) = &event {
            listener.on_text_delta(delta);
        }
        assembler.push(event);
        if listener.should_cancel() {
            stream.cancel();
            return Ok(None);
        }
    }
    Ok(Some(assembler.finish()))
}
