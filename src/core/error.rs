//! Error taxonomy shared by the adapters, the tool bridge and the
//! conversation manager.

use std::time::Duration;

use thiserror::Error;

use crate::core::attachments::AttachmentError;
use crate::core::providers::ProviderKind;

/// Failures raised by a provider adapter for a single call.
#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    /// Network or connection failure. Never retried automatically.
    #[error("{provider} is unavailable: {message}")]
    Unavailable {
        provider: ProviderKind,
        message: String,
    },

    /// Missing or rejected credential. Fatal for that provider only.
    #[error("{provider} authentication failed: {message}")]
    Authentication {
        provider: ProviderKind,
        message: String,
    },

    /// The provider asked us to back off.
    #[error("{provider} rate limited the request{hint}: {message}", hint = retry_hint(.retry_after))]
    RateLimited {
        provider: ProviderKind,
        retry_after: Option<Duration>,
        message: String,
    },

    /// The request carried content the target model cannot accept.
    #[error("{provider} model {model} cannot accept this content: {detail}")]
    UnsupportedContent {
        provider: ProviderKind,
        model: String,
        detail: String,
    },

    /// Non-success status or undecodable payload.
    #[error("{provider} API error{status}: {message}", status = status_hint(.status))]
    Api {
        provider: ProviderKind,
        status: Option<u16>,
        message: String,
    },
}

fn retry_hint(retry_after: &Option<Duration>) -> String {
    match retry_after {
        Some(delay) => format!(" (retry after {}s)", delay.as_secs()),
        None => String::new(),
    }
}

fn status_hint(status: &Option<u16>) -> String {
    match status {
        Some(code) => format!(" ({code})"),
        None => String::new(),
    }
}

impl ProviderError {
    pub fn provider(&self) -> ProviderKind {
        match self {
            ProviderError::Unavailable { provider, .. }
            | ProviderError::Authentication { provider, .. }
            | ProviderError::RateLimited { provider, .. }
            | ProviderError::UnsupportedContent { provider, .. }
            | ProviderError::Api { provider, .. } => *provider,
        }
    }

    /// Session-scoped failures stop the turn; everything else becomes a
    /// visible error turn and the conversation continues.
    pub fn is_session_scoped(&self) -> bool {
        matches!(
            self,
            ProviderError::Unavailable { .. } | ProviderError::Authentication { .. }
        )
    }

    pub(crate) fn api(provider: ProviderKind, message: impl Into<String>) -> Self {
        ProviderError::Api {
            provider,
            status: None,
            message: message.into(),
        }
    }
}

/// A tool call that could not produce a normal result.
#[derive(Debug, Clone, Error)]
#[error("tool `{tool_name}` (call {call_id}) failed: {kind}")]
pub struct ToolExecutionError {
    pub call_id: String,
    pub tool_name: String,
    pub kind: ToolFailure,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ToolFailure {
    #[error("tool is not exposed to this conversation")]
    NotAllowed,
    #[error("arguments do not match the tool schema: {0}")]
    InvalidArguments(String),
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("server {server_id} is not connected")]
    ServerUnavailable { server_id: String },
    #[error("{0}")]
    Server(String),
}

impl ToolExecutionError {
    pub fn new(call_id: &str, tool_name: &str, kind: ToolFailure) -> Self {
        Self {
            call_id: call_id.to_string(),
            tool_name: tool_name.to_string(),
            kind,
        }
    }
}

/// A configured tool server that failed to start, connect or list tools.
#[derive(Debug, Clone, Error)]
#[error("tool server {server_id}: {message}")]
pub struct ToolDiscoveryError {
    pub server_id: String,
    pub message: String,
}

/// Errors surfaced to the caller of the conversation manager.
#[derive(Debug, Error)]
pub enum ChatError {
    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error("tool loop exceeded {limit} rounds without a final answer")]
    ToolLoopExceeded { limit: usize },

    #[error("unknown model: {0}")]
    UnknownModel(String),

    #[error("no assistant turn to regenerate")]
    NothingToRegenerate,

    #[error(transparent)]
    Attachment(#[from] AttachmentError),
}
