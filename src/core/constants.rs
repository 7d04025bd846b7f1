//! Shared limits and defaults

use std::time::Duration;

/// Provider rounds that may request tools before a turn is abandoned.
pub const MAX_TOOL_ITERATIONS: usize = 25;

pub const DEFAULT_TOOL_TIMEOUT: Duration = Duration::from_secs(60);

/// Upper bound on `tools/list` pages fetched from one server.
pub const MCP_MAX_TOOL_LIST: usize = 100;

pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful assistant. \
Answer clearly and concisely. Use Markdown for formatting and LaTeX for equations. \
When tools are available, call them only when they help answer the question.";
