use std::collections::BTreeSet;

use crate::core::config::data::McpServerConfig;

/// The tools one server may advertise to providers.
///
/// A server with no `allowed_tools`, or an empty list, exposes nothing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ToolAllowList {
    allowed: BTreeSet<String>,
}

impl ToolAllowList {
    pub fn from_config(config: &McpServerConfig) -> Self {
        Self::new(config.allowed_tools.iter().flatten().map(String::as_str))
    }

    pub fn new<'a>(names: impl IntoIterator<Item = &'a str>) -> Self {
        Self {
            allowed: names
                .into_iter()
                .map(str::trim)
                .filter(|name| !name.is_empty())
                .map(str::to_string)
                .collect(),
        }
    }

    /// Names match exactly, after trimming the configured entry.
    pub fn permits(&self, tool_name: &str) -> bool {
        self.allowed.contains(tool_name)
    }

    pub fn is_empty(&self) -> bool {
        self.allowed.is_empty()
    }
}
