use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::core::constants::{DEFAULT_SYSTEM_PROMPT, DEFAULT_TOOL_TIMEOUT, MAX_TOOL_ITERATIONS};
use crate::core::providers::ProviderKind;
use crate::core::registry::{ModelEntry, ModelRegistry};

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq, Eq)]
pub struct ProviderSettings {
    pub base_url: Option<String>,
}

/// One `[mcp_servers.<id>]` table. Exactly one of `command` or `url` is set.
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq, Eq)]
pub struct McpServerConfig {
    pub command: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
    pub url: Option<String>,
    /// Tool names this server may expose. Missing or empty exposes nothing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_tools: Option<Vec<String>>,
    /// Overrides the protocol version sent on `initialize`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
}

impl McpServerConfig {
    pub fn stdio(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            command: Some(command.into()),
            args,
            ..Self::default()
        }
    }

    pub fn http(url: impl Into<String>) -> Self {
        Self {
            url: Some(url.into()),
            ..Self::default()
        }
    }

    pub fn with_allowed_tools<I, S>(mut self, tools: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed_tools = Some(tools.into_iter().map(Into::into).collect());
        self
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.unwrap_or(true)
    }
}

#[derive(Debug, Serialize, Deserialize, Default, Clone, PartialEq)]
pub struct Config {
    /// Model used when nothing more specific applies
    pub preferred_model: Option<String>,
    /// Model of the most recent session, written back on exit
    pub last_used_model: Option<String>,
    /// Appended to the default system prompt
    pub custom_system_prompt: Option<String>,
    pub max_tool_iterations: Option<usize>,
    pub tool_timeout_secs: Option<u64>,
    /// Base URL overrides keyed by provider id (e.g. "ollama")
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub providers: BTreeMap<String, ProviderSettings>,
    /// Extra catalog entries layered over the built-in models
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub models: Vec<ModelEntry>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub mcp_servers: BTreeMap<String, McpServerConfig>,
}

impl Config {
    pub fn max_tool_iterations(&self) -> usize {
        self.max_tool_iterations.unwrap_or(MAX_TOOL_ITERATIONS)
    }

    pub fn tool_timeout(&self) -> Duration {
        self.tool_timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_TOOL_TIMEOUT)
    }

    pub fn provider_base_url(&self, provider: ProviderKind) -> Option<&str> {
        self.providers
            .get(provider.id())
            .and_then(|settings| settings.base_url.as_deref())
            .map(str::trim)
            .filter(|url| !url.is_empty())
    }

    /// Servers that are switched on, in id order.
    pub fn enabled_mcp_servers(&self) -> impl Iterator<Item = (&String, &McpServerConfig)> {
        self.mcp_servers
            .iter()
            .filter(|(_, server)| server.is_enabled())
    }

    /// Default prompt stamped with `today`, followed by the custom section.
    pub fn system_prompt(&self, today: NaiveDate) -> String {
        let mut prompt = format!(
            "{DEFAULT_SYSTEM_PROMPT}\n\nThe current date is {}.",
            today.format("%Y-%m-%d")
        );
        if let Some(custom) = self
            .custom_system_prompt
            .as_deref()
            .map(str::trim)
            .filter(|custom| !custom.is_empty())
        {
            prompt.push_str("\n\n");
            prompt.push_str(custom);
        }
        prompt
    }

    /// Picks the model for a new session: an explicit choice wins, then the
    /// last used and preferred models when the catalog still knows them,
    /// then the first catalog entry whose provider is usable.
    pub fn select_model(
        &self,
        explicit: Option<&str>,
        registry: &ModelRegistry,
        provider_available: impl Fn(ProviderKind) -> bool,
    ) -> Option<String> {
        if let Some(model) = explicit {
            return Some(model.to_string());
        }
        let usable = |id: &str| {
            registry
                .lookup(id)
                .is_some_and(|entry| provider_available(entry.provider))
        };
        [self.last_used_model.as_deref(), self.preferred_model.as_deref()]
            .into_iter()
            .flatten()
            .find(|id| usable(id))
            .map(str::to_string)
            .or_else(|| {
                registry
                    .list()
                    .iter()
                    .find(|entry| provider_available(entry.provider))
                    .map(|entry| entry.id.clone())
            })
    }
}

/// Get a user-friendly display string for a path
/// Converts absolute paths to use ~ notation on Unix-like systems when possible
pub fn path_display<P: AsRef<Path>>(path: P) -> String {
    let path = path.as_ref();

    #[cfg(unix)]
    {
        if let Some(home) = std::env::var_os("HOME") {
            let home_path = PathBuf::from(home);
            if let Ok(relative) = path.strip_prefix(&home_path) {
                return format!("~/{}", relative.display());
            }
        }
    }

    path.display().to_string()
}
