//! Session lifecycle.
//!
//! A [`SessionContext`] owns everything that lives for one session: the
//! HTTP client, the provider adapters, the model registry and the tool
//! bridge. It is built once by [`SessionContext::start`] and released by
//! [`SessionContext::shutdown`].

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::Local;
use thiserror::Error;
use tracing::{debug, warn};

use crate::api::models::fetch_ollama_models;
use crate::core::config::data::Config;
use crate::core::conversation::{ConversationManager, TurnContext};
use crate::core::error::{ChatError, ProviderError};
use crate::core::message::Conversation;
use crate::core::providers::{Provider, ProviderKind};
use crate::core::registry::{builtin_providers, ModelRegistry};
use crate::mcp::ToolBridge;

const OLLAMA_HOST_ENV: &str = "OLLAMA_HOST";
const HTTP_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("built-in model catalog is invalid: {0}")]
    Catalog(#[from] toml::de::Error),

    #[error("failed to build HTTP client: {0}")]
    HttpClient(#[from] reqwest::Error),
}

pub struct SessionContext {
    config: Config,
    providers: BTreeMap<ProviderKind, Result<Provider, ProviderError>>,
    /// Whether the local server answered the model listing at start.
    ollama_reachable: bool,
    registry: ModelRegistry,
    tools: ToolBridge,
    system_prompt: String,
}

impl SessionContext {
    /// Starts a session reading credentials from the process environment.
    pub async fn start(config: Config) -> Result<Self, SessionError> {
        Self::start_with_env(config, &|name| std::env::var(name).ok()).await
    }

    pub async fn start_with_env(
        config: Config,
        lookup: &dyn Fn(&str) -> Option<String>,
    ) -> Result<Self, SessionError> {
        let client = reqwest::Client::builder()
            .connect_timeout(HTTP_CONNECT_TIMEOUT)
            .user_agent(concat!("rapport/", env!("CARGO_PKG_VERSION")))
            .build()?;

        let builtin_urls: BTreeMap<ProviderKind, String> = builtin_providers()?
            .into_iter()
            .map(|provider| (provider.id, provider.base_url))
            .collect();

        let mut providers = BTreeMap::new();
        for kind in ProviderKind::ALL {
            let base_url = resolve_base_url(kind, &config, &builtin_urls, lookup);
            let provider = Provider::connect(kind, client.clone(), base_url, lookup);
            if let Err(err) = &provider {
                debug!(provider = %kind, error = %err, "Provider not configured");
            }
            providers.insert(kind, provider);
        }

        let mut registry = ModelRegistry::builtin()?;
        for entry in &config.models {
            registry.register(entry.clone());
        }

        let mut ollama_reachable = false;
        if let Some(Ok(Provider::Ollama(ollama))) = providers.get(&ProviderKind::Ollama) {
            match fetch_ollama_models(&client, ollama.base_url()).await {
                Ok(models) => {
                    ollama_reachable = true;
                    registry.register_discovered(ProviderKind::Ollama, models);
                }
                Err(err) => debug!(error = %err, "Local inference server not reachable"),
            }
        }

        let tools = ToolBridge::discover(&config, &client).await;
        let system_prompt = config.system_prompt(Local::now().date_naive());

        Ok(Self {
            config,
            providers,
            ollama_reachable,
            registry,
            tools,
            system_prompt,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn registry(&self) -> &ModelRegistry {
        &self.registry
    }

    pub fn tools(&self) -> &ToolBridge {
        &self.tools
    }

    pub fn system_prompt(&self) -> &str {
        &self.system_prompt
    }

    /// The stored construction error for `kind`, if its adapter failed.
    pub fn provider_error(&self, kind: ProviderKind) -> Option<&ProviderError> {
        self.providers.get(&kind).and_then(|provider| provider.as_ref().err())
    }

    /// A provider is available when its adapter was built and, for the
    /// local server, when it answered at start.
    pub fn provider_available(&self, kind: ProviderKind) -> bool {
        let constructed = matches!(self.providers.get(&kind), Some(Ok(_)));
        match kind {
            ProviderKind::Ollama => constructed && self.ollama_reachable,
            _ => constructed,
        }
    }

    pub fn select_model(&self, explicit: Option<&str>) -> Option<String> {
        self.config
            .select_model(explicit, &self.registry, |kind| self.provider_available(kind))
    }

    /// Resolves everything one turn against `model` needs.
    pub fn turn_context(&self, model: &str) -> Result<TurnContext<'_>, ChatError> {
        let entry = self
            .registry
            .lookup(model)
            .ok_or_else(|| ChatError::UnknownModel(model.to_string()))?;
        let provider = match self.providers.get(&entry.provider) {
            Some(Ok(provider)) => provider,
            Some(Err(err)) => return Err(err.clone().into()),
            None => {
                return Err(ProviderError::Unavailable {
                    provider: entry.provider,
                    message: "provider was not started".to_string(),
                }
                .into())
            }
        };
        Ok(TurnContext {
            provider,
            model: &entry.id,
            capability: entry.capability(),
            tools: &self.tools,
            system_prompt: Some(&self.system_prompt),
            context_length: entry.context_length,
        })
    }

    /// A manager for a fresh conversation, bounded by the configured
    /// tool-iteration limit.
    pub fn new_conversation(&self, model: &str) -> ConversationManager {
        self.manage(Conversation::new(model))
    }

    pub fn manage(&self, conversation: Conversation) -> ConversationManager {
        ConversationManager::new(conversation)
            .with_max_tool_iterations(self.config.max_tool_iterations())
    }

    /// Releases tool server processes and sessions.
    pub async fn shutdown(&self) {
        debug!("Shutting down session");
        self.tools.shutdown().await;
    }
}

/// Config override first, then `OLLAMA_HOST` for the local server, then
/// the built-in endpoint.
fn resolve_base_url(
    kind: ProviderKind,
    config: &Config,
    builtin_urls: &BTreeMap<ProviderKind, String>,
    lookup: &dyn Fn(&str) -> Option<String>,
) -> String {
    if let Some(url) = config.provider_base_url(kind) {
        return url.to_string();
    }
    if kind == ProviderKind::Ollama {
        if let Some(host) = lookup(OLLAMA_HOST_ENV).filter(|host| !host.trim().is_empty()) {
            return normalize_host(host.trim());
        }
    }
    match builtin_urls.get(&kind) {
        Some(url) => url.clone(),
        None => {
            warn!(provider = %kind, "No built-in endpoint for provider");
            String::new()
        }
    }
}

/// `OLLAMA_HOST` is often given as `host:port`.
fn normalize_host(host: &str) -> String {
    if host.starts_with("http://") || host.starts_with("https://") {
        host.to_string()
    } else {
        format!("http://{host}")
    }
}
