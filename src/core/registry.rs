//! Model catalog
//!
//! The built-in catalog is embedded from builtin_models.toml at build time.
//! Config entries and models discovered from the local inference server are
//! layered on top. Capabilities are only ever read from these entries.

use serde::{Deserialize, Serialize};

use crate::core::providers::ProviderKind;

const CATALOG_CONTENT: &str = include_str!("../builtin_models.toml");

/// Capability flags for one model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ProviderCapability {
    pub supports_images: bool,
    pub supports_tools: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelEntry {
    pub id: String,
    pub provider: ProviderKind,
    #[serde(default)]
    pub supports_images: bool,
    #[serde(default)]
    pub supports_tools: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_length: Option<u32>,
}

impl ModelEntry {
    pub fn new(id: impl Into<String>, provider: ProviderKind, capability: ProviderCapability) -> Self {
        Self {
            id: id.into(),
            provider,
            supports_images: capability.supports_images,
            supports_tools: capability.supports_tools,
            context_length: None,
        }
    }

    pub fn capability(&self) -> ProviderCapability {
        ProviderCapability {
            supports_images: self.supports_images,
            supports_tools: self.supports_tools,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct BuiltinProvider {
    pub id: ProviderKind,
    pub base_url: String,
}

#[derive(Debug, Deserialize)]
struct BuiltinCatalog {
    providers: Vec<BuiltinProvider>,
    #[serde(default)]
    models: Vec<ModelEntry>,
}

fn load_builtin_catalog() -> Result<BuiltinCatalog, toml::de::Error> {
    toml::from_str(CATALOG_CONTENT)
}

/// Default endpoints shipped with the binary.
pub fn builtin_providers() -> Result<Vec<BuiltinProvider>, toml::de::Error> {
    Ok(load_builtin_catalog()?.providers)
}

#[derive(Debug, Clone, Default)]
pub struct ModelRegistry {
    entries: Vec<ModelEntry>,
}

impl ModelRegistry {
    pub fn builtin() -> Result<Self, toml::de::Error> {
        Ok(Self::from_entries(load_builtin_catalog()?.models))
    }

    pub fn from_entries(entries: impl IntoIterator<Item = ModelEntry>) -> Self {
        let mut registry = Self::default();
        for entry in entries {
            registry.register(entry);
        }
        registry
    }

    /// Adds an entry, replacing any existing entry with the same id.
    pub fn register(&mut self, entry: ModelEntry) {
        match self.entries.iter_mut().find(|existing| existing.id == entry.id) {
            Some(existing) => *existing = entry,
            None => self.entries.push(entry),
        }
    }

    /// Adds runtime-listed models that the catalog does not already describe.
    /// They get no capabilities.
    pub fn register_discovered(&mut self, provider: ProviderKind, ids: impl IntoIterator<Item = String>) {
        for id in ids {
            if self.lookup(&id).is_none() {
                self.entries
                    .push(ModelEntry::new(id, provider, ProviderCapability::default()));
            }
        }
    }

    pub fn lookup(&self, id: &str) -> Option<&ModelEntry> {
        self.entries.iter().find(|entry| entry.id == id)
    }

    pub fn capability(&self, id: &str) -> Option<ProviderCapability> {
        self.lookup(id).map(ModelEntry::capability)
    }

    pub fn models_for(&self, provider: ProviderKind) -> impl Iterator<Item = &ModelEntry> {
        self.entries
            .iter()
            .filter(move |entry| entry.provider == provider)
    }

    pub fn list(&self) -> &[ModelEntry] {
        &self.entries
    }
}
