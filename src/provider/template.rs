//! Provider templates and the capability catalog
//!
//! A capability is an abstract requirement ("llm", "memory"); a provider is a
//! concrete implementation of one. Providers declare an ordered list of
//! environment-variable mappings; a provider is configured iff every required
//! mapping resolves to a non-empty value.

use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::ConfigStore;

/// Errors from the provider registry
#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("Provider '{0}' not found")]
    ProviderNotFound(String),

    #[error("Instance '{0}' not found")]
    InstanceNotFound(String),

    #[error("Instance '{0}' already registered")]
    InstanceExists(String),
}

impl ProviderError {
    /// Stable error code for the routing layer
    pub fn code(&self) -> &'static str {
        match self {
            ProviderError::ProviderNotFound(_) => "PROVIDER_NOT_FOUND",
            ProviderError::InstanceNotFound(_) => "INSTANCE_NOT_FOUND",
            ProviderError::InstanceExists(_) => "INSTANCE_EXISTS",
        }
    }
}

/// One environment-variable mapping of a provider template
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvMapping {
    /// Environment variable injected into the consumer (e.g. "OPENAI_API_KEY")
    pub env_key: String,

    /// Dotted settings path the value is read from
    pub settings_path: String,

    /// Whether the mapping must resolve for the provider to be configured
    #[serde(default)]
    pub required: bool,

    /// Literal fallback checked before the settings store
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,
}

impl EnvMapping {
    /// Resolve this mapping: a non-empty default wins, otherwise the settings
    /// store is consulted. Read-only and side-effect free.
    pub fn resolve(&self, config: &ConfigStore) -> Option<String> {
        if let Some(default) = &self.default {
            if !default.is_empty() {
                return Some(default.clone());
            }
        }
        config.get(&self.settings_path)
    }
}

/// A concrete implementation of a capability
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Provider {
    /// Template name (e.g. "openai")
    pub name: String,

    /// Capability kind this provider satisfies (e.g. "llm")
    pub capability: String,

    /// Ordered environment-variable mappings
    #[serde(default)]
    pub mappings: Vec<EnvMapping>,

    /// Inactive providers are never resolvable
    #[serde(default = "default_active")]
    pub active: bool,
}

fn default_active() -> bool {
    true
}

impl Provider {
    pub fn new(name: impl Into<String>, capability: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            capability: capability.into(),
            mappings: Vec::new(),
            active: true,
        }
    }

    pub fn with_mapping(mut self, mapping: EnvMapping) -> Self {
        self.mappings.push(mapping);
        self
    }

    /// Whether every required mapping resolves to a non-empty value.
    ///
    /// Short-circuits on the first missing required mapping; safe to call
    /// repeatedly.
    pub fn is_configured(&self, config: &ConfigStore) -> bool {
        for mapping in &self.mappings {
            if mapping.required && mapping.resolve(config).is_none() {
                return false;
            }
        }
        true
    }
}

/// A registered instance of a provider template
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderInstance {
    /// Stable instance id
    pub id: String,

    /// Template name the instance was created from
    pub provider: String,

    /// Capability the instance exposes (copied from the template)
    pub capability: String,
}

/// Catalog of provider templates and their registered instances
pub struct ProviderRegistry {
    providers: DashMap<String, Provider>,
    instances: DashMap<String, ProviderInstance>,
    config: Arc<ConfigStore>,
}

impl ProviderRegistry {
    pub fn new(config: Arc<ConfigStore>) -> Self {
        Self {
            providers: DashMap::new(),
            instances: DashMap::new(),
            config,
        }
    }

    pub fn config(&self) -> &ConfigStore {
        &self.config
    }

    /// Register or replace a provider template
    pub fn register_provider(&self, provider: Provider) {
        self.providers.insert(provider.name.clone(), provider);
    }

    pub fn get_provider(&self, name: &str) -> Option<Provider> {
        self.providers.get(name).map(|r| r.clone())
    }

    pub fn list_providers(&self) -> Vec<Provider> {
        self.providers.iter().map(|r| r.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    /// List providers satisfying a capability kind
    pub fn providers_for_capability(&self, capability: &str) -> Vec<Provider> {
        self.providers
            .iter()
            .filter(|r| r.capability == capability)
            .map(|r| r.clone())
            .collect()
    }

    /// Register an instance of an existing template
    pub fn register_instance(
        &self,
        instance_id: impl Into<String>,
        provider_name: &str,
    ) -> Result<ProviderInstance, ProviderError> {
        let id = instance_id.into();
        let provider = self
            .get_provider(provider_name)
            .ok_or_else(|| ProviderError::ProviderNotFound(provider_name.to_string()))?;

        if self.instances.contains_key(&id) {
            return Err(ProviderError::InstanceExists(id));
        }

        let instance = ProviderInstance {
            id: id.clone(),
            provider: provider.name,
            capability: provider.capability,
        };
        self.instances.insert(id, instance.clone());
        Ok(instance)
    }

    pub fn get_instance(&self, instance_id: &str) -> Option<ProviderInstance> {
        self.instances.get(instance_id).map(|r| r.clone())
    }

    /// Whether the named provider has all required mappings resolvable
    pub fn is_configured(&self, provider_name: &str) -> Result<bool, ProviderError> {
        let provider = self
            .get_provider(provider_name)
            .ok_or_else(|| ProviderError::ProviderNotFound(provider_name.to_string()))?;
        Ok(provider.is_configured(&self.config))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn required(env_key: &str, path: &str) -> EnvMapping {
        EnvMapping {
            env_key: env_key.to_string(),
            settings_path: path.to_string(),
            required: true,
            default: None,
        }
    }

    fn registry_with(config: ConfigStore) -> ProviderRegistry {
        ProviderRegistry::new(Arc::new(config))
    }

    #[test]
    fn test_mapping_default_wins() {
        let config = ConfigStore::new();
        config.set("llm.model", "from-settings");

        let mapping = EnvMapping {
            env_key: "MODEL".to_string(),
            settings_path: "llm.model".to_string(),
            required: true,
            default: Some("from-default".to_string()),
        };

        assert_eq!(mapping.resolve(&config), Some("from-default".to_string()));
    }

    #[test]
    fn test_mapping_empty_default_falls_through() {
        let config = ConfigStore::new();
        config.set("llm.model", "from-settings");

        let mapping = EnvMapping {
            env_key: "MODEL".to_string(),
            settings_path: "llm.model".to_string(),
            required: true,
            default: Some(String::new()),
        };

        assert_eq!(mapping.resolve(&config), Some("from-settings".to_string()));
    }

    #[test]
    fn test_is_configured_short_circuits_on_missing_required() {
        let config = ConfigStore::new();
        let provider = Provider::new("openai", "llm")
            .with_mapping(required("OPENAI_API_KEY", "llm.openai.api_key"))
            .with_mapping(required("OPENAI_BASE_URL", "llm.openai.base_url"));

        assert!(!provider.is_configured(&config));
    }

    #[test]
    fn test_is_configured_monotonic() {
        let config = ConfigStore::new();
        let provider = Provider::new("openai", "llm")
            .with_mapping(required("OPENAI_API_KEY", "llm.openai.api_key"));

        assert!(!provider.is_configured(&config));

        // Adding the missing value flips it to true
        config.set("llm.openai.api_key", "sk-test");
        assert!(provider.is_configured(&config));
    }

    #[test]
    fn test_optional_mapping_never_blocks() {
        let config = ConfigStore::new();
        let provider = Provider::new("openai", "llm").with_mapping(EnvMapping {
            env_key: "OPENAI_ORG".to_string(),
            settings_path: "llm.openai.org".to_string(),
            required: false,
            default: None,
        });

        assert!(provider.is_configured(&config));
    }

    #[test]
    fn test_instance_registration() {
        let registry = registry_with(ConfigStore::new());
        registry.register_provider(Provider::new("openai", "llm"));

        let instance = registry.register_instance("inst-1", "openai").unwrap();
        assert_eq!(instance.capability, "llm");

        assert!(matches!(
            registry.register_instance("inst-1", "openai"),
            Err(ProviderError::InstanceExists(_))
        ));
        assert!(matches!(
            registry.register_instance("inst-2", "missing"),
            Err(ProviderError::ProviderNotFound(_))
        ));
    }

    #[test]
    fn test_providers_for_capability() {
        let registry = registry_with(ConfigStore::new());
        registry.register_provider(Provider::new("openai", "llm"));
        registry.register_provider(Provider::new("ollama", "llm"));
        registry.register_provider(Provider::new("qdrant", "memory"));

        assert_eq!(registry.providers_for_capability("llm").len(), 2);
        assert_eq!(registry.providers_for_capability("memory").len(), 1);
        assert!(registry.providers_for_capability("transcription").is_empty());
    }
}
