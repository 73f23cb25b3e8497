//! Wiring: binding capability consumers to provider instances
//!
//! A wiring is a directed edge from a consumer instance's declared capability
//! to one concrete provider instance. At most one active wiring exists per
//! `(source_instance_id, source_capability)` pair; rewiring replaces the
//! previous edge (last-write-wins, callers read-before-write if they care).

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use super::template::ProviderRegistry;

/// Environment produced by resolving a wiring: env_key -> concrete value
pub type ResolvedEnv = HashMap<String, String>;

/// Errors from wiring operations
#[derive(Error, Debug)]
pub enum WiringError {
    #[error("No wiring configured for instance '{instance}' capability '{capability}'")]
    NoWiringConfigured { instance: String, capability: String },

    #[error("Provider '{0}' is not configured")]
    ProviderNotConfigured(String),

    #[error("Instance '{0}' not found")]
    InstanceNotFound(String),

    #[error("Provider '{0}' not found")]
    ProviderNotFound(String),

    #[error("Instance '{instance}' exposes capability '{exposes}', not '{requested}'")]
    CapabilityMismatch {
        instance: String,
        exposes: String,
        requested: String,
    },
}

impl WiringError {
    /// Stable error code for the routing layer
    pub fn code(&self) -> &'static str {
        match self {
            WiringError::NoWiringConfigured { .. } => "NO_WIRING_CONFIGURED",
            WiringError::ProviderNotConfigured(_) => "PROVIDER_NOT_CONFIGURED",
            WiringError::InstanceNotFound(_) => "INSTANCE_NOT_FOUND",
            WiringError::ProviderNotFound(_) => "PROVIDER_NOT_FOUND",
            WiringError::CapabilityMismatch { .. } => "CAPABILITY_MISMATCH",
        }
    }
}

/// A consumer-to-provider binding
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Wiring {
    pub source_instance_id: String,
    pub source_capability: String,
    pub target_instance_id: String,
    pub target_capability: String,
    pub created_at: DateTime<Utc>,
}

/// Store of active wirings, keyed by `(source_instance_id, source_capability)`
pub struct WiringStore {
    wirings: DashMap<String, Wiring>,
    providers: Arc<ProviderRegistry>,
}

fn wiring_key(source_instance_id: &str, source_capability: &str) -> String {
    format!("{}/{}", source_instance_id, source_capability)
}

impl WiringStore {
    pub fn new(providers: Arc<ProviderRegistry>) -> Self {
        Self {
            wirings: DashMap::new(),
            providers,
        }
    }

    /// Create or replace the wiring for a source pair.
    ///
    /// Validates that the target instance actually exposes the requested
    /// capability, then upserts: any prior wiring for the same pair is
    /// replaced, never stacked.
    pub fn create_wiring(
        &self,
        source_instance_id: &str,
        source_capability: &str,
        target_instance_id: &str,
        target_capability: &str,
    ) -> Result<Wiring, WiringError> {
        let target = self
            .providers
            .get_instance(target_instance_id)
            .ok_or_else(|| WiringError::InstanceNotFound(target_instance_id.to_string()))?;

        if target.capability != target_capability {
            return Err(WiringError::CapabilityMismatch {
                instance: target_instance_id.to_string(),
                exposes: target.capability,
                requested: target_capability.to_string(),
            });
        }

        let wiring = Wiring {
            source_instance_id: source_instance_id.to_string(),
            source_capability: source_capability.to_string(),
            target_instance_id: target_instance_id.to_string(),
            target_capability: target_capability.to_string(),
            created_at: Utc::now(),
        };

        let key = wiring_key(source_instance_id, source_capability);
        let replaced = self.wirings.insert(key, wiring.clone());
        debug!(
            source = source_instance_id,
            capability = source_capability,
            target = target_instance_id,
            replaced = replaced.is_some(),
            "wiring upserted"
        );
        Ok(wiring)
    }

    /// Remove the wiring for a source pair, returning it if present
    pub fn delete_wiring(&self, source_instance_id: &str, source_capability: &str) -> Option<Wiring> {
        self.wirings
            .remove(&wiring_key(source_instance_id, source_capability))
            .map(|(_, w)| w)
    }

    /// Get the active wiring for a source pair
    pub fn get_wiring(&self, source_instance_id: &str, source_capability: &str) -> Option<Wiring> {
        self.wirings
            .get(&wiring_key(source_instance_id, source_capability))
            .map(|r| r.clone())
    }

    /// All wirings consumed by an instance
    pub fn list_for_instance(&self, source_instance_id: &str) -> Vec<Wiring> {
        self.wirings
            .iter()
            .filter(|r| r.source_instance_id == source_instance_id)
            .map(|r| r.clone())
            .collect()
    }

    /// Resolve the wiring for a source pair into the concrete environment to
    /// inject into the consumer's deployment.
    ///
    /// Deterministic: the same wiring against the same settings snapshot
    /// yields the same environment.
    pub fn resolve(
        &self,
        source_instance_id: &str,
        source_capability: &str,
    ) -> Result<ResolvedEnv, WiringError> {
        let wiring = self
            .get_wiring(source_instance_id, source_capability)
            .ok_or_else(|| WiringError::NoWiringConfigured {
                instance: source_instance_id.to_string(),
                capability: source_capability.to_string(),
            })?;

        let target = self
            .providers
            .get_instance(&wiring.target_instance_id)
            .ok_or_else(|| WiringError::InstanceNotFound(wiring.target_instance_id.clone()))?;

        let provider = self
            .providers
            .get_provider(&target.provider)
            .ok_or_else(|| WiringError::ProviderNotFound(target.provider.clone()))?;

        if !provider.active || !provider.is_configured(self.providers.config()) {
            return Err(WiringError::ProviderNotConfigured(provider.name));
        }

        // Evaluate every mapping, required and optional, the same way
        // is_configured does; optional mappings that do not resolve are
        // simply omitted.
        let mut env = ResolvedEnv::new();
        for mapping in &provider.mappings {
            if let Some(value) = mapping.resolve(self.providers.config()) {
                env.insert(mapping.env_key.clone(), value);
            }
        }
        Ok(env)
    }
}
