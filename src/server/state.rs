use std::sync::Arc;

use crate::config::ConfigStore;
use crate::deploy::{
    ClusterApi, ClusterRegistry, ContainerEngine, DeploymentManager, RetryPolicy,
};
use crate::fleet::join::{derive_key, JoinTokenIssuer};
use crate::fleet::registry::{NodeRegistry, SharedNodeRegistry};
use crate::fleet::default_staleness_threshold;
use crate::provider::template::ProviderRegistry;
use crate::provider::wiring::WiringStore;

/// Shared application state.
///
/// Construction order mirrors the dependency chain: configuration first,
/// then the node registry, the token issuer on top of it, providers and
/// wirings on top of configuration, and the deployment manager last since
/// it consumes everything else.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ConfigStore>,
    pub nodes: SharedNodeRegistry,
    pub clusters: Arc<ClusterRegistry>,
    pub issuer: Arc<JoinTokenIssuer>,
    pub providers: Arc<ProviderRegistry>,
    pub wirings: Arc<WiringStore>,
    pub deployments: Arc<DeploymentManager>,
}

impl AppState {
    pub fn new(
        fleet_id: &str,
        fleet_passphrase: &str,
        config: Arc<ConfigStore>,
        engine: Arc<dyn ContainerEngine>,
        cluster_api: Arc<dyn ClusterApi>,
    ) -> Self {
        let nodes: SharedNodeRegistry = Arc::new(NodeRegistry::new(default_staleness_threshold()));
        let clusters = Arc::new(ClusterRegistry::new());

        let key = derive_key(fleet_passphrase);
        let issuer = Arc::new(JoinTokenIssuer::new(fleet_id, &key, nodes.clone()));

        let providers = Arc::new(ProviderRegistry::new(config.clone()));
        let wirings = Arc::new(WiringStore::new(providers.clone()));

        let deployments = Arc::new(DeploymentManager::new(
            nodes.clone(),
            clusters.clone(),
            wirings.clone(),
            engine,
            cluster_api,
            RetryPolicy::default(),
        ));

        Self {
            config,
            nodes,
            clusters,
            issuer,
            providers,
            wirings,
            deployments,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deploy::{HttpClusterApi, HttpContainerEngine, ENGINE_PORT};
    use std::time::Duration;

    #[test]
    fn test_app_state_creation() {
        let config = Arc::new(ConfigStore::new());
        let engine = Arc::new(HttpContainerEngine::new(
            ENGINE_PORT,
            Duration::from_secs(30),
        ));
        let cluster_api = Arc::new(HttpClusterApi::new(Duration::from_secs(30)));

        let state = AppState::new("fleet-test", "passphrase", config, engine, cluster_api);

        assert!(state.nodes.is_empty());
        assert!(state.issuer.list_tokens().is_empty());
        assert!(state.clusters.list().is_empty());
    }
}
