//! Node Registry - authoritative collection of fleet members
//!
//! Heartbeat ingestion is a single-entry upsert: the update happens while the
//! DashMap entry lock is held, so concurrent heartbeats from the same node
//! cannot interleave into an inconsistent record.

use std::sync::Arc;

use chrono::{Duration, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use super::node::{HeartbeatPayload, MeshReport, NodeState, UNode};

/// Errors from node registry operations
#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("Node '{0}' not found")]
    NodeNotFound(String),

    #[error("Node '{0}' already registered")]
    NodeExists(String),

    #[error("Node '{0}' is retired")]
    NodeRetired(String),
}

impl RegistryError {
    /// Stable error code for the routing layer
    pub fn code(&self) -> &'static str {
        match self {
            RegistryError::NodeNotFound(_) => "NODE_NOT_FOUND",
            RegistryError::NodeExists(_) => "NODE_EXISTS",
            RegistryError::NodeRetired(_) => "NODE_RETIRED",
        }
    }
}

/// A node together with its derived state, for listings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeView {
    #[serde(flatten)]
    pub node: UNode,
    pub state: NodeState,
}

/// Registry of all fleet members
pub struct NodeRegistry {
    nodes: DashMap<String, UNode>,
    staleness_threshold: Duration,
}

impl NodeRegistry {
    /// Create a registry with the given staleness threshold (a small multiple
    /// of the expected heartbeat interval)
    pub fn new(staleness_threshold: Duration) -> Self {
        Self {
            nodes: DashMap::new(),
            staleness_threshold,
        }
    }

    pub fn staleness_threshold(&self) -> Duration {
        self.staleness_threshold
    }

    /// Register a node created by token redemption
    pub fn register(&self, node: UNode) -> Result<(), RegistryError> {
        if self.nodes.contains_key(&node.id) {
            return Err(RegistryError::NodeExists(node.id.clone()));
        }
        debug!(node_id = %node.id, hostname = %node.hostname, "node registered");
        self.nodes.insert(node.id.clone(), node);
        Ok(())
    }

    /// Ingest a heartbeat.
    ///
    /// Idempotent and cheap: refreshes `last_heartbeat_at` and, when the
    /// payload carries them, the advertised capabilities and metrics. The
    /// whole update runs under the entry lock.
    pub fn record_heartbeat(
        &self,
        node_id: &str,
        payload: HeartbeatPayload,
    ) -> Result<(), RegistryError> {
        let mut node = self
            .nodes
            .get_mut(node_id)
            .ok_or_else(|| RegistryError::NodeNotFound(node_id.to_string()))?;

        node.last_heartbeat_at = Some(Utc::now());
        if let Some(capabilities) = payload.capabilities {
            node.capabilities = capabilities;
        }
        if let Some(metrics) = payload.metrics {
            node.metrics = Some(metrics);
        }
        Ok(())
    }

    /// Attach the latest mesh reachability report to a node record
    pub fn apply_mesh_report(&self, node_id: &str, report: MeshReport) -> Result<(), RegistryError> {
        let mut node = self
            .nodes
            .get_mut(node_id)
            .ok_or_else(|| RegistryError::NodeNotFound(node_id.to_string()))?;

        if let Some(address) = &report.address {
            if !node.addresses.contains(address) {
                node.addresses.push(address.clone());
            }
        }
        node.mesh = Some(report);
        Ok(())
    }

    /// Soft-remove a node. The record stays so deployment history keeps a
    /// valid reference; retired nodes are never eligible targets again.
    pub fn retire(&self, node_id: &str) -> Result<(), RegistryError> {
        let mut node = self
            .nodes
            .get_mut(node_id)
            .ok_or_else(|| RegistryError::NodeNotFound(node_id.to_string()))?;

        if node.retired {
            return Err(RegistryError::NodeRetired(node_id.to_string()));
        }
        node.retired = true;
        debug!(node_id, "node retired");
        Ok(())
    }

    /// Get a node by id
    pub fn get(&self, node_id: &str) -> Option<UNode> {
        self.nodes.get(node_id).map(|r| r.clone())
    }

    /// Get a node with its derived state
    pub fn view(&self, node_id: &str) -> Option<NodeView> {
        self.get(node_id).map(|node| {
            let state = node.state(self.staleness_threshold);
            NodeView { node, state }
        })
    }

    /// List every node with its derived state. Offline and retired nodes are
    /// included so operators can inspect them.
    pub fn list(&self) -> Vec<NodeView> {
        let now = Utc::now();
        self.nodes
            .iter()
            .map(|r| NodeView {
                state: r.state_at(now, self.staleness_threshold),
                node: r.clone(),
            })
            .collect()
    }

    /// List nodes advertising a capability, regardless of state
    pub fn list_by_capability(&self, capability: &str) -> Vec<NodeView> {
        self.list()
            .into_iter()
            .filter(|v| v.node.has_capability(capability))
            .collect()
    }

    /// Nodes eligible to receive deployments: online, optionally filtered by
    /// capability
    pub fn eligible_targets(&self, capability: Option<&str>) -> Vec<UNode> {
        let now = Utc::now();
        self.nodes
            .iter()
            .filter(|r| r.state_at(now, self.staleness_threshold) == NodeState::Online)
            .filter(|r| capability.map(|c| r.has_capability(c)).unwrap_or(true))
            .map(|r| r.clone())
            .collect()
    }

    /// Counts by derived state, for the fleet status summary
    pub fn state_counts(&self) -> FleetNodeCounts {
        let now = Utc::now();
        let mut counts = FleetNodeCounts::default();
        for node in self.nodes.iter() {
            match node.state_at(now, self.staleness_threshold) {
                NodeState::Online => counts.online += 1,
                NodeState::Offline => counts.offline += 1,
                NodeState::Unknown => counts.unknown += 1,
                NodeState::Retired => counts.retired += 1,
            }
        }
        counts
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

/// Node counts by derived state
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FleetNodeCounts {
    pub online: usize,
    pub offline: usize,
    pub unknown: usize,
    pub retired: usize,
}

/// Shared handle used across the component graph
pub type SharedNodeRegistry = Arc<NodeRegistry>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fleet::node::{JoinRequestInfo, NodeMetrics, NodeRole, NodeSystemInfo};

    fn registry() -> NodeRegistry {
        NodeRegistry::new(Duration::seconds(45))
    }

    fn test_node(id: &str, capabilities: &[&str]) -> UNode {
        UNode::new(
            id,
            NodeRole::Follower,
            JoinRequestInfo {
                hostname: format!("{}-host", id),
                capabilities: capabilities.iter().map(|c| c.to_string()).collect(),
                addresses: vec![],
                system: NodeSystemInfo::from_system(),
            },
        )
    }

    #[test]
    fn test_register_and_get() {
        let reg = registry();
        reg.register(test_node("n-1", &["llm"])).unwrap();

        assert_eq!(reg.get("n-1").unwrap().hostname, "n-1-host");
    }

    #[test]
    fn test_register_duplicate() {
        let reg = registry();
        reg.register(test_node("n-1", &[])).unwrap();

        assert!(matches!(
            reg.register(test_node("n-1", &[])),
            Err(RegistryError::NodeExists(_))
        ));
    }

    #[test]
    fn test_heartbeat_refreshes_capabilities() {
        let reg = registry();
        reg.register(test_node("n-1", &["llm"])).unwrap();

        reg.record_heartbeat(
            "n-1",
            HeartbeatPayload {
                capabilities: Some(["llm".to_string(), "memory".to_string()].into_iter().collect()),
                metrics: Some(NodeMetrics::default()),
            },
        )
        .unwrap();

        let view = reg.view("n-1").unwrap();
        assert_eq!(view.state, NodeState::Online);
        assert!(view.node.has_capability("memory"));
        assert!(view.node.metrics.is_some());
    }

    #[test]
    fn test_heartbeat_without_payload_keeps_capabilities() {
        let reg = registry();
        reg.register(test_node("n-1", &["llm"])).unwrap();

        reg.record_heartbeat("n-1", HeartbeatPayload::default()).unwrap();

        let node = reg.get("n-1").unwrap();
        assert!(node.has_capability("llm"));
        assert!(node.last_heartbeat_at.is_some());
    }

    #[test]
    fn test_heartbeat_unknown_node() {
        let reg = registry();
        assert!(matches!(
            reg.record_heartbeat("ghost", HeartbeatPayload::default()),
            Err(RegistryError::NodeNotFound(_))
        ));
    }

    #[test]
    fn test_retire_is_soft() {
        let reg = registry();
        reg.register(test_node("n-1", &[])).unwrap();

        reg.retire("n-1").unwrap();

        // Record survives, state is retired, retiring twice errors
        let view = reg.view("n-1").unwrap();
        assert_eq!(view.state, NodeState::Retired);
        assert!(matches!(reg.retire("n-1"), Err(RegistryError::NodeRetired(_))));
    }

    #[test]
    fn test_offline_visible_but_not_eligible() {
        let reg = registry();
        reg.register(test_node("n-1", &["llm"])).unwrap();
        // Never heartbeated: unknown, not eligible

        let listed = reg.list_by_capability("llm");
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].state, NodeState::Unknown);

        assert!(reg.eligible_targets(Some("llm")).is_empty());

        reg.record_heartbeat("n-1", HeartbeatPayload::default()).unwrap();
        assert_eq!(reg.eligible_targets(Some("llm")).len(), 1);
        assert!(reg.eligible_targets(Some("transcription")).is_empty());
    }

    #[test]
    fn test_mesh_report_enriches_addresses() {
        let reg = registry();
        reg.register(test_node("n-1", &[])).unwrap();

        reg.apply_mesh_report(
            "n-1",
            MeshReport {
                reachable: true,
                address: Some("100.64.0.7".to_string()),
                observed_at: Utc::now(),
            },
        )
        .unwrap();

        let node = reg.get("n-1").unwrap();
        assert!(node.addresses.contains(&"100.64.0.7".to_string()));
        assert!(node.mesh.unwrap().reachable);
    }

    #[test]
    fn test_state_counts() {
        let reg = registry();
        reg.register(test_node("n-1", &[])).unwrap();
        reg.register(test_node("n-2", &[])).unwrap();
        reg.record_heartbeat("n-2", HeartbeatPayload::default()).unwrap();
        reg.register(test_node("n-3", &[])).unwrap();
        reg.retire("n-3").unwrap();

        let counts = reg.state_counts();
        assert_eq!(counts.unknown, 1);
        assert_eq!(counts.online, 1);
        assert_eq!(counts.retired, 1);
    }
}
