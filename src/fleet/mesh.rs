//! Mesh-networking collaborator seam
//!
//! The orchestrator does not implement tunneling; an external mesh component
//! reports whether a node is reachable and on which address. Reports enrich
//! the node record but never override heartbeat-derived state.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::node::MeshReport;
use super::registry::SharedNodeRegistry;

/// Connectivity reporter implemented by the external mesh collaborator
#[async_trait]
pub trait MeshNetwork: Send + Sync {
    /// Current reachability of a node, None if the mesh does not know it
    async fn reachability(&self, node_id: &str) -> Option<MeshReport>;
}

/// In-memory mesh used in tests and single-host setups
#[derive(Default)]
pub struct StaticMesh {
    reports: DashMap<String, MeshReport>,
}

impl StaticMesh {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_reachable(&self, node_id: impl Into<String>, address: impl Into<String>) {
        self.reports.insert(
            node_id.into(),
            MeshReport {
                reachable: true,
                address: Some(address.into()),
                observed_at: Utc::now(),
            },
        );
    }

    pub fn set_unreachable(&self, node_id: impl Into<String>) {
        self.reports.insert(
            node_id.into(),
            MeshReport {
                reachable: false,
                address: None,
                observed_at: Utc::now(),
            },
        );
    }
}

#[async_trait]
impl MeshNetwork for StaticMesh {
    async fn reachability(&self, node_id: &str) -> Option<MeshReport> {
        self.reports.get(node_id).map(|r| r.clone())
    }
}

/// Spawn the background task that folds mesh reports into node records.
///
/// Returns a shutdown sender; dropping it or sending `true` stops the loop.
pub fn spawn_mesh_enrichment(
    mesh: Arc<dyn MeshNetwork>,
    registry: SharedNodeRegistry,
    interval: Duration,
) -> watch::Sender<bool> {
    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

    tokio::spawn(async move {
        info!(interval_secs = interval.as_secs(), "mesh enrichment task started");
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    for view in registry.list() {
                        let node_id = view.node.id;
                        match mesh.reachability(&node_id).await {
                            Some(report) => {
                                debug!(node_id = %node_id, reachable = report.reachable, "mesh report");
                                if let Err(e) = registry.apply_mesh_report(&node_id, report) {
                                    warn!(node_id = %node_id, error = %e, "failed to apply mesh report");
                                }
                            }
                            None => {}
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("mesh enrichment task shutting down");
                        break;
                    }
                }
            }
        }
    });

    shutdown_tx
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_mesh_reports() {
        let mesh = StaticMesh::new();
        mesh.set_reachable("n-1", "100.64.0.3");
        mesh.set_unreachable("n-2");

        let report = mesh.reachability("n-1").await.unwrap();
        assert!(report.reachable);
        assert_eq!(report.address.as_deref(), Some("100.64.0.3"));

        assert!(!mesh.reachability("n-2").await.unwrap().reachable);
        assert!(mesh.reachability("ghost").await.is_none());
    }
}
