//! Fleet membership: nodes, join tokens, heartbeats
//!
//! A fleet is the set of all registered UNodes under one orchestrator. New
//! nodes authenticate with a single-use join token, then stay visible through
//! periodic heartbeats. Liveness is derived, never stored: a node is online
//! iff its last heartbeat is within the staleness threshold.

pub mod heartbeat;
pub mod join;
pub mod mesh;
pub mod metrics;
pub mod node;
pub mod registry;

pub use heartbeat::{spawn_heartbeat, HeartbeatClient, HeartbeatConfig, HeartbeatError};
pub use join::{
    derive_key, IssuedToken, JoinError, JoinTokenIssuer, JoinTokenRecord, DEFAULT_TOKEN_TTL_SECS,
};
pub use mesh::{spawn_mesh_enrichment, MeshNetwork, StaticMesh};
pub use metrics::{new_shared_collector, MetricsCollector, SharedMetricsCollector};
pub use node::{
    HeartbeatPayload, JoinRequestInfo, MeshReport, NodeMetrics, NodeRole, NodeState,
    NodeSystemInfo, UNode,
};
pub use registry::{FleetNodeCounts, NodeRegistry, NodeView, RegistryError, SharedNodeRegistry};

/// Default control plane API port
pub const CONTROL_PLANE_PORT: u16 = 7070;

/// Default heartbeat interval in seconds
pub const HEARTBEAT_INTERVAL_SECS: u64 = 15;

/// Heartbeats older than this multiple of the interval mark a node offline
pub const STALENESS_MULTIPLIER: u64 = 3;

/// Default staleness threshold derived from the heartbeat interval
pub fn default_staleness_threshold() -> chrono::Duration {
    chrono::Duration::seconds((HEARTBEAT_INTERVAL_SECS * STALENESS_MULTIPLIER) as i64)
}
