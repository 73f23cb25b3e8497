//! UNode - a registered execution host in the fleet
//!
//! A UNode is a machine that can run containerized services. Each node:
//! - Joins the fleet by redeeming a single-use join token
//! - Advertises the capability kinds it can host
//! - Sends heartbeats to stay visible as a deploy target
//!
//! Node state is never stored: it is derived from `last_heartbeat_at` and a
//! staleness threshold, so no background job has to flip records and replicas
//! of the orchestrator cannot disagree about liveness.

use std::collections::BTreeSet;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Role of a node inside the fleet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    /// Runs the control plane alongside workloads
    Leader,
    /// Workload-only member
    #[default]
    Follower,
}

/// Derived liveness state of a node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeState {
    /// Heartbeat seen within the staleness threshold
    Online,
    /// Heartbeat older than the staleness threshold
    Offline,
    /// No heartbeat ever recorded
    Unknown,
    /// Soft-removed by an operator; record kept for deployment history
    Retired,
}

/// A fleet member
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UNode {
    /// Stable identifier, assigned at join time
    pub id: String,

    /// Hostname reported by the node
    pub hostname: String,

    /// Leader/follower role
    #[serde(default)]
    pub role: NodeRole,

    /// Capability kinds this node can host (e.g. "llm", "memory")
    #[serde(default)]
    pub capabilities: BTreeSet<String>,

    /// Network addresses the node is reachable on
    #[serde(default)]
    pub addresses: Vec<String>,

    /// When the node joined the fleet
    pub created_at: DateTime<Utc>,

    /// Last heartbeat received, None until the first one arrives
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_heartbeat_at: Option<DateTime<Utc>>,

    /// Soft-removal flag; retired nodes stay for referential integrity
    #[serde(default)]
    pub retired: bool,

    /// Latest metrics carried by a heartbeat
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metrics: Option<NodeMetrics>,

    /// Latest reachability report from the mesh collaborator
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mesh: Option<MeshReport>,

    /// System information reported at join time
    pub system: NodeSystemInfo,
}

/// Utilization figures carried by heartbeats
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct NodeMetrics {
    /// CPU utilization percentage (0.0 - 100.0)
    #[serde(default)]
    pub cpu_usage_percent: f64,

    /// Memory utilization percentage (0.0 - 100.0)
    #[serde(default)]
    pub memory_usage_percent: f64,

    /// Disk utilization percentage (0.0 - 100.0)
    #[serde(default)]
    pub disk_usage_percent: f64,

    /// Timestamp when metrics were collected
    #[serde(default = "Utc::now")]
    pub collected_at: DateTime<Utc>,
}

/// Reachability report from the mesh-networking collaborator.
///
/// Enriches (never replaces) heartbeat-derived state: a node the mesh cannot
/// reach is still `Online` if its heartbeats arrive.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeshReport {
    /// Whether the mesh currently reports the node reachable
    pub reachable: bool,

    /// Address the mesh routes to, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,

    /// When the report was taken
    pub observed_at: DateTime<Utc>,
}

/// System information about a node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSystemInfo {
    /// Operating system
    pub os: String,

    /// Architecture (x86_64, aarch64)
    pub architecture: String,

    /// ufleet version running on the node
    pub version: String,
}

impl NodeSystemInfo {
    /// Gather info from the current system
    pub fn from_system() -> Self {
        Self {
            os: std::env::consts::OS.to_string(),
            architecture: std::env::consts::ARCH.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// What a joining node reports about itself at redemption time
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinRequestInfo {
    pub hostname: String,

    #[serde(default)]
    pub capabilities: BTreeSet<String>,

    #[serde(default)]
    pub addresses: Vec<String>,

    pub system: NodeSystemInfo,
}

/// Heartbeat body sent by a node on its fixed interval
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct HeartbeatPayload {
    /// Refreshed capability set, None leaves the advertised set untouched
    #[serde(skip_serializing_if = "Option::is_none")]
    pub capabilities: Option<BTreeSet<String>>,

    /// Current utilization, if the node collects it
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metrics: Option<NodeMetrics>,
}

impl UNode {
    /// Create a node record at join time
    pub fn new(id: impl Into<String>, role: NodeRole, info: JoinRequestInfo) -> Self {
        Self {
            id: id.into(),
            hostname: info.hostname,
            role,
            capabilities: info.capabilities,
            addresses: info.addresses,
            created_at: Utc::now(),
            last_heartbeat_at: None,
            retired: false,
            metrics: None,
            mesh: None,
            system: info.system,
        }
    }

    /// Derive the node state at `now` given the staleness threshold.
    ///
    /// Pure function of the stored record: crossing the threshold flips the
    /// state without any write.
    pub fn state_at(&self, now: DateTime<Utc>, staleness_threshold: Duration) -> NodeState {
        if self.retired {
            return NodeState::Retired;
        }
        match self.last_heartbeat_at {
            None => NodeState::Unknown,
            Some(at) if now - at <= staleness_threshold => NodeState::Online,
            Some(_) => NodeState::Offline,
        }
    }

    /// Derive the state against the current clock
    pub fn state(&self, staleness_threshold: Duration) -> NodeState {
        self.state_at(Utc::now(), staleness_threshold)
    }

    /// Whether this node can receive new deployments
    pub fn is_eligible_target(&self, staleness_threshold: Duration) -> bool {
        self.state(staleness_threshold) == NodeState::Online
    }

    /// Whether the node advertises a capability kind
    pub fn has_capability(&self, capability: &str) -> bool {
        self.capabilities.contains(capability)
    }
}
