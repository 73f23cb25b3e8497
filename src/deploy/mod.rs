//! Service deployment across the fleet
//!
//! A [`ServiceSpec`] is the platform-neutral description of what to run; a
//! target id string names where. The [`manager`] module owns the lifecycle,
//! [`target`] resolves ids against the registries, and [`docker`]/[`k8s`]
//! carry the two backend translations. [`dns`] handles hostname and
//! certificate automation for cluster targets.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

pub mod dns;
pub mod docker;
pub mod k8s;
pub mod manager;
pub mod ports;
pub mod target;

pub use dns::{CertificateStatus, DnsAutomation, DnsOutcome};
pub use docker::{ContainerEngine, EngineError, HttpContainerEngine};
pub use k8s::{ClusterApi, ClusterRecord, ClusterRegistry, HttpClusterApi};
pub use manager::{
    spawn_reconciler, DeployError, Deployment, DeploymentCounts, DeploymentManager,
    DeploymentStatus, RetryPolicy,
};
pub use ports::{InvalidPortSpec, PortSpec, Protocol};
pub use target::{DeployTarget, TargetError, TargetId, TargetKind, TargetStatus, Workload};

/// Port the node agent's container-engine endpoint listens on
pub const ENGINE_PORT: u16 = 7071;

/// Platform-neutral definition of a deployable service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceSpec {
    /// Stable service identifier, also the workload name on k8s
    pub id: String,

    /// Image reference
    pub image: String,

    /// Port specs in `"host:container[/proto]"` form
    #[serde(default)]
    pub ports: Vec<String>,

    /// Service-defined environment; overrides wiring-injected values
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Capability kinds the service needs wired before it can run
    #[serde(default)]
    pub requires: Vec<String>,

    #[serde(default = "default_replicas")]
    pub replicas: u32,

    /// Custom hostname; triggers DNS/certificate automation on k8s targets
    #[serde(skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
}

fn default_replicas() -> u32 {
    1
}
