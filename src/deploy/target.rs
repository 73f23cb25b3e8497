//! Deploy targets - addressable placement destinations
//!
//! A target identifier has the shape `{identifier}.{type}.{environment}`
//! with `type` one of `docker` or `k8s`. Targets are never persisted; they
//! are derived on demand by parsing the id and looking the identifier up in
//! the node registry (docker) or the cluster registry (k8s). Callers above
//! this layer never branch on platform type: the kind is matched exhaustively
//! once, in the deployment manager's translation step.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::fleet::node::{NodeState, UNode};
use crate::fleet::registry::NodeRegistry;

use super::k8s::{ClusterRecord, ClusterRegistry};

/// Errors resolving a deploy target
#[derive(Error, Debug)]
pub enum TargetError {
    #[error("Invalid target id '{0}'")]
    InvalidTargetId(String),

    #[error("Target '{0}' not found")]
    TargetNotFound(String),
}

impl TargetError {
    /// Stable error code for the routing layer
    pub fn code(&self) -> &'static str {
        match self {
            TargetError::InvalidTargetId(_) => "INVALID_TARGET_ID",
            TargetError::TargetNotFound(_) => "TARGET_NOT_FOUND",
        }
    }
}

/// Platform backend of a target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetKind {
    Docker,
    K8s,
}

impl TargetKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TargetKind::Docker => "docker",
            TargetKind::K8s => "k8s",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "docker" => Some(TargetKind::Docker),
            "k8s" => Some(TargetKind::K8s),
            _ => None,
        }
    }
}

/// Parsed three-segment target identifier
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetId {
    pub identifier: String,
    pub kind: TargetKind,
    pub environment: String,
}

impl TargetId {
    pub fn new(
        identifier: impl Into<String>,
        kind: TargetKind,
        environment: impl Into<String>,
    ) -> Self {
        Self {
            identifier: identifier.into(),
            kind,
            environment: environment.into(),
        }
    }

    /// Parse `{identifier}.{type}.{environment}`.
    ///
    /// Split right-to-left so the identifier segment may itself contain dots.
    pub fn parse(id: &str) -> Result<Self, TargetError> {
        let malformed = || TargetError::InvalidTargetId(id.to_string());

        let mut parts = id.rsplitn(3, '.');
        let environment = parts.next().filter(|s| !s.is_empty()).ok_or_else(malformed)?;
        let kind_str = parts.next().filter(|s| !s.is_empty()).ok_or_else(malformed)?;
        let identifier = parts.next().filter(|s| !s.is_empty()).ok_or_else(malformed)?;

        let kind = TargetKind::parse(kind_str).ok_or_else(malformed)?;

        Ok(Self {
            identifier: identifier.to_string(),
            kind,
            environment: environment.to_string(),
        })
    }
}

impl fmt::Display for TargetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{}.{}",
            self.identifier,
            self.kind.as_str(),
            self.environment
        )
    }
}

/// Liveness of a target, regardless of backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetStatus {
    Online,
    Offline,
    Unknown,
    Retired,
}

/// Backend-specific metadata, populated when the target is resolved.
///
/// The single tagged union the deployment manager matches on.
#[derive(Debug, Clone)]
pub enum TargetMeta {
    Node(UNode),
    Cluster(ClusterRecord),
}

/// A resolved deploy target
#[derive(Debug, Clone)]
pub struct DeployTarget {
    pub id: TargetId,
    pub meta: TargetMeta,
    status: TargetStatus,
}

impl DeployTarget {
    /// Resolve a target id against the registries.
    ///
    /// `docker` identifiers resolve in the node registry, `k8s` identifiers
    /// in the cluster registry.
    pub fn from_id(
        target_id: &str,
        nodes: &Arc<NodeRegistry>,
        clusters: &Arc<ClusterRegistry>,
    ) -> Result<Self, TargetError> {
        let id = TargetId::parse(target_id)?;

        match id.kind {
            TargetKind::Docker => {
                let node = nodes
                    .get(&id.identifier)
                    .ok_or_else(|| TargetError::TargetNotFound(target_id.to_string()))?;
                let status = match node.state(nodes.staleness_threshold()) {
                    NodeState::Online => TargetStatus::Online,
                    NodeState::Offline => TargetStatus::Offline,
                    NodeState::Unknown => TargetStatus::Unknown,
                    NodeState::Retired => TargetStatus::Retired,
                };
                Ok(Self {
                    id,
                    meta: TargetMeta::Node(node),
                    status,
                })
            }
            TargetKind::K8s => {
                let cluster = clusters
                    .get(&id.identifier)
                    .ok_or_else(|| TargetError::TargetNotFound(target_id.to_string()))?;
                let status = if cluster.reachable {
                    TargetStatus::Online
                } else {
                    TargetStatus::Offline
                };
                Ok(Self {
                    id,
                    meta: TargetMeta::Cluster(cluster),
                    status,
                })
            }
        }
    }

    /// Liveness at resolution time
    pub fn status(&self) -> TargetStatus {
        self.status
    }

    pub fn kind(&self) -> TargetKind {
        self.id.kind
    }
}

/// A workload visible on a target, backend-agnostic
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workload {
    pub name: String,
    pub status: String,
}
