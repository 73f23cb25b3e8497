//! Deployment manager - places services onto targets
//!
//! Owns the deployment state machine (`pending -> deploying -> running`,
//! `deploying -> failed`, `running -> stopped -> running`, `running ->
//! removing -> gone) and the single point where docker and k8s diverge.
//! Callers address targets by id string only; the backend branch happens
//! exactly once, inside `execute_deploy`.
//!
//! Operations against the same target are serialized through a per-target
//! async mutex so two concurrent lifecycle calls cannot interleave raw
//! engine calls. Operations against different targets run in parallel.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::fleet::registry::NodeRegistry;
use crate::provider::wiring::{WiringError, WiringStore};

use super::dns::DnsAutomation;
use super::docker::{
    build_container_plan, container_name, ContainerEngine, ContainerState, EngineError,
};
use super::k8s::{build_workload_manifest, ClusterApi, ClusterRegistry};
use super::ports::InvalidPortSpec;
use super::target::{DeployTarget, TargetError, TargetMeta, TargetStatus, Workload};
use super::ServiceSpec;

/// Errors from deployment operations
#[derive(Error, Debug)]
pub enum DeployError {
    /// A required capability has no usable wiring; checked before any
    /// backend call
    #[error("Unresolved dependency: service '{service}' requires capability '{capability}': {detail}")]
    UnresolvedDependency {
        service: String,
        capability: String,
        detail: String,
    },

    #[error(transparent)]
    InvalidPortSpec(#[from] InvalidPortSpec),

    #[error(transparent)]
    Target(#[from] TargetError),

    #[error(transparent)]
    Wiring(WiringError),

    /// Target resolved but is not accepting deployments
    #[error("Target '{0}' is offline")]
    TargetOffline(String),

    /// Backend rejected the operation, or transient retries were exhausted
    #[error("Deployment failed: {0}")]
    DeploymentFailed(String),

    #[error("No deployment of service '{service}' on target '{target}'")]
    DeploymentNotFound { service: String, target: String },

    #[error("Deployment of '{service}' on '{target}' is {status}, cannot {operation}")]
    InvalidTransition {
        service: String,
        target: String,
        status: DeploymentStatus,
        operation: &'static str,
    },
}

impl DeployError {
    /// Stable error code for the routing layer
    pub fn code(&self) -> &'static str {
        match self {
            DeployError::UnresolvedDependency { .. } => "UNRESOLVED_DEPENDENCY",
            DeployError::InvalidPortSpec(_) => "INVALID_PORT_SPEC",
            DeployError::Target(e) => e.code(),
            DeployError::Wiring(e) => e.code(),
            DeployError::TargetOffline(_) => "TARGET_OFFLINE",
            DeployError::DeploymentFailed(_) => "DEPLOYMENT_FAILED",
            DeployError::DeploymentNotFound { .. } => "DEPLOYMENT_NOT_FOUND",
            DeployError::InvalidTransition { .. } => "INVALID_TRANSITION",
        }
    }
}

/// Deployment lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeploymentStatus {
    Pending,
    Deploying,
    Running,
    Stopped,
    Removing,
    Failed,
}

impl std::fmt::Display for DeploymentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DeploymentStatus::Pending => "pending",
            DeploymentStatus::Deploying => "deploying",
            DeploymentStatus::Running => "running",
            DeploymentStatus::Stopped => "stopped",
            DeploymentStatus::Removing => "removing",
            DeploymentStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// One service placed onto one target
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Deployment {
    pub id: String,

    pub service_id: String,

    pub target_id: String,

    pub status: DeploymentStatus,

    /// First host/exposed port the backend reported, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host_port: Option<u16>,

    /// Backend handle: container id on docker, workload name on k8s
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backend_ref: Option<String>,

    /// Backend-provided failure detail when status is failed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,

    pub created_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,
}

impl Deployment {
    fn new(service_id: &str, target_id: &str) -> Self {
        let now = Utc::now();
        Self {
            id: format!("dep-{}", Uuid::new_v4()),
            service_id: service_id.to_string(),
            target_id: target_id.to_string(),
            status: DeploymentStatus::Pending,
            host_port: None,
            backend_ref: None,
            detail: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Deployment totals across the fleet
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeploymentCounts {
    pub pending: usize,
    pub deploying: usize,
    pub running: usize,
    pub stopped: usize,
    pub removing: usize,
    pub failed: usize,
}

/// Bounded retry for transient backend failures
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
        }
    }
}

fn deployment_key(service_id: &str, target_id: &str) -> String {
    format!("{}@{}", service_id, target_id)
}

/// Orchestrates service lifecycle across both backends
pub struct DeploymentManager {
    nodes: Arc<NodeRegistry>,
    clusters: Arc<ClusterRegistry>,
    wirings: Arc<WiringStore>,
    engine: Arc<dyn ContainerEngine>,
    cluster_api: Arc<dyn ClusterApi>,
    dns: DnsAutomation,
    deployments: DashMap<String, Deployment>,
    target_locks: DashMap<String, Arc<Mutex<()>>>,
    retry: RetryPolicy,
}

impl DeploymentManager {
    pub fn new(
        nodes: Arc<NodeRegistry>,
        clusters: Arc<ClusterRegistry>,
        wirings: Arc<WiringStore>,
        engine: Arc<dyn ContainerEngine>,
        cluster_api: Arc<dyn ClusterApi>,
        retry: RetryPolicy,
    ) -> Self {
        let dns = DnsAutomation::new(cluster_api.clone());
        Self {
            nodes,
            clusters,
            wirings,
            engine,
            cluster_api,
            dns,
            deployments: DashMap::new(),
            target_locks: DashMap::new(),
            retry,
        }
    }

    /// Lock guarding all lifecycle operations against one target
    fn lock_for(&self, target_id: &str) -> Arc<Mutex<()>> {
        self.target_locks
            .entry(target_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Retry transient backend failures with exponential backoff; terminal
    /// errors pass through on the first attempt.
    async fn with_retry<T, F, Fut>(&self, operation: &str, mut call: F) -> Result<T, EngineError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, EngineError>>,
    {
        let mut delay = self.retry.base_delay;
        let mut attempt = 1;
        loop {
            match call().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < self.retry.max_attempts => {
                    warn!(
                        operation,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "transient backend error, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Resolve the wiring environment for every capability the service
    /// requires. Fails before any backend call so a missing provider never
    /// leaves a half-started deployment behind.
    fn resolve_service_env(
        &self,
        service: &ServiceSpec,
    ) -> Result<BTreeMap<String, String>, DeployError> {
        let mut env = BTreeMap::new();
        for capability in &service.requires {
            let resolved = self
                .wirings
                .resolve(&service.id, capability)
                .map_err(|e| match e {
                    WiringError::NoWiringConfigured { .. }
                    | WiringError::ProviderNotConfigured(_) => DeployError::UnresolvedDependency {
                        service: service.id.clone(),
                        capability: capability.clone(),
                        detail: e.to_string(),
                    },
                    other => DeployError::Wiring(other),
                })?;
            env.extend(resolved);
        }
        Ok(env)
    }

    fn update_deployment(
        &self,
        key: &str,
        apply: impl FnOnce(&mut Deployment),
    ) -> Option<Deployment> {
        let mut entry = self.deployments.get_mut(key)?;
        apply(&mut entry);
        entry.updated_at = Utc::now();
        Some(entry.clone())
    }

    /// Deploy a service onto a target.
    ///
    /// Returns the record in `deploying` status; the reconciliation poll (or
    /// an explicit `reconcile` call) finalizes it as running or failed.
    /// Rejected while a non-failed record exists for the same service and
    /// target; the existing deployment must be removed first.
    pub async fn deploy(
        &self,
        service: &ServiceSpec,
        target_id: &str,
    ) -> Result<Deployment, DeployError> {
        let target = DeployTarget::from_id(target_id, &self.nodes, &self.clusters)?;
        match target.status() {
            TargetStatus::Offline | TargetStatus::Retired => {
                return Err(DeployError::TargetOffline(target_id.to_string()));
            }
            TargetStatus::Online | TargetStatus::Unknown => {}
        }

        // Fail-fast guard: wiring must resolve before the backend is touched
        let resolved_env = self.resolve_service_env(service)?;

        let lock = self.lock_for(target_id);
        let _guard = lock.lock().await;

        let key = deployment_key(&service.id, target_id);
        // A live record must be removed (or have failed) before the same
        // service can be placed on the target again; silently replacing it
        // would orphan the running workload.
        if let Some(existing) = self.deployments.get(&key).map(|r| r.clone()) {
            match existing.status {
                DeploymentStatus::Failed => {}
                status => {
                    return Err(DeployError::InvalidTransition {
                        service: service.id.clone(),
                        target: target_id.to_string(),
                        status,
                        operation: "deploy",
                    });
                }
            }
        }
        self.deployments
            .insert(key.clone(), Deployment::new(&service.id, target_id));
        self.update_deployment(&key, |d| d.status = DeploymentStatus::Deploying);

        info!(service = %service.id, target = target_id, "deploying service");

        match self.execute_deploy(service, &target, &resolved_env).await {
            Ok((backend_ref, host_port)) => {
                let record = self
                    .update_deployment(&key, |d| {
                        d.backend_ref = Some(backend_ref);
                        d.host_port = host_port;
                    })
                    .ok_or_else(|| DeployError::DeploymentNotFound {
                        service: service.id.clone(),
                        target: target_id.to_string(),
                    })?;
                Ok(record)
            }
            Err(e) => {
                error!(service = %service.id, target = target_id, error = %e, "deployment failed");
                self.update_deployment(&key, |d| {
                    d.status = DeploymentStatus::Failed;
                    d.detail = Some(e.to_string());
                });
                Err(DeployError::DeploymentFailed(e.to_string()))
            }
        }
    }

    /// The one place docker and k8s semantics diverge
    async fn execute_deploy(
        &self,
        service: &ServiceSpec,
        target: &DeployTarget,
        resolved_env: &BTreeMap<String, String>,
    ) -> Result<(String, Option<u16>), EngineError> {
        match &target.meta {
            TargetMeta::Node(node) => {
                let name = container_name(&service.id, &target.id.identifier);
                let plan = build_container_plan(service, resolved_env, &name)
                    .map_err(|e| EngineError::Terminal(e.to_string()))?;

                self.with_retry("pull_image", || self.engine.pull_image(node, &service.image))
                    .await?;
                let created = self
                    .with_retry("create_container", || {
                        self.engine.create_container(node, &plan)
                    })
                    .await?;
                self.with_retry("start_container", || {
                    self.engine.start_container(node, &created.id)
                })
                .await?;

                let host_port = created
                    .host_port
                    .or_else(|| plan.binds.values().next().copied());
                Ok((created.id, host_port))
            }
            TargetMeta::Cluster(cluster) => {
                let manifest = build_workload_manifest(service, resolved_env)
                    .map_err(|e| EngineError::Terminal(e.to_string()))?;
                let applied = self
                    .with_retry("apply_manifest", || {
                        self.cluster_api.apply_manifest(cluster, &manifest)
                    })
                    .await?;

                // DNS/cert registration never blocks the deployment; cert
                // readiness is polled separately
                if let Some(domain) = &service.domain {
                    if let Err(e) = self
                        .dns
                        .add_service(cluster, domain, &[service.id.clone()], &applied.name)
                        .await
                    {
                        warn!(domain, error = %e, "dns registration failed");
                    }
                    if let Err(e) = self.dns.request_certificate(cluster, domain).await {
                        warn!(domain, error = %e, "certificate request failed");
                    }
                }

                Ok((applied.name.clone(), applied.port))
            }
        }
    }

    /// Stop a running deployment; `running -> stopped`
    pub async fn stop(&self, service_id: &str, target_id: &str) -> Result<Deployment, DeployError> {
        let target = DeployTarget::from_id(target_id, &self.nodes, &self.clusters)?;
        let lock = self.lock_for(target_id);
        let _guard = lock.lock().await;

        let key = deployment_key(service_id, target_id);
        let deployment = self.get_checked(service_id, target_id)?;
        match deployment.status {
            DeploymentStatus::Running | DeploymentStatus::Deploying => {}
            status => {
                return Err(DeployError::InvalidTransition {
                    service: service_id.to_string(),
                    target: target_id.to_string(),
                    status,
                    operation: "stop",
                })
            }
        }
        let backend_ref = self.backend_ref_checked(&deployment)?;

        let result = match &target.meta {
            TargetMeta::Node(node) => {
                self.with_retry("stop_container", || {
                    self.engine.stop_container(node, &backend_ref)
                })
                .await
            }
            TargetMeta::Cluster(cluster) => {
                self.with_retry("scale_workload", || {
                    self.cluster_api.scale_workload(cluster, &backend_ref, 0)
                })
                .await
            }
        };
        result.map_err(|e| DeployError::DeploymentFailed(e.to_string()))?;

        info!(service = service_id, target = target_id, "deployment stopped");
        self.update_deployment(&key, |d| d.status = DeploymentStatus::Stopped)
            .ok_or_else(|| DeployError::DeploymentNotFound {
                service: service_id.to_string(),
                target: target_id.to_string(),
            })
    }

    /// Restart a stopped deployment; `stopped -> running`
    pub async fn restart(
        &self,
        service_id: &str,
        target_id: &str,
        replicas: u32,
    ) -> Result<Deployment, DeployError> {
        let target = DeployTarget::from_id(target_id, &self.nodes, &self.clusters)?;
        let lock = self.lock_for(target_id);
        let _guard = lock.lock().await;

        let key = deployment_key(service_id, target_id);
        let deployment = self.get_checked(service_id, target_id)?;
        match deployment.status {
            DeploymentStatus::Stopped | DeploymentStatus::Running => {}
            status => {
                return Err(DeployError::InvalidTransition {
                    service: service_id.to_string(),
                    target: target_id.to_string(),
                    status,
                    operation: "restart",
                })
            }
        }
        let backend_ref = self.backend_ref_checked(&deployment)?;

        let result = match &target.meta {
            TargetMeta::Node(node) => {
                self.with_retry("start_container", || {
                    self.engine.start_container(node, &backend_ref)
                })
                .await
            }
            TargetMeta::Cluster(cluster) => {
                self.with_retry("scale_workload", || {
                    self.cluster_api
                        .scale_workload(cluster, &backend_ref, replicas.max(1))
                })
                .await
            }
        };
        result.map_err(|e| DeployError::DeploymentFailed(e.to_string()))?;

        info!(service = service_id, target = target_id, "deployment restarted");
        self.update_deployment(&key, |d| d.status = DeploymentStatus::Running)
            .ok_or_else(|| DeployError::DeploymentNotFound {
                service: service_id.to_string(),
                target: target_id.to_string(),
            })
    }

    /// Tear down a deployment; `-> removing -> (record deleted)`.
    ///
    /// Returns the final record, status `removing`.
    pub async fn remove(
        &self,
        service_id: &str,
        target_id: &str,
    ) -> Result<Deployment, DeployError> {
        let target = DeployTarget::from_id(target_id, &self.nodes, &self.clusters)?;
        let lock = self.lock_for(target_id);
        let _guard = lock.lock().await;

        let key = deployment_key(service_id, target_id);
        let deployment = self.get_checked(service_id, target_id)?;

        self.update_deployment(&key, |d| d.status = DeploymentStatus::Removing);

        if let Some(backend_ref) = deployment.backend_ref.clone() {
            let result = match &target.meta {
                TargetMeta::Node(node) => {
                    self.with_retry("remove_container", || {
                        self.engine.remove_container(node, &backend_ref)
                    })
                    .await
                }
                TargetMeta::Cluster(cluster) => {
                    self.with_retry("delete_workload", || {
                        self.cluster_api.delete_workload(cluster, &backend_ref)
                    })
                    .await
                }
            };
            match result {
                // Already gone on the backend: removal still succeeds
                Ok(()) | Err(EngineError::NotFound(_)) => {}
                Err(e) => {
                    self.update_deployment(&key, |d| {
                        d.status = DeploymentStatus::Failed;
                        d.detail = Some(e.to_string());
                    });
                    return Err(DeployError::DeploymentFailed(e.to_string()));
                }
            }
        }

        info!(service = service_id, target = target_id, "deployment removed");
        let (_, mut record) = self
            .deployments
            .remove(&key)
            .ok_or_else(|| DeployError::DeploymentNotFound {
                service: service_id.to_string(),
                target: target_id.to_string(),
            })?;
        record.status = DeploymentStatus::Removing;
        record.updated_at = Utc::now();
        Ok(record)
    }

    /// Poll the backend for one deployment and finalize `deploying` as
    /// `running` or `failed`. No-op for deployments in other states.
    pub async fn reconcile(
        &self,
        service_id: &str,
        target_id: &str,
    ) -> Result<Deployment, DeployError> {
        let key = deployment_key(service_id, target_id);
        let deployment = self.get_checked(service_id, target_id)?;
        if deployment.status != DeploymentStatus::Deploying {
            return Ok(deployment);
        }
        let backend_ref = self.backend_ref_checked(&deployment)?;
        let target = DeployTarget::from_id(target_id, &self.nodes, &self.clusters)?;

        let state = match &target.meta {
            TargetMeta::Node(node) => self.engine.container_state(node, &backend_ref).await,
            TargetMeta::Cluster(cluster) => {
                self.cluster_api.workload_state(cluster, &backend_ref).await
            }
        };

        let record = match state {
            Ok(ContainerState::Running) => {
                self.update_deployment(&key, |d| d.status = DeploymentStatus::Running)
            }
            Ok(ContainerState::Starting) => Some(deployment),
            Ok(ContainerState::Exited) => self.update_deployment(&key, |d| {
                d.status = DeploymentStatus::Failed;
                d.detail = Some("workload exited during startup".to_string());
            }),
            Err(EngineError::NotFound(detail)) => self.update_deployment(&key, |d| {
                d.status = DeploymentStatus::Failed;
                d.detail = Some(detail);
            }),
            // Transient poll failure: leave deploying, next poll retries
            Err(e) => {
                debug!(service = service_id, target = target_id, error = %e, "reconcile poll failed");
                Some(deployment)
            }
        };
        record.ok_or_else(|| DeployError::DeploymentNotFound {
            service: service_id.to_string(),
            target: target_id.to_string(),
        })
    }

    /// One reconciliation sweep over every deployment stuck in `deploying`
    pub async fn reconcile_all(&self) {
        let in_flight: Vec<(String, String)> = self
            .deployments
            .iter()
            .filter(|d| d.status == DeploymentStatus::Deploying)
            .map(|d| (d.service_id.clone(), d.target_id.clone()))
            .collect();
        for (service_id, target_id) in in_flight {
            if let Err(e) = self.reconcile(&service_id, &target_id).await {
                debug!(service = %service_id, target = %target_id, error = %e, "reconcile skipped");
            }
        }
    }

    pub fn get(&self, service_id: &str, target_id: &str) -> Option<Deployment> {
        self.deployments
            .get(&deployment_key(service_id, target_id))
            .map(|r| r.clone())
    }

    fn get_checked(&self, service_id: &str, target_id: &str) -> Result<Deployment, DeployError> {
        self.get(service_id, target_id)
            .ok_or_else(|| DeployError::DeploymentNotFound {
                service: service_id.to_string(),
                target: target_id.to_string(),
            })
    }

    fn backend_ref_checked(&self, deployment: &Deployment) -> Result<String, DeployError> {
        deployment
            .backend_ref
            .clone()
            .ok_or_else(|| DeployError::DeploymentFailed("deployment has no backend handle".to_string()))
    }

    pub fn list(&self) -> Vec<Deployment> {
        self.deployments.iter().map(|r| r.clone()).collect()
    }

    pub fn list_for_target(&self, target_id: &str) -> Vec<Deployment> {
        self.deployments
            .iter()
            .filter(|r| r.target_id == target_id)
            .map(|r| r.clone())
            .collect()
    }

    /// Status totals for the fleet summary endpoint
    pub fn counts(&self) -> DeploymentCounts {
        let mut counts = DeploymentCounts::default();
        for d in self.deployments.iter() {
            match d.status {
                DeploymentStatus::Pending => counts.pending += 1,
                DeploymentStatus::Deploying => counts.deploying += 1,
                DeploymentStatus::Running => counts.running += 1,
                DeploymentStatus::Stopped => counts.stopped += 1,
                DeploymentStatus::Removing => counts.removing += 1,
                DeploymentStatus::Failed => counts.failed += 1,
            }
        }
        counts
    }

    /// Workloads currently visible on a target, regardless of who placed
    /// them
    pub async fn list_workloads(&self, target_id: &str) -> Result<Vec<Workload>, DeployError> {
        let target = DeployTarget::from_id(target_id, &self.nodes, &self.clusters)?;
        let result = match &target.meta {
            TargetMeta::Node(node) => self.engine.list_containers(node).await,
            TargetMeta::Cluster(cluster) => self.cluster_api.list_pods(cluster).await,
        };
        result.map_err(|e| DeployError::DeploymentFailed(e.to_string()))
    }

    /// Certificate status for a domain on a k8s target
    pub async fn certificate_status(
        &self,
        target_id: &str,
        domain: &str,
    ) -> Result<Option<super::dns::CertificateStatus>, DeployError> {
        let target = DeployTarget::from_id(target_id, &self.nodes, &self.clusters)?;
        match &target.meta {
            TargetMeta::Cluster(cluster) => self
                .dns
                .certificate_status(cluster, domain)
                .await
                .map_err(|e| DeployError::DeploymentFailed(e.to_string())),
            TargetMeta::Node(_) => Err(DeployError::Target(TargetError::InvalidTargetId(
                format!("{} is not a k8s target", target_id),
            ))),
        }
    }
}

/// Background poll finalizing in-flight deployments.
///
/// Returns the shutdown sender; dropping it or sending `true` stops the
/// task.
pub fn spawn_reconciler(
    manager: Arc<DeploymentManager>,
    interval: Duration,
) -> watch::Sender<bool> {
    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    manager.reconcile_all().await;
                }
                result = shutdown_rx.changed() => {
                    if result.is_err() || *shutdown_rx.borrow() {
                        debug!("reconciler shutting down");
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
    use crate::config::ConfigStore;
    use crate::deploy::dns::{CertificateManifest, CertificateStatus, DNS_CONFIG_MAP};
    use crate::deploy::docker::{ContainerPlan, CreatedContainer};
    use crate::deploy::k8s::{AppliedWorkload, ClusterRecord, WorkloadManifest};
    use crate::fleet::node::{JoinRequestInfo, NodeRole, NodeSystemInfo, UNode};
    use crate::provider::template::ProviderRegistry;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    // ---- fakes ----

    #[derive(Default)]
    struct FakeEngine {
        containers: DashMap<String, ContainerState>,
        pull_failures_remaining: AtomicUsize,
        fail_terminal: AtomicBool,
        calls: DashMap<String, usize>,
        in_flight: AtomicBool,
        overlap_detected: AtomicBool,
    }

    impl FakeEngine {
        fn record(&self, call: &str) {
            *self.calls.entry(call.to_string()).or_insert(0) += 1;
        }

        fn call_count(&self, call: &str) -> usize {
            self.calls.get(call).map(|c| *c).unwrap_or(0)
        }

        /// Guard that flags any overlapping engine call
        async fn enter(&self) -> ExclusiveGuard<'_> {
            if self.in_flight.swap(true, Ordering::SeqCst) {
                self.overlap_detected.store(true, Ordering::SeqCst);
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
            ExclusiveGuard { engine: self }
        }
    }

    struct ExclusiveGuard<'a> {
        engine: &'a FakeEngine,
    }

    impl Drop for ExclusiveGuard<'_> {
        fn drop(&mut self) {
            self.engine.in_flight.store(false, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl ContainerEngine for FakeEngine {
        async fn pull_image(&self, _node: &UNode, _image: &str) -> Result<(), EngineError> {
            self.record("pull_image");
            if self.fail_terminal.load(Ordering::SeqCst) {
                return Err(EngineError::Terminal("image not found".to_string()));
            }
            let remaining = self.pull_failures_remaining.load(Ordering::SeqCst);
            if remaining > 0 {
                self.pull_failures_remaining.store(remaining - 1, Ordering::SeqCst);
                return Err(EngineError::Transient("connection refused".to_string()));
            }
            Ok(())
        }

        async fn create_container(
            &self,
            _node: &UNode,
            plan: &ContainerPlan,
        ) -> Result<CreatedContainer, EngineError> {
            self.record("create_container");
            let id = format!("ctr-{}", plan.name);
            self.containers.insert(id.clone(), ContainerState::Starting);
            Ok(CreatedContainer {
                id,
                host_port: plan.binds.values().next().copied(),
            })
        }

        async fn start_container(&self, _node: &UNode, container_id: &str) -> Result<(), EngineError> {
            self.record("start_container");
            let _guard = self.enter().await;
            self.containers
                .insert(container_id.to_string(), ContainerState::Running);
            Ok(())
        }

        async fn stop_container(&self, _node: &UNode, container_id: &str) -> Result<(), EngineError> {
            self.record("stop_container");
            let _guard = self.enter().await;
            self.containers
                .insert(container_id.to_string(), ContainerState::Exited);
            Ok(())
        }

        async fn remove_container(&self, _node: &UNode, container_id: &str) -> Result<(), EngineError> {
            self.record("remove_container");
            self.containers
                .remove(container_id)
                .map(|_| ())
                .ok_or_else(|| EngineError::NotFound(container_id.to_string()))
        }

        async fn container_state(
            &self,
            _node: &UNode,
            container_id: &str,
        ) -> Result<ContainerState, EngineError> {
            self.containers
                .get(container_id)
                .map(|s| *s)
                .ok_or_else(|| EngineError::NotFound(container_id.to_string()))
        }

        async fn list_containers(&self, _node: &UNode) -> Result<Vec<Workload>, EngineError> {
            Ok(self
                .containers
                .iter()
                .map(|r| Workload {
                    name: r.key().clone(),
                    status: format!("{:?}", *r.value()).to_lowercase(),
                })
                .collect())
        }

        async fn container_logs(
            &self,
            _node: &UNode,
            _container_id: &str,
            _tail: usize,
        ) -> Result<String, EngineError> {
            Ok(String::new())
        }
    }

    #[derive(Default)]
    struct FakeClusterApi {
        workloads: DashMap<String, (u32, ContainerState)>,
        config_maps: DashMap<String, BTreeMap<String, String>>,
        certificates: DashMap<String, CertificateStatus>,
    }

    #[async_trait]
    impl ClusterApi for FakeClusterApi {
        async fn apply_manifest(
            &self,
            _cluster: &ClusterRecord,
            manifest: &WorkloadManifest,
        ) -> Result<AppliedWorkload, EngineError> {
            self.workloads.insert(
                manifest.metadata.name.clone(),
                (manifest.spec.replicas, ContainerState::Running),
            );
            Ok(AppliedWorkload {
                name: manifest.metadata.name.clone(),
                port: manifest.spec.ports.first().and_then(|p| p.host_port),
            })
        }

        async fn delete_workload(
            &self,
            _cluster: &ClusterRecord,
            name: &str,
        ) -> Result<(), EngineError> {
            self.workloads
                .remove(name)
                .map(|_| ())
                .ok_or_else(|| EngineError::NotFound(name.to_string()))
        }

        async fn scale_workload(
            &self,
            _cluster: &ClusterRecord,
            name: &str,
            replicas: u32,
        ) -> Result<(), EngineError> {
            let mut entry = self
                .workloads
                .get_mut(name)
                .ok_or_else(|| EngineError::NotFound(name.to_string()))?;
            entry.0 = replicas;
            entry.1 = if replicas == 0 {
                ContainerState::Exited
            } else {
                ContainerState::Running
            };
            Ok(())
        }

        async fn workload_state(
            &self,
            _cluster: &ClusterRecord,
            name: &str,
        ) -> Result<ContainerState, EngineError> {
            self.workloads
                .get(name)
                .map(|r| r.1)
                .ok_or_else(|| EngineError::NotFound(name.to_string()))
        }

        async fn list_pods(&self, _cluster: &ClusterRecord) -> Result<Vec<Workload>, EngineError> {
            Ok(self
                .workloads
                .iter()
                .map(|r| Workload {
                    name: r.key().clone(),
                    status: format!("{:?}", r.value().1).to_lowercase(),
                })
                .collect())
        }

        async fn get_config_map(
            &self,
            _cluster: &ClusterRecord,
            name: &str,
        ) -> Result<BTreeMap<String, String>, EngineError> {
            self.config_maps
                .get(name)
                .map(|r| r.clone())
                .ok_or_else(|| EngineError::NotFound(name.to_string()))
        }

        async fn patch_config_map(
            &self,
            _cluster: &ClusterRecord,
            name: &str,
            data: &BTreeMap<String, String>,
        ) -> Result<(), EngineError> {
            self.config_maps.insert(name.to_string(), data.clone());
            Ok(())
        }

        async fn apply_certificate(
            &self,
            _cluster: &ClusterRecord,
            manifest: &CertificateManifest,
        ) -> Result<(), EngineError> {
            self.certificates.insert(
                manifest.metadata.name.clone(),
                CertificateStatus {
                    ready: false,
                    not_before: None,
                    not_after: None,
                },
            );
            Ok(())
        }

        async fn get_certificate(
            &self,
            _cluster: &ClusterRecord,
            name: &str,
        ) -> Result<Option<CertificateStatus>, EngineError> {
            Ok(self.certificates.get(name).map(|r| r.clone()))
        }
    }

    // ---- setup ----

    struct Harness {
        manager: Arc<DeploymentManager>,
        engine: Arc<FakeEngine>,
        cluster_api: Arc<FakeClusterApi>,
    }

    fn harness() -> Harness {
        let nodes = Arc::new(NodeRegistry::new(chrono::Duration::seconds(45)));
        let mut node = UNode::new(
            "unode-1",
            NodeRole::Follower,
            JoinRequestInfo {
                hostname: "host-1".to_string(),
                capabilities: Default::default(),
                addresses: vec!["10.0.0.5".to_string()],
                system: NodeSystemInfo::from_system(),
            },
        );
        node.last_heartbeat_at = Some(Utc::now());
        nodes.register(node).unwrap();

        let clusters = Arc::new(ClusterRegistry::new());
        clusters.register(ClusterRecord::new("main", "https://10.0.0.2:6443"));

        let config = Arc::new(ConfigStore::new());
        let providers = Arc::new(ProviderRegistry::new(config));
        let wirings = Arc::new(WiringStore::new(providers));

        let engine = Arc::new(FakeEngine::default());
        let cluster_api = Arc::new(FakeClusterApi::default());
        let retry = RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
        };
        let manager = Arc::new(DeploymentManager::new(
            nodes,
            clusters,
            wirings,
            engine.clone(),
            cluster_api.clone(),
            retry,
        ));
        Harness {
            manager,
            engine,
            cluster_api,
        }
    }

    fn service(id: &str, requires: &[&str]) -> ServiceSpec {
        ServiceSpec {
            id: id.to_string(),
            image: format!("ghcr.io/acme/{}:latest", id),
            ports: vec!["8080:80".to_string()],
            env: HashMap::new(),
            requires: requires.iter().map(|r| r.to_string()).collect(),
            replicas: 1,
            domain: None,
        }
    }

    // ---- tests ----

    #[tokio::test]
    async fn test_docker_deploy_then_reconcile_running() {
        let h = harness();
        let svc = service("chat-api", &[]);

        let deployment = h.manager.deploy(&svc, "unode-1.docker.prod").await.unwrap();
        assert_eq!(deployment.status, DeploymentStatus::Deploying);
        assert_eq!(deployment.host_port, Some(8080));
        assert_eq!(h.engine.call_count("pull_image"), 1);
        assert_eq!(h.engine.call_count("create_container"), 1);
        assert_eq!(h.engine.call_count("start_container"), 1);

        let reconciled = h
            .manager
            .reconcile("chat-api", "unode-1.docker.prod")
            .await
            .unwrap();
        assert_eq!(reconciled.status, DeploymentStatus::Running);
    }

    #[tokio::test]
    async fn test_unresolved_dependency_no_backend_call() {
        let h = harness();
        let svc = service("chat-api", &["llm"]);

        let err = h
            .manager
            .deploy(&svc, "unode-1.docker.prod")
            .await
            .unwrap_err();
        assert_eq!(err.code(), "UNRESOLVED_DEPENDENCY");
        // Fail-fast: the engine was never touched
        assert_eq!(h.engine.call_count("pull_image"), 0);
        assert_eq!(h.engine.call_count("create_container"), 0);
    }

    #[tokio::test]
    async fn test_transient_errors_retried_with_backoff() {
        let h = harness();
        h.engine.pull_failures_remaining.store(2, Ordering::SeqCst);

        let deployment = h
            .manager
            .deploy(&service("chat-api", &[]), "unode-1.docker.prod")
            .await
            .unwrap();
        assert_eq!(deployment.status, DeploymentStatus::Deploying);
        // Two transient failures, one success
        assert_eq!(h.engine.call_count("pull_image"), 3);
    }

    #[tokio::test]
    async fn test_transient_retries_exhausted_marks_failed() {
        let h = harness();
        h.engine.pull_failures_remaining.store(10, Ordering::SeqCst);

        let err = h
            .manager
            .deploy(&service("chat-api", &[]), "unode-1.docker.prod")
            .await
            .unwrap_err();
        assert_eq!(err.code(), "DEPLOYMENT_FAILED");
        assert_eq!(h.engine.call_count("pull_image"), 3);

        let record = h.manager.get("chat-api", "unode-1.docker.prod").unwrap();
        assert_eq!(record.status, DeploymentStatus::Failed);
    }

    #[tokio::test]
    async fn test_terminal_error_fails_without_retry() {
        let h = harness();
        h.engine.fail_terminal.store(true, Ordering::SeqCst);

        let err = h
            .manager
            .deploy(&service("chat-api", &[]), "unode-1.docker.prod")
            .await
            .unwrap_err();
        assert_eq!(err.code(), "DEPLOYMENT_FAILED");
        assert_eq!(h.engine.call_count("pull_image"), 1);

        let record = h.manager.get("chat-api", "unode-1.docker.prod").unwrap();
        assert_eq!(record.status, DeploymentStatus::Failed);
        assert!(record.detail.unwrap().contains("image not found"));
    }

    #[tokio::test]
    async fn test_stop_restart_cycle() {
        let h = harness();
        let target = "unode-1.docker.prod";
        h.manager.deploy(&service("chat-api", &[]), target).await.unwrap();
        h.manager.reconcile("chat-api", target).await.unwrap();

        let stopped = h.manager.stop("chat-api", target).await.unwrap();
        assert_eq!(stopped.status, DeploymentStatus::Stopped);

        let restarted = h.manager.restart("chat-api", target, 1).await.unwrap();
        assert_eq!(restarted.status, DeploymentStatus::Running);
    }

    #[tokio::test]
    async fn test_stop_unknown_deployment() {
        let h = harness();
        let err = h
            .manager
            .stop("ghost", "unode-1.docker.prod")
            .await
            .unwrap_err();
        assert_eq!(err.code(), "DEPLOYMENT_NOT_FOUND");
    }

    #[tokio::test]
    async fn test_remove_deletes_record() {
        let h = harness();
        let target = "unode-1.docker.prod";
        h.manager.deploy(&service("chat-api", &[]), target).await.unwrap();

        let removed = h.manager.remove("chat-api", target).await.unwrap();
        assert_eq!(removed.status, DeploymentStatus::Removing);
        assert!(h.manager.get("chat-api", target).is_none());
        assert_eq!(h.engine.call_count("remove_container"), 1);
    }

    #[tokio::test]
    async fn test_redeploy_rejected_while_record_live() {
        let h = harness();
        let target = "unode-1.docker.prod";
        let svc = service("chat-api", &[]);
        h.manager.deploy(&svc, target).await.unwrap();
        h.manager.reconcile("chat-api", target).await.unwrap();
        let original = h.manager.get("chat-api", target).unwrap();

        // A second deploy of the same service must not clobber the running
        // record or orphan its container
        let err = h.manager.deploy(&svc, target).await.unwrap_err();
        assert_eq!(err.code(), "INVALID_TRANSITION");
        assert_eq!(h.engine.call_count("create_container"), 1);
        assert_eq!(h.engine.call_count("stop_container"), 0);
        assert_eq!(h.engine.call_count("remove_container"), 0);
        let record = h.manager.get("chat-api", target).unwrap();
        assert_eq!(record.id, original.id);
        assert_eq!(record.status, DeploymentStatus::Running);

        // Stopped deployments are still live on the backend
        h.manager.stop("chat-api", target).await.unwrap();
        let err = h.manager.deploy(&svc, target).await.unwrap_err();
        assert_eq!(err.code(), "INVALID_TRANSITION");

        // Explicit removal frees the slot
        h.manager.remove("chat-api", target).await.unwrap();
        let fresh = h.manager.deploy(&svc, target).await.unwrap();
        assert_eq!(fresh.status, DeploymentStatus::Deploying);
        assert_ne!(fresh.id, original.id);
    }

    #[tokio::test]
    async fn test_redeploy_allowed_over_failed_record() {
        let h = harness();
        let target = "unode-1.docker.prod";
        h.engine.fail_terminal.store(true, Ordering::SeqCst);
        h.manager
            .deploy(&service("chat-api", &[]), target)
            .await
            .unwrap_err();
        assert_eq!(
            h.manager.get("chat-api", target).unwrap().status,
            DeploymentStatus::Failed
        );

        h.engine.fail_terminal.store(false, Ordering::SeqCst);
        let deployment = h
            .manager
            .deploy(&service("chat-api", &[]), target)
            .await
            .unwrap();
        assert_eq!(deployment.status, DeploymentStatus::Deploying);
    }

    #[tokio::test]
    async fn test_offline_target_rejected() {
        let h = harness();
        // A node whose last heartbeat is far past the staleness threshold
        let mut stale = UNode::new(
            "unode-stale",
            NodeRole::Follower,
            JoinRequestInfo {
                hostname: "host-stale".to_string(),
                capabilities: Default::default(),
                addresses: vec!["10.0.0.9".to_string()],
                system: NodeSystemInfo::from_system(),
            },
        );
        stale.last_heartbeat_at = Some(Utc::now() - chrono::Duration::hours(2));
        h.manager.nodes.register(stale).unwrap();

        let err = h
            .manager
            .deploy(&service("chat-api", &[]), "unode-stale.docker.prod")
            .await
            .unwrap_err();
        assert_eq!(err.code(), "TARGET_OFFLINE");
        assert_eq!(h.engine.call_count("pull_image"), 0);

        let err = h
            .manager
            .deploy(&service("chat-api", &[]), "ghost.docker.prod")
            .await
            .unwrap_err();
        assert_eq!(err.code(), "TARGET_NOT_FOUND");
    }

    #[tokio::test]
    async fn test_concurrent_operations_serialized_per_target() {
        let h = harness();
        let target = "unode-1.docker.prod";
        h.manager.deploy(&service("chat-api", &[]), target).await.unwrap();
        h.manager.reconcile("chat-api", target).await.unwrap();

        // Two stop-then-restart sequences race on the same target; the
        // per-target lock must prevent overlapping raw engine calls
        let m1 = h.manager.clone();
        let m2 = h.manager.clone();
        let t1 = tokio::spawn(async move {
            m1.stop("chat-api", target).await.ok();
            m1.restart("chat-api", target, 1).await.ok();
        });
        let t2 = tokio::spawn(async move {
            m2.stop("chat-api", target).await.ok();
            m2.restart("chat-api", target, 1).await.ok();
        });
        t1.await.unwrap();
        t2.await.unwrap();

        assert!(!h.engine.overlap_detected.load(Ordering::SeqCst));
        let record = h.manager.get("chat-api", target).unwrap();
        assert_eq!(record.status, DeploymentStatus::Running);
    }

    #[tokio::test]
    async fn test_k8s_deploy_with_domain_registers_dns_and_cert() {
        let h = harness();
        let mut svc = service("feed-api", &[]);
        svc.domain = Some("feed.example.com".to_string());

        let deployment = h.manager.deploy(&svc, "main.k8s.prod").await.unwrap();
        assert_eq!(deployment.status, DeploymentStatus::Deploying);
        assert_eq!(deployment.backend_ref.as_deref(), Some("feed-api"));

        // DNS mapping written
        let map = h.cluster_api.config_maps.get(DNS_CONFIG_MAP).unwrap();
        assert_eq!(
            map.get("feed-api.feed.example.com"),
            Some(&"feed-api".to_string())
        );
        // Certificate requested but not yet ready
        let status = h
            .manager
            .certificate_status("main.k8s.prod", "feed.example.com")
            .await
            .unwrap()
            .unwrap();
        assert!(!status.ready);

        let reconciled = h.manager.reconcile("feed-api", "main.k8s.prod").await.unwrap();
        assert_eq!(reconciled.status, DeploymentStatus::Running);
    }

    #[tokio::test]
    async fn test_k8s_stop_scales_to_zero() {
        let h = harness();
        let target = "main.k8s.prod";
        h.manager.deploy(&service("feed-api", &[]), target).await.unwrap();
        h.manager.reconcile("feed-api", target).await.unwrap();

        let stopped = h.manager.stop("feed-api", target).await.unwrap();
        assert_eq!(stopped.status, DeploymentStatus::Stopped);
        assert_eq!(h.cluster_api.workloads.get("feed-api").unwrap().0, 0);
    }

    #[tokio::test]
    async fn test_counts_and_listing() {
        let h = harness();
        h.manager
            .deploy(&service("a", &[]), "unode-1.docker.prod")
            .await
            .unwrap();
        h.manager.deploy(&service("b", &[]), "main.k8s.prod").await.unwrap();
        h.manager.reconcile("a", "unode-1.docker.prod").await.unwrap();

        let counts = h.manager.counts();
        assert_eq!(counts.running, 1);
        assert_eq!(counts.deploying, 1);
        assert_eq!(h.manager.list().len(), 2);
        assert_eq!(h.manager.list_for_target("main.k8s.prod").len(), 1);

        let workloads = h.manager.list_workloads("unode-1.docker.prod").await.unwrap();
        assert_eq!(workloads.len(), 1);
    }

    #[tokio::test]
    async fn test_reconcile_all_finalizes_in_flight() {
        let h = harness();
        h.manager
            .deploy(&service("a", &[]), "unode-1.docker.prod")
            .await
            .unwrap();
        h.manager.reconcile_all().await;
        assert_eq!(
            h.manager.get("a", "unode-1.docker.prod").unwrap().status,
            DeploymentStatus::Running
        );
    }
}
