//! Cluster backend for k8s-type targets
//!
//! The same logical service definition that becomes a container plan on a
//! docker target becomes a workload manifest here: replica spec, environment,
//! and service/ingress exposure, rendered as YAML and applied through the
//! `ClusterApi` seam. The orchestrator never talks to the scheduler's
//! internals, only to this narrow surface.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use super::docker::{ContainerState, EngineError};
use super::dns::{CertificateManifest, CertificateStatus};
use super::ports::{InvalidPortSpec, PortSpec};
use super::target::Workload;
use super::ServiceSpec;

/// A registered cluster the orchestrator can deploy onto
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterRecord {
    /// Stable identifier used in `{identifier}.k8s.{environment}` target ids
    pub id: String,

    /// Cluster API endpoint
    pub api_url: String,

    /// Reachability as last reported; refreshed out of band
    pub reachable: bool,

    pub registered_at: DateTime<Utc>,
}

impl ClusterRecord {
    pub fn new(id: impl Into<String>, api_url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            api_url: api_url.into(),
            reachable: true,
            registered_at: Utc::now(),
        }
    }
}

/// Registry of known clusters, the k8s counterpart to the node registry
#[derive(Default)]
pub struct ClusterRegistry {
    clusters: DashMap<String, ClusterRecord>,
}

impl ClusterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, cluster: ClusterRecord) {
        self.clusters.insert(cluster.id.clone(), cluster);
    }

    pub fn get(&self, id: &str) -> Option<ClusterRecord> {
        self.clusters.get(id).map(|r| r.clone())
    }

    pub fn list(&self) -> Vec<ClusterRecord> {
        self.clusters.iter().map(|r| r.clone()).collect()
    }

    pub fn set_reachable(&self, id: &str, reachable: bool) {
        if let Some(mut cluster) = self.clusters.get_mut(id) {
            cluster.reachable = reachable;
        }
    }
}

/// Workload manifest applied to a cluster
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkloadManifest {
    #[serde(rename = "apiVersion")]
    pub api_version: String,

    /// Kind is always "Workload"
    pub kind: String,

    pub metadata: ManifestMetadata,

    pub spec: WorkloadSpec,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestMetadata {
    pub name: String,

    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkloadSpec {
    pub replicas: u32,

    pub image: String,

    /// Sorted so repeated renders are byte-identical
    #[serde(default)]
    pub env: Vec<EnvVar>,

    #[serde(default)]
    pub ports: Vec<ManifestPort>,

    /// Service/ingress exposure, present when the service wants a domain
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expose: Option<ExposeSpec>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvVar {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestPort {
    #[serde(rename = "containerPort")]
    pub container_port: u16,

    pub protocol: String,

    #[serde(rename = "hostPort", skip_serializing_if = "Option::is_none")]
    pub host_port: Option<u16>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExposeSpec {
    /// Container port the service/ingress routes to
    pub port: u16,

    /// Custom hostname requested for the workload
    pub domain: String,
}

/// Translate a service definition into a workload manifest.
///
/// Pure, like the container-plan translation: malformed ports fail before
/// any cluster call.
pub fn build_workload_manifest(
    service: &ServiceSpec,
    resolved_env: &BTreeMap<String, String>,
) -> Result<WorkloadManifest, InvalidPortSpec> {
    let ports = PortSpec::parse_all(&service.ports)?;

    let mut env_map = resolved_env.clone();
    for (key, value) in &service.env {
        env_map.insert(key.clone(), value.clone());
    }
    let env = env_map
        .into_iter()
        .map(|(name, value)| EnvVar { name, value })
        .collect();

    let manifest_ports: Vec<ManifestPort> = ports
        .iter()
        .map(|p| ManifestPort {
            container_port: p.container_port,
            protocol: p.protocol.as_str().to_uppercase(),
            host_port: p.host_port,
        })
        .collect();

    let expose = service.domain.as_ref().map(|domain| ExposeSpec {
        port: ports.first().map(|p| p.container_port).unwrap_or(80),
        domain: domain.clone(),
    });

    Ok(WorkloadManifest {
        api_version: "ufleet/v1".to_string(),
        kind: "Workload".to_string(),
        metadata: ManifestMetadata {
            name: service.id.clone(),
            labels: BTreeMap::from([(
                "ufleet.io/managed".to_string(),
                "true".to_string(),
            )]),
        },
        spec: WorkloadSpec {
            replicas: service.replicas,
            image: service.image.clone(),
            env,
            ports: manifest_ports,
            expose,
        },
    })
}

/// Render a manifest to the YAML the cluster API consumes
pub fn render_manifest(manifest: &WorkloadManifest) -> Result<String, EngineError> {
    serde_yaml::to_string(manifest).map_err(|e| EngineError::Terminal(e.to_string()))
}

/// Cluster response to an apply call
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppliedWorkload {
    pub name: String,

    /// Port the cluster exposed the workload on, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
}

/// Operations against one cluster's API
#[async_trait]
pub trait ClusterApi: Send + Sync {
    async fn apply_manifest(
        &self,
        cluster: &ClusterRecord,
        manifest: &WorkloadManifest,
    ) -> Result<AppliedWorkload, EngineError>;

    async fn delete_workload(
        &self,
        cluster: &ClusterRecord,
        name: &str,
    ) -> Result<(), EngineError>;

    /// Scale a workload; replicas 0 stops it without removing it
    async fn scale_workload(
        &self,
        cluster: &ClusterRecord,
        name: &str,
        replicas: u32,
    ) -> Result<(), EngineError>;

    async fn workload_state(
        &self,
        cluster: &ClusterRecord,
        name: &str,
    ) -> Result<ContainerState, EngineError>;

    async fn list_pods(&self, cluster: &ClusterRecord) -> Result<Vec<Workload>, EngineError>;

    async fn get_config_map(
        &self,
        cluster: &ClusterRecord,
        name: &str,
    ) -> Result<BTreeMap<String, String>, EngineError>;

    async fn patch_config_map(
        &self,
        cluster: &ClusterRecord,
        name: &str,
        data: &BTreeMap<String, String>,
    ) -> Result<(), EngineError>;

    /// Apply a certificate request; issuance happens asynchronously
    async fn apply_certificate(
        &self,
        cluster: &ClusterRecord,
        manifest: &CertificateManifest,
    ) -> Result<(), EngineError>;

    /// Read the certificate object for a domain, None if not yet created
    async fn get_certificate(
        &self,
        cluster: &ClusterRecord,
        name: &str,
    ) -> Result<Option<CertificateStatus>, EngineError>;
}

/// reqwest-backed cluster client
pub struct HttpClusterApi {
    client: Client,
}

impl HttpClusterApi {
    pub fn new(call_timeout: Duration) -> Self {
        let client = Client::builder()
            .timeout(call_timeout)
            .build()
            .expect("Failed to create HTTP client");
        Self { client }
    }

    async fn expect_success(response: reqwest::Response) -> Result<reqwest::Response, EngineError> {
        let status = response.status();
        if status.is_success() {
            Ok(response)
        } else {
            let body = response.text().await.unwrap_or_default();
            Err(EngineError::from_status(status, body))
        }
    }
}

#[async_trait]
impl ClusterApi for HttpClusterApi {
    async fn apply_manifest(
        &self,
        cluster: &ClusterRecord,
        manifest: &WorkloadManifest,
    ) -> Result<AppliedWorkload, EngineError> {
        let yaml = render_manifest(manifest)?;
        let url = format!("{}/v1/manifests", cluster.api_url);
        let response = self
            .client
            .post(&url)
            .header("content-type", "application/yaml")
            .body(yaml)
            .send()
            .await
            .map_err(EngineError::from_request)?;
        Self::expect_success(response)
            .await?
            .json()
            .await
            .map_err(|e| EngineError::Terminal(e.to_string()))
    }

    async fn delete_workload(&self, cluster: &ClusterRecord, name: &str) -> Result<(), EngineError> {
        let url = format!("{}/v1/workloads/{}", cluster.api_url, name);
        let response = self
            .client
            .delete(&url)
            .send()
            .await
            .map_err(EngineError::from_request)?;
        Self::expect_success(response).await.map(|_| ())
    }

    async fn scale_workload(
        &self,
        cluster: &ClusterRecord,
        name: &str,
        replicas: u32,
    ) -> Result<(), EngineError> {
        let url = format!("{}/v1/workloads/{}/scale", cluster.api_url, name);
        let response = self
            .client
            .patch(&url)
            .json(&serde_json::json!({ "replicas": replicas }))
            .send()
            .await
            .map_err(EngineError::from_request)?;
        Self::expect_success(response).await.map(|_| ())
    }

    async fn workload_state(
        &self,
        cluster: &ClusterRecord,
        name: &str,
    ) -> Result<ContainerState, EngineError> {
        let url = format!("{}/v1/workloads/{}/state", cluster.api_url, name);
        let response = self
            .client
            .get(&url)
            .timeout(Duration::from_secs(5))
            .send()
            .await
            .map_err(EngineError::from_request)?;
        let body: serde_json::Value = Self::expect_success(response)
            .await?
            .json()
            .await
            .map_err(|e| EngineError::Terminal(e.to_string()))?;
        match body["state"].as_str() {
            Some("running") => Ok(ContainerState::Running),
            Some("starting") | Some("pending") => Ok(ContainerState::Starting),
            Some("exited") | Some("failed") => Ok(ContainerState::Exited),
            other => Err(EngineError::Terminal(format!(
                "unrecognized workload state: {:?}",
                other
            ))),
        }
    }

    async fn list_pods(&self, cluster: &ClusterRecord) -> Result<Vec<Workload>, EngineError> {
        let url = format!("{}/v1/pods", cluster.api_url);
        let response = self
            .client
            .get(&url)
            .timeout(Duration::from_secs(5))
            .send()
            .await
            .map_err(EngineError::from_request)?;
        Self::expect_success(response)
            .await?
            .json()
            .await
            .map_err(|e| EngineError::Terminal(e.to_string()))
    }

    async fn get_config_map(
        &self,
        cluster: &ClusterRecord,
        name: &str,
    ) -> Result<BTreeMap<String, String>, EngineError> {
        let url = format!("{}/v1/configmaps/{}", cluster.api_url, name);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(EngineError::from_request)?;
        Self::expect_success(response)
            .await?
            .json()
            .await
            .map_err(|e| EngineError::Terminal(e.to_string()))
    }

    async fn patch_config_map(
        &self,
        cluster: &ClusterRecord,
        name: &str,
        data: &BTreeMap<String, String>,
    ) -> Result<(), EngineError> {
        let url = format!("{}/v1/configmaps/{}", cluster.api_url, name);
        let response = self
            .client
            .patch(&url)
            .json(data)
            .send()
            .await
            .map_err(EngineError::from_request)?;
        Self::expect_success(response).await.map(|_| ())
    }

    async fn apply_certificate(
        &self,
        cluster: &ClusterRecord,
        manifest: &CertificateManifest,
    ) -> Result<(), EngineError> {
        let yaml = serde_yaml::to_string(manifest).map_err(|e| EngineError::Terminal(e.to_string()))?;
        let url = format!("{}/v1/certificates", cluster.api_url);
        let response = self
            .client
            .post(&url)
            .header("content-type", "application/yaml")
            .body(yaml)
            .send()
            .await
            .map_err(EngineError::from_request)?;
        Self::expect_success(response).await.map(|_| ())
    }

    async fn get_certificate(
        &self,
        cluster: &ClusterRecord,
        name: &str,
    ) -> Result<Option<CertificateStatus>, EngineError> {
        let url = format!("{}/v1/certificates/{}", cluster.api_url, name);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(EngineError::from_request)?;
        match Self::expect_success(response).await {
            Ok(response) => response
                .json()
                .await
                .map(Some)
                .map_err(|e| EngineError::Terminal(e.to_string())),
            Err(EngineError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }
}
