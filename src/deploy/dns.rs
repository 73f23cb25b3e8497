//! Cluster DNS and certificate automation
//!
//! Maps services to custom hostnames through the cluster's DNS ConfigMap and
//! requests TLS material by applying certificate manifests. The ConfigMap
//! update is idempotent: identical mappings are a no-op, drifted ones are
//! diffed and patched. Certificate issuance belongs to the cluster's
//! controller; this component only requests and reports.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::docker::EngineError;
use super::k8s::{ClusterApi, ClusterRecord};

/// Name of the ConfigMap holding hostname -> service mappings
pub const DNS_CONFIG_MAP: &str = "ufleet-dns";

/// Read-only certificate report derived from the cluster's certificate object
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CertificateStatus {
    pub ready: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub not_before: Option<DateTime<Utc>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub not_after: Option<DateTime<Utc>>,
}

/// Certificate request applied to the cluster
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CertificateManifest {
    #[serde(rename = "apiVersion")]
    pub api_version: String,

    /// Kind is always "Certificate"
    pub kind: String,

    pub metadata: CertificateMetadata,

    pub spec: CertificateSpec,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CertificateMetadata {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CertificateSpec {
    #[serde(rename = "dnsNames")]
    pub dns_names: Vec<String>,

    #[serde(rename = "secretName")]
    pub secret_name: String,
}

/// Derive the certificate object name for a domain
pub fn certificate_name(domain: &str) -> String {
    format!("{}-tls", domain.replace('.', "-"))
}

/// Build the certificate request for a domain
pub fn build_certificate_manifest(domain: &str) -> CertificateManifest {
    let name = certificate_name(domain);
    CertificateManifest {
        api_version: "ufleet/v1".to_string(),
        kind: "Certificate".to_string(),
        metadata: CertificateMetadata { name: name.clone() },
        spec: CertificateSpec {
            dns_names: vec![domain.to_string()],
            secret_name: name,
        },
    }
}

/// Desired DNS entries for a service: `shortname.domain` -> service name
pub fn desired_entries(
    domain: &str,
    shortnames: &[String],
    service_name: &str,
) -> BTreeMap<String, String> {
    shortnames
        .iter()
        .map(|s| (format!("{}.{}", s, domain), service_name.to_string()))
        .collect()
}

/// Result of an idempotent DNS update
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DnsOutcome {
    /// Mapping already matched; nothing written
    Unchanged,
    /// Drift detected; ConfigMap patched
    Patched,
}

/// DNS/certificate automation over one cluster API
pub struct DnsAutomation {
    api: Arc<dyn ClusterApi>,
}

impl DnsAutomation {
    pub fn new(api: Arc<dyn ClusterApi>) -> Self {
        Self { api }
    }

    /// Add (or repair) the hostname mappings for a service.
    ///
    /// Reads the current ConfigMap, diffs against the desired entries, and
    /// patches only when at least one entry is missing or drifted.
    pub async fn add_service(
        &self,
        cluster: &ClusterRecord,
        domain: &str,
        shortnames: &[String],
        service_name: &str,
    ) -> Result<DnsOutcome, EngineError> {
        let desired = desired_entries(domain, shortnames, service_name);

        let mut current = match self.api.get_config_map(cluster, DNS_CONFIG_MAP).await {
            Ok(data) => data,
            Err(EngineError::NotFound(_)) => BTreeMap::new(),
            Err(e) => return Err(e),
        };

        let drifted: Vec<&String> = desired
            .iter()
            .filter(|(host, service)| current.get(*host) != Some(service))
            .map(|(host, _)| host)
            .collect();

        if drifted.is_empty() {
            debug!(domain, service = service_name, "dns mapping already current");
            return Ok(DnsOutcome::Unchanged);
        }

        info!(
            domain,
            service = service_name,
            entries = drifted.len(),
            "patching dns mapping"
        );
        current.extend(desired);
        self.api
            .patch_config_map(cluster, DNS_CONFIG_MAP, &current)
            .await?;
        Ok(DnsOutcome::Patched)
    }

    /// Request a certificate for a domain by applying the manifest.
    ///
    /// Readiness is polled separately and never blocks a deployment.
    pub async fn request_certificate(
        &self,
        cluster: &ClusterRecord,
        domain: &str,
    ) -> Result<(), EngineError> {
        let manifest = build_certificate_manifest(domain);
        self.api.apply_certificate(cluster, &manifest).await
    }

    /// Current certificate status for a domain, None until the cluster's
    /// controller has created the object
    pub async fn certificate_status(
        &self,
        cluster: &ClusterRecord,
        domain: &str,
    ) -> Result<Option<CertificateStatus>, EngineError> {
        self.api
            .get_certificate(cluster, &certificate_name(domain))
            .await
    }
}
