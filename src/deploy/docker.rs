//! Container-engine backend for docker-type targets
//!
//! The engine client is an async seam: the deployment manager talks to it
//! through the `ContainerEngine` trait and tests substitute an in-memory
//! fake. The HTTP implementation addresses the engine endpoint of whichever
//! node the target resolved to, so one client serves the whole fleet.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::fleet::node::UNode;

use super::ports::{InvalidPortSpec, PortSpec};
use super::target::Workload;
use super::ServiceSpec;

/// Engine/cluster backend failure, split by retry eligibility
#[derive(Error, Debug)]
pub enum EngineError {
    /// Timeout or connection failure; eligible for bounded retry
    #[error("Transient engine error: {0}")]
    Transient(String),

    /// Backend rejected the request (bad image, bad manifest, quota); never
    /// retried
    #[error("Engine error: {0}")]
    Terminal(String),

    /// Referenced container/workload does not exist
    #[error("Not found: {0}")]
    NotFound(String),
}

impl EngineError {
    pub fn is_transient(&self) -> bool {
        matches!(self, EngineError::Transient(_))
    }

    /// Classify a reqwest failure: timeouts and connection errors are
    /// transient, anything else is terminal.
    pub fn from_request(err: reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() {
            EngineError::Transient(err.to_string())
        } else {
            EngineError::Terminal(err.to_string())
        }
    }

    /// Classify an HTTP status from the backend
    pub fn from_status(status: reqwest::StatusCode, body: String) -> Self {
        match status.as_u16() {
            404 => EngineError::NotFound(body),
            502 | 503 | 504 => EngineError::Transient(format!("{}: {}", status, body)),
            _ => EngineError::Terminal(format!("{}: {}", status, body)),
        }
    }
}

/// Observed container lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerState {
    Starting,
    Running,
    Exited,
}

/// Everything the engine needs to create one container
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerPlan {
    /// Container name, derived from service and target
    pub name: String,

    /// Image reference
    pub image: String,

    /// Full environment: resolved wiring env overlaid with service env.
    /// Ordered map so repeated translations are identical.
    pub env: BTreeMap<String, String>,

    /// Host-bound ports: container `"port/proto"` key -> host port
    pub binds: BTreeMap<String, u16>,

    /// Exposed-only ports in `"port/proto"` form
    pub exposed: Vec<String>,
}

/// Engine response to a create call
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreatedContainer {
    pub id: String,

    /// First host port the engine actually bound, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host_port: Option<u16>,
}

/// Translate a service definition plus its resolved wiring environment into
/// a container plan.
///
/// Pure: malformed port entries fail here, before any engine call. Wiring
/// env is applied first so a service can deliberately override an injected
/// variable.
pub fn build_container_plan(
    service: &ServiceSpec,
    resolved_env: &BTreeMap<String, String>,
    container_name: &str,
) -> Result<ContainerPlan, InvalidPortSpec> {
    let ports = PortSpec::parse_all(&service.ports)?;

    let mut binds = BTreeMap::new();
    let mut exposed = Vec::new();
    for port in &ports {
        match port.host_port {
            Some(host) => {
                binds.insert(port.container_key(), host);
            }
            None => exposed.push(port.container_key()),
        }
    }

    let mut env = resolved_env.clone();
    for (key, value) in &service.env {
        env.insert(key.clone(), value.clone());
    }

    Ok(ContainerPlan {
        name: container_name.to_string(),
        image: service.image.clone(),
        env,
        binds,
        exposed,
    })
}

/// Generate a container name from service id and target identifier
pub fn container_name(service_id: &str, node_identifier: &str) -> String {
    let sanitize = |s: &str| s.replace(['/', ':', '.'], "-").to_lowercase();
    format!("ufleet-{}-{}", sanitize(service_id), sanitize(node_identifier))
}

/// Container lifecycle operations against a node's engine endpoint
#[async_trait]
pub trait ContainerEngine: Send + Sync {
    async fn pull_image(&self, node: &UNode, image: &str) -> Result<(), EngineError>;

    async fn create_container(
        &self,
        node: &UNode,
        plan: &ContainerPlan,
    ) -> Result<CreatedContainer, EngineError>;

    async fn start_container(&self, node: &UNode, container_id: &str) -> Result<(), EngineError>;

    async fn stop_container(&self, node: &UNode, container_id: &str) -> Result<(), EngineError>;

    async fn remove_container(&self, node: &UNode, container_id: &str) -> Result<(), EngineError>;

    async fn container_state(
        &self,
        node: &UNode,
        container_id: &str,
    ) -> Result<ContainerState, EngineError>;

    async fn list_containers(&self, node: &UNode) -> Result<Vec<Workload>, EngineError>;

    /// Tail of the container log, newest last
    async fn container_logs(
        &self,
        node: &UNode,
        container_id: &str,
        tail: usize,
    ) -> Result<String, EngineError>;
}

/// HTTP client for the engine endpoint exposed by each node agent
pub struct HttpContainerEngine {
    client: Client,
    engine_port: u16,
}

impl HttpContainerEngine {
    /// `call_timeout` bounds create/start calls; liveness reads use a
    /// shorter limit set per request.
    pub fn new(engine_port: u16, call_timeout: Duration) -> Self {
        let client = Client::builder()
            .timeout(call_timeout)
            .build()
            .expect("Failed to create HTTP client");
        Self {
            client,
            engine_port,
        }
    }

    fn base_url(&self, node: &UNode) -> Result<String, EngineError> {
        let address = node
            .addresses
            .first()
            .ok_or_else(|| EngineError::Terminal(format!("node {} has no address", node.id)))?;
        Ok(format!("http://{}:{}", address, self.engine_port))
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
impl ContainerEngine for HttpContainerEngine {
    async fn pull_image(&self, node: &UNode, image: &str) -> Result<(), EngineError> {
        let url = format!("{}/v1/images/pull", self.base_url(node)?);
        let response = self
            .client
            .post(&url)
            .json(&serde_json::json!({ "image": image }))
            .send()
            .await
            .map_err(EngineError::from_request)?;
        Self::expect_success(response).await.map(|_| ())
    }

    async fn create_container(
        &self,
        node: &UNode,
        plan: &ContainerPlan,
    ) -> Result<CreatedContainer, EngineError> {
        let url = format!("{}/v1/containers", self.base_url(node)?);
        let response = self
            .client
            .post(&url)
            .json(plan)
            .send()
            .await
            .map_err(EngineError::from_request)?;
        Self::expect_success(response)
            .await?
            .json()
            .await
            .map_err(|e| EngineError::Terminal(e.to_string()))
    }

    async fn start_container(&self, node: &UNode, container_id: &str) -> Result<(), EngineError> {
        let url = format!("{}/v1/containers/{}/start", self.base_url(node)?, container_id);
        let response = self
            .client
            .post(&url)
            .send()
            .await
            .map_err(EngineError::from_request)?;
        Self::expect_success(response).await.map(|_| ())
    }

    async fn stop_container(&self, node: &UNode, container_id: &str) -> Result<(), EngineError> {
        let url = format!("{}/v1/containers/{}/stop", self.base_url(node)?, container_id);
        let response = self
            .client
            .post(&url)
            .send()
            .await
            .map_err(EngineError::from_request)?;
        Self::expect_success(response).await.map(|_| ())
    }

    async fn remove_container(&self, node: &UNode, container_id: &str) -> Result<(), EngineError> {
        let url = format!("{}/v1/containers/{}", self.base_url(node)?, container_id);
        let response = self
            .client
            .delete(&url)
            .send()
            .await
            .map_err(EngineError::from_request)?;
        Self::expect_success(response).await.map(|_| ())
    }

    async fn container_state(
        &self,
        node: &UNode,
        container_id: &str,
    ) -> Result<ContainerState, EngineError> {
        let url = format!("{}/v1/containers/{}/state", self.base_url(node)?, container_id);
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
            Some("starting") => Ok(ContainerState::Starting),
            Some("exited") => Ok(ContainerState::Exited),
            other => Err(EngineError::Terminal(format!(
                "unrecognized container state: {:?}",
                other
            ))),
        }
    }

    async fn list_containers(&self, node: &UNode) -> Result<Vec<Workload>, EngineError> {
        let url = format!("{}/v1/containers", self.base_url(node)?);
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

    async fn container_logs(
        &self,
        node: &UNode,
        container_id: &str,
        tail: usize,
    ) -> Result<String, EngineError> {
        let url = format!(
            "{}/v1/containers/{}/logs?tail={}",
            self.base_url(node)?,
            container_id,
            tail
        );
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(EngineError::from_request)?;
        Self::expect_success(response)
            .await?
            .text()
            .await
            .map_err(|e| EngineError::Terminal(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn test_service(ports: &[&str]) -> ServiceSpec {
        ServiceSpec {
            id: "chat-api".to_string(),
            image: "ghcr.io/acme/chat-api:1.4".to_string(),
            ports: ports.iter().map(|p| p.to_string()).collect(),
            env: HashMap::from([("LOG_LEVEL".to_string(), "info".to_string())]),
            requires: vec!["llm".to_string()],
            replicas: 1,
            domain: None,
        }
    }

    #[test]
    fn test_build_plan_binds_and_exposes() {
        let service = test_service(&["8080:80", "443"]);
        let resolved = BTreeMap::from([("OPENAI_API_KEY".to_string(), "sk-test".to_string())]);

        let plan = build_container_plan(&service, &resolved, "ufleet-chat-api-unode-1").unwrap();

        assert_eq!(plan.binds.get("80/tcp"), Some(&8080));
        assert_eq!(plan.exposed, vec!["443/tcp".to_string()]);
        assert_eq!(plan.env.get("OPENAI_API_KEY"), Some(&"sk-test".to_string()));
        assert_eq!(plan.env.get("LOG_LEVEL"), Some(&"info".to_string()));
    }

    #[test]
    fn test_build_plan_rejects_malformed_port() {
        let service = test_service(&["80:http"]);
        let err = build_container_plan(&service, &BTreeMap::new(), "c").unwrap_err();
        assert_eq!(err, InvalidPortSpec("80:http".to_string()));
    }

    #[test]
    fn test_service_env_overrides_wiring_env() {
        let mut service = test_service(&[]);
        service.env.insert("OPENAI_API_KEY".to_string(), "sk-override".to_string());
        let resolved = BTreeMap::from([("OPENAI_API_KEY".to_string(), "sk-wiring".to_string())]);

        let plan = build_container_plan(&service, &resolved, "c").unwrap();
        assert_eq!(plan.env.get("OPENAI_API_KEY"), Some(&"sk-override".to_string()));
    }

    #[test]
    fn test_container_name_sanitized() {
        assert_eq!(
            container_name("Chat/API", "unode-1.internal"),
            "ufleet-chat-api-unode-1-internal"
        );
    }

    #[test]
    fn test_error_classification() {
        assert!(EngineError::from_status(reqwest::StatusCode::SERVICE_UNAVAILABLE, String::new())
            .is_transient());
        assert!(!EngineError::from_status(reqwest::StatusCode::BAD_REQUEST, String::new())
            .is_transient());
        assert!(matches!(
            EngineError::from_status(reqwest::StatusCode::NOT_FOUND, String::new()),
            EngineError::NotFound(_)
        ));
    }
}
