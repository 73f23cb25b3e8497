//! Heartbeat client for fleet nodes
//!
//! Runs on every node as a background task and periodically posts the node's
//! capabilities and current metrics to the control plane. A missed beat is
//! absorbed by the registry's staleness threshold; this client only logs and
//! keeps trying.

use std::collections::BTreeSet;
use std::time::Duration;

use reqwest::Client;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use super::metrics::SharedMetricsCollector;
use super::node::HeartbeatPayload;
use super::HEARTBEAT_INTERVAL_SECS;

/// Configuration for the heartbeat client
#[derive(Debug, Clone)]
pub struct HeartbeatConfig {
    /// Control plane URL (e.g., "http://leader:7070")
    pub control_plane_url: String,

    /// Id of this node, as returned by token redemption
    pub node_id: String,

    /// Capability kinds this node advertises
    pub capabilities: BTreeSet<String>,

    /// Heartbeat interval in seconds
    pub interval_secs: u64,

    /// Consecutive failures before escalating the log level
    pub max_retries: u32,
}

impl HeartbeatConfig {
    pub fn new(control_plane_url: impl Into<String>, node_id: impl Into<String>) -> Self {
        Self {
            control_plane_url: control_plane_url.into(),
            node_id: node_id.into(),
            capabilities: BTreeSet::new(),
            interval_secs: HEARTBEAT_INTERVAL_SECS,
            max_retries: 3,
        }
    }

    pub fn with_interval(mut self, secs: u64) -> Self {
        self.interval_secs = secs;
        self
    }

    pub fn with_capabilities(mut self, capabilities: BTreeSet<String>) -> Self {
        self.capabilities = capabilities;
        self
    }
}

/// Errors that can occur while sending a heartbeat
#[derive(Debug, thiserror::Error)]
pub enum HeartbeatError {
    #[error("HTTP request failed: {0}")]
    RequestFailed(#[from] reqwest::Error),

    #[error("Server error {status}: {message}")]
    ServerError { status: u16, message: String },
}

/// Heartbeat client that runs as a background task
pub struct HeartbeatClient {
    config: HeartbeatConfig,
    http_client: Client,
    metrics_collector: SharedMetricsCollector,
}

impl HeartbeatClient {
    pub fn new(config: HeartbeatConfig, metrics_collector: SharedMetricsCollector) -> Self {
        let http_client = Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .expect("Failed to create HTTP client");

        Self {
            config,
            http_client,
            metrics_collector,
        }
    }

    /// Run the heartbeat loop until the shutdown signal flips
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let interval = Duration::from_secs(self.config.interval_secs);
        let mut consecutive_failures = 0u32;

        info!(
            node_id = %self.config.node_id,
            control_plane = %self.config.control_plane_url,
            interval_secs = self.config.interval_secs,
            "starting heartbeat client"
        );

        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    match self.send_heartbeat().await {
                        Ok(_) => {
                            if consecutive_failures > 0 {
                                info!("heartbeat recovered after {} failures", consecutive_failures);
                            }
                            consecutive_failures = 0;
                            debug!("heartbeat sent");
                        }
                        Err(e) => {
                            consecutive_failures += 1;
                            if consecutive_failures >= self.config.max_retries {
                                error!("heartbeat failed {} consecutive times: {}", consecutive_failures, e);
                            } else {
                                warn!("heartbeat failed (attempt {}): {}", consecutive_failures, e);
                            }
                        }
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("heartbeat client shutting down");
                        break;
                    }
                }
            }
        }
    }

    async fn send_heartbeat(&self) -> Result<(), HeartbeatError> {
        let metrics = {
            let mut collector = self.metrics_collector.write().await;
            collector.collect()
        };

        let payload = HeartbeatPayload {
            capabilities: Some(self.config.capabilities.clone()),
            metrics: Some(metrics),
        };

        let url = format!(
            "{}/v1/nodes/{}/heartbeat",
            self.config.control_plane_url, self.config.node_id
        );

        let response = self
            .http_client
            .post(&url)
            .json(&payload)
            .send()
            .await
            .map_err(HeartbeatError::RequestFailed)?;

        if !response.status().is_success() {
            let status_code = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(HeartbeatError::ServerError {
                status: status_code.as_u16(),
                message: body,
            });
        }

        Ok(())
    }
}

/// Spawn the heartbeat client as a background task.
///
/// Returns a shutdown sender that stops the loop.
pub fn spawn_heartbeat(
    config: HeartbeatConfig,
    metrics_collector: SharedMetricsCollector,
) -> watch::Sender<bool> {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let client = HeartbeatClient::new(config, metrics_collector);

    tokio::spawn(async move {
        client.run(shutdown_rx).await;
    });

    shutdown_tx
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_heartbeat_config_builder() {
        let config = HeartbeatConfig::new("http://localhost:7070", "unode-1")
            .with_interval(10)
            .with_capabilities(["llm".to_string()].into_iter().collect());

        assert_eq!(config.control_plane_url, "http://localhost:7070");
        assert_eq!(config.node_id, "unode-1");
        assert_eq!(config.interval_secs, 10);
        assert!(config.capabilities.contains("llm"));
    }

    #[test]
    fn test_heartbeat_config_defaults() {
        let config = HeartbeatConfig::new("http://localhost:7070", "unode-1");

        assert_eq!(config.interval_secs, HEARTBEAT_INTERVAL_SECS);
        assert_eq!(config.max_retries, 3);
    }
}
