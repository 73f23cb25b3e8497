//! System metrics collection for worker nodes
//!
//! Collects CPU, memory and disk utilization via `sysinfo` for inclusion in
//! heartbeat payloads.

use std::sync::Arc;

use chrono::Utc;
use sysinfo::{Disks, System};
use tokio::sync::RwLock;

use super::node::NodeMetrics;

/// Collects system metrics for heartbeats
pub struct MetricsCollector {
    system: System,
    disks: Disks,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            system: System::new_all(),
            disks: Disks::new_with_refreshed_list(),
        }
    }

    /// Refresh system metrics and return a heartbeat-ready snapshot.
    ///
    /// Called once per heartbeat interval.
    pub fn collect(&mut self) -> NodeMetrics {
        self.system.refresh_cpu_all();
        self.system.refresh_memory();
        self.disks.refresh(true);

        let cpu_usage = self.system.global_cpu_usage() as f64;

        let total_mem = self.system.total_memory();
        let used_mem = self.system.used_memory();
        let memory_usage = if total_mem > 0 {
            (used_mem as f64 / total_mem as f64) * 100.0
        } else {
            0.0
        };

        let (total_disk, used_disk) = self
            .disks
            .iter()
            .map(|d| (d.total_space(), d.total_space() - d.available_space()))
            .fold((0u64, 0u64), |(t, u), (dt, du)| (t + dt, u + du));
        let disk_usage = if total_disk > 0 {
            (used_disk as f64 / total_disk as f64) * 100.0
        } else {
            0.0
        };

        NodeMetrics {
            cpu_usage_percent: cpu_usage,
            memory_usage_percent: memory_usage,
            disk_usage_percent: disk_usage,
            collected_at: Utc::now(),
        }
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared collector handle for the heartbeat task
pub type SharedMetricsCollector = Arc<RwLock<MetricsCollector>>;

/// Create a shared metrics collector
pub fn new_shared_collector() -> SharedMetricsCollector {
    Arc::new(RwLock::new(MetricsCollector::new()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collect_produces_sane_ranges() {
        let mut collector = MetricsCollector::new();
        let metrics = collector.collect();

        assert!(metrics.cpu_usage_percent >= 0.0);
        assert!(metrics.memory_usage_percent >= 0.0);
        assert!(metrics.memory_usage_percent <= 100.0);
        assert!(metrics.disk_usage_percent >= 0.0);
        assert!(metrics.disk_usage_percent <= 100.0);
    }
}
