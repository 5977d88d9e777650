//! Shared types for kubepulse
//!
//! This crate contains the topic model, the payload shapes pushed to viewers,
//! and the quantity normalizer used by every telemetry producer.

pub mod quantity;
mod topic;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use quantity::{cpu_millicores, memory_mib};
pub use topic::{Topic, TopicParseError};

// ============================================================================
// Topology Payloads
// ============================================================================

/// One entry of the `pods` topic
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodSummary {
    pub name: String,
    /// Pod phase as reported by the API server (`Running`, `Pending`, ...)
    pub status: String,
    /// True only when every container reports ready
    pub ready: bool,
    /// Restarts summed across containers
    pub restart_count: i32,
}

impl PodSummary {
    pub fn new(name: String, status: String) -> Self {
        Self {
            name,
            status,
            ready: false,
            restart_count: 0,
        }
    }
}

/// One entry of the `deployments` topic
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentSummary {
    pub name: String,
    pub desired: i32,
    pub available: i32,
    pub ready: i32,
    pub updated: i32,
}

impl DeploymentSummary {
    pub fn new(name: String) -> Self {
        Self {
            name,
            ..Default::default()
        }
    }

    /// Format replica status as "ready/desired"
    pub fn replica_status(&self) -> String {
        format!("{}/{}", self.ready, self.desired)
    }
}

// ============================================================================
// Telemetry Payloads
// ============================================================================

/// Normalized usage of a single pod, summed over its containers
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PodUsage {
    pub name: String,
    pub namespace: String,
    /// Millicores
    pub cpu: f64,
    /// MiB
    pub memory: f64,
}

/// Normalized usage of a single node
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NodeUsage {
    pub name: String,
    /// Millicores
    pub cpu: f64,
    /// MiB
    pub memory: f64,
}

/// Cluster-wide counts plus optional usage totals
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSummary {
    pub nodes: usize,
    pub total_pods: usize,
    pub running_pods: usize,
    pub pending_pods: usize,
    pub failed_pods: usize,
    /// Distinct namespaces that currently hold pods
    pub namespaces: usize,
    /// Total millicores, present only when the metrics API answered
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu_usage: Option<f64>,
    /// Total MiB, present only when the metrics API answered
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_usage: Option<f64>,
}

impl ClusterSummary {
    /// Tally pods by phase. Each item is `(namespace, phase)`.
    pub fn from_pods<'a, I>(nodes: usize, pods: I) -> Self
    where
        I: IntoIterator<Item = (&'a str, Option<&'a str>)>,
    {
        let mut summary = Self {
            nodes,
            ..Default::default()
        };
        let mut namespaces = std::collections::HashSet::new();

        for (namespace, phase) in pods {
            summary.total_pods += 1;
            namespaces.insert(namespace);
            match phase {
                Some("Running") => summary.running_pods += 1,
                Some("Pending") => summary.pending_pods += 1,
                Some("Failed") => summary.failed_pods += 1,
                _ => {}
            }
        }

        summary.namespaces = namespaces.len();
        summary
    }

    /// Fill the cluster totals from normalized per-pod usage
    pub fn set_usage(&mut self, pods: &[PodUsage]) {
        self.cpu_usage = Some(pods.iter().map(|p| p.cpu).sum());
        self.memory_usage = Some(pods.iter().map(|p| p.memory).sum());
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct GpuUtilization {
    pub gpu: f64,
    pub memory: f64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct GpuMemory {
    /// MiB
    pub used: f64,
    /// MiB
    pub total: f64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct GpuPower {
    /// Watts
    pub draw: f64,
    /// Watts
    pub limit: f64,
}

/// One GPU as reported by the host telemetry collaborator
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct GpuInfo {
    pub index: u32,
    pub name: String,
    pub utilization: GpuUtilization,
    pub memory: GpuMemory,
    /// Degrees Celsius
    pub temperature: f64,
    pub power: GpuPower,
}

/// Payload of the `metrics` topic
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsPayload {
    pub pods: Vec<PodUsage>,
    pub nodes: Vec<NodeUsage>,
    pub cluster: ClusterSummary,
    pub gpu: Vec<GpuInfo>,
}

// ============================================================================
// Log Payloads
// ============================================================================

/// A throttled batch of log lines for one `logs:<target>` topic
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogBatch {
    pub target_name: String,
    pub lines: Vec<String>,
    pub timestamp: DateTime<Utc>,
}

impl LogBatch {
    pub fn new(target_name: String, lines: Vec<String>) -> Self {
        Self {
            target_name,
            lines,
            timestamp: Utc::now(),
        }
    }
}
