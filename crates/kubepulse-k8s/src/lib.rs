//! Kubernetes client for kubepulse
//!
//! This crate provides the cluster connection and the snapshot reads the
//! broadcaster turns into viewer payloads: pods, deployments, cluster
//! aggregates, resource metrics and host GPU telemetry.

mod client;
mod fetcher;
mod gpu;
mod metrics;

pub use client::KubeClient;
pub use fetcher::{ClusterFetcher, SnapshotSource};
pub use gpu::GpuProbe;
pub use metrics::{ContainerUsage, NodeUsageSample, PodUsageSample};

// Re-export types that are used in our public API
pub use kubepulse_types::{
    ClusterSummary, DeploymentSummary, GpuInfo, NodeUsage, PodSummary, PodUsage,
};
