//! One-shot cluster snapshots

use std::future::Future;

use anyhow::{Context, Result};
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Node, Pod};
use kube::Api;
use kube::api::ListParams;
use kube::core::DynamicObject;

use crate::gpu::GpuProbe;
use crate::metrics::{
    NodeUsageSample, PodUsageSample, node_metrics_resource, node_usage_from_object,
    pod_metrics_resource, pod_usage_from_object,
};
use kubepulse_types::{ClusterSummary, DeploymentSummary, GpuInfo, PodSummary};

/// Read side of the cluster the periodic broadcaster depends on
pub trait SnapshotSource: Send + Sync + 'static {
    /// Pods matching the configured namespace and label selector
    fn fetch_pods(&self) -> impl Future<Output = Result<Vec<PodSummary>>> + Send;

    /// Deployments matching the configured namespace and label selector
    fn fetch_deployments(&self) -> impl Future<Output = Result<Vec<DeploymentSummary>>> + Send;

    /// Node and pod counts across all namespaces
    fn fetch_cluster_aggregate(&self) -> impl Future<Output = Result<ClusterSummary>> + Send;

    /// Per-pod usage across all namespaces from the metrics API
    fn fetch_pod_usage(&self) -> impl Future<Output = Result<Vec<PodUsageSample>>> + Send;

    /// Per-node usage from the metrics API
    fn fetch_node_usage(&self) -> impl Future<Output = Result<Vec<NodeUsageSample>>> + Send;

    /// Host GPU telemetry; empty when the collaborator is absent
    fn fetch_gpu_telemetry(&self) -> impl Future<Output = Vec<GpuInfo>> + Send;
}

/// Snapshot source backed by the Kubernetes API
pub struct ClusterFetcher {
    client: kube::Client,
    namespace: String,
    label_selector: Option<String>,
    gpu: GpuProbe,
}

impl ClusterFetcher {
    pub fn new(
        client: kube::Client,
        namespace: impl Into<String>,
        label_selector: Option<String>,
        gpu: GpuProbe,
    ) -> Self {
        Self {
            client,
            namespace: namespace.into(),
            label_selector,
            gpu,
        }
    }

    fn list_params(&self) -> ListParams {
        match &self.label_selector {
            Some(selector) => ListParams::default().labels(selector),
            None => ListParams::default(),
        }
    }
}

impl SnapshotSource for ClusterFetcher {
    async fn fetch_pods(&self) -> Result<Vec<PodSummary>> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), &self.namespace);
        let list = pods
            .list(&self.list_params())
            .await
            .context(format!("Failed to list pods in {}", self.namespace))?;

        Ok(list.items.into_iter().map(pod_to_summary).collect())
    }

    async fn fetch_deployments(&self) -> Result<Vec<DeploymentSummary>> {
        let deployments: Api<Deployment> = Api::namespaced(self.client.clone(), &self.namespace);
        let list = deployments
            .list(&self.list_params())
            .await
            .context(format!("Failed to list deployments in {}", self.namespace))?;

        Ok(list.items.into_iter().map(deployment_to_summary).collect())
    }

    async fn fetch_cluster_aggregate(&self) -> Result<ClusterSummary> {
        let nodes: Api<Node> = Api::all(self.client.clone());
        let node_count = nodes
            .list_metadata(&ListParams::default())
            .await
            .context("Failed to list nodes")?
            .items
            .len();

        let pods: Api<Pod> = Api::all(self.client.clone());
        let pod_list = pods
            .list(&ListParams::default())
            .await
            .context("Failed to list pods across namespaces")?;

        Ok(ClusterSummary::from_pods(
            node_count,
            pod_list.items.iter().map(|pod| {
                (
                    pod.metadata.namespace.as_deref().unwrap_or_default(),
                    pod.status.as_ref().and_then(|s| s.phase.as_deref()),
                )
            }),
        ))
    }

    async fn fetch_pod_usage(&self) -> Result<Vec<PodUsageSample>> {
        let api: Api<DynamicObject> = Api::all_with(self.client.clone(), &pod_metrics_resource());
        let list = api
            .list(&ListParams::default())
            .await
            .context("Failed to list pod metrics")?;

        Ok(list.items.into_iter().map(pod_usage_from_object).collect())
    }

    async fn fetch_node_usage(&self) -> Result<Vec<NodeUsageSample>> {
        let api: Api<DynamicObject> = Api::all_with(self.client.clone(), &node_metrics_resource());
        let list = api
            .list(&ListParams::default())
            .await
            .context("Failed to list node metrics")?;

        Ok(list.items.into_iter().map(node_usage_from_object).collect())
    }

    async fn fetch_gpu_telemetry(&self) -> Vec<GpuInfo> {
        self.gpu.query().await
    }
}

/// Convert a k8s Pod to PodSummary
fn pod_to_summary(pod: Pod) -> PodSummary {
    let name = pod.metadata.name.unwrap_or_default();
    let status = pod.status.unwrap_or_default();
    let mut summary = PodSummary::new(name, status.phase.unwrap_or_else(|| "Unknown".to_string()));

    if let Some(container_statuses) = status.container_statuses {
        // A pod without container statuses has not started anything yet
        summary.ready =
            !container_statuses.is_empty() && container_statuses.iter().all(|cs| cs.ready);
        summary.restart_count = container_statuses.iter().map(|cs| cs.restart_count).sum();
    }

    summary
}

/// Convert a k8s Deployment to DeploymentSummary
fn deployment_to_summary(deploy: Deployment) -> DeploymentSummary {
    let mut summary = DeploymentSummary::new(deploy.metadata.name.unwrap_or_default());

    if let Some(spec) = deploy.spec {
        summary.desired = spec.replicas.unwrap_or(0);
    }

    if let Some(status) = deploy.status {
        summary.available = status.available_replicas.unwrap_or(0);
        summary.ready = status.ready_replicas.unwrap_or(0);
        summary.updated = status.updated_replicas.unwrap_or(0);
    }

    summary
}
