//! Raw resource usage from the `metrics.k8s.io` API
//!
//! The metrics API is an aggregated API that is not part of `k8s-openapi`,
//! so objects are read as `DynamicObject` and their payload deserialized here.
//! Quantities are kept as the strings the API reported; callers normalize them.

use std::collections::BTreeMap;

use kube::core::{ApiResource, DynamicObject, GroupVersionKind};
use serde::Deserialize;

use kubepulse_types::{NodeUsage, PodUsage, cpu_millicores, memory_mib};

const METRICS_GROUP: &str = "metrics.k8s.io";
const METRICS_VERSION: &str = "v1beta1";

pub(crate) fn pod_metrics_resource() -> ApiResource {
    let gvk = GroupVersionKind::gvk(METRICS_GROUP, METRICS_VERSION, "PodMetrics");
    ApiResource::from_gvk_with_plural(&gvk, "pods")
}

pub(crate) fn node_metrics_resource() -> ApiResource {
    let gvk = GroupVersionKind::gvk(METRICS_GROUP, METRICS_VERSION, "NodeMetrics");
    ApiResource::from_gvk_with_plural(&gvk, "nodes")
}

/// Usage reported for one container
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ContainerUsage {
    pub name: String,
    pub cpu: String,
    pub memory: String,
}

/// Usage reported for one pod, per container
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PodUsageSample {
    pub name: String,
    pub namespace: String,
    pub containers: Vec<ContainerUsage>,
}

impl PodUsageSample {
    /// Sum container usage into millicores and MiB
    pub fn normalize(&self) -> PodUsage {
        PodUsage {
            name: self.name.clone(),
            namespace: self.namespace.clone(),
            cpu: self.containers.iter().map(|c| cpu_millicores(&c.cpu)).sum(),
            memory: self.containers.iter().map(|c| memory_mib(&c.memory)).sum(),
        }
    }
}

/// Usage reported for one node
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeUsageSample {
    pub name: String,
    pub cpu: String,
    pub memory: String,
}

impl NodeUsageSample {
    pub fn normalize(&self) -> NodeUsage {
        NodeUsage {
            name: self.name.clone(),
            cpu: cpu_millicores(&self.cpu),
            memory: memory_mib(&self.memory),
        }
    }
}

#[derive(Deserialize)]
struct PodMetricsData {
    #[serde(default)]
    containers: Vec<ContainerMetricsData>,
}

#[derive(Deserialize)]
struct ContainerMetricsData {
    #[serde(default)]
    name: String,
    #[serde(default)]
    usage: BTreeMap<String, String>,
}

#[derive(Deserialize)]
struct NodeMetricsData {
    #[serde(default)]
    usage: BTreeMap<String, String>,
}

/// Convert a PodMetrics object; a payload that does not deserialize yields no containers
pub(crate) fn pod_usage_from_object(obj: DynamicObject) -> PodUsageSample {
    let data: PodMetricsData =
        serde_json::from_value(obj.data).unwrap_or(PodMetricsData { containers: Vec::new() });

    PodUsageSample {
        name: obj.metadata.name.unwrap_or_default(),
        namespace: obj.metadata.namespace.unwrap_or_default(),
        containers: data
            .containers
            .into_iter()
            .map(|mut c| ContainerUsage {
                name: c.name,
                cpu: c.usage.remove("cpu").unwrap_or_default(),
                memory: c.usage.remove("memory").unwrap_or_default(),
            })
            .collect(),
    }
}

pub(crate) fn node_usage_from_object(obj: DynamicObject) -> NodeUsageSample {
    let mut usage = serde_json::from_value::<NodeMetricsData>(obj.data)
        .map(|d| d.usage)
        .unwrap_or_default();

    NodeUsageSample {
        name: obj.metadata.name.unwrap_or_default(),
        cpu: usage.remove("cpu").unwrap_or_default(),
        memory: usage.remove("memory").unwrap_or_default(),
    }
}
