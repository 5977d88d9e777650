//! Periodic snapshot broadcasts
//!
//! Each of the `pods`, `deployments` and `metrics` topics gets its own task
//! and period. A tick fetches a fresh snapshot, builds the payload and emits
//! it to the topic. Failed ticks are logged and skipped.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use kubepulse_hub::TopicHub;
use kubepulse_k8s::{NodeUsageSample, PodUsageSample, SnapshotSource};
use kubepulse_types::{MetricsPayload, PodUsage, Topic};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BroadcastPeriods {
    pub pods: Duration,
    pub deployments: Duration,
    pub metrics: Duration,
}

pub struct Broadcaster<S> {
    source: Arc<S>,
    hub: Arc<TopicHub>,
}

impl<S: SnapshotSource> Broadcaster<S> {
    pub fn new(source: Arc<S>, hub: Arc<TopicHub>) -> Self {
        Self { source, hub }
    }

    /// Start one task per topic. The tasks stop when `cancel` fires.
    pub fn spawn(self, periods: BroadcastPeriods, cancel: &CancellationToken) -> Vec<JoinHandle<()>> {
        let this = Arc::new(self);

        let pods = {
            let this = Arc::clone(&this);
            let cancel = cancel.clone();
            tokio::spawn(async move {
                run_every(Topic::Pods, periods.pods, cancel, || this.publish_pods()).await;
            })
        };

        let deployments = {
            let this = Arc::clone(&this);
            let cancel = cancel.clone();
            tokio::spawn(async move {
                run_every(Topic::Deployments, periods.deployments, cancel, || {
                    this.publish_deployments()
                })
                .await;
            })
        };

        let metrics = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                run_every(Topic::Metrics, periods.metrics, cancel, || this.publish_metrics()).await;
            })
        };

        vec![pods, deployments, metrics]
    }

    /// Returns the number of viewers reached; 0 without fetching when nobody listens
    pub async fn publish_pods(&self) -> Result<usize> {
        if self.hub.member_count(&Topic::Pods) == 0 {
            return Ok(0);
        }
        let pods = self.source.fetch_pods().await?;
        Ok(self.hub.emit(&Topic::Pods, &pods))
    }

    pub async fn publish_deployments(&self) -> Result<usize> {
        if self.hub.member_count(&Topic::Deployments) == 0 {
            return Ok(0);
        }
        let deployments = self.source.fetch_deployments().await?;
        Ok(self.hub.emit(&Topic::Deployments, &deployments))
    }

    pub async fn publish_metrics(&self) -> Result<usize> {
        if self.hub.member_count(&Topic::Metrics) == 0 {
            return Ok(0);
        }
        let payload = self.collect_metrics().await?;
        Ok(self.hub.emit(&Topic::Metrics, &payload))
    }

    /// Gather the metrics payload. Only a failed cluster aggregate fails the
    /// whole payload; missing usage or GPU data leaves those lists empty.
    pub async fn collect_metrics(&self) -> Result<MetricsPayload> {
        let (cluster, pod_usage, node_usage, gpu) = tokio::join!(
            self.source.fetch_cluster_aggregate(),
            self.source.fetch_pod_usage(),
            self.source.fetch_node_usage(),
            self.source.fetch_gpu_telemetry(),
        );

        let mut cluster = cluster?;

        let pods: Vec<PodUsage> = match pod_usage {
            Ok(samples) => {
                let pods: Vec<PodUsage> = samples.iter().map(PodUsageSample::normalize).collect();
                cluster.set_usage(&pods);
                pods
            }
            Err(e) => {
                tracing::warn!(error = %format!("{e:#}"), "pod metrics not available");
                Vec::new()
            }
        };

        let nodes = match node_usage {
            Ok(samples) => samples.iter().map(NodeUsageSample::normalize).collect(),
            Err(e) => {
                tracing::warn!(error = %format!("{e:#}"), "node metrics not available");
                Vec::new()
            }
        };

        Ok(MetricsPayload {
            pods,
            nodes,
            cluster,
            gpu,
        })
    }
}

/// Call `publish` every `period` until cancelled. A slow publish delays the
/// next tick instead of overlapping with it.
async fn run_every<F, Fut>(topic: Topic, period: Duration, cancel: CancellationToken, mut publish: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<usize>>,
{
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {}
        }

        // Shutdown does not wait for a slow fetch
        let result = tokio::select! {
            _ = cancel.cancelled() => break,
            result = publish() => result,
        };

        match result {
            Ok(viewers) => tracing::trace!(%topic, viewers, "broadcast"),
            Err(e) => tracing::warn!(%topic, error = %format!("{e:#}"), "broadcast skipped"),
        }
    }

    tracing::debug!(%topic, "broadcaster stopped");
}
