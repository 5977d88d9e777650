use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::multiplexer::{MultiplexerHandle, ReconcileReport};
use kubepulse_hub::TopicHub;

/// Periodically aligns open log streams with the `logs:*` topics viewers hold
pub struct Reconciler {
    hub: Arc<TopicHub>,
    multiplexer: MultiplexerHandle,
    period: Duration,
}

impl Reconciler {
    pub fn new(hub: Arc<TopicHub>, multiplexer: MultiplexerHandle, period: Duration) -> Self {
        Self {
            hub,
            multiplexer,
            period,
        }
    }

    /// One pass: read the watched targets and hand them to the multiplexer
    pub async fn tick(&self) -> Result<ReconcileReport> {
        let required = self.hub.log_targets();
        self.multiplexer.reconcile(required).await
    }

    /// Run passes every period until `cancel` fires or the multiplexer is gone
    pub async fn run(self, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,

                _ = interval.tick() => {
                    match self.tick().await {
                        Ok(report) if !report.is_empty() => {
                            tracing::debug!(
                                opened = ?report.opened,
                                closed = ?report.closed,
                                "reconciled log streams"
                            );
                        }
                        Ok(_) => {}
                        Err(e) => {
                            tracing::error!(error = %e, "log reconciliation stopped");
                            break;
                        }
                    }
                }
            }
        }
    }
}
