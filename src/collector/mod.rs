//! Adapts the region scheduler to Prometheus scrapes.
//!
//! Metric families are fully dynamic: nothing is registered up front, each
//! scrape drains the scheduler's sample stream and groups it into gauge
//! families for the encoder.

use anyhow::{Result, anyhow};
use prometheus::proto;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use crate::formatting::{Sample, group_into_families};
use crate::manager::RegionScheduler;

/// Backpressure bound between the collection workers and the encoder.
const SINK_BUFFER: usize = 1024;

/// Result of one scrape: the families to encode plus the scheduler's
/// verdict. A degraded scrape still carries every sample produced before
/// the failure.
pub struct ScrapeOutcome {
    pub families: Vec<proto::MetricFamily>,
    pub result: Result<()>,
}

pub struct InsightsCollector {
    scheduler: Arc<RegionScheduler>,
}

impl InsightsCollector {
    pub fn new(scheduler: Arc<RegionScheduler>) -> Self {
        Self { scheduler }
    }

    /// Scrape all monitored instances.
    #[instrument(skip(self, cancel))]
    pub async fn collect(&self, cancel: &CancellationToken) -> ScrapeOutcome {
        let scheduler = Arc::clone(&self.scheduler);
        self.gather(cancel, move |cancel, sink| async move {
            scheduler.collect_metrics(&cancel, &sink).await
        })
        .await
    }

    /// Scrape only the listed instance identifiers. Built per request from
    /// the parsed query parameter.
    #[instrument(skip(self, cancel))]
    pub async fn collect_for_instances(
        &self,
        cancel: &CancellationToken,
        identifiers: Vec<String>,
    ) -> ScrapeOutcome {
        let scheduler = Arc::clone(&self.scheduler);
        self.gather(cancel, move |cancel, sink| async move {
            scheduler
                .collect_metrics_for_instances(&cancel, &identifiers, &sink)
                .await
        })
        .await
    }

    async fn gather<F, Fut>(&self, cancel: &CancellationToken, collect: F) -> ScrapeOutcome
    where
        F: FnOnce(CancellationToken, mpsc::Sender<Sample>) -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let (sink, mut collected) = mpsc::channel(SINK_BUFFER);

        let task = tokio::spawn(collect(cancel.clone(), sink));

        // Drain until the scheduler and its workers drop their senders.
        let mut samples = Vec::new();
        while let Some(sample) = collected.recv().await {
            samples.push(sample);
        }

        let result = match task.await {
            Ok(result) => result,
            Err(err) => Err(anyhow!("collection task panicked: {err}")),
        };

        debug!(samples = samples.len(), "scrape drained");
        ScrapeOutcome {
            families: group_into_families(samples),
            result,
        }
    }
}
