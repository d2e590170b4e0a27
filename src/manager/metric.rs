//! Per-instance metric catalog refresh and batched datapoint collection.

use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::catalog::{DescriptionRegistry, build_definitions};
use crate::config::Settings;
use crate::formatting::{Sample, build_sample};
use crate::manager::{BASE_DELAY, MAX_RETRIES, MetricProvider};
use crate::models::{Datapoint, Instance};
use crate::services::{InsightsService, MetricSeries};
use crate::utils::names::{BATCH_SIZE, batch_metric_names};
use crate::utils::retry::with_retry;

/// Coordinates catalog discovery and datapoint collection against the
/// Performance Insights service.
///
/// The canonical description registry lives here so HELP text stays stable
/// for the process lifetime regardless of instance churn.
pub struct MetricManager {
    service: Arc<dyn InsightsService>,
    settings: Arc<Settings>,
    registry: DescriptionRegistry,
}

impl MetricManager {
    pub fn new(service: Arc<dyn InsightsService>, settings: Arc<Settings>) -> Self {
        Self {
            service,
            settings,
            registry: DescriptionRegistry::new(),
        }
    }

    async fn refresh_catalog(
        &self,
        cancel: &CancellationToken,
        instance: &Instance,
    ) -> Result<()> {
        let mut cache = instance.metrics.write().await;
        if !cache.is_stale(Instant::now()) {
            // Somebody else refreshed while we waited for the lock.
            return Ok(());
        }

        let entries = with_retry(
            cancel,
            || {
                self.service
                    .list_available_resource_metrics(&instance.resource_id)
            },
            MAX_RETRIES,
            BASE_DELAY,
        )
        .await?;

        let definitions = build_definitions(
            &entries,
            &self.settings.metrics,
            instance.engine,
            &self.registry,
        )?;

        debug!(
            identifier = %instance.identifier,
            metrics = definitions.len(),
            "refreshed metric catalog"
        );
        cache.replace(definitions, Instant::now());

        Ok(())
    }
}

#[async_trait]
impl MetricProvider for MetricManager {
    #[instrument(skip(self, cancel, instance), fields(identifier = %instance.identifier))]
    async fn metric_batches(
        &self,
        cancel: &CancellationToken,
        instance: &Arc<Instance>,
    ) -> Result<Vec<Vec<String>>> {
        let stale = instance.metrics.read().await.is_stale(Instant::now());
        if stale {
            self.refresh_catalog(cancel, instance).await?;
        }

        let cache = instance.metrics.read().await;
        Ok(batch_metric_names(&cache.listed, BATCH_SIZE))
    }

    #[instrument(
        skip(self, cancel, instance, batch, sink),
        fields(identifier = %instance.identifier, batch_len = batch.len())
    )]
    async fn collect_batch(
        &self,
        cancel: &CancellationToken,
        instance: &Arc<Instance>,
        batch: &[String],
        sink: &mpsc::Sender<Sample>,
    ) -> Result<()> {
        let series = with_retry(
            cancel,
            || self.service.get_resource_metrics(&instance.resource_id, batch),
            MAX_RETRIES,
            BASE_DELAY,
        )
        .await
        .inspect_err(|err| {
            warn!(
                identifier = %instance.identifier,
                "failed to fetch metric data for batch {batch:?}: {err:#}"
            );
        })?;

        let datapoints = latest_valid_datapoints(&series);

        let cache = instance.metrics.read().await;
        for datapoint in datapoints {
            let sample = match build_sample(
                instance,
                &cache.definitions,
                &datapoint,
                &self.settings.export.metric_prefix,
            ) {
                Ok(sample) => sample,
                Err(err) => {
                    // A malformed datapoint never aborts its siblings.
                    warn!(
                        identifier = %instance.identifier,
                        "skipping datapoint {}: {err:#}", datapoint.metric_with_stat
                    );
                    continue;
                }
            };

            tokio::select! {
                () = cancel.cancelled() => {
                    anyhow::bail!("metric collection cancelled");
                }
                sent = sink.send(sample) => {
                    if sent.is_err() {
                        // Scrape response is gone, nothing left to emit to.
                        return Ok(());
                    }
                }
            }
        }

        Ok(())
    }
}

/// Keep the most recent datapoint with both a timestamp and a finite value
/// for each series.
///
/// Series arrive in chronological order and often carry trailing empty
/// points near "now", so a reverse scan finds the answer in one pass.
fn latest_valid_datapoints(series: &[MetricSeries]) -> Vec<Datapoint> {
    series
        .iter()
        .filter_map(|series| {
            let metric = series.metric.as_ref()?;
            series.datapoints.iter().rev().find_map(|point| {
                match (point.timestamp, point.value) {
                    (Some(timestamp), Some(value)) if value.is_finite() => Some(Datapoint {
                        metric_with_stat: metric.clone(),
                        timestamp,
                        value,
                    }),
                    _ => None,
                }
            })
        })
        .collect()
}
