//! Discovery, catalog and collection managers plus the per-region
//! scrape scheduler.

use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::Settings;
use crate::formatting::Sample;
use crate::models::Instance;
use crate::services::{InsightsClient, RdsClient};

pub mod instance;
pub mod metric;
pub mod region;

pub use self::instance::InstanceManager;
pub use self::metric::MetricManager;
pub use self::region::RegionScheduler;

/// Provider calls are retried a few times with short backoff before a
/// scrape gives up on them.
pub const MAX_RETRIES: u32 = 3;
pub const BASE_DELAY: Duration = Duration::from_secs(1);

/// Instance discovery seam consumed by the scheduler.
#[async_trait]
pub trait InstanceProvider: Send + Sync {
    async fn get_instances(&self, cancel: &CancellationToken) -> Result<Vec<Arc<Instance>>>;
}

/// Metric catalog and datapoint seam consumed by the scheduler.
#[async_trait]
pub trait MetricProvider: Send + Sync {
    /// Refresh the instance catalog if stale and return its batched
    /// `name.statistic` identifiers.
    async fn metric_batches(
        &self,
        cancel: &CancellationToken,
        instance: &Arc<Instance>,
    ) -> Result<Vec<Vec<String>>>;

    /// Fetch one batch of datapoints and emit the formatted samples.
    async fn collect_batch(
        &self,
        cancel: &CancellationToken,
        instance: &Arc<Instance>,
        batch: &[String],
        sink: &mpsc::Sender<Sample>,
    ) -> Result<()>;
}

/// Wire the AWS-backed services and managers into a scheduler for the
/// configured region.
///
/// # Errors
///
/// Returns an error if either service client fails to initialize.
pub async fn build_scheduler(settings: Arc<Settings>) -> Result<RegionScheduler> {
    let rds = RdsClient::new(&settings.region).await?;
    let insights = InsightsClient::new(&settings.region).await?;

    let instances = InstanceManager::new(Arc::new(rds), Arc::clone(&settings));
    let metrics = MetricManager::new(Arc::new(insights), Arc::clone(&settings));

    Ok(RegionScheduler::new(
        settings.region.clone(),
        Arc::new(instances),
        Arc::new(metrics),
        settings.processing.concurrency,
    ))
}
