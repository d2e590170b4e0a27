//! Abstract provider clients for instance discovery and Performance
//! Insights, plus their AWS-backed implementations.
//!
//! The pipeline only ever consumes the two traits; the record types mirror
//! the provider's field optionality so validity screening happens in the
//! managers, not the transport.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

pub mod pi;
pub mod rds;

pub use self::pi::InsightsClient;
pub use self::rds::RdsClient;

/// One raw instance record as returned by discovery. All fields are
/// optional; screening decides what is usable.
#[derive(Clone, Debug, Default)]
pub struct InstanceRecord {
    pub engine: Option<String>,
    pub status: Option<String>,
    pub resource_id: Option<String>,
    pub identifier: Option<String>,
    pub creation_time: Option<DateTime<Utc>>,
    pub performance_insights_enabled: Option<bool>,
    pub tags: Vec<(String, String)>,
}

/// One raw catalog entry from the metric listing.
#[derive(Clone, Debug, Default)]
pub struct MetricEntry {
    pub name: Option<String>,
    pub description: Option<String>,
    pub unit: Option<String>,
}

/// One series returned by a datapoint fetch.
#[derive(Clone, Debug, Default)]
pub struct MetricSeries {
    pub metric: Option<String>,
    pub datapoints: Vec<SeriesPoint>,
}

/// One datapoint within a series, in chronological order. The provider
/// emits trailing points without values near "now".
#[derive(Clone, Debug, Default)]
pub struct SeriesPoint {
    pub timestamp: Option<DateTime<Utc>>,
    pub value: Option<f64>,
}

/// Instance discovery operations.
#[async_trait]
pub trait DbService: Send + Sync {
    /// Enumerate every instance in the region, draining pagination.
    async fn describe_db_instances(&self) -> Result<Vec<InstanceRecord>>;
}

/// Performance Insights operations.
#[async_trait]
pub trait InsightsService: Send + Sync {
    /// List the metrics available on a resource, restricted to the `db`
    /// and `os` metric types.
    async fn list_available_resource_metrics(&self, resource_id: &str)
    -> Result<Vec<MetricEntry>>;

    /// Fetch the most recent datapoints for a batch of `name.statistic`
    /// identifiers over a 60-second lookback with a 1-second period.
    async fn get_resource_metrics(
        &self,
        resource_id: &str,
        metric_names_with_stat: &[String],
    ) -> Result<Vec<MetricSeries>>;
}
