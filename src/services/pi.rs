use anyhow::{Context, Result};
use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region};
use aws_sdk_pi::Client;
use aws_sdk_pi::types::{MetricKeyDataPoints, MetricQuery, ServiceType};
use chrono::{DateTime, Utc};
use std::time::{Duration, SystemTime};
use tracing::{instrument, warn};

use crate::services::{InsightsService, MetricEntry, MetricSeries, SeriesPoint};

/// Datapoints are requested over the most recent minute at one-second
/// resolution; only the latest valid point is kept downstream.
const LOOKBACK: Duration = Duration::from_secs(60);
const PERIOD_SECONDS: i32 = 1;

/// The catalog is restricted to these metric types; per-query metric
/// types (`db.sql.stats`, ...) have their own pricing and are not scraped.
const METRIC_TYPES: [&str; 2] = ["db", "os"];

/// Thin wrapper over the Performance Insights SDK.
pub struct InsightsClient {
    client: Client,
}

impl InsightsClient {
    /// Build a client for one region using the ambient credential chain.
    pub async fn new(region: &str) -> Result<Self> {
        let config = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(region.to_string()))
            .load()
            .await;

        Ok(Self {
            client: Client::new(&config),
        })
    }
}

#[async_trait]
impl InsightsService for InsightsClient {
    #[instrument(skip(self), level = "debug")]
    async fn list_available_resource_metrics(
        &self,
        resource_id: &str,
    ) -> Result<Vec<MetricEntry>> {
        let mut request = self
            .client
            .list_available_resource_metrics()
            .service_type(ServiceType::Rds)
            .identifier(resource_id);
        for metric_type in METRIC_TYPES {
            request = request.metric_types(metric_type);
        }

        let output = request
            .send()
            .await
            .with_context(|| format!("listing available metrics for {resource_id}"))?;

        Ok(output
            .metrics()
            .iter()
            .map(|metric| MetricEntry {
                name: metric.metric().map(str::to_string),
                description: metric.description().map(str::to_string),
                unit: metric.unit().map(str::to_string),
            })
            .collect())
    }

    #[instrument(skip(self, metric_names_with_stat), level = "debug")]
    async fn get_resource_metrics(
        &self,
        resource_id: &str,
        metric_names_with_stat: &[String],
    ) -> Result<Vec<MetricSeries>> {
        let queries = metric_names_with_stat
            .iter()
            .map(|name| MetricQuery::builder().metric(name).build())
            .collect::<Result<Vec<_>, _>>()
            .context("building metric queries")?;

        let end = SystemTime::now();
        let start = end - LOOKBACK;

        let output = self
            .client
            .get_resource_metrics()
            .service_type(ServiceType::Rds)
            .identifier(resource_id)
            .set_metric_queries(Some(queries))
            .start_time(aws_sdk_pi::primitives::DateTime::from(start))
            .end_time(aws_sdk_pi::primitives::DateTime::from(end))
            .period_in_seconds(PERIOD_SECONDS)
            .send()
            .await
            .with_context(|| format!("fetching metric data for {resource_id}"))?;

        Ok(output.metric_list().iter().map(convert_series).collect())
    }
}

fn convert_series(series: &MetricKeyDataPoints) -> MetricSeries {
    MetricSeries {
        metric: series.key().map(|key| key.metric()).map(str::to_string),
        datapoints: series
            .data_points()
            .iter()
            .map(|point| SeriesPoint {
                timestamp: to_chrono(point.timestamp()),
                value: Some(point.value()),
            })
            .collect(),
    }
}

fn to_chrono(timestamp: &aws_sdk_pi::primitives::DateTime) -> Option<DateTime<Utc>> {
    let converted = DateTime::from_timestamp(timestamp.secs(), timestamp.subsec_nanos());
    if converted.is_none() {
        warn!(secs = timestamp.secs(), "datapoint timestamp out of range");
    }
    converted
}
