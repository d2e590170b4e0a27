#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]
#![allow(dead_code)]

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use dbi_exporter::config::Settings;
use dbi_exporter::exporter;
use dbi_exporter::manager::{InstanceManager, MetricManager, RegionScheduler};
use dbi_exporter::services::{
    DbService, InsightsService, InstanceRecord, MetricEntry, MetricSeries, SeriesPoint,
};

/// Discovery stub returning a fixed record set.
pub struct MockDb {
    pub records: Vec<InstanceRecord>,
}

#[async_trait]
impl DbService for MockDb {
    async fn describe_db_instances(&self) -> Result<Vec<InstanceRecord>> {
        Ok(self.records.clone())
    }
}

/// Performance Insights stub: a catalog per resource id, with data fetches
/// answering every requested identifier with one valid datapoint.
#[derive(Default)]
pub struct MockInsights {
    catalogs: HashMap<String, Vec<MetricEntry>>,
    failing_catalogs: HashSet<String>,
    datapoint_value: f64,
}

impl MockInsights {
    pub fn new() -> Self {
        Self {
            datapoint_value: 42.0,
            ..Self::default()
        }
    }

    pub fn with_catalog(mut self, resource_id: &str, entries: &[(&str, &str, &str)]) -> Self {
        self.catalogs.insert(
            resource_id.to_string(),
            entries
                .iter()
                .map(|(name, description, unit)| MetricEntry {
                    name: Some((*name).to_string()),
                    description: Some((*description).to_string()),
                    unit: Some((*unit).to_string()),
                })
                .collect(),
        );
        self
    }

    pub fn with_failing_catalog(mut self, resource_id: &str) -> Self {
        self.failing_catalogs.insert(resource_id.to_string());
        self
    }
}

#[async_trait]
impl InsightsService for MockInsights {
    async fn list_available_resource_metrics(&self, resource_id: &str) -> Result<Vec<MetricEntry>> {
        if self.failing_catalogs.contains(resource_id) {
            anyhow::bail!("listing metrics failed for {resource_id}");
        }
        Ok(self.catalogs.get(resource_id).cloned().unwrap_or_default())
    }

    async fn get_resource_metrics(
        &self,
        _resource_id: &str,
        metric_names_with_stat: &[String],
    ) -> Result<Vec<MetricSeries>> {
        Ok(metric_names_with_stat
            .iter()
            .map(|name| MetricSeries {
                metric: Some(name.clone()),
                datapoints: vec![
                    SeriesPoint {
                        timestamp: Some(sample_time()),
                        value: Some(self.datapoint_value),
                    },
                    // Trailing empty point, as the provider produces near "now".
                    SeriesPoint {
                        timestamp: Some(sample_time()),
                        value: None,
                    },
                ],
            })
            .collect())
    }
}

pub fn sample_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
}

pub fn record(identifier: &str, engine: &str, created: DateTime<Utc>) -> InstanceRecord {
    InstanceRecord {
        engine: Some(engine.to_string()),
        status: Some("available".to_string()),
        resource_id: Some(format!("db-{identifier}")),
        identifier: Some(identifier.to_string()),
        creation_time: Some(created),
        performance_insights_enabled: Some(true),
        tags: Vec::new(),
    }
}

pub fn created(year: i32, month: u32, day: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(year, month, day, 0, 0, 0).unwrap()
}

/// Wire mock services into a scheduler the way the factory does for the
/// real clients.
pub fn scheduler(settings: &Arc<Settings>, db: MockDb, insights: MockInsights) -> RegionScheduler {
    RegionScheduler::new(
        settings.region.clone(),
        Arc::new(InstanceManager::new(Arc::new(db), Arc::clone(settings))),
        Arc::new(MetricManager::new(Arc::new(insights), Arc::clone(settings))),
        settings.processing.concurrency,
    )
}

/// Serve the exporter router on an ephemeral port and return its base URL.
pub async fn spawn_exporter(settings: Arc<Settings>, db: MockDb, insights: MockInsights) -> String {
    let state = exporter::build_state(scheduler(&settings, db, insights)).unwrap();
    let app = exporter::router(state);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        axum::serve(listener, app.into_make_service()).await.unwrap();
    });

    format!("http://{addr}")
}
