use chrono::{DateTime, Utc};
use std::collections::HashMap;

use crate::filter::Filterable;
use crate::models::Statistic;

/// One metric exposed by an instance, as assembled from the provider catalog.
///
/// `statistics` is never empty: every definition carries at least the
/// configured default statistic.
#[derive(Clone, Debug, PartialEq)]
pub struct MetricDefinition {
    pub name: String,
    pub description: String,
    pub unit: String,
    pub statistics: Vec<Statistic>,
}

/// Latest valid measurement for one `name.statistic` identifier.
#[derive(Clone, Debug, PartialEq)]
pub struct Datapoint {
    pub metric_with_stat: String,
    pub timestamp: DateTime<Utc>,
    pub value: f64,
}

/// Coarse classification of a metric derived from its name prefix.
pub fn derive_metric_category(metric_name: &str) -> &'static str {
    if metric_name.starts_with("os.") {
        return "os";
    }
    if metric_name.starts_with("db.") {
        return "db";
    }
    "other"
}

impl Filterable for MetricDefinition {
    fn filterable_fields(&self) -> HashMap<String, String> {
        HashMap::from([
            ("name".to_string(), self.name.clone()),
            (
                "category".to_string(),
                derive_metric_category(&self.name).to_string(),
            ),
            ("unit".to_string(), self.unit.clone()),
        ])
    }

    // Metrics carry no tags.
}
