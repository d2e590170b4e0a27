use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

use crate::filter::Filterable;
use crate::models::{Engine, MetricDefinition};

/// A discovered database instance.
///
/// Identity is the provider resource id. The metric catalog lives on the
/// instance so it can age independently of the instance list itself; it is
/// refreshed in place during scrapes and thrown away wholesale when the
/// instance list expires.
#[derive(Debug)]
pub struct Instance {
    pub resource_id: String,
    pub identifier: String,
    pub engine: Engine,
    pub creation_time: DateTime<Utc>,
    pub tags: HashMap<String, String>,
    pub metrics: RwLock<MetricsCache>,
}

impl Instance {
    pub fn new(
        resource_id: impl Into<String>,
        identifier: impl Into<String>,
        engine: Engine,
        creation_time: DateTime<Utc>,
        tags: HashMap<String, String>,
        metadata_ttl: Duration,
    ) -> Self {
        Self {
            resource_id: resource_id.into(),
            identifier: identifier.into(),
            engine,
            creation_time,
            tags,
            metrics: RwLock::new(MetricsCache::new(metadata_ttl)),
        }
    }
}

/// Per-instance metric catalog with its own TTL.
///
/// `listed` is always the flattening of `definitions` into `name.statistic`
/// identifiers; both are replaced together on refresh.
#[derive(Debug)]
pub struct MetricsCache {
    pub definitions: BTreeMap<String, MetricDefinition>,
    pub listed: Vec<String>,
    pub last_updated: Option<Instant>,
    pub metadata_ttl: Duration,
}

impl MetricsCache {
    pub fn new(metadata_ttl: Duration) -> Self {
        Self {
            definitions: BTreeMap::new(),
            listed: Vec::new(),
            last_updated: None,
            metadata_ttl,
        }
    }

    /// Whether the catalog needs a refresh before it can be served.
    pub fn is_stale(&self, now: Instant) -> bool {
        match self.last_updated {
            None => true,
            Some(updated) => {
                self.definitions.is_empty() || now.duration_since(updated) > self.metadata_ttl
            }
        }
    }

    /// Replace the catalog with a freshly built definition map.
    pub fn replace(&mut self, definitions: BTreeMap<String, MetricDefinition>, now: Instant) {
        self.listed = flatten_metric_names(&definitions);
        self.definitions = definitions;
        self.last_updated = Some(now);
    }
}

/// Flatten a definition map into the `name.statistic` identifiers requested
/// from the provider.
pub fn flatten_metric_names(definitions: &BTreeMap<String, MetricDefinition>) -> Vec<String> {
    let mut names = Vec::new();
    for definition in definitions.values() {
        for statistic in &definition.statistics {
            names.push(format!("{}.{}", definition.name, statistic));
        }
    }
    names
}

impl Filterable for Instance {
    fn filterable_fields(&self) -> HashMap<String, String> {
        HashMap::from([
            ("identifier".to_string(), self.identifier.clone()),
            ("engine".to_string(), self.engine.to_string()),
        ])
    }

    fn filterable_tags(&self) -> HashMap<String, String> {
        self.tags.clone()
    }
}
