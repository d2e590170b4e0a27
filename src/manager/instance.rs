//! Discovery and TTL caching of the region's database instances.

use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use crate::config::Settings;
use crate::manager::{BASE_DELAY, InstanceProvider, MAX_RETRIES};
use crate::models::{Engine, Instance};
use crate::services::{DbService, InstanceRecord};
use crate::utils::retry::with_retry;

/// Instances in any other state have no datapoints worth scraping.
const VALID_INSTANCE_STATUS: &str = "available";

#[derive(Default)]
struct InstanceCache {
    instances: Vec<Arc<Instance>>,
    last_updated: Option<Instant>,
}

impl InstanceCache {
    fn is_stale(&self, now: Instant, ttl: std::time::Duration) -> bool {
        match self.last_updated {
            None => true,
            Some(updated) => self.instances.is_empty() || now.duration_since(updated) > ttl,
        }
    }
}

/// Discovers instances and caches the screened, filtered, capped list for
/// `InstanceTTL`, so most scrapes never hit the discovery API.
pub struct InstanceManager {
    service: Arc<dyn DbService>,
    settings: Arc<Settings>,
    cache: Mutex<InstanceCache>,
}

impl InstanceManager {
    pub fn new(service: Arc<dyn DbService>, settings: Arc<Settings>) -> Self {
        Self {
            service,
            settings,
            cache: Mutex::new(InstanceCache::default()),
        }
    }

    async fn discover(&self, cancel: &CancellationToken) -> Result<Vec<Arc<Instance>>> {
        let records = with_retry(
            cancel,
            || self.service.describe_db_instances(),
            MAX_RETRIES,
            BASE_DELAY,
        )
        .await?;

        let mut instances: Vec<Arc<Instance>> = records
            .iter()
            .filter_map(|record| self.screen(record))
            .collect();

        if let Some(filter) = &self.settings.instances.filter {
            instances.retain(|instance| filter.should_include(instance.as_ref()));
        }

        // Oldest first; with the cap below this keeps the monitored set
        // stable when new instances appear.
        instances.sort_by_key(|instance| instance.creation_time);

        Ok(instances)
    }

    /// Validity screening of one raw discovery record. Incomplete records
    /// and unknown engines are skipped silently apart from a debug line.
    fn screen(&self, record: &InstanceRecord) -> Option<Arc<Instance>> {
        let engine_raw = non_empty(record.engine.as_deref())?;
        let status = non_empty(record.status.as_deref())?;
        let resource_id = non_empty(record.resource_id.as_deref())?;
        let identifier = non_empty(record.identifier.as_deref())?;
        let creation_time = record.creation_time.filter(|t| t.timestamp() != 0)?;

        if status != VALID_INSTANCE_STATUS {
            debug!(identifier, status, "skipping instance, not available");
            return None;
        }
        if !record.performance_insights_enabled.unwrap_or(false) {
            debug!(identifier, "skipping instance, performance insights disabled");
            return None;
        }
        let Some(engine) = Engine::parse(engine_raw) else {
            debug!(identifier, engine = engine_raw, "skipping instance, unknown engine");
            return None;
        };

        Some(Arc::new(Instance::new(
            resource_id,
            identifier,
            engine,
            creation_time,
            record.tags.iter().cloned().collect(),
            self.settings.metrics.metadata_ttl,
        )))
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.is_empty())
}

#[async_trait]
impl InstanceProvider for InstanceManager {
    #[instrument(skip(self, cancel), level = "debug")]
    async fn get_instances(&self, cancel: &CancellationToken) -> Result<Vec<Arc<Instance>>> {
        let mut cache = self.cache.lock().await;

        if cache.is_stale(Instant::now(), self.settings.instances.instance_ttl) {
            let discovered = self.discover(cancel).await?;
            info!(count = discovered.len(), "discovered instances");

            let max_instances = self.settings.instances.max_instances;
            cache.instances = if discovered.len() > max_instances {
                debug!(max_instances, "capping instance list");
                discovered[..max_instances].to_vec()
            } else {
                discovered
            };
            cache.last_updated = Some(Instant::now());
        }

        Ok(cache.instances.clone())
    }
}
