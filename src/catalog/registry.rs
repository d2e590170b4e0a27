use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::models::Engine;

/// Canonical description store for one engine.
///
/// Engines occasionally return different prose for the same counter;
/// Prometheus HELP text has to stay stable, so the first description seen
/// for a metric name wins for the process lifetime. Lookups are keyed by
/// the lowercased metric name.
#[derive(Debug, Default)]
pub struct EngineRegistry {
    descriptions: Mutex<HashMap<String, String>>,
}

impl EngineRegistry {
    /// Return the canonical description for `metric_name`, recording
    /// `provider_description` as canonical if none exists yet.
    pub fn canonical_description(&self, metric_name: &str, provider_description: &str) -> String {
        let mut descriptions = self
            .descriptions
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);

        descriptions
            .entry(metric_name.to_lowercase())
            .or_insert_with(|| provider_description.to_string())
            .clone()
    }
}

/// Per-engine canonical description registries.
///
/// Append-only for the process lifetime; sub-registries are created lazily
/// on first use of an engine.
#[derive(Debug, Default)]
pub struct DescriptionRegistry {
    engines: Mutex<HashMap<Engine, Arc<EngineRegistry>>>,
}

impl DescriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn engine_registry(&self, engine: Engine) -> Arc<EngineRegistry> {
        let mut engines = self
            .engines
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);

        Arc::clone(engines.entry(engine).or_default())
    }

    /// Convenience wrapper over the per-engine registry.
    pub fn canonical_description(
        &self,
        engine: Engine,
        metric_name: &str,
        provider_description: &str,
    ) -> String {
        self.engine_registry(engine)
            .canonical_description(metric_name, provider_description)
    }
}
