//! Builds the filtered per-instance metric catalog from a raw provider
//! metric listing.

use anyhow::{Result, bail};
use std::collections::BTreeMap;

use crate::config::MetricsSettings;
use crate::models::{Engine, MetricDefinition, Statistic};
use crate::services::MetricEntry;

mod registry;

pub use self::registry::{DescriptionRegistry, EngineRegistry};

/// Turn raw provider entries into the definitions to collect for one
/// instance.
///
/// Entries missing a name, description, or unit are dropped. Surviving
/// entries run through the configured metric filter; statistic-aware
/// include patterns contribute their suffix statistic on top of the
/// configured default. Descriptions are resolved against the canonical
/// registry (first seen per engine wins).
///
/// # Errors
///
/// Fails when the provider listing is empty, which indicates a resource
/// that cannot be collected from rather than an empty catalog.
pub fn build_definitions(
    entries: &[MetricEntry],
    settings: &MetricsSettings,
    engine: Engine,
    registry: &DescriptionRegistry,
) -> Result<BTreeMap<String, MetricDefinition>> {
    if entries.is_empty() {
        bail!("provider returned no metrics for engine {engine}");
    }

    let engine_registry = registry.engine_registry(engine);
    let mut definitions = BTreeMap::new();

    for entry in entries {
        let (Some(name), Some(description), Some(unit)) =
            (&entry.name, &entry.description, &entry.unit)
        else {
            continue;
        };

        let statistics = statistics_for(name, settings);

        let candidate = MetricDefinition {
            name: name.clone(),
            description: description.clone(),
            unit: unit.clone(),
            statistics,
        };

        if let Some(filter) = &settings.filter {
            if !filter.should_include(&candidate) {
                continue;
            }
        }

        let canonical = engine_registry.canonical_description(name, description);
        definitions.insert(
            name.clone(),
            MetricDefinition {
                description: canonical,
                ..candidate
            },
        );
    }

    Ok(definitions)
}

/// The statistics to request for a metric: the configured default, plus the
/// suffix statistic of every statistic-aware include pattern matching the
/// bare name.
fn statistics_for(metric_name: &str, settings: &MetricsSettings) -> Vec<Statistic> {
    let mut statistics = vec![settings.statistic];

    for selector in &settings.stat_selectors {
        if selector.base.is_match(metric_name) && !statistics.contains(&selector.statistic) {
            statistics.push(selector.statistic);
        }
    }

    statistics
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StatSelector;
    use crate::filter::{PatternFilter, Patterns};
    use regex::Regex;
    use std::time::Duration;

    fn entry(name: &str, description: &str, unit: &str) -> MetricEntry {
        MetricEntry {
            name: Some(name.to_string()),
            description: Some(description.to_string()),
            unit: Some(unit.to_string()),
        }
    }

    fn settings() -> MetricsSettings {
        MetricsSettings {
            statistic: Statistic::Avg,
            metadata_ttl: Duration::from_secs(3600),
            filter: None,
            stat_selectors: Vec::new(),
        }
    }

    fn patterns(entries: &[(&str, &[&str])]) -> Patterns {
        entries
            .iter()
            .map(|(key, regexes)| {
                (
                    key.to_string(),
                    regexes.iter().map(|p| Regex::new(p).unwrap()).collect(),
                )
            })
            .collect()
    }

    #[test]
    fn test_incomplete_entries_are_dropped() {
        let entries = vec![
            entry("os.cpuUtilization.user", "CPU user time", "Percent"),
            MetricEntry {
                name: Some("os.cpuUtilization.system".to_string()),
                description: None,
                unit: Some("Percent".to_string()),
            },
            MetricEntry {
                name: None,
                description: Some("orphan".to_string()),
                unit: Some("Count".to_string()),
            },
        ];

        let definitions = build_definitions(
            &entries,
            &settings(),
            Engine::Postgres,
            &DescriptionRegistry::new(),
        )
        .unwrap();

        assert_eq!(definitions.len(), 1);
        assert!(definitions.contains_key("os.cpuUtilization.user"));
    }

    #[test]
    fn test_empty_listing_is_an_error() {
        let result = build_definitions(
            &[],
            &settings(),
            Engine::Postgres,
            &DescriptionRegistry::new(),
        );

        assert!(result.is_err());
    }

    #[test]
    fn test_default_statistic_applies_to_every_metric() {
        let entries = vec![entry("db.SQL.queries", "Queries", "Count")];

        let definitions = build_definitions(
            &entries,
            &settings(),
            Engine::AuroraMysql,
            &DescriptionRegistry::new(),
        )
        .unwrap();

        assert_eq!(
            definitions["db.SQL.queries"].statistics,
            vec![Statistic::Avg]
        );
    }

    #[test]
    fn test_statistic_aware_selector_adds_suffix_statistic() {
        let mut settings = settings();
        settings.stat_selectors = vec![StatSelector {
            base: Regex::new("^db\\.SQL\\..*$").unwrap(),
            statistic: Statistic::Max,
        }];
        settings.filter = Some(PatternFilter::new(
            patterns(&[("name", &["^db\\.SQL\\..*$"])]),
            Patterns::new(),
        ));

        let entries = vec![
            entry("db.SQL.queries", "Queries", "Count"),
            entry("os.cpuUtilization.user", "CPU", "Percent"),
        ];

        let definitions = build_definitions(
            &entries,
            &settings,
            Engine::AuroraMysql,
            &DescriptionRegistry::new(),
        )
        .unwrap();

        assert_eq!(definitions.len(), 1);
        assert_eq!(
            definitions["db.SQL.queries"].statistics,
            vec![Statistic::Avg, Statistic::Max]
        );
    }

    #[test]
    fn test_exclude_by_category_drops_entry() {
        let mut settings = settings();
        settings.filter = Some(PatternFilter::new(
            Patterns::new(),
            patterns(&[("category", &["^os$"])]),
        ));

        let entries = vec![
            entry("os.cpuUtilization.user", "CPU", "Percent"),
            entry("db.SQL.queries", "Queries", "Count"),
        ];

        let definitions = build_definitions(
            &entries,
            &settings,
            Engine::Postgres,
            &DescriptionRegistry::new(),
        )
        .unwrap();

        assert_eq!(definitions.len(), 1);
        assert!(definitions.contains_key("db.SQL.queries"));
    }

    #[test]
    fn test_exclude_by_name_drops_entry() {
        let mut settings = settings();
        settings.filter = Some(PatternFilter::new(
            Patterns::new(),
            patterns(&[("name", &["idle$"])]),
        ));

        let entries = vec![
            entry("os.cpuUtilization.idle", "CPU idle", "Percent"),
            entry("os.cpuUtilization.user", "CPU user", "Percent"),
        ];

        let definitions = build_definitions(
            &entries,
            &settings,
            Engine::Postgres,
            &DescriptionRegistry::new(),
        )
        .unwrap();

        assert_eq!(definitions.len(), 1);
        assert!(definitions.contains_key("os.cpuUtilization.user"));
    }

    #[test]
    fn test_descriptions_are_canonicalized_first_wins() {
        let registry = DescriptionRegistry::new();

        let first = build_definitions(
            &[entry("db.Cache.hits", "Original prose", "Count")],
            &settings(),
            Engine::Mysql,
            &registry,
        )
        .unwrap();
        let second = build_definitions(
            &[entry("db.Cache.hits", "Reworded prose", "Count")],
            &settings(),
            Engine::Mysql,
            &registry,
        )
        .unwrap();

        assert_eq!(first["db.Cache.hits"].description, "Original prose");
        assert_eq!(second["db.Cache.hits"].description, "Original prose");
    }
}
