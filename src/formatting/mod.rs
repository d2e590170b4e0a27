//! Converts datapoints into Prometheus samples and groups samples into
//! metric families for the text encoder.

use anyhow::{Context, Result, bail};
use prometheus::proto;
use std::collections::BTreeMap;

use crate::models::{Datapoint, Engine, Instance, MetricDefinition};
use crate::utils::names::{snake_case, trim_statistic};

/// Label names attached to every exported sample, in exposition order.
pub const LABEL_NAMES: [&str; 3] = ["identifier", "engine", "unit"];

/// One formatted gauge sample, ready to be grouped into a family.
#[derive(Clone, Debug, PartialEq)]
pub struct Sample {
    pub name: String,
    pub help: String,
    pub identifier: String,
    pub engine: String,
    pub unit: String,
    pub value: f64,
    pub timestamp_ms: i64,
}

/// Exported name for a `name.statistic` identifier.
///
/// Engine-specific (`db.*`) metrics carry the engine's short token so the
/// same counter never collides across engines; `os.*` and anything else is
/// prefix-only.
pub fn exported_metric_name(prefix: &str, engine: Engine, metric_with_stat: &str) -> String {
    if metric_with_stat.starts_with("db.") {
        return format!(
            "{prefix}_{}_{}",
            engine.short_name(),
            snake_case(metric_with_stat)
        );
    }
    format!("{prefix}_{}", snake_case(metric_with_stat))
}

/// Build the sample for one datapoint.
///
/// # Errors
///
/// Fails when the identifier has no valid statistic suffix or the bare
/// metric name is not in the instance's definitions. Such failures are
/// logged and skipped by the caller; they never abort a batch.
pub fn build_sample(
    instance: &Instance,
    definitions: &BTreeMap<String, MetricDefinition>,
    datapoint: &Datapoint,
    prefix: &str,
) -> Result<Sample> {
    let Some((bare_name, _)) = trim_statistic(&datapoint.metric_with_stat) else {
        bail!(
            "metric '{}' has no valid statistic suffix",
            datapoint.metric_with_stat
        );
    };

    let definition = definitions.get(bare_name).with_context(|| {
        format!(
            "metric '{bare_name}' not found for instance {}",
            instance.identifier
        )
    })?;

    Ok(Sample {
        name: exported_metric_name(prefix, instance.engine, &datapoint.metric_with_stat),
        help: definition.description.clone(),
        identifier: instance.identifier.clone(),
        engine: instance.engine.to_string(),
        unit: definition.unit.clone(),
        value: datapoint.value,
        timestamp_ms: datapoint.timestamp.timestamp_millis(),
    })
}

/// Group samples by exported name into gauge families.
///
/// The first sample of a family supplies the HELP text; within a family,
/// samples keep arrival order. Families come out sorted by name so the
/// exposition is stable across scrapes.
pub fn group_into_families(samples: Vec<Sample>) -> Vec<proto::MetricFamily> {
    let mut families: BTreeMap<String, proto::MetricFamily> = BTreeMap::new();

    for sample in samples {
        let family = families.entry(sample.name.clone()).or_insert_with(|| {
            let mut family = proto::MetricFamily::default();
            family.set_name(sample.name.clone());
            family.set_help(sample.help.clone());
            family.set_field_type(proto::MetricType::GAUGE);
            family
        });

        let mut gauge = proto::Gauge::default();
        gauge.set_value(sample.value);

        let mut metric = proto::Metric::default();
        for (name, value) in LABEL_NAMES
            .iter()
            .zip([&sample.identifier, &sample.engine, &sample.unit])
        {
            let mut label = proto::LabelPair::default();
            label.set_name((*name).to_string());
            label.set_value(value.clone());
            metric.label.push(label);
        }
        metric.gauge = Some(gauge).into();
        metric.set_timestamp_ms(sample.timestamp_ms);

        family.metric.push(metric);
    }

    families.into_values().collect()
}
