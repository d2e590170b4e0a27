//! YAML configuration loading and validation.
//!
//! A missing file yields the defaults. Validation failures (bad regexes,
//! unknown filter keys, invalid statistic or prefix, occupied port) are
//! fatal at startup; out-of-range numeric values and TTLs are replaced with
//! their defaults and logged.

use anyhow::{Context, Result, bail};
use regex::Regex;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fmt::Debug;
use std::net::{SocketAddr, TcpStream};
use std::path::Path;
use std::time::Duration;
use tracing::warn;

use crate::filter::{PatternFilter, Patterns, TAG_PREFIX};
use crate::models::Statistic;
use crate::utils::names::split_statistic_pattern;

pub const MAX_INSTANCES: usize = 25;
pub const MAX_CONCURRENCY: usize = 60;
pub const DEFAULT_CONCURRENCY: usize = 4;
pub const MIN_TTL: Duration = Duration::from_secs(60);
pub const MAX_TTL: Duration = Duration::from_secs(24 * 60 * 60);
pub const DEFAULT_INSTANCE_TTL: Duration = Duration::from_secs(5 * 60);
pub const DEFAULT_METADATA_TTL: Duration = Duration::from_secs(60 * 60);
pub const DEFAULT_REGION: &str = "us-west-2";
pub const DEFAULT_PORT: u16 = 8081;
pub const DEFAULT_METRIC_PREFIX: &str = "dbi";

const VALID_PROMETHEUS_NAME: &str = "^[a-zA-Z_:][a-zA-Z0-9_:]*$";

// Raw file shapes. Everything is optional; defaults are applied during
// parsing so an absent file and an empty file behave identically.

type FilterFile = BTreeMap<String, Vec<String>>;

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FileConfig {
    discovery: DiscoveryFile,
    export: ExportFile,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct DiscoveryFile {
    regions: Vec<String>,
    instances: InstancesFile,
    metrics: MetricsFile,
    processing: ProcessingFile,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct InstancesFile {
    #[serde(rename = "max-instances")]
    max_instances: Option<i64>,
    ttl: Option<String>,
    include: Option<FilterFile>,
    exclude: Option<FilterFile>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct MetricsFile {
    statistic: Option<String>,
    #[serde(rename = "metadata-ttl")]
    metadata_ttl: Option<String>,
    include: Option<FilterFile>,
    exclude: Option<FilterFile>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ProcessingFile {
    concurrency: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ExportFile {
    port: Option<i64>,
    prometheus: PrometheusFile,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct PrometheusFile {
    #[serde(rename = "metric-prefix")]
    metric_prefix: Option<String>,
}

// Parsed, validated settings consumed by the rest of the crate.

#[derive(Debug)]
pub struct Settings {
    pub region: String,
    pub instances: InstanceSettings,
    pub metrics: MetricsSettings,
    pub processing: ProcessingSettings,
    pub export: ExportSettings,
}

#[derive(Debug)]
pub struct InstanceSettings {
    pub max_instances: usize,
    pub instance_ttl: Duration,
    pub filter: Option<PatternFilter>,
}

/// A statistic-aware include pattern: metrics matching `base` also get
/// `statistic` requested on top of the default.
#[derive(Clone, Debug)]
pub struct StatSelector {
    pub base: Regex,
    pub statistic: Statistic,
}

#[derive(Debug)]
pub struct MetricsSettings {
    pub statistic: Statistic,
    pub metadata_ttl: Duration,
    pub filter: Option<PatternFilter>,
    pub stat_selectors: Vec<StatSelector>,
}

#[derive(Debug)]
pub struct ProcessingSettings {
    pub concurrency: usize,
}

#[derive(Debug)]
pub struct ExportSettings {
    pub port: u16,
    pub metric_prefix: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            region: DEFAULT_REGION.to_string(),
            instances: InstanceSettings {
                max_instances: MAX_INSTANCES,
                instance_ttl: DEFAULT_INSTANCE_TTL,
                filter: None,
            },
            metrics: MetricsSettings {
                statistic: Statistic::Avg,
                metadata_ttl: DEFAULT_METADATA_TTL,
                filter: None,
                stat_selectors: Vec::new(),
            },
            processing: ProcessingSettings {
                concurrency: DEFAULT_CONCURRENCY,
            },
            export: ExportSettings {
                port: DEFAULT_PORT,
                metric_prefix: DEFAULT_METRIC_PREFIX.to_string(),
            },
        }
    }
}

/// Load settings from a YAML file, falling back to defaults when the file
/// does not exist. `port_override` (from the CLI) replaces the configured
/// port before validation.
///
/// # Errors
///
/// Returns an error for unreadable or malformed YAML and for any
/// validation failure.
pub fn load(path: impl AsRef<Path>, port_override: Option<u16>) -> Result<Settings> {
    let path = path.as_ref();

    let file = match std::fs::read_to_string(path) {
        Ok(data) => serde_yaml::from_str(&data)
            .with_context(|| format!("malformed config file {}", path.display()))?,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            warn!(path = %path.display(), "config file not found, using defaults");
            FileConfig::default()
        }
        Err(err) => {
            return Err(err).with_context(|| format!("reading config file {}", path.display()));
        }
    };

    parse(file, port_override)
}

fn parse(file: FileConfig, port_override: Option<u16>) -> Result<Settings> {
    let region = parse_region(file.discovery.regions);
    let instances = parse_instances(file.discovery.instances)?;
    let metrics = parse_metrics(file.discovery.metrics)?;
    let processing = parse_processing(file.discovery.processing);
    let export = parse_export(file.export, port_override)?;

    Ok(Settings {
        region,
        instances,
        metrics,
        processing,
        export,
    })
}

fn parse_region(mut regions: Vec<String>) -> String {
    if regions.is_empty() {
        return DEFAULT_REGION.to_string();
    }

    let region = regions.remove(0);
    if !regions.is_empty() {
        // Single-region exporter: everything after the first entry is
        // dropped until multi-region collection is designed.
        warn!(ignored = ?regions, "only the first configured region is used");
    }
    region
}

fn parse_instances(file: InstancesFile) -> Result<InstanceSettings> {
    let max_instances = clamp_or_default(
        file.max_instances.unwrap_or(MAX_INSTANCES as i64),
        1,
        MAX_INSTANCES as i64,
        MAX_INSTANCES as i64,
        "instances.max-instances",
    ) as usize;

    let instance_ttl = parse_ttl(
        file.ttl.as_deref(),
        DEFAULT_INSTANCE_TTL,
        "instances.ttl",
    )?;

    let include = compile_filter_file(file.include, is_valid_instance_key, "instances.include")?;
    let exclude = compile_filter_file(file.exclude, is_valid_instance_key, "instances.exclude")?;
    let filter = build_filter(include, exclude);

    Ok(InstanceSettings {
        max_instances,
        instance_ttl,
        filter,
    })
}

fn parse_metrics(file: MetricsFile) -> Result<MetricsSettings> {
    let statistic_raw = file.statistic.as_deref().unwrap_or("avg");
    let Some(statistic) = Statistic::parse(statistic_raw) else {
        bail!("invalid metrics.statistic '{statistic_raw}' in config");
    };

    let metadata_ttl = parse_ttl(
        file.metadata_ttl.as_deref(),
        DEFAULT_METADATA_TTL,
        "metrics.metadata-ttl",
    )?;

    // Statistic-aware name patterns match the bare metric name once the
    // statistic suffix is removed; the suffix becomes a selector.
    let mut stat_selectors = Vec::new();
    let include = match file.include {
        None => Patterns::new(),
        Some(entries) => {
            let mut rewritten: FilterFile = BTreeMap::new();
            for (key, patterns) in entries {
                if key == "name" {
                    let mut bases = Vec::with_capacity(patterns.len());
                    for pattern in patterns {
                        match split_statistic_pattern(&pattern) {
                            Some((base, statistic)) => {
                                let regex = compile_pattern(&base, "metrics.include")?;
                                stat_selectors.push(StatSelector {
                                    base: regex,
                                    statistic,
                                });
                                bases.push(base);
                            }
                            None => bases.push(pattern),
                        }
                    }
                    rewritten.insert(key, bases);
                } else {
                    rewritten.insert(key, patterns);
                }
            }
            compile_filter_file(Some(rewritten), is_valid_metric_key, "metrics.include")?
        }
    };

    let exclude = compile_filter_file(file.exclude, is_valid_metric_key, "metrics.exclude")?;
    let filter = build_filter(include, exclude);

    Ok(MetricsSettings {
        statistic,
        metadata_ttl,
        filter,
        stat_selectors,
    })
}

fn parse_processing(file: ProcessingFile) -> ProcessingSettings {
    let concurrency = clamp_or_default(
        file.concurrency.unwrap_or(DEFAULT_CONCURRENCY as i64),
        1,
        MAX_CONCURRENCY as i64,
        DEFAULT_CONCURRENCY as i64,
        "processing.concurrency",
    ) as usize;

    ProcessingSettings { concurrency }
}

fn parse_export(file: ExportFile, port_override: Option<u16>) -> Result<ExportSettings> {
    let configured = file.port.unwrap_or(i64::from(DEFAULT_PORT));
    let port = match port_override {
        Some(port) => port,
        None if (1..=65535).contains(&configured) => configured as u16,
        None => {
            warn!(
                port = configured,
                "export.port outside (0, 65535], using {DEFAULT_PORT}"
            );
            DEFAULT_PORT
        }
    };

    // Refuse ports that something is already listening on, so startup
    // fails here instead of when the server binds.
    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    if TcpStream::connect_timeout(&addr, Duration::from_secs(1)).is_ok() {
        bail!("invalid export.port in config, port {port} is not available");
    }

    let metric_prefix = file
        .prometheus
        .metric_prefix
        .unwrap_or_else(|| DEFAULT_METRIC_PREFIX.to_string());
    validate_metric_prefix(&metric_prefix)?;

    Ok(ExportSettings {
        port,
        metric_prefix,
    })
}

fn parse_ttl(raw: Option<&str>, default: Duration, field: &str) -> Result<Duration> {
    let Some(raw) = raw else {
        return Ok(default);
    };

    let ttl = humantime::parse_duration(raw)
        .with_context(|| format!("invalid {field} format '{raw}' in config"))?;

    Ok(clamp_or_default(ttl, MIN_TTL, MAX_TTL, default, field))
}

fn validate_metric_prefix(prefix: &str) -> Result<()> {
    if prefix.is_empty() {
        bail!("invalid prometheus.metric-prefix in config, prefix cannot be empty");
    }

    let valid_name = Regex::new(VALID_PROMETHEUS_NAME).expect("valid name pattern compiles");
    if !valid_name.is_match(prefix) {
        bail!("invalid prometheus.metric-prefix '{prefix}' in config");
    }

    if prefix.starts_with('_') {
        bail!("invalid prometheus.metric-prefix '{prefix}' in config, cannot start with '_'");
    }

    Ok(())
}

fn is_valid_instance_key(key: &str) -> bool {
    match key {
        "identifier" | "engine" => true,
        _ => key.strip_prefix(TAG_PREFIX).is_some_and(|tag| !tag.is_empty()),
    }
}

fn is_valid_metric_key(key: &str) -> bool {
    matches!(key, "name" | "category" | "unit")
}

fn compile_filter_file(
    file: Option<FilterFile>,
    is_valid_key: fn(&str) -> bool,
    section: &str,
) -> Result<Patterns> {
    let Some(file) = file else {
        return Ok(Patterns::new());
    };

    let mut compiled = Patterns::new();
    for (key, patterns) in file {
        if !is_valid_key(&key) {
            bail!("invalid filter field '{key}' in {section}");
        }

        let regexes = patterns
            .iter()
            .map(|pattern| compile_pattern(pattern, section))
            .collect::<Result<Vec<_>>>()?;

        compiled.insert(key, regexes);
    }

    Ok(compiled)
}

fn compile_pattern(pattern: &str, section: &str) -> Result<Regex> {
    Regex::new(pattern).with_context(|| format!("invalid pattern '{pattern}' in {section}"))
}

fn build_filter(include: Patterns, exclude: Patterns) -> Option<PatternFilter> {
    if include.is_empty() && exclude.is_empty() {
        return None;
    }
    Some(PatternFilter::new(include, exclude))
}

fn clamp_or_default<T: PartialOrd + Copy + Debug>(
    value: T,
    min: T,
    max: T,
    default: T,
    field: &str,
) -> T {
    if value < min || value > max {
        warn!(
            "{field} {value:?} is outside the allowed range [{min:?}, {max:?}], using {default:?}"
        );
        return default;
    }
    value
}
