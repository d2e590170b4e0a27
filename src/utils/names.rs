//! Name mangling between provider metric identifiers and Prometheus names.

use crate::models::Statistic;

/// Maximum number of `name.statistic` identifiers per datapoint request.
pub const BATCH_SIZE: usize = 15;

/// Convert a dotted provider metric name into a Prometheus-safe name:
/// dots become underscores, anything outside `[A-Za-z0-9_:]` is dropped,
/// and the result is lowercased.
pub fn snake_case(input: &str) -> String {
    input
        .chars()
        .filter_map(|c| match c {
            '.' => Some('_'),
            c if c.is_ascii_alphanumeric() || c == '_' || c == ':' => {
                Some(c.to_ascii_lowercase())
            }
            _ => None,
        })
        .collect()
}

/// Split a `name.statistic` identifier into its parts.
///
/// Returns `None` when the identifier does not end in a valid statistic.
pub fn trim_statistic(metric_with_stat: &str) -> Option<(&str, Statistic)> {
    for statistic in Statistic::ALL {
        if let Some(base) = metric_with_stat.strip_suffix(statistic.as_str()) {
            if let Some(base) = base.strip_suffix('.') {
                if !base.is_empty() {
                    return Some((base, statistic));
                }
            }
        }
    }
    None
}

/// Split a metric-name regex whose suffix selects a statistic, e.g.
/// `^db\.SQL\..*\.max$` -> (`^db\.SQL\..*$`, max).
///
/// The returned base pattern keeps any trailing `$` anchor so it still
/// matches the bare metric name. Patterns without a statistic suffix (or
/// with nothing left once the suffix is removed) are not selectors.
pub fn split_statistic_pattern(pattern: &str) -> Option<(String, Statistic)> {
    let (body, anchored) = match pattern.strip_suffix('$') {
        Some(stripped) => (stripped, true),
        None => (pattern, false),
    };

    let lowered = body.to_lowercase();
    for statistic in Statistic::ALL {
        let escaped = format!("\\.{statistic}");
        let plain = format!(".{statistic}");

        let suffix_len = if lowered.ends_with(&escaped) {
            escaped.len()
        } else if lowered.ends_with(&plain) {
            plain.len()
        } else {
            continue;
        };

        let base = &body[..body.len() - suffix_len];
        if base.trim_start_matches('^').is_empty() {
            return None;
        }

        let mut base = base.to_string();
        if anchored {
            base.push('$');
        }
        return Some((base, statistic));
    }

    None
}

/// Partition `name.statistic` identifiers into request-sized batches,
/// preserving order.
pub fn batch_metric_names(metric_names: &[String], batch_size: usize) -> Vec<Vec<String>> {
    if metric_names.is_empty() {
        return Vec::new();
    }

    metric_names
        .chunks(batch_size)
        .map(<[String]>::to_vec)
        .collect()
}
