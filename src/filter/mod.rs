//! Include/exclude regex filtering over an object's fields and tags.
//!
//! Semantics: OR within a key, AND across include keys, and exclude always
//! wins over include. Keys starting with `tag.` resolve against the object's
//! tags instead of its fields.

use regex::Regex;
use std::collections::HashMap;

pub const TAG_PREFIX: &str = "tag.";

/// Capability implemented by anything the filter can be applied to.
pub trait Filterable {
    fn filterable_fields(&self) -> HashMap<String, String>;

    fn filterable_tags(&self) -> HashMap<String, String> {
        HashMap::new()
    }
}

/// Compiled patterns keyed by field name or `tag.<key>`.
pub type Patterns = HashMap<String, Vec<Regex>>;

#[derive(Clone, Debug, Default)]
pub struct PatternFilter {
    include: Patterns,
    exclude: Patterns,
}

impl PatternFilter {
    pub fn new(include: Patterns, exclude: Patterns) -> Self {
        Self { include, exclude }
    }

    pub fn has_filters(&self) -> bool {
        !self.include.is_empty() || !self.exclude.is_empty()
    }

    /// Decide whether `obj` passes the filter.
    ///
    /// A key that resolves to no value can never trigger an exclude, but a
    /// missing include key fails the include conjunction.
    pub fn should_include(&self, obj: &dyn Filterable) -> bool {
        if !self.exclude.is_empty() && self.matches_any_key(obj, &self.exclude) {
            return false;
        }

        if !self.include.is_empty() {
            return self.matches_all_keys(obj, &self.include);
        }

        true
    }

    // OR across keys: any resolved value matching any of its patterns hits.
    fn matches_any_key(&self, obj: &dyn Filterable, patterns: &Patterns) -> bool {
        let fields = obj.filterable_fields();
        let tags = obj.filterable_tags();

        patterns.iter().any(|(key, regexes)| {
            resolve_value(key, &fields, &tags)
                .is_some_and(|value| matches_patterns(value, regexes))
        })
    }

    // AND across keys: every key must resolve and match one of its patterns.
    fn matches_all_keys(&self, obj: &dyn Filterable, patterns: &Patterns) -> bool {
        let fields = obj.filterable_fields();
        let tags = obj.filterable_tags();

        patterns.iter().all(|(key, regexes)| {
            resolve_value(key, &fields, &tags)
                .is_some_and(|value| matches_patterns(value, regexes))
        })
    }
}

fn resolve_value<'a>(
    key: &str,
    fields: &'a HashMap<String, String>,
    tags: &'a HashMap<String, String>,
) -> Option<&'a str> {
    if let Some(value) = fields.get(key) {
        return Some(value);
    }
    key.strip_prefix(TAG_PREFIX)
        .and_then(|tag_key| tags.get(tag_key))
        .map(String::as_str)
}

fn matches_patterns(value: &str, regexes: &[Regex]) -> bool {
    regexes.iter().any(|regex| regex.is_match(value))
}
