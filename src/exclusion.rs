//! # Exclusion Filter
//!
//! Compiled identifier blocklist. Values matching an exclusion entry for
//! their type are dropped before grouping and can never form edges.

use regex::Regex;
use rustc_hash::{FxHashMap, FxHashSet};

use crate::errors::{EngineError, Result};
use crate::rules::{ExclusionRule, MatchType};

/// Blocklist compiled once per run: exact values per type plus LIKE patterns
/// compiled to anchored regexes.
#[derive(Debug, Default)]
pub struct ExclusionFilter {
    exact: FxHashMap<String, FxHashSet<String>>,
    patterns: FxHashMap<String, Vec<Regex>>,
}

impl ExclusionFilter {
    pub fn compile(exclusions: &[ExclusionRule]) -> Result<Self> {
        let mut filter = ExclusionFilter::default();
        for exclusion in exclusions {
            match exclusion.match_type {
                MatchType::Exact => {
                    filter
                        .exact
                        .entry(exclusion.identifier_type.clone())
                        .or_default()
                        .insert(exclusion.pattern.clone());
                }
                MatchType::Like => {
                    let regex = like_to_regex(&exclusion.pattern)?;
                    filter
                        .patterns
                        .entry(exclusion.identifier_type.clone())
                        .or_default()
                        .push(regex);
                }
            }
        }
        Ok(filter)
    }

    /// True when the value matches an active entry for its identifier type.
    pub fn is_excluded(&self, identifier_type: &str, value: &str) -> bool {
        if let Some(values) = self.exact.get(identifier_type) {
            if values.contains(value) {
                return true;
            }
        }
        if let Some(patterns) = self.patterns.get(identifier_type) {
            if patterns.iter().any(|p| p.is_match(value)) {
                return true;
            }
        }
        false
    }

    pub fn is_empty(&self) -> bool {
        self.exact.is_empty() && self.patterns.is_empty()
    }
}

/// Translate a SQL LIKE pattern to an anchored regex: `%` matches any run of
/// characters, `_` exactly one; everything else is literal.
fn like_to_regex(pattern: &str) -> Result<Regex> {
    let mut translated = String::with_capacity(pattern.len() + 8);
    translated.push('^');
    for ch in pattern.chars() {
        match ch {
            '%' => translated.push_str(".*"),
            '_' => translated.push('.'),
            other => translated.push_str(&regex::escape(&other.to_string())),
        }
    }
    translated.push('$');
    Regex::new(&translated)
        .map_err(|e| EngineError::Configuration(format!("invalid LIKE pattern '{pattern}': {e}")))
}
