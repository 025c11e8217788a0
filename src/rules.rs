//! # Matching Rules
//!
//! The immutable, run-scoped rule set: exact identifier rules, fuzzy merge
//! rules, exclusion blocklist entries, and survivorship policies. Rules are
//! validated once at load time and passed explicitly through the pipeline.

use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::BTreeMap;
use std::collections::HashSet;

use crate::config::EngineConfig;
use crate::errors::{EngineError, Result};

pub const DEFAULT_RULE_PRIORITY: u32 = 100;
pub const DEFAULT_FUZZY_THRESHOLD: f64 = 0.85;

fn default_priority() -> u32 {
    DEFAULT_RULE_PRIORITY
}

fn default_threshold() -> f64 {
    DEFAULT_FUZZY_THRESHOLD
}

fn default_active() -> bool {
    true
}

/// Value canonicalization applied before identifier grouping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Canonicalize {
    Exact,
    #[default]
    Lowercase,
    Uppercase,
}

impl Canonicalize {
    pub fn apply<'a>(&self, value: &'a str) -> Cow<'a, str> {
        match self {
            Canonicalize::Exact => Cow::Borrowed(value),
            Canonicalize::Lowercase => Cow::Owned(value.to_lowercase()),
            Canonicalize::Uppercase => Cow::Owned(value.to_uppercase()),
        }
    }
}

/// A deterministic identifier-matching rule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExactRule {
    pub rule_id: String,
    pub identifier_type: String,
    #[serde(default)]
    pub canonicalize: Canonicalize,
    /// Per-rule group size cap; falls back to the engine default when unset
    #[serde(default)]
    pub max_group_size: Option<usize>,
    #[serde(default = "default_priority")]
    pub priority: u32,
    #[serde(default = "default_active")]
    pub is_active: bool,
}

impl ExactRule {
    pub fn new(rule_id: impl Into<String>, identifier_type: impl Into<String>) -> Self {
        Self {
            rule_id: rule_id.into(),
            identifier_type: identifier_type.into(),
            canonicalize: Canonicalize::default(),
            max_group_size: None,
            priority: DEFAULT_RULE_PRIORITY,
            is_active: true,
        }
    }

    pub fn with_canonicalize(mut self, canonicalize: Canonicalize) -> Self {
        self.canonicalize = canonicalize;
        self
    }

    pub fn with_max_group_size(mut self, max_group_size: usize) -> Self {
        self.max_group_size = Some(max_group_size);
        self
    }

    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    pub fn inactive(mut self) -> Self {
        self.is_active = false;
        self
    }

    /// Effective group size cap for this rule.
    pub fn group_cap(&self, config: &EngineConfig) -> usize {
        self.max_group_size.unwrap_or(config.default_max_group_size)
    }
}

/// Deterministic similarity function evaluated between two cluster profiles.
///
/// Each variant reads one or more attributes out of the block profiles and
/// returns a score in `[0, 1]`; a missing attribute on either side scores 0.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "function", rename_all = "snake_case")]
pub enum ScoreFn {
    JaroWinkler { attribute: String },
    Levenshtein { attribute: String },
    ExactMatch { attribute: String },
    Mean { parts: Vec<ScoreFn> },
}

impl ScoreFn {
    /// Evaluate against two cluster profiles (attribute name to value).
    pub fn score(&self, left: &BTreeMap<String, String>, right: &BTreeMap<String, String>) -> f64 {
        match self {
            ScoreFn::JaroWinkler { attribute } => match (left.get(attribute), right.get(attribute)) {
                (Some(a), Some(b)) => strsim::jaro_winkler(a, b),
                _ => 0.0,
            },
            ScoreFn::Levenshtein { attribute } => match (left.get(attribute), right.get(attribute)) {
                (Some(a), Some(b)) => strsim::normalized_levenshtein(a, b),
                _ => 0.0,
            },
            ScoreFn::ExactMatch { attribute } => match (left.get(attribute), right.get(attribute)) {
                (Some(a), Some(b)) if !a.is_empty() && a == b => 1.0,
                _ => 0.0,
            },
            ScoreFn::Mean { parts } => {
                if parts.is_empty() {
                    return 0.0;
                }
                let sum: f64 = parts.iter().map(|p| p.score(left, right)).sum();
                sum / parts.len() as f64
            }
        }
    }

    fn validate(&self, rule_id: &str) -> Result<()> {
        match self {
            ScoreFn::JaroWinkler { attribute }
            | ScoreFn::Levenshtein { attribute }
            | ScoreFn::ExactMatch { attribute } => {
                if attribute.trim().is_empty() {
                    return Err(EngineError::Configuration(format!(
                        "fuzzy rule '{rule_id}' has a score function with an empty attribute"
                    )));
                }
                Ok(())
            }
            ScoreFn::Mean { parts } => {
                if parts.is_empty() {
                    return Err(EngineError::Configuration(format!(
                        "fuzzy rule '{rule_id}' has a mean score function with no parts"
                    )));
                }
                for part in parts {
                    part.validate(rule_id)?;
                }
                Ok(())
            }
        }
    }
}

/// A probabilistic cluster-merge rule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FuzzyRule {
    pub rule_id: String,
    /// Attribute whose shared value restricts candidate pairs to one block
    pub blocking_key: String,
    pub score: ScoreFn,
    #[serde(default = "default_threshold")]
    pub threshold: f64,
    #[serde(default = "default_priority")]
    pub priority: u32,
    #[serde(default = "default_active")]
    pub is_active: bool,
}

impl FuzzyRule {
    pub fn new(rule_id: impl Into<String>, blocking_key: impl Into<String>, score: ScoreFn) -> Self {
        Self {
            rule_id: rule_id.into(),
            blocking_key: blocking_key.into(),
            score,
            threshold: DEFAULT_FUZZY_THRESHOLD,
            priority: DEFAULT_RULE_PRIORITY,
            is_active: true,
        }
    }

    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.threshold = threshold;
        self
    }

    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    pub fn inactive(mut self) -> Self {
        self.is_active = false;
        self
    }
}

/// How an exclusion pattern is matched against identifier values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MatchType {
    Exact,
    /// SQL LIKE semantics: `%` matches any run, `_` any single character
    Like,
}

/// A blocklist entry preventing an identifier value from forming edges
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExclusionRule {
    pub identifier_type: String,
    pub pattern: String,
    pub match_type: MatchType,
}

impl ExclusionRule {
    pub fn exact(identifier_type: impl Into<String>, pattern: impl Into<String>) -> Self {
        Self {
            identifier_type: identifier_type.into(),
            pattern: pattern.into(),
            match_type: MatchType::Exact,
        }
    }

    pub fn like(identifier_type: impl Into<String>, pattern: impl Into<String>) -> Self {
        Self {
            identifier_type: identifier_type.into(),
            pattern: pattern.into(),
            match_type: MatchType::Like,
        }
    }
}

/// Survivor-value selection policy for one attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SurvivorshipStrategy {
    Recency,
    Priority,
    Frequency,
    AggMax,
    AggSum,
}

/// Per-attribute survivorship policy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SurvivorshipRule {
    pub attribute: String,
    pub strategy: SurvivorshipStrategy,
    /// Source ids from most to least trusted; only used by PRIORITY
    #[serde(default)]
    pub source_priority: Vec<String>,
}

impl SurvivorshipRule {
    pub fn new(attribute: impl Into<String>, strategy: SurvivorshipStrategy) -> Self {
        Self {
            attribute: attribute.into(),
            strategy,
            source_priority: Vec::new(),
        }
    }

    pub fn with_source_priority(mut self, sources: Vec<String>) -> Self {
        self.source_priority = sources;
        self
    }
}

/// The complete rule set for one run
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RuleSet {
    pub exact_rules: Vec<ExactRule>,
    pub fuzzy_rules: Vec<FuzzyRule>,
    pub exclusions: Vec<ExclusionRule>,
    pub survivorship: Vec<SurvivorshipRule>,
}

impl RuleSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_exact_rule(&mut self, rule: ExactRule) {
        self.exact_rules.push(rule);
    }

    pub fn add_fuzzy_rule(&mut self, rule: FuzzyRule) {
        self.fuzzy_rules.push(rule);
    }

    pub fn add_exclusion(&mut self, exclusion: ExclusionRule) {
        self.exclusions.push(exclusion);
    }

    pub fn add_survivorship(&mut self, rule: SurvivorshipRule) {
        self.survivorship.push(rule);
    }

    /// Active exact rules ordered by priority, then rule id.
    pub fn active_exact_rules(&self) -> Vec<&ExactRule> {
        let mut rules: Vec<&ExactRule> = self.exact_rules.iter().filter(|r| r.is_active).collect();
        rules.sort_by(|a, b| {
            a.priority
                .cmp(&b.priority)
                .then_with(|| a.rule_id.cmp(&b.rule_id))
        });
        rules
    }

    /// Active fuzzy rules ordered by priority, then rule id.
    pub fn active_fuzzy_rules(&self) -> Vec<&FuzzyRule> {
        let mut rules: Vec<&FuzzyRule> = self.fuzzy_rules.iter().filter(|r| r.is_active).collect();
        rules.sort_by(|a, b| {
            a.priority
                .cmp(&b.priority)
                .then_with(|| a.rule_id.cmp(&b.rule_id))
        });
        rules
    }

    /// Look up the active exact rule recognizing an identifier type. With
    /// several active rules on one type, the winner is the first in
    /// `active_exact_rules` order, so every lookup for a type lands on the
    /// same rule.
    pub fn exact_rule_for_type(&self, identifier_type: &str) -> Option<&ExactRule> {
        self.exact_rules
            .iter()
            .filter(|r| r.is_active && r.identifier_type == identifier_type)
            .min_by(|a, b| {
                a.priority
                    .cmp(&b.priority)
                    .then_with(|| a.rule_id.cmp(&b.rule_id))
            })
    }

    /// Distinct identifier types across active exact rules. Denominator for
    /// edge-diversity normalization.
    pub fn identifier_type_count(&self) -> usize {
        self.exact_rules
            .iter()
            .filter(|r| r.is_active)
            .map(|r| r.identifier_type.as_str())
            .collect::<HashSet<_>>()
            .len()
    }

    pub fn validate(&self) -> Result<()> {
        let mut seen_ids = HashSet::new();
        for rule in &self.exact_rules {
            if rule.rule_id.trim().is_empty() {
                return Err(EngineError::Configuration(
                    "exact rule with empty rule_id".into(),
                ));
            }
            if rule.identifier_type.trim().is_empty() {
                return Err(EngineError::Configuration(format!(
                    "exact rule '{}' has an empty identifier_type",
                    rule.rule_id
                )));
            }
            if !seen_ids.insert(rule.rule_id.as_str()) {
                return Err(EngineError::Configuration(format!(
                    "duplicate rule_id '{}'",
                    rule.rule_id
                )));
            }
            if let Some(cap) = rule.max_group_size {
                if cap < 2 {
                    return Err(EngineError::Configuration(format!(
                        "rule '{}': max_group_size must be >= 2, got {cap}",
                        rule.rule_id
                    )));
                }
            }
        }

        for rule in &self.fuzzy_rules {
            if rule.rule_id.trim().is_empty() {
                return Err(EngineError::Configuration(
                    "fuzzy rule with empty rule_id".into(),
                ));
            }
            if !seen_ids.insert(rule.rule_id.as_str()) {
                return Err(EngineError::Configuration(format!(
                    "duplicate rule_id '{}'",
                    rule.rule_id
                )));
            }
            if rule.blocking_key.trim().is_empty() {
                return Err(EngineError::Configuration(format!(
                    "fuzzy rule '{}' has an empty blocking_key",
                    rule.rule_id
                )));
            }
            if !(rule.threshold > 0.0 && rule.threshold <= 1.0) {
                return Err(EngineError::Configuration(format!(
                    "fuzzy rule '{}': threshold must be in (0, 1], got {}",
                    rule.rule_id, rule.threshold
                )));
            }
            rule.score.validate(&rule.rule_id)?;
        }

        for exclusion in &self.exclusions {
            if exclusion.identifier_type.trim().is_empty() {
                return Err(EngineError::Configuration(
                    "exclusion with empty identifier_type".into(),
                ));
            }
            if exclusion.pattern.is_empty() {
                return Err(EngineError::Configuration(format!(
                    "exclusion for '{}' has an empty pattern",
                    exclusion.identifier_type
                )));
            }
        }

        let mut seen_attrs = HashSet::new();
        for rule in &self.survivorship {
            if rule.attribute.trim().is_empty() {
                return Err(EngineError::Configuration(
                    "survivorship rule with empty attribute".into(),
                ));
            }
            if !seen_attrs.insert(rule.attribute.as_str()) {
                return Err(EngineError::Configuration(format!(
                    "duplicate survivorship rule for attribute '{}'",
                    rule.attribute
                )));
            }
            if rule.strategy == SurvivorshipStrategy::Priority && rule.source_priority.is_empty() {
                return Err(EngineError::Configuration(format!(
                    "survivorship rule for '{}' uses PRIORITY without a source priority list",
                    rule.attribute
                )));
            }
        }

        Ok(())
    }

    /// Parse a rule set from its JSON representation.
    pub fn from_json(json: &str) -> Result<Self> {
        let rules: RuleSet = serde_json::from_str(json)
            .map_err(|e| EngineError::Configuration(format!("invalid rule set JSON: {e}")))?;
        rules.validate()?;
        Ok(rules)
    }

    /// Digest of the canonical JSON serialization of rules plus engine
    /// tunables. Recorded per run so outputs trace back to the exact
    /// configuration that produced them.
    pub fn digest(&self, config: &EngineConfig) -> Result<String> {
        let snapshot = serde_json::to_vec(&(self, config))
            .map_err(|e| EngineError::Internal(format!("config snapshot serialization: {e}")))?;
        Ok(blake3::hash(&snapshot).to_hex().to_string())
    }
}
