//! # Edge Builder
//!
//! Turns identifier-value groups into a compressed edge set. Each group of
//! `n` entities sharing a value becomes `n - 1` edges pointing at the group's
//! anchor (its minimum entity key), which preserves connected components at
//! `O(n)` cost instead of the `O(n^2)` clique. Groups over their rule's size
//! cap produce no edges, only an audit row; they still land in the
//! identifier index at full size, so an incremental rebuild that touches
//! the value sees the whole group again and re-applies the cap.

use rayon::prelude::*;
use rustc_hash::FxHashMap;
use tracing::debug;

use crate::config::EngineConfig;
use crate::exclusion::ExclusionFilter;
use crate::model::{Edge, Identifier, SkippedGroup, SKIP_REASON_GROUP_SIZE};
use crate::rules::RuleSet;

/// One post-exclusion identifier-value group. Persisted as the identifier
/// index so later incremental runs can find old entities sharing a value.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct IdentifierGroup {
    pub identifier_type: String,
    pub normalized_value: String,
    pub rule_id: String,
    pub is_hashed: bool,
    /// Sorted, de-duplicated member keys
    pub entity_keys: Vec<String>,
}

/// Everything the edge stage produces
#[derive(Debug, Default)]
pub struct EdgeBuildOutput {
    /// Typed edges, sorted, de-duplicated per `(left, right, identifier_type)`
    pub edges: Vec<Edge>,
    pub skipped: Vec<SkippedGroup>,
    /// Every post-exclusion group for the identifier index, singletons and
    /// over-cap groups included
    pub groups: Vec<IdentifierGroup>,
    pub values_excluded: u64,
}

struct GroupAcc {
    rule_id: String,
    is_hashed: bool,
    entity_keys: Vec<String>,
}

enum GroupOutcome {
    Edges(IdentifierGroup, Vec<Edge>),
    Skipped(IdentifierGroup, SkippedGroup),
}

/// Builds the compressed edge set for one run.
pub struct EdgeBuilder<'a> {
    rules: &'a RuleSet,
    config: &'a EngineConfig,
    filter: &'a ExclusionFilter,
}

impl<'a> EdgeBuilder<'a> {
    pub fn new(rules: &'a RuleSet, config: &'a EngineConfig, filter: &'a ExclusionFilter) -> Self {
        Self {
            rules,
            config,
            filter,
        }
    }

    /// Group identifiers by `(type, canonical value)` and emit star edges per
    /// group. Output ordering is fully deterministic regardless of input or
    /// scheduling order.
    pub fn build(&self, identifiers: &[Identifier]) -> EdgeBuildOutput {
        let mut groups: FxHashMap<(String, String), GroupAcc> = FxHashMap::default();
        let mut values_excluded = 0u64;
        let mut blank_dropped = 0u64;

        for identifier in identifiers {
            let Some(rule) = self.rules.exact_rule_for_type(&identifier.identifier_type) else {
                continue;
            };
            let trimmed = identifier.normalized_value.trim();
            if trimmed.is_empty() {
                blank_dropped += 1;
                continue;
            }
            let value = rule.canonicalize.apply(trimmed);
            if self.filter.is_excluded(&identifier.identifier_type, &value) {
                values_excluded += 1;
                continue;
            }

            let acc = groups
                .entry((identifier.identifier_type.clone(), value.into_owned()))
                .or_insert_with(|| GroupAcc {
                    rule_id: rule.rule_id.clone(),
                    is_hashed: false,
                    entity_keys: Vec::new(),
                });
            acc.is_hashed |= identifier.is_hashed;
            acc.entity_keys.push(identifier.entity_key.clone());
        }

        if blank_dropped > 0 {
            debug!(blank_dropped, "dropped blank identifier values");
        }

        let sample_size = self.config.skipped_sample_size;
        // First writer wins: the same priority order `exact_rule_for_type`
        // resolves by, so the cap enforced and the rule attributed agree.
        let mut caps: FxHashMap<&str, usize> = FxHashMap::default();
        for rule in self.rules.active_exact_rules() {
            caps.entry(rule.identifier_type.as_str())
                .or_insert(rule.group_cap(self.config));
        }

        let group_list: Vec<((String, String), GroupAcc)> = groups.into_iter().collect();
        let outcomes: Vec<GroupOutcome> = group_list
            .into_par_iter()
            .map(|((identifier_type, value), mut acc)| {
                acc.entity_keys.sort_unstable();
                acc.entity_keys.dedup();
                let n = acc.entity_keys.len();
                let cap = caps
                    .get(identifier_type.as_str())
                    .copied()
                    .unwrap_or(self.config.default_max_group_size);

                if n > cap {
                    let audit = SkippedGroup {
                        identifier_type: identifier_type.clone(),
                        normalized_value: value.clone(),
                        group_size: n,
                        max_allowed: cap,
                        sample_keys: acc.entity_keys.iter().take(sample_size).cloned().collect(),
                        reason: SKIP_REASON_GROUP_SIZE.to_string(),
                    };
                    return GroupOutcome::Skipped(
                        IdentifierGroup {
                            identifier_type,
                            normalized_value: value,
                            rule_id: acc.rule_id,
                            is_hashed: acc.is_hashed,
                            entity_keys: acc.entity_keys,
                        },
                        audit,
                    );
                }

                let anchor = &acc.entity_keys[0];
                let edges: Vec<Edge> = acc.entity_keys[1..]
                    .iter()
                    .map(|member| {
                        Edge::between(
                            member.clone(),
                            anchor.clone(),
                            identifier_type.clone(),
                            value.clone(),
                            acc.rule_id.clone(),
                        )
                        .with_hashed(acc.is_hashed)
                    })
                    .collect();

                GroupOutcome::Edges(
                    IdentifierGroup {
                        identifier_type,
                        normalized_value: value,
                        rule_id: acc.rule_id,
                        is_hashed: acc.is_hashed,
                        entity_keys: acc.entity_keys,
                    },
                    edges,
                )
            })
            .collect();

        let mut output = EdgeBuildOutput {
            values_excluded,
            ..Default::default()
        };
        for outcome in outcomes {
            match outcome {
                GroupOutcome::Edges(group, edges) => {
                    output.groups.push(group);
                    output.edges.extend(edges);
                }
                GroupOutcome::Skipped(group, skipped) => {
                    output.groups.push(group);
                    output.skipped.push(skipped);
                }
            }
        }

        output.edges.sort_unstable();
        output.edges.dedup_by(|a, b| a.typed_pair() == b.typed_pair());
        output
            .skipped
            .sort_unstable_by(|a, b| (&a.identifier_type, &a.normalized_value)
                .cmp(&(&b.identifier_type, &b.normalized_value)));
        output
            .groups
            .sort_unstable_by(|a, b| (&a.identifier_type, &a.normalized_value)
                .cmp(&(&b.identifier_type, &b.normalized_value)));

        debug!(
            edges = output.edges.len(),
            groups = output.groups.len(),
            skipped = output.skipped.len(),
            values_excluded,
            "edge build complete"
        );
        output
    }
}
