//! # Golden Profile Builder
//!
//! Applies survivorship rules to every cluster, collapsing member
//! attribute observations into one consolidated profile. Each configured
//! attribute picks its survivor independently; attributes without a
//! single usable value stay out of the profile entirely.

use crate::model::{Attribute, GoldenProfile};
use crate::resolver::Resolution;
use crate::rules::{RuleSet, SurvivorshipRule, SurvivorshipStrategy};
use rustc_hash::FxHashMap;
use std::collections::BTreeMap;
use tracing::{debug, instrument};

/// One ignored value: non-numeric input under a numeric aggregation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QualityNote {
    pub resolved_id: String,
    pub attribute: String,
    pub entity_key: String,
    pub value: String,
}

/// Outcome of the profile pass
#[derive(Debug, Clone, Default)]
pub struct GoldenOutput {
    /// One profile per cluster that produced at least one survivor value
    pub profiles: Vec<GoldenProfile>,
    pub quality_notes: Vec<QualityNote>,
}

/// Builds consolidated profiles from member attributes
#[derive(Debug)]
pub struct GoldenBuilder<'a> {
    rules: &'a [SurvivorshipRule],
}

impl<'a> GoldenBuilder<'a> {
    pub fn new(rules: &'a RuleSet) -> Self {
        Self {
            rules: &rules.survivorship,
        }
    }

    /// Select survivor values for every cluster and ruled attribute.
    ///
    /// Candidate rows are ordered by `(entity_key, value)` before
    /// selection, so the outcome does not depend on input stream order.
    #[instrument(skip_all, level = "debug")]
    pub fn build(&self, resolution: &Resolution, attributes: &[Attribute]) -> GoldenOutput {
        if self.rules.is_empty() || resolution.is_empty() {
            return GoldenOutput::default();
        }

        let member_index = resolution.index_by_member();
        let rule_for: FxHashMap<&str, &SurvivorshipRule> = self
            .rules
            .iter()
            .map(|rule| (rule.attribute.as_str(), rule))
            .collect();

        let mut candidates: FxHashMap<(usize, &str), Vec<&Attribute>> = FxHashMap::default();
        for attr in attributes {
            let Some(rule) = rule_for.get(attr.name.as_str()) else {
                continue;
            };
            let Some(&pos) = member_index.get(attr.entity_key.as_str()) else {
                continue;
            };
            if attr.value.trim().is_empty() {
                continue;
            }
            candidates
                .entry((pos, rule.attribute.as_str()))
                .or_default()
                .push(attr);
        }

        let mut notes = Vec::new();
        let mut values: Vec<BTreeMap<String, String>> =
            vec![BTreeMap::new(); resolution.cluster_count()];
        for ((pos, attr_name), mut rows) in candidates {
            rows.sort_unstable_by(|a, b| {
                a.entity_key
                    .cmp(&b.entity_key)
                    .then_with(|| a.value.cmp(&b.value))
            });
            let rule = rule_for[attr_name];
            let resolved_id = resolution.clusters[pos].resolved_id.as_str();
            if let Some(survivor) = select_survivor(rule, &rows, resolved_id, &mut notes) {
                values[pos].insert(attr_name.to_string(), survivor);
            }
        }

        let profiles: Vec<GoldenProfile> = resolution
            .clusters
            .iter()
            .zip(values)
            .filter_map(|(cluster, values)| {
                if values.is_empty() {
                    None
                } else {
                    Some(GoldenProfile {
                        resolved_id: cluster.resolved_id.clone(),
                        values,
                    })
                }
            })
            .collect();

        notes.sort_unstable_by(|a, b| {
            (&a.resolved_id, &a.attribute, &a.entity_key, &a.value).cmp(&(
                &b.resolved_id,
                &b.attribute,
                &b.entity_key,
                &b.value,
            ))
        });
        debug!(
            profiles = profiles.len(),
            quality_notes = notes.len(),
            "golden profiles built"
        );
        GoldenOutput {
            profiles,
            quality_notes: notes,
        }
    }
}

/// Pick one survivor value from a cluster's candidate rows.
///
/// Rows arrive sorted by `(entity_key, value)`. Ties follow the strategy:
/// recency and priority fall back to the smallest entity key, frequency
/// and the numeric aggregations to the smallest value.
fn select_survivor(
    rule: &SurvivorshipRule,
    rows: &[&Attribute],
    resolved_id: &str,
    notes: &mut Vec<QualityNote>,
) -> Option<String> {
    match rule.strategy {
        SurvivorshipStrategy::Recency => rows
            .iter()
            .max_by(|a, b| {
                a.watermark
                    .cmp(&b.watermark)
                    .then_with(|| b.entity_key.cmp(&a.entity_key))
                    .then_with(|| b.value.cmp(&a.value))
            })
            .map(|attr| attr.value.trim().to_string()),
        SurvivorshipStrategy::Priority => {
            let rank = |source_id: &str| {
                rule.source_priority
                    .iter()
                    .position(|s| s == source_id)
                    .unwrap_or(rule.source_priority.len())
            };
            rows.iter()
                .min_by(|a, b| {
                    rank(&a.source_id)
                        .cmp(&rank(&b.source_id))
                        .then_with(|| a.entity_key.cmp(&b.entity_key))
                        .then_with(|| a.value.cmp(&b.value))
                })
                .map(|attr| attr.value.trim().to_string())
        }
        SurvivorshipStrategy::Frequency => {
            let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
            for attr in rows {
                *counts.entry(attr.value.trim()).or_insert(0) += 1;
            }
            counts
                .into_iter()
                .max_by(|(a_v, a_n), (b_v, b_n)| a_n.cmp(b_n).then_with(|| b_v.cmp(a_v)))
                .map(|(value, _)| value.to_string())
        }
        SurvivorshipStrategy::AggMax => numeric_rows(rule, rows, resolved_id, notes)
            .into_iter()
            .max_by(|(a_num, a_raw), (b_num, b_raw)| {
                a_num.total_cmp(b_num).then_with(|| b_raw.cmp(a_raw))
            })
            .map(|(_, raw)| raw.to_string()),
        SurvivorshipStrategy::AggSum => {
            let parsed = numeric_rows(rule, rows, resolved_id, notes);
            if parsed.is_empty() {
                None
            } else {
                let sum: f64 = parsed.iter().map(|(num, _)| num).sum();
                Some(sum.to_string())
            }
        }
    }
}

/// Parse candidate values as finite numbers, noting every reject.
fn numeric_rows<'r>(
    rule: &SurvivorshipRule,
    rows: &[&'r Attribute],
    resolved_id: &str,
    notes: &mut Vec<QualityNote>,
) -> Vec<(f64, &'r str)> {
    let mut parsed = Vec::with_capacity(rows.len());
    for attr in rows {
        let raw = attr.value.trim();
        match raw.parse::<f64>() {
            Ok(num) if num.is_finite() => parsed.push((num, raw)),
            _ => {
                debug!(
                    attribute = %rule.attribute,
                    entity_key = %attr.entity_key,
                    "non-numeric value ignored by aggregation"
                );
                notes.push(QualityNote {
                    resolved_id: resolved_id.to_string(),
                    attribute: rule.attribute.clone(),
                    entity_key: attr.entity_key.clone(),
                    value: attr.value.clone(),
                });
            }
        }
    }
    parsed
}
