//! # Fuzzy Merge Engine
//!
//! Probabilistic post-processing over deterministic clusters. Each active
//! fuzzy rule blocks clusters on one attribute of their pivoted profiles,
//! scores candidate pairs in parallel per block, and every pair at or
//! above the rule threshold feeds a second min-label union pass whose
//! nodes are cluster ids. Clusters that merge share a `super_cluster_id`;
//! untouched clusters keep their own id.
//!
//! Pairs are enumerated exactly once in canonical `(min, max)` order, so
//! scoring is independent of block iteration and worker scheduling.

use crate::config::EngineConfig;
use crate::dsu::Dsu;
use crate::model::{Attribute, EntityId};
use crate::resolver::Resolution;
use crate::rules::{FuzzyRule, RuleSet};
use rayon::prelude::*;
use rustc_hash::FxHashMap;
use std::collections::BTreeMap;
use tracing::{debug, instrument};

/// Audit row for a candidate block that exceeded `max_block_size`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedBlock {
    pub rule_id: String,
    pub blocking_key: String,
    pub block_value: String,
    pub block_size: usize,
    pub max_allowed: usize,
}

/// Outcome of the fuzzy pass over one resolution
#[derive(Debug, Clone, Default)]
pub struct FuzzyOutput {
    /// `resolved_id` to `super_cluster_id`, one entry per input cluster
    pub assignments: FxHashMap<String, String>,
    /// Clusters whose super-cluster label differs from their own id
    pub clusters_merged: u64,
    pub pairs_scored: u64,
    pub pairs_matched: u64,
    pub skipped_blocks: Vec<SkippedBlock>,
}

impl FuzzyOutput {
    /// Identity assignment: every cluster is its own super-cluster.
    fn identity(resolution: &Resolution) -> Self {
        let assignments = resolution
            .clusters
            .iter()
            .map(|c| (c.resolved_id.clone(), c.resolved_id.clone()))
            .collect();
        Self {
            assignments,
            ..Self::default()
        }
    }
}

/// Scores and merges clusters according to the active fuzzy rules
#[derive(Debug)]
pub struct FuzzyMerger<'a> {
    rules: &'a RuleSet,
    max_block_size: usize,
}

impl<'a> FuzzyMerger<'a> {
    pub fn new(rules: &'a RuleSet, config: &EngineConfig) -> Self {
        Self {
            rules,
            max_block_size: config.max_block_size.max(2),
        }
    }

    /// Merge clusters whose scored similarity clears a rule threshold.
    ///
    /// Matched pairs from all rules and blocks are collected first, then
    /// applied in one union pass, so the super-cluster assignment cannot
    /// depend on rule or block evaluation order.
    #[instrument(skip_all, level = "debug")]
    pub fn merge(&self, resolution: &Resolution, attributes: &[Attribute]) -> FuzzyOutput {
        let active = self.rules.active_fuzzy_rules();
        if active.is_empty() || resolution.cluster_count() < 2 {
            return FuzzyOutput::identity(resolution);
        }

        // Clusters arrive sorted by resolved_id, so dense position order is
        // lexicographic id order and the union minimum is the smallest id.
        let cluster_ids: Vec<&str> = resolution
            .clusters
            .iter()
            .map(|c| c.resolved_id.as_str())
            .collect();
        let profiles = cluster_profiles(resolution, attributes);

        let mut output = FuzzyOutput::default();
        let mut matched_pairs: Vec<(u32, u32)> = Vec::new();
        for rule in &active {
            let (blocks, skipped, pairs) = build_blocks(rule, &profiles, self.max_block_size);
            output.pairs_scored += pairs;
            output.skipped_blocks.extend(skipped);

            let matched: Vec<(u32, u32)> = blocks
                .par_iter()
                .flat_map_iter(|members| score_block(rule, members, &profiles))
                .collect();
            debug!(
                rule_id = %rule.rule_id,
                blocks = blocks.len(),
                matched = matched.len(),
                "fuzzy rule scored"
            );
            matched_pairs.extend(matched);
        }
        output.pairs_matched = matched_pairs.len() as u64;

        let mut dsu = Dsu::new(cluster_ids.len());
        for &(a, b) in &matched_pairs {
            dsu.union(EntityId(a), EntityId(b));
        }
        for (pos, label) in dsu.labels().into_iter().enumerate() {
            if label.0 != pos as u32 {
                output.clusters_merged += 1;
            }
            output.assignments.insert(
                cluster_ids[pos].to_string(),
                cluster_ids[label.0 as usize].to_string(),
            );
        }
        output
    }
}

/// Pivot member attributes into one profile per cluster.
///
/// When members disagree on an attribute the lexicographically largest
/// value wins, which keeps the pivot deterministic for any member order.
fn cluster_profiles(resolution: &Resolution, attributes: &[Attribute]) -> Vec<BTreeMap<String, String>> {
    let member_index = resolution.index_by_member();
    let mut profiles = vec![BTreeMap::new(); resolution.cluster_count()];
    for attr in attributes {
        let Some(&pos) = member_index.get(attr.entity_key.as_str()) else {
            continue;
        };
        let value = attr.value.trim();
        if value.is_empty() {
            continue;
        }
        let profile: &mut BTreeMap<String, String> = &mut profiles[pos];
        match profile.get_mut(&attr.name) {
            Some(existing) if existing.as_str() >= value => {}
            Some(existing) => *existing = value.to_string(),
            None => {
                profile.insert(attr.name.clone(), value.to_string());
            }
        }
    }
    profiles
}

/// Group cluster positions by blocking value. Clusters missing the blocking
/// attribute never enter a block; singleton blocks yield no pairs; blocks
/// over the cap are skipped whole and reported.
fn build_blocks(
    rule: &FuzzyRule,
    profiles: &[BTreeMap<String, String>],
    max_block_size: usize,
) -> (Vec<Vec<u32>>, Vec<SkippedBlock>, u64) {
    let mut by_value: FxHashMap<&str, Vec<u32>> = FxHashMap::default();
    for (pos, profile) in profiles.iter().enumerate() {
        if let Some(value) = profile.get(&rule.blocking_key) {
            by_value.entry(value.as_str()).or_default().push(pos as u32);
        }
    }

    let mut blocks = Vec::new();
    let mut skipped = Vec::new();
    let mut pairs = 0u64;
    for (value, members) in by_value {
        if members.len() < 2 {
            continue;
        }
        if members.len() > max_block_size {
            skipped.push(SkippedBlock {
                rule_id: rule.rule_id.clone(),
                blocking_key: rule.blocking_key.clone(),
                block_value: value.to_string(),
                block_size: members.len(),
                max_allowed: max_block_size,
            });
            continue;
        }
        let n = members.len() as u64;
        pairs += n * (n - 1) / 2;
        blocks.push(members);
    }
    // Stable output order independent of hash iteration
    blocks.sort_unstable_by_key(|members| members[0]);
    skipped.sort_unstable_by(|a, b| a.block_value.cmp(&b.block_value));
    (blocks, skipped, pairs)
}

/// Score every canonical pair in one block, returning those at or above
/// the rule threshold. Members are ascending, so `(a, b)` is always the
/// `(min, max)` orientation and each pair is visited once.
fn score_block(
    rule: &FuzzyRule,
    members: &[u32],
    profiles: &[BTreeMap<String, String>],
) -> Vec<(u32, u32)> {
    let mut matched = Vec::new();
    for (i, &a) in members.iter().enumerate() {
        for &b in &members[i + 1..] {
            let score = rule.score.score(&profiles[a as usize], &profiles[b as usize]);
            if score >= rule.threshold {
                matched.push((a, b));
            }
        }
    }
    matched
}
