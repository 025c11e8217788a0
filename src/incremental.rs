//! # Incremental State Manager
//!
//! Scopes an INCR run to the part of the graph a delta can actually
//! change, so unrelated clusters are never recomputed or rewritten.
//!
//! ```text
//!   delta entities ──> identifier value hits ──> persisted group members
//!         │                                              │
//!         └──────────────┬───────────────────────────────┘
//!                        v
//!            closure over persisted edges,
//!            group co-members, co-cluster members
//!                        v
//!                  working set + impacted clusters
//! ```
//!
//! The closure runs to a fixed point: pulling in a neighbor can expose
//! more neighbors, and a relabel must cascade to every member of every
//! merging cluster. Identifiers for old working-set members come back
//! out of the persisted identifier index, so the scoped rebuild sees
//! the same evidence a FULL run would.

use std::collections::VecDeque;

use rustc_hash::{FxHashMap, FxHashSet};
use tracing::debug;

use crate::edges::IdentifierGroup;
use crate::model::{DryRunReport, Entity, Identifier, Membership, RunState};
use crate::rules::RuleSet;
use crate::store::{ClusterAssignment, StoredEdge};

/// The closed scope of one INCR run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkingSet {
    /// Sorted member keys
    pub entity_keys: Vec<String>,
    /// Prior clusters with at least one member in the set, sorted
    pub resolved_ids: Vec<String>,
}

impl WorkingSet {
    pub fn len(&self) -> usize {
        self.entity_keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entity_keys.is_empty()
    }

    pub fn key_set(&self) -> FxHashSet<String> {
        self.entity_keys.iter().cloned().collect()
    }
}

/// Select the entities an INCR run must re-read: everything at or above
/// the per-source watermark checkpoint, minus the lookback window.
/// Sources without a checkpoint are wholly new and selected in full.
pub fn select_delta<'a>(
    entities: &'a [Entity],
    states: &[RunState],
    lookback_minutes: i64,
) -> Vec<&'a Entity> {
    let checkpoints: FxHashMap<&str, i64> = states
        .iter()
        .map(|s| (s.source_id.as_str(), s.last_watermark))
        .collect();
    entities
        .iter()
        .filter(|e| match checkpoints.get(e.source_id.as_str()) {
            Some(last) => e.watermark >= last - lookback_minutes * 60,
            None => true,
        })
        .collect()
}

/// Canonical `(type, value)` lookup keys for a batch of identifiers,
/// normalized exactly the way the edge builder normalizes them so they
/// line up with the persisted identifier index.
pub fn normalized_value_keys(
    rules: &RuleSet,
    identifiers: &[Identifier],
) -> FxHashSet<(String, String)> {
    let mut keys = FxHashSet::default();
    for identifier in identifiers {
        let Some(rule) = rules.exact_rule_for_type(&identifier.identifier_type) else {
            continue;
        };
        let trimmed = identifier.normalized_value.trim();
        if trimmed.is_empty() {
            continue;
        }
        let value = rule.canonicalize.apply(trimmed);
        keys.insert((identifier.identifier_type.clone(), value.into_owned()));
    }
    keys
}

/// Expands a delta seed into the closed working set using the persisted
/// graph. Borrowed views are indexed once and reused across lookups.
pub struct Expander<'a> {
    groups: &'a [IdentifierGroup],
    member_groups: FxHashMap<&'a str, Vec<usize>>,
    adjacency: FxHashMap<&'a str, Vec<&'a str>>,
    cluster_of: FxHashMap<&'a str, &'a str>,
    cluster_members: FxHashMap<&'a str, Vec<&'a str>>,
}

impl<'a> Expander<'a> {
    pub fn new(
        groups: &'a [IdentifierGroup],
        edges: &'a [StoredEdge],
        memberships: &'a [Membership],
    ) -> Self {
        let mut member_groups: FxHashMap<&str, Vec<usize>> = FxHashMap::default();
        for (idx, group) in groups.iter().enumerate() {
            for key in &group.entity_keys {
                member_groups.entry(key.as_str()).or_default().push(idx);
            }
        }

        let mut adjacency: FxHashMap<&str, Vec<&str>> = FxHashMap::default();
        for stored in edges {
            let left = stored.edge.left_entity_key.as_str();
            let right = stored.edge.right_entity_key.as_str();
            adjacency.entry(left).or_default().push(right);
            adjacency.entry(right).or_default().push(left);
        }

        let mut cluster_of: FxHashMap<&str, &str> = FxHashMap::default();
        let mut cluster_members: FxHashMap<&str, Vec<&str>> = FxHashMap::default();
        for membership in memberships {
            cluster_of.insert(membership.entity_key.as_str(), membership.resolved_id.as_str());
            cluster_members
                .entry(membership.resolved_id.as_str())
                .or_default()
                .push(membership.entity_key.as_str());
        }

        Self {
            groups,
            member_groups,
            adjacency,
            cluster_of,
            cluster_members,
        }
    }

    /// Close the seed set over identifier hits, persisted edges, group
    /// co-membership and co-cluster membership.
    pub fn expand(
        &self,
        seeds: impl IntoIterator<Item = String>,
        value_keys: &FxHashSet<(String, String)>,
    ) -> WorkingSet {
        let mut members: FxHashSet<String> = FxHashSet::default();
        let mut queue: VecDeque<String> = VecDeque::new();
        let enqueue = |key: &str, members: &mut FxHashSet<String>, queue: &mut VecDeque<String>| {
            if members.insert(key.to_string()) {
                queue.push_back(key.to_string());
            }
        };

        for seed in seeds {
            if members.insert(seed.clone()) {
                queue.push_back(seed);
            }
        }

        // A delta identifier that matches a persisted value pulls in the
        // whole stored group, previously-singleton members included.
        let hits: FxHashSet<(&str, &str)> = value_keys
            .iter()
            .map(|(t, v)| (t.as_str(), v.as_str()))
            .collect();
        for group in self.groups {
            if hits.contains(&(
                group.identifier_type.as_str(),
                group.normalized_value.as_str(),
            )) {
                for key in &group.entity_keys {
                    enqueue(key, &mut members, &mut queue);
                }
            }
        }

        while let Some(key) = queue.pop_front() {
            if let Some(neighbors) = self.adjacency.get(key.as_str()) {
                for neighbor in neighbors {
                    enqueue(neighbor, &mut members, &mut queue);
                }
            }
            if let Some(group_ids) = self.member_groups.get(key.as_str()) {
                for idx in group_ids {
                    for member in &self.groups[*idx].entity_keys {
                        enqueue(member, &mut members, &mut queue);
                    }
                }
            }
            if let Some(resolved_id) = self.cluster_of.get(key.as_str()) {
                if let Some(cluster) = self.cluster_members.get(resolved_id) {
                    for member in cluster {
                        enqueue(member, &mut members, &mut queue);
                    }
                }
            }
        }

        let mut resolved_ids: Vec<String> = members
            .iter()
            .filter_map(|key| self.cluster_of.get(key.as_str()).map(|id| id.to_string()))
            .collect();
        resolved_ids.sort_unstable();
        resolved_ids.dedup();

        let mut entity_keys: Vec<String> = members.into_iter().collect();
        entity_keys.sort_unstable();

        debug!(
            members = entity_keys.len(),
            impacted_clusters = resolved_ids.len(),
            "working set closed"
        );
        WorkingSet {
            entity_keys,
            resolved_ids,
        }
    }
}

/// Evidence for the scoped rebuild: fresh rows for delta entities plus
/// rows re-synthesized from the persisted index for everyone else in
/// the working set. Delta rows supersede the index for their entities.
pub fn merge_identifiers(
    identifiers: &[Identifier],
    delta_keys: &FxHashSet<String>,
    groups: &[IdentifierGroup],
    working_set: &FxHashSet<String>,
) -> Vec<Identifier> {
    let mut merged: Vec<Identifier> = identifiers
        .iter()
        .filter(|i| delta_keys.contains(&i.entity_key))
        .cloned()
        .collect();

    for group in groups {
        for member in &group.entity_keys {
            if working_set.contains(member) && !delta_keys.contains(member) {
                merged.push(Identifier {
                    entity_key: member.clone(),
                    identifier_type: group.identifier_type.clone(),
                    normalized_value: group.normalized_value.clone(),
                    rule_id: group.rule_id.clone(),
                    is_hashed: group.is_hashed,
                });
            }
        }
    }

    merged.sort_unstable_by(|a, b| {
        (&a.entity_key, &a.identifier_type, &a.normalized_value).cmp(&(
            &b.entity_key,
            &b.identifier_type,
            &b.normalized_value,
        ))
    });
    merged
}

/// Classify the next assignment against prior memberships for a
/// preview. A merged cluster is a next cluster holding members of two
/// or more distinct prior clusters.
pub fn diff_assignments(prior: &[Membership], next: &[ClusterAssignment]) -> DryRunReport {
    let prior_of: FxHashMap<&str, &str> = prior
        .iter()
        .map(|m| (m.entity_key.as_str(), m.resolved_id.as_str()))
        .collect();

    let mut new_entities = 0u64;
    let mut moved_entities = 0u64;
    let mut unchanged_entities = 0u64;
    let mut next_clusters: FxHashMap<&str, (u64, FxHashSet<&str>)> = FxHashMap::default();

    for assignment in next {
        let slot = next_clusters
            .entry(assignment.resolved_id.as_str())
            .or_default();
        slot.0 += 1;
        match prior_of.get(assignment.entity_key.as_str()) {
            None => new_entities += 1,
            Some(prior_id) => {
                slot.1.insert(*prior_id);
                if *prior_id == assignment.resolved_id {
                    unchanged_entities += 1;
                } else {
                    moved_entities += 1;
                }
            }
        }
    }

    let merged_clusters = next_clusters
        .values()
        .filter(|(_, prior_ids)| prior_ids.len() >= 2)
        .count() as u64;

    let mut largest_cluster_id: Option<String> = None;
    let mut largest_cluster_size = 0u64;
    for (id, (size, _)) in &next_clusters {
        let better = *size > largest_cluster_size
            || (*size == largest_cluster_size
                && largest_cluster_id.as_deref().map_or(true, |cur| *id < cur));
        if better {
            largest_cluster_size = *size;
            largest_cluster_id = Some(id.to_string());
        }
    }

    DryRunReport {
        new_entities,
        moved_entities,
        unchanged_entities,
        merged_clusters,
        largest_cluster_id,
        largest_cluster_size,
        total_entities: next.len() as u64,
    }
}

/// New per-source checkpoints after a successful commit. Watermarks are
/// monotonic: a lookback re-read never rewinds a checkpoint.
pub fn advance_run_states<'a>(
    prior: &[RunState],
    entities: impl IntoIterator<Item = &'a Entity>,
    run_id: &str,
) -> Vec<RunState> {
    let checkpoints: FxHashMap<&str, i64> = prior
        .iter()
        .map(|s| (s.source_id.as_str(), s.last_watermark))
        .collect();

    let mut seen: FxHashMap<&str, i64> = FxHashMap::default();
    for entity in entities {
        let slot = seen.entry(entity.source_id.as_str()).or_insert(i64::MIN);
        *slot = (*slot).max(entity.watermark);
    }

    let mut states: Vec<RunState> = seen
        .into_iter()
        .map(|(source_id, max_watermark)| {
            let last = checkpoints
                .get(source_id)
                .copied()
                .unwrap_or(i64::MIN)
                .max(max_watermark);
            RunState {
                source_id: source_id.to_string(),
                last_watermark: last,
                updated_by_run: run_id.to_string(),
            }
        })
        .collect();
    states.sort_unstable_by(|a, b| a.source_id.cmp(&b.source_id));
    states
}
