//! # State Store
//!
//! Durable state between runs: the edge graph, cluster memberships, the
//! post-exclusion identifier index, attributes, profiles, per-source
//! watermarks, and run history. Everything a FULL run rebuilds and an
//! INCR run reads back to expand its working set.
//!
//! [`StateStore`] is the contract; [`MemoryStore`] is the concrete
//! backend. Commits are scope-aware: a FULL run replaces state
//! wholesale, an INCR run replaces only rows inside its closed working
//! set. Both preserve first-seen bookkeeping across replaces.

use crate::edges::IdentifierGroup;
use crate::errors::{EngineError, Result};
use crate::model::{
    Attribute, ClusterRecord, DryRunReport, Edge, GoldenProfile, Membership, RunMode, RunState,
    RunStatus, RunSummary, SkippedGroup,
};
use hashbrown::HashMap;
use parking_lot::RwLock;
use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};
use std::fmt;
use time::{Duration, OffsetDateTime};
use tracing::{debug, warn};

/// Message recorded when a stale RUNNING entry is expired by a new run
pub const STALE_RUN_MESSAGE: &str = "Run interrupted - stale RUNNING state detected";

/// A persisted edge with run bookkeeping
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredEdge {
    pub edge: Edge,
    pub first_seen_run: String,
    pub last_seen_run: String,
}

/// Lifecycle status of a run history entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunRecordStatus {
    Running,
    Success,
    SuccessWithWarnings,
    Failed,
    Interrupted,
}

impl From<RunStatus> for RunRecordStatus {
    fn from(status: RunStatus) -> Self {
        match status {
            RunStatus::Success => RunRecordStatus::Success,
            RunStatus::SuccessWithWarnings => RunRecordStatus::SuccessWithWarnings,
            RunStatus::Failed => RunRecordStatus::Failed,
        }
    }
}

impl fmt::Display for RunRecordStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RunRecordStatus::Running => "RUNNING",
            RunRecordStatus::Success => "SUCCESS",
            RunRecordStatus::SuccessWithWarnings => "SUCCESS_WITH_WARNINGS",
            RunRecordStatus::Failed => "FAILED",
            RunRecordStatus::Interrupted => "INTERRUPTED",
        };
        write!(f, "{name}")
    }
}

/// One entry in the run history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: String,
    pub mode: RunMode,
    pub dry_run: bool,
    pub status: RunRecordStatus,
    pub started_at: OffsetDateTime,
    pub finished_at: Option<OffsetDateTime>,
    pub message: Option<String>,
    pub summary: Option<RunSummary>,
}

impl RunRecord {
    pub fn started(run_id: impl Into<String>, mode: RunMode, dry_run: bool) -> Self {
        Self {
            run_id: run_id.into(),
            mode,
            dry_run,
            status: RunRecordStatus::Running,
            started_at: OffsetDateTime::now_utc(),
            finished_at: None,
            message: None,
            summary: None,
        }
    }
}

/// Final cluster placement for one entity, as produced by a run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterAssignment {
    pub entity_key: String,
    pub resolved_id: String,
    pub super_cluster_id: Option<String>,
}

/// What part of the persisted graph a commit may rewrite
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitScope {
    /// Replace all graph state
    Full,
    /// Replace only rows inside the closed working set
    WorkingSet {
        entity_keys: Vec<String>,
        resolved_ids: Vec<String>,
    },
}

/// Everything one run wants made durable, committed atomically
#[derive(Debug, Clone)]
pub struct RunDelta {
    pub run_id: String,
    pub scope: CommitScope,
    pub edges: Vec<Edge>,
    pub identifier_groups: Vec<IdentifierGroup>,
    pub attributes: Vec<Attribute>,
    pub assignments: Vec<ClusterAssignment>,
    pub clusters: Vec<ClusterRecord>,
    pub profiles: Vec<GoldenProfile>,
    pub skipped: Vec<SkippedGroup>,
    pub run_states: Vec<RunState>,
}

/// Results parked by a dry run instead of a commit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreviewState {
    pub run_id: String,
    pub memberships: Vec<Membership>,
    pub clusters: Vec<ClusterRecord>,
    pub report: DryRunReport,
}

/// Persistence contract between the pipeline and its backend.
///
/// Implementations use interior mutability; every method takes `&self`
/// so the engine can hold the store behind `Box<dyn StateStore>`.
pub trait StateStore: Send + Sync {
    /// Register a starting run. Expires stale RUNNING entries, rejects a
    /// second concurrent live run.
    fn begin_run(&self, record: RunRecord, stale_after: Duration) -> Result<()>;

    /// Mark a run terminal with its summary.
    fn finish_run(&self, run_id: &str, summary: &RunSummary) -> Result<()>;

    fn run_history(&self) -> Result<Vec<RunRecord>>;

    /// Per-source watermark checkpoints.
    fn run_states(&self) -> Result<Vec<RunState>>;

    fn stored_edges(&self) -> Result<Vec<StoredEdge>>;

    fn memberships(&self) -> Result<Vec<Membership>>;

    /// Post-exclusion identifier index, singletons included.
    fn identifier_groups(&self) -> Result<Vec<IdentifierGroup>>;

    fn cluster_records(&self) -> Result<Vec<ClusterRecord>>;

    fn golden_profiles(&self) -> Result<Vec<GoldenProfile>>;

    fn skipped_groups(&self) -> Result<Vec<SkippedGroup>>;

    /// Attribute rows for the given entities.
    fn attributes_for(&self, entity_keys: &[String]) -> Result<Vec<Attribute>>;

    /// Apply one run's output atomically within its scope.
    fn commit(&self, delta: RunDelta) -> Result<()>;

    /// Park dry-run results on the preview surface.
    fn save_preview(&self, preview: PreviewState) -> Result<()>;

    fn preview(&self, run_id: &str) -> Result<Option<PreviewState>>;
}

type EdgeKey = (String, String, String);

fn edge_key(edge: &Edge) -> EdgeKey {
    (
        edge.left_entity_key.clone(),
        edge.right_entity_key.clone(),
        edge.identifier_type.clone(),
    )
}

fn group_key(group: &IdentifierGroup) -> (String, String) {
    (
        group.identifier_type.clone(),
        group.normalized_value.clone(),
    )
}

#[derive(Debug, Default)]
struct StoreInner {
    edges: HashMap<EdgeKey, StoredEdge>,
    memberships: HashMap<String, Membership>,
    identifier_groups: HashMap<(String, String), IdentifierGroup>,
    attributes: HashMap<String, Vec<Attribute>>,
    clusters: HashMap<String, ClusterRecord>,
    profiles: HashMap<String, GoldenProfile>,
    skipped: Vec<SkippedGroup>,
    run_states: HashMap<String, RunState>,
    runs: Vec<RunRecord>,
    previews: HashMap<String, PreviewState>,
}

/// In-memory [`StateStore`] backend
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: RwLock<StoreInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StateStore for MemoryStore {
    fn begin_run(&self, record: RunRecord, stale_after: Duration) -> Result<()> {
        let mut inner = self.inner.write();
        let now = OffsetDateTime::now_utc();
        for run in inner.runs.iter_mut() {
            if run.status != RunRecordStatus::Running {
                continue;
            }
            if now - run.started_at >= stale_after {
                warn!(run_id = %run.run_id, "expiring stale RUNNING entry");
                run.status = RunRecordStatus::Interrupted;
                run.finished_at = Some(now);
                run.message = Some(STALE_RUN_MESSAGE.to_string());
            } else if !record.dry_run && !run.dry_run {
                return Err(EngineError::ConcurrentRun(format!(
                    "run {} is already in progress",
                    run.run_id
                )));
            }
        }
        inner.runs.push(record);
        Ok(())
    }

    fn finish_run(&self, run_id: &str, summary: &RunSummary) -> Result<()> {
        let mut inner = self.inner.write();
        let Some(run) = inner.runs.iter_mut().rev().find(|r| r.run_id == run_id) else {
            return Err(EngineError::Internal(format!(
                "finish_run for unknown run {run_id}"
            )));
        };
        run.status = RunRecordStatus::from(summary.status);
        run.finished_at = Some(OffsetDateTime::now_utc());
        run.message = summary.error_message.clone();
        run.summary = Some(summary.clone());
        Ok(())
    }

    fn run_history(&self) -> Result<Vec<RunRecord>> {
        Ok(self.inner.read().runs.clone())
    }

    fn run_states(&self) -> Result<Vec<RunState>> {
        let mut states: Vec<RunState> = self.inner.read().run_states.values().cloned().collect();
        states.sort_unstable_by(|a, b| a.source_id.cmp(&b.source_id));
        Ok(states)
    }

    fn stored_edges(&self) -> Result<Vec<StoredEdge>> {
        let mut edges: Vec<StoredEdge> = self.inner.read().edges.values().cloned().collect();
        edges.sort_unstable_by(|a, b| a.edge.cmp(&b.edge));
        Ok(edges)
    }

    fn memberships(&self) -> Result<Vec<Membership>> {
        let mut rows: Vec<Membership> = self.inner.read().memberships.values().cloned().collect();
        rows.sort_unstable_by(|a, b| a.entity_key.cmp(&b.entity_key));
        Ok(rows)
    }

    fn identifier_groups(&self) -> Result<Vec<IdentifierGroup>> {
        let mut groups: Vec<IdentifierGroup> =
            self.inner.read().identifier_groups.values().cloned().collect();
        groups.sort_unstable_by(|a, b| {
            (&a.identifier_type, &a.normalized_value)
                .cmp(&(&b.identifier_type, &b.normalized_value))
        });
        Ok(groups)
    }

    fn cluster_records(&self) -> Result<Vec<ClusterRecord>> {
        let mut rows: Vec<ClusterRecord> = self.inner.read().clusters.values().cloned().collect();
        rows.sort_unstable_by(|a, b| a.resolved_id.cmp(&b.resolved_id));
        Ok(rows)
    }

    fn golden_profiles(&self) -> Result<Vec<GoldenProfile>> {
        let mut rows: Vec<GoldenProfile> = self.inner.read().profiles.values().cloned().collect();
        rows.sort_unstable_by(|a, b| a.resolved_id.cmp(&b.resolved_id));
        Ok(rows)
    }

    fn skipped_groups(&self) -> Result<Vec<SkippedGroup>> {
        Ok(self.inner.read().skipped.clone())
    }

    fn attributes_for(&self, entity_keys: &[String]) -> Result<Vec<Attribute>> {
        let inner = self.inner.read();
        let mut rows = Vec::new();
        for key in entity_keys {
            if let Some(attrs) = inner.attributes.get(key) {
                rows.extend(attrs.iter().cloned());
            }
        }
        rows.sort_unstable_by(|a, b| {
            (&a.entity_key, &a.name, &a.value).cmp(&(&b.entity_key, &b.name, &b.value))
        });
        Ok(rows)
    }

    fn commit(&self, delta: RunDelta) -> Result<()> {
        let mut inner = self.inner.write();
        match &delta.scope {
            CommitScope::Full => {
                let old_edges = std::mem::take(&mut inner.edges);
                inner.edges = delta
                    .edges
                    .iter()
                    .map(|edge| {
                        let key = edge_key(edge);
                        let first_seen = old_edges
                            .get(&key)
                            .map(|e| e.first_seen_run.clone())
                            .unwrap_or_else(|| delta.run_id.clone());
                        (
                            key,
                            StoredEdge {
                                edge: edge.clone(),
                                first_seen_run: first_seen,
                                last_seen_run: delta.run_id.clone(),
                            },
                        )
                    })
                    .collect();

                let old_memberships = std::mem::take(&mut inner.memberships);
                inner.memberships = delta
                    .assignments
                    .iter()
                    .map(|a| {
                        let first_seen = old_memberships
                            .get(&a.entity_key)
                            .map(|m| m.first_seen_run.clone())
                            .unwrap_or_else(|| delta.run_id.clone());
                        (
                            a.entity_key.clone(),
                            Membership {
                                entity_key: a.entity_key.clone(),
                                resolved_id: a.resolved_id.clone(),
                                super_cluster_id: a.super_cluster_id.clone(),
                                first_seen_run: first_seen,
                                last_seen_run: delta.run_id.clone(),
                            },
                        )
                    })
                    .collect();

                inner.identifier_groups = delta
                    .identifier_groups
                    .iter()
                    .map(|g| (group_key(g), g.clone()))
                    .collect();

                inner.attributes.clear();
                for attr in &delta.attributes {
                    inner
                        .attributes
                        .entry(attr.entity_key.clone())
                        .or_default()
                        .push(attr.clone());
                }

                inner.clusters = delta
                    .clusters
                    .iter()
                    .map(|c| (c.resolved_id.clone(), c.clone()))
                    .collect();
                inner.profiles = delta
                    .profiles
                    .iter()
                    .map(|p| (p.resolved_id.clone(), p.clone()))
                    .collect();
                inner.skipped = delta.skipped.clone();
            }
            CommitScope::WorkingSet {
                entity_keys,
                resolved_ids,
            } => {
                let keys: FxHashSet<&str> = entity_keys.iter().map(String::as_str).collect();

                // Pull scoped edges aside so re-inserted ones keep their
                // first-seen run.
                let mut kept = HashMap::new();
                let mut stashed: HashMap<EdgeKey, StoredEdge> = HashMap::new();
                for (key, stored) in inner.edges.drain() {
                    let in_scope = keys.contains(stored.edge.left_entity_key.as_str())
                        || keys.contains(stored.edge.right_entity_key.as_str());
                    if in_scope {
                        stashed.insert(key, stored);
                    } else {
                        kept.insert(key, stored);
                    }
                }
                inner.edges = kept;
                for edge in &delta.edges {
                    let key = edge_key(edge);
                    let first_seen = stashed
                        .get(&key)
                        .or_else(|| inner.edges.get(&key))
                        .map(|e| e.first_seen_run.clone())
                        .unwrap_or_else(|| delta.run_id.clone());
                    inner.edges.insert(
                        key,
                        StoredEdge {
                            edge: edge.clone(),
                            first_seen_run: first_seen,
                            last_seen_run: delta.run_id.clone(),
                        },
                    );
                }

                for a in &delta.assignments {
                    let first_seen = inner
                        .memberships
                        .get(&a.entity_key)
                        .map(|m| m.first_seen_run.clone())
                        .unwrap_or_else(|| delta.run_id.clone());
                    inner.memberships.insert(
                        a.entity_key.clone(),
                        Membership {
                            entity_key: a.entity_key.clone(),
                            resolved_id: a.resolved_id.clone(),
                            super_cluster_id: a.super_cluster_id.clone(),
                            first_seen_run: first_seen,
                            last_seen_run: delta.run_id.clone(),
                        },
                    );
                }

                // The working set is closed over identifier groups, so any
                // group intersecting it lies wholly inside and empties out.
                // Those groups were rebuilt this run; their old audit rows
                // are superseded by the delta's.
                let rebuilt_values: FxHashSet<(String, String)> = inner
                    .identifier_groups
                    .values()
                    .filter(|group| group.entity_keys.iter().any(|k| keys.contains(k.as_str())))
                    .map(|group| {
                        (
                            group.identifier_type.clone(),
                            group.normalized_value.clone(),
                        )
                    })
                    .collect();
                inner.identifier_groups.retain(|_, group| {
                    group.entity_keys.retain(|k| !keys.contains(k.as_str()));
                    !group.entity_keys.is_empty()
                });
                for group in &delta.identifier_groups {
                    inner.identifier_groups.insert(group_key(group), group.clone());
                }

                for key in entity_keys {
                    inner.attributes.remove(key);
                }
                for attr in &delta.attributes {
                    inner
                        .attributes
                        .entry(attr.entity_key.clone())
                        .or_default()
                        .push(attr.clone());
                }

                for resolved_id in resolved_ids {
                    inner.clusters.remove(resolved_id);
                    inner.profiles.remove(resolved_id);
                }
                for cluster in &delta.clusters {
                    inner.clusters.insert(cluster.resolved_id.clone(), cluster.clone());
                }
                for profile in &delta.profiles {
                    inner.profiles.insert(profile.resolved_id.clone(), profile.clone());
                }
                inner.skipped.retain(|row| {
                    !rebuilt_values
                        .contains(&(row.identifier_type.clone(), row.normalized_value.clone()))
                });
                inner.skipped.extend(delta.skipped.iter().cloned());
            }
        }

        for state in &delta.run_states {
            inner.run_states.insert(state.source_id.clone(), state.clone());
        }
        debug!(
            run_id = %delta.run_id,
            edges = delta.edges.len(),
            assignments = delta.assignments.len(),
            "commit applied"
        );
        Ok(())
    }

    fn save_preview(&self, preview: PreviewState) -> Result<()> {
        self.inner
            .write()
            .previews
            .insert(preview.run_id.clone(), preview);
        Ok(())
    }

    fn preview(&self, run_id: &str) -> Result<Option<PreviewState>> {
        Ok(self.inner.read().previews.get(run_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{RunMode, SKIP_REASON_GROUP_SIZE};
    use std::time::Duration as StdDuration;

    fn summary(run_id: &str, status: RunStatus) -> RunSummary {
        RunSummary {
            run_id: run_id.to_string(),
            mode: RunMode::Full,
            dry_run: false,
            status,
            entities_processed: 0,
            identifiers_extracted: 0,
            edges_created: 0,
            clusters_impacted: 0,
            lp_iterations: 1,
            groups_skipped: 0,
            values_excluded: 0,
            large_clusters: 0,
            no_changes: false,
            warnings: Vec::new(),
            error_message: None,
            error_stage: None,
            stage_metrics: Vec::new(),
            config_digest: String::new(),
            duration: StdDuration::from_millis(1),
        }
    }

    fn delta(run_id: &str, scope: CommitScope) -> RunDelta {
        RunDelta {
            run_id: run_id.to_string(),
            scope,
            edges: Vec::new(),
            identifier_groups: Vec::new(),
            attributes: Vec::new(),
            assignments: Vec::new(),
            clusters: Vec::new(),
            profiles: Vec::new(),
            skipped: Vec::new(),
            run_states: Vec::new(),
        }
    }

    fn email_edge(a: &str, b: &str) -> Edge {
        Edge::between(a, b, "email", "x@example.com", "r1")
    }

    fn shared_group(members: &[&str]) -> IdentifierGroup {
        IdentifierGroup {
            identifier_type: "id9".to_string(),
            normalized_value: "shared".to_string(),
            rule_id: "r1".to_string(),
            is_hashed: false,
            entity_keys: members.iter().map(|m| m.to_string()).collect(),
        }
    }

    fn skip_row(size: usize) -> SkippedGroup {
        SkippedGroup {
            identifier_type: "id9".to_string(),
            normalized_value: "shared".to_string(),
            group_size: size,
            max_allowed: 2,
            sample_keys: Vec::new(),
            reason: SKIP_REASON_GROUP_SIZE.to_string(),
        }
    }

    #[test]
    fn test_full_commit_replaces_and_preserves_first_seen() {
        let store = MemoryStore::new();
        let mut first = delta("run_1", CommitScope::Full);
        first.edges = vec![email_edge("a", "b"), email_edge("b", "c")];
        store.commit(first).unwrap();

        // Second FULL keeps a-b, drops b-c, adds a-d
        let mut second = delta("run_2", CommitScope::Full);
        second.edges = vec![email_edge("a", "b"), email_edge("a", "d")];
        store.commit(second).unwrap();

        let edges = store.stored_edges().unwrap();
        assert_eq!(edges.len(), 2);
        assert_eq!(edges[0].edge.right_entity_key, "b");
        assert_eq!(edges[0].first_seen_run, "run_1");
        assert_eq!(edges[0].last_seen_run, "run_2");
        assert_eq!(edges[1].edge.right_entity_key, "d");
        assert_eq!(edges[1].first_seen_run, "run_2");
    }

    #[test]
    fn test_working_set_commit_leaves_outside_rows_alone() {
        let store = MemoryStore::new();
        let mut full = delta("run_1", CommitScope::Full);
        full.edges = vec![email_edge("a", "b"), email_edge("x", "y")];
        full.assignments = vec![
            ClusterAssignment {
                entity_key: "a".to_string(),
                resolved_id: "a".to_string(),
                super_cluster_id: None,
            },
            ClusterAssignment {
                entity_key: "x".to_string(),
                resolved_id: "x".to_string(),
                super_cluster_id: None,
            },
        ];
        store.commit(full).unwrap();

        let mut incr = delta(
            "run_2",
            CommitScope::WorkingSet {
                entity_keys: vec!["a".to_string(), "b".to_string(), "c".to_string()],
                resolved_ids: vec!["a".to_string()],
            },
        );
        incr.edges = vec![email_edge("a", "c")];
        incr.assignments = vec![ClusterAssignment {
            entity_key: "a".to_string(),
            resolved_id: "a".to_string(),
            super_cluster_id: None,
        }];
        store.commit(incr).unwrap();

        let edges = store.stored_edges().unwrap();
        assert_eq!(edges.len(), 2);
        // a-b replaced by a-c; x-y untouched
        assert!(edges.iter().any(|e| e.edge.right_entity_key == "c"));
        assert!(edges.iter().any(|e| e.edge.left_entity_key == "x"));
        assert!(!edges.iter().any(|e| e.edge.right_entity_key == "b"));

        let memberships = store.memberships().unwrap();
        let a_row = memberships.iter().find(|m| m.entity_key == "a").unwrap();
        assert_eq!(a_row.first_seen_run, "run_1");
        assert_eq!(a_row.last_seen_run, "run_2");
        let x_row = memberships.iter().find(|m| m.entity_key == "x").unwrap();
        assert_eq!(x_row.last_seen_run, "run_1");
    }

    #[test]
    fn test_identifier_groups_merge_in_working_set() {
        let store = MemoryStore::new();
        let mut full = delta("run_1", CommitScope::Full);
        full.identifier_groups = vec![
            IdentifierGroup {
                identifier_type: "email".to_string(),
                normalized_value: "a@x.com".to_string(),
                rule_id: "r1".to_string(),
                is_hashed: false,
                entity_keys: vec!["e1".to_string(), "e2".to_string()],
            },
            IdentifierGroup {
                identifier_type: "phone".to_string(),
                normalized_value: "555".to_string(),
                rule_id: "r2".to_string(),
                is_hashed: false,
                entity_keys: vec!["e9".to_string()],
            },
        ];
        store.commit(full).unwrap();

        let mut incr = delta(
            "run_2",
            CommitScope::WorkingSet {
                entity_keys: vec!["e1".to_string(), "e2".to_string(), "e3".to_string()],
                resolved_ids: Vec::new(),
            },
        );
        incr.identifier_groups = vec![IdentifierGroup {
            identifier_type: "email".to_string(),
            normalized_value: "b@x.com".to_string(),
            rule_id: "r1".to_string(),
            is_hashed: false,
            entity_keys: vec!["e2".to_string(), "e3".to_string()],
        }];
        store.commit(incr).unwrap();

        let groups = store.identifier_groups().unwrap();
        assert_eq!(groups.len(), 2);
        // Old email group emptied out and dropped; phone group untouched
        assert_eq!(groups[0].normalized_value, "b@x.com");
        assert_eq!(groups[0].entity_keys, vec!["e2", "e3"]);
        assert_eq!(groups[1].identifier_type, "phone");
    }

    #[test]
    fn test_working_set_commit_replaces_scoped_skip_rows() {
        let store = MemoryStore::new();
        let mut full = delta("run_1", CommitScope::Full);
        full.identifier_groups = vec![shared_group(&["e1", "e2", "e3"])];
        full.skipped = vec![skip_row(3)];
        store.commit(full).unwrap();

        // Rebuilt and still over cap: the fresh audit row replaces the old
        // one instead of piling up next to it.
        let scope = CommitScope::WorkingSet {
            entity_keys: vec![
                "e1".to_string(),
                "e2".to_string(),
                "e3".to_string(),
                "e4".to_string(),
            ],
            resolved_ids: Vec::new(),
        };
        let mut grew = delta("run_2", scope.clone());
        grew.identifier_groups = vec![shared_group(&["e1", "e2", "e3", "e4"])];
        grew.skipped = vec![skip_row(4)];
        store.commit(grew).unwrap();

        let skipped = store.skipped_groups().unwrap();
        assert_eq!(skipped.len(), 1);
        assert_eq!(skipped[0].group_size, 4);

        // Rebuilt below the cap: no audit row survives.
        let mut shrank = delta("run_3", scope);
        shrank.identifier_groups = vec![shared_group(&["e1", "e2"])];
        store.commit(shrank).unwrap();
        assert!(store.skipped_groups().unwrap().is_empty());
    }

    #[test]
    fn test_begin_run_rejects_concurrent_live_run() {
        let store = MemoryStore::new();
        let stale_after = Duration::hours(4);
        store
            .begin_run(RunRecord::started("run_1", RunMode::Full, false), stale_after)
            .unwrap();

        let err = store
            .begin_run(RunRecord::started("run_2", RunMode::Incr, false), stale_after)
            .unwrap_err();
        assert!(matches!(err, EngineError::ConcurrentRun(_)));

        // Dry runs may run alongside a live run
        store
            .begin_run(RunRecord::started("dry_3", RunMode::Full, true), stale_after)
            .unwrap();
    }

    #[test]
    fn test_begin_run_expires_stale_running_entry() {
        let store = MemoryStore::new();
        let mut stale = RunRecord::started("run_old", RunMode::Full, false);
        stale.started_at = OffsetDateTime::now_utc() - Duration::hours(5);
        store.begin_run(stale, Duration::hours(4)).unwrap();

        store
            .begin_run(
                RunRecord::started("run_new", RunMode::Full, false),
                Duration::hours(4),
            )
            .unwrap();

        let history = store.run_history().unwrap();
        let old = history.iter().find(|r| r.run_id == "run_old").unwrap();
        assert_eq!(old.status, RunRecordStatus::Interrupted);
        assert_eq!(old.message.as_deref(), Some(STALE_RUN_MESSAGE));
    }

    #[test]
    fn test_finish_run_records_terminal_status() {
        let store = MemoryStore::new();
        store
            .begin_run(
                RunRecord::started("run_1", RunMode::Full, false),
                Duration::hours(4),
            )
            .unwrap();
        store
            .finish_run("run_1", &summary("run_1", RunStatus::SuccessWithWarnings))
            .unwrap();

        let history = store.run_history().unwrap();
        assert_eq!(history[0].status, RunRecordStatus::SuccessWithWarnings);
        assert!(history[0].finished_at.is_some());
        assert!(history[0].summary.is_some());
    }

    #[test]
    fn test_preview_surface_is_isolated() {
        let store = MemoryStore::new();
        store
            .save_preview(PreviewState {
                run_id: "dry_1".to_string(),
                memberships: vec![Membership {
                    entity_key: "e1".to_string(),
                    resolved_id: "e1".to_string(),
                    super_cluster_id: None,
                    first_seen_run: "dry_1".to_string(),
                    last_seen_run: "dry_1".to_string(),
                }],
                clusters: Vec::new(),
                report: DryRunReport {
                    new_entities: 1,
                    moved_entities: 0,
                    unchanged_entities: 0,
                    merged_clusters: 0,
                    largest_cluster_id: Some("e1".to_string()),
                    largest_cluster_size: 1,
                    total_entities: 1,
                },
            })
            .unwrap();

        assert!(store.memberships().unwrap().is_empty());
        let preview = store.preview("dry_1").unwrap().unwrap();
        assert_eq!(preview.report.new_entities, 1);
        assert!(store.preview("dry_2").unwrap().is_none());
    }

    #[test]
    fn test_run_states_upsert_per_source() {
        let store = MemoryStore::new();
        let mut first = delta("run_1", CommitScope::Full);
        first.run_states = vec![RunState {
            source_id: "crm".to_string(),
            last_watermark: 100,
            updated_by_run: "run_1".to_string(),
        }];
        store.commit(first).unwrap();

        let mut second = delta(
            "run_2",
            CommitScope::WorkingSet {
                entity_keys: Vec::new(),
                resolved_ids: Vec::new(),
            },
        );
        second.run_states = vec![
            RunState {
                source_id: "crm".to_string(),
                last_watermark: 250,
                updated_by_run: "run_2".to_string(),
            },
            RunState {
                source_id: "web".to_string(),
                last_watermark: 80,
                updated_by_run: "run_2".to_string(),
            },
        ];
        store.commit(second).unwrap();

        let states = store.run_states().unwrap();
        assert_eq!(states.len(), 2);
        assert_eq!(states[0].source_id, "crm");
        assert_eq!(states[0].last_watermark, 250);
        assert_eq!(states[1].source_id, "web");
    }
}
