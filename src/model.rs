//! # Data Model
//!
//! Core records flowing through the resolution pipeline: entities, identifier
//! evidence, compressed edges, cluster outputs, and run bookkeeping.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use rustc_hash::FxHashMap;

/// Compact identifier for entities inside one resolution pass
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityId(pub u32);

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "N{}", self.0)
    }
}

/// One source record being resolved.
///
/// `entity_key` is globally unique, typically `source_id:source_key`. The
/// watermark drives incremental selection and recency survivorship.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entity {
    pub entity_key: String,
    pub source_id: String,
    pub watermark: i64,
}

impl Entity {
    pub fn new(entity_key: impl Into<String>, source_id: impl Into<String>, watermark: i64) -> Self {
        Self {
            entity_key: entity_key.into(),
            source_id: source_id.into(),
            watermark,
        }
    }
}

/// Typed, normalized evidence attached to an entity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identifier {
    pub entity_key: String,
    pub identifier_type: String,
    pub normalized_value: String,
    pub rule_id: String,
    pub is_hashed: bool,
}

impl Identifier {
    pub fn new(
        entity_key: impl Into<String>,
        identifier_type: impl Into<String>,
        normalized_value: impl Into<String>,
        rule_id: impl Into<String>,
    ) -> Self {
        Self {
            entity_key: entity_key.into(),
            identifier_type: identifier_type.into(),
            normalized_value: normalized_value.into(),
            rule_id: rule_id.into(),
            is_hashed: false,
        }
    }

    pub fn hashed(mut self) -> Self {
        self.is_hashed = true;
        self
    }
}

/// A per-entity attribute observation used for survivorship
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attribute {
    pub entity_key: String,
    pub name: String,
    pub value: String,
    pub watermark: i64,
    pub source_id: String,
}

impl Attribute {
    pub fn new(
        entity_key: impl Into<String>,
        name: impl Into<String>,
        value: impl Into<String>,
        watermark: i64,
        source_id: impl Into<String>,
    ) -> Self {
        Self {
            entity_key: entity_key.into(),
            name: name.into(),
            value: value.into(),
            watermark,
            source_id: source_id.into(),
        }
    }
}

/// A compressed link between two entities sharing an identifier value.
///
/// Canonical orientation: `left_entity_key < right_entity_key`, enforced by
/// [`Edge::between`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Edge {
    pub left_entity_key: String,
    pub right_entity_key: String,
    pub identifier_type: String,
    pub normalized_value: String,
    pub rule_id: String,
    pub is_hashed: bool,
}

impl Edge {
    /// Build an edge with canonical orientation regardless of argument order.
    pub fn between(
        a: impl Into<String>,
        b: impl Into<String>,
        identifier_type: impl Into<String>,
        normalized_value: impl Into<String>,
        rule_id: impl Into<String>,
    ) -> Self {
        let a = a.into();
        let b = b.into();
        let (left, right) = if a <= b { (a, b) } else { (b, a) };
        Self {
            left_entity_key: left,
            right_entity_key: right,
            identifier_type: identifier_type.into(),
            normalized_value: normalized_value.into(),
            rule_id: rule_id.into(),
            is_hashed: false,
        }
    }

    pub fn with_hashed(mut self, is_hashed: bool) -> Self {
        self.is_hashed = is_hashed;
        self
    }

    /// Dedup key: undirected pair plus identifier type.
    pub fn typed_pair(&self) -> (&str, &str, &str) {
        (
            self.left_entity_key.as_str(),
            self.right_entity_key.as_str(),
            self.identifier_type.as_str(),
        )
    }
}

impl fmt::Display for Edge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} <-> {} [{}]",
            self.left_entity_key, self.right_entity_key, self.identifier_type
        )
    }
}

/// Reason string recorded on every skipped identifier group
pub const SKIP_REASON_GROUP_SIZE: &str = "EXCEEDED_MAX_GROUP_SIZE";

/// Audit row for an identifier-value group that exceeded its rule's size cap
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkippedGroup {
    pub identifier_type: String,
    pub normalized_value: String,
    pub group_size: usize,
    pub max_allowed: usize,
    /// Bounded sample of affected entity keys, lexicographically first
    pub sample_keys: Vec<String>,
    pub reason: String,
}

/// Durable membership row: entity to cluster (and optional super-cluster)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Membership {
    pub entity_key: String,
    pub resolved_id: String,
    pub super_cluster_id: Option<String>,
    pub first_seen_run: String,
    pub last_seen_run: String,
}

/// Scored cluster output row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterRecord {
    pub resolved_id: String,
    /// Equal to `resolved_id` when no fuzzy merge applied
    pub super_cluster_id: String,
    pub member_count: usize,
    pub internal_edge_count: usize,
    pub edge_diversity: usize,
    pub match_density: f64,
    pub confidence_score: f64,
    pub primary_reason: String,
}

/// One consolidated profile per cluster, attribute name to survivor value
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GoldenProfile {
    pub resolved_id: String,
    pub values: BTreeMap<String, String>,
}

/// Per-source watermark checkpoint for delta selection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunState {
    pub source_id: String,
    pub last_watermark: i64,
    pub updated_by_run: String,
}

/// Pipeline execution mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RunMode {
    Full,
    Incr,
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunMode::Full => write!(f, "FULL"),
            RunMode::Incr => write!(f, "INCR"),
        }
    }
}

impl FromStr for RunMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "FULL" => Ok(RunMode::Full),
            "INCR" | "INCREMENTAL" => Ok(RunMode::Incr),
            other => Err(format!("invalid run mode: {other}")),
        }
    }
}

/// Terminal status of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Success,
    SuccessWithWarnings,
    Failed,
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunStatus::Success => write!(f, "SUCCESS"),
            RunStatus::SuccessWithWarnings => write!(f, "SUCCESS_WITH_WARNINGS"),
            RunStatus::Failed => write!(f, "FAILED"),
        }
    }
}

/// Pipeline stages, in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Preflight,
    Exclusion,
    Edges,
    Resolve,
    Fuzzy,
    Confidence,
    Golden,
    Commit,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Preflight => "preflight",
            Stage::Exclusion => "exclusion",
            Stage::Edges => "edges",
            Stage::Resolve => "resolve",
            Stage::Fuzzy => "fuzzy",
            Stage::Confidence => "confidence",
            Stage::Golden => "golden",
            Stage::Commit => "commit",
        };
        write!(f, "{name}")
    }
}

/// Non-fatal condition categories surfaced through the run summary
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WarningKind {
    Convergence,
    HubOverflow,
    DataQuality,
    LargeCluster,
    FuzzySkipped,
    NoActiveRules,
    OversizedBlock,
}

/// A non-fatal condition accumulated during a run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Warning {
    pub kind: WarningKind,
    pub message: String,
}

impl Warning {
    pub fn new(kind: WarningKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for Warning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

/// Timing and row count for one pipeline stage
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageMetric {
    pub stage: Stage,
    pub rows: u64,
    pub duration: Duration,
}

/// Everything a caller needs to know about one run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: String,
    pub mode: RunMode,
    pub dry_run: bool,
    pub status: RunStatus,
    pub entities_processed: u64,
    pub identifiers_extracted: u64,
    pub edges_created: u64,
    pub clusters_impacted: u64,
    /// Relaxation passes executed; 1 for the union-find strategy
    pub lp_iterations: u32,
    pub groups_skipped: u64,
    pub values_excluded: u64,
    pub large_clusters: u64,
    /// True when the run saw zero entities and left state untouched
    pub no_changes: bool,
    pub warnings: Vec<Warning>,
    pub error_message: Option<String>,
    pub error_stage: Option<Stage>,
    pub stage_metrics: Vec<StageMetric>,
    pub config_digest: String,
    pub duration: Duration,
}

impl RunSummary {
    pub fn has_warnings(&self) -> bool {
        !self.warnings.is_empty()
    }
}

/// Per-entity change classification for dry-run previews
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChangeKind {
    New,
    Moved,
    Unchanged,
}

/// Diff summary produced instead of a commit when previewing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DryRunReport {
    pub new_entities: u64,
    pub moved_entities: u64,
    pub unchanged_entities: u64,
    pub merged_clusters: u64,
    pub largest_cluster_id: Option<String>,
    pub largest_cluster_size: u64,
    pub total_entities: u64,
}

/// Dense interner mapping entity keys to [`EntityId`]s for one resolution pass
#[derive(Debug, Clone, Default)]
pub struct KeyInterner {
    key_to_id: FxHashMap<String, EntityId>,
    keys: Vec<String>,
}

impl KeyInterner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            key_to_id: FxHashMap::with_capacity_and_hasher(capacity, Default::default()),
            keys: Vec::with_capacity(capacity),
        }
    }

    /// Intern a key, returning its dense id.
    pub fn intern(&mut self, key: &str) -> EntityId {
        if let Some(&id) = self.key_to_id.get(key) {
            return id;
        }
        let id = EntityId(self.keys.len() as u32);
        self.key_to_id.insert(key.to_string(), id);
        self.keys.push(key.to_string());
        id
    }

    pub fn get(&self, key: &str) -> Option<EntityId> {
        self.key_to_id.get(key).copied()
    }

    pub fn key(&self, id: EntityId) -> &str {
        &self.keys[id.0 as usize]
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = EntityId> + '_ {
        (0..self.keys.len() as u32).map(EntityId)
    }
}
