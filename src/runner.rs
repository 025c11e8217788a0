//! # Run Orchestrator
//!
//! Drives one run through the pipeline stages in order:
//!
//! ```text
//!   preflight -> edges -> resolve -> fuzzy -> confidence -> golden -> commit
//! ```
//!
//! FULL runs rebuild from the entire input; INCR runs select a delta by
//! watermark, close it into a working set and rebuild only that scope.
//! A dry run executes every stage but commits to the preview surface
//! instead of durable state.
//!
//! Fatal pre-run errors (bad configuration, a concurrent live run) come
//! back as `Err` before anything is recorded. Once a run is registered,
//! failures fold into a FAILED summary with the stage that broke, and
//! the run history keeps the record either way.

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::time::Instant;

use rustc_hash::{FxHashMap, FxHashSet};
use tracing::{error, info, instrument};

use crate::config::EngineConfig;
use crate::confidence::ConfidenceScorer;
use crate::edges::EdgeBuilder;
use crate::errors::{EngineError, Result};
use crate::exclusion::ExclusionFilter;
use crate::fuzzy::FuzzyMerger;
use crate::golden::GoldenBuilder;
use crate::incremental::{self, Expander};
use crate::model::{
    Attribute, DryRunReport, Entity, Identifier, Membership, RunMode, RunStatus, RunSummary,
    Stage, StageMetric, Warning, WarningKind,
};
use crate::resolver::ComponentResolver;
use crate::rules::RuleSet;
use crate::store::{
    ClusterAssignment, CommitScope, PreviewState, RunDelta, RunRecord, StateStore,
};

/// How one run should execute
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunParams {
    pub mode: RunMode,
    pub dry_run: bool,
    /// Strict mode disables the fuzzy merge stage entirely
    pub strict: bool,
}

impl RunParams {
    pub fn full() -> Self {
        Self {
            mode: RunMode::Full,
            dry_run: false,
            strict: false,
        }
    }

    pub fn incremental() -> Self {
        Self {
            mode: RunMode::Incr,
            ..Self::full()
        }
    }

    pub fn with_dry_run(mut self) -> Self {
        self.dry_run = true;
        self
    }

    pub fn with_strict(mut self) -> Self {
        self.strict = true;
        self
    }
}

impl Default for RunParams {
    fn default() -> Self {
        Self::full()
    }
}

/// Borrowed source rows for one run
#[derive(Debug, Clone, Copy)]
pub struct RunInput<'a> {
    pub entities: &'a [Entity],
    pub identifiers: &'a [Identifier],
    pub attributes: &'a [Attribute],
}

impl<'a> RunInput<'a> {
    pub fn new(
        entities: &'a [Entity],
        identifiers: &'a [Identifier],
        attributes: &'a [Attribute],
    ) -> Self {
        Self {
            entities,
            identifiers,
            attributes,
        }
    }
}

/// Fresh run identifier: `run_` plus twelve hex characters. Dry runs
/// prepend `dry_` to the same shape.
pub fn new_run_id(dry_run: bool) -> String {
    let hex = uuid::Uuid::new_v4().simple().to_string();
    let prefix = if dry_run { "dry_run" } else { "run" };
    format!("{prefix}_{}", &hex[..12])
}

#[derive(Debug, Default)]
struct PipelineStats {
    entities_processed: u64,
    identifiers_extracted: u64,
    edges_created: u64,
    clusters_impacted: u64,
    lp_iterations: u32,
    groups_skipped: u64,
    values_excluded: u64,
    large_clusters: u64,
    no_changes: bool,
}

fn push_metric(metrics: &mut Vec<StageMetric>, stage: Stage, rows: u64, since: Instant) {
    metrics.push(StageMetric {
        stage,
        rows,
        duration: since.elapsed(),
    });
}

/// Re-stamp a storage error with the pipeline stage it surfaced in.
fn at_stage(stage: Stage) -> impl Fn(EngineError) -> EngineError {
    move |err| match err {
        EngineError::Storage { message, .. } => EngineError::Storage { stage, message },
        other => other,
    }
}

fn empty_report() -> DryRunReport {
    DryRunReport {
        new_entities: 0,
        moved_entities: 0,
        unchanged_entities: 0,
        merged_clusters: 0,
        largest_cluster_id: None,
        largest_cluster_size: 0,
        total_entities: 0,
    }
}

/// Executes runs against one store, rule set and configuration.
pub struct Runner<'a> {
    store: &'a dyn StateStore,
    rules: &'a RuleSet,
    config: &'a EngineConfig,
}

impl<'a> Runner<'a> {
    pub fn new(store: &'a dyn StateStore, rules: &'a RuleSet, config: &'a EngineConfig) -> Self {
        Self {
            store,
            rules,
            config,
        }
    }

    /// Run the pipeline once.
    ///
    /// Returns `Err` only for pre-run rejection; anything that fails
    /// after the run is registered comes back as an `Ok` summary with
    /// `status == FAILED` and the failing stage recorded.
    #[instrument(skip_all, fields(mode = %params.mode, dry_run = params.dry_run))]
    pub fn execute(&self, input: RunInput<'_>, params: &RunParams) -> Result<RunSummary> {
        let started = Instant::now();

        self.config.validate()?;
        self.rules.validate()?;
        let filter = ExclusionFilter::compile(&self.rules.exclusions)?;
        let config_digest = self.rules.digest(self.config)?;

        let run_id = new_run_id(params.dry_run);
        info!(%run_id, entities = input.entities.len(), "run started");
        self.store.begin_run(
            RunRecord::started(&run_id, params.mode, params.dry_run),
            time::Duration::hours(self.config.stale_run_hours),
        )?;

        let mut warnings: Vec<Warning> = Vec::new();
        let mut stage_metrics: Vec<StageMetric> = Vec::new();
        let outcome = self.pipeline(
            input,
            params,
            &run_id,
            &filter,
            started,
            &mut warnings,
            &mut stage_metrics,
        );

        let (status, error_message, error_stage, stats) = match outcome {
            Ok(stats) => {
                let status = if warnings.is_empty() {
                    RunStatus::Success
                } else {
                    RunStatus::SuccessWithWarnings
                };
                (status, None, None, stats)
            }
            Err(err) => {
                error!(%run_id, error = %err, "run failed");
                (
                    RunStatus::Failed,
                    Some(err.to_string()),
                    err.stage(),
                    PipelineStats::default(),
                )
            }
        };

        let summary = RunSummary {
            run_id: run_id.clone(),
            mode: params.mode,
            dry_run: params.dry_run,
            status,
            entities_processed: stats.entities_processed,
            identifiers_extracted: stats.identifiers_extracted,
            edges_created: stats.edges_created,
            clusters_impacted: stats.clusters_impacted,
            lp_iterations: stats.lp_iterations,
            groups_skipped: stats.groups_skipped,
            values_excluded: stats.values_excluded,
            large_clusters: stats.large_clusters,
            no_changes: stats.no_changes,
            warnings,
            error_message,
            error_stage,
            stage_metrics,
            config_digest,
            duration: started.elapsed(),
        };
        self.store.finish_run(&run_id, &summary)?;
        info!(%run_id, status = %summary.status, duration_ms = summary.duration.as_millis() as u64, "run finished");
        Ok(summary)
    }

    #[allow(clippy::too_many_arguments)]
    fn pipeline(
        &self,
        input: RunInput<'_>,
        params: &RunParams,
        run_id: &str,
        filter: &ExclusionFilter,
        started: Instant,
        warnings: &mut Vec<Warning>,
        metrics: &mut Vec<StageMetric>,
    ) -> Result<PipelineStats> {
        let prior_states = self
            .store
            .run_states()
            .map_err(at_stage(Stage::Preflight))?;

        if self.rules.active_exact_rules().is_empty() {
            warnings.push(Warning::new(
                WarningKind::NoActiveRules,
                "no active exact match rules configured; all entities resolve as singletons",
            ));
        }
        push_metric(metrics, Stage::Preflight, input.entities.len() as u64, started);

        // Scope the run: everything for FULL, the closed working set for INCR.
        let scoped = match params.mode {
            RunMode::Full => {
                if input.entities.is_empty() {
                    return self.finish_no_changes(params, run_id);
                }
                let prior_memberships = if params.dry_run {
                    Some(self.store.memberships().map_err(at_stage(Stage::Preflight))?)
                } else {
                    None
                };
                ScopedRun {
                    scope_keys: input.entities.iter().map(|e| e.entity_key.clone()).collect(),
                    identifiers: Cow::Borrowed(input.identifiers),
                    attributes: Cow::Borrowed(input.attributes),
                    commit_scope: CommitScope::Full,
                    prior_memberships,
                    delta: input.entities.iter().collect(),
                    identifiers_extracted: input.identifiers.len() as u64,
                }
            }
            RunMode::Incr => {
                let delta =
                    incremental::select_delta(input.entities, &prior_states, self.config.lookback_minutes);
                if delta.is_empty() {
                    return self.finish_no_changes(params, run_id);
                }
                let delta_keys: FxHashSet<String> =
                    delta.iter().map(|e| e.entity_key.clone()).collect();
                let delta_identifiers: Vec<Identifier> = input
                    .identifiers
                    .iter()
                    .filter(|i| delta_keys.contains(&i.entity_key))
                    .cloned()
                    .collect();

                let groups = self
                    .store
                    .identifier_groups()
                    .map_err(at_stage(Stage::Preflight))?;
                let stored_edges = self
                    .store
                    .stored_edges()
                    .map_err(at_stage(Stage::Preflight))?;
                let prior_memberships =
                    self.store.memberships().map_err(at_stage(Stage::Preflight))?;

                let value_keys = incremental::normalized_value_keys(self.rules, &delta_identifiers);
                let expander = Expander::new(&groups, &stored_edges, &prior_memberships);
                let working_set = expander.expand(delta_keys.iter().cloned(), &value_keys);
                info!(
                    delta = delta.len(),
                    working_set = working_set.len(),
                    impacted_clusters = working_set.resolved_ids.len(),
                    "incremental scope selected"
                );

                let ws_keys = working_set.key_set();
                let merged =
                    incremental::merge_identifiers(&delta_identifiers, &delta_keys, &groups, &ws_keys);
                let identifiers_extracted = delta_identifiers.len() as u64;

                let old_members: Vec<String> = working_set
                    .entity_keys
                    .iter()
                    .filter(|k| !delta_keys.contains(k.as_str()))
                    .cloned()
                    .collect();
                let mut scoped_attributes = self
                    .store
                    .attributes_for(&old_members)
                    .map_err(at_stage(Stage::Preflight))?;
                scoped_attributes.extend(
                    input
                        .attributes
                        .iter()
                        .filter(|a| delta_keys.contains(&a.entity_key))
                        .cloned(),
                );

                ScopedRun {
                    scope_keys: working_set.entity_keys.clone(),
                    identifiers: Cow::Owned(merged),
                    attributes: Cow::Owned(scoped_attributes),
                    commit_scope: CommitScope::WorkingSet {
                        entity_keys: working_set.entity_keys,
                        resolved_ids: working_set.resolved_ids,
                    },
                    prior_memberships: Some(prior_memberships),
                    delta,
                    identifiers_extracted,
                }
            }
        };

        // Edge building, exclusion applied inline.
        let stage_start = Instant::now();
        let builder = EdgeBuilder::new(self.rules, self.config, filter);
        let edge_output = builder.build(&scoped.identifiers);
        let edges_created = edge_output.edges.len() as u64;
        let groups_skipped = edge_output.skipped.len() as u64;
        let values_excluded = edge_output.values_excluded;
        for skipped in &edge_output.skipped {
            warnings.push(Warning::new(
                WarningKind::HubOverflow,
                format!(
                    "identifier group {}={} has {} members (cap {}); no edges built",
                    skipped.identifier_type,
                    skipped.normalized_value,
                    skipped.group_size,
                    skipped.max_allowed
                ),
            ));
        }
        push_metric(metrics, Stage::Edges, edges_created, stage_start);

        // Connected components.
        let stage_start = Instant::now();
        let resolver = ComponentResolver::new(self.config);
        let resolution = resolver.resolve(
            scoped.scope_keys.iter().map(String::as_str),
            &edge_output.edges,
        );
        if !resolution.converged {
            warnings.push(Warning::new(
                WarningKind::Convergence,
                format!(
                    "label relaxation stopped after {} passes without converging",
                    resolution.iterations
                ),
            ));
        }
        push_metric(
            metrics,
            Stage::Resolve,
            resolution.cluster_count() as u64,
            stage_start,
        );

        // Fuzzy merge over resolved clusters, unless strict mode shut it off.
        let fuzzy_active = !self.rules.active_fuzzy_rules().is_empty();
        let mut super_map: FxHashMap<String, String> = FxHashMap::default();
        if params.strict {
            if fuzzy_active {
                warnings.push(Warning::new(
                    WarningKind::FuzzySkipped,
                    "Fuzzy matching skipped (strict mode)",
                ));
            }
        } else if fuzzy_active {
            let stage_start = Instant::now();
            let merger = FuzzyMerger::new(self.rules, self.config);
            let fuzzy = merger.merge(&resolution, &scoped.attributes);
            for block in &fuzzy.skipped_blocks {
                warnings.push(Warning::new(
                    WarningKind::OversizedBlock,
                    format!(
                        "fuzzy block {}='{}' has {} clusters (cap {}); skipped",
                        block.blocking_key, block.block_value, block.block_size, block.max_allowed
                    ),
                ));
            }
            info!(
                pairs_scored = fuzzy.pairs_scored,
                pairs_matched = fuzzy.pairs_matched,
                clusters_merged = fuzzy.clusters_merged,
                "fuzzy merge complete"
            );
            push_metric(metrics, Stage::Fuzzy, fuzzy.pairs_scored, stage_start);
            super_map = fuzzy.assignments;
        }

        // Confidence scoring.
        let stage_start = Instant::now();
        let scorer = ConfidenceScorer::new(self.rules.identifier_type_count());
        let records = scorer.score(&resolution, &edge_output.edges, &super_map);
        push_metric(metrics, Stage::Confidence, records.len() as u64, stage_start);

        let threshold = self.config.large_cluster_threshold;
        let mut large_count = 0u64;
        let mut largest: Option<(&str, usize)> = None;
        for record in &records {
            if record.member_count >= threshold {
                large_count += 1;
            }
            let bigger = match largest {
                None => true,
                Some((id, size)) => {
                    record.member_count > size
                        || (record.member_count == size && record.resolved_id.as_str() < id)
                }
            };
            if bigger {
                largest = Some((record.resolved_id.as_str(), record.member_count));
            }
        }
        if large_count > 0 {
            let (id, size) = largest.unwrap_or(("", 0));
            warnings.push(Warning::new(
                WarningKind::LargeCluster,
                format!(
                    "{large_count} clusters at or above {threshold} members (largest {id} with {size})"
                ),
            ));
        }

        // Golden profiles.
        let stage_start = Instant::now();
        let golden = GoldenBuilder::new(self.rules).build(&resolution, &scoped.attributes);
        let mut notes_per_attribute: BTreeMap<&str, u64> = BTreeMap::new();
        for note in &golden.quality_notes {
            *notes_per_attribute.entry(note.attribute.as_str()).or_default() += 1;
        }
        for (attribute, count) in notes_per_attribute {
            warnings.push(Warning::new(
                WarningKind::DataQuality,
                format!("{count} non-numeric values ignored for attribute '{attribute}'"),
            ));
        }
        push_metric(metrics, Stage::Golden, golden.profiles.len() as u64, stage_start);

        // Final assignment rows.
        let assignments: Vec<ClusterAssignment> = resolution
            .clusters
            .iter()
            .flat_map(|cluster| {
                let super_id = super_map
                    .get(&cluster.resolved_id)
                    .cloned()
                    .unwrap_or_else(|| cluster.resolved_id.clone());
                cluster.members.iter().map(move |member| ClusterAssignment {
                    entity_key: member.clone(),
                    resolved_id: cluster.resolved_id.clone(),
                    super_cluster_id: Some(super_id.clone()),
                })
            })
            .collect();
        let assignment_count = assignments.len() as u64;

        let next_states =
            incremental::advance_run_states(&prior_states, scoped.delta.iter().copied(), run_id);

        // Commit, or park on the preview surface for a dry run.
        let stage_start = Instant::now();
        if params.dry_run {
            let prior = scoped.prior_memberships.unwrap_or_default();
            let report = incremental::diff_assignments(&prior, &assignments);
            info!(
                new = report.new_entities,
                moved = report.moved_entities,
                unchanged = report.unchanged_entities,
                merged_clusters = report.merged_clusters,
                "dry run diff computed"
            );
            let memberships: Vec<Membership> = assignments
                .iter()
                .map(|a| Membership {
                    entity_key: a.entity_key.clone(),
                    resolved_id: a.resolved_id.clone(),
                    super_cluster_id: a.super_cluster_id.clone(),
                    first_seen_run: run_id.to_string(),
                    last_seen_run: run_id.to_string(),
                })
                .collect();
            self.store
                .save_preview(PreviewState {
                    run_id: run_id.to_string(),
                    memberships,
                    clusters: records,
                    report,
                })
                .map_err(at_stage(Stage::Commit))?;
        } else {
            self.store
                .commit(RunDelta {
                    run_id: run_id.to_string(),
                    scope: scoped.commit_scope,
                    edges: edge_output.edges,
                    identifier_groups: edge_output.groups,
                    attributes: scoped.attributes.into_owned(),
                    assignments,
                    clusters: records,
                    profiles: golden.profiles,
                    skipped: edge_output.skipped,
                    run_states: next_states,
                })
                .map_err(at_stage(Stage::Commit))?;
        }
        push_metric(metrics, Stage::Commit, assignment_count, stage_start);

        Ok(PipelineStats {
            entities_processed: scoped.delta.len() as u64,
            identifiers_extracted: scoped.identifiers_extracted,
            edges_created,
            clusters_impacted: resolution.cluster_count() as u64,
            lp_iterations: resolution.iterations,
            groups_skipped,
            values_excluded,
            large_clusters: large_count,
            no_changes: false,
        })
    }

    /// Nothing to process: succeed without touching durable state.
    fn finish_no_changes(&self, params: &RunParams, run_id: &str) -> Result<PipelineStats> {
        info!(%run_id, "no entities to process");
        if params.dry_run {
            self.store
                .save_preview(PreviewState {
                    run_id: run_id.to_string(),
                    memberships: Vec::new(),
                    clusters: Vec::new(),
                    report: empty_report(),
                })
                .map_err(at_stage(Stage::Commit))?;
        }
        Ok(PipelineStats {
            no_changes: true,
            ..PipelineStats::default()
        })
    }
}

/// Input scoped to what this run actually rebuilds.
struct ScopedRun<'a> {
    scope_keys: Vec<String>,
    identifiers: Cow<'a, [Identifier]>,
    attributes: Cow<'a, [Attribute]>,
    commit_scope: CommitScope,
    prior_memberships: Option<Vec<Membership>>,
    delta: Vec<&'a Entity>,
    identifiers_extracted: u64,
}
