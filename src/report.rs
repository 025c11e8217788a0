//! # Resolution Report
//!
//! Line-delimited JSON export of the committed reporting surface. Every
//! line is a tagged envelope `{"type": ..., "data": ...}` so downstream
//! consumers can stream-filter by row kind without loading the whole
//! file. Emission order is fixed: one header line, then memberships,
//! cluster records, golden profiles, skipped groups, and per-source
//! watermarks.

use crate::errors::{EngineError, Result};
use crate::model::{ClusterRecord, GoldenProfile, Membership, RunMode, RunState, SkippedGroup};
use crate::store::{RunRecordStatus, StateStore};
use serde::{Deserialize, Serialize};
use std::io::Write;
use tracing::debug;

/// First line of every report: run provenance and row counts.
///
/// The run fields name the most recent live (non-dry-run) history entry;
/// they are `None` on a store no run has touched yet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportHeader {
    pub run_id: Option<String>,
    pub mode: Option<RunMode>,
    pub status: Option<RunRecordStatus>,
    pub entities: usize,
    pub clusters: usize,
    pub profiles: usize,
    pub skipped_groups: usize,
}

/// One tagged line of the export.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ReportLine<'a> {
    Header(&'a ReportHeader),
    Membership(&'a Membership),
    Cluster(&'a ClusterRecord),
    Profile(&'a GoldenProfile),
    SkippedGroup(&'a SkippedGroup),
    Watermark(&'a RunState),
}

/// Snapshot of the committed reporting surface.
///
/// Dry runs park their results on the preview surface and never appear
/// here.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolutionReport {
    pub header: ReportHeader,
    pub memberships: Vec<Membership>,
    pub clusters: Vec<ClusterRecord>,
    pub profiles: Vec<GoldenProfile>,
    pub skipped_groups: Vec<SkippedGroup>,
    pub watermarks: Vec<RunState>,
}

impl ResolutionReport {
    /// Snapshot the committed state behind `store`.
    pub fn from_store(store: &dyn StateStore) -> Result<Self> {
        let memberships = store.memberships()?;
        let clusters = store.cluster_records()?;
        let profiles = store.golden_profiles()?;
        let skipped_groups = store.skipped_groups()?;
        let watermarks = store.run_states()?;
        let last_run = store
            .run_history()?
            .into_iter()
            .rev()
            .find(|record| !record.dry_run);
        let header = ReportHeader {
            run_id: last_run.as_ref().map(|run| run.run_id.clone()),
            mode: last_run.as_ref().map(|run| run.mode),
            status: last_run.as_ref().map(|run| run.status),
            entities: memberships.len(),
            clusters: clusters.len(),
            profiles: profiles.len(),
            skipped_groups: skipped_groups.len(),
        };
        debug!(
            entities = header.entities,
            clusters = header.clusters,
            profiles = header.profiles,
            "assembled resolution report"
        );
        Ok(Self {
            header,
            memberships,
            clusters,
            profiles,
            skipped_groups,
            watermarks,
        })
    }

    /// All lines in emission order, header first.
    pub fn lines(&self) -> Vec<ReportLine<'_>> {
        let mut lines = Vec::with_capacity(
            1 + self.memberships.len()
                + self.clusters.len()
                + self.profiles.len()
                + self.skipped_groups.len()
                + self.watermarks.len(),
        );
        lines.push(ReportLine::Header(&self.header));
        lines.extend(self.memberships.iter().map(ReportLine::Membership));
        lines.extend(self.clusters.iter().map(ReportLine::Cluster));
        lines.extend(self.profiles.iter().map(ReportLine::Profile));
        lines.extend(self.skipped_groups.iter().map(ReportLine::SkippedGroup));
        lines.extend(self.watermarks.iter().map(ReportLine::Watermark));
        lines
    }

    /// Render the report as JSONL, one envelope per line.
    pub fn to_jsonl(&self) -> Result<String> {
        let mut rendered = Vec::new();
        for line in self.lines() {
            rendered.push(encode(&line)?);
        }
        Ok(rendered.join("\n"))
    }

    /// Stream the report to `writer`, one newline-terminated envelope per
    /// line.
    pub fn write_jsonl<W: Write>(&self, writer: &mut W) -> Result<()> {
        for line in self.lines() {
            let encoded = encode(&line)?;
            writeln!(writer, "{encoded}")
                .map_err(|e| EngineError::Internal(format!("report write: {e}")))?;
        }
        Ok(())
    }
}

fn encode(line: &ReportLine<'_>) -> Result<String> {
    serde_json::to_string(line)
        .map_err(|e| EngineError::Internal(format!("report serialization: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{RunStatus, RunSummary, SKIP_REASON_GROUP_SIZE};
    use crate::store::{ClusterAssignment, CommitScope, MemoryStore, RunDelta, RunRecord};
    use std::collections::BTreeMap;
    use std::time::Duration as StdDuration;
    use time::Duration;

    fn sample_report() -> ResolutionReport {
        ResolutionReport {
            header: ReportHeader {
                run_id: Some("run_1".to_string()),
                mode: Some(RunMode::Full),
                status: Some(RunRecordStatus::Success),
                entities: 1,
                clusters: 1,
                profiles: 1,
                skipped_groups: 1,
            },
            memberships: vec![Membership {
                entity_key: "E1".to_string(),
                resolved_id: "E1".to_string(),
                super_cluster_id: None,
                first_seen_run: "run_1".to_string(),
                last_seen_run: "run_1".to_string(),
            }],
            clusters: vec![ClusterRecord {
                resolved_id: "E1".to_string(),
                super_cluster_id: "E1".to_string(),
                member_count: 1,
                internal_edge_count: 0,
                edge_diversity: 0,
                match_density: 0.0,
                confidence_score: 1.0,
                primary_reason: "SINGLETON".to_string(),
            }],
            profiles: vec![GoldenProfile {
                resolved_id: "E1".to_string(),
                values: BTreeMap::from([("name".to_string(), "Ada".to_string())]),
            }],
            skipped_groups: vec![SkippedGroup {
                identifier_type: "device".to_string(),
                normalized_value: "shared".to_string(),
                group_size: 8,
                max_allowed: 5,
                sample_keys: vec!["E9".to_string()],
                reason: SKIP_REASON_GROUP_SIZE.to_string(),
            }],
            watermarks: vec![RunState {
                source_id: "crm".to_string(),
                last_watermark: 140,
                updated_by_run: "run_1".to_string(),
            }],
        }
    }

    fn summary(run_id: &str) -> RunSummary {
        RunSummary {
            run_id: run_id.to_string(),
            mode: RunMode::Full,
            dry_run: false,
            status: RunStatus::Success,
            entities_processed: 1,
            identifiers_extracted: 0,
            edges_created: 0,
            clusters_impacted: 1,
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

    #[test]
    fn test_lines_tagged_and_ordered() {
        let report = sample_report();
        let jsonl = report.to_jsonl().unwrap();
        let lines: Vec<&str> = jsonl.lines().collect();
        assert_eq!(lines.len(), 6);

        let tags: Vec<String> = lines
            .iter()
            .map(|line| {
                let value: serde_json::Value = serde_json::from_str(line).unwrap();
                value["type"].as_str().unwrap().to_string()
            })
            .collect();
        assert_eq!(
            tags,
            vec![
                "header",
                "membership",
                "cluster",
                "profile",
                "skipped_group",
                "watermark"
            ]
        );

        let membership: serde_json::Value = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(membership["data"]["entity_key"], "E1");
        let skipped: serde_json::Value = serde_json::from_str(lines[4]).unwrap();
        assert_eq!(skipped["data"]["reason"], SKIP_REASON_GROUP_SIZE);
    }

    #[test]
    fn test_write_jsonl_newline_terminated() {
        let report = sample_report();
        let mut buffer = Vec::new();
        report.write_jsonl(&mut buffer).unwrap();
        let text = String::from_utf8(buffer).unwrap();
        assert!(text.ends_with('\n'));
        assert_eq!(text.lines().count(), report.lines().len());
    }

    #[test]
    fn test_from_store_snapshot_skips_dry_runs() {
        let store = MemoryStore::new();
        store
            .begin_run(
                RunRecord::started("run_1", RunMode::Full, false),
                Duration::hours(1),
            )
            .unwrap();
        let sample = sample_report();
        store
            .commit(RunDelta {
                run_id: "run_1".to_string(),
                scope: CommitScope::Full,
                edges: Vec::new(),
                identifier_groups: Vec::new(),
                attributes: Vec::new(),
                assignments: vec![ClusterAssignment {
                    entity_key: "E1".to_string(),
                    resolved_id: "E1".to_string(),
                    super_cluster_id: None,
                }],
                clusters: sample.clusters.clone(),
                profiles: sample.profiles.clone(),
                skipped: sample.skipped_groups.clone(),
                run_states: sample.watermarks.clone(),
            })
            .unwrap();
        store.finish_run("run_1", &summary("run_1")).unwrap();
        store
            .begin_run(
                RunRecord::started("run_2", RunMode::Incr, true),
                Duration::hours(1),
            )
            .unwrap();

        let report = ResolutionReport::from_store(&store).unwrap();
        assert_eq!(report.header.run_id.as_deref(), Some("run_1"));
        assert_eq!(report.header.mode, Some(RunMode::Full));
        assert_eq!(report.header.status, Some(RunRecordStatus::Success));
        assert_eq!(report.header.entities, 1);
        assert_eq!(report.header.clusters, 1);
        assert_eq!(report.header.profiles, 1);
        assert_eq!(report.header.skipped_groups, 1);
        assert_eq!(report.memberships[0].resolved_id, "E1");
        assert_eq!(report.watermarks[0].source_id, "crm");
    }
}
