//! # Confidence Scorer
//!
//! Grades each cluster on the structure of its internal evidence.
//! Diversity (how many identifier types contributed at least one edge)
//! and density (actual links against possible pairwise links) each carry
//! half the score. Singletons need no evidence and are pinned at 1.0.

use crate::model::{ClusterRecord, Edge};
use crate::resolver::Resolution;
use rustc_hash::FxHashMap;
use tracing::{debug, instrument};

/// Reason recorded on single-member clusters
pub const SINGLETON_REASON: &str = "SINGLETON";

/// Reason recorded when a multi-member cluster carries no internal edges,
/// which can only happen inside an unconverged relaxation snapshot
pub const NO_EDGES_REASON: &str = "NO_INTERNAL_EDGES";

/// Scores clusters from their internal edge structure
#[derive(Debug, Clone)]
pub struct ConfidenceScorer {
    /// Distinct configured identifier types; diversity denominator
    identifier_type_count: usize,
}

impl ConfidenceScorer {
    pub fn new(identifier_type_count: usize) -> Self {
        Self {
            identifier_type_count: identifier_type_count.max(1),
        }
    }

    /// Produce one scored record per cluster.
    ///
    /// `super_clusters` maps `resolved_id` to `super_cluster_id`; clusters
    /// absent from the map keep their own id.
    #[instrument(skip_all, level = "debug")]
    pub fn score(
        &self,
        resolution: &Resolution,
        edges: &[Edge],
        super_clusters: &FxHashMap<String, String>,
    ) -> Vec<ClusterRecord> {
        let member_index = resolution.index_by_member();

        // Internal edge tally per cluster, keyed by identifier type. Both
        // endpoints share a cluster, so the left endpoint decides placement.
        let mut type_counts: Vec<FxHashMap<&str, usize>> =
            vec![FxHashMap::default(); resolution.cluster_count()];
        for edge in edges {
            let Some(&pos) = member_index.get(edge.left_entity_key.as_str()) else {
                continue;
            };
            *type_counts[pos]
                .entry(edge.identifier_type.as_str())
                .or_insert(0) += 1;
        }

        let records: Vec<ClusterRecord> = resolution
            .clusters
            .iter()
            .enumerate()
            .map(|(pos, cluster)| {
                let counts = &type_counts[pos];
                let internal_edge_count: usize = counts.values().sum();
                let edge_diversity = counts.len();
                let n = cluster.members.len();
                let super_cluster_id = super_clusters
                    .get(&cluster.resolved_id)
                    .cloned()
                    .unwrap_or_else(|| cluster.resolved_id.clone());

                if n <= 1 {
                    return ClusterRecord {
                        resolved_id: cluster.resolved_id.clone(),
                        super_cluster_id,
                        member_count: n,
                        internal_edge_count,
                        edge_diversity,
                        match_density: 0.0,
                        confidence_score: 1.0,
                        primary_reason: SINGLETON_REASON.to_string(),
                    };
                }

                // Multiple identifier types can link the same pair, so the
                // raw ratio may exceed one and needs the clamp.
                let possible_pairs = (n * (n - 1) / 2) as f64;
                let match_density =
                    (internal_edge_count as f64 / possible_pairs.max(1.0)).clamp(0.0, 1.0);
                let normalized_diversity =
                    (edge_diversity as f64 / self.identifier_type_count as f64).clamp(0.0, 1.0);
                let confidence_score =
                    (0.5 * normalized_diversity + 0.5 * match_density).clamp(0.0, 1.0);

                ClusterRecord {
                    resolved_id: cluster.resolved_id.clone(),
                    super_cluster_id,
                    member_count: n,
                    internal_edge_count,
                    edge_diversity,
                    match_density,
                    confidence_score,
                    primary_reason: dominant_type(counts),
                }
            })
            .collect();

        debug!(clusters = records.len(), "confidence scored");
        records
    }
}

/// Identifier type contributing the most internal edges; count ties break
/// toward the lexicographically smallest type name.
fn dominant_type(counts: &FxHashMap<&str, usize>) -> String {
    counts
        .iter()
        .max_by(|(a_ty, a_n), (b_ty, b_n)| a_n.cmp(b_n).then_with(|| b_ty.cmp(a_ty)))
        .map(|(ty, _)| (*ty).to_string())
        .unwrap_or_else(|| NO_EDGES_REASON.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::ResolvedCluster;

    fn resolution(clusters: &[&[&str]]) -> Resolution {
        let mut built: Vec<ResolvedCluster> = clusters
            .iter()
            .map(|members| {
                let mut members: Vec<String> = members.iter().map(|m| m.to_string()).collect();
                members.sort_unstable();
                ResolvedCluster {
                    resolved_id: members[0].clone(),
                    members,
                }
            })
            .collect();
        built.sort_unstable_by(|a, b| a.resolved_id.cmp(&b.resolved_id));
        Resolution {
            clusters: built,
            iterations: 1,
            converged: true,
        }
    }

    fn edge(a: &str, b: &str, identifier_type: &str) -> Edge {
        Edge::between(a, b, identifier_type, "v", "r1")
    }

    #[test]
    fn test_singleton_pinned_at_full_confidence() {
        let resolution = resolution(&[&["e4"]]);
        let scorer = ConfidenceScorer::new(3);

        let records = scorer.score(&resolution, &[], &FxHashMap::default());

        assert_eq!(records.len(), 1);
        let record = &records[0];
        assert_eq!(record.confidence_score, 1.0);
        assert_eq!(record.primary_reason, SINGLETON_REASON);
        assert_eq!(record.edge_diversity, 0);
        assert_eq!(record.super_cluster_id, "e4");
    }

    #[test]
    fn test_pair_linked_by_every_type_scores_one() {
        let resolution = resolution(&[&["a1", "a2"]]);
        let edges = vec![edge("a1", "a2", "email"), edge("a1", "a2", "phone")];
        let scorer = ConfidenceScorer::new(2);

        let records = scorer.score(&resolution, &edges, &FxHashMap::default());

        let record = &records[0];
        assert_eq!(record.internal_edge_count, 2);
        assert_eq!(record.edge_diversity, 2);
        // Two edges over one possible pair clamps to 1.0
        assert_eq!(record.match_density, 1.0);
        assert_eq!(record.confidence_score, 1.0);
        // Equal edge counts: lexicographically smallest type wins
        assert_eq!(record.primary_reason, "email");
    }

    #[test]
    fn test_chain_scores_between_bounds() {
        let resolution = resolution(&[&["c1", "c2", "c3"]]);
        let edges = vec![edge("c1", "c2", "email"), edge("c2", "c3", "email")];
        let scorer = ConfidenceScorer::new(2);

        let records = scorer.score(&resolution, &edges, &FxHashMap::default());

        let record = &records[0];
        assert_eq!(record.edge_diversity, 1);
        let expected_density = 2.0 / 3.0;
        assert!((record.match_density - expected_density).abs() < 1e-9);
        let expected = 0.5 * 0.5 + 0.5 * expected_density;
        assert!((record.confidence_score - expected).abs() < 1e-9);
        assert_eq!(record.primary_reason, "email");
    }

    #[test]
    fn test_dominant_type_by_edge_count() {
        let resolution = resolution(&[&["d1", "d2", "d3"]]);
        let edges = vec![
            edge("d1", "d2", "phone"),
            edge("d2", "d3", "phone"),
            edge("d1", "d3", "email"),
        ];
        let scorer = ConfidenceScorer::new(2);

        let records = scorer.score(&resolution, &edges, &FxHashMap::default());

        assert_eq!(records[0].primary_reason, "phone");
        assert_eq!(records[0].match_density, 1.0);
    }

    #[test]
    fn test_scores_stay_bounded() {
        let resolution = resolution(&[&["b1", "b2"], &["z1"]]);
        let edges = vec![
            edge("b1", "b2", "email"),
            edge("b1", "b2", "phone"),
            edge("b1", "b2", "device"),
        ];
        // Fewer configured types than observed: diversity still clamps
        let scorer = ConfidenceScorer::new(1);

        for record in scorer.score(&resolution, &edges, &FxHashMap::default()) {
            assert!((0.0..=1.0).contains(&record.confidence_score));
            assert!((0.0..=1.0).contains(&record.match_density));
        }
    }

    #[test]
    fn test_super_cluster_assignment_carried() {
        let resolution = resolution(&[&["a1"], &["b1"]]);
        let mut assignments = FxHashMap::default();
        assignments.insert("b1".to_string(), "a1".to_string());
        let scorer = ConfidenceScorer::new(1);

        let records = scorer.score(&resolution, &[], &assignments);

        assert_eq!(records[0].super_cluster_id, "a1");
        assert_eq!(records[1].super_cluster_id, "a1");
    }
}
