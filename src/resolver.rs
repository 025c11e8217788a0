//! # Component Resolver
//!
//! Turns an edge list into clusters via connected components. Two
//! interchangeable strategies behind one entry point:
//!
//! - `union-find`: sequential DSU, single pass, always converges
//! - `relaxation`: iterative min-label propagation over partitioned edge
//!   shards, capped at `max_iterations`
//!
//! ## Relaxation architecture
//!
//! ```text
//! edges ──► shard by endpoint hash
//!             │         │         │
//!          worker    worker    worker     (read labels, propose minima)
//!             └─────────┴─────────┘
//!                       │ proposals (channel)
//!             ┌─────────▼─────────┐
//!             │   label writer    │       (applies minima + jump sweep)
//!             └───────────────────┘
//!                barrier, next pass
//! ```
//!
//! Entity keys are interned in lexicographic order, so the smallest dense
//! id in a component is also its lexicographically smallest key. Cluster
//! labels fall out of the id ordering for free.

use crate::config::{EngineConfig, ResolverStrategy};
use crate::dsu::Dsu;
use crate::model::{Edge, EntityId, KeyInterner};
use crossbeam_channel::unbounded;
use rustc_hash::{FxHashMap, FxHasher};
use std::hash::{Hash, Hasher};
use tracing::{debug, instrument};

/// One cluster produced by a resolve pass
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedCluster {
    /// Lexicographically smallest member key, used as the cluster label
    pub resolved_id: String,
    /// Member entity keys, ascending
    pub members: Vec<String>,
}

impl ResolvedCluster {
    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn is_singleton(&self) -> bool {
        self.members.len() == 1
    }
}

/// Output of one resolve pass over a scope of entities and edges
#[derive(Debug, Clone, Default)]
pub struct Resolution {
    /// Clusters ordered by `resolved_id`
    pub clusters: Vec<ResolvedCluster>,
    /// Propagation passes executed; 1 under union-find
    pub iterations: u32,
    /// False when the pass cap was hit before a stable pass
    pub converged: bool,
}

impl Resolution {
    pub fn cluster_count(&self) -> usize {
        self.clusters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clusters.is_empty()
    }

    /// Index from member key to position in `clusters`.
    pub fn index_by_member(&self) -> FxHashMap<&str, usize> {
        let mut index = FxHashMap::default();
        for (pos, cluster) in self.clusters.iter().enumerate() {
            for member in &cluster.members {
                index.insert(member.as_str(), pos);
            }
        }
        index
    }
}

/// A min-label proposal emitted by a shard worker
#[derive(Debug, Clone, Copy)]
struct LabelProposal {
    node: u32,
    label: u32,
}

/// Connected-components engine over one scope of entities and edges
#[derive(Debug, Clone)]
pub struct ComponentResolver {
    strategy: ResolverStrategy,
    max_iterations: u32,
    partition_count: usize,
}

impl ComponentResolver {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            strategy: config.resolver,
            max_iterations: config.max_iterations.max(1),
            partition_count: config.partition_count.max(1),
        }
    }

    /// Resolve entities and edges into clusters.
    ///
    /// Every key in `entity_keys` lands in exactly one cluster; entities
    /// without edges come back as singletons. Edge endpoints missing from
    /// `entity_keys` are folded in, so the output always covers the graph.
    #[instrument(skip(self, entity_keys, edges), level = "debug")]
    pub fn resolve<'k, I>(&self, entity_keys: I, edges: &[Edge]) -> Resolution
    where
        I: IntoIterator<Item = &'k str>,
    {
        // Sorted interning: dense id order == lexicographic key order
        let mut keys: Vec<&str> = entity_keys.into_iter().collect();
        for edge in edges {
            keys.push(edge.left_entity_key.as_str());
            keys.push(edge.right_entity_key.as_str());
        }
        keys.sort_unstable();
        keys.dedup();

        let mut interner = KeyInterner::with_capacity(keys.len());
        for key in &keys {
            interner.intern(key);
        }

        let n = interner.len();
        if n == 0 {
            return Resolution {
                clusters: Vec::new(),
                iterations: 0,
                converged: true,
            };
        }

        let pairs = edge_pairs(&interner, edges);
        let (labels, iterations, converged) = match self.strategy {
            ResolverStrategy::UnionFind => (union_find_labels(n, &pairs), 1, true),
            ResolverStrategy::Relaxation => self.relax(n, &pairs),
        };

        let clusters = collect_clusters(&interner, &labels);
        debug!(
            clusters = clusters.len(),
            iterations, converged, "resolution complete"
        );
        Resolution {
            clusters,
            iterations,
            converged,
        }
    }

    /// Min-label propagation over sharded edges.
    ///
    /// Each pass: shard workers scan their edges against a frozen label
    /// snapshot and send proposals through the merge channel; after the
    /// scope joins (the pass barrier), the single writer applies winning
    /// minima and runs an ascending jump sweep. The sweep collapses
    /// pointer chains so long components settle in logarithmically many
    /// passes rather than one hop per pass.
    fn relax(&self, n: usize, pairs: &[(u32, u32)]) -> (Vec<EntityId>, u32, bool) {
        let shards = shard_pairs(pairs, self.partition_count);
        let mut labels: Vec<u32> = (0..n as u32).collect();
        let mut iterations = 0u32;
        let mut converged = false;

        while iterations < self.max_iterations {
            iterations += 1;

            // Unbounded channel: workers must never block mid-pass, the
            // writer only drains after the barrier.
            let (proposal_tx, proposal_rx) = unbounded::<LabelProposal>();
            let snapshot = &labels;
            rayon::scope(|scope| {
                for shard in &shards {
                    let tx = proposal_tx.clone();
                    scope.spawn(move |_| {
                        for &(a, b) in shard {
                            let la = snapshot[a as usize];
                            let lb = snapshot[b as usize];
                            if la < lb {
                                let _ = tx.send(LabelProposal { node: b, label: la });
                            } else if lb < la {
                                let _ = tx.send(LabelProposal { node: a, label: lb });
                            }
                        }
                    });
                }
            });
            drop(proposal_tx);

            let mut changes = 0u64;
            for proposal in proposal_rx.try_iter() {
                let slot = &mut labels[proposal.node as usize];
                if proposal.label < *slot {
                    *slot = proposal.label;
                    changes += 1;
                }
            }

            // Jump sweep: labels[i] <= i always holds, so chasing two hops
            // in ascending order compresses whole chains in one sweep.
            for i in 0..n {
                let target = labels[labels[i] as usize];
                if target < labels[i] {
                    labels[i] = target;
                    changes += 1;
                }
            }

            debug!(pass = iterations, changes, "relaxation pass");
            if changes == 0 {
                converged = true;
                break;
            }
        }

        let labels = labels.into_iter().map(EntityId).collect();
        (labels, iterations, converged)
    }
}

/// Map edges onto dense id pairs. Endpoints were interned by the caller,
/// so lookups cannot miss; unknown keys are dropped rather than trusted.
fn edge_pairs(interner: &KeyInterner, edges: &[Edge]) -> Vec<(u32, u32)> {
    edges
        .iter()
        .filter_map(|edge| {
            let a = interner.get(&edge.left_entity_key)?;
            let b = interner.get(&edge.right_entity_key)?;
            Some((a.0, b.0))
        })
        .collect()
}

fn union_find_labels(n: usize, pairs: &[(u32, u32)]) -> Vec<EntityId> {
    let mut dsu = Dsu::new(n);
    for &(a, b) in pairs {
        dsu.union(EntityId(a), EntityId(b));
    }
    dsu.labels()
}

/// Distribute edge pairs across shards by endpoint hash.
fn shard_pairs(pairs: &[(u32, u32)], partition_count: usize) -> Vec<Vec<(u32, u32)>> {
    let mut shards: Vec<Vec<(u32, u32)>> = vec![Vec::new(); partition_count];
    for &pair in pairs {
        let mut hasher = FxHasher::default();
        pair.0.hash(&mut hasher);
        let shard = (hasher.finish() as usize) % partition_count;
        shards[shard].push(pair);
    }
    shards
}

/// Group dense ids by final label and map back to keys. Members come out
/// ascending because id order matches key order.
fn collect_clusters(interner: &KeyInterner, labels: &[EntityId]) -> Vec<ResolvedCluster> {
    let mut groups: FxHashMap<u32, Vec<u32>> = FxHashMap::default();
    for (id, label) in labels.iter().enumerate() {
        groups.entry(label.0).or_default().push(id as u32);
    }

    let mut clusters: Vec<ResolvedCluster> = groups
        .into_values()
        .map(|mut member_ids| {
            member_ids.sort_unstable();
            let members: Vec<String> = member_ids
                .iter()
                .map(|&id| interner.key(EntityId(id)).to_string())
                .collect();
            ResolvedCluster {
                resolved_id: members[0].clone(),
                members,
            }
        })
        .collect();
    clusters.sort_unstable_by(|a, b| a.resolved_id.cmp(&b.resolved_id));
    clusters
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;

    fn resolver(strategy: ResolverStrategy, max_iterations: u32) -> ComponentResolver {
        let config = EngineConfig {
            resolver: strategy,
            max_iterations,
            partition_count: 4,
            ..EngineConfig::default()
        };
        ComponentResolver::new(&config)
    }

    fn email_edge(a: &str, b: &str) -> Edge {
        Edge::between(a, b, "email", "shared@example.com", "r1")
    }

    fn chain_edges(keys: &[String]) -> Vec<Edge> {
        keys.windows(2).map(|w| email_edge(&w[0], &w[1])).collect()
    }

    #[test]
    fn test_union_find_labels_minimum_key() {
        let resolver = resolver(ResolverStrategy::UnionFind, 30);
        let keys = ["src:b", "src:a", "src:c"];
        let edges = vec![email_edge("src:a", "src:b")];

        let resolution = resolver.resolve(keys.iter().copied(), &edges);

        assert!(resolution.converged);
        assert_eq!(resolution.iterations, 1);
        assert_eq!(resolution.cluster_count(), 2);
        assert_eq!(resolution.clusters[0].resolved_id, "src:a");
        assert_eq!(resolution.clusters[0].members, vec!["src:a", "src:b"]);
        assert_eq!(resolution.clusters[1].resolved_id, "src:c");
        assert!(resolution.clusters[1].is_singleton());
    }

    #[test]
    fn test_edgeless_entities_become_singletons() {
        let resolver = resolver(ResolverStrategy::UnionFind, 30);
        let keys = ["x:1", "x:2", "x:3"];

        let resolution = resolver.resolve(keys.iter().copied(), &[]);

        assert_eq!(resolution.cluster_count(), 3);
        for cluster in &resolution.clusters {
            assert!(cluster.is_singleton());
            assert_eq!(cluster.resolved_id, cluster.members[0]);
        }
    }

    #[test]
    fn test_empty_scope_resolves_to_nothing() {
        let resolver = resolver(ResolverStrategy::UnionFind, 30);
        let resolution = resolver.resolve(std::iter::empty(), &[]);

        assert!(resolution.is_empty());
        assert!(resolution.converged);
        assert_eq!(resolution.iterations, 0);
    }

    #[test]
    fn test_edge_endpoints_outside_scope_are_folded_in() {
        let resolver = resolver(ResolverStrategy::UnionFind, 30);
        let keys = ["z:9"];
        let edges = vec![email_edge("a:1", "b:1")];

        let resolution = resolver.resolve(keys.iter().copied(), &edges);

        assert_eq!(resolution.cluster_count(), 2);
        assert_eq!(resolution.clusters[0].members, vec!["a:1", "b:1"]);
        assert_eq!(resolution.clusters[1].members, vec!["z:9"]);
    }

    #[test]
    fn test_strategies_agree_on_mixed_graph() {
        let chain: Vec<String> = (0..16).map(|i| format!("c:{i:02}")).collect();
        let mut edges = chain_edges(&chain);
        // A star and an isolated pair on top of the chain
        for leaf in ["s:1", "s:2", "s:3", "s:4"] {
            edges.push(email_edge("s:0", leaf));
        }
        edges.push(email_edge("p:1", "p:2"));
        let mut keys: Vec<String> = chain;
        keys.extend(["s:0", "s:1", "s:2", "s:3", "s:4", "p:1", "p:2", "lone:1"].map(String::from));

        let by_dsu = resolver(ResolverStrategy::UnionFind, 30)
            .resolve(keys.iter().map(String::as_str), &edges);
        let by_relax = resolver(ResolverStrategy::Relaxation, 30)
            .resolve(keys.iter().map(String::as_str), &edges);

        assert!(by_relax.converged);
        assert_eq!(by_dsu.clusters, by_relax.clusters);
    }

    #[test]
    fn test_relaxation_converges_on_long_chain() {
        let keys: Vec<String> = (0..64).map(|i| format!("e:{i:02}")).collect();
        let edges = chain_edges(&keys);

        let resolution = resolver(ResolverStrategy::Relaxation, 30)
            .resolve(keys.iter().map(String::as_str), &edges);

        assert!(resolution.converged);
        assert!(resolution.iterations <= 6, "took {}", resolution.iterations);
        assert_eq!(resolution.cluster_count(), 1);
        assert_eq!(resolution.clusters[0].resolved_id, "e:00");
        assert_eq!(resolution.clusters[0].len(), 64);
    }

    #[test]
    fn test_relaxation_reports_unconverged_at_pass_cap() {
        let keys: Vec<String> = (0..8).map(|i| format!("e:{i}")).collect();
        let edges = chain_edges(&keys);

        let resolution = resolver(ResolverStrategy::Relaxation, 1)
            .resolve(keys.iter().map(String::as_str), &edges);

        // One pass applied real changes, so the stable pass never ran
        assert!(!resolution.converged);
        assert_eq!(resolution.iterations, 1);
    }

    #[test]
    fn test_index_by_member() {
        let resolver = resolver(ResolverStrategy::UnionFind, 30);
        let keys = ["a:1", "b:1", "c:1"];
        let edges = vec![email_edge("a:1", "b:1")];

        let resolution = resolver.resolve(keys.iter().copied(), &edges);
        let index = resolution.index_by_member();

        assert_eq!(index["a:1"], index["b:1"]);
        assert_ne!(index["a:1"], index["c:1"]);
    }
}
