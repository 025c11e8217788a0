//! # Disjoint Set Union
//!
//! Union-find over dense entity ids: path halving on find, union by size.
//! The resolver interns entity keys in lexicographic order, so the minimum
//! member id of a set is also its minimum entity key.

use crate::model::EntityId;

/// Union-find over `0..n` dense ids.
#[derive(Debug, Clone)]
pub struct Dsu {
    parent: Vec<u32>,
    size: Vec<u32>,
    cluster_count: usize,
}

impl Dsu {
    /// Create a DSU with `n` singleton sets.
    pub fn new(n: usize) -> Self {
        Self {
            parent: (0..n as u32).collect(),
            size: vec![1; n],
            cluster_count: n,
        }
    }

    pub fn len(&self) -> usize {
        self.parent.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parent.is_empty()
    }

    /// Find the root of an id, compressing with path halving: every other
    /// node on the walk is pointed at its grandparent.
    #[inline]
    pub fn find(&mut self, id: EntityId) -> EntityId {
        let mut current = id.0 as usize;
        loop {
            let parent = self.parent[current] as usize;
            if parent == current {
                return EntityId(current as u32);
            }
            let grandparent = self.parent[parent];
            self.parent[current] = grandparent;
            current = grandparent as usize;
        }
    }

    /// Merge the sets containing `a` and `b`. Returns false when they were
    /// already one set. Ties on size keep the smaller root id.
    pub fn union(&mut self, a: EntityId, b: EntityId) -> bool {
        let root_a = self.find(a).0 as usize;
        let root_b = self.find(b).0 as usize;
        if root_a == root_b {
            return false;
        }

        let (winner, loser) = if self.size[root_a] > self.size[root_b] {
            (root_a, root_b)
        } else if self.size[root_b] > self.size[root_a] {
            (root_b, root_a)
        } else if root_a < root_b {
            (root_a, root_b)
        } else {
            (root_b, root_a)
        };

        self.parent[loser] = winner as u32;
        self.size[winner] += self.size[loser];
        self.cluster_count -= 1;
        true
    }

    pub fn same_set(&mut self, a: EntityId, b: EntityId) -> bool {
        self.find(a) == self.find(b)
    }

    pub fn cluster_count(&self) -> usize {
        self.cluster_count
    }

    /// Minimum member id of every element's set, indexed by element id.
    ///
    /// With lexicographically interned ids this is exactly the min-label
    /// fixpoint the relaxation strategy converges to.
    pub fn labels(&mut self) -> Vec<EntityId> {
        let n = self.parent.len();
        let mut min_of_root = vec![u32::MAX; n];
        // Ascending scan: the first member to reach a root is its minimum.
        for i in 0..n {
            let root = self.find(EntityId(i as u32)).0 as usize;
            if min_of_root[root] == u32::MAX {
                min_of_root[root] = i as u32;
            }
        }
        (0..n)
            .map(|i| {
                let root = self.find(EntityId(i as u32)).0 as usize;
                EntityId(min_of_root[root])
            })
            .collect()
    }

    /// Group members by set, ordered by minimum member id.
    pub fn get_clusters(&mut self) -> ClusterSets {
        let n = self.parent.len();
        let mut by_root: Vec<Vec<EntityId>> = vec![Vec::new(); n];
        for i in 0..n {
            let root = self.find(EntityId(i as u32)).0 as usize;
            by_root[root].push(EntityId(i as u32));
        }
        let mut clusters: Vec<ClusterSet> = by_root
            .into_iter()
            .enumerate()
            .filter(|(_, members)| !members.is_empty())
            .map(|(root, members)| ClusterSet {
                root: EntityId(root as u32),
                members,
            })
            .collect();
        clusters.sort_unstable_by_key(|c| c.members[0]);
        ClusterSets { clusters }
    }
}

/// One set of entity ids. Members are sorted ascending.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterSet {
    pub root: EntityId,
    pub members: Vec<EntityId>,
}

impl ClusterSet {
    /// Minimum member id; the set's canonical label.
    pub fn label(&self) -> EntityId {
        self.members[0]
    }
}

/// All sets from one extraction, ordered by label.
#[derive(Debug, Clone, Default)]
pub struct ClusterSets {
    pub clusters: Vec<ClusterSet>,
}

impl ClusterSets {
    pub fn len(&self) -> usize {
        self.clusters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clusters.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ClusterSet> {
        self.clusters.iter()
    }
}
