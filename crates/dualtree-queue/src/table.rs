//! Spatial tables and their binary trees.
//!
//! A [`Table`] owns an immutable arena of tree nodes over a contiguous point
//! range; the scheduler and transport hold `Arc<Table>` handles and refer to
//! nodes by [`NodeId`]. Node indices are private to the arena — external
//! callers identify subtrees by the stable [`SubtreeId`] (begin, count)
//! pair, which survives the queue's swap-with-last compaction.

use crate::metric::BoundBox;

/// Index of a node within one table's tree arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(u32);

impl NodeId {
    pub(crate) fn new(index: usize) -> Self {
        Self(index as u32)
    }

    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Stable external handle for a query subtree.
///
/// Forest indices are invalidated by compaction; (begin, count) uniquely
/// names a node of the local query tree for the lifetime of the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubtreeId {
    pub begin: usize,
    pub count: usize,
}

/// One node of a table's binary tree: a contiguous point range plus the
/// bounding box enclosing those points.
#[derive(Debug, Clone)]
pub struct TreeNode {
    begin: usize,
    count: usize,
    bound: BoundBox,
    children: Option<(NodeId, NodeId)>,
}

impl TreeNode {
    pub fn begin(&self) -> usize {
        self.begin
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn bound(&self) -> &BoundBox {
        &self.bound
    }

    pub fn is_leaf(&self) -> bool {
        self.children.is_none()
    }

    pub fn subtree_id(&self) -> SubtreeId {
        SubtreeId {
            begin: self.begin,
            count: self.count,
        }
    }
}

/// A local slice of a distributed spatial table: the owning rank, the number
/// of points it holds, and the tree built over them.
#[derive(Debug)]
pub struct Table {
    rank: usize,
    n_entries: usize,
    nodes: Vec<TreeNode>,
    root: NodeId,
}

impl Table {
    /// Build a balanced median-split tree over 1-D points.
    ///
    /// Recursion halves the point range until `leaf_capacity` is reached;
    /// each node's bound is the tight interval of its slice.
    pub fn build_1d(rank: usize, points: &[f64], leaf_capacity: usize) -> Self {
        assert!(!points.is_empty(), "cannot build a table over zero points");
        let mut sorted = points.to_vec();
        sorted.sort_by(f64::total_cmp);
        let mut nodes = Vec::new();
        let root = build_range(&mut nodes, &sorted, 0, sorted.len(), leaf_capacity.max(1));
        Self {
            rank,
            n_entries: sorted.len(),
            nodes,
            root,
        }
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn n_entries(&self) -> usize {
        self.n_entries
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    pub fn node(&self, id: NodeId) -> &TreeNode {
        &self.nodes[id.index()]
    }

    pub fn children(&self, id: NodeId) -> Option<(NodeId, NodeId)> {
        self.node(id).children
    }

    /// Locate the node with the given (begin, count) range, if any.
    pub fn find_by_begin_count(&self, begin: usize, count: usize) -> Option<NodeId> {
        let mut stack = vec![self.root];
        while let Some(id) = stack.pop() {
            let node = self.node(id);
            if node.begin == begin && node.count == count {
                return Some(id);
            }
            // Descend only where the target range can still fit.
            if begin < node.begin || begin + count > node.begin + node.count {
                continue;
            }
            if let Some((left, right)) = node.children {
                stack.push(left);
                stack.push(right);
            }
        }
        None
    }

    /// Cut the tree into at most `limit` subtrees covering every point.
    ///
    /// Repeatedly expands the widest non-leaf on the cut until the bound is
    /// reached or only leaves remain.
    pub fn frontier(&self, limit: usize) -> Vec<NodeId> {
        let limit = limit.max(1);
        let mut cut = vec![self.root];
        while cut.len() < limit {
            let mut widest: Option<(usize, usize)> = None;
            for (position, id) in cut.iter().enumerate() {
                let node = self.node(*id);
                if node.is_leaf() {
                    continue;
                }
                if widest.map_or(true, |(count, _)| node.count > count) {
                    widest = Some((node.count, position));
                }
            }
            let Some((_, position)) = widest else {
                break;
            };
            if let Some((left, right)) = self.children(cut[position]) {
                cut[position] = left;
                cut.push(right);
            }
        }
        cut
    }
}

fn build_range(
    nodes: &mut Vec<TreeNode>,
    points: &[f64],
    begin: usize,
    count: usize,
    leaf_capacity: usize,
) -> NodeId {
    let slice = &points[begin..begin + count];
    let lo = slice.iter().copied().fold(f64::INFINITY, f64::min);
    let hi = slice.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let bound = BoundBox::new(vec![lo], vec![hi]);
    let children = if count > leaf_capacity && count >= 2 {
        let half = count / 2;
        let left = build_range(nodes, points, begin, half, leaf_capacity);
        let right = build_range(nodes, points, begin + half, count - half, leaf_capacity);
        Some((left, right))
    } else {
        None
    };
    nodes.push(TreeNode {
        begin,
        count,
        bound,
        children,
    });
    NodeId::new(nodes.len() - 1)
}

/// A distributed table as seen from one process: the local slice plus the
/// per-rank entry counts needed for global work accounting.
#[derive(Debug)]
pub struct DistributedTable {
    local: std::sync::Arc<Table>,
    counts: Vec<u64>,
}

impl DistributedTable {
    pub fn new(local: std::sync::Arc<Table>, counts: Vec<u64>) -> Self {
        debug_assert_eq!(counts[local.rank()], local.n_entries() as u64);
        Self { local, counts }
    }

    pub fn local(&self) -> &std::sync::Arc<Table> {
        &self.local
    }

    /// Number of points owned by the given rank.
    pub fn n_entries(&self, rank: usize) -> u64 {
        self.counts[rank]
    }

    /// Number of points across every rank.
    pub fn total_entries(&self) -> u64 {
        self.counts.iter().sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uniform(n: usize, leaf_capacity: usize) -> Table {
        let points: Vec<f64> = (0..n).map(|i| i as f64).collect();
        Table::build_1d(0, &points, leaf_capacity)
    }

    #[test]
    fn root_covers_all_points() {
        let table = uniform(16, 2);
        let root = table.node(table.root());
        assert_eq!(root.begin(), 0);
        assert_eq!(root.count(), 16);
        assert!(!root.is_leaf());
    }

    #[test]
    fn leaves_respect_capacity() {
        let table = uniform(33, 4);
        let mut stack = vec![table.root()];
        while let Some(id) = stack.pop() {
            let node = table.node(id);
            if let Some((left, right)) = table.children(id) {
                let l = table.node(left);
                let r = table.node(right);
                assert_eq!(l.begin(), node.begin());
                assert_eq!(r.begin() + r.count(), node.begin() + node.count());
                stack.push(left);
                stack.push(right);
            } else {
                assert!(node.count() <= 4);
            }
        }
    }

    #[test]
    fn find_by_begin_count_locates_every_node() {
        let table = uniform(16, 2);
        let mut stack = vec![table.root()];
        while let Some(id) = stack.pop() {
            let node = table.node(id);
            assert_eq!(
                table.find_by_begin_count(node.begin(), node.count()),
                Some(id)
            );
            if let Some((left, right)) = table.children(id) {
                stack.push(left);
                stack.push(right);
            }
        }
        assert_eq!(table.find_by_begin_count(1, 3), None);
    }

    #[test]
    fn frontier_is_bounded_and_covers() {
        let table = uniform(64, 1);
        for limit in [1, 2, 3, 5, 8] {
            let cut = table.frontier(limit);
            assert!(cut.len() <= limit);
            let covered: usize = cut.iter().map(|id| table.node(*id).count()).sum();
            assert_eq!(covered, 64);
        }
    }

    #[test]
    fn frontier_stops_at_leaves() {
        let table = uniform(4, 2);
        let cut = table.frontier(16);
        assert_eq!(cut.len(), 2);
        assert!(cut.iter().all(|id| table.node(*id).is_leaf()));
    }

    #[test]
    fn distributed_totals_sum_over_ranks() {
        let local = std::sync::Arc::new(uniform(10, 2));
        let table = DistributedTable::new(local, vec![10, 22, 8]);
        assert_eq!(table.n_entries(1), 22);
        assert_eq!(table.total_entries(), 40);
    }
}
