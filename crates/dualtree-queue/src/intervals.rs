//! Disjoint-interval bookkeeping for assigned reference work.
//!
//! Each query subtree remembers which reference intervals it has already
//! scheduled, so repeated deliveries of the same subtable never enqueue
//! duplicate tasks. Intervals are half-open over the per-rank point space.

use std::collections::BTreeMap;

use crate::error::{QueueError, QueueResult};

/// Set of non-overlapping half-open intervals keyed by rank, with an
/// idempotent insert.
///
/// Cloning produces an independent snapshot; the splitter relies on this so
/// both halves of a split subtree inherit the committed work.
#[derive(Debug, Clone)]
pub struct DisjointIntervals {
    // begin -> end, non-overlapping by construction.
    per_rank: Vec<BTreeMap<u64, u64>>,
}

impl DisjointIntervals {
    /// Create an empty set covering `world_size` ranks.
    pub fn new(world_size: usize) -> Self {
        Self {
            per_rank: vec![BTreeMap::new(); world_size],
        }
    }

    /// Record `[begin, end)` on `rank` iff it overlaps nothing recorded
    /// there before.
    ///
    /// Returns `true` and inserts on success; returns `false` and leaves the
    /// set untouched when any previously recorded interval overlaps the
    /// request in part or whole. An empty or reversed interval is a fatal
    /// programmer error.
    ///
    /// # Panics
    ///
    /// Panics if `rank` is outside the world this set was created for.
    pub fn insert(&mut self, rank: usize, begin: u64, end: u64) -> QueueResult<bool> {
        if begin >= end {
            return Err(QueueError::InvalidInterval { rank, begin, end });
        }
        let map = &mut self.per_rank[rank];
        if let Some((_, &prev_end)) = map.range(..=begin).next_back() {
            if prev_end > begin {
                return Ok(false);
            }
        }
        if let Some((&next_begin, _)) = map.range(begin..).next() {
            if next_begin < end {
                return Ok(false);
            }
        }
        map.insert(begin, end);
        Ok(true)
    }

    /// Total number of recorded intervals across all ranks.
    pub fn len(&self) -> usize {
        self.per_rank.iter().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.per_rank.iter().all(BTreeMap::is_empty)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disjoint_inserts_succeed() {
        let mut set = DisjointIntervals::new(1);
        assert!(set.insert(0, 0, 10).expect("insert"));
        assert!(set.insert(0, 10, 20).expect("insert"));
        assert!(set.insert(0, 30, 40).expect("insert"));
        assert_eq!(set.len(), 3);
    }

    #[test]
    fn reinsert_is_idempotent() {
        let mut set = DisjointIntervals::new(1);
        assert!(set.insert(0, 5, 15).expect("insert"));
        assert!(!set.insert(0, 5, 15).expect("insert"));
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn partial_overlap_is_rejected() {
        let mut set = DisjointIntervals::new(1);
        assert!(set.insert(0, 10, 20).expect("insert"));
        assert!(!set.insert(0, 15, 25).expect("insert"));
        assert!(!set.insert(0, 5, 11).expect("insert"));
        assert!(!set.insert(0, 12, 18).expect("insert"));
        assert!(!set.insert(0, 0, 40).expect("insert"));
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn adjacent_intervals_do_not_collide() {
        let mut set = DisjointIntervals::new(1);
        assert!(set.insert(0, 10, 20).expect("insert"));
        assert!(set.insert(0, 20, 30).expect("insert"));
        assert!(set.insert(0, 0, 10).expect("insert"));
    }

    #[test]
    fn ranks_are_independent() {
        let mut set = DisjointIntervals::new(3);
        assert!(set.insert(0, 0, 10).expect("insert"));
        assert!(set.insert(1, 0, 10).expect("insert"));
        assert!(set.insert(2, 5, 8).expect("insert"));
        assert!(!set.insert(1, 5, 8).expect("insert"));
    }

    #[test]
    fn reversed_or_empty_interval_errors() {
        let mut set = DisjointIntervals::new(1);
        assert!(matches!(
            set.insert(0, 8, 8),
            Err(QueueError::InvalidInterval { .. })
        ));
        assert!(matches!(
            set.insert(0, 9, 3),
            Err(QueueError::InvalidInterval { .. })
        ));
        assert!(set.is_empty());
    }

    #[test]
    fn clone_is_an_independent_snapshot() {
        let mut set = DisjointIntervals::new(1);
        assert!(set.insert(0, 0, 10).expect("insert"));
        let mut snapshot = set.clone();
        assert!(snapshot.insert(0, 10, 20).expect("insert"));
        assert!(!snapshot.insert(0, 0, 10).expect("insert"));
        // The original never saw the snapshot's insert.
        assert!(set.insert(0, 10, 20).expect("insert"));
    }

    #[test]
    fn insertion_order_does_not_matter_for_disjoint_inputs() {
        use rand::seq::SliceRandom;

        let intervals: Vec<(u64, u64)> = (0..32).map(|i| (i * 10, i * 10 + 7)).collect();
        let mut rng = rand::thread_rng();
        for _ in 0..16 {
            let mut shuffled = intervals.clone();
            shuffled.shuffle(&mut rng);
            let mut set = DisjointIntervals::new(1);
            for (begin, end) in shuffled {
                assert!(set.insert(0, begin, end).expect("insert"));
            }
            assert_eq!(set.len(), intervals.len());
        }
    }
}
