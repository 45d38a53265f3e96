//! Tasks and the per-subtree priority queue.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::fmt::{Display, Formatter};
use std::sync::Arc;

use ordered_float::OrderedFloat;

use crate::table::{NodeId, Table};

/// Names a reference subtable pinned in the transport's receive cache.
///
/// The transport reference-counts each slot; the queue holds one reference
/// per live task against the slot and returns it when the task is retired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheSlot(u64);

impl CacheSlot {
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    pub const fn get(self) -> u64 {
        self.0
    }
}

impl Display for CacheSlot {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One unit of schedulable work: a (query subtree, reference subtree) pair.
///
/// The reference table is carried in the task so retirement and splitting
/// can resolve the reference node without consulting the transport again.
#[derive(Debug, Clone)]
pub struct Task {
    /// Root of the query subtree this task belongs to, in the local query
    /// table.
    pub query: NodeId,
    /// Table holding the reference node: the local reference table, or a
    /// pinned remote subtable.
    pub reference_table: Arc<Table>,
    /// Reference node within `reference_table`.
    pub reference: NodeId,
    /// Cache slot whose pinned subtable backs this task.
    pub cache_slot: CacheSlot,
    /// Negated midpoint of the query/reference distance range. Higher means
    /// nearer, and nearer pairs prune more when processed early.
    pub priority: OrderedFloat<f64>,
}

struct HeapEntry {
    priority: OrderedFloat<f64>,
    seq: u64,
    task: Task,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Max-heap on priority; earlier insertion wins ties.
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Max-heap of tasks for one query subtree, nearest pairs first, FIFO on
/// equal priority.
#[derive(Default)]
pub struct TaskHeap {
    entries: BinaryHeap<HeapEntry>,
    next_seq: u64,
}

impl TaskHeap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, task: Task) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.entries.push(HeapEntry {
            priority: task.priority,
            seq,
            task,
        });
    }

    pub fn peek(&self) -> Option<&Task> {
        self.entries.peek().map(|entry| &entry.task)
    }

    pub fn pop(&mut self) -> Option<Task> {
        self.entries.pop().map(|entry| entry.task)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl std::fmt::Debug for TaskHeap {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskHeap")
            .field("len", &self.entries.len())
            .finish()
    }
}
