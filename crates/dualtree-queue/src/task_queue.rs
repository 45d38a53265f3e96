//! The per-process dual-tree task queue.
//!
//! One instance is shared by every worker thread and the communication
//! thread of a process. It maintains a forest of query subtrees, a priority
//! queue of (query, reference) tasks per subtree, and the work accounting
//! that feeds distributed termination. Reference subtables arrive through
//! the transport; query subtrees are local and are split dynamically when
//! workers contend for them.
//!
//! # Locking
//!
//! All public operations run under one nested lock. The lock must be
//! re-entrant: [`DualtreeTaskQueue::send_receive`] calls the transport and
//! then feeds the returned arrivals to [`DualtreeTaskQueue::generate_tasks`]
//! on the same thread, which acquires the lock again. The `RefCell` inside
//! the lock is only borrowed for state mutation, never across a nested
//! acquisition, so the re-entry borrows cleanly.
//!
//! No method blocks waiting for work; `dequeue` returns `None` when nothing
//! is runnable and workers poll.

use std::cell::RefCell;
use std::sync::Arc;

use ordered_float::OrderedFloat;
use parking_lot::ReentrantMutex;
use tracing::{debug, trace};

use crate::error::{QueueError, QueueResult};
use crate::intervals::DisjointIntervals;
use crate::metric::Metric;
use crate::table::{DistributedTable, NodeId, SubtreeId, Table};
use crate::task::{CacheSlot, Task, TaskHeap};
use crate::transport::{Arrival, RouteRequest, Transport, WorldInfo};

/// Forest entry for one live query subtree.
#[derive(Debug)]
struct SubtreeSlot {
    node: NodeId,
    locked: bool,
    tasks: TaskHeap,
    assigned: DisjointIntervals,
    /// Reference-point comparisons still owed by this subtree. Zero means
    /// the slot is drained and eligible for compaction.
    remaining: u64,
}

#[derive(Debug)]
struct Forest {
    slots: Vec<SubtreeSlot>,
    num_remaining_tasks: usize,
    remaining_global_computation: u64,
    remaining_local_computation: u64,
    split_requested: bool,
}

impl Forest {
    fn find_slot(&self, query_table: &Table, id: SubtreeId) -> Option<usize> {
        self.slots
            .iter()
            .position(|slot| query_table.node(slot.node).subtree_id() == id)
    }

    fn debug_check_task_count(&self) {
        debug_assert_eq!(
            self.slots.iter().map(|slot| slot.tasks.len()).sum::<usize>(),
            self.num_remaining_tasks,
        );
    }
}

/// Pop the top task of one slot, optionally leaving the subtree locked for
/// the caller. Shared by the public targeted dequeue and the splitter's
/// drain, so counters stay consistent on every path.
fn dequeue_slot(forest: &mut Forest, index: usize, lock_subtree: bool) -> Option<Task> {
    let slot = forest.slots.get_mut(index)?;
    if slot.locked || slot.tasks.is_empty() {
        return None;
    }
    let task = slot.tasks.pop()?;
    slot.locked = lock_subtree;
    forest.num_remaining_tasks -= 1;
    Some(task)
}

/// Point-in-time view of the queue, for diagnostics and tests.
#[derive(Debug, Clone)]
pub struct QueueSnapshot {
    pub subtrees: Vec<SubtreeSnapshot>,
    pub num_remaining_tasks: usize,
    pub remaining_global_computation: u64,
    pub remaining_local_computation: u64,
    pub split_requested: bool,
}

/// Per-subtree portion of a [`QueueSnapshot`].
#[derive(Debug, Clone, Copy)]
pub struct SubtreeSnapshot {
    pub id: SubtreeId,
    pub locked: bool,
    pub queued_tasks: usize,
    pub remaining_work: u64,
}

/// Shared-memory dual-tree task queue for one process of a distributed run.
///
/// Workers call [`dequeue`](Self::dequeue), run the pair kernel outside the
/// queue, then retire through
/// [`push_completed_computation`](Self::push_completed_computation) and
/// [`release_cache`](Self::release_cache). The communication thread pumps
/// [`send_receive`](Self::send_receive). Indices returned by dequeues are
/// invalidated by compaction; name subtrees by [`SubtreeId`] across calls.
pub struct DualtreeTaskQueue<T: Transport> {
    state: ReentrantMutex<RefCell<Forest>>,
    transport: T,
    query: Arc<DistributedTable>,
}

impl<T: Transport> DualtreeTaskQueue<T> {
    /// Build the initial forest and hand the transport its tables.
    ///
    /// The local query tree is cut into at most `num_threads` subtrees, each
    /// owing one comparison per reference point in the world; the global and
    /// local computation counters start at the full cross product.
    pub fn new(
        world: WorldInfo,
        query: Arc<DistributedTable>,
        reference: Arc<DistributedTable>,
        num_threads: usize,
        transport: T,
    ) -> QueueResult<Self> {
        transport.init(&world, &query, &reference)?;

        let total_query = query.total_entries();
        let total_reference = reference.total_entries();
        let local_query = query.local().n_entries() as u64;

        let slots: Vec<SubtreeSlot> = query
            .local()
            .frontier(num_threads)
            .into_iter()
            .map(|node| SubtreeSlot {
                node,
                locked: false,
                tasks: TaskHeap::new(),
                assigned: DisjointIntervals::new(world.size),
                remaining: total_reference,
            })
            .collect();
        debug!(
            subtrees = slots.len(),
            global = total_query * total_reference,
            "initialized dual-tree task queue"
        );

        Ok(Self {
            state: ReentrantMutex::new(RefCell::new(Forest {
                slots,
                num_remaining_tasks: 0,
                remaining_global_computation: total_query * total_reference,
                remaining_local_computation: local_query * total_reference,
                split_requested: false,
            })),
            transport,
            query,
        })
    }

    /// The transport this queue drives.
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Cross a batch of arrived reference subtables with every live query
    /// subtree.
    ///
    /// Each (subtree, arrival) pair first passes through the subtree's
    /// disjoint-interval set; only a first-time interval enqueues a task and
    /// takes one reference on the arrival's cache slot. Re-deliveries are
    /// no-ops per subtree.
    pub fn generate_tasks<M: Metric>(&self, metric: &M, arrivals: &[Arrival]) -> QueueResult<()> {
        let state = self.state.lock();
        let mut forest = state.borrow_mut();
        let mut created = 0usize;
        for arrival in arrivals {
            let (reference_table, reference) = match self.transport.find_subtable(arrival.slot) {
                Some(table) => {
                    let root = table.root();
                    (table, root)
                }
                None => {
                    let table = self.transport.local_table();
                    let node = table
                        .find_by_begin_count(arrival.begin, arrival.count)
                        .ok_or(QueueError::UnknownSubtree {
                            begin: arrival.begin,
                            count: arrival.count,
                        })?;
                    (table, node)
                }
            };
            let rank = reference_table.rank();
            let begin = arrival.begin as u64;
            let end = begin + arrival.count as u64;
            for index in 0..forest.slots.len() {
                if forest.slots[index].assigned.insert(rank, begin, end)? {
                    self.push_task(
                        &mut forest,
                        metric,
                        index,
                        &reference_table,
                        reference,
                        arrival.slot,
                    );
                    self.transport.lock_cache(arrival.slot, 1);
                    created += 1;
                }
            }
        }
        trace!(arrivals = arrivals.len(), tasks = created, "generated tasks");
        forest.debug_check_task_count();
        Ok(())
    }

    /// Take the best task from the first unlocked subtree that has one.
    ///
    /// Drained subtrees (empty queue, zero remaining work) encountered
    /// during the scan are compacted by swap-with-last, and the swapped-in
    /// slot is probed at the same index before the scan advances. Returns
    /// `None` when nothing is runnable; if every non-empty subtree was
    /// locked, the caller should [`request_split`](Self::request_split).
    ///
    /// The returned index is valid only until the next queue call.
    pub fn dequeue(&self, lock_subtree: bool) -> Option<(Task, usize)> {
        let state = self.state.lock();
        let mut forest = state.borrow_mut();
        let mut index = 0;
        while index < forest.slots.len() {
            if !forest.slots[index].tasks.is_empty() {
                if !forest.slots[index].locked {
                    if let Some(task) = dequeue_slot(&mut forest, index, lock_subtree) {
                        return Some((task, index));
                    }
                }
            } else if forest.slots[index].remaining == 0 {
                let removed = forest.slots.swap_remove(index);
                debug_assert!(removed.tasks.is_empty());
                trace!(index, "compacted drained query subtree");
                // Re-probe the slot swapped into this index.
                continue;
            }
            index += 1;
        }
        None
    }

    /// Take the best task from one specific subtree. No compaction.
    pub fn dequeue_from(&self, index: usize, lock_subtree: bool) -> Option<(Task, usize)> {
        let state = self.state.lock();
        let mut forest = state.borrow_mut();
        dequeue_slot(&mut forest, index, lock_subtree).map(|task| (task, index))
    }

    /// Clear the worker-exclusive lock on a subtree.
    pub fn unlock_subtree(&self, id: SubtreeId) -> QueueResult<()> {
        let state = self.state.lock();
        let mut forest = state.borrow_mut();
        let index = forest
            .find_slot(self.query.local(), id)
            .ok_or(QueueError::UnknownSubtree {
                begin: id.begin,
                count: id.count,
            })?;
        forest.slots[index].locked = false;
        Ok(())
    }

    /// Stable handle for the query subtree a task was dequeued from.
    pub fn subtree_id_of(&self, task: &Task) -> SubtreeId {
        self.query.local().node(task.query).subtree_id()
    }

    /// Retire `quantity` units of computation done for one query subtree
    /// against `reference_count` reference points.
    ///
    /// Decrements the global and the local counters unconditionally, even
    /// when the retired work originated on a remote rank, and forwards the
    /// quantity to the transport for distributed termination accounting.
    pub fn push_completed_computation(
        &self,
        id: SubtreeId,
        reference_count: u64,
        quantity: u64,
    ) -> QueueResult<()> {
        let state = self.state.lock();
        let mut forest = state.borrow_mut();
        let index = forest
            .find_slot(self.query.local(), id)
            .ok_or(QueueError::UnknownSubtree {
                begin: id.begin,
                count: id.count,
            })?;
        forest.remaining_global_computation -= quantity;
        forest.remaining_local_computation -= quantity;
        self.transport.push_completed_computation(quantity);
        forest.slots[index].remaining -= reference_count;
        Ok(())
    }

    /// Retire work that applies to every live subtree, used when a globally
    /// pruned region completes.
    pub fn push_completed_computation_all(&self, reference_count: u64, quantity: u64) {
        let state = self.state.lock();
        let mut forest = state.borrow_mut();
        forest.remaining_global_computation -= quantity;
        forest.remaining_local_computation -= quantity;
        self.transport.push_completed_computation(quantity);
        for slot in &mut forest.slots {
            slot.remaining -= reference_count;
        }
    }

    /// Pump the transport and enqueue whatever arrived.
    ///
    /// Holds the nested lock across the transport call; the follow-up
    /// [`generate_tasks`](Self::generate_tasks) re-acquires it on the same
    /// thread. Tasks enqueued here are visible to the next dequeue that
    /// takes the lock.
    pub fn send_receive<M: Metric>(
        &self,
        thread_id: usize,
        metric: &M,
        outbound: &mut Vec<RouteRequest>,
    ) -> QueueResult<()> {
        let _guard = self.state.lock();
        let arrivals = self.transport.send_receive(thread_id, outbound)?;
        if arrivals.is_empty() {
            return Ok(());
        }
        self.generate_tasks(metric, &arrivals)
    }

    /// Return `n` references on a cache slot, under the nested lock.
    pub fn release_cache(&self, slot: CacheSlot, n: u32) -> QueueResult<()> {
        let _guard = self.state.lock();
        self.transport.release_cache(slot, n)
    }

    /// Ask for an overloaded subtree to be split at the next
    /// [`redistribute_among_cores`](Self::redistribute_among_cores).
    ///
    /// The flag is sticky: only `redistribute_among_cores` clears it.
    pub fn request_split(&self) {
        let state = self.state.lock();
        state.borrow_mut().split_requested = true;
    }

    /// Split one query subtree in two if a split was requested.
    ///
    /// Among subtrees that are unlocked, non-leaf and have pending tasks,
    /// the one with the most query points wins, lowest index on ties. The
    /// chosen slot keeps the left child; the right child is appended at the
    /// end of the forest with a snapshot of the committed work. Pending
    /// tasks are re-enqueued against both halves, which multiplies the
    /// references held on their cache slots (see `split_slot`).
    pub fn redistribute_among_cores<M: Metric>(&self, metric: &M) {
        let state = self.state.lock();
        let mut forest = state.borrow_mut();
        if !forest.split_requested {
            return;
        }
        let query_table = self.query.local();
        let mut best: Option<(usize, usize)> = None;
        for (index, slot) in forest.slots.iter().enumerate() {
            if slot.locked || slot.tasks.is_empty() {
                continue;
            }
            let node = query_table.node(slot.node);
            if node.is_leaf() {
                continue;
            }
            if best.map_or(true, |(count, _)| node.count() > count) {
                best = Some((node.count(), index));
            }
        }
        if let Some((count, index)) = best {
            debug!(index, count, "splitting query subtree");
            self.split_slot(&mut forest, metric, index);
        }
        forest.split_requested = false;
        forest.debug_check_task_count();
    }

    /// Local termination predicate composed with the transport's.
    pub fn can_terminate(&self) -> bool {
        let state = self.state.lock();
        let drained = state.borrow().remaining_global_computation == 0;
        drained && self.transport.can_terminate()
    }

    /// Number of tasks queued across all subtrees.
    pub fn num_remaining_tasks(&self) -> usize {
        let state = self.state.lock();
        let count = state.borrow().num_remaining_tasks;
        count
    }

    /// Whether no task is queued anywhere.
    pub fn is_empty(&self) -> bool {
        self.num_remaining_tasks() == 0
    }

    /// Number of live query subtrees.
    pub fn num_subtrees(&self) -> usize {
        let state = self.state.lock();
        let count = state.borrow().slots.len();
        count
    }

    /// Consistent snapshot of the forest and its counters.
    pub fn snapshot(&self) -> QueueSnapshot {
        let state = self.state.lock();
        let forest = state.borrow();
        let query_table = self.query.local();
        QueueSnapshot {
            subtrees: forest
                .slots
                .iter()
                .map(|slot| SubtreeSnapshot {
                    id: query_table.node(slot.node).subtree_id(),
                    locked: slot.locked,
                    queued_tasks: slot.tasks.len(),
                    remaining_work: slot.remaining,
                })
                .collect(),
            num_remaining_tasks: forest.num_remaining_tasks,
            remaining_global_computation: forest.remaining_global_computation,
            remaining_local_computation: forest.remaining_local_computation,
            split_requested: forest.split_requested,
        }
    }

    /// Compute a task's priority against the subtree's current root and
    /// enqueue it.
    fn push_task<M: Metric>(
        &self,
        forest: &mut Forest,
        metric: &M,
        index: usize,
        reference_table: &Arc<Table>,
        reference: NodeId,
        cache_slot: CacheSlot,
    ) {
        let query_bound = self.query.local().node(forest.slots[index].node).bound();
        let reference_bound = reference_table.node(reference).bound();
        let range = metric.range_distance_sq(query_bound, reference_bound);
        let slot = &mut forest.slots[index];
        slot.tasks.push(Task {
            query: slot.node,
            reference_table: Arc::clone(reference_table),
            reference,
            cache_slot,
            priority: OrderedFloat(-range.mid()),
        });
        forest.num_remaining_tasks += 1;
    }

    /// Structural split of slot `index` into its two children.
    ///
    /// Pending tasks are drained through the targeted dequeue (so the task
    /// counter stays exact) and re-enqueued against both halves. A task
    /// whose reference node is the pre-split query node itself forces the
    /// reference side to split too: it becomes four child-pair tasks and
    /// takes three additional references on its slot. Every other task
    /// becomes two and takes one.
    fn split_slot<M: Metric>(&self, forest: &mut Forest, metric: &M, index: usize) {
        let query_table = self.query.local();
        let prev = forest.slots[index].node;
        let Some((left, right)) = query_table.children(prev) else {
            return;
        };
        forest.slots[index].node = left;

        let mut drained = Vec::with_capacity(forest.slots[index].tasks.len());
        while let Some(task) = dequeue_slot(forest, index, false) {
            drained.push(task);
        }

        let assigned = forest.slots[index].assigned.clone();
        let remaining = forest.slots[index].remaining;
        forest.slots.push(SubtreeSlot {
            node: right,
            locked: false,
            tasks: TaskHeap::new(),
            assigned,
            remaining,
        });
        let right_index = forest.slots.len() - 1;

        for task in drained {
            let mirrors_query = Arc::ptr_eq(&task.reference_table, query_table)
                && task.reference == prev
                && !task.reference_table.node(task.reference).is_leaf();
            if mirrors_query {
                // The reference node is the node being split; reuse its
                // children for the reference side as well.
                for half in [index, right_index] {
                    self.push_task(
                        forest,
                        metric,
                        half,
                        &task.reference_table,
                        left,
                        task.cache_slot,
                    );
                    self.push_task(
                        forest,
                        metric,
                        half,
                        &task.reference_table,
                        right,
                        task.cache_slot,
                    );
                }
                // One reference came in with the drained task; three more
                // tasks now exist against its slot.
                self.transport.lock_cache(task.cache_slot, 3);
            } else {
                for half in [index, right_index] {
                    self.push_task(
                        forest,
                        metric,
                        half,
                        &task.reference_table,
                        task.reference,
                        task.cache_slot,
                    );
                }
                self.transport.lock_cache(task.cache_slot, 1);
            }
        }
    }
}
