//! Shared-memory task queue for distributed dual-tree algorithms.
//!
//! Nearest-neighbor and kernel-summation algorithms over spatial trees work
//! in (query node, reference node) pairs. In a distributed run each process
//! owns a slice of the query tree and a slice of the reference tree;
//! reference subtables stream in asynchronously from peers while local
//! query subtrees are farmed out to a pool of worker threads. This crate
//! provides the per-process scheduler that sits between the two:
//!
//! - a dynamic forest of query subtrees, each with its own priority queue
//!   of pending pairs, nearest pairs first;
//! - per-subtree [`DisjointIntervals`] bookkeeping so re-delivered
//!   reference subtables never create duplicate work;
//! - a reference-count contract with the transport's receive cache, one
//!   reference per live task per slot;
//! - dynamic splitting of an overloaded query subtree when workers contend,
//!   and compaction of drained subtrees;
//! - the local half of distributed termination detection.
//!
//! The tree construction, the distance kernel and the wire transport are
//! collaborators behind the [`Metric`] and [`Transport`] traits; see
//! [`test_support`] for in-process stand-ins.
//!
//! All scheduler state lives behind one re-entrant lock, so any number of
//! worker threads plus a communication thread may share a
//! [`DualtreeTaskQueue`] directly.

pub mod error;
pub mod intervals;
pub mod metric;
pub mod table;
pub mod task;
pub mod test_support;
pub mod transport;

mod task_queue;

pub use error::{QueueError, QueueResult};
pub use intervals::DisjointIntervals;
pub use metric::{BoundBox, DistRange, Metric, SquaredEuclidean};
pub use table::{DistributedTable, NodeId, SubtreeId, Table, TreeNode};
pub use task::{CacheSlot, Task, TaskHeap};
pub use task_queue::{DualtreeTaskQueue, QueueSnapshot, SubtreeSnapshot};
pub use transport::{Arrival, RouteRequest, Transport, WorldInfo};
