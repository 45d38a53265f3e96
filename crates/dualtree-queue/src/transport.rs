//! The table-exchange seam.
//!
//! The queue never talks to the network itself; it drives a [`Transport`]
//! that ships reference subtables between processes, pins received
//! subtables in a reference-counted cache, and participates in distributed
//! termination accounting. The transport's concurrency is opaque here —
//! every call into it happens under the queue's nested lock.

use std::sync::Arc;

use crate::error::QueueResult;
use crate::table::{DistributedTable, Table};
use crate::task::CacheSlot;

/// Distributed world descriptor: this process's rank and the world size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorldInfo {
    pub rank: usize,
    pub size: usize,
}

impl WorldInfo {
    /// A one-process world, the common fixture for in-process runs.
    pub fn single() -> Self {
        Self { rank: 0, size: 1 }
    }
}

/// A reference subtable delivered by the transport.
///
/// `slot` pins the subtable in the receive cache; when the transport has no
/// pinned copy the (begin, count) pair resolves against the local reference
/// table instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Arrival {
    pub rank: usize,
    pub begin: usize,
    pub count: usize,
    pub slot: CacheSlot,
}

/// An outbound reference subtree queued for routing to peer ranks.
#[derive(Debug, Clone)]
pub struct RouteRequest {
    pub destinations: Vec<usize>,
    pub begin: usize,
    pub count: usize,
}

/// Contract the queue consumes from the table-exchange layer.
///
/// Every `lock_cache(slot, k)` issued by the queue is balanced by exactly
/// `k` later `release_cache(slot, 1)` calls; a slot whose count reaches zero
/// becomes evictable. Implementations must tolerate being called re-entrantly
/// from the thread that is currently inside [`Transport::send_receive`].
pub trait Transport: Send + Sync {
    /// Called once while the queue is constructed.
    fn init(
        &self,
        world: &WorldInfo,
        query: &DistributedTable,
        reference: &DistributedTable,
    ) -> QueueResult<()>;

    /// Progress outbound routing and collect newly arrived subtables.
    fn send_receive(
        &self,
        thread_id: usize,
        outbound: &mut Vec<RouteRequest>,
    ) -> QueueResult<Vec<Arrival>>;

    /// The subtable pinned in `slot`, or `None` when the slot denotes local
    /// data.
    fn find_subtable(&self, slot: CacheSlot) -> Option<Arc<Table>>;

    /// This process's slice of the reference table.
    fn local_table(&self) -> Arc<Table>;

    /// Add `n` references to a pinned slot.
    fn lock_cache(&self, slot: CacheSlot, n: u32);

    /// Return `n` references to a pinned slot. Fails with
    /// [`QueueError::RefcountUnderflow`](crate::error::QueueError) if the
    /// count would go below zero.
    fn release_cache(&self, slot: CacheSlot, n: u32) -> QueueResult<()>;

    /// Report `quantity` units of retired computation for distributed
    /// termination accounting.
    fn push_completed_computation(&self, quantity: u64);

    /// Whether the transport itself is drained: nothing in flight, nothing
    /// pinned that peers still need.
    fn can_terminate(&self) -> bool;
}
