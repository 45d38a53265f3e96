//! In-memory transport and table fixtures for tests and examples.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::error::{QueueError, QueueResult};
use crate::table::{DistributedTable, Table};
use crate::task::CacheSlot;
use crate::transport::{Arrival, RouteRequest, Transport, WorldInfo};

/// Lock/release ledger for one cache slot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SlotLedger {
    pub locks: u64,
    pub releases: u64,
}

impl SlotLedger {
    /// References currently held against the slot.
    pub fn live(&self) -> i64 {
        self.locks as i64 - self.releases as i64
    }
}

/// Transport double that scripts arrivals and audits cache refcounting.
///
/// `send_receive` pops pre-queued arrival batches; `lock_cache` and
/// `release_cache` maintain a per-slot ledger the tests assert against.
/// `can_terminate` reports whether the retired-quantity accumulator reached
/// the configured drain target.
pub struct MockTransport {
    local: Arc<Table>,
    subtables: Mutex<HashMap<CacheSlot, Arc<Table>>>,
    ledger: Mutex<BTreeMap<CacheSlot, SlotLedger>>,
    lock_calls: Mutex<Vec<(CacheSlot, u32)>>,
    pending: Mutex<VecDeque<Vec<Arrival>>>,
    completed: AtomicU64,
    drain_target: u64,
}

impl MockTransport {
    /// A transport whose local reference table is `local` and which is
    /// drained from the start.
    pub fn new(local: Arc<Table>) -> Self {
        Self::with_drain_target(local, 0)
    }

    /// A transport that refuses to terminate until `drain_target` units of
    /// completed computation have been pushed through it.
    pub fn with_drain_target(local: Arc<Table>, drain_target: u64) -> Self {
        Self {
            local,
            subtables: Mutex::new(HashMap::new()),
            ledger: Mutex::new(BTreeMap::new()),
            lock_calls: Mutex::new(Vec::new()),
            pending: Mutex::new(VecDeque::new()),
            completed: AtomicU64::new(0),
            drain_target,
        }
    }

    /// Pin a remote subtable under `slot`.
    pub fn pin_subtable(&self, slot: CacheSlot, table: Arc<Table>) {
        self.subtables.lock().insert(slot, table);
    }

    /// Queue a batch of arrivals for the next `send_receive`.
    pub fn queue_arrivals(&self, batch: Vec<Arrival>) {
        self.pending.lock().push_back(batch);
    }

    /// The lock/release ledger for one slot.
    pub fn ledger(&self, slot: CacheSlot) -> SlotLedger {
        self.ledger.lock().get(&slot).copied().unwrap_or_default()
    }

    /// Every `lock_cache` call in order, with its count.
    pub fn lock_calls(&self) -> Vec<(CacheSlot, u32)> {
        self.lock_calls.lock().clone()
    }

    /// Total quantity retired through the transport.
    pub fn completed_quantity(&self) -> u64 {
        self.completed.load(Ordering::SeqCst)
    }

    /// True when every slot's references have been returned.
    pub fn all_slots_released(&self) -> bool {
        self.ledger.lock().values().all(|ledger| ledger.live() == 0)
    }
}

impl Transport for MockTransport {
    fn init(
        &self,
        _world: &WorldInfo,
        _query: &DistributedTable,
        _reference: &DistributedTable,
    ) -> QueueResult<()> {
        Ok(())
    }

    fn send_receive(
        &self,
        _thread_id: usize,
        _outbound: &mut Vec<RouteRequest>,
    ) -> QueueResult<Vec<Arrival>> {
        Ok(self.pending.lock().pop_front().unwrap_or_default())
    }

    fn find_subtable(&self, slot: CacheSlot) -> Option<Arc<Table>> {
        self.subtables.lock().get(&slot).cloned()
    }

    fn local_table(&self) -> Arc<Table> {
        Arc::clone(&self.local)
    }

    fn lock_cache(&self, slot: CacheSlot, n: u32) {
        self.ledger.lock().entry(slot).or_default().locks += n as u64;
        self.lock_calls.lock().push((slot, n));
    }

    fn release_cache(&self, slot: CacheSlot, n: u32) -> QueueResult<()> {
        let mut ledger = self.ledger.lock();
        let entry = ledger.entry(slot).or_default();
        if entry.live() < n as i64 {
            return Err(QueueError::RefcountUnderflow { slot });
        }
        entry.releases += n as u64;
        Ok(())
    }

    fn push_completed_computation(&self, quantity: u64) {
        self.completed.fetch_add(quantity, Ordering::SeqCst);
    }

    fn can_terminate(&self) -> bool {
        self.completed.load(Ordering::SeqCst) >= self.drain_target
    }
}

/// Table over `n` unit-spaced 1-D points on `rank`.
pub fn uniform_table(rank: usize, n: usize, leaf_capacity: usize) -> Arc<Table> {
    let points: Vec<f64> = (0..n).map(|i| i as f64).collect();
    Arc::new(Table::build_1d(rank, &points, leaf_capacity))
}

/// Wrap a local table as the only slice of a one-rank distributed table.
pub fn single_rank(table: &Arc<Table>) -> Arc<DistributedTable> {
    Arc::new(DistributedTable::new(
        Arc::clone(table),
        vec![table.n_entries() as u64],
    ))
}
