use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use dualtree_queue::test_support::{MockTransport, single_rank, uniform_table};
use dualtree_queue::{Arrival, CacheSlot, DualtreeTaskQueue, SquaredEuclidean, WorldInfo};

const METRIC: SquaredEuclidean = SquaredEuclidean;
const DEADLINE: Duration = Duration::from_secs(30);

fn arrival(begin: usize, count: usize, slot: u64) -> Arrival {
    Arrival {
        rank: 0,
        begin,
        count,
        slot: CacheSlot::new(slot),
    }
}

/// Worker pool plus a communication thread drain a full cross product; the
/// run must terminate with every cache reference returned.
#[test]
fn worker_pool_drains_to_termination() {
    let query = uniform_table(0, 64, 4);
    let reference = uniform_table(0, 32, 8);
    let total_work = 64 * 32;
    let transport = MockTransport::with_drain_target(Arc::clone(&reference), total_work);
    let queue = DualtreeTaskQueue::new(
        WorldInfo::single(),
        single_rank(&query),
        single_rank(&reference),
        4,
        transport,
    )
    .expect("queue init");
    assert_eq!(queue.num_subtrees(), 4);

    // One batch per reference leaf range.
    for (slot, begin) in [(1u64, 0usize), (2, 8), (3, 16), (4, 24)] {
        queue.transport().queue_arrivals(vec![arrival(begin, 8, slot)]);
    }

    let start = Instant::now();
    thread::scope(|scope| {
        // Communication thread: pump until all four batches landed.
        scope.spawn(|| {
            for _ in 0..4 {
                queue
                    .send_receive(0, &METRIC, &mut Vec::new())
                    .expect("send_receive");
            }
        });

        for _ in 0..3 {
            scope.spawn(|| {
                while !queue.can_terminate() {
                    assert!(start.elapsed() < DEADLINE, "drain did not terminate");
                    let Some((task, _)) = queue.dequeue(true) else {
                        thread::yield_now();
                        continue;
                    };
                    let id = queue.subtree_id_of(&task);
                    let reference_count =
                        task.reference_table.node(task.reference).count() as u64;
                    let quantity = id.count as u64 * reference_count;
                    // Unlock before retiring: once the retirement drops the
                    // subtree's remaining work to zero, any dequeue may
                    // compact the slot away. The cache reference is returned
                    // only after the task is retired.
                    queue.unlock_subtree(id).expect("unlock");
                    queue
                        .push_completed_computation(id, reference_count, quantity)
                        .expect("retire");
                    queue.release_cache(task.cache_slot, 1).expect("release");
                }
            });
        }
    });

    assert!(queue.can_terminate());
    assert!(queue.is_empty());
    assert_eq!(queue.transport().completed_quantity(), total_work);
    assert!(queue.transport().all_slots_released());
    let snapshot = queue.snapshot();
    assert_eq!(snapshot.remaining_global_computation, 0);
    assert_eq!(snapshot.remaining_local_computation, 0);
}

/// Generation and dequeue interleave from different threads without losing
/// or duplicating tasks.
#[test]
fn concurrent_generation_and_dequeue_balance() {
    let query = uniform_table(0, 32, 8);
    let reference = uniform_table(0, 64, 8);
    let transport = MockTransport::new(Arc::clone(&reference));
    let queue = DualtreeTaskQueue::new(
        WorldInfo::single(),
        single_rank(&query),
        single_rank(&reference),
        4,
        transport,
    )
    .expect("queue init");
    let subtrees = queue.num_subtrees();
    let batches = 8usize;
    let expected = subtrees * batches;

    for batch in 0..batches {
        queue
            .transport()
            .queue_arrivals(vec![arrival(batch * 8, 8, batch as u64)]);
    }

    let start = Instant::now();
    let generator_done = AtomicBool::new(false);
    let mut taken = 0usize;
    thread::scope(|scope| {
        scope.spawn(|| {
            for _ in 0..batches {
                queue
                    .send_receive(0, &METRIC, &mut Vec::new())
                    .expect("send_receive");
            }
            generator_done.store(true, Ordering::SeqCst);
        });

        let collectors: Vec<_> = (0..2)
            .map(|_| {
                scope.spawn(|| {
                    let mut count = 0usize;
                    loop {
                        if queue.dequeue(false).is_some() {
                            count += 1;
                            continue;
                        }
                        if generator_done.load(Ordering::SeqCst) && queue.is_empty() {
                            break;
                        }
                        assert!(start.elapsed() < DEADLINE, "collectors starved");
                        thread::yield_now();
                    }
                    count
                })
            })
            .collect();
        for collector in collectors {
            taken += collector.join().expect("collector");
        }
    });

    assert_eq!(taken, expected);
    assert_eq!(queue.num_remaining_tasks(), 0);
    // Every dequeued task still holds its cache reference.
    let held: i64 = (0..batches)
        .map(|slot| queue.transport().ledger(CacheSlot::new(slot as u64)).live())
        .sum();
    assert_eq!(held, expected as i64);
}
