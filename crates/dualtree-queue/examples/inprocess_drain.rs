//! Drive a full in-process drain: one communication thread feeding four
//! worker threads until distributed termination is reached.

use std::sync::Arc;
use std::thread;
use std::time::Instant;

use dualtree_queue::test_support::{MockTransport, single_rank, uniform_table};
use dualtree_queue::{Arrival, CacheSlot, DualtreeTaskQueue, SquaredEuclidean, WorldInfo};

const NUM_WORKERS: usize = 4;
const QUERY_POINTS: usize = 4096;
const REFERENCE_POINTS: usize = 2048;
const REFERENCE_BATCH: usize = 256;

fn main() {
    let query = uniform_table(0, QUERY_POINTS, 64);
    let reference = uniform_table(0, REFERENCE_POINTS, REFERENCE_BATCH);
    let total_work = (QUERY_POINTS * REFERENCE_POINTS) as u64;
    let transport = MockTransport::with_drain_target(Arc::clone(&reference), total_work);
    let queue = DualtreeTaskQueue::new(
        WorldInfo::single(),
        single_rank(&query),
        single_rank(&reference),
        NUM_WORKERS,
        transport,
    )
    .expect("queue init");

    let batches = REFERENCE_POINTS / REFERENCE_BATCH;
    for batch in 0..batches {
        queue.transport().queue_arrivals(vec![Arrival {
            rank: 0,
            begin: batch * REFERENCE_BATCH,
            count: REFERENCE_BATCH,
            slot: CacheSlot::new(batch as u64),
        }]);
    }

    let metric = SquaredEuclidean;
    let start = Instant::now();
    thread::scope(|scope| {
        scope.spawn(|| {
            for _ in 0..batches {
                queue
                    .send_receive(0, &metric, &mut Vec::new())
                    .expect("send_receive");
            }
        });

        for worker in 0..NUM_WORKERS {
            let queue = &queue;
            scope.spawn(move || {
                let mut retired = 0u64;
                while !queue.can_terminate() {
                    let Some((task, _)) = queue.dequeue(true) else {
                        thread::yield_now();
                        continue;
                    };
                    let id = queue.subtree_id_of(&task);
                    let reference_count =
                        task.reference_table.node(task.reference).count() as u64;
                    let quantity = id.count as u64 * reference_count;
                    queue.unlock_subtree(id).expect("unlock");
                    queue
                        .push_completed_computation(id, reference_count, quantity)
                        .expect("retire");
                    queue.release_cache(task.cache_slot, 1).expect("release");
                    retired += quantity;
                }
                println!("worker {worker}: retired {retired} pair comparisons");
            });
        }
    });

    let snapshot = queue.snapshot();
    println!(
        "drained {} comparisons in {:?} ({} subtrees left, all slots released: {})",
        total_work,
        start.elapsed(),
        snapshot.subtrees.len(),
        queue.transport().all_slots_released(),
    );
    assert!(queue.can_terminate());
}
