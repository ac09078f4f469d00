//! A minimal example: two producers enqueue while two consumers dequeue
//! through [`pcomb::ds::queue::PbQueue`]. Grounded in
//! `examples/gz-node-replication/examples/stack.rs`'s style of a small,
//! runnable usage demo.

use std::sync::{Arc, Barrier};
use std::thread;

use pcomb::ds::queue::{PbQueue, EMPTY};
use pcomb::platform::nvmm::NvmmRegion;

fn main() {
    env_logger::init();

    const NTHREADS: usize = 4;
    const PER_THREAD: usize = 1_000;

    // Leaked once, like every other NVMM-backed allocation in this crate:
    // the queue's node pool and the engines it wraps are never freed.
    let region: &'static NvmmRegion =
        Box::leak(Box::new(NvmmRegion::anonymous(1 << 24).expect("reserve a backing region")));
    let queue = Arc::new(PbQueue::init(region, NTHREADS).expect("init queue"));
    let barrier = Arc::new(Barrier::new(NTHREADS));

    let (produced, consumed): (Vec<Vec<i64>>, Vec<Vec<i64>>) = thread::scope(|scope| {
        let mut handles = Vec::new();
        for pid in 0..NTHREADS {
            let queue = Arc::clone(&queue);
            let barrier = Arc::clone(&barrier);
            handles.push(scope.spawn(move || {
                let mut tl = queue.thread_init(region, pid).expect("thread_init");
                barrier.wait();
                let mut produced = Vec::with_capacity(PER_THREAD);
                let mut consumed = Vec::new();
                for i in 0..PER_THREAD {
                    let v = (pid * PER_THREAD + i) as i64;
                    queue.enqueue(&mut tl, v, pid);
                    produced.push(v);
                    let got = queue.dequeue(&mut tl, pid);
                    if got != EMPTY {
                        consumed.push(got);
                    }
                }
                (produced, consumed)
            }));
        }
        handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .unzip()
    });

    let mut all_produced: Vec<i64> = produced.into_iter().flatten().collect();
    let mut all_consumed: Vec<i64> = consumed.into_iter().flatten().collect();

    // Drain anything still queued after the race above settles.
    let mut tl = queue.thread_init(region, 0).expect("thread_init");
    loop {
        let v = queue.dequeue(&mut tl, 0);
        if v == EMPTY {
            break;
        }
        all_consumed.push(v);
    }

    all_produced.sort_unstable();
    all_consumed.sort_unstable();
    println!("produced {} values, consumed {}", all_produced.len(), all_consumed.len());
    assert_eq!(all_produced, all_consumed);
}
