//! A minimal example: four threads share one fetch-and-add counter through
//! [`pcomb::pbcomb::PBComb`]. Grounded in
//! `examples/gz-node-replication/examples/stack.rs`'s style of a small,
//! runnable usage demo — no CLI parsing, no timing harness, just enough to
//! show the API end to end.

use std::sync::Arc;
use std::thread;

use pcomb::pbcomb::PBComb;
use pcomb::platform::nvmm::NvmmRegion;
use pcomb::sequential::SequentialObject;

/// The simplest possible sequential object: `apply` adds `arg` to the
/// running total and returns the new total, the way `fetchAndAdd` behaves
/// in the distilled spec's counter scenario.
#[derive(Clone, Copy, Default)]
struct Counter(i64);

impl SequentialObject for Counter {
    fn apply(&mut self, arg: i64, _pid: usize) -> i64 {
        self.0 += arg;
        self.0
    }
}

fn main() {
    env_logger::init();

    const NTHREADS: usize = 4;
    const PER_THREAD: i64 = 1_000;

    let region = NvmmRegion::anonymous(1 << 20).expect("reserve a backing region");
    let engine = Arc::new(PBComb::init(&region, NTHREADS, Counter::default()).expect("init counter"));

    let totals: Vec<i64> = thread::scope(|scope| {
        let mut handles = Vec::new();
        for pid in 0..NTHREADS {
            let engine = Arc::clone(&engine);
            let region = &region;
            handles.push(scope.spawn(move || {
                let mut tl = engine.thread_init(region, pid).expect("thread_init");
                let mut sum = 0i64;
                for _ in 0..PER_THREAD {
                    sum += engine.apply_op(&mut tl, 1, pid);
                }
                sum
            }));
        }
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    let final_state = engine.state_snapshot().0;
    println!("final counter state: {final_state}");
    println!("sum of returned values per thread: {totals:?}");
    println!("engine stats: {:?}", engine.stats());

    assert_eq!(final_state, NTHREADS as i64 * PER_THREAD);
}
