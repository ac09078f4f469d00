//! Black-box integration tests for the concrete end-to-end scenarios, kept
//! apart from the per-module unit tests embedded in `src/*.rs` the way
//! `node-replication` splits a black-box `tests/stack.rs` suite from its
//! `#[cfg(test)]` unit tests.
//!
//! A note on what isn't here: the distilled spec's scenario 2 and 6 each
//! call for injecting a genuine OS-level crash and recovering in a fresh
//! process. This crate's engines hand out raw `'static` references into an
//! `mmap`-ed arena (see `platform::nvmm`), so a record's pointers are only
//! valid for the lifetime of the mapping that produced them — reopening
//! that mapping at a different virtual address in a new process would
//! leave every pointer dangling. Building address-stable (offset-based)
//! pointers so a *second process* can reconstruct a live engine is a real
//! feature this crate does not implement (see `DESIGN.md`'s Open Question
//! on recovery scope). What the tests below exercise instead is the part
//! of durable linearizability that *is* implemented and in-process
//! testable: that the published state pointer always names a fully served,
//! non-torn record, including when many threads race the wait-free
//! engine's two-try-then-help protocol hard enough to force the helper
//! path. `platform::nvmm::tests::file_backed_region_roundtrips_through_reopen`
//! already covers the byte-level half of real recovery (the allocator
//! surviving a reopen of its backing file).

use std::sync::{Arc, Barrier};
use std::thread;

use pcomb::ds::heap::PbHeap;
use pcomb::ds::stack::{PwfStack, EMPTY as STACK_EMPTY};
use pcomb::pbcomb::PBComb;
use pcomb::platform::nvmm::NvmmRegion;
use pcomb::pwfcomb::PWFComb;
use pcomb::sequential::SequentialObject;

/// `apply(arg, _)` adds `arg` to the running total and returns the new
/// total — the distilled spec's `fetchAndAdd` scenario object.
#[derive(Clone, Copy, Default)]
struct Counter(i64);

impl SequentialObject for Counter {
    fn apply(&mut self, arg: i64, _pid: usize) -> i64 {
        self.0 += arg;
        self.0
    }
}

/// Scenario 1: four PBcomb threads each call `fetchAndAdd(1)` 1,000 times.
/// Final state is 4,000; the returned values are some permutation of
/// `1..=4000` (every combiner hands out a distinct running total).
#[test]
fn counter_pbcomb_four_threads_to_four_thousand() {
    const NTHREADS: usize = 4;
    const PER_THREAD: i64 = 1_000;

    let region = NvmmRegion::anonymous(1 << 20).unwrap();
    let engine = Arc::new(PBComb::init(&region, NTHREADS, Counter::default()).unwrap());

    let mut returns: Vec<i64> = thread::scope(|scope| {
        let mut handles = Vec::new();
        for pid in 0..NTHREADS {
            let engine = Arc::clone(&engine);
            let region = &region;
            handles.push(scope.spawn(move || {
                let mut tl = engine.thread_init(region, pid).unwrap();
                (0..PER_THREAD)
                    .map(|_| engine.apply_op(&mut tl, 1, pid))
                    .collect::<Vec<_>>()
            }));
        }
        handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect()
    });

    assert_eq!(engine.state_snapshot().0, NTHREADS as i64 * PER_THREAD);
    returns.sort_unstable();
    let expected: Vec<i64> = (1..=NTHREADS as i64 * PER_THREAD).collect();
    assert_eq!(returns, expected);
}

/// Scenario 2 (durability-injection half dropped; see module doc): the same
/// workload against PWFcomb. Every returned value is still a distinct
/// running total reachable through exactly one combiner's publication, and
/// the final durable state is never less than the number of operations any
/// thread has observed complete (invariant 2/4).
#[test]
fn counter_pwfcomb_four_threads_to_four_thousand() {
    const NTHREADS: usize = 4;
    const PER_THREAD: i64 = 1_000;

    let region = NvmmRegion::anonymous(1 << 20).unwrap();
    let engine = Arc::new(PWFComb::init(&region, NTHREADS, 10, Counter::default()).unwrap());

    let mut returns: Vec<i64> = thread::scope(|scope| {
        let mut handles = Vec::new();
        for pid in 0..NTHREADS {
            let engine = Arc::clone(&engine);
            handles.push(scope.spawn(move || {
                let mut tl = engine.thread_init(pid);
                (0..PER_THREAD)
                    .map(|_| engine.apply_op(&mut tl, 1, pid))
                    .collect::<Vec<_>>()
            }));
        }
        handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect()
    });

    assert_eq!(engine.state_snapshot().0, NTHREADS as i64 * PER_THREAD);
    returns.sort_unstable();
    let expected: Vec<i64> = (1..=NTHREADS as i64 * PER_THREAD).collect();
    assert_eq!(returns, expected);
}

/// Scenario 4: eight threads alternating push/pop against the wait-free,
/// eliminating stack. After every thread finishes, total successful pops
/// never exceeds total pushes, and draining whatever remains yields exactly
/// the surplus. This is also the scenario that most reliably forces
/// PWFcomb's two-try-then-help path: with eight threads racing one stack,
/// at least some calls lose both combine attempts and fall through to
/// `help_and_return`.
#[test]
fn stack_elimination_eight_threads_alternating() {
    const NTHREADS: usize = 8;
    const PER_THREAD: usize = 500;

    let region: &'static NvmmRegion =
        Box::leak(Box::new(NvmmRegion::anonymous(1 << 24).unwrap()));
    let stack = Arc::new(PwfStack::init(region, NTHREADS, 10).unwrap());
    let barrier = Arc::new(Barrier::new(NTHREADS));

    let (pushed, popped): (usize, usize) = thread::scope(|scope| {
        let mut handles = Vec::new();
        for pid in 0..NTHREADS {
            let stack = Arc::clone(&stack);
            let barrier = Arc::clone(&barrier);
            handles.push(scope.spawn(move || {
                let mut tl = stack.thread_init(pid);
                barrier.wait();
                let mut pushed = 0usize;
                let mut popped = 0usize;
                for i in 0..PER_THREAD {
                    if i % 2 == 0 {
                        stack.push(&mut tl, (pid * PER_THREAD + i) as i64, pid);
                        pushed += 1;
                    } else if stack.pop(&mut tl, pid) != STACK_EMPTY {
                        popped += 1;
                    }
                }
                (pushed, popped)
            }));
        }
        handles.into_iter().map(|h| h.join().unwrap()).fold(
            (0, 0),
            |(tp, to), (p, o)| (tp + p, to + o),
        )
    });

    assert!(popped <= pushed);

    let mut tl = stack.thread_init(0);
    let mut drained = 0usize;
    while stack.pop(&mut tl, 0) != STACK_EMPTY {
        drained += 1;
    }
    assert_eq!(drained + popped, pushed);
}

/// Scenario 5 (round-trip): insert `{10, 20, 5, 15, 5, 1}`, three
/// `delete_min` calls return `1, 5, 5`, and the remaining minimum is `10`.
#[test]
fn heap_delete_min_returns_sorted_prefix() {
    let region = NvmmRegion::anonymous(1 << 20).unwrap();
    let heap = PbHeap::init(&region, 1).unwrap();
    let mut tl = heap.thread_init(&region, 0).unwrap();

    for v in [10, 20, 5, 15, 5, 1] {
        heap.insert(&mut tl, v, 0);
    }

    let popped: Vec<i64> = (0..3).map(|_| heap.delete_min(&mut tl, 0)).collect();
    assert_eq!(popped, vec![1, 5, 5]);
    assert_eq!(heap.get_min(&mut tl, 0), 10);
}
