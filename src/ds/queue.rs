//! Unbounded persistent FIFO queue, built from two combining-engine
//! instances — one serializing enqueues, one serializing dequeues — the way
//! the original's `pbcombqueue.c`/`pwfcombqueue.c` each wrap a single
//! linked list with independent enqueue/dequeue combiners that only meet at
//! a shared `aux` tail pointer.
//!
//! A sentinel guard node means `head == tail` unambiguously means empty,
//! and dequeue never has to special-case a null head.

use std::cell::RefCell;
use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};
use std::sync::{Arc, Weak};

use crate::ds::node_pool::{Node, NodePool};
use crate::error::InitError;
use crate::pbcomb::{self, PBComb};
use crate::platform::durability;
use crate::platform::nvmm::NvmmRegion;
use crate::pwfcomb::{self, PWFComb};
use crate::sequential::SequentialObject;

/// Sentinel returned by a dequeue on an empty queue.
pub const EMPTY: i64 = -1;

struct QueueShared {
    pool: NodePool,
    /// Tail published by the enqueue side's `after_persist` hook; the
    /// dequeue side treats `head == aux_tail` as "nothing left to take"
    /// (`PBCombStruct::aux` / `enq_pst->first`/`last` in the original).
    aux_tail: AtomicPtr<Node>,
}

thread_local! {
    static NEW_ITEM_LINES: RefCell<Vec<usize>> = RefCell::new(Vec::new());
    static LAST_TAIL: std::cell::Cell<*mut Node> = std::cell::Cell::new(ptr::null_mut());
    static RECYCLE_LIST: RefCell<Vec<*mut Node>> = RefCell::new(Vec::new());
}

fn record_new_item_line(node: *mut Node) {
    let line = (node as usize) & !(crate::config::CACHE_LINE_SIZE - 1);
    NEW_ITEM_LINES.with(|items| {
        let mut items = items.borrow_mut();
        if !items.contains(&line) {
            items.push(line);
        }
    });
}

fn flush_new_item_lines() {
    NEW_ITEM_LINES.with(|items| {
        let mut items = items.borrow_mut();
        let lines: Vec<*const u8> = items.iter().map(|&l| l as *const u8).collect();
        durability::persist_lines(&lines);
        items.clear();
    });
}

fn publish_aux_tail(shared: &QueueShared) {
    LAST_TAIL.with(|tail| {
        let t = tail.get();
        if !t.is_null() {
            shared.aux_tail.store(t, Ordering::Release);
            std::sync::atomic::fence(Ordering::SeqCst);
            tail.set(ptr::null_mut());
        }
    });
}

fn recycle_collected(shared: &QueueShared) {
    RECYCLE_LIST.with(|list| {
        let mut list = list.borrow_mut();
        for &node in list.iter() {
            shared.pool.recycle(node);
        }
        list.clear();
    });
}

/// Per-record enqueue-side state: the current private copy's tail pointer
/// plus a weak handle to the structures shared with the dequeue side. Weak
/// rather than `Arc` so this type can implement `Default` (needed by
/// [`PWFComb::init`]'s placeholder pool slots) without a real queue to
/// point at; every slot that is ever read has already been overwritten
/// from a live record first.
#[derive(Clone)]
pub(crate) struct EnqueueState {
    tail: usize,
    shared: Weak<QueueShared>,
}

impl Default for EnqueueState {
    fn default() -> Self {
        Self {
            tail: 0,
            shared: Weak::new(),
        }
    }
}

impl SequentialObject for EnqueueState {
    fn apply(&mut self, arg: i64, _pid: usize) -> i64 {
        let shared = self.shared.upgrade().expect("queue outlives its enqueue states");
        let node = shared.pool.alloc(arg, ptr::null_mut());
        debug_assert!(self.tail != 0, "enqueue state always seeded with the guard node");
        unsafe {
            (*(self.tail as *mut Node))
                .next
                .store(node, Ordering::Release);
        }
        self.tail = node as usize;
        record_new_item_line(node);
        LAST_TAIL.with(|t| t.set(node));
        EMPTY
    }
}

/// Per-record dequeue-side state: the current private copy's head pointer.
#[derive(Clone)]
pub(crate) struct DequeueState {
    head: usize,
    shared: Weak<QueueShared>,
}

impl Default for DequeueState {
    fn default() -> Self {
        Self {
            head: 0,
            shared: Weak::new(),
        }
    }
}

impl SequentialObject for DequeueState {
    fn apply(&mut self, _arg: i64, _pid: usize) -> i64 {
        let shared = self.shared.upgrade().expect("queue outlives its dequeue states");
        let head_ptr = self.head as *mut Node;
        let aux = shared.aux_tail.load(Ordering::Acquire);
        if head_ptr == aux {
            return EMPTY;
        }
        let next = unsafe { (*head_ptr).next.load(Ordering::Acquire) };
        debug_assert!(!next.is_null(), "head != aux implies a linked successor");
        let val = unsafe { (*next).val };
        self.head = next as usize;
        RECYCLE_LIST.with(|list| list.borrow_mut().push(head_ptr));
        val
    }
}

/// The PBcomb-backed persistent queue.
pub struct PbQueue {
    enqueue: PBComb<EnqueueState>,
    dequeue: PBComb<DequeueState>,
    shared: Arc<QueueShared>,
}

/// Per-thread state for [`PbQueue`].
pub struct PbQueueThreadLocal {
    enqueue: pbcomb::ThreadLocal<EnqueueState>,
    dequeue: pbcomb::ThreadLocal<DequeueState>,
}

impl std::fmt::Debug for PbQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PbQueue").finish_non_exhaustive()
    }
}

impl std::fmt::Debug for PbQueueThreadLocal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PbQueueThreadLocal")
            .field("enqueue", &self.enqueue)
            .field("dequeue", &self.dequeue)
            .finish()
    }
}

impl PbQueue {
    /// Builds a fresh, empty queue backed by `region`.
    pub fn init(region: &'static NvmmRegion, nthreads: usize) -> Result<Self, InitError> {
        let guard: *mut Node = region.alloc(Node {
            val: i64::MIN,
            next: AtomicPtr::new(ptr::null_mut()),
        })?;
        let shared = Arc::new(QueueShared {
            pool: NodePool::new(region),
            aux_tail: AtomicPtr::new(guard),
        });

        let enqueue = PBComb::init(
            region,
            nthreads,
            EnqueueState {
                tail: guard as usize,
                shared: Arc::downgrade(&shared),
            },
        )?;
        let dequeue = PBComb::init(
            region,
            nthreads,
            DequeueState {
                head: guard as usize,
                shared: Arc::downgrade(&shared),
            },
        )?;

        let hook_shared = Arc::clone(&shared);
        enqueue.set_final_persist(Box::new(flush_new_item_lines));
        enqueue.set_after_persist(Box::new(move || publish_aux_tail(&hook_shared)));
        let hook_shared = Arc::clone(&shared);
        dequeue.set_after_persist(Box::new(move || recycle_collected(&hook_shared)));

        Ok(Self {
            enqueue,
            dequeue,
            shared,
        })
    }

    /// Builds the per-thread state `pid` must hold for the lifetime of its
    /// use of this queue.
    pub fn thread_init(
        &self,
        region: &NvmmRegion,
        pid: usize,
    ) -> Result<PbQueueThreadLocal, InitError> {
        Ok(PbQueueThreadLocal {
            enqueue: self.enqueue.thread_init(region, pid)?,
            dequeue: self.dequeue.thread_init(region, pid)?,
        })
    }

    /// Appends `val`.
    pub fn enqueue(&self, tl: &mut PbQueueThreadLocal, val: i64, pid: usize) {
        NEW_ITEM_LINES.with(|i| i.borrow_mut().clear());
        let _ = self.enqueue.apply_op(&mut tl.enqueue, val, pid);
    }

    /// Removes and returns the oldest enqueued value, or [`EMPTY`].
    pub fn dequeue(&self, tl: &mut PbQueueThreadLocal, pid: usize) -> i64 {
        RECYCLE_LIST.with(|l| l.borrow_mut().clear());
        self.dequeue.apply_op(&mut tl.dequeue, 0, pid)
    }
}

/// The PWFcomb-backed persistent queue.
pub struct PwfQueue {
    enqueue: PWFComb<EnqueueState>,
    dequeue: PWFComb<DequeueState>,
    shared: Arc<QueueShared>,
}

/// Per-thread state for [`PwfQueue`].
pub struct PwfQueueThreadLocal {
    enqueue: pwfcomb::ThreadLocal,
    dequeue: pwfcomb::ThreadLocal,
}

impl std::fmt::Debug for PwfQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PwfQueue").finish_non_exhaustive()
    }
}

impl std::fmt::Debug for PwfQueueThreadLocal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PwfQueueThreadLocal")
            .field("enqueue", &self.enqueue)
            .field("dequeue", &self.dequeue)
            .finish()
    }
}

impl PwfQueue {
    /// Builds a fresh, empty queue backed by `region`.
    pub fn init(region: &'static NvmmRegion, nthreads: usize, max_backoff: u32) -> Result<Self, InitError> {
        let guard: *mut Node = region.alloc(Node {
            val: i64::MIN,
            next: AtomicPtr::new(ptr::null_mut()),
        })?;
        let shared = Arc::new(QueueShared {
            pool: NodePool::new(region),
            aux_tail: AtomicPtr::new(guard),
        });

        let enqueue = PWFComb::init(
            region,
            nthreads,
            max_backoff,
            EnqueueState {
                tail: guard as usize,
                shared: Arc::downgrade(&shared),
            },
        )?;
        let dequeue = PWFComb::init(
            region,
            nthreads,
            max_backoff,
            DequeueState {
                head: guard as usize,
                shared: Arc::downgrade(&shared),
            },
        )?;

        let hook_shared = Arc::clone(&shared);
        enqueue.set_final_persist(Box::new(flush_new_item_lines));
        enqueue.set_after_persist(Box::new(move || publish_aux_tail(&hook_shared)));
        let hook_shared = Arc::clone(&shared);
        dequeue.set_after_persist(Box::new(move || recycle_collected(&hook_shared)));

        Ok(Self {
            enqueue,
            dequeue,
            shared,
        })
    }

    /// Builds the per-thread state `pid` must hold for the lifetime of its
    /// use of this queue.
    pub fn thread_init(&self, pid: usize) -> PwfQueueThreadLocal {
        PwfQueueThreadLocal {
            enqueue: self.enqueue.thread_init(pid),
            dequeue: self.dequeue.thread_init(pid),
        }
    }

    /// Appends `val`.
    pub fn enqueue(&self, tl: &mut PwfQueueThreadLocal, val: i64, pid: usize) {
        NEW_ITEM_LINES.with(|i| i.borrow_mut().clear());
        let _ = self.enqueue.apply_op(&mut tl.enqueue, val, pid);
    }

    /// Removes and returns the oldest enqueued value, or [`EMPTY`].
    pub fn dequeue(&self, tl: &mut PwfQueueThreadLocal, pid: usize) -> i64 {
        RECYCLE_LIST.with(|l| l.borrow_mut().clear());
        self.dequeue.apply_op(&mut tl.dequeue, 0, pid)
    }
}

// SAFETY: `QueueShared` is only mutated through `NodePool` (internally
// synchronized) and the `AtomicPtr` tail; sharing it across threads behind
// an `Arc` is sound.
unsafe impl Send for QueueShared {}
unsafe impl Sync for QueueShared {}

#[cfg(test)]
mod tests {
    use super::*;

    fn region() -> &'static NvmmRegion {
        Box::leak(Box::new(NvmmRegion::anonymous(1 << 20).unwrap()))
    }

    #[test]
    fn pb_queue_is_fifo() {
        let region = region();
        let q = PbQueue::init(region, 1).unwrap();
        let mut tl = q.thread_init(region, 0).unwrap();
        q.enqueue(&mut tl, 10, 0);
        q.enqueue(&mut tl, 20, 0);
        assert_eq!(q.dequeue(&mut tl, 0), 10);
        assert_eq!(q.dequeue(&mut tl, 0), 20);
        assert_eq!(q.dequeue(&mut tl, 0), EMPTY);
    }

    #[test]
    fn pwf_queue_is_fifo() {
        let region = region();
        let q = PwfQueue::init(region, 1, 10).unwrap();
        let mut tl = q.thread_init(0);
        q.enqueue(&mut tl, 10, 0);
        q.enqueue(&mut tl, 20, 0);
        assert_eq!(q.dequeue(&mut tl, 0), 10);
        assert_eq!(q.dequeue(&mut tl, 0), 20);
        assert_eq!(q.dequeue(&mut tl, 0), EMPTY);
    }

    #[test]
    fn pb_queue_concurrent_producers_consumers_preserve_multiset() {
        use std::sync::Barrier;
        use std::thread;

        let region = region();
        let nthreads = 4;
        let per_thread = 250;
        let q = Arc::new(PbQueue::init(region, nthreads).unwrap());
        let barrier = Arc::new(Barrier::new(nthreads));

        let produced: Vec<_> = thread::scope(|scope| {
            let mut handles = Vec::new();
            for pid in 0..nthreads {
                let q = Arc::clone(&q);
                let barrier = Arc::clone(&barrier);
                handles.push(scope.spawn(move || {
                    let mut tl = q.thread_init(region, pid).unwrap();
                    barrier.wait();
                    let mut produced = Vec::new();
                    let mut consumed = Vec::new();
                    for i in 0..per_thread {
                        let v = (pid * per_thread + i) as i64;
                        q.enqueue(&mut tl, v, pid);
                        produced.push(v);
                        let got = q.dequeue(&mut tl, pid);
                        if got != EMPTY {
                            consumed.push(got);
                        }
                    }
                    (produced, consumed)
                }));
            }
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        let mut all_produced: Vec<i64> = produced.iter().flat_map(|(p, _)| p.clone()).collect();
        let mut all_consumed: Vec<i64> = produced.iter().flat_map(|(_, c)| c.clone()).collect();
        let mut tl = q.thread_init(region, 0).unwrap();
        loop {
            let v = q.dequeue(&mut tl, 0);
            if v == EMPTY {
                break;
            }
            all_consumed.push(v);
        }
        all_produced.sort_unstable();
        all_consumed.sort_unstable();
        assert_eq!(all_produced, all_consumed);
    }
}
