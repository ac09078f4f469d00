//! Persistent LIFO stack, a single combining-engine instance wrapping one
//! `head` pointer — unlike the queue, push and pop are serialized by the
//! same combiner (`serialPushPop` in `pbcombstack.c`, `serialPush`/
//! `serialPop` in `pwfcombstack.c`), distinguished by a sentinel argument.
//!
//! Every push a combining round performs lands a brand-new node, so the
//! combiner tracks which cache lines those nodes fall on and gives each one
//! a running count; a matching pop in the same round decrements it instead
//! of flushing. Lines whose count is still positive when the round ends get
//! flushed, the rest are skipped — eliding the persist entirely for nodes
//! that were pushed and popped again before ever leaving cache. The count is
//! a counter, not a record of which exact lines were flushed versus
//! skipped on a *previous* round; it is deliberately never reconciled
//! against that history, matching `clNewItems_count` in the original, which
//! has the same property. See `DESIGN.md`.

use std::cell::RefCell;
use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};
use std::sync::{Arc, Weak};

use crate::config::CACHE_LINE_SIZE;
use crate::ds::node_pool::{Node, NodePool};
use crate::error::InitError;
use crate::pbcomb::{self, PBComb};
use crate::platform::durability;
use crate::platform::nvmm::NvmmRegion;
use crate::pwfcomb::{self, PWFComb};
use crate::sequential::SequentialObject;

/// Sentinel returned by a pop on an empty stack.
pub const EMPTY: i64 = -1;

/// Argument value a caller passes to request a pop rather than a push
/// (`POP`/`POP_OP` in the original).
pub const POP: i64 = i64::MIN;

struct StackShared {
    pool: NodePool,
}

thread_local! {
    /// Cache lines that gained a fresh node this round, in first-seen order,
    /// each paired with a running push/pop balance (`clNewItems` /
    /// `clNewItems_count`).
    static NEW_ITEM_LINES: RefCell<Vec<(usize, i64)>> = RefCell::new(Vec::new());
    static RECYCLE_LIST: RefCell<Vec<*mut Node>> = RefCell::new(Vec::new());
}

fn line_of(node: *mut Node) -> usize {
    (node as usize) & !(CACHE_LINE_SIZE - 1)
}

fn note_pushed(node: *mut Node) {
    let line = line_of(node);
    NEW_ITEM_LINES.with(|items| {
        let mut items = items.borrow_mut();
        if let Some(entry) = items.iter_mut().find(|(l, _)| *l == line) {
            entry.1 += 1;
        } else {
            items.push((line, 1));
        }
    });
}

/// Cancels out a pop against the same round's pushes if the popped node's
/// line was one of them (`clNewItems_count[i]--`); pops of nodes that were
/// already durable before this round leave the table untouched.
fn note_popped(node: *mut Node) {
    let line = line_of(node);
    NEW_ITEM_LINES.with(|items| {
        if let Some(entry) = items.borrow_mut().iter_mut().find(|(l, _)| *l == line) {
            entry.1 -= 1;
        }
    });
}

/// Flushes every line this round touched whose balance is still positive,
/// in the order first recorded, then clears the table for the next round.
/// Under `no_elimination` every touched line is flushed regardless of
/// balance, matching `SYNCH_DISABLE_ELIMINATION_ON_STACKS` in the original:
/// that build flag skips the push/pop cancellation bookkeeping entirely and
/// persists every new node as if no pop ever raced it.
fn flush_surviving_lines() {
    NEW_ITEM_LINES.with(|items| {
        let mut items = items.borrow_mut();
        let lines: Vec<*const u8> = items
            .iter()
            .filter(|(_, count)| cfg!(feature = "no_elimination") || *count > 0)
            .map(|(l, _)| *l as *const u8)
            .collect();
        durability::persist_lines(&lines);
        items.clear();
    });
}

fn recycle_collected(shared: &StackShared) {
    RECYCLE_LIST.with(|list| {
        let mut list = list.borrow_mut();
        for &node in list.iter() {
            shared.pool.recycle(node);
        }
        list.clear();
    });
}

/// Per-record state: the current private copy's head pointer plus a weak
/// handle to the node pool. Weak rather than `Arc` so this type can
/// implement `Default` for [`PWFComb::init`]'s placeholder pool slots
/// without a real stack to point at.
#[derive(Clone)]
pub(crate) struct StackState {
    head: usize,
    shared: Weak<StackShared>,
}

impl Default for StackState {
    fn default() -> Self {
        Self {
            head: 0,
            shared: Weak::new(),
        }
    }
}

impl SequentialObject for StackState {
    fn apply(&mut self, arg: i64, pid: usize) -> i64 {
        let shared = self.shared.upgrade().expect("stack outlives its states");
        if arg == POP {
            let head_ptr = self.head as *mut Node;
            if head_ptr.is_null() {
                return EMPTY;
            }
            note_popped(head_ptr);
            let val = unsafe { (*head_ptr).val };
            let next = unsafe { (*head_ptr).next.load(Ordering::Acquire) };
            self.head = next as usize;
            RECYCLE_LIST.with(|list| list.borrow_mut().push(head_ptr));
            let _ = pid;
            val
        } else {
            let node = shared.pool.alloc(arg, self.head as *mut Node);
            note_pushed(node);
            self.head = node as usize;
            EMPTY
        }
    }
}

/// The PBcomb-backed persistent stack.
pub struct PbStack {
    engine: PBComb<StackState>,
    #[allow(dead_code)]
    shared: Arc<StackShared>,
}

/// Per-thread state for [`PbStack`].
pub struct PbStackThreadLocal {
    inner: pbcomb::ThreadLocal<StackState>,
}

impl std::fmt::Debug for PbStack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PbStack").finish_non_exhaustive()
    }
}

impl std::fmt::Debug for PbStackThreadLocal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PbStackThreadLocal")
            .field("inner", &self.inner)
            .finish()
    }
}

impl PbStack {
    /// Builds a fresh, empty stack backed by `region`.
    pub fn init(region: &'static NvmmRegion, nthreads: usize) -> Result<Self, InitError> {
        let shared = Arc::new(StackShared {
            pool: NodePool::new(region),
        });
        let engine = PBComb::init(
            region,
            nthreads,
            StackState {
                head: 0,
                shared: Arc::downgrade(&shared),
            },
        )?;

        engine.set_final_persist(Box::new(flush_surviving_lines));
        let hook_shared = Arc::clone(&shared);
        engine.set_after_persist(Box::new(move || recycle_collected(&hook_shared)));

        Ok(Self { engine, shared })
    }

    /// Builds the per-thread state `pid` must hold for the lifetime of its
    /// use of this stack.
    pub fn thread_init(&self, region: &NvmmRegion, pid: usize) -> Result<PbStackThreadLocal, InitError> {
        Ok(PbStackThreadLocal {
            inner: self.engine.thread_init(region, pid)?,
        })
    }

    /// Pushes `val` onto the top.
    pub fn push(&self, tl: &mut PbStackThreadLocal, val: i64, pid: usize) {
        debug_assert!(val != POP, "POP is reserved to request a pop");
        RECYCLE_LIST.with(|l| l.borrow_mut().clear());
        let _ = self.engine.apply_op(&mut tl.inner, val, pid);
    }

    /// Pops and returns the top value, or [`EMPTY`].
    pub fn pop(&self, tl: &mut PbStackThreadLocal, pid: usize) -> i64 {
        RECYCLE_LIST.with(|l| l.borrow_mut().clear());
        self.engine.apply_op(&mut tl.inner, POP, pid)
    }
}

/// The PWFcomb-backed persistent stack.
pub struct PwfStack {
    engine: PWFComb<StackState>,
    #[allow(dead_code)]
    shared: Arc<StackShared>,
}

/// Per-thread state for [`PwfStack`].
pub struct PwfStackThreadLocal {
    inner: pwfcomb::ThreadLocal,
}

impl std::fmt::Debug for PwfStack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PwfStack").finish_non_exhaustive()
    }
}

impl std::fmt::Debug for PwfStackThreadLocal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PwfStackThreadLocal")
            .field("inner", &self.inner)
            .finish()
    }
}

impl PwfStack {
    /// Builds a fresh, empty stack backed by `region`.
    pub fn init(region: &'static NvmmRegion, nthreads: usize, max_backoff: u32) -> Result<Self, InitError> {
        let shared = Arc::new(StackShared {
            pool: NodePool::new(region),
        });
        let engine = PWFComb::init(
            region,
            nthreads,
            max_backoff,
            StackState {
                head: 0,
                shared: Arc::downgrade(&shared),
            },
        )?;

        engine.set_final_persist(Box::new(flush_surviving_lines));
        let hook_shared = Arc::clone(&shared);
        engine.set_after_persist(Box::new(move || recycle_collected(&hook_shared)));

        Ok(Self { engine, shared })
    }

    /// Builds the per-thread state `pid` must hold for the lifetime of its
    /// use of this stack.
    pub fn thread_init(&self, pid: usize) -> PwfStackThreadLocal {
        PwfStackThreadLocal {
            inner: self.engine.thread_init(pid),
        }
    }

    /// Pushes `val` onto the top.
    pub fn push(&self, tl: &mut PwfStackThreadLocal, val: i64, pid: usize) {
        debug_assert!(val != POP, "POP is reserved to request a pop");
        RECYCLE_LIST.with(|l| l.borrow_mut().clear());
        let _ = self.engine.apply_op(&mut tl.inner, val, pid);
    }

    /// Pops and returns the top value, or [`EMPTY`].
    pub fn pop(&self, tl: &mut PwfStackThreadLocal, pid: usize) -> i64 {
        RECYCLE_LIST.with(|l| l.borrow_mut().clear());
        self.engine.apply_op(&mut tl.inner, POP, pid)
    }
}

// SAFETY: `StackShared` is only mutated through `NodePool`, which is
// internally synchronized; sharing it across threads behind an `Arc` is
// sound.
unsafe impl Send for StackShared {}
unsafe impl Sync for StackShared {}

#[cfg(test)]
mod tests {
    use super::*;

    fn region() -> &'static NvmmRegion {
        Box::leak(Box::new(NvmmRegion::anonymous(1 << 20).unwrap()))
    }

    #[test]
    fn pb_stack_is_lifo() {
        let region = region();
        let s = PbStack::init(region, 1).unwrap();
        let mut tl = s.thread_init(region, 0).unwrap();
        s.push(&mut tl, 10, 0);
        s.push(&mut tl, 20, 0);
        assert_eq!(s.pop(&mut tl, 0), 20);
        assert_eq!(s.pop(&mut tl, 0), 10);
        assert_eq!(s.pop(&mut tl, 0), EMPTY);
    }

    #[test]
    fn pwf_stack_is_lifo() {
        let region = region();
        let s = PwfStack::init(region, 1, 10).unwrap();
        let mut tl = s.thread_init(0);
        s.push(&mut tl, 10, 0);
        s.push(&mut tl, 20, 0);
        assert_eq!(s.pop(&mut tl, 0), 20);
        assert_eq!(s.pop(&mut tl, 0), 10);
        assert_eq!(s.pop(&mut tl, 0), EMPTY);
    }

    #[test]
    fn pb_stack_concurrent_push_pop_preserve_multiset() {
        use std::sync::Barrier;
        use std::thread;

        let region = region();
        let nthreads = 4;
        let per_thread = 250;
        let s = Arc::new(PbStack::init(region, nthreads).unwrap());
        let barrier = Arc::new(Barrier::new(nthreads));

        let results: Vec<_> = thread::scope(|scope| {
            let mut handles = Vec::new();
            for pid in 0..nthreads {
                let s = Arc::clone(&s);
                let barrier = Arc::clone(&barrier);
                handles.push(scope.spawn(move || {
                    let mut tl = s.thread_init(region, pid).unwrap();
                    barrier.wait();
                    let mut pushed = Vec::new();
                    let mut popped = Vec::new();
                    for i in 0..per_thread {
                        let v = (pid * per_thread + i) as i64;
                        s.push(&mut tl, v, pid);
                        pushed.push(v);
                        let got = s.pop(&mut tl, pid);
                        if got != EMPTY {
                            popped.push(got);
                        }
                    }
                    (pushed, popped)
                }));
            }
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        let mut all_pushed: Vec<i64> = results.iter().flat_map(|(p, _)| p.clone()).collect();
        let mut all_popped: Vec<i64> = results.iter().flat_map(|(_, c)| c.clone()).collect();
        let mut tl = s.thread_init(region, 0).unwrap();
        loop {
            let v = s.pop(&mut tl, 0);
            if v == EMPTY {
                break;
            }
            all_popped.push(v);
        }
        all_pushed.sort_unstable();
        all_popped.sort_unstable();
        assert_eq!(all_pushed, all_popped);
    }
}
