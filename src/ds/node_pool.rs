//! Shared node allocator backing the list-based queue and stack adapters.
//!
//! Grounded in the original C's `SynchPoolStruct` (`synchAllocObj` /
//! `synchRecycleObj`): nodes are bump-allocated once out of NVMM and handed
//! back to a free list by the `after_persist` hook once no reader can still
//! be mid-traversal over them. The original keeps one such pool per thread;
//! we keep a single pool shared behind a mutex-guarded free list instead,
//! since recycling only ever happens from within a combiner's
//! `after_persist` call (one thread at a time per engine) and allocation is
//! already safe to share (`NvmmRegion::alloc` is lock-free). See
//! `DESIGN.md` for why this simplification doesn't change observable
//! behavior.

use std::sync::atomic::AtomicPtr;
use std::sync::Mutex;

use crate::platform::nvmm::NvmmRegion;

/// One link in a persistent singly-linked list. Shared by the queue and
/// stack adapters (`Node` in the original's `list.h`-style headers).
#[repr(C)]
pub(crate) struct Node {
    pub val: i64,
    pub next: AtomicPtr<Node>,
}

/// A never-shrinking arena of [`Node`]s with best-effort recycling.
pub(crate) struct NodePool {
    region: &'static NvmmRegion,
    free: Mutex<Vec<*mut Node>>,
}

// SAFETY: `free` is guarded by a mutex; raw pointers inside point at
// NVMM-backed, never-unmapped memory for the pool's lifetime.
unsafe impl Send for NodePool {}
unsafe impl Sync for NodePool {}

impl NodePool {
    pub(crate) fn new(region: &'static NvmmRegion) -> Self {
        Self {
            region,
            free: Mutex::new(Vec::new()),
        }
    }

    /// Hands back a node carrying `val` and `next`, reusing a recycled slot
    /// if one is available (`synchAllocObj`).
    pub(crate) fn alloc(&self, val: i64, next: *mut Node) -> *mut Node {
        if let Some(reused) = self.free.lock().unwrap().pop() {
            // SAFETY: nothing else holds a live reference to a recycled
            // node; it was only reachable from a record no thread can
            // still be reading (guaranteed by the adapter's after_persist
            // timing).
            unsafe {
                (*reused).val = val;
                (*reused).next = AtomicPtr::new(next);
            }
            return reused;
        }
        self.region
            .alloc(Node {
                val,
                next: AtomicPtr::new(next),
            })
            .expect("NVMM region exhausted") as *mut Node
    }

    /// Returns a popped/dequeued node to the free list (`synchRecycleObj`).
    /// Must only be called once no combiner or piggybacker can still
    /// observe the node through a published record — the adapter only
    /// calls this from an `after_persist` hook, after the record that
    /// stopped referencing it is already durable.
    pub(crate) fn recycle(&self, node: *mut Node) {
        self.free.lock().unwrap().push(node);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_then_recycle_reuses_the_same_node() {
        let region = Box::leak(Box::new(NvmmRegion::anonymous(1 << 16).unwrap()));
        let pool = NodePool::new(region);
        let a = pool.alloc(1, std::ptr::null_mut());
        pool.recycle(a);
        let b = pool.alloc(2, std::ptr::null_mut());
        assert_eq!(a, b);
        unsafe {
            assert_eq!((*b).val, 2);
        }
    }
}
