//! Fixed-capacity binary min-heap, the simplest adapter: its whole state
//! lives inline in the combining engine's record (no auxiliary pool, no
//! hooks) so it only ever needs a [`PBComb`] instance.
//!
//! Ported from the original's `heap.h`: rather than one allocated array per
//! level, each level's elements live at a fixed offset into one flat array
//! — level `L` starts at `2^L - 1` — which is what the original's
//! `heap_arrays[i] = &bulk[(1 << i) - 1]` pointer table expressed as
//! aliases into the same backing array.

use crate::error::InitError;
use crate::pbcomb::{self, PBComb};
use crate::platform::nvmm::NvmmRegion;
use crate::sequential::SequentialObject;

/// How many levels the fixed-size heap supports (`INITIAL_HEAP_LEVELS`).
const LEVELS: u32 = 10;
/// Total element capacity across every level (`INITIAL_HEAP_SIZE`).
const CAPACITY: usize = 1 << LEVELS;

/// Returned by `delete_min`/`get_min` on an empty heap, and by `insert` on
/// either success or a full heap, each distinguishable from the other.
pub const EMPTY_HEAP: i64 = i64::MIN;
/// Returned by `insert` when the element was accepted.
pub const INSERT_SUCCESS: i64 = 0;
/// Returned by `insert` when the heap has no remaining capacity.
pub const INSERT_FAIL: i64 = -1;

const OP_INSERT: i64 = 0x1000_0000_0000_0000;
const OP_DELETE_MIN: i64 = 0x2000_0000_0000_0000;
const OP_GET_MIN: i64 = 0x3000_0000_0000_0000;
const OP_MASK: i64 = 0x7000_0000_0000_0000;
const VAL_MASK: i64 = !OP_MASK;

fn level_offset(level: u32) -> usize {
    (1usize << level) - 1
}

fn level_size(level: u32) -> u32 {
    1 << level
}

/// `EMPTY_HEAP`'s bit pattern (`i64::MIN`) must sort as *larger* than every
/// real payload so unused cells sink to the bottom during sifting, the way
/// the original's `uint64_t`-typed `bulk` array compares it. `i64` ordering
/// would instead treat it as the smallest value, so every comparison here
/// goes through the bit pattern as `u64` rather than through `i64`'s own
/// `Ord`.
fn heap_lt(a: i64, b: i64) -> bool {
    (a as u64) < (b as u64)
}

fn heap_gt(a: i64, b: i64) -> bool {
    (a as u64) > (b as u64)
}

/// Sequential, unsynchronized binary min-heap of bounded capacity.
#[derive(Clone)]
pub(crate) struct HeapState {
    bulk: Vec<i64>,
    /// Total live elements, tracked independently of `last_used_level_pos`
    /// so emptiness doesn't depend on which level currently happens to be
    /// the last one (see `get_min`).
    count: u32,
    last_used_level: u32,
    last_used_level_pos: u32,
    last_used_level_size: u32,
}

impl Default for HeapState {
    fn default() -> Self {
        Self {
            bulk: vec![EMPTY_HEAP; CAPACITY],
            count: 0,
            last_used_level: 0,
            last_used_level_pos: 0,
            last_used_level_size: 1,
        }
    }
}

impl HeapState {
    fn at(&self, level: u32, pos: u32) -> i64 {
        self.bulk[level_offset(level) + pos as usize]
    }

    fn set(&mut self, level: u32, pos: u32, val: i64) {
        self.bulk[level_offset(level) + pos as usize] = val;
    }

    fn correct_down_heap(&mut self, mut level: u32, mut pos: u32) {
        while level > 0 {
            let parent_pos = pos / 2;
            if heap_lt(self.at(level, pos), self.at(level - 1, parent_pos)) {
                let tmp = self.at(level - 1, parent_pos);
                self.set(level - 1, parent_pos, self.at(level, pos));
                self.set(level, pos, tmp);
            } else {
                break;
            }
            level -= 1;
            pos = parent_pos;
        }
    }

    fn correct_up_heap(&mut self) {
        let mut level = 0;
        let mut pos = 0;
        while level < self.last_used_level {
            let left = 2 * pos;
            let right = 2 * pos + 1;
            if heap_gt(self.at(level, pos), self.at(level + 1, left))
                || heap_gt(self.at(level, pos), self.at(level + 1, right))
            {
                if heap_gt(self.at(level + 1, left), self.at(level + 1, right)) {
                    let tmp = self.at(level + 1, right);
                    self.set(level + 1, right, self.at(level, pos));
                    self.set(level, pos, tmp);
                    pos = right;
                } else {
                    let tmp = self.at(level + 1, left);
                    self.set(level + 1, left, self.at(level, pos));
                    self.set(level, pos, tmp);
                    pos = left;
                }
            } else {
                break;
            }
            level += 1;
        }
    }

    fn get_min(&self) -> i64 {
        if self.count != 0 {
            self.at(0, 0)
        } else {
            EMPTY_HEAP
        }
    }

    /// Moves the last live slot of the current last level to the root and
    /// blanks the slot it vacated, so that slot reads back as `EMPTY_HEAP`
    /// (sorting as the max) rather than leftover real data the next time
    /// `correct_up_heap` walks a comparison across the level boundary.
    fn promote_last(&mut self, level: u32, pos: u32) {
        let moved = self.at(level, pos);
        self.set(level, pos, EMPTY_HEAP);
        self.set(0, 0, moved);
        self.correct_up_heap();
    }

    fn delete_min(&mut self) -> i64 {
        let ret = self.get_min();
        if ret != EMPTY_HEAP {
            self.count -= 1;
            if self.last_used_level_pos > 0 {
                self.last_used_level_pos -= 1;
                let pos = self.last_used_level_pos;
                self.promote_last(self.last_used_level, pos);
            } else if self.last_used_level > 0 {
                self.last_used_level -= 1;
                self.last_used_level_size = level_size(self.last_used_level);
                self.last_used_level_pos = self.last_used_level_size - 1;
                let pos = self.last_used_level_pos;
                self.promote_last(self.last_used_level, pos);
            } else {
                self.last_used_level_pos = 0;
            }
        }
        ret
    }

    fn insert(&mut self, el: i64) -> i64 {
        if self.last_used_level_pos < self.last_used_level_size {
            self.set(self.last_used_level, self.last_used_level_pos, el);
            self.last_used_level_pos += 1;
            self.correct_down_heap(self.last_used_level, self.last_used_level_pos - 1);
            self.count += 1;
            INSERT_SUCCESS
        } else if self.last_used_level < LEVELS - 1 {
            self.last_used_level_size *= 2;
            self.last_used_level += 1;
            self.last_used_level_pos = 1;
            self.set(self.last_used_level, 0, el);
            self.correct_down_heap(self.last_used_level, 0);
            self.count += 1;
            INSERT_SUCCESS
        } else {
            INSERT_FAIL
        }
    }
}

impl SequentialObject for HeapState {
    fn apply(&mut self, arg: i64, _pid: usize) -> i64 {
        let op = arg & OP_MASK;
        let val = arg & VAL_MASK;
        match op {
            OP_INSERT => self.insert(val),
            OP_DELETE_MIN => self.delete_min(),
            OP_GET_MIN => self.get_min(),
            _ => panic!("invalid heap operation tag in arg={arg}"),
        }
    }
}

/// The PBcomb-backed persistent fixed-capacity heap.
pub struct PbHeap {
    engine: PBComb<HeapState>,
}

/// Per-thread state for [`PbHeap`].
pub struct PbHeapThreadLocal {
    inner: pbcomb::ThreadLocal<HeapState>,
}

impl std::fmt::Debug for PbHeap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PbHeap").finish_non_exhaustive()
    }
}

impl std::fmt::Debug for PbHeapThreadLocal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PbHeapThreadLocal")
            .field("inner", &self.inner)
            .finish()
    }
}

impl PbHeap {
    /// Builds a fresh, empty heap backed by `region`.
    pub fn init(region: &NvmmRegion, nthreads: usize) -> Result<Self, InitError> {
        let engine = PBComb::init(region, nthreads, HeapState::default())?;
        Ok(Self { engine })
    }

    /// Builds the per-thread state `pid` must hold for the lifetime of its
    /// use of this heap.
    pub fn thread_init(&self, region: &NvmmRegion, pid: usize) -> Result<PbHeapThreadLocal, InitError> {
        Ok(PbHeapThreadLocal {
            inner: self.engine.thread_init(region, pid)?,
        })
    }

    /// Inserts `val`, returning [`INSERT_SUCCESS`] or [`INSERT_FAIL`] if the
    /// heap is at capacity. `val` must fit in [`VAL_MASK`] (61 bits).
    pub fn insert(&self, tl: &mut PbHeapThreadLocal, val: i64, pid: usize) -> i64 {
        debug_assert_eq!(val & OP_MASK, 0, "value overflows the tag-reserved high bits");
        self.engine.apply_op(&mut tl.inner, OP_INSERT | val, pid)
    }

    /// Removes and returns the minimum element, or [`EMPTY_HEAP`].
    pub fn delete_min(&self, tl: &mut PbHeapThreadLocal, pid: usize) -> i64 {
        self.engine.apply_op(&mut tl.inner, OP_DELETE_MIN, pid)
    }

    /// Returns (without removing) the minimum element, or [`EMPTY_HEAP`].
    pub fn get_min(&self, tl: &mut PbHeapThreadLocal, pid: usize) -> i64 {
        self.engine.apply_op(&mut tl.inner, OP_GET_MIN, pid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn region() -> NvmmRegion {
        NvmmRegion::anonymous(1 << 20).unwrap()
    }

    #[test]
    fn insert_then_drain_in_sorted_order() {
        let region = region();
        let heap = PbHeap::init(&region, 1).unwrap();
        let mut tl = heap.thread_init(&region, 0).unwrap();
        for v in [5, 3, 8, 1, 4] {
            assert_eq!(heap.insert(&mut tl, v, 0), INSERT_SUCCESS);
        }
        let mut drained = Vec::new();
        for _ in 0..5 {
            drained.push(heap.delete_min(&mut tl, 0));
        }
        assert_eq!(drained, vec![1, 3, 4, 5, 8]);
        assert_eq!(heap.delete_min(&mut tl, 0), EMPTY_HEAP);
    }

    #[test]
    fn three_delete_mins_and_remaining_minimum() {
        let region = region();
        let heap = PbHeap::init(&region, 1).unwrap();
        let mut tl = heap.thread_init(&region, 0).unwrap();
        for v in [10, 20, 5, 15, 5, 1] {
            heap.insert(&mut tl, v, 0);
        }
        let popped: Vec<_> = (0..3).map(|_| heap.delete_min(&mut tl, 0)).collect();
        assert_eq!(popped, vec![1, 5, 5]);
        assert_eq!(heap.get_min(&mut tl, 0), 10);
    }
}
