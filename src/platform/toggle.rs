//! Toggle vectors: the bit-parallel "which requests have been served" sets
//! PWFcomb uses for its activation arrays and state-record deactivate sets.
//!
//! The original C packs `nthreads` bits across a handful of machine words
//! ("banks") and toggles a thread's bit with a bare `fetch_add` of a
//! precomputed power-of-two, relying on the fact that adding `2^i` to a word
//! always flips bit `i` regardless of carries further up — carries into
//! neighbouring bits are tolerated because every protocol check only ever
//! asks "is bit `i` set", never trusts a whole word's value across threads.
//! `AtomicU64::fetch_xor` gives the same "this thread's own bit
//! deterministically flips" guarantee without relying on that carry
//! behaviour, so we use it instead of reproducing the fetch-add trick.
//!
//! Multi-bank vectors exist so a combiner only has to touch the one 64-bit
//! word containing its own bit (`TVEC_*_BANK` in the original) instead of
//! the whole vector, which matters once `nthreads` exceeds 64.

use crate::platform::nvmm::{NvmmError, NvmmRegion};
use std::sync::atomic::{AtomicU64, Ordering};

const BANK_BITS: usize = 64;

enum Storage {
    /// Thread-local scratch vectors: ordinary heap memory (`TVEC_INIT`).
    /// Leaked once, like every other never-freed allocation in this crate.
    Owned(&'static [AtomicU64]),
    /// Vectors embedded in the engine's persistent structures
    /// (`TVEC_INIT_AT`): backed by the NVMM region directly.
    Nvmm(&'static [AtomicU64]),
}

impl Storage {
    fn as_slice(&self) -> &'static [AtomicU64] {
        match self {
            Storage::Owned(s) | Storage::Nvmm(s) => s,
        }
    }
}

/// A bit vector over `0..nthreads`, split into 64-bit banks.
pub struct ToggleVector {
    banks: Storage,
    nthreads: usize,
}

impl std::fmt::Debug for ToggleVector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToggleVector")
            .field("nthreads", &self.nthreads)
            .field("nbanks", &self.banks.as_slice().len())
            .finish()
    }
}

fn bank_of(pid: usize) -> usize {
    pid / BANK_BITS
}

fn mask_of(pid: usize) -> u64 {
    1u64 << (pid % BANK_BITS)
}

fn nbanks_for(nthreads: usize) -> usize {
    ((nthreads + BANK_BITS - 1) / BANK_BITS).max(1)
}

impl ToggleVector {
    /// Allocates a zeroed, heap-backed scratch vector wide enough for
    /// `nthreads` bits (`TVEC_INIT`).
    pub fn new(nthreads: usize) -> Self {
        let banks: Vec<AtomicU64> = (0..nbanks_for(nthreads))
            .map(|_| AtomicU64::new(0))
            .collect();
        Self {
            banks: Storage::Owned(banks.leak()),
            nthreads,
        }
    }

    /// Allocates a zeroed vector out of `region`'s NVMM-backed memory
    /// (`TVEC_INIT_AT`), for vectors that must survive process restart —
    /// the activation arrays and state-record deactivate/index sets.
    pub fn at(nthreads: usize, region: &NvmmRegion) -> Result<Self, NvmmError> {
        // SAFETY: `AtomicU64`'s all-zero bit pattern is a valid zero value.
        let banks = unsafe { region.alloc_zeroed_slice::<AtomicU64>(nbanks_for(nthreads))? };
        Ok(Self {
            banks: Storage::Nvmm(banks),
            nthreads,
        })
    }

    /// Number of 64-bit banks backing this vector.
    pub fn nbanks(&self) -> usize {
        self.banks.as_slice().len()
    }

    /// Raw addresses of each backing bank, for the durability layer to
    /// flush when this vector is part of a persisted record.
    pub fn bank_addrs(&self) -> impl Iterator<Item = *const u8> + '_ {
        self.banks
            .as_slice()
            .iter()
            .map(|b| b as *const AtomicU64 as *const u8)
    }

    /// Which bank holds `pid`'s bit — callers pass this to the `_bank`
    /// variants below so only one word is touched.
    pub fn bank_of(&self, pid: usize) -> usize {
        debug_assert!(pid < self.nthreads);
        bank_of(pid)
    }

    /// Atomically flips `pid`'s bit (`TVEC_ATOMIC_ADD_BANK`). Acts as a full
    /// write barrier the way the original's fetch-add does.
    pub fn toggle(&self, pid: usize) {
        let b = bank_of(pid);
        self.banks.as_slice()[b].fetch_xor(mask_of(pid), Ordering::AcqRel);
    }

    /// Reads `pid`'s bit.
    pub fn is_set(&self, pid: usize) -> bool {
        let b = bank_of(pid);
        self.banks.as_slice()[b].load(Ordering::Acquire) & mask_of(pid) != 0
    }

    /// `dest.bank[mybank] = a.bank[mybank] ^ b.bank[mybank]`
    /// (`TVEC_XOR_BANKS`): only the bank containing the caller's own bit is
    /// refreshed, the rest of `dest` is left as-is.
    pub fn xor_bank_from(&self, a: &ToggleVector, b: &ToggleVector, bank: usize) {
        let v = a.banks.as_slice()[bank].load(Ordering::Acquire)
            ^ b.banks.as_slice()[bank].load(Ordering::Acquire);
        self.banks.as_slice()[bank].store(v, Ordering::Release);
    }

    /// `dest = dest | other` across every bank (`TVEC_OR`). `other` is read
    /// with acquire ordering since it may be another thread's shared vector.
    pub fn or_with(&self, other: &ToggleVector) {
        for (d, o) in self.banks.as_slice().iter().zip(other.banks.as_slice()) {
            let v = o.load(Ordering::Acquire);
            if v != 0 {
                d.fetch_or(v, Ordering::AcqRel);
            }
        }
    }

    /// `dest = a ^ b` across every bank (`TVEC_XOR`).
    pub fn xor_from(&self, a: &ToggleVector, b: &ToggleVector) {
        for ((d, x), y) in self
            .banks
            .as_slice()
            .iter()
            .zip(a.banks.as_slice())
            .zip(b.banks.as_slice())
        {
            d.store(
                x.load(Ordering::Acquire) ^ y.load(Ordering::Acquire),
                Ordering::Release,
            );
        }
    }

    /// Flips a single bit directly, without the xor-toggle indirection.
    /// Used on thread-local scratch vectors that are never shared.
    pub fn reverse_bit(&self, pid: usize) {
        let b = bank_of(pid);
        self.banks.as_slice()[b].fetch_xor(mask_of(pid), Ordering::Relaxed);
    }

    /// Zeroes every bank (`TVEC_SET_ZERO`).
    pub fn set_zero(&self) {
        for bank in self.banks.as_slice() {
            bank.store(0, Ordering::Relaxed);
        }
    }

    /// Copies `src` into `self` bank by bank (`TVEC_COPY`).
    pub fn copy_from(&self, src: &ToggleVector) {
        for (d, s) in self.banks.as_slice().iter().zip(src.banks.as_slice()) {
            d.store(s.load(Ordering::Acquire), Ordering::Release);
        }
    }
}

impl Clone for ToggleVector {
    fn clone(&self) -> Self {
        let clone = ToggleVector::new(self.nthreads);
        clone.copy_from(self);
        clone
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn toggle_flips_only_its_own_bit() {
        let v = ToggleVector::new(128);
        assert!(!v.is_set(5));
        v.toggle(5);
        assert!(v.is_set(5));
        assert!(!v.is_set(70));
        v.toggle(70);
        assert!(v.is_set(70));
        v.toggle(5);
        assert!(!v.is_set(5));
    }

    #[test]
    fn xor_and_or_match_bitwise_semantics() {
        let a = ToggleVector::new(64);
        let b = ToggleVector::new(64);
        a.toggle(1);
        a.toggle(2);
        b.toggle(2);
        b.toggle(3);

        let diffs = ToggleVector::new(64);
        diffs.xor_from(&a, &b);
        assert!(diffs.is_set(1));
        assert!(!diffs.is_set(2));
        assert!(diffs.is_set(3));

        let unioned = ToggleVector::new(64);
        unioned.or_with(&a);
        unioned.or_with(&b);
        assert!(unioned.is_set(1));
        assert!(unioned.is_set(2));
        assert!(unioned.is_set(3));
    }

    #[test]
    fn copy_and_zero_roundtrip() {
        let a = ToggleVector::new(64);
        a.toggle(10);
        let b = ToggleVector::new(64);
        b.copy_from(&a);
        assert!(b.is_set(10));
        b.set_zero();
        assert!(!b.is_set(10));
        assert!(a.is_set(10));
    }
}
