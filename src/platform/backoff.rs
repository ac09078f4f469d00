//! Adaptive backoff for PWFcomb, and the spin/yield primitive PBcomb
//! waiters use.
//!
//! The distilled spec calls for exponential backoff, halved on success and
//! doubled on CAS failure, capped at `MAX_BACK`. The original C inlines a
//! busy-spin loop of `backoff_limit` empty iterations under
//! `synchFastRandomRange(1, nthreads) > 1`, skipping the spin roughly 1/n of
//! the time to avoid every thread backing off in lockstep. We keep that
//! shape rather than reaching for `crossbeam_utils::Backoff` wholesale,
//! because the engine needs the backoff *value* to persist across
//! `apply_op` calls in `ThreadLocal`, not just within one call.

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use std::cell::Cell;

/// Per-thread adaptive backoff state for PWFcomb.
pub struct Backoff {
    current: Cell<u32>,
    max: u32,
    rng: std::cell::RefCell<SmallRng>,
}

impl Backoff {
    /// `max` is the engine's configured ceiling (`max_backoff * 100` in the
    /// original C, applied by the caller before constructing this).
    pub fn new(max: u32) -> Self {
        Self {
            current: Cell::new(1),
            max,
            rng: std::cell::RefCell::new(SmallRng::from_entropy()),
        }
    }

    /// Spins for the current backoff amount, unless the fast-RNG roll tells
    /// us to skip it this round (matching `synchFastRandomRange(1, n) > 1`
    /// gating in the original).
    pub fn spin(&self, nthreads: usize) {
        let roll = self.rng.borrow_mut().gen_range(1..=nthreads.max(1));
        if roll <= 1 {
            return;
        }
        let limit = self.current.get();
        for _ in 0..limit {
            std::hint::spin_loop();
        }
    }

    /// Called after a successful combine attempt: halve backoff, with the
    /// low bit forced to 1 so it never collapses to zero (`(b >> 1) | 1` in
    /// the original).
    pub fn on_success(&self) {
        self.current.set((self.current.get() >> 1) | 1);
    }

    /// Called after a failed CAS on the versioned pointer: double backoff,
    /// capped at `max`.
    pub fn on_failure(&self) {
        let doubled = self.current.get().saturating_mul(2);
        self.current.set(doubled.min(self.max));
    }

    /// Under detected oversubscription the original reschedules instead of
    /// spinning (`synchIsSystemOversubscribed`); we approximate
    /// oversubscription detection with a caller-supplied flag, since
    /// reliably measuring it from userspace is itself a platform concern.
    pub fn reschedule_if_oversubscribed(&self, nthreads: usize, oversubscribed: bool) {
        if !oversubscribed {
            return;
        }
        let roll = self.rng.borrow_mut().gen_range(1..=nthreads.max(1));
        if roll > 4 {
            std::thread::yield_now();
        }
    }
}

impl std::fmt::Debug for Backoff {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backoff")
            .field("current", &self.current.get())
            .field("max", &self.max)
            .finish()
    }
}

/// The spin/yield primitive PBcomb waiters use while the combiner holds the
/// lock (`synchResched` in the original).
#[inline]
pub fn resched() {
    std::thread::yield_now();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn halves_and_doubles_within_bounds() {
        let b = Backoff::new(64);
        for _ in 0..10 {
            b.on_failure();
        }
        assert!(b.current.get() <= 64);
        b.on_success();
        assert!(b.current.get() >= 1);
    }
}
