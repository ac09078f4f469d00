//! Debug counters surfaced by both engines.
//!
//! The original C gates its `counter`/`rounds` bookkeeping behind `#ifdef
//! DEBUG`, compiling it out entirely in release builds. Ambient
//! observability is carried regardless of that non-goal here: the counters
//! are always collected (they're a handful of relaxed atomic increments,
//! not worth a feature flag) and exposed as a snapshot struct a caller can
//! log or assert on in a test.

use std::sync::atomic::{AtomicU64, Ordering};

/// Running counters for one engine instance, incremented by whichever
/// thread is currently combining.
#[derive(Debug, Default)]
pub struct EngineStats {
    /// Total operations ever served by any combiner.
    served: AtomicU64,
    /// Total combine-loop passes run across every `apply_op` call
    /// (`rounds` in the original).
    rounds: AtomicU64,
    /// Total times a thread became combiner and published successfully.
    combines: AtomicU64,
    /// PWFcomb only: total times a thread finished another combiner's
    /// unflushed publication instead of running its own combine.
    helped: AtomicU64,
}

/// Point-in-time copy of [`EngineStats`]'s counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// See [`EngineStats::served`].
    pub served: u64,
    /// See [`EngineStats::rounds`].
    pub rounds: u64,
    /// See [`EngineStats::combines`].
    pub combines: u64,
    /// See [`EngineStats::helped`].
    pub helped: u64,
}

impl EngineStats {
    pub(crate) fn record_round(&self, served_this_round: usize) {
        let _ = self.rounds.fetch_add(1, Ordering::Relaxed);
        let _ = self
            .served
            .fetch_add(served_this_round as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_combine(&self) {
        let _ = self.combines.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_helped(&self) {
        let _ = self.helped.fetch_add(1, Ordering::Relaxed);
    }

    /// Reads every counter with `Relaxed` ordering; the result is only ever
    /// a debugging aid, never load-bearing for correctness.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            served: self.served.load(Ordering::Relaxed),
            rounds: self.rounds.load(Ordering::Relaxed),
            combines: self.combines.load(Ordering::Relaxed),
            helped: self.helped.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let stats = EngineStats::default();
        stats.record_round(3);
        stats.record_round(0);
        stats.record_combine();
        stats.record_helped();
        let snap = stats.snapshot();
        assert_eq!(snap.served, 3);
        assert_eq!(snap.rounds, 2);
        assert_eq!(snap.combines, 1);
        assert_eq!(snap.helped, 1);
    }
}
