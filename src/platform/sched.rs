//! Scheduling primitive PBcomb waiters and PWFcomb backoff loops call into
//! instead of spinning forever.
//!
//! The distilled spec's "Scheduling" section asks for OS threads optionally
//! multiplexed with cooperative user-level fibers, with a reschedule
//! primitive under detected oversubscription. The original C's
//! `primitives/uthreads.c` is an empty translation unit in the upstream
//! sources we have (fiber support lives elsewhere in that project and was
//! never wired into the combining engines), so there is nothing concrete to
//! port. We model the primitive as a trait so a fiber runtime could be
//! plugged in later without touching the engines, and ship the only
//! implementation the corpus actually needs: a thin wrapper over
//! `std::thread::yield_now`.

/// Abstraction over "let someone else run for a bit". The engines call this
/// instead of assuming OS preemption; a cooperative-fiber scheduler would
/// implement this by yielding to its own run queue rather than trapping
/// into the kernel.
pub trait Scheduler {
    /// Give up the current timeslice.
    fn yield_now(&self);
}

/// The only [`Scheduler`] this crate ships: a direct `sched_yield` via the
/// standard library. Sufficient for the OS-thread model the engines are
/// tested under; a cooperative-fiber scheduler is an extension point (see
/// `DESIGN.md`).
#[derive(Debug, Default, Clone, Copy)]
pub struct OsThreadScheduler;

impl Scheduler for OsThreadScheduler {
    #[inline]
    fn yield_now(&self) {
        std::thread::yield_now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn os_thread_scheduler_yields_without_panicking() {
        OsThreadScheduler.yield_now();
    }
}
