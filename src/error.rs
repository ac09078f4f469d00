//! Error types surfaced by the core.
//!
//! Per the sequential-object contract, [`crate::pbcomb::PBComb::apply_op`]
//! and [`crate::pwfcomb::PWFComb::apply_op`] are total: they always return a
//! value, never a `Result`. The only fallible entry point is engine
//! initialization, where the platform's NVMM allocator can fail.

use thiserror::Error;

/// Failure during [`crate::pbcomb::PBComb::init`] / [`crate::pwfcomb::PWFComb::init`].
#[derive(Debug, Error)]
pub enum InitError {
    /// The requested thread count exceeds [`crate::config::MAX_THREADS`].
    #[error("requested {requested} threads, but this build caps at {max}")]
    TooManyThreads {
        /// Threads requested by the caller.
        requested: usize,
        /// Compile-time ceiling.
        max: usize,
    },

    /// The platform's NVMM-backed allocator could not reserve memory.
    #[error("failed to allocate NVMM-backed region: {0}")]
    Nvmm(#[from] crate::platform::nvmm::NvmmError),
}
