//! Compile-time tunables for the combining engines.
//!
//! These mirror the constants hard-coded into the original C implementation's
//! `config.h` and the per-algorithm headers (`pbcomb.h`, `pwfcomb.h`). The
//! upstream authors call them empirical; we keep them as `const`s rather than
//! runtime parameters so call sites stay branch-free, and so a fork can
//! re-tune them without touching the engines.

/// Hard ceiling on the number of threads an engine instance can serve.
///
/// Sized so that a [`crate::platform::toggle::ToggleVec`] and the PWFcomb
/// comb-round lattice fit in a handful of cache lines for realistic thread
/// counts; raise it if you need more than 64 announcers.
pub const MAX_THREADS: usize = 64;

/// Upper bound on combine passes per [`crate::pbcomb::PBComb::apply_op`] call.
///
/// The combiner stops early once a pass serves zero requests, so this only
/// bounds the pathological case where new requests keep arriving.
pub const COMBINING_ROUNDS: usize = 20;

/// Number of private state-record slots each PBcomb thread round-robins
/// through when acting as combiner.
pub const PBCOMB_POOL_SIZE: usize = 2;

/// Number of private state-record slots each PWFcomb thread owns (besides
/// the shared initial slot).
pub const PWF_LOCAL_POOL_SIZE: usize = 2;

/// Number of NUMA-bucketed activation banks PWFcomb fans announcements
/// across, to keep the fetch-add that publishes a request from becoming a
/// single point of contention.
pub const FAD_DIVISIONS: usize = 2;

/// Default backoff ceiling for PWFcomb's exponential backoff, in spin
/// iterations. Multiplied by 100 at init time in the original C
/// (`max_backoff * 100`); callers of [`crate::pwfcomb::PWFComb::init`]
/// supply the raw multiplier the same way.
pub const DEFAULT_MAX_BACKOFF: u32 = 100;

/// Platform cache line size in bytes. Every cross-thread-shared field in the
/// on-NVMM layout is padded to this via [`crossbeam_utils::CachePadded`].
pub const CACHE_LINE_SIZE: usize = 64;

/// Bit width of the sequence number packed into the versioned state pointer
/// `S`. See [`crate::pointer::VersionedPointer`].
pub const SEQ_BITS: u32 = 40;

/// Bit width of the record index packed into `S`.
pub const INDEX_BITS: u32 = 24;

static_assertions::const_assert_eq!(SEQ_BITS + INDEX_BITS, 64);
static_assertions::const_assert!(MAX_THREADS <= (1 << INDEX_BITS));
