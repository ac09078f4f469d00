//! The sequential-object contract both engines combine over.
//!
//! `sfunc` in the original C (`RetVal (*sfunc)(void *, ArgVal, int)`) is an
//! ordinary, non-persistent function applied to the in-memory `state`
//! field of a state record; the engine is solely responsible for making the
//! *record itself* durable afterwards. We express that as a plain trait
//! rather than a boxed closure so adapters (heap/queue/stack) can keep their
//! state type and its sequential semantics together, the way the original's
//! per-adapter `.c` files each define one `sfunc`-shaped function.

/// A linearizable object whose operations are applied one at a time by
/// whichever thread is currently combining.
pub trait SequentialObject {
    /// Applies one operation, returning the value to hand back to `pid`.
    /// Never fails: errors belong to the return-value encoding (adapters
    /// that can fail, like a full heap, encode failure in-band).
    fn apply(&mut self, arg: i64, pid: usize) -> i64;
}

/// A hook run once per combining pass, with the engine's `aux` state
/// (`final_persist_func`/`after_persist_func` in the original). Adapters use
/// this to persist auxiliary structures — e.g. a queue's tail pointer —
/// that live outside the sequential object's own state and so aren't
/// captured by the engine's record flush.
pub type PersistHook = Box<dyn Fn() + Send + Sync>;
