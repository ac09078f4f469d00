//! The platform layer: everything the combining engines need from the
//! machine and the OS, kept separate from the combining protocol itself so
//! the engines read as pure algorithm.
//!
//! Grounded in the original C's `primitives/` directory (CAS/fetch-add
//! wrappers, `synchGetPersistentMemory`, `synchFastRandomRange`,
//! `preferedCoreOfThread`) and, for the durability barrier, `config.h`'s
//! `use_clwb`/`use_clflushopt`/`use_msync` compile-time selection.

pub mod backoff;
pub mod durability;
pub mod numa;
pub mod nvmm;
pub mod sched;
pub mod toggle;
