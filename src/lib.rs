//! Persistent software-combining objects.
//!
//! This crate provides two generic combining engines — [`pbcomb`] (a
//! blocking, lock-based combiner) and [`pwfcomb`] (a wait-free combiner) —
//! that turn an arbitrary sequential object into a concurrent,
//! durable-linearizable one: every linearized operation is made durable in
//! non-volatile main memory before its caller observes a result, and any
//! correct process can recover the object's state after a full-system
//! crash by re-reading one published pointer.
//!
//! Concrete sequential objects ([`ds::heap`], [`ds::queue`], [`ds::stack`])
//! are provided as adapters over either engine; new ones only need to
//! implement [`sequential::SequentialObject`].

// # Tries to deny all lints (`rustc -W help`).
#![deny(absolute_paths_not_starting_with_crate)]
#![deny(anonymous_parameters)]
#![deny(deprecated_in_future)]
#![deny(explicit_outlives_requirements)]
#![deny(keyword_idents)]
#![deny(macro_use_extern_crate)]
#![deny(missing_debug_implementations)]
#![deny(non_ascii_idents)]
#![deny(rust_2018_idioms)]
#![deny(trivial_numeric_casts)]
#![deny(unused_extern_crates)]
#![deny(unused_import_braces)]
#![deny(variant_size_differences)]
#![deny(rustdoc::invalid_html_tags)]
#![deny(missing_docs)]
#![deny(unreachable_pub)]
#![deny(single_use_lifetimes)]
#![deny(unused_lifetimes)]
#![allow(clippy::type_complexity)]
#![allow(clippy::too_many_arguments)]
#![recursion_limit = "512"]

/// Compile-time tunables shared by both engines and every adapter.
pub mod config;
/// Concrete sequential objects adapted to run atop the combining engines.
pub mod ds;
/// Initialization failure kinds.
pub mod error;
/// The blocking, lock-based combining engine.
pub mod pbcomb;
/// The versioned `(seq, index)` pointer packed into the engine's published
/// atomic word.
pub mod pointer;
/// Durability, NUMA, scheduling, and NVMM-allocation primitives.
pub mod platform;
/// The wait-free combining engine.
pub mod pwfcomb;
/// The physical layout of a published combine record.
pub mod record;
/// The serial-object contract the engines consume.
pub mod sequential;
/// Always-on debug counters exposed by both engines.
pub mod stats;
