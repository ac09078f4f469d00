//! NUMA core-preference queries.
//!
//! The original C consults `numa_node_of_cpu(preferedCoreOfThread(pid))` to
//! pick a thread's activation bank. We approximate "preferred core" with
//! `core_affinity`'s enumeration of the cores available to this process
//! (the same crate `node-replication`'s benchmarks use for pinning), and
//! fold the core index down to a bank with a modulo — there is no portable
//! way to ask the kernel for a NUMA node id without linking `libnuma`,
//! which the distilled spec explicitly treats as a platform-layer concern
//! we are not obligated to wire up for real hardware.

use std::sync::OnceLock;

static CORES: OnceLock<Vec<core_affinity::CoreId>> = OnceLock::new();

fn cores() -> &'static [core_affinity::CoreId] {
    CORES
        .get_or_init(|| core_affinity::get_core_ids().unwrap_or_default())
        .as_slice()
}

/// Returns a stable "preferred core" id for `pid`, used only to fold into
/// [`fad_division`]. Threads are assigned round-robin over the cores this
/// process can observe.
pub fn preferred_core(pid: usize) -> usize {
    let cores = cores();
    if cores.is_empty() {
        pid
    } else {
        cores[pid % cores.len()].id
    }
}

/// Folds a preferred core id into one of `divisions` activation banks, the
/// `fad_division = numa_node_of_cpu(preferred_core) % FAD_DIVISIONS`
/// computation from the distilled spec.
pub fn fad_division(pid: usize, divisions: usize) -> usize {
    preferred_core(pid) % divisions.max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn division_is_in_range() {
        for pid in 0..16 {
            assert!(fad_division(pid, 2) < 2);
        }
    }
}
