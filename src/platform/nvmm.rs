//! NVMM-backed allocation.
//!
//! The engines never free a state record or announcement slot once
//! allocated (see the distilled spec's "Lifetimes" note), so the allocator
//! only has to hand out monotonically increasing, cache-line-aligned chunks
//! of a region reserved once at init. This mirrors the original C
//! `synchGetPersistentMemory`/`synchGetAlignedMemory` helpers and the
//! teacher's Ralloc-backed pool, without pulling in an external C
//! allocator: we `mmap` the region ourselves.
//!
//! Two backends, matching the distilled spec's "Environment" compile-time
//! selection:
//! - `backend-nvmm`: maps a file on `PCOMB_NVMM_PATH` (default
//!   `/mnt/pmem0/pcomb.region`), the real NVMM/DAX path, analogous to
//!   `SYNCH_PERSISTENT_DEV_PATH`.
//! - default (`backend-shm`): anonymous `mmap`, analogous to
//!   `SYNCH_PERSISTENT_DEV_PATH_FALLBACK` (`/dev/shm`). Good enough for
//!   testing durability ordering without real persistent memory; a crash
//!   test can still validate recovery by reopening a *file*-backed region
//!   (see `NvmmRegion::open_file`), since anonymous memory doesn't survive
//!   a process exit.

use std::fs::OpenOptions;
use std::io;
use std::os::unix::io::AsRawFd;
use std::sync::atomic::{AtomicUsize, Ordering};

use thiserror::Error;

/// Default size of a freshly reserved region: 128 MiB, matching the
/// original C's `SYNCH_PERSISTENT_MEM_SIZE_INIT`.
pub const DEFAULT_REGION_SIZE: usize = 128 * 1024 * 1024;

/// Failure reserving or mapping NVMM-backed memory.
#[derive(Debug, Error)]
pub enum NvmmError {
    /// The region is exhausted; the caller should have sized it up front,
    /// since the core never frees.
    #[error("NVMM region exhausted: requested {requested} bytes, {remaining} remaining")]
    OutOfMemory {
        /// Bytes requested by the failed allocation.
        requested: usize,
        /// Bytes left in the region.
        remaining: usize,
    },

    /// The underlying `mmap`/file-open syscall failed.
    #[error("failed to map NVMM-backed region: {0}")]
    Io(#[from] io::Error),
}

enum Backing {
    Anon,
    File(std::fs::File),
}

/// A bump-allocated, never-freed arena standing in for a real NVMM region.
///
/// Every allocation is cache-line aligned, matching the `CACHE_ALIGN`
/// annotations throughout the original C headers.
pub struct NvmmRegion {
    base: *mut u8,
    size: usize,
    cursor: AtomicUsize,
    _backing: Backing,
}

impl std::fmt::Debug for NvmmRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NvmmRegion")
            .field("size", &self.size)
            .field("used", &self.cursor.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

// SAFETY: the region is only ever grown via the atomic cursor; individual
// allocations are disjoint and each caller is responsible for the
// synchronization of the `T` it places there (exactly as with a `Box`
// obtained from the global allocator).
unsafe impl Send for NvmmRegion {}
unsafe impl Sync for NvmmRegion {}

impl NvmmRegion {
    /// Reserves a region using whichever backend this build was compiled
    /// with: a real file on [`default_nvmm_path`] under the `backend-nvmm`
    /// feature, or an anonymous mapping otherwise (`backend-shm`, the
    /// default). Matches the distilled spec's "one configuration flag
    /// selects NVMM vs. a fallback shared-memory-backed file" — the
    /// selection is compile-time, not a runtime argument, exactly as that
    /// section specifies.
    pub fn open_default(size: usize) -> Result<Self, NvmmError> {
        #[cfg(feature = "backend-nvmm")]
        {
            Self::open_file(&default_nvmm_path(), size)
        }
        #[cfg(not(feature = "backend-nvmm"))]
        {
            Self::anonymous(size)
        }
    }

    /// Reserves an anonymous region of `size` bytes (the `backend-shm`
    /// fallback path).
    pub fn anonymous(size: usize) -> Result<Self, NvmmError> {
        let base = mmap_anon(size)?;
        Ok(Self {
            base,
            size,
            cursor: AtomicUsize::new(0),
            _backing: Backing::Anon,
        })
    }

    /// Reserves a region backed by a real file (used for the
    /// `backend-nvmm` path and for crash-recovery tests that need the
    /// mapping to outlive the mapping process).
    pub fn open_file(path: &std::path::Path, size: usize) -> Result<Self, NvmmError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;
        file.set_len(size as u64)?;
        let base = mmap_file(&file, size)?;
        Ok(Self {
            base,
            size,
            cursor: AtomicUsize::new(0),
            _backing: Backing::File(file),
        })
    }

    /// Allocates `size_of::<T>()` bytes, cache-line aligned, writes `init`
    /// into it, and returns a `'static` reference. The region is never
    /// unmapped for the engine's lifetime, so this is as sound as a
    /// `Box::leak`.
    pub fn alloc<T>(&self, init: T) -> Result<&'static mut T, NvmmError> {
        let line = crate::config::CACHE_LINE_SIZE;
        let want = std::mem::size_of::<T>();
        loop {
            let cur = self.cursor.load(Ordering::Relaxed);
            let aligned = (cur + line - 1) & !(line - 1);
            let next = aligned + want;
            if next > self.size {
                return Err(NvmmError::OutOfMemory {
                    requested: want,
                    remaining: self.size.saturating_sub(cur),
                });
            }
            if self
                .cursor
                .compare_exchange(cur, next, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
            {
                // SAFETY: `aligned + want <= size`, so this range is inside
                // `self.base`'s mapping and was never handed out before.
                unsafe {
                    let ptr = self.base.add(aligned) as *mut T;
                    ptr.write(init);
                    return Ok(&mut *ptr);
                }
            }
        }
    }

    /// Allocates `n` zero-initialized `T`s, cache-line aligned, and returns
    /// them as a `'static` slice. Used for the toggle vectors PWFcomb's
    /// activation arrays and state records need allocated directly out of
    /// persistent memory rather than the ordinary heap (`TVEC_INIT_AT` in
    /// the original, as opposed to the heap-backed `TVEC_INIT`).
    ///
    /// # Safety
    /// Callers must only use this for `T` whose all-zero bit pattern is a
    /// valid value (true of `AtomicU64`, integers, and `bool`).
    pub unsafe fn alloc_zeroed_slice<T>(&self, n: usize) -> Result<&'static mut [T], NvmmError> {
        let line = crate::config::CACHE_LINE_SIZE;
        let want = std::mem::size_of::<T>() * n;
        loop {
            let cur = self.cursor.load(Ordering::Relaxed);
            let aligned = (cur + line - 1) & !(line - 1);
            let next = aligned + want;
            if next > self.size {
                return Err(NvmmError::OutOfMemory {
                    requested: want,
                    remaining: self.size.saturating_sub(cur),
                });
            }
            if self
                .cursor
                .compare_exchange(cur, next, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
            {
                let ptr = self.base.add(aligned) as *mut T;
                std::ptr::write_bytes(ptr, 0u8, n);
                return Ok(std::slice::from_raw_parts_mut(ptr, n));
            }
        }
    }

    /// Bytes consumed so far; exposed for `EngineStats`/debugging.
    pub fn used(&self) -> usize {
        self.cursor.load(Ordering::Relaxed)
    }
}

impl Drop for NvmmRegion {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base as *mut libc::c_void, self.size);
        }
    }
}

fn mmap_anon(size: usize) -> Result<*mut u8, NvmmError> {
    unsafe {
        let ptr = libc::mmap(
            std::ptr::null_mut(),
            size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        );
        if ptr == libc::MAP_FAILED {
            return Err(NvmmError::Io(io::Error::last_os_error()));
        }
        Ok(ptr as *mut u8)
    }
}

fn mmap_file(file: &std::fs::File, size: usize) -> Result<*mut u8, NvmmError> {
    unsafe {
        let ptr = libc::mmap(
            std::ptr::null_mut(),
            size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED,
            file.as_raw_fd(),
            0,
        );
        if ptr == libc::MAP_FAILED {
            return Err(NvmmError::Io(io::Error::last_os_error()));
        }
        Ok(ptr as *mut u8)
    }
}

/// Default NVMM mount point, matching `SYNCH_PERSISTENT_DEV_PATH`.
pub fn default_nvmm_path() -> std::path::PathBuf {
    std::env::var("PCOMB_NVMM_PATH")
        .unwrap_or_else(|_| "/mnt/pmem0/pcomb.region".to_string())
        .into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[cfg(not(feature = "backend-nvmm"))]
    fn open_default_falls_back_to_anonymous_without_the_nvmm_feature() {
        let region = NvmmRegion::open_default(1 << 16).unwrap();
        let slot = region.alloc(5u64).unwrap();
        assert_eq!(*slot, 5);
    }

    #[test]
    fn bump_allocates_disjoint_cache_lines() {
        let region = NvmmRegion::anonymous(1 << 20).unwrap();
        let a = region.alloc(1u64).unwrap() as *mut u64 as usize;
        let b = region.alloc(2u64).unwrap() as *mut u64 as usize;
        assert_ne!(a, b);
        assert_eq!(b - a, crate::config::CACHE_LINE_SIZE);
    }

    #[test]
    fn out_of_memory_is_reported() {
        let region = NvmmRegion::anonymous(64).unwrap();
        assert!(region.alloc([0u8; 128]).is_err());
    }

    #[test]
    fn file_backed_region_roundtrips_through_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("region.pm");
        {
            let region = NvmmRegion::open_file(&path, 1 << 16).unwrap();
            let slot = region.alloc(7u64).unwrap();
            *slot = 99;
        }
        let region = NvmmRegion::open_file(&path, 1 << 16).unwrap();
        let reread = unsafe { *(region.base as *const u64) };
        assert_eq!(reread, 99);
    }
}
