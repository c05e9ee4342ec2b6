//! Native heap statistics and trimming through jemalloc.
//!
//! With jemalloc as the global allocator heap usage can be read precisely:
//! small size classes are carved out of shared slabs (`heap`), large ones get
//! their own extents (`mmap`). Without the `jemalloc` feature both read as
//! zero and trimming is a no-op.
//!
//! The library never installs the allocator itself; the final binary (or test
//! binary) does:
//!
//! ```ignore
//! use leakprobe::collector::jemalloc::Jemalloc;
//!
//! #[global_allocator]
//! static GLOBAL: Jemalloc = Jemalloc;
//! ```
//!
//! If another allocator is installed, jemalloc stays idle and the `heap` and
//! `mmap` metrics never change.

/// Bytes in use by the allocator, split by size class family.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeapStats {
    pub small_allocated: u64,
    pub large_allocated: u64,
}

#[cfg(all(feature = "jemalloc", not(target_env = "msvc")))]
pub use tikv_jemallocator::Jemalloc;

#[cfg(all(feature = "jemalloc", not(target_env = "msvc")))]
mod imp {
    use std::ffi::{CStr, c_void};
    use std::ptr;

    use super::HeapStats;

    #[cfg(test)]
    #[global_allocator]
    static GLOBAL: super::Jemalloc = super::Jemalloc;

    /// Advances the stats epoch so subsequent reads see fresh counters.
    fn refresh() {
        let mut epoch: u64 = 1;
        let mut len = std::mem::size_of::<u64>();
        // SAFETY: "epoch" is a read-write u64 control; both buffers are valid
        // for the advertised length.
        unsafe {
            tikv_jemalloc_sys::mallctl(
                c"epoch".as_ptr().cast(),
                (&mut epoch as *mut u64).cast::<c_void>(),
                &mut len,
                (&mut epoch as *mut u64).cast::<c_void>(),
                len,
            );
        }
    }

    fn read_size(name: &CStr) -> Option<u64> {
        let mut value: usize = 0;
        let mut len = std::mem::size_of::<usize>();
        // SAFETY: the named controls are read-only size_t values.
        let rc = unsafe {
            tikv_jemalloc_sys::mallctl(
                name.as_ptr().cast(),
                (&mut value as *mut usize).cast::<c_void>(),
                &mut len,
                ptr::null_mut(),
                0,
            )
        };
        (rc == 0).then_some(value as u64)
    }

    pub(super) fn heap_stats() -> HeapStats {
        refresh();
        // MALLCTL_ARENAS_ALL = 4096: merged statistics for every arena.
        HeapStats {
            small_allocated: read_size(c"stats.arenas.4096.small.allocated").unwrap_or(0),
            large_allocated: read_size(c"stats.arenas.4096.large.allocated").unwrap_or(0),
        }
    }

    pub(super) fn release_memory_to_os() {
        // SAFETY: both controls are write-only triggers that take no input
        // and produce no output, so all buffer pointers are null with length 0.
        unsafe {
            // Regions cached by this thread count as allocated; hand them back
            // to their arenas first so they can be purged.
            tikv_jemalloc_sys::mallctl(
                c"thread.tcache.flush".as_ptr().cast(),
                ptr::null_mut(),
                ptr::null_mut(),
                ptr::null_mut(),
                0,
            );
            // MALLCTL_ARENAS_ALL = 4096: purge dirty pages from ALL jemalloc arenas.
            tikv_jemalloc_sys::mallctl(
                c"arena.4096.purge".as_ptr().cast(),
                ptr::null_mut(),
                ptr::null_mut(),
                ptr::null_mut(),
                0,
            );
        }
    }
}

#[cfg(not(all(feature = "jemalloc", not(target_env = "msvc"))))]
mod imp {
    use super::HeapStats;

    pub(super) fn heap_stats() -> HeapStats {
        HeapStats::default()
    }

    pub(super) fn release_memory_to_os() {}
}

/// Returns `true` if jemalloc is compiled in. The statistics only move when
/// the binary also installs [`Jemalloc`] as its global allocator.
pub const fn available() -> bool {
    cfg!(all(feature = "jemalloc", not(target_env = "msvc")))
}

/// Reads current allocator statistics.
pub fn heap_stats() -> HeapStats {
    imp::heap_stats()
}

/// Releases unused memory back to the operating system.
pub fn release_memory_to_os() {
    imp::release_memory_to_os()
}
