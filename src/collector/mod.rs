//! Process metrics collection for the current process.
//!
//! The leak engine never reads the OS directly; it asks a [`MetricsProvider`]
//! for point-in-time snapshots.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                    MetricsProvider (trait)               │
//! │  ┌────────────────────────────┐  ┌─────────────────────┐ │
//! │  │     ProcfsProvider         │  │  ScriptedProvider   │ │
//! │  │  - /proc/self/status       │  │  (tests: replays    │ │
//! │  │  - /proc/self/smaps_rollup │  │   queued readings)  │ │
//! │  │  - /proc/self/fd, task     │  └─────────────────────┘ │
//! │  │  - jemalloc stats / purge  │                          │
//! │  └─────────────┬──────────────┘                          │
//! │         ┌──────▼──────┐                                  │
//! │         │  FileSystem │ (trait)                          │
//! │         └──────┬──────┘                                  │
//! └────────────────┼─────────────────────────────────────────┘
//!           ┌──────┴───────┐
//!     ┌─────▼─────┐  ┌─────▼─────┐
//!     │  RealFs   │  │  MockFs   │
//!     └───────────┘  └───────────┘
//! ```
//!
//! # Usage
//!
//! ```
//! use leakprobe::collector::{MetricsProvider, MockFs, ProcfsProvider};
//!
//! let mut fs = MockFs::new();
//! fs.add_file("/proc/self/status", "VmRSS:\t1024 kB\nVmSize:\t4096 kB\nThreads:\t2\n");
//! let provider = ProcfsProvider::new(fs, "/proc/self");
//! assert_eq!(provider.num_threads().unwrap().count, 2);
//! ```

pub mod jemalloc;
pub mod mock;
pub mod procfs;
pub mod snapshot;
pub mod traits;

pub use mock::{MockFs, ScriptedProvider};
pub use procfs::ProcfsProvider;
pub use snapshot::{Counter, CounterSnapshot, CounterValue, Metric, MetricDiff, MetricSnapshot};
pub use traits::{FileSystem, RealFs};

/// Source of process metrics.
///
/// Counter methods return `None` when the counter does not exist on this
/// platform; such counters are skipped, never treated as zero. Metrics the
/// platform lacks read as zero.
pub trait MetricsProvider: Send + Sync {
    /// Memory usage of the current process.
    fn memory(&self) -> MetricSnapshot;

    /// Open file descriptors (POSIX only).
    fn num_fds(&self) -> Option<CounterValue>;

    /// Open handles (handle-based OSes only).
    fn num_handles(&self) -> Option<CounterValue> {
        None
    }

    /// OS threads of the current process.
    fn num_threads(&self) -> Option<CounterValue>;

    /// Native heap objects (handle-based OSes only).
    fn heap_count(&self) -> Option<CounterValue> {
        None
    }

    /// Returns free allocator pages to the OS, if supported.
    fn heap_trim(&self) {}
}

/// Provider for the running process on this platform.
#[cfg(target_os = "linux")]
pub fn default_provider() -> Box<dyn MetricsProvider> {
    Box::new(ProcfsProvider::new(RealFs::new(), "/proc/self"))
}

/// Provider for the running process on this platform.
///
/// Only allocator statistics are available outside Linux.
#[cfg(not(target_os = "linux"))]
pub fn default_provider() -> Box<dyn MetricsProvider> {
    Box::new(ProcfsProvider::new(MockFs::new(), "/proc/self"))
}
