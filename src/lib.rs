//! leakprobe - leak detection harness for the current process.
//!
//! A target closure is called many times while the harness watches what it
//! leaves behind:
//! - integer resource counters (file descriptors, handles, OS threads,
//!   managed threads, native heaps) across a single call,
//! - temporary files/directories and child processes created through the
//!   tracked entry points in [`tracking`],
//! - uncollectable reference cycles in the managed [`gc`] heap,
//! - memory growth across repeated, increasingly large batches of calls.
//!
//! See [`LeakTest`] for the entry point.
//!
//! Heap and mmap metrics need jemalloc installed as the global allocator by
//! the final binary; see [`collector::jemalloc`].

pub mod checkers;
pub mod collector;
pub mod engine;
pub mod error;
pub mod fmt;
pub mod gc;
pub mod leaktest;
pub mod options;
pub mod threads;
pub mod tracking;

pub use checkers::{Checker, Checkers};
pub use error::{ConfigError, GarbageEvidence, LeakError, LeakEvidence, Resource};
pub use leaktest::{BoxError, Call, LeakTest};
pub use options::{Options, Tolerance};

/// Serializes unit tests that touch process-wide state (the managed heap,
/// tracked entry points, the thread registry).
#[cfg(test)]
pub(crate) fn global_state_lock() -> std::sync::MutexGuard<'static, ()> {
    static LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());
    LOCK.lock().unwrap_or_else(|e| e.into_inner())
}
