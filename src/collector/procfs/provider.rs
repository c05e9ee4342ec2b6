//! Reads memory, descriptor and thread metrics from `/proc/self/*`.

use std::path::{Path, PathBuf};

use tracing::debug;

use crate::collector::MetricsProvider;
use crate::collector::jemalloc::{self, HeapStats};
use crate::collector::procfs::parser::{parse_proc_status, parse_smaps_rollup, ProcStatus};
use crate::collector::snapshot::{CounterValue, Metric, MetricSnapshot};
use crate::collector::traits::FileSystem;

/// Collects metrics of the current process from `/proc/self`.
///
/// Native heap figures come from the allocator rather than the filesystem.
pub struct ProcfsProvider<F: FileSystem> {
    fs: F,
    self_path: PathBuf,
    heap_stats: fn() -> HeapStats,
    trim: fn(),
}

impl<F: FileSystem> ProcfsProvider<F> {
    /// Creates a new provider.
    ///
    /// # Arguments
    /// * `fs` - Filesystem implementation (real or mock)
    /// * `self_path` - Path of the current process directory (usually "/proc/self")
    pub fn new(fs: F, self_path: impl Into<PathBuf>) -> Self {
        Self {
            fs,
            self_path: self_path.into(),
            heap_stats: jemalloc::heap_stats,
            trim: jemalloc::release_memory_to_os,
        }
    }

    /// Replaces the allocator statistics source.
    pub fn with_heap_stats(mut self, heap_stats: fn() -> HeapStats) -> Self {
        self.heap_stats = heap_stats;
        self
    }

    /// Replaces the allocator trim hook.
    pub fn with_trim(mut self, trim: fn()) -> Self {
        self.trim = trim;
        self
    }

    fn path(&self, name: &str) -> PathBuf {
        self.self_path.join(name)
    }

    fn status(&self) -> Option<ProcStatus> {
        let path = self.path("status");
        let content = self
            .fs
            .read_to_string(&path)
            .map_err(|e| debug!(path = %path.display(), error = %e, "status unavailable"))
            .ok()?;
        parse_proc_status(&content)
            .map_err(|e| debug!(error = %e, "failed to parse status"))
            .ok()
    }

    fn uss_kb(&self) -> u64 {
        let path = self.path("smaps_rollup");
        self.fs
            .read_to_string(&path)
            .ok()
            .and_then(|content| parse_smaps_rollup(&content).ok())
            .map(|rollup| rollup.uss())
            .unwrap_or(0)
    }

    fn entry_name(path: &Path) -> String {
        path.file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

impl<F: FileSystem> MetricsProvider for ProcfsProvider<F> {
    fn memory(&self) -> MetricSnapshot {
        let mut snap = MetricSnapshot::default();

        if let Some(status) = self.status() {
            snap.set(Metric::Rss, status.vm_rss * 1024);
            snap.set(Metric::Vms, status.vm_size * 1024);
        }
        snap.set(Metric::Uss, self.uss_kb() * 1024);

        let heap = (self.heap_stats)();
        snap.set(Metric::Heap, heap.small_allocated);
        snap.set(Metric::Mmap, heap.large_allocated);

        snap
    }

    fn num_fds(&self) -> Option<CounterValue> {
        let fd_dir = self.path("fd");
        let entries = self
            .fs
            .read_dir(&fd_dir)
            .map_err(|e| debug!(error = %e, "descriptor listing unavailable"))
            .ok()?;

        // The descriptor used for the listing is closed by now and no longer
        // resolves; only entries that still have a link target are counted.
        let extras: Vec<String> = entries
            .iter()
            .filter_map(|entry| {
                let target = self.fs.read_link(entry).ok()?;
                Some(format!("fd {} -> {}", Self::entry_name(entry), target.display()))
            })
            .collect();

        Some(CounterValue::new(extras.len(), extras))
    }

    fn num_threads(&self) -> Option<CounterValue> {
        let status = self.status()?;

        let extras = self
            .fs
            .read_dir(&self.path("task"))
            .unwrap_or_default()
            .iter()
            .map(|task| {
                let tid = Self::entry_name(task);
                let comm = self
                    .fs
                    .read_to_string(&task.join("comm"))
                    .unwrap_or_default();
                format!("tid {} ({})", tid, comm.trim())
            })
            .collect();

        Some(CounterValue::new(status.threads as usize, extras))
    }

    fn heap_trim(&self) {
        (self.trim)();
    }
}
