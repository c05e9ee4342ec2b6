//! Point-in-time measurements of the current process.
//!
//! A [`MetricSnapshot`] holds byte counts used by the growth engine; a
//! [`CounterSnapshot`] holds integer resource counts (with per-item evidence)
//! used by the oneshot checker. Both are created fresh at each measurement
//! point and never mutated afterwards.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use crate::error::{ConfigError, Resource};

/// Memory metric measured around a batch of calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Metric {
    /// Native heap bytes in use (small allocations).
    Heap,
    /// Bytes in use by allocations backed by their own mappings.
    Mmap,
    /// Unique set size.
    Uss,
    /// Resident set size.
    Rss,
    /// Virtual memory size.
    Vms,
}

impl Metric {
    pub const ALL: [Metric; 5] = [
        Metric::Heap,
        Metric::Mmap,
        Metric::Uss,
        Metric::Rss,
        Metric::Vms,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Metric::Heap => "heap",
            Metric::Mmap => "mmap",
            Metric::Uss => "uss",
            Metric::Rss => "rss",
            Metric::Vms => "vms",
        }
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Metric {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Metric::ALL
            .into_iter()
            .find(|m| m.as_str() == s)
            .ok_or_else(|| ConfigError::ToleranceKey(s.to_string()))
    }
}

/// Byte counts for every [`Metric`]; metrics the platform lacks read as zero.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricSnapshot {
    values: [u64; 5],
}

impl MetricSnapshot {
    pub fn from_pairs(pairs: &[(Metric, u64)]) -> Self {
        let mut snap = Self::default();
        for &(metric, value) in pairs {
            snap.set(metric, value);
        }
        snap
    }

    pub fn get(&self, metric: Metric) -> u64 {
        self.values[metric as usize]
    }

    pub fn set(&mut self, metric: Metric, value: u64) {
        self.values[metric as usize] = value;
    }

    /// Per-metric growth from `earlier` to `self`.
    pub fn diff(&self, earlier: &MetricSnapshot) -> MetricDiff {
        let mut diff = MetricDiff::default();
        for metric in Metric::ALL {
            diff.values[metric as usize] = self.get(metric) as i64 - earlier.get(metric) as i64;
        }
        diff
    }
}

/// Signed per-metric growth between two [`MetricSnapshot`]s.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricDiff {
    values: [i64; 5],
}

impl MetricDiff {
    pub fn get(&self, metric: Metric) -> i64 {
        self.values[metric as usize]
    }

    /// Returns `true` if any metric grew.
    pub fn any_growth(&self) -> bool {
        self.values.iter().any(|&v| v > 0)
    }
}

/// Integer resource counter checked around a single call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Counter {
    /// Open file descriptors (POSIX).
    NumFds,
    /// Open handles (handle-based OSes).
    NumHandles,
    /// Threads started through [`crate::threads`].
    PyThreads,
    /// OS threads of the process.
    CThreads,
    /// Native heap objects (handle-based OSes).
    HeapCount,
}

impl Counter {
    /// Evaluation order: cheap counters first, and managed threads before OS
    /// threads so the more specific error wins.
    pub const ALL: [Counter; 5] = [
        Counter::NumFds,
        Counter::NumHandles,
        Counter::PyThreads,
        Counter::CThreads,
        Counter::HeapCount,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Counter::NumFds => "num_fds",
            Counter::NumHandles => "num_handles",
            Counter::PyThreads => "py_threads",
            Counter::CThreads => "c_threads",
            Counter::HeapCount => "heap_count",
        }
    }

    /// The single error kind raised when this counter grows.
    pub fn resource(self) -> Resource {
        match self {
            Counter::NumFds => Resource::FileDescriptor,
            Counter::NumHandles => Resource::Handle,
            Counter::PyThreads => Resource::ManagedThread,
            Counter::CThreads => Resource::NativeThread,
            Counter::HeapCount => Resource::HeapCreate,
        }
    }
}

impl fmt::Display for Counter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Counter {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Counter::ALL
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| ConfigError::Counter(s.to_string()))
    }
}

/// A counter reading plus the identities of the items it counted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CounterValue {
    pub count: usize,
    pub extras: Vec<String>,
}

impl CounterValue {
    pub fn new(count: usize, extras: Vec<String>) -> Self {
        Self { count, extras }
    }

    /// Items present in `self` but not in `earlier`.
    pub fn new_extras(&self, earlier: &CounterValue) -> Vec<String> {
        let seen: BTreeSet<&String> = earlier.extras.iter().collect();
        self.extras
            .iter()
            .filter(|item| !seen.contains(item))
            .cloned()
            .collect()
    }
}

/// Readings for the enabled, platform-applicable counters.
///
/// Counters that were skipped are absent rather than zero.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CounterSnapshot {
    values: BTreeMap<Counter, CounterValue>,
}

impl CounterSnapshot {
    pub fn insert(&mut self, counter: Counter, value: CounterValue) {
        self.values.insert(counter, value);
    }

    pub fn get(&self, counter: Counter) -> Option<&CounterValue> {
        self.values.get(&counter)
    }

    pub fn contains(&self, counter: Counter) -> bool {
        self.values.contains_key(&counter)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Iterates in evaluation order.
    pub fn iter(&self) -> impl Iterator<Item = (Counter, &CounterValue)> {
        Counter::ALL
            .into_iter()
            .filter_map(|c| self.values.get(&c).map(|v| (c, v)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metric_diff_is_signed() {
        let a = MetricSnapshot::from_pairs(&[(Metric::Rss, 100), (Metric::Heap, 50)]);
        let b = MetricSnapshot::from_pairs(&[(Metric::Rss, 80), (Metric::Heap, 70)]);
        let diff = b.diff(&a);
        assert_eq!(diff.get(Metric::Rss), -20);
        assert_eq!(diff.get(Metric::Heap), 20);
        assert_eq!(diff.get(Metric::Vms), 0);
        assert!(diff.any_growth());
    }

    #[test]
    fn test_metric_from_str() {
        assert_eq!("uss".parse::<Metric>(), Ok(Metric::Uss));
        assert_eq!(
            "nonexistent".parse::<Metric>(),
            Err(ConfigError::ToleranceKey("nonexistent".into()))
        );
    }

    #[test]
    fn test_counter_maps_to_one_resource() {
        assert_eq!(Counter::NumFds.resource(), Resource::FileDescriptor);
        assert_eq!(Counter::PyThreads.resource(), Resource::ManagedThread);
        assert_eq!(Counter::CThreads.resource(), Resource::NativeThread);
        assert_eq!(Counter::HeapCount.resource(), Resource::HeapCreate);
        assert!("bogus".parse::<Counter>().is_err());
    }

    #[test]
    fn test_new_extras_is_set_difference() {
        let before = CounterValue::new(2, vec!["fd 0".into(), "fd 1".into()]);
        let after = CounterValue::new(3, vec!["fd 0".into(), "fd 1".into(), "fd 7".into()]);
        assert_eq!(after.new_extras(&before), vec!["fd 7".to_string()]);
    }

    #[test]
    fn test_counter_snapshot_iterates_in_evaluation_order() {
        let mut snap = CounterSnapshot::default();
        snap.insert(Counter::CThreads, CounterValue::new(4, vec![]));
        snap.insert(Counter::NumFds, CounterValue::new(10, vec![]));
        snap.insert(Counter::PyThreads, CounterValue::new(1, vec![]));
        let order: Vec<Counter> = snap.iter().map(|(c, _)| c).collect();
        assert_eq!(
            order,
            vec![Counter::NumFds, Counter::PyThreads, Counter::CThreads]
        );
        assert!(!snap.contains(Counter::NumHandles));
    }
}
