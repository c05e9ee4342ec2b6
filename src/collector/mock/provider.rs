//! Metrics provider that replays queued readings.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::collector::MetricsProvider;
use crate::collector::snapshot::{Counter, CounterValue, MetricSnapshot};

/// A FIFO of readings; the last reading repeats once the queue drains.
#[derive(Debug, Default)]
struct Script<T: Clone> {
    queue: VecDeque<T>,
    last: Option<T>,
}

impl<T: Clone> Script<T> {
    fn next(&mut self) -> Option<T> {
        if let Some(value) = self.queue.pop_front() {
            self.last = Some(value.clone());
        }
        self.last.clone()
    }
}

/// Provider returning pre-programmed snapshots, in order.
///
/// Counters never scripted report `None`, i.e. "not applicable".
#[derive(Debug, Default)]
pub struct ScriptedProvider {
    memory: Mutex<Script<MetricSnapshot>>,
    counters: Mutex<BTreeMap<Counter, Script<CounterValue>>>,
    memory_reads: AtomicUsize,
    trims: AtomicUsize,
}

impl ScriptedProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues memory readings.
    pub fn push_memory(&self, snapshots: impl IntoIterator<Item = MetricSnapshot>) -> &Self {
        let mut script = self.memory.lock().unwrap_or_else(|e| e.into_inner());
        script.queue.extend(snapshots);
        self
    }

    /// Queues readings for one counter.
    pub fn push_counter(
        &self,
        counter: Counter,
        values: impl IntoIterator<Item = CounterValue>,
    ) -> &Self {
        let mut counters = self.counters.lock().unwrap_or_else(|e| e.into_inner());
        counters.entry(counter).or_default().queue.extend(values);
        self
    }

    /// Number of memory snapshots taken so far.
    pub fn memory_reads(&self) -> usize {
        self.memory_reads.load(Ordering::SeqCst)
    }

    /// Number of `heap_trim` calls so far.
    pub fn trims(&self) -> usize {
        self.trims.load(Ordering::SeqCst)
    }

    fn counter(&self, counter: Counter) -> Option<CounterValue> {
        let mut counters = self.counters.lock().unwrap_or_else(|e| e.into_inner());
        counters.get_mut(&counter).and_then(Script::next)
    }
}

impl MetricsProvider for ScriptedProvider {
    fn memory(&self) -> MetricSnapshot {
        self.memory_reads.fetch_add(1, Ordering::SeqCst);
        let mut script = self.memory.lock().unwrap_or_else(|e| e.into_inner());
        script.next().unwrap_or_default()
    }

    fn num_fds(&self) -> Option<CounterValue> {
        self.counter(Counter::NumFds)
    }

    fn num_handles(&self) -> Option<CounterValue> {
        self.counter(Counter::NumHandles)
    }

    fn num_threads(&self) -> Option<CounterValue> {
        self.counter(Counter::CThreads)
    }

    fn heap_count(&self) -> Option<CounterValue> {
        self.counter(Counter::HeapCount)
    }

    fn heap_trim(&self) {
        self.trims.fetch_add(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::snapshot::Metric;

    #[test]
    fn test_memory_replays_then_repeats_last() {
        let provider = ScriptedProvider::new();
        provider.push_memory([
            MetricSnapshot::from_pairs(&[(Metric::Rss, 1)]),
            MetricSnapshot::from_pairs(&[(Metric::Rss, 2)]),
        ]);
        assert_eq!(provider.memory().get(Metric::Rss), 1);
        assert_eq!(provider.memory().get(Metric::Rss), 2);
        assert_eq!(provider.memory().get(Metric::Rss), 2);
        assert_eq!(provider.memory_reads(), 3);
    }

    #[test]
    fn test_unscripted_counters_are_not_applicable() {
        let provider = ScriptedProvider::new();
        provider.push_counter(Counter::NumFds, [CounterValue::new(3, vec![])]);
        assert_eq!(provider.num_fds().unwrap().count, 3);
        assert!(provider.num_handles().is_none());
        assert!(provider.num_threads().is_none());
    }

    #[test]
    fn test_trims_are_counted() {
        let provider = ScriptedProvider::new();
        provider.heap_trim();
        provider.heap_trim();
        assert_eq!(provider.trims(), 2);
    }
}
