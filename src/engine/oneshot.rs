//! Single-call snapshot/diff check for integer resource counters.

use tracing::warn;

use crate::checkers::Checkers;
use crate::collector::snapshot::{Counter, CounterSnapshot, CounterValue};
use crate::collector::MetricsProvider;
use crate::error::{LeakError, LeakEvidence};
use crate::threads;

fn managed_threads() -> CounterValue {
    let running = threads::enumerate();
    CounterValue::new(
        running.len(),
        running.iter().map(ToString::to_string).collect(),
    )
}

/// Reads every counter enabled by `checkers` that applies on this platform.
pub fn counter_snapshot(provider: &dyn MetricsProvider, checkers: &Checkers) -> CounterSnapshot {
    let mut snap = CounterSnapshot::default();
    for counter in Counter::ALL {
        let value = match counter {
            Counter::NumFds if checkers.fds => provider.num_fds(),
            Counter::NumHandles if checkers.handles => provider.num_handles(),
            Counter::PyThreads if checkers.py_threads => Some(managed_threads()),
            Counter::CThreads if checkers.c_threads => provider.num_threads(),
            Counter::HeapCount if checkers.memory => provider.heap_count(),
            _ => None,
        };
        if let Some(value) = value {
            snap.insert(counter, value);
        }
    }
    snap
}

/// Compares two snapshots; the first counter that grew becomes the error.
pub fn compare(
    before: &CounterSnapshot,
    after: &CounterSnapshot,
    fun_name: &str,
) -> Result<(), LeakError> {
    for (counter, old) in before.iter() {
        let Some(new) = after.get(counter) else {
            continue;
        };
        let diff = new.count as i64 - old.count as i64;
        if diff < 0 {
            warn!(
                "'{}' decreased by {} after calling '{}' 1 time",
                counter,
                diff.unsigned_abs(),
                fun_name
            );
        } else if diff > 0 {
            return Err(LeakError::unclosed(
                counter.resource(),
                LeakEvidence::new(diff as usize, fun_name, new.new_extras(old)),
            ));
        }
    }
    Ok(())
}

/// Snapshots counters, invokes `call` once, snapshots again and compares.
pub fn check_oneshot(
    provider: &dyn MetricsProvider,
    checkers: &Checkers,
    fun_name: &str,
    call: &mut dyn FnMut() -> Result<(), LeakError>,
) -> Result<(), LeakError> {
    let before = counter_snapshot(provider, checkers);
    call()?;
    let after = counter_snapshot(provider, checkers);
    compare(&before, &after, fun_name)
}
