//! Separates uncollectable garbage created by a call from benign cycles.

use std::collections::{BTreeMap, HashSet};

use tracing::debug;

use super::heap::{Heap, ObjId, Value};
use super::{Gc, with_heap};
use crate::error::{GarbageEvidence, LeakError};

/// Returns `true` if `id` is a known false positive rather than a leak.
///
/// Scalars, exceptions (and whatever cycles their tracebacks form) and the
/// calling thread's handle are transient. A container is transient iff every
/// element it holds is; dicts are judged by their values. Freed objects are
/// transient. A container reached again while it is being classified is not.
pub fn is_transient(heap: &Heap, id: ObjId) -> bool {
    Walk {
        heap,
        visiting: HashSet::new(),
    }
    .transient(id)
}

struct Walk<'a> {
    heap: &'a Heap,
    visiting: HashSet<ObjId>,
}

impl Walk<'_> {
    fn transient(&mut self, id: ObjId) -> bool {
        let heap = self.heap;
        let Some(value) = heap.get(id) else {
            return true;
        };
        match value {
            v if v.is_scalar() => true,
            Value::Exception { .. } => true,
            Value::Thread(tid) => *tid == std::thread::current().id(),
            Value::List(items) | Value::Tuple(items) | Value::Set(items) => {
                self.all_transient(id, items.iter().copied())
            }
            Value::Dict(pairs) => self.all_transient(id, pairs.iter().map(|&(_, v)| v)),
            _ => false,
        }
    }

    fn all_transient(&mut self, id: ObjId, children: impl Iterator<Item = ObjId>) -> bool {
        if !self.visiting.insert(id) {
            return false;
        }
        let children: Vec<ObjId> = children.collect();
        let result = children.into_iter().all(|c| self.transient(c));
        self.visiting.remove(&id);
        result
    }
}

/// Observation window capturing garbage created between [`GcWindow::open`]
/// and [`GcWindow::close`].
///
/// Opening switches the global heap to retain mode; closing (or dropping)
/// restores the previous mode. Windows must not be nested.
#[derive(Debug)]
pub struct GcWindow {
    before: HashSet<ObjId>,
    previous: Option<bool>,
    leaked: Vec<Gc>,
}

impl GcWindow {
    pub fn open() -> Self {
        let (previous, before) = with_heap(|h| {
            h.collect();
            let previous = h.set_retain(true);
            let before = h.garbage().iter().copied().collect();
            h.clear_garbage();
            (previous, before)
        });
        Self {
            before,
            previous: Some(previous),
            leaked: Vec::new(),
        }
    }

    /// Collects again and keeps everything not seen at open. Idempotent.
    pub fn close(&mut self) {
        let Some(previous) = self.previous.take() else {
            return;
        };
        let after = with_heap(|h| {
            h.collect();
            let after = h.take_garbage();
            h.set_retain(previous);
            after
        });
        // Handles are built outside the lock; stale ones drop right here.
        let (leaked, _stale): (Vec<Gc>, Vec<Gc>) = after
            .into_iter()
            .map(Gc::from_owned)
            .partition(|g| !self.before.contains(&g.id()));
        debug!(leaked = leaked.len(), "garbage window closed");
        self.leaked = leaked;
    }

    /// Objects retained by the window that were not garbage before it.
    pub fn leaked_objects(&self) -> &[Gc] {
        &self.leaked
    }

    /// Fails if any leaked object is not transient.
    pub fn check(&self, fun_name: &str) -> Result<(), LeakError> {
        let by_type = with_heap(|h| {
            let mut by_type: BTreeMap<String, usize> = BTreeMap::new();
            for obj in &self.leaked {
                if is_transient(h, obj.id()) {
                    continue;
                }
                let name = h.get(obj.id()).map(Value::type_name).unwrap_or_default();
                *by_type.entry(name.to_string()).or_default() += 1;
            }
            by_type
        });

        let count: usize = by_type.values().sum();
        if count == 0 {
            return Ok(());
        }
        Err(LeakError::UncollectableGarbage(GarbageEvidence {
            count,
            fun_name: fun_name.to_string(),
            by_type,
        }))
    }
}

impl Drop for GcWindow {
    fn drop(&mut self) {
        self.close();
    }
}
