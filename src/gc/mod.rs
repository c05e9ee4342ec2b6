//! Process-global managed object heap and its cycle collector.
//!
//! Objects are created through [`Gc`] root handles. Dropping the last handle of
//! an object that is not part of a cycle frees it immediately; cyclic
//! structures without any root stay allocated until [`collect`] runs. With
//! retain mode on, [`collect`] moves such objects into the garbage register
//! instead of freeing them, which is what the leak classifier observes.
//!
//! ```
//! use leakprobe::gc::Gc;
//!
//! let a = Gc::instance("Node");
//! let b = Gc::instance("Node");
//! a.set_attr("peer", &b).unwrap();
//! b.set_attr("peer", &a).unwrap();
//! let a_id = a.id();
//! drop((a, b));
//! assert!(leakprobe::gc::inspect(a_id).is_some());
//! ```

mod classifier;
mod heap;

pub use classifier::{GcWindow, is_transient};
pub use heap::{GcError, Heap, ObjId, Value};

use std::sync::{LazyLock, Mutex};

static HEAP: LazyLock<Mutex<Heap>> = LazyLock::new(|| Mutex::new(Heap::new()));

/// Runs `f` with exclusive access to the global heap.
///
/// `f` must not drop [`Gc`] handles; that would re-enter the heap lock.
pub fn with_heap<R>(f: impl FnOnce(&mut Heap) -> R) -> R {
    let mut heap = HEAP.lock().unwrap_or_else(|e| e.into_inner());
    f(&mut heap)
}

/// Full collection of the global heap. Returns unreachable objects found.
pub fn collect() -> usize {
    with_heap(Heap::collect)
}

/// Switches retain mode; returns the previous mode.
pub fn set_retain(on: bool) -> bool {
    with_heap(|h| h.set_retain(on))
}

pub fn is_retaining() -> bool {
    with_heap(|h| h.is_retaining())
}

/// Identities currently in the garbage register.
pub fn garbage() -> Vec<ObjId> {
    with_heap(|h| h.garbage().to_vec())
}

pub fn clear_garbage() {
    with_heap(Heap::clear_garbage)
}

/// Copy of an object's contents, or `None` if it was freed.
pub fn inspect(id: ObjId) -> Option<Value> {
    with_heap(|h| h.get(id).cloned())
}

/// Root handle to an object in the global heap.
#[derive(Debug, PartialEq, Eq, Hash)]
pub struct Gc {
    id: ObjId,
}

impl Gc {
    /// Allocates `value`; referenced objects must be alive.
    pub fn new(value: Value) -> Result<Gc, GcError> {
        with_heap(|h| h.alloc(value)).map(|id| Gc { id })
    }

    fn alloc(value: Value) -> Gc {
        Gc {
            id: with_heap(|h| h.alloc_unchecked(value)),
        }
    }

    /// Wraps a root already owned by the caller.
    pub(crate) fn from_owned(id: ObjId) -> Gc {
        Gc { id }
    }

    pub fn none() -> Gc {
        Self::alloc(Value::None)
    }

    pub fn int(n: i64) -> Gc {
        Self::alloc(Value::Int(n))
    }

    pub fn str(s: &str) -> Gc {
        Self::alloc(Value::Str(s.to_string()))
    }

    pub fn bytes(b: &[u8]) -> Gc {
        Self::alloc(Value::Bytes(b.to_vec()))
    }

    pub fn list(items: &[&Gc]) -> Gc {
        Self::alloc(Value::List(items.iter().map(|g| g.id).collect()))
    }

    pub fn tuple(items: &[&Gc]) -> Gc {
        Self::alloc(Value::Tuple(items.iter().map(|g| g.id).collect()))
    }

    pub fn set(items: &[&Gc]) -> Gc {
        let mut ids: Vec<ObjId> = Vec::with_capacity(items.len());
        for g in items {
            if !ids.contains(&g.id) {
                ids.push(g.id);
            }
        }
        Self::alloc(Value::Set(ids))
    }

    pub fn dict(pairs: &[(&Gc, &Gc)]) -> Gc {
        Self::alloc(Value::Dict(pairs.iter().map(|(k, v)| (k.id, v.id)).collect()))
    }

    /// A fresh instance of a user-defined type.
    pub fn instance(type_name: &str) -> Gc {
        Self::alloc(Value::Instance {
            type_name: type_name.to_string(),
            attrs: Default::default(),
        })
    }

    pub fn exception(type_name: &str, message: &str) -> Gc {
        Self::alloc(Value::Exception {
            type_name: type_name.to_string(),
            message: message.to_string(),
            attrs: Default::default(),
        })
    }

    /// Handle object for the calling thread.
    pub fn current_thread() -> Gc {
        Self::alloc(Value::Thread(std::thread::current().id()))
    }

    pub fn id(&self) -> ObjId {
        self.id
    }

    pub fn type_name(&self) -> String {
        with_heap(|h| {
            h.get(self.id)
                .map(|v| v.type_name().to_string())
                .unwrap_or_default()
        })
    }

    pub fn value(&self) -> Option<Value> {
        inspect(self.id)
    }

    pub fn push(&self, item: &Gc) -> Result<(), GcError> {
        with_heap(|h| h.push(self.id, item.id))
    }

    pub fn insert(&self, key: &Gc, value: &Gc) -> Result<(), GcError> {
        with_heap(|h| h.insert(self.id, key.id, value.id))
    }

    pub fn set_attr(&self, name: &str, value: &Gc) -> Result<(), GcError> {
        with_heap(|h| h.set_attr(self.id, name, value.id))
    }
}

impl Clone for Gc {
    fn clone(&self) -> Self {
        with_heap(|h| h.incref(self.id));
        Gc { id: self.id }
    }
}

impl Drop for Gc {
    fn drop(&mut self) {
        with_heap(|h| h.decref(self.id));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::global_state_lock as test_lock;

    #[test]
    fn test_last_handle_frees_acyclic_object() {
        let list = Gc::list(&[&Gc::int(1), &Gc::str("a")]);
        let id = list.id();
        let copy = list.clone();
        drop(list);
        assert!(inspect(id).is_some());
        drop(copy);
        assert!(inspect(id).is_none());
    }

    #[test]
    fn test_unrooted_cycle_needs_collect() {
        let _guard = test_lock();
        let a = Gc::instance("Node");
        a.set_attr("me", &a).unwrap();
        let id = a.id();
        drop(a);
        assert_eq!(inspect(id).map(|v| v.type_name().to_string()).as_deref(), Some("Node"));
        collect();
        assert!(inspect(id).is_none());
    }

    #[test]
    fn test_retain_mode_round_trip() {
        let _guard = test_lock();
        let previous = set_retain(true);
        assert!(is_retaining());
        let a = Gc::instance("Node");
        a.set_attr("me", &a).unwrap();
        let id = a.id();
        drop(a);
        collect();
        assert!(garbage().contains(&id));
        clear_garbage();
        set_retain(previous);
        collect();
        assert!(inspect(id).is_none());
    }

    #[test]
    fn test_wrong_kind_is_an_error() {
        let n = Gc::int(1);
        assert!(n.push(&Gc::none()).is_err());
        assert!(n.set_attr("x", &Gc::none()).is_err());
        let d = Gc::dict(&[]);
        d.insert(&Gc::str("k"), &Gc::int(2)).unwrap();
        assert_eq!(d.type_name(), "dict");
    }
}
