//! Reference-counted object heap with a tracing cycle collector.
//!
//! Every object carries two counts: `roots` (handles held outside the heap)
//! and `refcnt` (references from other heap objects). An object whose counts
//! both reach zero is freed at once, cascading to its children. Objects kept
//! alive only by a reference cycle survive until [`Heap::collect`].

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::thread::ThreadId;

use thiserror::Error;

/// Identity of a heap object. Never reused within a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjId(u64);

impl fmt::Display for ObjId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:x}", self.0)
    }
}

/// Contents of a heap object. Container elements are references to other
/// objects.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    List(Vec<ObjId>),
    Tuple(Vec<ObjId>),
    Set(Vec<ObjId>),
    Dict(Vec<(ObjId, ObjId)>),
    Exception {
        type_name: String,
        message: String,
        attrs: BTreeMap<String, ObjId>,
    },
    Thread(ThreadId),
    Instance {
        type_name: String,
        attrs: BTreeMap<String, ObjId>,
    },
}

impl Value {
    pub fn type_name(&self) -> &str {
        match self {
            Value::None => "NoneType",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "str",
            Value::Bytes(_) => "bytes",
            Value::List(_) => "list",
            Value::Tuple(_) => "tuple",
            Value::Set(_) => "set",
            Value::Dict(_) => "dict",
            Value::Exception { type_name, .. } => type_name,
            Value::Thread(_) => "Thread",
            Value::Instance { type_name, .. } => type_name,
        }
    }

    /// Immutable scalar values. Scalars cannot form cycles, so the collector
    /// never registers them as garbage.
    pub fn is_scalar(&self) -> bool {
        matches!(
            self,
            Value::None
                | Value::Bool(_)
                | Value::Int(_)
                | Value::Float(_)
                | Value::Str(_)
                | Value::Bytes(_)
        )
    }

    /// Every object this value refers to, dict keys included.
    pub fn children(&self) -> Vec<ObjId> {
        match self {
            Value::List(items) | Value::Tuple(items) | Value::Set(items) => items.clone(),
            Value::Dict(pairs) => pairs.iter().flat_map(|&(k, v)| [k, v]).collect(),
            Value::Exception { attrs, .. } | Value::Instance { attrs, .. } => {
                attrs.values().copied().collect()
            }
            _ => Vec::new(),
        }
    }
}

/// Misuse of the heap API.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GcError {
    #[error("object {0} does not exist")]
    Missing(ObjId),
    #[error("'{type_name}' object does not support {op}")]
    Unsupported { type_name: String, op: &'static str },
}

#[derive(Debug)]
struct Slot {
    value: Value,
    roots: usize,
    refcnt: usize,
}

/// Object heap plus the garbage register used in retain mode.
#[derive(Debug, Default)]
pub struct Heap {
    slots: HashMap<ObjId, Slot>,
    next_id: u64,
    retain: bool,
    garbage: Vec<ObjId>,
}

impl Heap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocates an object holding one root. All referenced objects must exist.
    pub fn alloc(&mut self, value: Value) -> Result<ObjId, GcError> {
        if let Some(missing) = value.children().into_iter().find(|c| !self.contains(*c)) {
            return Err(GcError::Missing(missing));
        }
        Ok(self.alloc_unchecked(value))
    }

    /// Allocates without validating children; callers guarantee they are live.
    pub(crate) fn alloc_unchecked(&mut self, value: Value) -> ObjId {
        self.next_id += 1;
        let id = ObjId(self.next_id);
        for child in value.children() {
            if let Some(slot) = self.slots.get_mut(&child) {
                slot.refcnt += 1;
            }
        }
        self.slots.insert(
            id,
            Slot {
                value,
                roots: 1,
                refcnt: 0,
            },
        );
        id
    }

    pub fn get(&self, id: ObjId) -> Option<&Value> {
        self.slots.get(&id).map(|s| &s.value)
    }

    pub fn contains(&self, id: ObjId) -> bool {
        self.slots.contains_key(&id)
    }

    /// Number of live objects.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Adds an external root.
    pub fn incref(&mut self, id: ObjId) {
        if let Some(slot) = self.slots.get_mut(&id) {
            slot.roots += 1;
        }
    }

    /// Drops an external root, freeing the object if nothing else holds it.
    pub fn decref(&mut self, id: ObjId) {
        if let Some(slot) = self.slots.get_mut(&id) {
            slot.roots = slot.roots.saturating_sub(1);
        }
        self.release(id);
    }

    /// Frees `id` and, transitively, children left without holders.
    fn release(&mut self, id: ObjId) {
        let mut stack = vec![id];
        while let Some(id) = stack.pop() {
            let free = self
                .slots
                .get(&id)
                .is_some_and(|s| s.roots == 0 && s.refcnt == 0);
            if !free {
                continue;
            }
            if let Some(slot) = self.slots.remove(&id) {
                for child in slot.value.children() {
                    if let Some(c) = self.slots.get_mut(&child) {
                        c.refcnt = c.refcnt.saturating_sub(1);
                        stack.push(child);
                    }
                }
            }
        }
    }

    fn link(&mut self, target: ObjId) -> Result<(), GcError> {
        let slot = self.slots.get_mut(&target).ok_or(GcError::Missing(target))?;
        slot.refcnt += 1;
        Ok(())
    }

    fn unlink(&mut self, target: ObjId) {
        if let Some(slot) = self.slots.get_mut(&target) {
            slot.refcnt = slot.refcnt.saturating_sub(1);
        }
        self.release(target);
    }

    fn value_mut(&mut self, id: ObjId) -> Result<&mut Value, GcError> {
        self.slots
            .get_mut(&id)
            .map(|s| &mut s.value)
            .ok_or(GcError::Missing(id))
    }

    fn unsupported(&self, id: ObjId, op: &'static str) -> GcError {
        GcError::Unsupported {
            type_name: self
                .get(id)
                .map(|v| v.type_name().to_string())
                .unwrap_or_default(),
            op,
        }
    }

    /// Appends `item` to a list, or adds it to a set (by identity).
    pub fn push(&mut self, container: ObjId, item: ObjId) -> Result<(), GcError> {
        if !self.contains(item) {
            return Err(GcError::Missing(item));
        }
        let added = match self.value_mut(container)? {
            Value::List(items) => {
                items.push(item);
                true
            }
            Value::Set(items) if items.contains(&item) => false,
            Value::Set(items) => {
                items.push(item);
                true
            }
            _ => return Err(self.unsupported(container, "push")),
        };
        if added {
            self.link(item)?;
        }
        Ok(())
    }

    /// Maps `key` to `value` in a dict; keys compare by identity.
    pub fn insert(&mut self, dict: ObjId, key: ObjId, value: ObjId) -> Result<(), GcError> {
        for id in [key, value] {
            if !self.contains(id) {
                return Err(GcError::Missing(id));
            }
        }
        let replaced = match self.value_mut(dict)? {
            Value::Dict(pairs) => match pairs.iter_mut().find(|(k, _)| *k == key) {
                Some(pair) => Some(std::mem::replace(&mut pair.1, value)),
                None => {
                    pairs.push((key, value));
                    None
                }
            },
            _ => return Err(self.unsupported(dict, "item assignment")),
        };
        self.link(value)?;
        match replaced {
            Some(old) => self.unlink(old),
            None => self.link(key)?,
        }
        Ok(())
    }

    /// Sets an attribute on an instance or exception.
    pub fn set_attr(&mut self, obj: ObjId, name: &str, value: ObjId) -> Result<(), GcError> {
        if !self.contains(value) {
            return Err(GcError::Missing(value));
        }
        let replaced = match self.value_mut(obj)? {
            Value::Exception { attrs, .. } | Value::Instance { attrs, .. } => {
                attrs.insert(name.to_string(), value)
            }
            _ => return Err(self.unsupported(obj, "attribute assignment")),
        };
        self.link(value)?;
        if let Some(old) = replaced {
            self.unlink(old);
        }
        Ok(())
    }

    /// Full collection. Returns the number of unreachable objects found.
    ///
    /// In retain mode unreachable containers are appended to the garbage
    /// register (which roots them) instead of being freed.
    pub fn collect(&mut self) -> usize {
        let mut reachable = HashSet::new();
        let mut stack: Vec<ObjId> = self
            .slots
            .iter()
            .filter(|(_, s)| s.roots > 0)
            .map(|(id, _)| *id)
            .collect();
        while let Some(id) = stack.pop() {
            if !reachable.insert(id) {
                continue;
            }
            if let Some(slot) = self.slots.get(&id) {
                stack.extend(slot.value.children());
            }
        }

        let mut unreachable: Vec<ObjId> = self
            .slots
            .keys()
            .filter(|id| !reachable.contains(*id))
            .copied()
            .collect();
        unreachable.sort();
        let found = unreachable.len();

        if self.retain {
            for id in unreachable {
                let Some(slot) = self.slots.get_mut(&id) else {
                    continue;
                };
                if !slot.value.is_scalar() {
                    slot.roots += 1;
                    self.garbage.push(id);
                }
            }
        } else {
            let doomed: HashSet<ObjId> = unreachable.iter().copied().collect();
            for id in unreachable {
                if let Some(slot) = self.slots.remove(&id) {
                    for child in slot.value.children() {
                        if doomed.contains(&child) {
                            continue;
                        }
                        if let Some(c) = self.slots.get_mut(&child) {
                            c.refcnt = c.refcnt.saturating_sub(1);
                        }
                    }
                }
            }
        }
        found
    }

    /// Switches retain mode; returns the previous mode.
    pub fn set_retain(&mut self, on: bool) -> bool {
        std::mem::replace(&mut self.retain, on)
    }

    pub fn is_retaining(&self) -> bool {
        self.retain
    }

    /// Objects currently held by the garbage register.
    pub fn garbage(&self) -> &[ObjId] {
        &self.garbage
    }

    /// Empties the register, dropping the root it held on each object.
    pub fn clear_garbage(&mut self) {
        for id in std::mem::take(&mut self.garbage) {
            self.decref(id);
        }
    }

    /// Empties the register, handing its roots over to the caller.
    pub(crate) fn take_garbage(&mut self) -> Vec<ObjId> {
        std::mem::take(&mut self.garbage)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instance(heap: &mut Heap, type_name: &str) -> ObjId {
        heap.alloc(Value::Instance {
            type_name: type_name.into(),
            attrs: BTreeMap::new(),
        })
        .unwrap()
    }

    #[test]
    fn test_acyclic_object_freed_on_last_root() {
        let mut heap = Heap::new();
        let s = heap.alloc(Value::Str("x".into())).unwrap();
        let list = heap.alloc(Value::List(vec![s])).unwrap();
        heap.decref(s);
        assert!(heap.contains(s), "still referenced by the list");
        heap.decref(list);
        assert!(heap.is_empty());
    }

    #[test]
    fn test_cycle_survives_until_collect() {
        let mut heap = Heap::new();
        let a = instance(&mut heap, "Node");
        let b = instance(&mut heap, "Node");
        heap.set_attr(a, "next", b).unwrap();
        heap.set_attr(b, "next", a).unwrap();
        heap.decref(a);
        heap.decref(b);
        assert_eq!(heap.len(), 2);

        assert_eq!(heap.collect(), 2);
        assert!(heap.is_empty());
        assert!(heap.garbage().is_empty());
    }

    #[test]
    fn test_retain_mode_registers_unreachable_containers() {
        let mut heap = Heap::new();
        assert!(!heap.set_retain(true));
        let a = instance(&mut heap, "Node");
        let label = heap.alloc(Value::Str("label".into())).unwrap();
        heap.set_attr(a, "self", a).unwrap();
        heap.set_attr(a, "label", label).unwrap();
        heap.decref(label);
        heap.decref(a);

        assert_eq!(heap.collect(), 2);
        assert_eq!(heap.garbage(), &[a]);
        assert!(heap.contains(label));

        heap.clear_garbage();
        assert_eq!(heap.len(), 2, "cycle is unreachable again, not freed");
        assert!(heap.set_retain(false));
        heap.collect();
        assert!(heap.is_empty());
    }

    #[test]
    fn test_rooted_objects_are_kept() {
        let mut heap = Heap::new();
        let a = instance(&mut heap, "Node");
        heap.set_attr(a, "self", a).unwrap();
        assert_eq!(heap.collect(), 0);
        assert!(heap.contains(a));
    }

    #[test]
    fn test_collect_frees_cycle_but_keeps_shared_child() {
        let mut heap = Heap::new();
        let shared = heap.alloc(Value::Int(7)).unwrap();
        let holder = heap.alloc(Value::List(vec![shared])).unwrap();
        let a = instance(&mut heap, "Node");
        heap.set_attr(a, "self", a).unwrap();
        heap.set_attr(a, "shared", shared).unwrap();
        heap.decref(shared);
        heap.decref(a);

        heap.collect();
        assert!(!heap.contains(a));
        assert!(heap.contains(shared));
        heap.decref(holder);
        assert!(heap.is_empty());
    }

    #[test]
    fn test_set_attr_replaces_and_releases_old_value() {
        let mut heap = Heap::new();
        let a = instance(&mut heap, "Node");
        let old = heap.alloc(Value::Int(1)).unwrap();
        let new = heap.alloc(Value::Int(2)).unwrap();
        heap.set_attr(a, "v", old).unwrap();
        heap.decref(old);
        heap.set_attr(a, "v", new).unwrap();
        assert!(!heap.contains(old));
        heap.decref(new);
        assert!(heap.contains(new));
    }

    #[test]
    fn test_dict_insert_and_set_dedup() {
        let mut heap = Heap::new();
        let dict = heap.alloc(Value::Dict(vec![])).unwrap();
        let k = heap.alloc(Value::Str("k".into())).unwrap();
        let v1 = heap.alloc(Value::Int(1)).unwrap();
        let v2 = heap.alloc(Value::Int(2)).unwrap();
        heap.insert(dict, k, v1).unwrap();
        heap.insert(dict, k, v2).unwrap();
        assert_eq!(heap.get(dict), Some(&Value::Dict(vec![(k, v2)])));

        let set = heap.alloc(Value::Set(vec![])).unwrap();
        heap.push(set, k).unwrap();
        heap.push(set, k).unwrap();
        assert_eq!(heap.get(set), Some(&Value::Set(vec![k])));
    }

    #[test]
    fn test_misuse_is_reported() {
        let mut heap = Heap::new();
        let n = heap.alloc(Value::Int(1)).unwrap();
        let err = heap.push(n, n).unwrap_err();
        assert_eq!(err.to_string(), "'int' object does not support push");

        let list = heap.alloc(Value::List(vec![])).unwrap();
        heap.decref(n);
        assert_eq!(heap.push(list, n), Err(GcError::Missing(n)));
        assert_eq!(
            heap.alloc(Value::Tuple(vec![n])),
            Err(GcError::Missing(n))
        );
    }

    #[test]
    fn test_ids_are_never_reused() {
        let mut heap = Heap::new();
        let a = heap.alloc(Value::None).unwrap();
        heap.decref(a);
        let b = heap.alloc(Value::None).unwrap();
        assert_ne!(a, b);
    }
}
