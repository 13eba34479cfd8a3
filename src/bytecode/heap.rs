//! The managed heap and its mark-sweep garbage collector.
//!
//! Objects live in a slot vector and are addressed by `ObjRef` handles;
//! freed slots are recycled through a free list, so a handle is stable
//! for an object's whole lifetime. Collection is driven by an
//! allocation-byte threshold: the VM marks its roots, the heap traces
//! the object graph with a gray worklist, purges unmarked strings from
//! the weak intern table, then sweeps.

use crate::bytecode::object::{Obj, ObjString};
use crate::bytecode::table::Table;
use crate::bytecode::value::Value;

/// First collection happens once a megabyte has been allocated.
const INITIAL_NEXT_GC: usize = 1024 * 1024;
/// After a collection the threshold doubles from the surviving bytes.
const HEAP_GROW_FACTOR: usize = 2;

/// A handle to a heap object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjRef(u32);

impl ObjRef {
    pub fn from_index(index: usize) -> Self {
        Self(index as u32)
    }

    pub fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug)]
struct Slot {
    obj: Obj,
    marked: bool,
    size: usize,
}

/// The managed heap: object slots, allocation accounting and the weak
/// string intern table.
#[derive(Debug)]
pub struct Heap {
    slots: Vec<Option<Slot>>,
    free: Vec<u32>,
    bytes_allocated: usize,
    next_gc: usize,
    gray: Vec<ObjRef>,
    strings: Table,
}

impl Heap {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            bytes_allocated: 0,
            next_gc: INITIAL_NEXT_GC,
            gray: Vec::new(),
            strings: Table::new(),
        }
    }

    /// True once enough bytes have been allocated that the owner should
    /// run a collection before the next allocation.
    pub fn should_collect(&self) -> bool {
        cfg!(feature = "gc-stress") || self.bytes_allocated > self.next_gc
    }

    pub fn bytes_allocated(&self) -> usize {
        self.bytes_allocated
    }

    /// Number of live objects; linear, for tests and stats.
    pub fn object_count(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }

    /// Allocate `obj` and return its handle. The caller is responsible
    /// for having collected beforehand (see [`Heap::should_collect`])
    /// and for keeping the result reachable.
    pub fn alloc(&mut self, obj: Obj) -> ObjRef {
        let size = obj.size_hint();
        self.bytes_allocated += size;
        let slot = Slot {
            obj,
            marked: false,
            size,
        };
        match self.free.pop() {
            Some(index) => {
                self.slots[index as usize] = Some(slot);
                ObjRef(index)
            }
            None => {
                self.slots.push(Some(slot));
                ObjRef((self.slots.len() - 1) as u32)
            }
        }
    }

    pub fn get(&self, reference: ObjRef) -> &Obj {
        match &self.slots[reference.index()] {
            Some(slot) => &slot.obj,
            None => unreachable!("use of freed object"),
        }
    }

    pub fn get_mut(&mut self, reference: ObjRef) -> &mut Obj {
        match &mut self.slots[reference.index()] {
            Some(slot) => &mut slot.obj,
            None => unreachable!("use of freed object"),
        }
    }

    // ========== Strings ==========

    /// Intern a string: returns the canonical handle for these bytes,
    /// allocating only if the table has no entry for them yet.
    pub fn intern(&mut self, text: &str) -> ObjRef {
        let hash = hash_str(text);
        let slots = &self.slots;
        let existing = self.strings.find_string(hash, |candidate| {
            match &slots[candidate.index()] {
                Some(slot) => matches!(&slot.obj, Obj::String(s) if s.chars == text),
                None => false,
            }
        });
        if let Some(reference) = existing {
            return reference;
        }

        let reference = self.alloc(Obj::String(ObjString {
            chars: text.to_string(),
            hash,
        }));
        // Inserted before any further allocation can trigger a collect,
        // so the new string cannot be swept while unrooted.
        self.strings.set(reference, hash, Value::Nil);
        reference
    }

    /// The characters of an interned string.
    pub fn string(&self, reference: ObjRef) -> &str {
        match self.get(reference) {
            Obj::String(s) => &s.chars,
            _ => unreachable!("expected a string object"),
        }
    }

    /// The cached hash of an interned string.
    pub fn string_hash(&self, reference: ObjRef) -> u32 {
        match self.get(reference) {
            Obj::String(s) => s.hash,
            _ => unreachable!("expected a string object"),
        }
    }

    /// Render a value for `print` and the REPL.
    pub fn format_value(&self, value: Value) -> String {
        match value {
            Value::Nil => "nil".to_string(),
            Value::Bool(b) => b.to_string(),
            Value::Number(n) => n.to_string(),
            Value::Obj(reference) => self.format_object(reference),
        }
    }

    fn format_object(&self, reference: ObjRef) -> String {
        match self.get(reference) {
            Obj::String(s) => s.chars.clone(),
            Obj::Native(_) => "<native fn>".to_string(),
            Obj::Upvalue(_) => "upvalue".to_string(),
            Obj::Closure(closure) => {
                if closure.function.name.is_empty() {
                    "<script>".to_string()
                } else {
                    format!("<fn {}>", closure.function.name)
                }
            }
            Obj::Class(class) => self.string(class.name).to_string(),
            Obj::Instance(instance) => {
                let class_name = match self.get(instance.class) {
                    Obj::Class(class) => self.string(class.name),
                    _ => unreachable!("instance of a non-class"),
                };
                format!("{} instance", class_name)
            }
            Obj::BoundMethod(bound) => self.format_object(bound.method),
        }
    }

    // ========== Collection ==========

    /// Mark a single object as a root.
    pub fn mark_object(&mut self, reference: ObjRef) {
        let slot = match &mut self.slots[reference.index()] {
            Some(slot) => slot,
            None => unreachable!("marking a freed object"),
        };
        if slot.marked {
            return;
        }
        slot.marked = true;
        self.gray.push(reference);
    }

    /// Mark a value if it references an object.
    pub fn mark_value(&mut self, value: Value) {
        if let Value::Obj(reference) = value {
            self.mark_object(reference);
        }
    }

    /// Drain the gray worklist, marking everything reachable from the
    /// roots marked so far.
    pub fn trace_references(&mut self) {
        let mut children = Vec::new();
        while let Some(reference) = self.gray.pop() {
            children.clear();
            self.get(reference).children(&mut children);
            for &child in &children {
                self.mark_object(child);
            }
        }
    }

    /// Drop intern-table entries for strings that did not survive the
    /// mark phase. Must run after tracing and before the sweep.
    pub fn remove_unmarked_strings(&mut self) {
        let slots = &self.slots;
        self.strings.retain_keys(|key| {
            slots[key.index()]
                .as_ref()
                .is_some_and(|slot| slot.marked)
        });
    }

    /// Free every unmarked object, clear the marks on the survivors and
    /// set the next collection threshold.
    pub fn sweep(&mut self) {
        for (index, entry) in self.slots.iter_mut().enumerate() {
            match entry {
                Some(slot) if slot.marked => slot.marked = false,
                Some(slot) => {
                    self.bytes_allocated -= slot.size;
                    *entry = None;
                    self.free.push(index as u32);
                }
                None => {}
            }
        }
        self.next_gc = self.bytes_allocated * HEAP_GROW_FACTOR;
    }
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}

/// 32-bit FNV-1a.
pub fn hash_str(text: &str) -> u32 {
    let mut hash: u32 = 2166136261;
    for byte in text.bytes() {
        hash ^= byte as u32;
        hash = hash.wrapping_mul(16777619);
    }
    hash
}
