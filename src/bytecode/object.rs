//! Heap object representations.

use std::mem;
use std::rc::Rc;

use crate::bytecode::chunk::CompiledFunction;
use crate::bytecode::heap::ObjRef;
use crate::bytecode::table::Table;
use crate::bytecode::value::Value;

/// A host function callable from Opal code.
pub type NativeFn = fn(&[Value]) -> Result<Value, String>;

/// A managed heap object.
#[derive(Debug)]
pub enum Obj {
    String(ObjString),
    Native(ObjNative),
    Upvalue(ObjUpvalue),
    Closure(ObjClosure),
    Class(ObjClass),
    Instance(ObjInstance),
    BoundMethod(ObjBoundMethod),
}

/// An interned string with its cached FNV-1a hash.
#[derive(Debug)]
pub struct ObjString {
    pub chars: String,
    pub hash: u32,
}

/// A host function. Leaf object; created once at VM startup.
#[derive(Debug)]
pub struct ObjNative {
    pub name: &'static str,
    pub arity: u8,
    pub function: NativeFn,
}

/// A captured variable. Open while it still aliases a live stack slot,
/// closed once the value has been hoisted into the object itself.
#[derive(Debug)]
pub enum ObjUpvalue {
    /// Aliases the stack slot at this index.
    Open(usize),
    /// Owns the hoisted value.
    Closed(Value),
}

impl ObjUpvalue {
    pub fn is_open(&self) -> bool {
        matches!(self, ObjUpvalue::Open(_))
    }

    /// The stack slot an open upvalue points at.
    pub fn slot(&self) -> Option<usize> {
        match self {
            ObjUpvalue::Open(slot) => Some(*slot),
            ObjUpvalue::Closed(_) => None,
        }
    }
}

/// A function paired with its captured upvalues.
#[derive(Debug)]
pub struct ObjClosure {
    pub function: Rc<CompiledFunction>,
    pub upvalues: Vec<ObjRef>,
}

/// A class: name, method table and the cached `init` method.
#[derive(Debug)]
pub struct ObjClass {
    /// Interned class name.
    pub name: ObjRef,
    /// Method name -> closure.
    pub methods: Table,
    /// Cached initializer, if the class defines one.
    pub init: Option<ObjRef>,
}

/// An instance: its class plus dynamic fields.
#[derive(Debug)]
pub struct ObjInstance {
    pub class: ObjRef,
    pub fields: Table,
}

/// A method closure bound to a receiver.
#[derive(Debug)]
pub struct ObjBoundMethod {
    pub receiver: Value,
    pub method: ObjRef,
}

impl Obj {
    /// Rough payload size in bytes, fed into the collector's allocation
    /// accounting.
    pub fn size_hint(&self) -> usize {
        let base = mem::size_of::<Obj>();
        base + match self {
            Obj::String(s) => s.chars.capacity(),
            Obj::Native(_) => 0,
            Obj::Upvalue(_) => 0,
            Obj::Closure(c) => c.upvalues.capacity() * mem::size_of::<ObjRef>(),
            Obj::Class(c) => c.methods.byte_size(),
            Obj::Instance(i) => i.fields.byte_size(),
            Obj::BoundMethod(_) => 0,
        }
    }

    /// Collect the outgoing object references for the mark phase.
    /// Strings and natives are leaves.
    pub fn children(&self, out: &mut Vec<ObjRef>) {
        fn push_value(value: Value, out: &mut Vec<ObjRef>) {
            if let Value::Obj(reference) = value {
                out.push(reference);
            }
        }

        match self {
            Obj::String(_) | Obj::Native(_) => {}
            Obj::Upvalue(ObjUpvalue::Open(_)) => {}
            Obj::Upvalue(ObjUpvalue::Closed(value)) => push_value(*value, out),
            Obj::Closure(closure) => out.extend_from_slice(&closure.upvalues),
            Obj::Class(class) => {
                out.push(class.name);
                if let Some(init) = class.init {
                    out.push(init);
                }
                for (key, value) in class.methods.iter() {
                    out.push(key);
                    push_value(value, out);
                }
            }
            Obj::Instance(instance) => {
                out.push(instance.class);
                for (key, value) in instance.fields.iter() {
                    out.push(key);
                    push_value(value, out);
                }
            }
            Obj::BoundMethod(bound) => {
                push_value(bound.receiver, out);
                out.push(bound.method);
            }
        }
    }
}
