//! Stack-based virtual machine for executing bytecode.

use std::rc::Rc;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::bytecode::chunk::{CompiledFunction, Constant};
use crate::bytecode::compiler;
use crate::bytecode::heap::{Heap, ObjRef};
use crate::bytecode::instruction::OpCode;
use crate::bytecode::object::{
    NativeFn, Obj, ObjBoundMethod, ObjClass, ObjClosure, ObjInstance, ObjNative, ObjUpvalue,
};
use crate::bytecode::table::Table;
use crate::bytecode::value::Value;
use crate::error::{OpalError, RuntimeError, TraceFrame};

/// Maximum call depth.
pub const FRAMES_MAX: usize = 64;
/// Initial value-stack capacity; the stack itself grows geometrically.
const STACK_INITIAL: usize = 256;

/// Result type for VM operations.
pub type VMResult<T> = Result<T, RuntimeError>;

/// A call frame representing one function invocation.
#[derive(Debug)]
struct CallFrame {
    /// The closure being executed.
    closure: ObjRef,
    /// Its function, cached so the dispatch loop stays off the heap.
    function: Rc<CompiledFunction>,
    /// Instruction pointer (offset into `function.chunk.code`).
    ip: usize,
    /// Index of this frame's window into the value stack; slot 0 holds
    /// the callee (or the receiver for methods).
    slots_start: usize,
}

/// Where `print` output goes.
#[derive(Debug)]
enum Output {
    Stdout,
    Capture(String),
}

/// The virtual machine. One per interpreter session; globals and the
/// heap survive across `interpret` calls so a REPL can reuse it.
#[derive(Debug)]
pub struct VM {
    stack: Vec<Value>,
    frames: Vec<CallFrame>,
    /// Open upvalues, ordered by descending stack slot (newest first).
    open_upvalues: Vec<ObjRef>,
    globals: Table,
    heap: Heap,
    /// The interned "init" name; also a GC root.
    init_string: ObjRef,
    output: Output,
}

impl VM {
    pub fn new() -> Self {
        Self::with_output(Output::Stdout)
    }

    /// A VM that buffers `print` output instead of writing to stdout.
    pub fn with_capture() -> Self {
        Self::with_output(Output::Capture(String::new()))
    }

    fn with_output(output: Output) -> Self {
        let mut heap = Heap::new();
        let init_string = heap.intern("init");
        let mut vm = Self {
            stack: Vec::with_capacity(STACK_INITIAL),
            frames: Vec::new(),
            open_upvalues: Vec::new(),
            globals: Table::new(),
            heap,
            init_string,
            output,
        };
        vm.define_native("clock", 0, native_clock);
        vm
    }

    /// Drain the captured output buffer.
    pub fn take_output(&mut self) -> String {
        match &mut self.output {
            Output::Capture(buffer) => std::mem::take(buffer),
            Output::Stdout => String::new(),
        }
    }

    /// Compile and execute a source string.
    pub fn interpret(&mut self, source: &str) -> Result<(), OpalError> {
        let function = compiler::compile(source)?;
        self.run(function)?;
        Ok(())
    }

    /// Execute a compiled script. Resets the execution stacks but keeps
    /// globals and interned strings, so the next call succeeds after a
    /// runtime error.
    pub fn run(&mut self, function: Rc<CompiledFunction>) -> VMResult<()> {
        self.stack.clear();
        self.frames.clear();
        self.open_upvalues.clear();

        let closure = self.alloc(Obj::Closure(ObjClosure {
            function: Rc::clone(&function),
            upvalues: Vec::new(),
        }));
        self.stack.push(Value::Obj(closure));
        self.frames.push(CallFrame {
            closure,
            function,
            ip: 0,
            slots_start: 0,
        });

        self.execute()
    }

    /// Main dispatch loop.
    fn execute(&mut self) -> VMResult<()> {
        loop {
            #[cfg(feature = "trace-execution")]
            {
                let mut trace = String::from("          ");
                for value in &self.stack {
                    trace.push_str(&format!("[ {} ]", self.heap.format_value(*value)));
                }
                println!("{}", trace);
                let frame = self.frame();
                let mut text = String::new();
                crate::bytecode::disassembler::disassemble_instruction(
                    &frame.function.chunk,
                    frame.ip,
                    &mut text,
                );
                print!("{}", text);
            }

            let byte = self.read_byte();
            let opcode = match OpCode::from_u8(byte) {
                Some(op) => op,
                None => return Err(self.runtime_error(format!("Unknown opcode {}.", byte))),
            };

            match opcode {
                OpCode::Constant => {
                    let index = self.read_byte() as usize;
                    let value = self.constant_value(index);
                    self.stack.push(value);
                }

                OpCode::ConstantLong => {
                    let index = self.read_u24();
                    let value = self.constant_value(index);
                    self.stack.push(value);
                }

                OpCode::Nil => self.stack.push(Value::Nil),
                OpCode::True => self.stack.push(Value::Bool(true)),
                OpCode::False => self.stack.push(Value::Bool(false)),

                OpCode::Dup => {
                    let value = self.peek(0);
                    self.stack.push(value);
                }

                OpCode::Pop => {
                    self.pop();
                }

                OpCode::DefineGlobal => {
                    let name = self.read_name();
                    let hash = self.heap.string_hash(name);
                    let value = self.peek(0);
                    self.globals.set(name, hash, value);
                    self.pop();
                }

                OpCode::GetGlobal => {
                    let name = self.read_name();
                    let hash = self.heap.string_hash(name);
                    match self.globals.get(name, hash) {
                        Some(value) => self.stack.push(value),
                        None => {
                            let text = self.heap.string(name).to_string();
                            return Err(
                                self.runtime_error(format!("Undefined variable '{}'.", text))
                            );
                        }
                    }
                }

                OpCode::SetGlobal => {
                    let name = self.read_name();
                    let hash = self.heap.string_hash(name);
                    let value = self.peek(0);
                    if self.globals.set(name, hash, value) {
                        // The assignment must not define the variable.
                        self.globals.delete(name, hash);
                        let text = self.heap.string(name).to_string();
                        return Err(self.runtime_error(format!("Undefined variable '{}'.", text)));
                    }
                }

                OpCode::GetLocal => {
                    let slot = self.read_byte() as usize;
                    let base = self.frame().slots_start;
                    let value = self.stack[base + slot];
                    self.stack.push(value);
                }

                OpCode::SetLocal => {
                    let slot = self.read_byte() as usize;
                    let base = self.frame().slots_start;
                    self.stack[base + slot] = self.peek(0);
                }

                OpCode::GetUpvalue => {
                    let index = self.read_byte() as usize;
                    let upvalue = self.frame_upvalue(index);
                    let value = match self.heap.get(upvalue) {
                        Obj::Upvalue(ObjUpvalue::Open(slot)) => self.stack[*slot],
                        Obj::Upvalue(ObjUpvalue::Closed(value)) => *value,
                        _ => unreachable!("closure upvalues are upvalue objects"),
                    };
                    self.stack.push(value);
                }

                OpCode::SetUpvalue => {
                    let index = self.read_byte() as usize;
                    let upvalue = self.frame_upvalue(index);
                    let value = self.peek(0);
                    // Take the slot out before touching the stack.
                    let open_slot = match self.heap.get(upvalue) {
                        Obj::Upvalue(upvalue) => upvalue.slot(),
                        _ => unreachable!("closure upvalues are upvalue objects"),
                    };
                    match open_slot {
                        Some(slot) => self.stack[slot] = value,
                        None => match self.heap.get_mut(upvalue) {
                            Obj::Upvalue(closed) => *closed = ObjUpvalue::Closed(value),
                            _ => unreachable!("closure upvalues are upvalue objects"),
                        },
                    }
                }

                OpCode::CloseUpvalue => {
                    let top = self.stack.len() - 1;
                    self.close_upvalues(top);
                    self.pop();
                }

                OpCode::Equal => {
                    let b = self.pop();
                    let a = self.pop();
                    self.stack.push(Value::Bool(a == b));
                }

                OpCode::Greater => self.binary_number_op(|a, b| Value::Bool(a > b))?,
                OpCode::Less => self.binary_number_op(|a, b| Value::Bool(a < b))?,

                OpCode::Add => match (self.peek(1), self.peek(0)) {
                    (Value::Number(a), Value::Number(b)) => {
                        self.pop();
                        self.pop();
                        self.stack.push(Value::Number(a + b));
                    }
                    (Value::Obj(a), Value::Obj(b))
                        if matches!(self.heap.get(a), Obj::String(_))
                            && matches!(self.heap.get(b), Obj::String(_)) =>
                    {
                        // Operands stay on the stack while the result is
                        // interned, so a collection here cannot free them.
                        let combined =
                            format!("{}{}", self.heap.string(a), self.heap.string(b));
                        let result = self.intern(&combined);
                        self.pop();
                        self.pop();
                        self.stack.push(Value::Obj(result));
                    }
                    _ => {
                        return Err(
                            self.runtime_error("Operands must be two numbers or two strings.")
                        )
                    }
                },

                OpCode::Subtract => self.binary_number_op(|a, b| Value::Number(a - b))?,
                OpCode::Multiply => self.binary_number_op(|a, b| Value::Number(a * b))?,
                OpCode::Divide => self.binary_number_op(|a, b| Value::Number(a / b))?,

                OpCode::Modulo => {
                    let (Value::Number(a), Value::Number(b)) = (self.peek(1), self.peek(0))
                    else {
                        return Err(self.runtime_error("Operands must be numbers."));
                    };
                    let a = round_to_int(a);
                    let b = round_to_int(b);
                    if b == 0 {
                        return Err(self.runtime_error("Modulo by zero."));
                    }
                    self.pop();
                    self.pop();
                    self.stack.push(Value::Number((a % b) as f64));
                }

                OpCode::Not => {
                    let value = self.pop();
                    self.stack.push(Value::Bool(value.is_falsey()));
                }

                OpCode::Negate => {
                    let Value::Number(value) = self.peek(0) else {
                        return Err(self.runtime_error("Operand must be a number."));
                    };
                    self.pop();
                    self.stack.push(Value::Number(-value));
                }

                OpCode::Print => {
                    let value = self.pop();
                    let text = self.heap.format_value(value);
                    self.print_line(text);
                }

                OpCode::Jump => {
                    let offset = self.read_u16() as usize;
                    self.frame_mut().ip += offset;
                }

                OpCode::JumpIfFalse => {
                    let offset = self.read_u16() as usize;
                    if self.peek(0).is_falsey() {
                        self.frame_mut().ip += offset;
                    }
                }

                OpCode::JumpIfTrue => {
                    let offset = self.read_u16() as usize;
                    if !self.peek(0).is_falsey() {
                        self.frame_mut().ip += offset;
                    }
                }

                OpCode::Loop => {
                    let offset = self.read_u16() as usize;
                    self.frame_mut().ip -= offset;
                }

                OpCode::Call => {
                    let arg_count = self.read_byte() as usize;
                    let callee = self.peek(arg_count);
                    self.call_value(callee, arg_count)?;
                }

                OpCode::Return => {
                    let result = self.pop();
                    let frame = self.frames.pop().expect("a frame is active");
                    self.close_upvalues(frame.slots_start);
                    if self.frames.is_empty() {
                        // Pop the script closure and finish.
                        self.pop();
                        return Ok(());
                    }
                    self.stack.truncate(frame.slots_start);
                    self.stack.push(result);
                }

                OpCode::Closure => {
                    let index = self.read_byte() as usize;
                    let function = {
                        match &self.frame().function.chunk.constants[index] {
                            Constant::Function(inner) => Rc::clone(inner),
                            _ => unreachable!("CLOSURE operand must be a function constant"),
                        }
                    };
                    let upvalue_count = function.upvalue_count;
                    let closure = self.alloc(Obj::Closure(ObjClosure {
                        function,
                        upvalues: Vec::with_capacity(upvalue_count),
                    }));
                    // Visible to the collector before the captures run.
                    self.stack.push(Value::Obj(closure));

                    for _ in 0..upvalue_count {
                        let is_local = self.read_byte() == 1;
                        let index = self.read_byte() as usize;
                        let upvalue = if is_local {
                            let slot = self.frame().slots_start + index;
                            self.capture_upvalue(slot)
                        } else {
                            match self.heap.get(self.frame().closure) {
                                Obj::Closure(enclosing) => enclosing.upvalues[index],
                                _ => unreachable!("frame closure is a closure object"),
                            }
                        };
                        match self.heap.get_mut(closure) {
                            Obj::Closure(c) => c.upvalues.push(upvalue),
                            _ => unreachable!("closure was just allocated"),
                        }
                    }
                }

                OpCode::Class => {
                    let name = self.read_name();
                    // Root the fresh name across the allocation; the
                    // intern table alone is weak.
                    self.stack.push(Value::Obj(name));
                    let class = self.alloc(Obj::Class(ObjClass {
                        name,
                        methods: Table::new(),
                        init: None,
                    }));
                    self.pop();
                    self.stack.push(Value::Obj(class));
                }

                OpCode::Inherit => {
                    let superclass = match self.peek(1) {
                        Value::Obj(reference)
                            if matches!(self.heap.get(reference), Obj::Class(_)) =>
                        {
                            reference
                        }
                        _ => return Err(self.runtime_error("Superclass must be a class.")),
                    };
                    let subclass = match self.peek(0) {
                        Value::Obj(reference) => reference,
                        _ => unreachable!("INHERIT operates on a class declaration"),
                    };

                    // Copy-down inheritance: methods defined after this
                    // point shadow the inherited ones.
                    let (pairs, init) = match self.heap.get(superclass) {
                        Obj::Class(class) => {
                            (class.methods.iter().collect::<Vec<_>>(), class.init)
                        }
                        _ => unreachable!("checked above"),
                    };
                    let hashes: Vec<u32> = pairs
                        .iter()
                        .map(|(key, _)| self.heap.string_hash(*key))
                        .collect();
                    match self.heap.get_mut(subclass) {
                        Obj::Class(class) => {
                            for ((key, value), hash) in pairs.into_iter().zip(hashes) {
                                class.methods.set(key, hash, value);
                            }
                            class.init = init;
                        }
                        _ => unreachable!("checked above"),
                    }
                    // The subclass slot; the superclass stays behind as
                    // the hidden `super` local.
                    self.pop();
                }

                OpCode::Method => {
                    let name = self.read_name();
                    let hash = self.heap.string_hash(name);
                    let method = self.peek(0);
                    let method_ref = match method {
                        Value::Obj(reference) => reference,
                        _ => unreachable!("METHOD operates on a closure"),
                    };
                    let class_ref = match self.peek(1) {
                        Value::Obj(reference) => reference,
                        _ => unreachable!("METHOD operates below a class"),
                    };
                    let is_init = name == self.init_string;
                    match self.heap.get_mut(class_ref) {
                        Obj::Class(class) => {
                            class.methods.set(name, hash, method);
                            if is_init {
                                class.init = Some(method_ref);
                            }
                        }
                        _ => unreachable!("METHOD operates below a class"),
                    }
                    self.pop();
                }

                OpCode::GetProperty => {
                    let name = self.read_name();
                    let hash = self.heap.string_hash(name);
                    let receiver = self.peek(0);
                    let receiver_ref = match receiver {
                        Value::Obj(reference)
                            if matches!(self.heap.get(reference), Obj::Instance(_)) =>
                        {
                            reference
                        }
                        _ => {
                            return Err(self.runtime_error("Only instances have properties."))
                        }
                    };

                    let (class, field) = match self.heap.get(receiver_ref) {
                        Obj::Instance(instance) => {
                            (instance.class, instance.fields.get(name, hash))
                        }
                        _ => unreachable!("checked above"),
                    };

                    if let Some(value) = field {
                        self.pop();
                        self.stack.push(value);
                    } else {
                        self.bind_method(class, name, hash)?;
                    }
                }

                OpCode::SetProperty => {
                    let name = self.read_name();
                    let hash = self.heap.string_hash(name);
                    let receiver_ref = match self.peek(1) {
                        Value::Obj(reference)
                            if matches!(self.heap.get(reference), Obj::Instance(_)) =>
                        {
                            reference
                        }
                        _ => return Err(self.runtime_error("Only instances have fields.")),
                    };

                    let value = self.peek(0);
                    match self.heap.get_mut(receiver_ref) {
                        Obj::Instance(instance) => {
                            instance.fields.set(name, hash, value);
                        }
                        _ => unreachable!("checked above"),
                    }

                    // Leave the assigned value as the expression result.
                    let value = self.pop();
                    self.pop();
                    self.stack.push(value);
                }

                OpCode::GetSuper => {
                    let name = self.read_name();
                    let hash = self.heap.string_hash(name);
                    let superclass = match self.pop() {
                        Value::Obj(reference) => reference,
                        _ => unreachable!("GET_SUPER operates on the superclass"),
                    };
                    self.bind_method(superclass, name, hash)?;
                }

                OpCode::Invoke => {
                    let name = self.read_name();
                    let arg_count = self.read_byte() as usize;
                    self.invoke(name, arg_count)?;
                }

                OpCode::SuperInvoke => {
                    let name = self.read_name();
                    let arg_count = self.read_byte() as usize;
                    let hash = self.heap.string_hash(name);
                    let superclass = match self.pop() {
                        Value::Obj(reference) => reference,
                        _ => unreachable!("SUPER_INVOKE operates on the superclass"),
                    };
                    self.invoke_from_class(superclass, name, hash, arg_count)?;
                }
            }
        }
    }

    // ========== Calls ==========

    fn call_value(&mut self, callee: Value, arg_count: usize) -> VMResult<()> {
        enum Callee {
            Closure,
            Native(u8, NativeFn),
            Class(Option<ObjRef>),
            Bound(Value, ObjRef),
            Other,
        }

        let Value::Obj(callee_ref) = callee else {
            return Err(self.runtime_error("Can only call functions and classes."));
        };
        let kind = match self.heap.get(callee_ref) {
            Obj::Closure(_) => Callee::Closure,
            Obj::Native(native) => Callee::Native(native.arity, native.function),
            Obj::Class(class) => Callee::Class(class.init),
            Obj::BoundMethod(bound) => Callee::Bound(bound.receiver, bound.method),
            _ => Callee::Other,
        };

        match kind {
            Callee::Closure => self.call_closure(callee_ref, arg_count),

            Callee::Native(arity, function) => {
                if arg_count != arity as usize {
                    return Err(self.runtime_error(format!(
                        "Expected {} arguments but got {}.",
                        arity, arg_count
                    )));
                }
                let args_start = self.stack.len() - arg_count;
                match function(&self.stack[args_start..]) {
                    Ok(value) => {
                        self.stack.truncate(args_start - 1);
                        self.stack.push(value);
                        Ok(())
                    }
                    Err(message) => Err(self.runtime_error(message)),
                }
            }

            Callee::Class(init) => {
                let instance = self.alloc(Obj::Instance(ObjInstance {
                    class: callee_ref,
                    fields: Table::new(),
                }));
                let slot = self.stack.len() - arg_count - 1;
                self.stack[slot] = Value::Obj(instance);
                if let Some(init) = init {
                    self.call_closure(init, arg_count)
                } else if arg_count != 0 {
                    Err(self
                        .runtime_error(format!("Expected 0 arguments but got {}.", arg_count)))
                } else {
                    Ok(())
                }
            }

            Callee::Bound(receiver, method) => {
                let slot = self.stack.len() - arg_count - 1;
                self.stack[slot] = receiver;
                self.call_closure(method, arg_count)
            }

            Callee::Other => Err(self.runtime_error("Can only call functions and classes.")),
        }
    }

    fn call_closure(&mut self, closure: ObjRef, arg_count: usize) -> VMResult<()> {
        let function = match self.heap.get(closure) {
            Obj::Closure(c) => Rc::clone(&c.function),
            _ => unreachable!("callee must be a closure object"),
        };
        if arg_count != function.arity as usize {
            return Err(self.runtime_error(format!(
                "Expected {} arguments but got {}.",
                function.arity, arg_count
            )));
        }
        if self.frames.len() == FRAMES_MAX {
            return Err(self.runtime_error("Stack overflow."));
        }
        let slots_start = self.stack.len() - arg_count - 1;
        self.frames.push(CallFrame {
            closure,
            function,
            ip: 0,
            slots_start,
        });
        Ok(())
    }

    /// `receiver.name(args)` without materializing a bound method.
    fn invoke(&mut self, name: ObjRef, arg_count: usize) -> VMResult<()> {
        let hash = self.heap.string_hash(name);
        let receiver = self.peek(arg_count);
        let receiver_ref = match receiver {
            Value::Obj(reference) if matches!(self.heap.get(reference), Obj::Instance(_)) => {
                reference
            }
            _ => return Err(self.runtime_error("Only instances have methods.")),
        };

        let (class, field) = match self.heap.get(receiver_ref) {
            Obj::Instance(instance) => (instance.class, instance.fields.get(name, hash)),
            _ => unreachable!("checked above"),
        };

        // A field holding a callable shadows the method.
        if let Some(value) = field {
            let slot = self.stack.len() - arg_count - 1;
            self.stack[slot] = value;
            return self.call_value(value, arg_count);
        }

        self.invoke_from_class(class, name, hash, arg_count)
    }

    fn invoke_from_class(
        &mut self,
        class: ObjRef,
        name: ObjRef,
        hash: u32,
        arg_count: usize,
    ) -> VMResult<()> {
        let method = match self.heap.get(class) {
            Obj::Class(c) => c.methods.get(name, hash),
            _ => unreachable!("method lookup target must be a class"),
        };
        match method {
            Some(Value::Obj(method_ref)) => self.call_closure(method_ref, arg_count),
            _ => {
                let text = self.heap.string(name).to_string();
                Err(self.runtime_error(format!("Undefined property '{}'.", text)))
            }
        }
    }

    /// Replace the receiver on top of the stack with `class.name` bound
    /// to it.
    fn bind_method(&mut self, class: ObjRef, name: ObjRef, hash: u32) -> VMResult<()> {
        let method = match self.heap.get(class) {
            Obj::Class(c) => c.methods.get(name, hash),
            _ => unreachable!("method lookup target must be a class"),
        };
        match method {
            Some(Value::Obj(method_ref)) => {
                let receiver = self.peek(0);
                let bound = self.alloc(Obj::BoundMethod(ObjBoundMethod {
                    receiver,
                    method: method_ref,
                }));
                self.pop();
                self.stack.push(Value::Obj(bound));
                Ok(())
            }
            _ => {
                let text = self.heap.string(name).to_string();
                Err(self.runtime_error(format!("Undefined property '{}'.", text)))
            }
        }
    }

    // ========== Upvalues ==========

    /// Find or create the open upvalue for `slot`. The list is kept
    /// sorted by descending slot so closing can stop early.
    fn capture_upvalue(&mut self, slot: usize) -> ObjRef {
        let mut insert_at = self.open_upvalues.len();
        for (i, &upvalue) in self.open_upvalues.iter().enumerate() {
            match self.heap.get(upvalue) {
                Obj::Upvalue(ObjUpvalue::Open(existing)) => {
                    if *existing == slot {
                        return upvalue;
                    }
                    if *existing < slot {
                        insert_at = i;
                        break;
                    }
                }
                _ => unreachable!("open upvalue list holds open upvalues"),
            }
        }

        let created = self.alloc(Obj::Upvalue(ObjUpvalue::Open(slot)));
        self.open_upvalues.insert(insert_at, created);
        created
    }

    /// Close every open upvalue over a slot at or above `threshold`.
    fn close_upvalues(&mut self, threshold: usize) {
        while let Some(&upvalue) = self.open_upvalues.first() {
            let slot = match self.heap.get(upvalue) {
                Obj::Upvalue(ObjUpvalue::Open(slot)) => *slot,
                _ => unreachable!("open upvalue list holds open upvalues"),
            };
            if slot < threshold {
                break;
            }
            let value = self.stack[slot];
            *self.heap.get_mut(upvalue) = Obj::Upvalue(ObjUpvalue::Closed(value));
            self.open_upvalues.remove(0);
        }
    }

    fn frame_upvalue(&self, index: usize) -> ObjRef {
        match self.heap.get(self.frame().closure) {
            Obj::Closure(closure) => closure.upvalues[index],
            _ => unreachable!("frame closure is a closure object"),
        }
    }

    // ========== Garbage collection ==========

    /// Allocate through the collector: collect first if the threshold
    /// has been crossed, so the new object cannot be swept. Anything
    /// the new object references must already be rooted.
    fn alloc(&mut self, obj: Obj) -> ObjRef {
        if self.heap.should_collect() {
            self.collect_garbage();
        }
        self.heap.alloc(obj)
    }

    /// Intern through the collector; see [`VM::alloc`].
    fn intern(&mut self, text: &str) -> ObjRef {
        if self.heap.should_collect() {
            self.collect_garbage();
        }
        self.heap.intern(text)
    }

    fn collect_garbage(&mut self) {
        // Roots: the value stack, every frame's closure, the open
        // upvalues, the globals table and the interned "init".
        for value in &self.stack {
            self.heap.mark_value(*value);
        }
        for frame in &self.frames {
            self.heap.mark_object(frame.closure);
        }
        for &upvalue in &self.open_upvalues {
            self.heap.mark_object(upvalue);
        }
        for (key, value) in self.globals.iter() {
            self.heap.mark_object(key);
            self.heap.mark_value(value);
        }
        self.heap.mark_object(self.init_string);

        self.heap.trace_references();
        self.heap.remove_unmarked_strings();
        self.heap.sweep();
    }

    // ========== Plumbing ==========

    fn frame(&self) -> &CallFrame {
        self.frames.last().expect("a frame is active")
    }

    fn frame_mut(&mut self) -> &mut CallFrame {
        self.frames.last_mut().expect("a frame is active")
    }

    fn read_byte(&mut self) -> u8 {
        let frame = self.frames.last_mut().expect("a frame is active");
        let byte = frame.function.chunk.code[frame.ip];
        frame.ip += 1;
        byte
    }

    fn read_u16(&mut self) -> u16 {
        let hi = self.read_byte() as u16;
        let lo = self.read_byte() as u16;
        (hi << 8) | lo
    }

    fn read_u24(&mut self) -> usize {
        let b1 = self.read_byte() as usize;
        let b2 = self.read_byte() as usize;
        let b3 = self.read_byte() as usize;
        (b1 << 16) | (b2 << 8) | b3
    }

    /// Load the constant at `index`, interning string constants so that
    /// every load of the same literal yields the same handle.
    fn constant_value(&mut self, index: usize) -> Value {
        let function = Rc::clone(&self.frame().function);
        match &function.chunk.constants[index] {
            Constant::Number(n) => Value::Number(*n),
            Constant::String(s) => {
                let reference = self.intern(s);
                Value::Obj(reference)
            }
            Constant::Function(_) => unreachable!("function constants are loaded by CLOSURE"),
        }
    }

    /// Read a one-byte constant index and resolve it to an interned
    /// name string.
    fn read_name(&mut self) -> ObjRef {
        let index = self.read_byte() as usize;
        let function = Rc::clone(&self.frame().function);
        match &function.chunk.constants[index] {
            Constant::String(s) => self.intern(s),
            _ => unreachable!("name operand must be a string constant"),
        }
    }

    fn peek(&self, distance: usize) -> Value {
        self.stack[self.stack.len() - 1 - distance]
    }

    fn pop(&mut self) -> Value {
        self.stack.pop().expect("stack underflow")
    }

    fn binary_number_op(&mut self, op: fn(f64, f64) -> Value) -> VMResult<()> {
        let (Value::Number(a), Value::Number(b)) = (self.peek(1), self.peek(0)) else {
            return Err(self.runtime_error("Operands must be numbers."));
        };
        self.pop();
        self.pop();
        self.stack.push(op(a, b));
        Ok(())
    }

    /// Build the stack trace (newest frame first), then unwind
    /// everything so the next `interpret` starts clean.
    fn runtime_error(&mut self, message: impl Into<String>) -> RuntimeError {
        let mut error = RuntimeError::new(message);
        for frame in self.frames.iter().rev() {
            let offset = frame.ip.saturating_sub(1);
            error.trace.push(TraceFrame {
                line: frame.function.chunk.get_line(offset),
                name: if frame.function.name.is_empty() {
                    None
                } else {
                    Some(frame.function.name.clone())
                },
            });
        }

        self.stack.clear();
        self.frames.clear();
        self.open_upvalues.clear();
        error
    }

    fn print_line(&mut self, text: String) {
        match &mut self.output {
            Output::Stdout => println!("{}", text),
            Output::Capture(buffer) => {
                buffer.push_str(&text);
                buffer.push('\n');
            }
        }
    }

    fn define_native(&mut self, name: &'static str, arity: u8, function: NativeFn) {
        let name_ref = self.intern(name);
        self.stack.push(Value::Obj(name_ref));
        let native = self.alloc(Obj::Native(ObjNative {
            name,
            arity,
            function,
        }));
        self.stack.push(Value::Obj(native));
        let hash = self.heap.string_hash(name_ref);
        self.globals.set(name_ref, hash, Value::Obj(native));
        self.pop();
        self.pop();
    }
}

impl Default for VM {
    fn default() -> Self {
        Self::new()
    }
}

/// Round an operand the way the modulo operator expects.
fn round_to_int(value: f64) -> i64 {
    (value + 0.5).floor() as i64
}

fn native_clock(_args: &[Value]) -> Result<Value, String> {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|e| format!("clock went backwards: {}", e))?;
    Ok(Value::Number(now.as_secs_f64()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_source(source: &str) -> Result<String, OpalError> {
        let mut vm = VM::with_capture();
        vm.interpret(source)?;
        Ok(vm.take_output())
    }

    fn output(source: &str) -> String {
        run_source(source).expect("program failed")
    }

    fn runtime_failure(source: &str) -> RuntimeError {
        match run_source(source) {
            Err(OpalError::Runtime(error)) => error,
            other => panic!("expected a runtime error, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_arithmetic_and_print() {
        assert_eq!(output("print 1 + 2 * 3;"), "7\n");
        assert_eq!(output("print (1 + 2) * 3;"), "9\n");
        assert_eq!(output("print -4 + 1;"), "-3\n");
        assert_eq!(output("print 7 / 2;"), "3.5\n");
    }

    #[test]
    fn test_ieee_division() {
        assert_eq!(output("print 1 / 0;"), "inf\n");
        assert_eq!(output("print -1 / 0;"), "-inf\n");
        assert_eq!(output("print 0 / 0;"), "NaN\n");
        assert_eq!(output("print 0 / 0 == 0 / 0;"), "false\n");
    }

    #[test]
    fn test_modulo_rounding() {
        assert_eq!(output("print 7 % 3;"), "1\n");
        assert_eq!(output("print 7.4 % 3;"), "1\n");
        // 7.6 rounds to 8 before the remainder.
        assert_eq!(output("print 7.6 % 3;"), "2\n");
        let error = runtime_failure("print 1 % 0;");
        assert_eq!(error.message, "Modulo by zero.");
    }

    #[test]
    fn test_truthiness_and_logic() {
        assert_eq!(output("print !nil;"), "true\n");
        assert_eq!(output("print !0;"), "false\n");
        assert_eq!(output("print !\"\";"), "false\n");
        assert_eq!(output("print nil and 1;"), "nil\n");
        assert_eq!(output("print 1 and 2;"), "2\n");
        assert_eq!(output("print nil or 3;"), "3\n");
        assert_eq!(output("print 1 or 2;"), "1\n");
    }

    #[test]
    fn test_short_circuit_skips_side_effects() {
        assert_eq!(
            output("var x = 0; fun bump() { x = 1; return true; } false and bump(); print x;"),
            "0\n"
        );
        assert_eq!(
            output("var x = 0; fun bump() { x = 1; return true; } true or bump(); print x;"),
            "0\n"
        );
    }

    #[test]
    fn test_ternary() {
        assert_eq!(output("print true ? 1 : 2;"), "1\n");
        assert_eq!(output("print false ? 1 : 2;"), "2\n");
        // Right-associative.
        assert_eq!(output("print false ? 1 : false ? 2 : 3;"), "3\n");
    }

    #[test]
    fn test_string_interning_and_equality() {
        assert_eq!(output("print \"ab\" + \"c\" == \"abc\";"), "true\n");
        assert_eq!(output("print \"a\" == \"b\";"), "false\n");
        assert_eq!(output("print \"\" == \"\";"), "true\n");
    }

    #[test]
    fn test_globals_and_locals() {
        assert_eq!(output("var a = 1; a = a + 2; print a;"), "3\n");
        assert_eq!(
            output("var a = \"global\"; { var a = \"local\"; print a; } print a;"),
            "local\nglobal\n"
        );
    }

    #[test]
    fn test_undefined_variable_errors() {
        let error = runtime_failure("print missing;");
        assert_eq!(error.message, "Undefined variable 'missing'.");
        let error = runtime_failure("missing = 1;");
        assert_eq!(error.message, "Undefined variable 'missing'.");
        // The failed assignment must not define the global.
        let error = runtime_failure("missing = 1; print missing;");
        assert_eq!(error.message, "Undefined variable 'missing'.");
    }

    #[test]
    fn test_if_elif_else_both_forms() {
        let source = "
            fun pick(n) {
                if (n == 1) { return \"one\"; }
                elif (n == 2) { return \"two\"; }
                else { return \"many\"; }
            }
            print pick(1); print pick(2); print pick(5);
        ";
        assert_eq!(output(source), "one\ntwo\nmany\n");

        let source = "
            var n = 2;
            if n == 1 then print \"one\";
            elif n == 2 then print \"two\";
            else print \"many\";
        ";
        assert_eq!(output(source), "two\n");
    }

    #[test]
    fn test_while_and_for() {
        assert_eq!(
            output("var i = 0; while (i < 3) { print i; i = i + 1; }"),
            "0\n1\n2\n"
        );
        assert_eq!(
            output("for (var i = 0; i < 3; i = i + 1) { print i; }"),
            "0\n1\n2\n"
        );
        assert_eq!(output("for (var i = 3; i < 3; i = i + 1) { print i; }"), "");
    }

    #[test]
    fn test_break_and_continue() {
        assert_eq!(
            output(
                "for (var i = 0; i < 10; i = i + 1) { if (i == 3) then break; print i; }"
            ),
            "0\n1\n2\n"
        );
        assert_eq!(
            output(
                "for (var i = 0; i < 5; i = i + 1) { if (i == 2) then continue; print i; }"
            ),
            "0\n1\n3\n4\n"
        );
        // Break only exits the innermost loop.
        assert_eq!(
            output(
                "for (var i = 0; i < 2; i = i + 1) {
                     for (var j = 0; j < 10; j = j + 1) {
                         if (j == 1) then break;
                         print i * 10 + j;
                     }
                 }"
            ),
            "0\n10\n"
        );
    }

    #[test]
    fn test_switch_with_fallthrough() {
        let source = "
            var x = 1;
            switch(x){ case 1: print \"one\"; fallthrough case 2: print \"two\"; default: print \"end\"; }
        ";
        assert_eq!(output(source), "one\ntwo\nend\n");
    }

    #[test]
    fn test_switch_without_match_runs_default() {
        let source = "
            switch(9){ case 1: print \"one\"; case 2: print \"two\"; default: print \"end\"; }
        ";
        assert_eq!(output(source), "end\n");
    }

    #[test]
    fn test_switch_without_default() {
        let source = "
            switch(2){ case 1: print \"one\"; case 2: print \"two\"; }
            print \"after\";
        ";
        assert_eq!(output(source), "two\nafter\n");
        let source = "
            switch(9){ case 1: print \"one\"; }
            print \"after\";
        ";
        assert_eq!(output(source), "after\n");
    }

    #[test]
    fn test_functions_and_returns() {
        assert_eq!(
            output("fun add(a, b) { return a + b; } print add(1, 2);"),
            "3\n"
        );
        assert_eq!(output("fun nothing() { } print nothing();"), "nil\n");
        assert_eq!(output("fun f() { return; } print f();"), "nil\n");
        assert_eq!(output("fun f() { return 1; } print f;"), "<fn f>\n");
    }

    #[test]
    fn test_wrong_arity_errors() {
        let error = runtime_failure("fun f(a) { } f(1, 2);");
        assert_eq!(error.message, "Expected 1 arguments but got 2.");
        let error = runtime_failure("fun f(a) { } f();");
        assert_eq!(error.message, "Expected 1 arguments but got 0.");
    }

    #[test]
    fn test_calling_non_callable_errors() {
        let error = runtime_failure("var x = 1; x();");
        assert_eq!(error.message, "Can only call functions and classes.");
        let error = runtime_failure("\"text\"();");
        assert_eq!(error.message, "Can only call functions and classes.");
    }

    #[test]
    fn test_recursion() {
        assert_eq!(
            output("fun fib(n) { if (n < 2) then return n; return fib(n - 1) + fib(n - 2); } print fib(12);"),
            "144\n"
        );
    }

    #[test]
    fn test_deep_recursion_overflows_frames() {
        let error = runtime_failure("fun f() { f(); } f();");
        assert_eq!(error.message, "Stack overflow.");
        assert!(error.trace.len() > 1);
        // A bounded recursion under the frame cap still works.
        assert_eq!(
            output("fun down(n) { if (n == 0) then return 0; return down(n - 1); } print down(50);"),
            "0\n"
        );
    }

    #[test]
    fn test_closures_capture_variables_not_values() {
        let source = "
            fun makeCounter(){ var n = 0; fun c(){ n = n + 1; return n; } return c; }
            var c = makeCounter(); print c(); print c(); print c();
        ";
        assert_eq!(output(source), "1\n2\n3\n");
    }

    #[test]
    fn test_counters_are_independent() {
        let source = "
            fun makeCounter(){ var n = 0; fun c(){ n = n + 1; return n; } return c; }
            var a = makeCounter(); var b = makeCounter();
            print a(); print a(); print b();
        ";
        assert_eq!(output(source), "1\n2\n1\n");
    }

    #[test]
    fn test_sibling_closures_share_one_upvalue() {
        let source = "
            fun pair() {
                var shared = 0;
                fun set(v) { shared = v; }
                fun get() { return shared; }
                set(42);
                return get;
            }
            print pair()();
        ";
        assert_eq!(output(source), "42\n");
    }

    #[test]
    fn test_upvalue_closed_at_scope_exit() {
        let source = "
            var hold = nil;
            {
                var a = \"inner\";
                fun capture() { return a; }
                hold = capture;
            }
            print hold();
        ";
        assert_eq!(output(source), "inner\n");
    }

    #[test]
    fn test_class_with_init_and_method() {
        let source = "
            class P { init(x){ this.x = x; } get(){ return this.x; } }
            var p = P(42); print p.get();
        ";
        assert_eq!(output(source), "42\n");
    }

    #[test]
    fn test_fields_are_dynamic() {
        let source = "
            class Bag { }
            var bag = Bag();
            bag.first = 1;
            bag.second = bag.first + 1;
            print bag.second;
        ";
        assert_eq!(output(source), "2\n");
    }

    #[test]
    fn test_undefined_property_errors() {
        let error = runtime_failure("class A { } var a = A(); print a.missing;");
        assert_eq!(error.message, "Undefined property 'missing'.");
        let error = runtime_failure("class A { } A().missing();");
        assert_eq!(error.message, "Undefined property 'missing'.");
    }

    #[test]
    fn test_property_on_non_instance_errors() {
        let error = runtime_failure("print (1).x;");
        assert_eq!(error.message, "Only instances have properties.");
        let error = runtime_failure("var s = \"str\"; s.x = 1;");
        assert_eq!(error.message, "Only instances have fields.");
        let error = runtime_failure("(1).m();");
        assert_eq!(error.message, "Only instances have methods.");
    }

    #[test]
    fn test_class_arity_checks() {
        let error = runtime_failure("class A { } A(1);");
        assert_eq!(error.message, "Expected 0 arguments but got 1.");
        let error = runtime_failure("class A { init(x) { } } A();");
        assert_eq!(error.message, "Expected 1 arguments but got 0.");
    }

    #[test]
    fn test_bound_methods_remember_their_receiver() {
        let source = "
            class Greeter { init(name) { this.name = name; } greet() { return this.name; } }
            var m = Greeter(\"left\").greet;
            print m();
        ";
        assert_eq!(output(source), "left\n");
    }

    #[test]
    fn test_callable_field_shadows_method() {
        let source = "
            fun shout() { return \"field\"; }
            class A { speak() { return \"method\"; } }
            var a = A();
            a.speak = shout;
            print a.speak();
        ";
        assert_eq!(output(source), "field\n");
    }

    #[test]
    fn test_initializer_returns_the_instance() {
        let source = "
            class A { init() { this.x = 1; } }
            var a = A();
            print a.x;
            print a.init() == a;
        ";
        assert_eq!(output(source), "1\ntrue\n");
    }

    #[test]
    fn test_inheritance_and_super_call() {
        let source = "
            class A { greet(){ return \"A\"; } }
            class B < A { greet(){ return super.greet() + \"B\"; } }
            print B().greet();
        ";
        assert_eq!(output(source), "AB\n");
    }

    #[test]
    fn test_inherited_methods_and_init() {
        let source = "
            class A { init(x) { this.x = x; } get() { return this.x; } }
            class B < A { }
            print B(7).get();
        ";
        assert_eq!(output(source), "7\n");
    }

    #[test]
    fn test_super_through_get() {
        let source = "
            class A { m() { return \"super\"; } }
            class B < A { m() { var f = super.m; return f(); } }
            print B().m();
        ";
        assert_eq!(output(source), "super\n");
    }

    #[test]
    fn test_inherit_from_non_class_errors() {
        let error = runtime_failure("var NotAClass = 1; class B < NotAClass { }");
        assert_eq!(error.message, "Superclass must be a class.");
    }

    #[test]
    fn test_runtime_error_stack_trace() {
        let error =
            runtime_failure("fun a(){ b(); } fun b(){ return 1 + nil; } a();");
        assert_eq!(error.message, "Operands must be two numbers or two strings.");
        let rendered = error.to_string();
        let b_at = rendered.find("in b()").expect("trace names b");
        let a_at = rendered.find("in a()").expect("trace names a");
        let script_at = rendered.find("in script").expect("trace names script");
        assert!(b_at < a_at && a_at < script_at);
    }

    #[test]
    fn test_trace_lines() {
        let error = runtime_failure("var x = 1;\nvar y = nil;\nprint x + y;");
        assert!(error.to_string().contains("[line 3] in script"));
    }

    #[test]
    fn test_vm_survives_runtime_errors() {
        let mut vm = VM::with_capture();
        assert!(vm.interpret("print undefined_thing;").is_err());
        vm.interpret("print \"still alive\";").expect("VM is reusable");
        assert_eq!(vm.take_output(), "still alive\n");
    }

    #[test]
    fn test_globals_persist_across_interprets() {
        let mut vm = VM::with_capture();
        vm.interpret("var counter = 1;").expect("define");
        vm.interpret("counter = counter + 1; print counter;")
            .expect("use");
        assert_eq!(vm.take_output(), "2\n");
    }

    #[test]
    fn test_clock_native() {
        assert_eq!(output("print clock() > 0;"), "true\n");
        let error = runtime_failure("clock(1);");
        assert_eq!(error.message, "Expected 0 arguments but got 1.");
    }

    #[test]
    fn test_compile_error_is_distinct_from_runtime_error() {
        let mut vm = VM::with_capture();
        assert!(matches!(
            vm.interpret("print ;"),
            Err(OpalError::Compile(_))
        ));
        assert!(matches!(
            vm.interpret("print missing;"),
            Err(OpalError::Runtime(_))
        ));
    }

    #[test]
    fn test_same_source_twice_gives_same_output() {
        let source = "var total = 0; for (var i = 1; i < 5; i = i + 1) { total = total + i; } print total;";
        assert_eq!(output(source), output(source));
    }

    #[test]
    fn test_gc_collects_concatenation_garbage() {
        let mut vm = VM::with_capture();
        // Builds ~2 MB of dead prefixes, forcing at least one collection.
        vm.interpret(
            "var s = \"\";
             for (var i = 0; i < 2000; i = i + 1) { s = s + \"x\"; }
             print s == s + \"\";",
        )
        .expect("program failed");
        assert_eq!(vm.take_output(), "true\n");
        assert!(
            vm.heap.object_count() < 2000,
            "dead strings were not collected: {} objects",
            vm.heap.object_count()
        );
    }

    #[test]
    fn test_gc_preserves_closed_upvalues() {
        let source = "
            fun make() {
                var s = \"kept\" + \"!\";
                fun get() { return s; }
                return get;
            }
            var get = make();
            var junk = \"\";
            for (var i = 0; i < 2000; i = i + 1) { junk = junk + \"y\"; }
            print get();
        ";
        assert_eq!(output(source), "kept!\n");
    }

    #[test]
    fn test_deeply_nested_closures() {
        let source = "
            fun a() {
                var x = \"x\";
                fun b() {
                    fun c() { return x; }
                    return c;
                }
                return b;
            }
            print a()()();
        ";
        assert_eq!(output(source), "x\n");
    }

    #[test]
    fn test_loop_variable_capture() {
        let source = "
            var first = nil;
            for (var i = 0; i < 3; i = i + 1) {
                var j = i;
                fun get() { return j; }
                if (i == 0) then first = get;
            }
            print first();
        ";
        assert_eq!(output(source), "0\n");
    }
}
