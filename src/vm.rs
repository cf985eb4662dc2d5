//! The interpreter: operand stack, call frames, and the opcode dispatch loop.
//!
//! Grounded on `examples/original_source/src/vm.c` (full read): `interpret`'s dispatch loop,
//! `interpret_function_call`, `dispatch_builtin`'s primitive-operator table, `find_field`/
//! `set_field`, and `interpret_print`'s argument-order and composite-value formatting rules.

use std::io::Write;

use crate::chunk::Chunk;
use crate::error::{ExhaustionError, FmlError, RuntimeError};
use crate::heap::{Heap, Roots};
use crate::hashmap::FmlMap;
use crate::object::{
    AnyRef, ObjArray, ObjClass, ObjFunction, ObjInstance, ObjRef, ObjSlot, ObjString, ObjType,
    Value,
};
use crate::opcode::Opcode;

pub const MAX_LOCALS: usize = 256;
pub const FRAMES_LIMIT: usize = 1024;

struct Frame {
    locals: [Value; MAX_LOCALS],
    return_ip: usize,
    /// Stack depth at the moment this frame's call arguments were consumed; `RETURN` truncates
    /// the operand stack back to this depth before pushing the result.
    stack_base: usize,
}

impl Frame {
    fn new(return_ip: usize, stack_base: usize) -> Self {
        Self {
            locals: [Value::Null; MAX_LOCALS],
            return_ip,
            stack_base,
        }
    }
}

struct VmRoots<'a> {
    stack: &'a [Value],
    frames: &'a [Frame],
    globals: &'a FmlMap,
    constants: &'a [Value],
}

impl Roots for VmRoots<'_> {
    fn for_each_root(&self, f: &mut dyn FnMut(Value)) {
        for v in self.stack {
            f(*v);
        }
        for frame in self.frames {
            for v in frame.locals.iter() {
                f(*v);
            }
        }
        for (k, v) in self.globals.iter() {
            f(Value::Object(unsafe { AnyRef::new(k.as_header_ptr()) }));
            f(v);
        }
        for v in self.constants {
            f(*v);
        }
    }
}

pub struct Vm<'chunk> {
    chunk: &'chunk Chunk,
    pub heap: Heap,
    pub globals: FmlMap,
    stack: Vec<Value>,
    frames: Vec<Frame>,
    ip: usize,
    stdout: Box<dyn Write>,
}

/// Builds a `VmRoots` from disjoint field borrows of `$self`, never `&$self` as a whole --
/// needed so the borrow checker still lets the caller take `&mut $self.heap` in the same
/// expression (e.g. `$self.heap.alloc_array(.., &vm_roots!($self))`).
macro_rules! vm_roots {
    ($self:expr) => {
        VmRoots {
            stack: &$self.stack,
            frames: &$self.frames,
            globals: &$self.globals,
            constants: &$self.chunk.constants,
        }
    };
}

impl<'chunk> Vm<'chunk> {
    #[must_use]
    pub fn new(chunk: &'chunk Chunk, heap: Heap, globals: FmlMap, stdout: Box<dyn Write>) -> Self {
        Self {
            chunk,
            heap,
            globals,
            stack: Vec::new(),
            frames: Vec::new(),
            ip: 0,
            stdout,
        }
    }

    fn push(&mut self, v: Value) {
        self.stack.push(v);
    }

    fn pop(&mut self) -> Result<Value, FmlError> {
        self.stack
            .pop()
            .ok_or_else(|| FmlError::Exhaustion(ExhaustionError::StackUnderflow))
    }

    fn read_u8(&mut self) -> u8 {
        let b = self.chunk.bytecode[self.ip];
        self.ip += 1;
        b
    }

    fn read_u16(&mut self) -> u16 {
        let bytes = [self.chunk.bytecode[self.ip], self.chunk.bytecode[self.ip + 1]];
        self.ip += 2;
        u16::from_le_bytes(bytes)
    }

    /// Jump/branch targets are encoded big-endian in the linked chunk, unlike every other
    /// multi-byte operand -- see `SPEC_FULL.md` §4.6.
    fn read_u24_be(&mut self) -> u32 {
        let bytes = [
            0,
            self.chunk.bytecode[self.ip],
            self.chunk.bytecode[self.ip + 1],
            self.chunk.bytecode[self.ip + 2],
        ];
        self.ip += 3;
        u32::from_be_bytes(bytes)
    }

    /// Runs the program from its entry point to completion, returning `Ok(())` once the initial
    /// frame returns.
    pub fn run(&mut self) -> Result<(), FmlError> {
        let entry = self.chunk.entry_point;
        self.ip = entry.entry as usize;
        self.frames.push(Frame::new(usize::MAX, 0));
        loop {
            if self.ip >= self.chunk.bytecode.len() {
                return Ok(());
            }
            let opcode_byte = self.read_u8();
            let opcode = Opcode::try_from(opcode_byte)
                .map_err(|_| FmlError::Runtime(RuntimeError::UnknownOpcode(opcode_byte)))?;
            match opcode {
                Opcode::Label => {
                    self.read_u16();
                }
                Opcode::Literal => {
                    let idx = self.read_u16();
                    self.push(self.chunk.constant(idx));
                }
                Opcode::Drop => {
                    self.pop()?;
                }
                Opcode::Print => self.op_print()?,
                Opcode::Array => self.op_array()?,
                Opcode::Object => self.op_object()?,
                Opcode::GetField => self.op_get_field()?,
                Opcode::SetField => self.op_set_field()?,
                Opcode::CallMethod => self.op_call_method()?,
                Opcode::CallFunction => self.op_call_function()?,
                Opcode::SetLocal => {
                    let slot = self.read_u16() as usize;
                    let v = *self.stack.last().ok_or(FmlError::Exhaustion(ExhaustionError::StackUnderflow))?;
                    self.current_frame_mut().locals[slot] = v;
                }
                Opcode::GetLocal => {
                    let slot = self.read_u16() as usize;
                    self.push(self.current_frame().locals[slot]);
                }
                Opcode::SetGlobal => {
                    let idx = self.read_u16();
                    let name = self.global_name(idx)?;
                    let v = *self.stack.last().ok_or(FmlError::Exhaustion(ExhaustionError::StackUnderflow))?;
                    self.globals.insert(name, v);
                }
                Opcode::GetGlobal => {
                    let idx = self.read_u16();
                    let name = self.global_name(idx)?;
                    let v = self.globals.get(&name).unwrap_or(Value::Null);
                    self.push(v);
                }
                Opcode::Branch => {
                    let target = self.read_u24_be();
                    let cond = self.pop()?;
                    if cond.is_truthy() {
                        self.ip = target as usize;
                    }
                }
                Opcode::Jump => {
                    let target = self.read_u24_be();
                    self.ip = target as usize;
                }
                Opcode::Return => {
                    let result = self.pop()?;
                    let frame = self.frames.pop().expect("frame stack non-empty while running");
                    self.stack.truncate(frame.stack_base);
                    if frame.return_ip == usize::MAX {
                        return Ok(());
                    }
                    self.ip = frame.return_ip;
                    self.push(result);
                }
            }
        }
    }

    fn current_frame(&self) -> &Frame {
        self.frames.last().expect("frame stack non-empty while running")
    }

    fn current_frame_mut(&mut self) -> &mut Frame {
        self.frames.last_mut().expect("frame stack non-empty while running")
    }

    fn global_name(&self, idx: u16) -> Result<ObjRef<ObjString>, FmlError> {
        match self.chunk.constant(idx) {
            Value::Object(obj) if obj.header().ty == ObjType::String => {
                Ok(unsafe { ObjRef::new(obj.as_header_ptr()) })
            }
            Value::Object(obj) if obj.header().ty == ObjType::Slot => {
                let slot: ObjRef<ObjSlot> = unsafe { ObjRef::new(obj.as_header_ptr()) };
                Ok(slot.name)
            }
            _ => Err(FmlError::Runtime(RuntimeError::NotAnInstance)),
        }
    }

    fn push_call(&mut self, func: ObjRef<ObjFunction>, argc: u8) -> Result<(), FmlError> {
        if self.frames.len() >= FRAMES_LIMIT {
            return Err(FmlError::Exhaustion(ExhaustionError::FrameOverflow));
        }
        let stack_base = self.stack.len() - argc as usize;
        let mut frame = Frame::new(self.ip, stack_base);
        for i in (0..argc as usize).rev() {
            frame.locals[i] = self.pop()?;
        }
        self.ip = func.entry as usize;
        self.frames.push(frame);
        Ok(())
    }

    fn op_call_function(&mut self) -> Result<(), FmlError> {
        let idx = self.read_u16();
        let argc = self.read_u8();
        let name = self.global_name(idx)?;
        let target = self
            .globals
            .get(&name)
            .ok_or_else(|| FmlError::Link(crate::error::LinkError::UndefinedGlobal(name.as_str_lossy().into_owned())))?;
        let Value::Object(obj) = target else {
            return Err(FmlError::Runtime(RuntimeError::NotAFunction(name.as_str_lossy().into_owned())));
        };
        if obj.header().ty != ObjType::Function {
            return Err(FmlError::Runtime(RuntimeError::NotAFunction(name.as_str_lossy().into_owned())));
        }
        let func: ObjRef<ObjFunction> = unsafe { ObjRef::new(obj.as_header_ptr()) };
        self.push_call(func, argc)
    }

    /// Resolves `name` starting at `receiver`, walking the `extends` chain until a class defines
    /// it or the chain bottoms out at a primitive value (at which point primitive dispatch takes
    /// over). Returns the instance the method was actually found on, so its body sees the right
    /// subobject as `this`.
    fn resolve_method(
        &self,
        receiver: Value,
        name: &ObjString,
    ) -> Option<(Value, ObjRef<ObjFunction>)> {
        let mut current = receiver;
        loop {
            match current {
                Value::Object(obj) if obj.header().ty == ObjType::Instance => {
                    let instance: ObjRef<ObjInstance> = unsafe { ObjRef::new(obj.as_header_ptr()) };
                    if let Some(Value::Object(method_obj)) = instance.class.methods.get(name) {
                        let f: ObjRef<ObjFunction> = unsafe { ObjRef::new(method_obj.as_header_ptr()) };
                        return Some((current, f));
                    }
                    current = instance.extends;
                }
                _ => return None,
            }
        }
    }

    fn op_call_method(&mut self) -> Result<(), FmlError> {
        let idx = self.read_u16();
        let argc = self.read_u8();
        let name_obj = self.chunk.constant(idx);
        let Value::Object(name_any) = name_obj else {
            return Err(FmlError::Runtime(RuntimeError::NotAnInstance));
        };
        let name_ref: ObjRef<ObjString> = unsafe { ObjRef::new(name_any.as_header_ptr()) };
        // `argc` counts the receiver itself as the bottommost of its operands (the spec's own
        // `1 + 2` example encodes `CALL_METHOD "+" 2` for a single real argument), so the
        // receiver sits at `stack.len() - argc`, not `- argc - 1`.
        let receiver_index = self.stack.len() - argc as usize;
        let receiver = self.stack[receiver_index];

        if let Some((found_on, func)) = self.resolve_method(receiver, &name_ref) {
            self.stack[receiver_index] = found_on;
            return self.push_call(func, argc);
        }

        // Walk to the primitive at the bottom of the `extends` chain (or the receiver itself,
        // if it was never an instance) and dispatch a builtin operator.
        let mut primitive = receiver;
        while let Value::Object(obj) = primitive {
            if obj.header().ty != ObjType::Instance {
                break;
            }
            let instance: ObjRef<ObjInstance> = unsafe { ObjRef::new(obj.as_header_ptr()) };
            primitive = instance.extends;
        }
        self.dispatch_builtin(primitive, &name_ref, argc - 1, receiver_index)
    }

    fn dispatch_builtin(
        &mut self,
        receiver: Value,
        name: &ObjString,
        argc: u8,
        receiver_index: usize,
    ) -> Result<(), FmlError> {
        let op = name.as_bytes();
        let mut args = Vec::with_capacity(argc as usize);
        for _ in 0..argc {
            args.push(self.pop()?);
        }
        args.reverse();
        self.stack.truncate(receiver_index);

        let result = match receiver {
            Value::Integer(a) => self.dispatch_integer(a, op, &args, name)?,
            Value::Boolean(a) => self.dispatch_boolean(a, op, &args, name)?,
            Value::Null => self.dispatch_null(op, &args, name)?,
            Value::Object(obj) if obj.header().ty == ObjType::Array => {
                self.dispatch_array(unsafe { ObjRef::new(obj.as_header_ptr()) }, op, &args, name)?
            }
            _ => {
                return Err(FmlError::Runtime(RuntimeError::NoMatchingOperator {
                    receiver: receiver.type_name(),
                    name: name.as_str_lossy().into_owned(),
                }))
            }
        };
        self.push(result);
        Ok(())
    }

    fn dispatch_integer(
        &self,
        a: i32,
        op: &[u8],
        args: &[Value],
        name: &ObjString,
    ) -> Result<Value, FmlError> {
        let b = match args.first() {
            Some(Value::Integer(b)) => Some(*b),
            _ => None,
        };
        if matches!(op, b"/" | b"%") && b == Some(0) {
            return Err(FmlError::Runtime(RuntimeError::DivisionByZero));
        }
        let v = match (op, b) {
            (b"+", Some(b)) => Value::Integer(a.wrapping_add(b)),
            (b"-", Some(b)) => Value::Integer(a.wrapping_sub(b)),
            (b"*", Some(b)) => Value::Integer(a.wrapping_mul(b)),
            (b"/", Some(b)) => Value::Integer(a.wrapping_div(b)),
            (b"%", Some(b)) => Value::Integer(a % b),
            (b"<", Some(b)) => Value::Boolean(a < b),
            (b">", Some(b)) => Value::Boolean(a > b),
            (b"<=", Some(b)) => Value::Boolean(a <= b),
            (b">=", Some(b)) => Value::Boolean(a >= b),
            (b"<" | b">" | b"<=" | b">=", None) => Value::Boolean(false),
            (b"==", _) => Value::Boolean(matches!(args.first(), Some(Value::Integer(b)) if *b == a)),
            (b"!=", _) => Value::Boolean(!matches!(args.first(), Some(Value::Integer(b)) if *b == a)),
            _ => {
                return Err(FmlError::Runtime(RuntimeError::NoMatchingOperator {
                    receiver: "Integer",
                    name: name.as_str_lossy().into_owned(),
                }))
            }
        };
        Ok(v)
    }

    fn dispatch_boolean(
        &self,
        a: bool,
        op: &[u8],
        args: &[Value],
        name: &ObjString,
    ) -> Result<Value, FmlError> {
        let b = match args.first() {
            Some(Value::Boolean(b)) => Some(*b),
            _ => None,
        };
        let v = match (op, b) {
            (b"|", Some(b)) => Value::Boolean(a || b),
            (b"&", Some(b)) => Value::Boolean(a && b),
            (b"==", Some(b)) => Value::Boolean(a == b),
            (b"!=", Some(b)) => Value::Boolean(a != b),
            _ => {
                return Err(FmlError::Runtime(RuntimeError::NoMatchingOperator {
                    receiver: "Boolean",
                    name: name.as_str_lossy().into_owned(),
                }))
            }
        };
        Ok(v)
    }

    fn dispatch_null(&self, op: &[u8], args: &[Value], name: &ObjString) -> Result<Value, FmlError> {
        let is_null = matches!(args.first(), Some(Value::Null));
        match op {
            b"==" => Ok(Value::Boolean(is_null)),
            b"!=" => Ok(Value::Boolean(!is_null)),
            _ => Err(FmlError::Runtime(RuntimeError::NoMatchingOperator {
                receiver: "Null",
                name: name.as_str_lossy().into_owned(),
            })),
        }
    }

    fn dispatch_array(
        &self,
        mut array: ObjRef<ObjArray>,
        op: &[u8],
        args: &[Value],
        name: &ObjString,
    ) -> Result<Value, FmlError> {
        match op {
            b"get" => {
                let Some(Value::Integer(index)) = args.first() else {
                    return Err(FmlError::Runtime(RuntimeError::NonIntegerIndex));
                };
                array
                    .as_slice()
                    .get(*index as usize)
                    .copied()
                    .ok_or(FmlError::Runtime(RuntimeError::NonIntegerIndex))
            }
            b"set" => {
                let (Some(Value::Integer(index)), Some(value)) = (args.first(), args.get(1)) else {
                    return Err(FmlError::Runtime(RuntimeError::NonIntegerIndex));
                };
                let slot = array
                    .as_slice_mut()
                    .get_mut(*index as usize)
                    .ok_or(FmlError::Runtime(RuntimeError::NonIntegerIndex))?;
                *slot = *value;
                Ok(*value)
            }
            _ => Err(FmlError::Runtime(RuntimeError::NoMatchingOperator {
                receiver: "Array",
                name: name.as_str_lossy().into_owned(),
            })),
        }
    }

    fn op_array(&mut self) -> Result<(), FmlError> {
        let initial = self.pop()?;
        let Value::Integer(size) = self.pop()? else {
            return Err(FmlError::Runtime(RuntimeError::NonIntegerIndex));
        };
        let roots = vm_roots!(self);
        let array = self
            .heap
            .alloc_array(size.max(0) as u32, initial, &roots)?;
        self.push(Value::Object(unsafe { AnyRef::new(array.as_header_ptr()) }));
        Ok(())
    }

    fn op_object(&mut self) -> Result<(), FmlError> {
        let idx = self.read_u16();
        let Value::Object(class_obj) = self.chunk.constant(idx) else {
            return Err(FmlError::Runtime(RuntimeError::NotAnInstance));
        };
        let class: ObjRef<ObjClass> = unsafe { ObjRef::new(class_obj.as_header_ptr()) };
        let field_count = class.fields.len();
        let mut values = Vec::with_capacity(field_count);
        for _ in 0..field_count {
            values.push(self.pop()?);
        }
        values.reverse();
        let parent = self.pop()?;
        let roots = vm_roots!(self);
        let mut instance = self.heap.alloc_instance(class, parent, &roots)?;
        for (field_name, value) in class.fields.iter().zip(values) {
            instance.fields.insert(*field_name, value);
        }
        self.push(Value::Object(unsafe { AnyRef::new(instance.as_header_ptr()) }));
        Ok(())
    }

    fn find_field(&self, mut receiver: Value, name: &ObjString) -> Result<Value, FmlError> {
        loop {
            match receiver {
                Value::Object(obj) if obj.header().ty == ObjType::Instance => {
                    let instance: ObjRef<ObjInstance> = unsafe { ObjRef::new(obj.as_header_ptr()) };
                    if let Some(v) = instance.fields.get(name) {
                        return Ok(v);
                    }
                    receiver = instance.extends;
                }
                _ => return Err(FmlError::Runtime(RuntimeError::NotAnInstance)),
            }
        }
    }

    fn op_get_field(&mut self) -> Result<(), FmlError> {
        let idx = self.read_u16();
        let name = self.global_name(idx)?;
        let receiver = self.pop()?;
        let value = self.find_field(receiver, &name)?;
        self.push(value);
        Ok(())
    }

    fn op_set_field(&mut self) -> Result<(), FmlError> {
        let idx = self.read_u16();
        let name = self.global_name(idx)?;
        let value = self.pop()?;
        let receiver = self.pop()?;
        let Value::Object(obj) = receiver else {
            return Err(FmlError::Runtime(RuntimeError::NotAnInstance));
        };
        if obj.header().ty != ObjType::Instance {
            return Err(FmlError::Runtime(RuntimeError::NotAnInstance));
        }
        let mut instance: ObjRef<ObjInstance> = unsafe { ObjRef::new(obj.as_header_ptr()) };
        instance.fields.insert(name, value);
        self.push(value);
        Ok(())
    }

    fn format_value(&self, value: Value) -> String {
        match value {
            Value::Integer(i) => i.to_string(),
            Value::Boolean(b) => b.to_string(),
            Value::Null => "null".to_string(),
            Value::Object(obj) => match obj.header().ty {
                ObjType::String => {
                    let s: ObjRef<ObjString> = unsafe { ObjRef::new(obj.as_header_ptr()) };
                    s.as_str_lossy().into_owned()
                }
                ObjType::Array => {
                    let a: ObjRef<ObjArray> = unsafe { ObjRef::new(obj.as_header_ptr()) };
                    let items: Vec<String> =
                        a.as_slice().iter().map(|v| self.format_value(*v)).collect();
                    format!("[{}]", items.join(", "))
                }
                ObjType::Instance => {
                    let instance: ObjRef<ObjInstance> = unsafe { ObjRef::new(obj.as_header_ptr()) };
                    let mut fields: Vec<(String, Value)> = instance
                        .fields
                        .iter()
                        .map(|(k, v)| (k.as_str_lossy().into_owned(), v))
                        .collect();
                    fields.sort_by(|a, b| a.0.cmp(&b.0));
                    let parent = self.format_value(instance.extends);
                    let body: Vec<String> = fields
                        .into_iter()
                        .map(|(k, v)| format!("{k}={}", self.format_value(v)))
                        .collect();
                    format!("object(..={parent}, {})", body.join(", "))
                }
                _ => String::new(),
            },
        }
    }

    fn op_print(&mut self) -> Result<(), FmlError> {
        let idx = self.read_u16();
        let argc = self.read_u8();
        let Value::Object(fmt_obj) = self.chunk.constant(idx) else {
            return Err(FmlError::Runtime(RuntimeError::FormatArgMismatch));
        };
        let fmt: ObjRef<ObjString> = unsafe { ObjRef::new(fmt_obj.as_header_ptr()) };
        let mut args = Vec::with_capacity(argc as usize);
        for _ in 0..argc {
            args.push(self.pop()?);
        }
        args.reverse();

        let mut out = String::new();
        let mut arg_index = 0usize;
        let mut chars = fmt.as_str_lossy().chars().peekable();
        while let Some(c) = chars.next() {
            if c == '\\' {
                match chars.next() {
                    Some('n') => out.push('\n'),
                    Some('r') => out.push('\r'),
                    Some('t') => out.push('\t'),
                    Some('\\') => out.push('\\'),
                    Some('"') => out.push('"'),
                    Some('~') => out.push('~'),
                    Some(other) => out.push(other),
                    None => {}
                }
            } else if c == '~' {
                let value = *args
                    .get(arg_index)
                    .ok_or(FmlError::Runtime(RuntimeError::FormatArgMismatch))?;
                out.push_str(&self.format_value(value));
                arg_index += 1;
            } else {
                out.push(c);
            }
        }
        if arg_index != args.len() {
            return Err(FmlError::Runtime(RuntimeError::FormatArgMismatch));
        }
        let _ = write!(self.stdout, "{out}");
        self.push(Value::Null);
        Ok(())
    }
}
