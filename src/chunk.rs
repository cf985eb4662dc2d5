//! The linked, ready-to-run representation of a program: the flat instruction buffer produced
//! by the loader together with its constant pool and globals name list. Immutable once
//! `crate::loader::load` returns.

use crate::object::{ObjFunction, ObjRef, ObjString, Value};

pub struct Chunk {
    pub bytecode: Vec<u8>,
    pub constants: Vec<Value>,
    /// Names promoted to globals by the loader (free methods and free slots). Every name here
    /// is present as a key in the interpreter's globals map once linking completes.
    pub global_names: Vec<ObjRef<ObjString>>,
    pub entry_point: ObjRef<ObjFunction>,
}

impl Chunk {
    #[must_use]
    pub fn constant(&self, index: u16) -> Value {
        self.constants[index as usize]
    }
}
