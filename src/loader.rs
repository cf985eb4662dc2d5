//! Binary loader / linker.
//!
//! `ByteCursor` is the teacher's `bits.rs::Cursor` rewritten at byte granularity: this format
//! has no sub-byte fields, so there is no VBR/bit-peek machinery, only little-endian primitive
//! reads with the same `#[must_use]`/bounds-checked-`Result` texture. The two-pass label
//! resolution, globals promotion and class-member attachment follow
//! `examples/original_source/src/serializer.c` (`prepare_jumps`, `parse_bytecode`,
//! `parse_constant_pool`, `parse_globals`, `parse`).

use std::collections::{HashMap, HashSet};
use std::{error, fmt};

use crate::chunk::Chunk;
use crate::error::{DecodeError, FmlError, LinkError};
use crate::heap::{Heap, Roots};
use crate::object::{ObjRef, ObjString, Value};
use crate::opcode::{ConstantTag, Opcode};

#[derive(Debug, Clone)]
pub enum CursorError {
    Eof,
}

impl fmt::Display for CursorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("unexpected end of file")
    }
}
impl error::Error for CursorError {}

impl From<CursorError> for FmlError {
    fn from(_: CursorError) -> Self {
        FmlError::Decode(DecodeError::TruncatedFile)
    }
}

/// Little-endian byte reader over the whole input file.
pub struct ByteCursor<'input> {
    buffer: &'input [u8],
    offset: usize,
}

impl<'input> ByteCursor<'input> {
    #[must_use]
    pub fn new(buffer: &'input [u8]) -> Self {
        Self { buffer, offset: 0 }
    }

    pub fn read_u8(&mut self) -> Result<u8, CursorError> {
        let b = *self.buffer.get(self.offset).ok_or(CursorError::Eof)?;
        self.offset += 1;
        Ok(b)
    }

    pub fn read_u16(&mut self) -> Result<u16, CursorError> {
        let bytes = self.read_bytes(2)?;
        Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
    }

    pub fn read_u32(&mut self) -> Result<u32, CursorError> {
        let bytes = self.read_bytes(4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub fn read_i32(&mut self) -> Result<i32, CursorError> {
        Ok(self.read_u32()? as i32)
    }

    pub fn read_bytes(&mut self, count: usize) -> Result<&'input [u8], CursorError> {
        let bytes = self
            .buffer
            .get(self.offset..self.offset + count)
            .ok_or(CursorError::Eof)?;
        self.offset += count;
        Ok(bytes)
    }

    #[must_use]
    pub fn is_at_end(&self) -> bool {
        self.offset >= self.buffer.len()
    }
}

/// A method body's bytes, before translation into the shared chunk buffer. `labels` and
/// `patch_sites` are offsets local to `instructions`; they are rebased once this method's
/// bytes are appended to the chunk's shared buffer at a known base offset.
struct RawMethod {
    name_index: u16,
    arity: u8,
    locals: u16,
    instructions: Vec<u8>,
    labels: HashMap<u16, u32>,
    patch_sites: Vec<(usize, u16)>,
}

enum RawConstant {
    Integer(i32),
    Null,
    Boolean(bool),
    String(Vec<u8>),
    Slot { name_index: u16 },
    Method(RawMethod),
    Class { member_indices: Vec<u16> },
}

/// Roots while the constant pool is only partially built: every already-resolved constant plus
/// anything the bytecode-translation pass has interned so far.
struct LoaderRoots<'a> {
    resolved: &'a [Option<Value>],
}

impl Roots for LoaderRoots<'_> {
    fn for_each_root(&self, f: &mut dyn FnMut(Value)) {
        for v in self.resolved.iter().flatten() {
            f(*v);
        }
    }
}

fn loader_roots(resolved: &[Option<Value>]) -> LoaderRoots<'_> {
    LoaderRoots { resolved }
}

/// Reads one instruction (opcode byte + its operands, verbatim) from `cursor`, appends it to
/// `out`, and if it is a jump-family instruction records a patch site so the second pass can
/// overwrite the operand with an absolute, big-endian chunk offset.
fn translate_instruction(
    cursor: &mut ByteCursor<'_>,
    out: &mut Vec<u8>,
    labels: &mut HashMap<u16, u32>,
    patch_sites: &mut Vec<(usize, u16)>,
) -> Result<(), FmlError> {
    let opcode_byte = cursor.read_u8()?;
    let opcode = Opcode::try_from(opcode_byte)
        .map_err(|_| FmlError::Decode(DecodeError::UnknownOpcode(opcode_byte)))?;
    out.push(opcode_byte);
    match opcode {
        Opcode::Label => {
            let name_index = cursor.read_u16()?;
            out.extend_from_slice(&name_index.to_le_bytes());
            labels.insert(name_index, out.len() as u32 - 3);
        }
        Opcode::Branch | Opcode::Jump => {
            let name_index = cursor.read_u16()?;
            let _sentinel = cursor.read_u8()?;
            let operand_offset = out.len();
            out.extend_from_slice(&[0, 0, 0]);
            patch_sites.push((operand_offset, name_index));
        }
        Opcode::Literal
        | Opcode::GetField
        | Opcode::SetField
        | Opcode::SetLocal
        | Opcode::GetLocal
        | Opcode::SetGlobal
        | Opcode::GetGlobal
        | Opcode::Object => {
            out.extend_from_slice(&cursor.read_u16()?.to_le_bytes());
        }
        Opcode::Print | Opcode::CallMethod | Opcode::CallFunction => {
            out.extend_from_slice(&cursor.read_u16()?.to_le_bytes());
            out.push(cursor.read_u8()?);
        }
        Opcode::Array | Opcode::Drop | Opcode::Return => {}
    }
    Ok(())
}

fn read_constant_pool(cursor: &mut ByteCursor<'_>, count: u16) -> Result<Vec<RawConstant>, FmlError> {
    let mut raw = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let tag_byte = cursor.read_u8()?;
        let tag = ConstantTag::try_from(tag_byte)
            .map_err(|_| FmlError::Decode(DecodeError::UnknownConstantTag(tag_byte)))?;
        let constant = match tag {
            ConstantTag::Integer => RawConstant::Integer(cursor.read_i32()?),
            ConstantTag::Null => RawConstant::Null,
            ConstantTag::Boolean => RawConstant::Boolean(cursor.read_u8()? != 0),
            ConstantTag::String => {
                let len = cursor.read_u32()? as usize;
                RawConstant::String(cursor.read_bytes(len)?.to_vec())
            }
            ConstantTag::Slot => RawConstant::Slot {
                name_index: cursor.read_u16()?,
            },
            ConstantTag::Method => {
                let name_index = cursor.read_u16()?;
                let arity = cursor.read_u8()?;
                let locals = cursor.read_u16()?;
                let instr_count = cursor.read_u32()?;
                let mut instructions = Vec::new();
                let mut labels = HashMap::new();
                let mut patch_sites = Vec::new();
                for _ in 0..instr_count {
                    translate_instruction(cursor, &mut instructions, &mut labels, &mut patch_sites)?;
                }
                RawConstant::Method(RawMethod {
                    name_index,
                    arity,
                    locals,
                    instructions,
                    labels,
                    patch_sites,
                })
            }
            ConstantTag::Class => {
                let member_count = cursor.read_u16()?;
                let mut member_indices = Vec::with_capacity(member_count as usize);
                for _ in 0..member_count {
                    member_indices.push(cursor.read_u16()?);
                }
                RawConstant::Class { member_indices }
            }
        };
        raw.push(constant);
    }
    Ok(raw)
}

/// Loads and links a complete binary program, returning its `Chunk` with the constant pool,
/// entry point and globals map already populated on `heap`.
pub fn load(
    bytes: &[u8],
    heap: &mut Heap,
    globals: &mut crate::hashmap::FmlMap,
) -> Result<Chunk, FmlError> {
    let mut cursor = ByteCursor::new(bytes);
    let constant_count = cursor.read_u16()?;
    let raw = read_constant_pool(&mut cursor, constant_count)?;

    // Methods were each translated into their own local buffer by `read_constant_pool`. Append
    // every one into the chunk's shared bytecode buffer at a known base offset, then patch every
    // jump/branch operand (recorded local to its method) to an absolute, big-endian chunk
    // offset by resolving the label it names (also local to that same method).
    let mut bytecode: Vec<u8> = Vec::new();
    let mut method_spans: Vec<Option<(u32, u32)>> = vec![None; raw.len()];
    for (idx, constant) in raw.iter().enumerate() {
        if let RawConstant::Method(m) = constant {
            let base = bytecode.len() as u32;
            method_spans[idx] = Some((base, m.instructions.len() as u32));
            bytecode.extend_from_slice(&m.instructions);
            for (operand_offset, name_index) in &m.patch_sites {
                let target = *m.labels.get(name_index).ok_or_else(|| {
                    FmlError::Link(LinkError::UnresolvedLabel(format!("constant#{name_index}")))
                })?;
                let absolute = base + target;
                let be = absolute.to_be_bytes();
                let at = base as usize + operand_offset;
                bytecode[at] = be[1];
                bytecode[at + 1] = be[2];
                bytecode[at + 2] = be[3];
            }
        }
    }

    // Stage 1: integers, nulls, booleans, strings -- no dependencies.
    let mut resolved: Vec<Option<Value>> = vec![None; raw.len()];
    for (idx, constant) in raw.iter().enumerate() {
        resolved[idx] = match constant {
            RawConstant::Integer(v) => Some(Value::Integer(*v)),
            RawConstant::Null => Some(Value::Null),
            RawConstant::Boolean(v) => Some(Value::Boolean(*v)),
            RawConstant::String(bytes) => {
                let s = heap.alloc_string(bytes, &loader_roots(&resolved))?;
                Some(Value::Object(unsafe {
                    crate::object::AnyRef::new(s.as_header_ptr())
                }))
            }
            _ => None,
        };
    }

    // Stage 2: methods and slots -- depend on stage-1 strings for their names.
    for (idx, constant) in raw.iter().enumerate() {
        match constant {
            RawConstant::Method(m) => {
                let name = resolve_string(&resolved, m.name_index)?;
                let (entry, length) = method_spans[idx].expect("method span recorded above");
                let f = heap.alloc_function(
                    name,
                    m.arity,
                    m.locals,
                    entry,
                    length,
                    &loader_roots(&resolved),
                )?;
                resolved[idx] = Some(Value::Object(unsafe {
                    crate::object::AnyRef::new(f.as_header_ptr())
                }));
            }
            RawConstant::Slot { name_index } => {
                let name = resolve_string(&resolved, *name_index)?;
                let slot = heap.alloc_slot(name, &loader_roots(&resolved))?;
                resolved[idx] = Some(Value::Object(unsafe {
                    crate::object::AnyRef::new(slot.as_header_ptr())
                }));
            }
            _ => {}
        }
    }

    // Stage 3: classes -- depend on stage-2 methods/slots.
    let mut claimed: HashSet<u16> = HashSet::new();
    for (idx, constant) in raw.iter().enumerate() {
        if let RawConstant::Class { member_indices } = constant {
            let mut class = heap.alloc_class(&loader_roots(&resolved))?;
            for &member_index in member_indices {
                claimed.insert(member_index);
                let member = resolved[member_index as usize];
                match member {
                    Some(Value::Object(obj)) if obj.header().ty == crate::object::ObjType::Function => {
                        let f: ObjRef<crate::object::ObjFunction> =
                            unsafe { ObjRef::new(obj.as_header_ptr()) };
                        class.methods.insert(f.name, Value::Object(obj));
                    }
                    Some(Value::Object(obj)) if obj.header().ty == crate::object::ObjType::Slot => {
                        let s: ObjRef<crate::object::ObjSlot> =
                            unsafe { ObjRef::new(obj.as_header_ptr()) };
                        class.fields.push(s.name);
                    }
                    _ => return Err(FmlError::Decode(DecodeError::UnexpectedClassMember)),
                }
            }
            resolved[idx] = Some(Value::Object(unsafe {
                crate::object::AnyRef::new(class.as_header_ptr())
            }));
        }
    }

    // Explicit globals section: `globals_count` indices into the constant pool naming entries
    // that should be promoted. Cross-checked against, and unioned with, the set of free
    // (unclaimed) methods/slots -- see DESIGN.md's Open Question resolution.
    let globals_count = cursor.read_u16()?;
    let mut explicit_globals = Vec::with_capacity(globals_count as usize);
    for _ in 0..globals_count {
        explicit_globals.push(cursor.read_u16()?);
    }
    let mut promote: HashSet<u16> = explicit_globals.into_iter().collect();
    for (idx, constant) in raw.iter().enumerate() {
        let is_free = matches!(constant, RawConstant::Method(_) | RawConstant::Slot { .. })
            && !claimed.contains(&(idx as u16));
        if is_free {
            promote.insert(idx as u16);
        }
    }
    let mut global_names = Vec::new();
    for idx in promote {
        let Some(Value::Object(obj)) = resolved[idx as usize] else {
            continue;
        };
        let name = match obj.header().ty {
            crate::object::ObjType::Function => {
                let f: ObjRef<crate::object::ObjFunction> =
                    unsafe { ObjRef::new(obj.as_header_ptr()) };
                f.name
            }
            crate::object::ObjType::Slot => {
                let s: ObjRef<crate::object::ObjSlot> = unsafe { ObjRef::new(obj.as_header_ptr()) };
                s.name
            }
            _ => continue,
        };
        let value = if obj.header().ty == crate::object::ObjType::Function {
            Value::Object(obj)
        } else {
            Value::Null
        };
        globals.insert(name, value);
        global_names.push(name);
    }

    let entry_point_index = cursor.read_u16()?;
    let entry_point = match resolved.get(entry_point_index as usize) {
        Some(Some(Value::Object(obj))) if obj.header().ty == crate::object::ObjType::Function => {
            unsafe { ObjRef::new(obj.as_header_ptr()) }
        }
        _ => return Err(FmlError::Link(LinkError::EntryPointNotAMethod)),
    };

    let constants: Vec<Value> = resolved.into_iter().map(|v| v.unwrap_or(Value::Null)).collect();

    Ok(Chunk {
        bytecode,
        constants,
        global_names,
        entry_point,
    })
}

fn resolve_string(resolved: &[Option<Value>], index: u16) -> Result<ObjRef<ObjString>, FmlError> {
    match resolved.get(index as usize) {
        Some(Some(v)) => v
            .as_obj::<ObjString>()
            .ok_or(FmlError::Decode(DecodeError::UnexpectedClassMember)),
        _ => Err(FmlError::Decode(DecodeError::TruncatedFile)),
    }
}
