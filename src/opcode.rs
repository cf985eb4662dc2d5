//! Bytecode opcodes, matching the byte values in `examples/original_source/include/bytecode.h`.
//!
//! `#[repr(u8)]` + `num_enum::TryFromPrimitive` is the teacher's own idiom for tag enums
//! (`src/ir/codes.rs`, `src/schema/enums.rs`); kept here unchanged.

use num_enum::TryFromPrimitive;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
pub enum Opcode {
    Label = 0x00,
    Literal = 0x01,
    Print = 0x02,
    Array = 0x03,
    Object = 0x04,
    GetField = 0x05,
    SetField = 0x06,
    CallMethod = 0x07,
    CallFunction = 0x08,
    SetLocal = 0x09,
    GetLocal = 0x0A,
    SetGlobal = 0x0B,
    GetGlobal = 0x0C,
    Branch = 0x0D,
    Jump = 0x0E,
    Return = 0x0F,
    Drop = 0x10,
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
pub enum ConstantTag {
    Integer = 0x00,
    Null = 0x01,
    String = 0x02,
    Method = 0x03,
    Slot = 0x04,
    Class = 0x05,
    Boolean = 0x06,
}
