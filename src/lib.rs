//! Interpreter for compiled FML bytecode programs.
//!
//! Organized bottom-up: [`alloc`] is the buddy allocator backing every managed allocation,
//! [`heap`] layers GC tracing and object construction on top of it, [`object`] and [`hashmap`]
//! are the value/object model and the map that backs globals, fields and methods, [`loader`]
//! turns a binary file into a linked [`chunk::Chunk`], and [`vm`] executes it.

pub mod alloc;
pub mod chunk;
pub mod cli;
pub mod error;
pub mod hashmap;
pub mod heap;
pub mod loader;
pub mod object;
pub mod opcode;
pub mod vm;
