//! The GC-aware heap: owns the buddy allocator, the intrusive all-objects list, and the
//! mark-and-sweep collector itself.
//!
//! Grounded on `examples/original_source/src/memory.c` for the algorithm (`alloc_with_gc`,
//! `mark`/`trace_references`/`blacken_object`, `sweep`) and on
//! `examples/other_examples/..._ceronman-loxido__src-gc.rs.rs` for the Rust shape of the gray
//! worklist and `blacken` dispatch.

use std::mem::size_of;
use std::ptr::NonNull;

use crate::alloc::BuddyAllocator;
use crate::error::ExhaustionError;
use crate::object::{
    djb2_hash, AnyRef, GcObject, ObjArray, ObjClass, ObjFunction, ObjHeader, ObjInstance,
    ObjNative, ObjRef, ObjSlot, ObjString, ObjType, Value,
};

/// Implemented by whoever owns the live root set (the interpreter). The heap itself never holds
/// a reference to the operand stack, frames, globals or constant pool -- it is handed a `Roots`
/// implementation only at the moment a collection actually runs.
pub trait Roots {
    fn for_each_root(&self, f: &mut dyn FnMut(Value));
}

pub struct Heap {
    allocator: BuddyAllocator,
    head: Option<NonNull<ObjHeader>>,
    live_objects: usize,
    /// Forces a collection before every allocation; used only by test configuration to shake
    /// out use-after-sweep bugs.
    pub stress_gc: bool,
}

struct CollectionStats {
    freed: usize,
    live: usize,
}

impl Heap {
    #[must_use]
    pub fn new(arena_bytes: usize) -> Self {
        Self {
            allocator: BuddyAllocator::new(arena_bytes),
            head: None,
            live_objects: 0,
            stress_gc: false,
        }
    }

    pub fn set_heap_log(&mut self, sink: Box<dyn std::io::Write + Send>) {
        self.allocator.set_heap_log(sink);
    }

    #[must_use]
    pub fn live_objects(&self) -> usize {
        self.live_objects
    }

    fn raw_alloc<R: Roots>(&mut self, size: usize, roots: &R) -> Result<NonNull<u8>, ExhaustionError> {
        if self.stress_gc {
            self.collect(roots);
        }
        if let Some(ptr) = self.allocator.alloc(size) {
            return Ok(ptr);
        }
        let stats = self.collect(roots);
        log::debug!(
            "gc: reclaimed {} objects, {} live remain",
            stats.freed,
            stats.live
        );
        self.allocator
            .alloc(size)
            .ok_or(ExhaustionError::OutOfMemory)
    }

    fn link<T: GcObject>(&mut self, ptr: NonNull<u8>) -> ObjRef<T> {
        let header_ptr = ptr.cast::<ObjHeader>();
        unsafe {
            header_ptr.as_ptr().write(ObjHeader {
                ty: T::TYPE,
                marked: false,
                next: self.head,
            });
        }
        self.head = Some(header_ptr);
        self.live_objects += 1;
        unsafe { ObjRef::new(header_ptr) }
    }

    pub fn alloc_string<R: Roots>(
        &mut self,
        bytes: &[u8],
        roots: &R,
    ) -> Result<ObjRef<ObjString>, ExhaustionError> {
        let total = size_of::<ObjString>() + bytes.len();
        let ptr = self.raw_alloc(total, roots)?;
        let obj_ref: ObjRef<ObjString> = self.link(ptr);
        let raw = ptr.as_ptr().cast::<ObjString>();
        unsafe {
            std::ptr::addr_of_mut!((*raw).hash).write(djb2_hash(bytes));
            std::ptr::addr_of_mut!((*raw).len).write(bytes.len() as u32);
            let dest = ptr.as_ptr().add(size_of::<ObjString>());
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), dest, bytes.len());
        }
        Ok(obj_ref)
    }

    pub fn alloc_array<R: Roots>(
        &mut self,
        size: u32,
        initial: Value,
        roots: &R,
    ) -> Result<ObjRef<ObjArray>, ExhaustionError> {
        let total = size_of::<ObjArray>() + size as usize * size_of::<Value>();
        let ptr = self.raw_alloc(total, roots)?;
        let mut obj_ref: ObjRef<ObjArray> = self.link(ptr);
        let raw = ptr.as_ptr().cast::<ObjArray>();
        unsafe {
            std::ptr::addr_of_mut!((*raw).len).write(size);
        }
        for slot in obj_ref.as_slice_mut() {
            *slot = initial;
        }
        Ok(obj_ref)
    }

    pub fn alloc_function<R: Roots>(
        &mut self,
        name: ObjRef<ObjString>,
        arity: u8,
        locals: u16,
        entry: u32,
        length: u32,
        roots: &R,
    ) -> Result<ObjRef<ObjFunction>, ExhaustionError> {
        let ptr = self.raw_alloc(size_of::<ObjFunction>(), roots)?;
        let obj_ref: ObjRef<ObjFunction> = self.link(ptr);
        let raw = ptr.as_ptr().cast::<ObjFunction>();
        unsafe {
            std::ptr::addr_of_mut!((*raw).name).write(name);
            std::ptr::addr_of_mut!((*raw).arity).write(arity);
            std::ptr::addr_of_mut!((*raw).locals).write(locals);
            std::ptr::addr_of_mut!((*raw).entry).write(entry);
            std::ptr::addr_of_mut!((*raw).length).write(length);
        }
        Ok(obj_ref)
    }

    pub fn alloc_class<R: Roots>(
        &mut self,
        roots: &R,
    ) -> Result<ObjRef<ObjClass>, ExhaustionError> {
        let ptr = self.raw_alloc(size_of::<ObjClass>(), roots)?;
        let obj_ref: ObjRef<ObjClass> = self.link(ptr);
        let raw = ptr.as_ptr().cast::<ObjClass>();
        unsafe {
            std::ptr::addr_of_mut!((*raw).fields).write(Vec::new());
            std::ptr::addr_of_mut!((*raw).methods).write(crate::hashmap::FmlMap::new());
        }
        Ok(obj_ref)
    }

    pub fn alloc_instance<R: Roots>(
        &mut self,
        class: ObjRef<ObjClass>,
        extends: Value,
        roots: &R,
    ) -> Result<ObjRef<ObjInstance>, ExhaustionError> {
        let ptr = self.raw_alloc(size_of::<ObjInstance>(), roots)?;
        let obj_ref: ObjRef<ObjInstance> = self.link(ptr);
        let raw = ptr.as_ptr().cast::<ObjInstance>();
        unsafe {
            std::ptr::addr_of_mut!((*raw).class).write(class);
            std::ptr::addr_of_mut!((*raw).extends).write(extends);
            std::ptr::addr_of_mut!((*raw).fields).write(crate::hashmap::FmlMap::new());
        }
        Ok(obj_ref)
    }

    pub fn alloc_slot<R: Roots>(
        &mut self,
        name: ObjRef<ObjString>,
        roots: &R,
    ) -> Result<ObjRef<ObjSlot>, ExhaustionError> {
        let ptr = self.raw_alloc(size_of::<ObjSlot>(), roots)?;
        let obj_ref: ObjRef<ObjSlot> = self.link(ptr);
        let raw = ptr.as_ptr().cast::<ObjSlot>();
        unsafe {
            std::ptr::addr_of_mut!((*raw).name).write(name);
        }
        Ok(obj_ref)
    }

    pub fn alloc_native<R: Roots>(
        &mut self,
        name: ObjRef<ObjString>,
        arity: u8,
        func: crate::object::NativeFn,
        roots: &R,
    ) -> Result<ObjRef<ObjNative>, ExhaustionError> {
        let ptr = self.raw_alloc(size_of::<ObjNative>(), roots)?;
        let obj_ref: ObjRef<ObjNative> = self.link(ptr);
        let raw = ptr.as_ptr().cast::<ObjNative>();
        unsafe {
            std::ptr::addr_of_mut!((*raw).name).write(name);
            std::ptr::addr_of_mut!((*raw).arity).write(arity);
            std::ptr::addr_of_mut!((*raw).func).write(func);
        }
        Ok(obj_ref)
    }

    fn mark(&mut self, value: Value, gray: &mut Vec<NonNull<ObjHeader>>) {
        if let Value::Object(obj) = value {
            let mut header_ptr = obj.as_header_ptr();
            let header = unsafe { header_ptr.as_mut() };
            if !header.marked {
                header.marked = true;
                gray.push(header_ptr);
            }
        }
    }

    fn blacken(&mut self, header_ptr: NonNull<ObjHeader>, gray: &mut Vec<NonNull<ObjHeader>>) {
        let ty = unsafe { header_ptr.as_ref().ty };
        match ty {
            ObjType::String | ObjType::Slot | ObjType::Native | ObjType::Function => {}
            ObjType::Array => {
                let array = unsafe { header_ptr.cast::<ObjArray>().as_ref() };
                let values: Vec<Value> = array.as_slice().to_vec();
                for v in values {
                    self.mark(v, gray);
                }
            }
            ObjType::Class => {
                let class = unsafe { header_ptr.cast::<ObjClass>().as_ref() };
                let fields: Vec<_> = class.fields.clone();
                for f in fields {
                    self.mark(Value::Object(unsafe { AnyRef::new(f.as_header_ptr()) }), gray);
                }
                let methods: Vec<_> = class.methods.iter().collect();
                for (k, v) in methods {
                    self.mark(Value::Object(unsafe { AnyRef::new(k.as_header_ptr()) }), gray);
                    self.mark(v, gray);
                }
            }
            ObjType::Instance => {
                let instance = unsafe { header_ptr.cast::<ObjInstance>().as_ref() };
                self.mark(
                    Value::Object(unsafe { AnyRef::new(instance.class.as_header_ptr()) }),
                    gray,
                );
                self.mark(instance.extends, gray);
                let fields: Vec<_> = instance.fields.iter().collect();
                for (k, v) in fields {
                    self.mark(Value::Object(unsafe { AnyRef::new(k.as_header_ptr()) }), gray);
                    self.mark(v, gray);
                }
            }
        }
    }

    fn collect<R: Roots>(&mut self, roots: &R) -> CollectionStats {
        let mut gray: Vec<NonNull<ObjHeader>> = Vec::new();
        roots.for_each_root(&mut |v| self.mark(v, &mut gray));
        while let Some(header_ptr) = gray.pop() {
            self.blacken(header_ptr, &mut gray);
        }
        let freed = self.sweep();
        self.allocator.note_collection();
        CollectionStats {
            freed,
            live: self.live_objects,
        }
    }

    /// `ObjClass`/`ObjInstance` carry ordinary Rust collections (`Vec`, `FmlMap`) for their field
    /// lists and tables -- allocated through the system allocator, not the buddy arena (see
    /// `object.rs`). Those need their destructors run before the buddy block is recycled, or
    /// their backing storage leaks silently on every collection.
    ///
    /// # Safety
    /// `header_ptr` must point at a live, still-initialized object whose header `ty` is `ty`.
    unsafe fn drop_native_fields(header_ptr: NonNull<ObjHeader>, ty: ObjType) {
        match ty {
            ObjType::Class => std::ptr::drop_in_place(header_ptr.cast::<ObjClass>().as_ptr()),
            ObjType::Instance => std::ptr::drop_in_place(header_ptr.cast::<ObjInstance>().as_ptr()),
            ObjType::String
            | ObjType::Function
            | ObjType::Array
            | ObjType::Slot
            | ObjType::Native => {}
        }
    }

    fn sweep(&mut self) -> usize {
        let mut freed = 0;
        let mut previous: Option<NonNull<ObjHeader>> = None;
        let mut current = self.head;
        while let Some(mut header_ptr) = current {
            let header = unsafe { header_ptr.as_mut() };
            let next = header.next;
            if header.marked {
                header.marked = false;
                previous = Some(header_ptr);
            } else {
                match previous {
                    Some(mut prev) => unsafe { prev.as_mut().next = next },
                    None => self.head = next,
                }
                let ty = header.ty;
                unsafe { Self::drop_native_fields(header_ptr, ty) };
                let payload = unsafe { NonNull::new_unchecked(header_ptr.as_ptr().cast::<u8>()) };
                self.allocator.free(payload);
                self.live_objects -= 1;
                freed += 1;
            }
            current = next;
        }
        freed
    }
}
