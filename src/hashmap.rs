//! Open-addressed hash map keyed by interned strings.
//!
//! Linear probing, djb2 hashing and tombstone handling follow `examples/original_source/src/hashmap.c`
//! exactly; the one deliberate deviation is the resize threshold (load factor 0.75 here versus
//! the original's 1.0), permitted by `SPEC_FULL.md`'s Open Question resolution and recorded in
//! `DESIGN.md`.

use crate::object::{ObjRef, ObjString, Value};

const INITIAL_CAPACITY: usize = 20;
const MAX_LOAD_FACTOR: f64 = 0.75;

#[derive(Clone, Copy)]
enum Slot {
    Empty,
    Tombstone,
    Occupied(ObjRef<ObjString>, Value),
}

pub struct FmlMap {
    entries: Vec<Slot>,
    count: usize,
}

impl FmlMap {
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: vec![Slot::Empty; 0],
            count: 0,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.count
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    fn keys_equal(a: &ObjString, b: &ObjString) -> bool {
        a.hash == b.hash && a.as_bytes() == b.as_bytes()
    }

    /// Finds the slot `key` occupies, or the first tombstone/empty slot on its probe sequence
    /// if absent. Mirrors `hashmap.c`'s `find_entry`.
    fn find(entries: &[Slot], key: &ObjString) -> usize {
        let capacity = entries.len();
        let mut index = key.hash as usize % capacity;
        let mut first_tombstone: Option<usize> = None;
        loop {
            match &entries[index] {
                Slot::Empty => return first_tombstone.unwrap_or(index),
                Slot::Tombstone => {
                    if first_tombstone.is_none() {
                        first_tombstone = Some(index);
                    }
                }
                Slot::Occupied(k, _) if Self::keys_equal(k, key) => return index,
                Slot::Occupied(_, _) => {}
            }
            index = (index + 1) % capacity;
        }
    }

    fn grow(&mut self) {
        let new_capacity = if self.entries.is_empty() {
            INITIAL_CAPACITY
        } else {
            self.entries.len() * 2
        };
        let mut new_entries = vec![Slot::Empty; new_capacity];
        let mut live = 0;
        for slot in &self.entries {
            if let Slot::Occupied(k, v) = slot {
                let index = Self::find(&new_entries, k);
                new_entries[index] = Slot::Occupied(*k, *v);
                live += 1;
            }
        }
        self.entries = new_entries;
        self.count = live;
    }

    pub fn insert(&mut self, key: ObjRef<ObjString>, value: Value) -> bool {
        if self.entries.is_empty()
            || (self.count + 1) as f64 > self.entries.len() as f64 * MAX_LOAD_FACTOR
        {
            self.grow();
        }
        let index = Self::find(&self.entries, &key);
        let is_new = !matches!(self.entries[index], Slot::Occupied(_, _));
        if is_new && !matches!(self.entries[index], Slot::Tombstone) {
            self.count += 1;
        }
        self.entries[index] = Slot::Occupied(key, value);
        is_new
    }

    #[must_use]
    pub fn get(&self, key: &ObjString) -> Option<Value> {
        if self.entries.is_empty() {
            return None;
        }
        match self.entries[Self::find(&self.entries, key)] {
            Slot::Occupied(_, v) => Some(v),
            _ => None,
        }
    }

    pub fn delete(&mut self, key: &ObjString) -> bool {
        if self.entries.is_empty() {
            return false;
        }
        let index = Self::find(&self.entries, key);
        if matches!(self.entries[index], Slot::Occupied(_, _)) {
            self.entries[index] = Slot::Tombstone;
            true
        } else {
            false
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (ObjRef<ObjString>, Value)> + '_ {
        self.entries.iter().filter_map(|slot| match slot {
            Slot::Occupied(k, v) => Some((*k, *v)),
            _ => None,
        })
    }
}

impl Default for FmlMap {
    fn default() -> Self {
        Self::new()
    }
}
