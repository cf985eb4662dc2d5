//! `FmlMap` behavior, ported from `examples/original_source/tests/hashmap_test.c`'s
//! `basicTest`/`reallocationTest`: insert/fetch/delete/tombstone-reuse, and a larger stress run
//! cross-checked against `std::collections::HashMap`.

mod common;

use std::collections::HashMap as StdMap;

use fml::hashmap::FmlMap;
use fml::heap::{Heap, Roots};
use fml::object::{ObjRef, ObjString, Value};

struct NoRoots;
impl Roots for NoRoots {
    fn for_each_root(&self, _f: &mut dyn FnMut(Value)) {}
}

fn intern(heap: &mut Heap, s: &str) -> ObjRef<ObjString> {
    heap.alloc_string(s.as_bytes(), &NoRoots).expect("arena large enough for test strings")
}

#[test]
fn insert_then_fetch() {
    let mut heap = Heap::new(1024 * 1024);
    let mut map = FmlMap::new();
    let key = intern(&mut heap, "answer");
    map.insert(key, Value::Integer(42));
    assert_eq!(map.get(&key), Some(Value::Integer(42)));
}

#[test]
fn insert_overwrites_existing_key() {
    let mut heap = Heap::new(1024 * 1024);
    let mut map = FmlMap::new();
    let key = intern(&mut heap, "x");
    map.insert(key, Value::Integer(1));
    let is_new = map.insert(key, Value::Integer(2));
    assert!(!is_new);
    assert_eq!(map.get(&key), Some(Value::Integer(2)));
    assert_eq!(map.len(), 1);
}

#[test]
fn distinct_string_objects_with_equal_bytes_collide() {
    // The loader routinely interns the same field/method name more than once across a
    // program; lookups must key on byte content, not on object identity.
    let mut heap = Heap::new(1024 * 1024);
    let mut map = FmlMap::new();
    let key_a = intern(&mut heap, "shared");
    let key_b = intern(&mut heap, "shared");
    assert_ne!(key_a.as_header_ptr(), key_b.as_header_ptr());

    map.insert(key_a, Value::Integer(7));
    assert_eq!(map.get(&key_b), Some(Value::Integer(7)));
}

#[test]
fn delete_then_fetch_misses_and_reuses_tombstone() {
    let mut heap = Heap::new(1024 * 1024);
    let mut map = FmlMap::new();
    let key = intern(&mut heap, "gone");
    map.insert(key, Value::Integer(1));
    assert!(map.delete(&key));
    assert_eq!(map.get(&key), None);
    assert_eq!(map.len(), 0);

    let is_new = map.insert(key, Value::Integer(2));
    assert!(is_new);
    assert_eq!(map.get(&key), Some(Value::Integer(2)));
}

#[test]
fn delete_of_absent_key_is_a_no_op() {
    let mut heap = Heap::new(1024 * 1024);
    let mut map = FmlMap::new();
    let key = intern(&mut heap, "absent");
    assert!(!map.delete(&key));
}

#[test]
fn stress_matches_reference_map_across_resizes() {
    let mut heap = Heap::new(4 * 1024 * 1024);
    let mut map = FmlMap::new();
    let mut reference: StdMap<String, i32> = StdMap::new();
    let mut keys: Vec<(String, ObjRef<ObjString>)> = Vec::new();

    for i in 0..2000i32 {
        let name = format!("key{i}");
        let key = intern(&mut heap, &name);
        keys.push((name.clone(), key));
        map.insert(key, Value::Integer(i));
        reference.insert(name, i);

        if i % 3 == 0 {
            // delete a handful of earlier entries to exercise tombstones across a grow
            if let Some((old_name, old_key)) = keys.get((i / 3) as usize).cloned() {
                map.delete(&old_key);
                reference.remove(&old_name);
            }
        }
    }

    assert_eq!(map.len(), reference.len());
    for (name, key) in &keys {
        let expected = reference.get(name).copied();
        let actual = map.get(key).map(|v| match v {
            Value::Integer(n) => n,
            _ => unreachable!("only integers were ever inserted"),
        });
        assert_eq!(actual, expected, "mismatch for key {name}");
    }
}
