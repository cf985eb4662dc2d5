//! End-to-end interpreter scenarios: hand-assembled binary programs run through the real
//! loader and VM, asserting on stdout. Mirrors the six canonical programs worked through by
//! hand against `examples/original_source/src/vm.c`'s dispatch rules.

mod common;

use common::*;

use fml::hashmap::FmlMap;
use fml::heap::Heap;
use fml::loader;
use fml::vm::Vm;

fn run(bytes: &[u8]) -> String {
    let mut heap = Heap::new(4 * 1024 * 1024);
    let mut globals = FmlMap::new();
    let chunk = loader::load(bytes, &mut heap, &mut globals).expect("program should link");
    let stdout = SharedBuf::new();
    let mut vm = Vm::new(&chunk, heap, globals, Box::new(stdout.clone()));
    vm.run().expect("program should run to completion");
    stdout.contents()
}

#[test]
fn hello_world() {
    let mut p = Program::new();
    let greeting = p.string("Hello, world!\n");
    let name = p.string("main");
    let main = p.method(name, 0, 0, &[ins_literal(greeting), ins_print(greeting, 0), ins_return()]);
    p.set_entry_point(main);

    assert_eq!(run(&p.build()), "Hello, world!\n");
}

#[test]
fn arithmetic() {
    let mut p = Program::new();
    let plus = p.string("+");
    let name = p.string("main");
    let one = p.integer(1);
    let two = p.integer(2);
    let three = p.integer(3);
    let fmt = p.string("~");
    let main = p.method(
        name,
        0,
        0,
        &[
            ins_literal(one),
            ins_literal(two),
            ins_call_method(plus, 2),
            ins_literal(three),
            ins_call_method(plus, 2),
            ins_print(fmt, 1),
            ins_return(),
        ],
    );
    p.set_entry_point(main);

    assert_eq!(run(&p.build()), "6");
}

#[test]
fn while_loop() {
    let mut p = Program::new();
    let lt = p.string("<");
    let plus = p.string("+");
    let fmt = p.string("~\n");
    let bound = p.integer(5);
    let step = p.integer(1);
    let zero = p.integer(0);
    let name = p.string("main");

    const LOOP: u16 = 1;
    const BODY: u16 = 2;
    const END: u16 = 3;

    let main = p.method(
        name,
        0,
        1,
        &[
            ins_literal(zero),
            ins_set_local(0),
            ins_drop(),
            ins_label(LOOP),
            ins_get_local(0),
            ins_literal(bound),
            ins_call_method(lt, 2),
            ins_branch(BODY),
            ins_jump(END),
            ins_label(BODY),
            ins_get_local(0),
            ins_print(fmt, 1),
            ins_drop(),
            ins_get_local(0),
            ins_literal(step),
            ins_call_method(plus, 2),
            ins_set_local(0),
            ins_drop(),
            ins_jump(LOOP),
            ins_label(END),
            ins_literal(zero),
            ins_return(),
        ],
    );
    p.set_entry_point(main);

    assert_eq!(run(&p.build()), "0\n1\n2\n3\n4\n");
}

#[test]
fn array_get_set() {
    let mut p = Program::new();
    let set = p.string("set");
    let get = p.string("get");
    let size = p.integer(3);
    let zero = p.integer(0);
    let one = p.integer(1);
    let forty_two = p.integer(42);
    let fmt = p.string("~");
    let name = p.string("main");

    let main = p.method(
        name,
        0,
        1,
        &[
            ins_literal(size),
            ins_literal(zero),
            ins_array(),
            ins_set_local(0),
            ins_drop(),
            ins_get_local(0),
            ins_literal(one),
            ins_literal(forty_two),
            ins_call_method(set, 3),
            ins_drop(),
            ins_get_local(0),
            ins_literal(one),
            ins_call_method(get, 2),
            ins_print(fmt, 1),
            ins_drop(),
            ins_literal(zero),
            ins_return(),
        ],
    );
    p.set_entry_point(main);

    assert_eq!(run(&p.build()), "42");
}

#[test]
fn object_field_and_method() {
    let mut p = Program::new();
    let x_name = p.string("x");
    let x_slot = p.slot(x_name);
    let get_name = p.string("get");
    let get_method = p.method(get_name, 1, 1, &[ins_get_local(0), ins_get_field(x_name), ins_return()]);
    let class_c = p.class(&[x_slot, get_method]);
    let null_const = p.null();
    let seven = p.integer(7);
    let fmt = p.string("~");
    let main_name = p.string("main");

    let main = p.method(
        main_name,
        0,
        1,
        &[
            ins_literal(null_const),
            ins_literal(seven),
            ins_object(class_c),
            ins_set_local(0),
            ins_drop(),
            ins_get_local(0),
            ins_call_method(get_name, 1),
            ins_print(fmt, 1),
            ins_drop(),
            ins_literal(null_const),
            ins_return(),
        ],
    );
    p.set_entry_point(main);

    assert_eq!(run(&p.build()), "7");
}

#[test]
fn inheritance_walks_extends_chain() {
    let mut p = Program::new();
    let m_name = p.string("m");
    let one = p.integer(1);
    let method_m = p.method(m_name, 1, 1, &[ins_literal(one), ins_return()]);
    let class_b = p.class(&[method_m]);
    let class_d = p.class(&[]);
    let null_const = p.null();
    let fmt = p.string("~");
    let main_name = p.string("main");

    let main = p.method(
        main_name,
        0,
        2,
        &[
            ins_literal(null_const),
            ins_object(class_b),
            ins_set_local(0),
            ins_drop(),
            ins_get_local(0),
            ins_object(class_d),
            ins_set_local(1),
            ins_drop(),
            ins_get_local(1),
            ins_call_method(m_name, 1),
            ins_print(fmt, 1),
            ins_drop(),
            ins_literal(null_const),
            ins_return(),
        ],
    );
    p.set_entry_point(main);

    assert_eq!(run(&p.build()), "1");
}

#[test]
fn missing_global_is_a_link_error_not_a_panic() {
    let mut p = Program::new();
    let name = p.string("main");
    let undefined = p.string("does_not_exist");
    let main = p.method(name, 0, 0, &[ins_call_function(undefined, 0), ins_return()]);
    p.set_entry_point(main);

    let mut heap = Heap::new(1024 * 1024);
    let mut globals = FmlMap::new();
    let chunk = loader::load(&p.build(), &mut heap, &mut globals).expect("program should link");
    let stdout = SharedBuf::new();
    let mut vm = Vm::new(&chunk, heap, globals, Box::new(stdout));
    let err = vm.run().expect_err("undefined global must fail, not panic");
    assert_eq!(err.exit_code(), 39);
}
