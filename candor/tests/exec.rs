//! End-to-end tests: source through the resolver and code generator,
//! executed natively. x86-64 only, like the generated code.
#![cfg(target_arch = "x86_64")]

use candor::rt::heap::{tag_int, untag_int, Heap};
use candor::rt::value::{HMap, HObject};
use candor::{Candor, Value};

fn vm() -> Candor {
    Candor::new(1 << 20)
}

fn run_in(vm: &mut Candor, src: &str) -> Value {
    let script = vm.compile(src).expect("compile failed");
    vm.run(&script)
}

fn run(src: &str) -> Value {
    run_in(&mut vm(), src)
}

// -- literals --

#[test]
fn integer_literals_round_trip() {
    for value in [
        0i64,
        1,
        -1,
        7,
        42,
        -12345,
        1 << 40,
        (1 << 62) - 1,
        -(1 << 62),
    ] {
        assert_eq!(run(&format!("return {}", value)), Value::Int(value));
    }
}

#[test]
fn double_literals_are_bit_identical() {
    match run("return 3.25") {
        Value::Double(d) => assert_eq!(d.to_bits(), 3.25f64.to_bits()),
        other => panic!("expected double, got {:?}", other),
    }
    assert_eq!(run("return 0.5"), Value::Double(0.5));
}

#[test]
fn string_literals_unescape_once() {
    assert_eq!(run("return \"hello\""), Value::Str("hello".into()));
    assert_eq!(run("return \"a\\nb\""), Value::Str("a\nb".into()));
}

#[test]
fn nil_true_false() {
    assert_eq!(run("return nil"), Value::Nil);
    assert_eq!(run("return true"), Value::Bool(true));
    assert_eq!(run("return false"), Value::Bool(false));
    assert_eq!(run(""), Value::Nil);
}

// -- arithmetic --

#[test]
fn arithmetic_and_precedence() {
    assert_eq!(run("return 1 + 2 * 3"), Value::Int(7));
    assert_eq!(run("return (1 + 2) * 3"), Value::Int(9));
    assert_eq!(run("return 10 - 4 - 3"), Value::Int(3));
    assert_eq!(run("return 8 / 2"), Value::Int(4));
    assert_eq!(run("return 7 / 2"), Value::Double(3.5));
}

#[test]
fn add_fast_path_overflow_falls_back() {
    let max = (1i64 << 62) - 1;
    let src = format!("x = {} return x + 1", max);
    match run(&src) {
        Value::Double(d) => assert_eq!(d, max as f64 + 1.0),
        other => panic!("expected boxed double after overflow, got {:?}", other),
    }
}

#[test]
fn string_concatenation() {
    assert_eq!(run("return \"foo\" + \"bar\""), Value::Str("foobar".into()));
}

#[test]
fn bitwise_operators() {
    assert_eq!(run("return 6 & 3"), Value::Int(2));
    assert_eq!(run("return 6 | 3"), Value::Int(7));
    assert_eq!(run("return 6 ^ 3"), Value::Int(5));
}

#[test]
fn comparisons() {
    assert_eq!(run("return 1 < 2"), Value::Bool(true));
    assert_eq!(run("return 2 <= 2"), Value::Bool(true));
    assert_eq!(run("return 3 > 4"), Value::Bool(false));
    assert_eq!(run("return \"a\" < \"b\""), Value::Bool(true));
}

#[test]
fn equality_loose_and_strict() {
    assert_eq!(run("return 1 == 1.0"), Value::Bool(true));
    assert_eq!(run("return 1 === 1.0"), Value::Bool(false));
    assert_eq!(run("return 1 !== 1.0"), Value::Bool(true));
    assert_eq!(run("return \"x\" == \"x\""), Value::Bool(true));
    assert_eq!(run("return nil == nil"), Value::Bool(true));
    assert_eq!(run("return nil == 0"), Value::Bool(false));
}

#[test]
fn logical_operators_select_operands() {
    assert_eq!(run("return 1 && 2"), Value::Int(2));
    assert_eq!(run("return nil && 2"), Value::Nil);
    assert_eq!(run("return nil || 5"), Value::Int(5));
    assert_eq!(run("return 3 || 5"), Value::Int(3));
}

#[test]
fn unary_operators() {
    assert_eq!(run("x = 5 return -x"), Value::Int(-5));
    assert_eq!(run("x = 5 return +x"), Value::Int(5));
    assert_eq!(run("return !nil"), Value::Bool(true));
    assert_eq!(run("return !3"), Value::Bool(false));
}

#[test]
fn increments_and_decrements() {
    assert_eq!(run("x = 5 x++ return x"), Value::Int(6));
    assert_eq!(run("x = 5 return x++"), Value::Int(5));
    assert_eq!(run("x = 5 return ++x"), Value::Int(6));
    assert_eq!(run("x = 5 x-- return x"), Value::Int(4));
    assert_eq!(run("x = 5 return --x"), Value::Int(4));
}

// -- control flow --

#[test]
fn if_else_branches() {
    assert_eq!(run("if (2 > 1) { return 1 } return 2"), Value::Int(1));
    assert_eq!(run("if (1 > 2) { return 1 } else { return 2 }"), Value::Int(2));
    assert_eq!(
        run("x = 3 if (x == 1) { return 1 } else if (x == 3) { return 3 } return 0"),
        Value::Int(3)
    );
}

#[test]
fn while_loops_accumulate() {
    assert_eq!(
        run("i = 0 s = 0 while (i < 10) { s = s + i i = i + 1 } return s"),
        Value::Int(45)
    );
}

#[test]
fn break_and_continue() {
    let src = "i = 0 s = 0 \
               while (true) { \
                 i = i + 1 \
                 if (i == 3) { continue } \
                 if (i > 5) { break } \
                 s = s + i \
               } \
               return s";
    assert_eq!(run(src), Value::Int(12));
}

// -- functions and closures --

#[test]
fn identity_function() {
    let mut vm = vm();
    assert_eq!(run_in(&mut vm, "f(x) { return x } return f(7)"), Value::Int(7));

    // A collection in steady state does not grow the heap.
    vm.collect_garbage();
    let settled = vm.heap_size();
    vm.collect_garbage();
    assert_eq!(vm.heap_size(), settled);
}

#[test]
fn closure_counter_reaches_three() {
    let src = "f() { c = 0 return g() { c = c + 1 return c } } \
               h = f() h() h() return h()";
    assert_eq!(run(src), Value::Int(3));
}

#[test]
fn closures_capture_across_two_boundaries() {
    let src = "f() { c = 10 return g() { return h() { c = c + 1 return c } } } \
               k = f()() return k()";
    assert_eq!(run(src), Value::Int(11));
}

#[test]
fn anonymous_functions_are_values() {
    assert_eq!(run("h = (x) { return x + 1 } return h(41)"), Value::Int(42));
}

#[test]
fn missing_arguments_are_nil() {
    assert_eq!(run("f(a, b) { return b } return f(1)"), Value::Nil);
    assert_eq!(run("f(a, b) { return a } return f(1)"), Value::Int(1));
}

#[test]
fn calling_a_non_function_yields_nil() {
    assert_eq!(run("x = 5 return x()"), Value::Nil);
    assert_eq!(run("return missing()"), Value::Nil);
}

#[test]
fn functions_return_nil_without_return() {
    assert_eq!(run("f() { x = 1 } return f()"), Value::Nil);
}

// -- objects and arrays --

#[test]
fn object_literal_and_member_sum() {
    let mut vm = vm();
    let script = vm.compile("o = { a: 1, b: 2 } return o.a + o.b").unwrap();
    assert_eq!(vm.run(&script), Value::Int(3));

    // The literal's map capacity is the smallest power of two >= 2n.
    let script = vm.compile("return { a: 1, b: 2 }").unwrap();
    match vm.run(&script) {
        Value::Object(handle) => {
            assert_eq!(HMap::size(HObject::map(handle.raw())), 4);
        }
        other => panic!("expected object, got {:?}", other),
    }
}

#[test]
fn member_assignment_and_lookup() {
    assert_eq!(run("o = {} o.x = 42 return o.x"), Value::Int(42));
    assert_eq!(run("o = {} o[\"k\"] = 1 return o.k"), Value::Int(1));
    assert_eq!(run("o = { a: 1 } return o.missing"), Value::Nil);
    assert_eq!(run("o = { 1: 11 } return o[1]"), Value::Int(11));
}

#[test]
fn nested_object_literals() {
    assert_eq!(run("o = { a: { b: 2 } } return o.a.b"), Value::Int(2));
}

#[test]
fn member_on_nil_is_graceful() {
    assert_eq!(run("return missing.x"), Value::Nil);
    assert_eq!(run("missing.x = 1 return 2"), Value::Int(2));
}

#[test]
fn array_literals_and_length() {
    let mut vm = vm();
    let script = vm.compile("return [5, 6, 7]").unwrap();
    let result = vm.run(&script);
    match &result {
        Value::Array(_) => {}
        other => panic!("expected array, got {:?}", other),
    }
    assert_eq!(vm.array_length(&result), 3);
    assert_eq!(vm.get_index(&result, 0), Value::Int(5));
    assert_eq!(vm.get_index(&result, 2), Value::Int(7));
}

#[test]
fn array_length_shrinks_over_trailing_nils() {
    assert_eq!(run("a = [1, 2, 3] a[2] = nil return sizeof a"), Value::Int(2));
    assert_eq!(run("a = [] a[5] = 1 return sizeof a"), Value::Int(6));
}

#[test]
fn object_growth_preserves_entries() {
    let src = "o = {} i = 0 while (i < 40) { o[i] = i * 2 i = i + 1 } return o[33]";
    assert_eq!(run(src), Value::Int(66));
}

// -- typeof / sizeof / keysof / new --

#[test]
fn typeof_returns_type_strings() {
    assert_eq!(run("return typeof 1"), Value::Str("number".into()));
    assert_eq!(run("return typeof 1.5"), Value::Str("number".into()));
    assert_eq!(run("return typeof \"s\""), Value::Str("string".into()));
    assert_eq!(run("return typeof nil"), Value::Str("nil".into()));
    assert_eq!(run("return typeof true"), Value::Str("boolean".into()));
    assert_eq!(run("return typeof {}"), Value::Str("object".into()));
    assert_eq!(run("return typeof []"), Value::Str("array".into()));
    assert_eq!(run("f() { return 1 } return typeof f"), Value::Str("function".into()));
}

#[test]
fn type_name_identifiers_resolve_to_root_strings() {
    assert_eq!(run("return typeof 1 == number"), Value::Bool(true));
    assert_eq!(run("return typeof \"x\" == string"), Value::Bool(true));
}

#[test]
fn sizeof_rules() {
    assert_eq!(run("return sizeof \"four\""), Value::Int(4));
    assert_eq!(run("return sizeof [1, 2]"), Value::Int(2));
    assert_eq!(run("return sizeof nil"), Value::Int(0));
    assert_eq!(run("return sizeof 9"), Value::Int(0));
}

#[test]
fn keysof_walks_the_map() {
    let mut vm = vm();
    let script = vm
        .compile("o = { a: 1 } o[7] = 2 return keysof o")
        .unwrap();
    let keys = vm.run(&script);
    assert_eq!(vm.array_length(&keys), 2);
    let first = vm.get_index(&keys, 0);
    let second = vm.get_index(&keys, 1);
    let mut found = vec![first, second];
    found.sort_by_key(|v| matches!(v, Value::Int(_)));
    assert!(matches!(found[0], Value::Str(ref s) if s == "a"));
    assert_eq!(found[1], Value::Int(7));
}

#[test]
fn new_clones_the_prototype() {
    let src = "proto = { x: 1 } o = new proto o.x = 2 return proto.x + o.x";
    assert_eq!(run(src), Value::Int(3));
}

// -- globals and bindings --

#[test]
fn free_names_read_the_global_object() {
    assert_eq!(run("return undeclared_global"), Value::Nil);
}

extern "C" fn native_sum(_heap: *mut Heap, argc: u64, argv: *const u64) -> u64 {
    let mut total = 0i64;
    for i in 0..argc as usize {
        total += untag_int(unsafe { *argv.add(i) });
    }
    tag_int(total)
}

extern "C" fn native_first(_heap: *mut Heap, argc: u64, argv: *const u64) -> u64 {
    if argc == 0 {
        return 0;
    }
    unsafe { *argv }
}

#[test]
fn bindings_are_callable_through_the_global_object() {
    let mut vm = vm();
    vm.bind("sum", native_sum);
    assert_eq!(run_in(&mut vm, "return sum(1, 2, 3)"), Value::Int(6));
    assert_eq!(run_in(&mut vm, "return sum()"), Value::Int(0));
}

#[test]
fn binding_arguments_arrive_in_order() {
    let mut vm = vm();
    vm.bind("first", native_first);
    assert_eq!(run_in(&mut vm, "return first(10, 20, 30)"), Value::Int(10));
}

// -- compile-time errors --

#[test]
fn loop_control_outside_a_loop_is_a_compile_error() {
    let mut vm = vm();
    let err = vm.compile("break").unwrap_err();
    assert_eq!(err[0].code, "GEN_003");
    let err = vm.compile("continue").unwrap_err();
    assert_eq!(err[0].code, "GEN_003");
}

#[test]
fn incorrect_lhs_is_a_compile_error() {
    let mut vm = vm();
    let err = vm.compile("1 = 2").unwrap_err();
    assert_eq!(err[0].code, "GEN_001");
    let err = vm.compile("global = 1").unwrap_err();
    assert_eq!(err[0].code, "GEN_001");
}

// -- scope declarations --

#[test]
fn scope_declaration_keeps_locals_local() {
    let src = "c = 1 f() { scope c c = 2 return c } f() return c";
    assert_eq!(run(src), Value::Int(1));
}
