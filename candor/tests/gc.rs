//! Collector tests driven from generated code: cooperative safepoints,
//! the explicit collection intrinsic, and survival of reachable data.
#![cfg(target_arch = "x86_64")]

use candor::{Candor, Value};

#[test]
fn strings_survive_collection_in_an_array() {
    // Small pages raise the needs-GC flag quickly, and the array literal in
    // the loop body provides a safepoint, so collections run mid-loop.
    let mut vm = Candor::new(1 << 14);
    let src = "keep = [] j = 0 k = 0 i = 0 \
               while (i < 2000) { \
                 t = [1, 2] \
                 s = \"aaaa\" + \"bbbb\" \
                 k = k + 1 \
                 if (k == 100) { keep[j] = s j = j + 1 k = 0 } \
                 i = i + 1 \
               } \
               __$gc() \
               return keep";
    let script = vm.compile(src).expect("compile failed");
    let keep = vm.run(&script);

    assert!(matches!(keep, Value::Array(_)));
    assert_eq!(vm.array_length(&keep), 20);
    for j in 0..20 {
        match vm.get_index(&keep, j) {
            Value::Str(s) => assert_eq!(s, "aaaabbbb"),
            other => panic!("element {} not a string after gc: {:?}", j, other),
        }
    }
}

#[test]
fn explicit_collection_preserves_locals() {
    let src = "f(x) { return x } a = f(41) __$gc() return a + 1";
    let mut vm = Candor::new(1 << 14);
    let script = vm.compile(src).unwrap();
    assert_eq!(vm.run(&script), Value::Int(42));
}

#[test]
fn closure_state_survives_collections() {
    let src = "f() { c = 0 return g() { c = c + 1 t = [1] __$gc() return c } } \
               h = f() h() h() return h()";
    let mut vm = Candor::new(1 << 14);
    let script = vm.compile(src).unwrap();
    assert_eq!(vm.run(&script), Value::Int(3));
}

#[test]
fn objects_and_maps_survive_collections() {
    let src = "o = { a: 1 } i = 0 \
               while (i < 200) { o[i] = i t = [i] i = i + 1 } \
               __$gc() \
               return o[150] + o.a";
    let mut vm = Candor::new(1 << 14);
    let script = vm.compile(src).unwrap();
    assert_eq!(vm.run(&script), Value::Int(151));
}

#[test]
fn collection_bounds_heap_growth() {
    // Generating garbage in a loop with safepoints keeps total page bytes
    // far below the sum of all allocations.
    let mut vm = Candor::new(1 << 14);
    let src = "i = 0 while (i < 5000) { t = [1, 2, 3] i = i + 1 } return i";
    let script = vm.compile(src).unwrap();
    assert_eq!(vm.run(&script), Value::Int(5000));

    // 5000 iterations allocate ~80 bytes of array + ~270 of map each; the
    // heap would exceed a megabyte without collection.
    assert!(vm.heap_size() < 1 << 20, "heap grew to {}", vm.heap_size());
}

#[test]
fn run_after_collection_reuses_roots() {
    let mut vm = Candor::new(1 << 14);
    let script = vm.compile("return \"interned\"").unwrap();
    assert_eq!(vm.run(&script), Value::Str("interned".into()));
    vm.collect_garbage();
    // The script's function object and root context moved; the persistent
    // reference keeps the handle current.
    assert_eq!(vm.run(&script), Value::Str("interned".into()));
}
