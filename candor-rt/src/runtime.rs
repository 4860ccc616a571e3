//! Runtime helper functions callable from generated code.
//!
//! Each `extern "C"` function here backs exactly one precompiled stub. The
//! stub owns the register choreography (saving the caller-visible set,
//! stack alignment) and passes the heap pointer as a baked-in first
//! argument, so these helpers stay ordinary Rust with explicit state.
//!
//! Helpers may allocate — which can raise the needs-GC flag — but never
//! collect; collection only happens at the generated code's safepoints.

use crate::gc;
use crate::heap::{is_unboxed, tag_int, untag_int, Header, Heap, HeapTag, Tenure, NIL};
use crate::value::{
    root_index, HArray, HBoolean, HCData, HContext, HMap, HNumber, HObject, HString, HValue,
};

/// Signature of an embedder-provided native binding. Arguments are pushed
/// right-to-left, so `argv[0]` is the first argument and `argv[argc - 1]`
/// the last.
pub type NativeFn = extern "C" fn(heap: *mut Heap, argc: u64, argv: *const u64) -> u64;

// ---------------------------------------------------------------------------
// Allocation and collection
// ---------------------------------------------------------------------------

/// Backs the Allocate stub. `tag_word` and `size_word` are tagged integers;
/// the size already includes the 8-byte header.
pub extern "C" fn rt_allocate(heap: *mut Heap, tag_word: u64, size_word: u64) -> u64 {
    let heap = unsafe { &mut *heap };
    let tag = match HeapTag::from_byte(untag_int(tag_word) as u8) {
        Some(tag) => tag,
        None => return NIL,
    };
    let total = untag_int(size_word) as u32;
    let addr = heap.allocate_raw(Tenure::New, total);
    unsafe {
        Header::Live {
            tag,
            generation: 0,
        }
        .write(addr)
    };
    addr
}

/// Backs the CollectGarbage stub. `stack_top` is the stub's `rsp` after it
/// saved every general register, so register values are part of the scanned
/// range and are reloaded after this returns.
pub extern "C" fn rt_collect_garbage(heap: *mut Heap, stack_top: u64) -> u64 {
    let heap = unsafe { &mut *heap };
    gc::collect(heap, stack_top);
    NIL
}

// ---------------------------------------------------------------------------
// Property lookup
// ---------------------------------------------------------------------------

/// Backs the LookupProperty stub: byte offset of the value slot relative to
/// the object's map, or 0 on a miss without insert.
pub extern "C" fn rt_lookup_property(heap: *mut Heap, obj: u64, key: u64, insert: u64) -> u64 {
    let heap = unsafe { &mut *heap };
    HObject::lookup_property(Some(heap), obj, key, insert != 0)
}

// ---------------------------------------------------------------------------
// Coercions and type queries
// ---------------------------------------------------------------------------

fn is_truthy(value: u64) -> bool {
    if value == NIL {
        return false;
    }
    if is_unboxed(value) {
        return untag_int(value) != 0;
    }
    match HValue::tag_of(value) {
        HeapTag::Number => {
            let d = HNumber::double_value(value);
            d != 0.0 && !d.is_nan()
        }
        HeapTag::Boolean => HBoolean::value(value),
        HeapTag::String => HString::length(value) != 0,
        _ => true,
    }
}

fn root_bool(root: u64, value: bool) -> u64 {
    let index = if value {
        root_index::TRUE
    } else {
        root_index::FALSE
    };
    HContext::get_slot(root, index)
}

/// Backs the CoerceToBoolean stub: language truthiness, returning one of the
/// root context's interned boolean objects.
pub extern "C" fn rt_coerce_to_boolean(_heap: *mut Heap, root: u64, value: u64) -> u64 {
    root_bool(root, is_truthy(value))
}

/// Backs the Typeof stub: one of the nine cached type-name strings held in
/// the root context.
pub extern "C" fn rt_typeof(_heap: *mut Heap, root: u64, value: u64) -> u64 {
    let index = match HValue::tag_of(value) {
        HeapTag::Nil => 0,
        HeapTag::Function => 1,
        HeapTag::Context => 2,
        HeapTag::Number => 3,
        HeapTag::String => 4,
        HeapTag::Boolean => 5,
        HeapTag::Object | HeapTag::Map => 6,
        HeapTag::Array => 7,
        HeapTag::CData | HeapTag::Code => 8,
    };
    HContext::get_slot(root, root_index::TYPE_NAMES + index)
}

/// Backs the Sizeof stub: element count for arrays (shrinking trailing
/// nils), byte length for strings and cdata, 0 for everything else.
pub extern "C" fn rt_sizeof(_heap: *mut Heap, value: u64) -> u64 {
    let size = match HValue::tag_of(value) {
        HeapTag::Array => HArray::length(value, true),
        HeapTag::String => HString::length(value) as i64,
        HeapTag::CData => HCData::size(value) as i64,
        _ => 0,
    };
    tag_int(size)
}

/// Backs the Keysof stub: a fresh array of the keys that currently map to a
/// non-nil value. Non-objects yield nil.
pub extern "C" fn rt_keysof(heap: *mut Heap, value: u64) -> u64 {
    let heap = unsafe { &mut *heap };
    let tag = HValue::tag_of(value);
    if tag != HeapTag::Object && tag != HeapTag::Array {
        return NIL;
    }

    let map = HObject::map(value);
    let capacity = HMap::size(map) as u32;
    let mut keys = Vec::new();
    for i in 0..capacity {
        let key = HMap::get_key(map, i);
        if key != NIL && HMap::get_value(map, capacity, i) != NIL {
            keys.push(key);
        }
    }

    let result = HArray::with_capacity(
        heap,
        crate::utils::power_of_two(2 * keys.len().max(1) as u32),
    );
    for (i, key) in keys.into_iter().enumerate() {
        let offset = HObject::lookup_property(Some(heap), result, tag_int(i as i64), true);
        unsafe { crate::value::write_word(HObject::map(result), offset, key) };
    }
    result
}

/// Backs the CloneObject stub (the `new` operator): a shallow copy of the
/// prototype's map; non-object prototypes produce an empty object.
pub extern "C" fn rt_clone_object(heap: *mut Heap, value: u64) -> u64 {
    let heap = unsafe { &mut *heap };
    match HValue::tag_of(value) {
        HeapTag::Object | HeapTag::Array => {
            let tag = HValue::tag_of(value);
            let capacity = HMap::size(HObject::map(value)) as u32;
            let clone = if tag == HeapTag::Array {
                HArray::with_capacity(heap, capacity)
            } else {
                HObject::with_capacity(heap, capacity)
            };
            unsafe {
                std::ptr::copy_nonoverlapping(
                    (HObject::map(value) + HMap::SPACE_OFFSET) as *const u8,
                    (HObject::map(clone) + HMap::SPACE_OFFSET) as *mut u8,
                    capacity as usize * 16,
                );
                if tag == HeapTag::Array {
                    crate::value::write_word(
                        clone,
                        HArray::LENGTH_OFFSET,
                        crate::value::read_word(value, HArray::LENGTH_OFFSET),
                    );
                }
            }
            clone
        }
        _ => HObject::new_empty(heap),
    }
}

// ---------------------------------------------------------------------------
// Binary operators
// ---------------------------------------------------------------------------

/// Operator kinds with a stub each. The order is ABI between the stub table
/// and the code generator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    BAnd,
    BOr,
    BXor,
    Eq,
    StrictEq,
    Ne,
    StrictNe,
    Lt,
    Gt,
    Le,
    Ge,
    LOr,
    LAnd,
}

pub const BINARY_OPS: [BinaryOp; 17] = [
    BinaryOp::Add,
    BinaryOp::Sub,
    BinaryOp::Mul,
    BinaryOp::Div,
    BinaryOp::BAnd,
    BinaryOp::BOr,
    BinaryOp::BXor,
    BinaryOp::Eq,
    BinaryOp::StrictEq,
    BinaryOp::Ne,
    BinaryOp::StrictNe,
    BinaryOp::Lt,
    BinaryOp::Gt,
    BinaryOp::Le,
    BinaryOp::Ge,
    BinaryOp::LOr,
    BinaryOp::LAnd,
];

/// The helper a given operator's stub calls.
pub fn binary_helper(op: BinaryOp) -> u64 {
    let f: extern "C" fn(*mut Heap, u64, u64, u64) -> u64 = match op {
        BinaryOp::Add => rt_binary_add,
        BinaryOp::Sub => rt_binary_sub,
        BinaryOp::Mul => rt_binary_mul,
        BinaryOp::Div => rt_binary_div,
        BinaryOp::BAnd => rt_binary_band,
        BinaryOp::BOr => rt_binary_bor,
        BinaryOp::BXor => rt_binary_bxor,
        BinaryOp::Eq => rt_binary_eq,
        BinaryOp::StrictEq => rt_binary_strict_eq,
        BinaryOp::Ne => rt_binary_ne,
        BinaryOp::StrictNe => rt_binary_strict_ne,
        BinaryOp::Lt => rt_binary_lt,
        BinaryOp::Gt => rt_binary_gt,
        BinaryOp::Le => rt_binary_le,
        BinaryOp::Ge => rt_binary_ge,
        BinaryOp::LOr => rt_binary_lor,
        BinaryOp::LAnd => rt_binary_land,
    };
    f as u64
}

/// Numeric view used by the arithmetic coercions.
#[derive(Clone, Copy)]
enum Num {
    Int(i64),
    Dbl(f64),
}

impl Num {
    fn as_f64(self) -> f64 {
        match self {
            Num::Int(i) => i as f64,
            Num::Dbl(d) => d,
        }
    }

    fn as_i64(self) -> i64 {
        match self {
            Num::Int(i) => i,
            Num::Dbl(d) => d as i64,
        }
    }
}

fn to_num(value: u64) -> Num {
    if value == NIL {
        return Num::Int(0);
    }
    if is_unboxed(value) {
        return Num::Int(untag_int(value));
    }
    match HValue::tag_of(value) {
        HeapTag::Number => Num::Dbl(HNumber::double_value(value)),
        HeapTag::Boolean => Num::Int(HBoolean::value(value) as i64),
        HeapTag::String => {
            let text = String::from_utf8_lossy(HString::bytes(value));
            let text = text.trim();
            if let Ok(i) = text.parse::<i64>() {
                Num::Int(i)
            } else if let Ok(d) = text.parse::<f64>() {
                Num::Dbl(d)
            } else {
                Num::Int(0)
            }
        }
        _ => Num::Int(0),
    }
}

/// Tag an integer result, spilling to a boxed double when it does not fit
/// the 63-bit payload.
fn make_int(heap: &mut Heap, value: i64) -> u64 {
    if value.wrapping_shl(1) >> 1 == value {
        tag_int(value)
    } else {
        HNumber::new_double(heap, Tenure::New, value as f64)
    }
}

fn make_num(heap: &mut Heap, num: Num) -> u64 {
    match num {
        Num::Int(i) => make_int(heap, i),
        Num::Dbl(d) => HNumber::new_double(heap, Tenure::New, d),
    }
}

fn is_string(value: u64) -> bool {
    crate::heap::is_heap_ref(value) && HValue::tag_of(value) == HeapTag::String
}

fn arith(heap: &mut Heap, op: BinaryOp, lhs: u64, rhs: u64) -> u64 {
    if op == BinaryOp::Add && is_string(lhs) && is_string(rhs) {
        let mut bytes = HString::bytes(lhs).to_vec();
        bytes.extend_from_slice(HString::bytes(rhs));
        return HString::new(heap, Tenure::New, &bytes);
    }

    let (a, b) = (to_num(lhs), to_num(rhs));
    let result = match (a, b) {
        (Num::Int(x), Num::Int(y)) => match op {
            BinaryOp::Add => x.checked_add(y).map(Num::Int),
            BinaryOp::Sub => x.checked_sub(y).map(Num::Int),
            BinaryOp::Mul => x.checked_mul(y).map(Num::Int),
            BinaryOp::Div => {
                if y != 0 && x % y == 0 {
                    Some(Num::Int(x / y))
                } else {
                    None
                }
            }
            _ => unreachable!(),
        },
        _ => None,
    };

    let result = result.unwrap_or_else(|| {
        let (x, y) = (a.as_f64(), b.as_f64());
        Num::Dbl(match op {
            BinaryOp::Add => x + y,
            BinaryOp::Sub => x - y,
            BinaryOp::Mul => x * y,
            BinaryOp::Div => x / y,
            _ => unreachable!(),
        })
    });
    make_num(heap, result)
}

fn bitwise(heap: &mut Heap, op: BinaryOp, lhs: u64, rhs: u64) -> u64 {
    let x = to_num(lhs).as_i64();
    let y = to_num(rhs).as_i64();
    let result = match op {
        BinaryOp::BAnd => x & y,
        BinaryOp::BOr => x | y,
        BinaryOp::BXor => x ^ y,
        _ => unreachable!(),
    };
    make_int(heap, result)
}

fn compare(root: u64, op: BinaryOp, lhs: u64, rhs: u64) -> u64 {
    let result = if is_string(lhs) && is_string(rhs) {
        let ord = HString::bytes(lhs).cmp(HString::bytes(rhs));
        match op {
            BinaryOp::Lt => ord.is_lt(),
            BinaryOp::Gt => ord.is_gt(),
            BinaryOp::Le => ord.is_le(),
            BinaryOp::Ge => ord.is_ge(),
            _ => unreachable!(),
        }
    } else {
        let (x, y) = (to_num(lhs).as_f64(), to_num(rhs).as_f64());
        match op {
            BinaryOp::Lt => x < y,
            BinaryOp::Gt => x > y,
            BinaryOp::Le => x <= y,
            BinaryOp::Ge => x >= y,
            _ => unreachable!(),
        }
    };
    root_bool(root, result)
}

/// Value classes for equality: no cross-class coercion.
fn loose_eq(lhs: u64, rhs: u64) -> bool {
    let number_like = |v: u64| is_unboxed(v) || HNumber::is_boxed_double(v);
    if lhs == NIL || rhs == NIL {
        return lhs == rhs;
    }
    if number_like(lhs) && number_like(rhs) {
        return HNumber::double_value(lhs) == HNumber::double_value(rhs);
    }
    if is_unboxed(lhs) || is_unboxed(rhs) {
        return false;
    }
    match (HValue::tag_of(lhs), HValue::tag_of(rhs)) {
        (HeapTag::String, HeapTag::String) => HString::equals(lhs, rhs),
        (HeapTag::Boolean, HeapTag::Boolean) => HBoolean::value(lhs) == HBoolean::value(rhs),
        _ => lhs == rhs,
    }
}

/// Strict equality additionally requires the same representation: an
/// unboxed integer is never strictly equal to a boxed double.
fn strict_eq(lhs: u64, rhs: u64) -> bool {
    if is_unboxed(lhs) != is_unboxed(rhs) {
        return false;
    }
    loose_eq(lhs, rhs)
}

fn logical(op: BinaryOp, lhs: u64, rhs: u64) -> u64 {
    match op {
        BinaryOp::LAnd => {
            if is_truthy(lhs) {
                rhs
            } else {
                lhs
            }
        }
        BinaryOp::LOr => {
            if is_truthy(lhs) {
                lhs
            } else {
                rhs
            }
        }
        _ => unreachable!(),
    }
}

macro_rules! binary_stub_fns {
    ($($name:ident => $op:expr;)*) => {
        $(
            pub extern "C" fn $name(heap: *mut Heap, root: u64, lhs: u64, rhs: u64) -> u64 {
                let heap = unsafe { &mut *heap };
                dispatch_binary(heap, root, $op, lhs, rhs)
            }
        )*
    };
}

fn dispatch_binary(heap: &mut Heap, root: u64, op: BinaryOp, lhs: u64, rhs: u64) -> u64 {
    match op {
        BinaryOp::Add | BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div => {
            arith(heap, op, lhs, rhs)
        }
        BinaryOp::BAnd | BinaryOp::BOr | BinaryOp::BXor => bitwise(heap, op, lhs, rhs),
        BinaryOp::Lt | BinaryOp::Gt | BinaryOp::Le | BinaryOp::Ge => compare(root, op, lhs, rhs),
        BinaryOp::Eq => root_bool(root, loose_eq(lhs, rhs)),
        BinaryOp::Ne => root_bool(root, !loose_eq(lhs, rhs)),
        BinaryOp::StrictEq => root_bool(root, strict_eq(lhs, rhs)),
        BinaryOp::StrictNe => root_bool(root, !strict_eq(lhs, rhs)),
        BinaryOp::LOr | BinaryOp::LAnd => logical(op, lhs, rhs),
    }
}

binary_stub_fns! {
    rt_binary_add => BinaryOp::Add;
    rt_binary_sub => BinaryOp::Sub;
    rt_binary_mul => BinaryOp::Mul;
    rt_binary_div => BinaryOp::Div;
    rt_binary_band => BinaryOp::BAnd;
    rt_binary_bor => BinaryOp::BOr;
    rt_binary_bxor => BinaryOp::BXor;
    rt_binary_eq => BinaryOp::Eq;
    rt_binary_strict_eq => BinaryOp::StrictEq;
    rt_binary_ne => BinaryOp::Ne;
    rt_binary_strict_ne => BinaryOp::StrictNe;
    rt_binary_lt => BinaryOp::Lt;
    rt_binary_gt => BinaryOp::Gt;
    rt_binary_le => BinaryOp::Le;
    rt_binary_ge => BinaryOp::Ge;
    rt_binary_lor => BinaryOp::LOr;
    rt_binary_land => BinaryOp::LAnd;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::RefKind;

    /// Build a root context shaped like the one the code generator emits:
    /// global object, true, false, then the nine type strings.
    fn build_root(heap: &mut Heap) -> u64 {
        let mut values = vec![
            HObject::new_empty(heap),
            HBoolean::new(heap, Tenure::Old, true),
            HBoolean::new(heap, Tenure::Old, false),
        ];
        for name in root_index::TYPE_NAME_STRINGS {
            values.push(HString::new(heap, Tenure::Old, name.as_bytes()));
        }
        HContext::new(heap, &values)
    }

    fn heap_and_root() -> (Box<Heap>, u64) {
        let mut heap = Heap::new(1 << 16);
        let root = build_root(&mut heap);
        (heap, root)
    }

    fn as_bool(root: u64, value: u64) -> bool {
        assert_eq!(HValue::tag_of(value), HeapTag::Boolean);
        assert!(
            value == HContext::get_slot(root, root_index::TRUE)
                || value == HContext::get_slot(root, root_index::FALSE)
        );
        HBoolean::value(value)
    }

    #[test]
    fn integer_arithmetic_stays_tagged() {
        let (mut heap, root) = heap_and_root();
        let h = &mut *heap as *mut Heap;
        assert_eq!(rt_binary_add(h, root, tag_int(2), tag_int(40)), tag_int(42));
        assert_eq!(rt_binary_sub(h, root, tag_int(2), tag_int(40)), tag_int(-38));
        assert_eq!(rt_binary_mul(h, root, tag_int(6), tag_int(7)), tag_int(42));
        assert_eq!(rt_binary_div(h, root, tag_int(42), tag_int(6)), tag_int(7));
    }

    #[test]
    fn overflow_and_fractions_box_doubles() {
        let (mut heap, root) = heap_and_root();
        let h = &mut *heap as *mut Heap;
        let big = (1i64 << 62) - 1;
        let sum = rt_binary_add(h, root, tag_int(big), tag_int(big));
        assert!(HNumber::is_boxed_double(sum));
        assert_eq!(HNumber::double_value(sum), (big as f64) * 2.0);

        let half = rt_binary_div(h, root, tag_int(1), tag_int(2));
        assert!(HNumber::is_boxed_double(half));
        assert_eq!(HNumber::double_value(half), 0.5);
    }

    #[test]
    fn add_concatenates_strings() {
        let (mut heap, root) = heap_and_root();
        let a = HString::new(&mut heap, Tenure::New, b"foo");
        let b = HString::new(&mut heap, Tenure::New, b"bar");
        let h = &mut *heap as *mut Heap;
        let joined = rt_binary_add(h, root, a, b);
        assert_eq!(HString::bytes(joined), b"foobar");
    }

    #[test]
    fn comparisons_return_root_booleans() {
        let (mut heap, root) = heap_and_root();
        let h = &mut *heap as *mut Heap;
        assert!(as_bool(root, rt_binary_lt(h, root, tag_int(1), tag_int(2))));
        assert!(!as_bool(root, rt_binary_gt(h, root, tag_int(1), tag_int(2))));
        assert!(as_bool(root, rt_binary_le(h, root, tag_int(2), tag_int(2))));
        assert!(as_bool(root, rt_binary_ge(h, root, tag_int(2), tag_int(2))));
    }

    #[test]
    fn equality_classes() {
        let (mut heap, root) = heap_and_root();
        let a = HString::new(&mut heap, Tenure::New, b"x");
        let b = HString::new(&mut heap, Tenure::New, b"x");
        let boxed_two = HNumber::new_double(&mut heap, Tenure::New, 2.0);
        let h = &mut *heap as *mut Heap;

        assert!(as_bool(root, rt_binary_eq(h, root, a, b)));
        assert!(as_bool(root, rt_binary_eq(h, root, tag_int(2), boxed_two)));
        assert!(as_bool(root, rt_binary_eq(h, root, NIL, NIL)));
        assert!(!as_bool(root, rt_binary_eq(h, root, NIL, tag_int(0))));

        // Strict: representation matters.
        assert!(!as_bool(root, rt_binary_strict_eq(h, root, tag_int(2), boxed_two)));
        assert!(as_bool(
            root,
            rt_binary_strict_eq(h, root, tag_int(2), tag_int(2))
        ));
        assert!(as_bool(root, rt_binary_strict_ne(h, root, tag_int(2), boxed_two)));
    }

    #[test]
    fn logical_ops_select_operands() {
        let (mut heap, root) = heap_and_root();
        let h = &mut *heap as *mut Heap;
        assert_eq!(rt_binary_land(h, root, tag_int(1), tag_int(2)), tag_int(2));
        assert_eq!(rt_binary_land(h, root, NIL, tag_int(2)), NIL);
        assert_eq!(rt_binary_lor(h, root, tag_int(1), tag_int(2)), tag_int(1));
        assert_eq!(rt_binary_lor(h, root, NIL, tag_int(2)), tag_int(2));
    }

    #[test]
    fn coerce_to_boolean_rules() {
        let (mut heap, root) = heap_and_root();
        let empty = HString::new(&mut heap, Tenure::New, b"");
        let full = HString::new(&mut heap, Tenure::New, b"x");
        let obj = HObject::new_empty(&mut heap);
        let h = &mut *heap as *mut Heap;

        assert!(!as_bool(root, rt_coerce_to_boolean(h, root, NIL)));
        assert!(!as_bool(root, rt_coerce_to_boolean(h, root, tag_int(0))));
        assert!(as_bool(root, rt_coerce_to_boolean(h, root, tag_int(-3))));
        assert!(!as_bool(root, rt_coerce_to_boolean(h, root, empty)));
        assert!(as_bool(root, rt_coerce_to_boolean(h, root, full)));
        assert!(as_bool(root, rt_coerce_to_boolean(h, root, obj)));
    }

    #[test]
    fn typeof_uses_cached_type_strings() {
        let (mut heap, root) = heap_and_root();
        let s = HString::new(&mut heap, Tenure::New, b"s");
        let obj = HObject::new_empty(&mut heap);
        let arr = HArray::with_capacity(&mut heap, 4);
        let h = &mut *heap as *mut Heap;

        let type_name = |v: u64| -> String {
            let s = rt_typeof(h, root, v);
            String::from_utf8(HString::bytes(s).to_vec()).unwrap()
        };
        assert_eq!(type_name(NIL), "nil");
        assert_eq!(type_name(tag_int(1)), "number");
        assert_eq!(type_name(s), "string");
        assert_eq!(type_name(obj), "object");
        assert_eq!(type_name(arr), "array");
    }

    #[test]
    fn sizeof_per_kind() {
        let (mut heap, _root) = heap_and_root();
        let s = HString::new(&mut heap, Tenure::New, b"four");
        let arr = HArray::with_capacity(&mut heap, 8);
        for i in 0..3 {
            let off = HObject::lookup_property(Some(&mut heap), arr, tag_int(i), true);
            unsafe { crate::value::write_word(HObject::map(arr), off, tag_int(1)) };
        }
        // Nil out the tail: sizeof shrinks over it.
        let off = HObject::lookup_property(Some(&mut heap), arr, tag_int(2), true);
        unsafe { crate::value::write_word(HObject::map(arr), off, NIL) };

        let h = &mut *heap as *mut Heap;
        assert_eq!(rt_sizeof(h, s), tag_int(4));
        assert_eq!(rt_sizeof(h, arr), tag_int(2));
        assert_eq!(rt_sizeof(h, NIL), tag_int(0));
        assert_eq!(rt_sizeof(h, tag_int(9)), tag_int(0));
    }

    #[test]
    fn keysof_collects_live_keys() {
        let (mut heap, _root) = heap_and_root();
        let obj = HObject::new_empty(&mut heap);
        let name = HString::new(&mut heap, Tenure::New, b"name");
        let off = HObject::lookup_property(Some(&mut heap), obj, name, true);
        unsafe { crate::value::write_word(HObject::map(obj), off, tag_int(1)) };
        let off = HObject::lookup_property(Some(&mut heap), obj, tag_int(5), true);
        unsafe { crate::value::write_word(HObject::map(obj), off, tag_int(2)) };

        let h = &mut *heap as *mut Heap;
        let keys = rt_keysof(h, obj);
        assert_eq!(HValue::tag_of(keys), HeapTag::Array);
        assert_eq!(HArray::length(keys, false), 2);

        let mut found_name = false;
        let mut found_index = false;
        for i in 0..2 {
            let off = HObject::lookup_property(None, keys, tag_int(i), false);
            let key = unsafe { crate::value::read_word(HObject::map(keys), off) };
            if key == tag_int(5) {
                found_index = true;
            } else if HValue::tag_of(key) == HeapTag::String {
                assert_eq!(HString::bytes(key), b"name");
                found_name = true;
            }
        }
        assert!(found_name && found_index);
    }

    #[test]
    fn clone_object_is_shallow_and_independent() {
        let (mut heap, _root) = heap_and_root();
        let proto = HObject::new_empty(&mut heap);
        let key = HString::new(&mut heap, Tenure::New, b"k");
        let off = HObject::lookup_property(Some(&mut heap), proto, key, true);
        unsafe { crate::value::write_word(HObject::map(proto), off, tag_int(10)) };

        let h = &mut *heap as *mut Heap;
        let clone = rt_clone_object(h, proto);
        assert_ne!(clone, proto);
        let off = HObject::lookup_property(None, clone, key, false);
        assert_eq!(
            unsafe { crate::value::read_word(HObject::map(clone), off) },
            tag_int(10)
        );

        // Writes to the clone do not touch the prototype.
        unsafe { crate::value::write_word(HObject::map(clone), off, tag_int(99)) };
        let off = HObject::lookup_property(None, proto, key, false);
        assert_eq!(
            unsafe { crate::value::read_word(HObject::map(proto), off) },
            tag_int(10)
        );

        // Non-object prototypes clone to an empty object.
        let fresh = rt_clone_object(h, NIL);
        assert_eq!(HValue::tag_of(fresh), HeapTag::Object);
    }

    #[test]
    fn allocate_stub_helper_writes_header() {
        let mut heap = Heap::new(1 << 16);
        let h = &mut *heap as *mut Heap;
        let addr = rt_allocate(h, tag_int(HeapTag::Object as i64), tag_int(24));
        assert_eq!(HValue::tag_of(addr), HeapTag::Object);
        assert_eq!(HValue::generation(addr), 0);
    }

    #[test]
    fn collect_garbage_helper_runs() {
        let mut heap = Heap::new(1 << 14);
        let s = HString::new(&mut heap, Tenure::New, b"root me");
        let mut slot = s;
        heap.reference(RefKind::Persistent, &mut slot, s);
        let h = &mut *heap as *mut Heap;
        rt_collect_garbage(h, 0);
        assert_eq!(HString::bytes(slot), b"root me");
        heap.dereference(&mut slot);
    }
}
