//! Layouts and constructors for each heap object kind.
//!
//! Objects are operated on through raw addresses rather than Rust
//! references: generated code hands us plain words, and the collector moves
//! objects underneath any higher-level view. Every accessor is an
//! associated function taking the object address, with the layout's byte
//! offsets (relative to the tag byte at offset 0) as constants.

use crate::heap::{
    Header, Heap, HeapTag, Space, Tenure, BINDING_CONTEXT_SENTINEL, MIN_OLD_GENERATION, NIL,
};
use crate::heap::{is_heap_ref, is_unboxed, tag_int, untag_int};
use crate::utils;

#[inline]
pub(crate) unsafe fn read_word(addr: u64, offset: u64) -> u64 {
    *((addr + offset) as *const u64)
}

#[inline]
pub(crate) unsafe fn write_word(addr: u64, offset: u64, value: u64) {
    *((addr + offset) as *mut u64) = value;
}

// ---------------------------------------------------------------------------
// HValue — operations common to every kind
// ---------------------------------------------------------------------------

pub struct HValue;

impl HValue {
    /// Tag of an arbitrary value word: nil and unboxed integers are handled
    /// without touching memory.
    pub fn tag_of(word: u64) -> HeapTag {
        if word == NIL {
            return HeapTag::Nil;
        }
        if is_unboxed(word) {
            return HeapTag::Number;
        }
        match unsafe { Header::read(word) } {
            Some(Header::Live { tag, .. }) => tag,
            _ => HeapTag::Nil,
        }
    }

    pub fn generation(addr: u64) -> u8 {
        match unsafe { Header::read(addr) } {
            Some(Header::Live { generation, .. }) => generation,
            _ => 0,
        }
    }

    /// Total byte size (header included) of the object at `addr`, computed
    /// from its tag the way the collector needs it.
    pub fn size_of(addr: u64) -> Option<u32> {
        let tag = match unsafe { Header::read(addr) } {
            Some(Header::Live { tag, .. }) => tag,
            _ => return None,
        };
        Some(match tag {
            HeapTag::Context => 24 + 8 * HContext::slots(addr) as u32,
            HeapTag::Function => 32,
            HeapTag::Number | HeapTag::Boolean => 16,
            HeapTag::String => 24 + HString::length(addr) as u32,
            HeapTag::Object => 24,
            HeapTag::Array => 32,
            HeapTag::Map => 16 + (HMap::size(addr) as u32) * 16,
            HeapTag::CData => 16 + HCData::size(addr) as u32,
            HeapTag::Nil | HeapTag::Code => return None,
        })
    }

    /// Copy the object into the space its incremented generation selects and
    /// return the new address. The old header is left untouched; the caller
    /// (the collector) installs the forwarding word.
    pub fn copy_to(addr: u64, old_space: &mut Space, new_space: &mut Space) -> u64 {
        debug_assert!(is_heap_ref(addr));
        let size = HValue::size_of(addr).expect("copying a non-object");
        let (tag, generation) = match unsafe { Header::read(addr) } {
            Some(Header::Live { tag, generation }) => {
                (tag, (generation + 1).min(MIN_OLD_GENERATION))
            }
            _ => unreachable!("forwarded object copied twice"),
        };

        let dest = if generation >= MIN_OLD_GENERATION {
            old_space.allocate(size)
        } else {
            new_space.allocate(size)
        } as u64;

        unsafe {
            std::ptr::copy_nonoverlapping(addr as *const u8, dest as *mut u8, size as usize);
            Header::Live { tag, generation }.write(dest);
        }
        dest
    }
}

// ---------------------------------------------------------------------------
// Context
// ---------------------------------------------------------------------------

pub struct HContext;

impl HContext {
    pub const PARENT_OFFSET: u64 = 8;
    pub const SLOTS_OFFSET: u64 = 16;

    /// Byte displacement of slot `index`, shared with the code generator.
    pub fn index_disp(index: u32) -> u64 {
        24 + 8 * index as u64
    }

    /// Build a context holding `values`, old tenure, parent nil. Used for
    /// the root context of compiled scripts.
    pub fn new(heap: &mut Heap, values: &[u64]) -> u64 {
        let addr = heap.allocate_tagged(
            HeapTag::Context,
            Tenure::Old,
            16 + 8 * values.len() as u32,
        );
        unsafe {
            write_word(addr, Self::PARENT_OFFSET, NIL);
            write_word(addr, Self::SLOTS_OFFSET, values.len() as u64);
            for (i, &v) in values.iter().enumerate() {
                write_word(addr, Self::index_disp(i as u32), v);
            }
        }
        addr
    }

    pub fn parent(addr: u64) -> u64 {
        unsafe { read_word(addr, Self::PARENT_OFFSET) }
    }

    pub fn slots(addr: u64) -> u64 {
        unsafe { read_word(addr, Self::SLOTS_OFFSET) }
    }

    pub fn get_slot(addr: u64, index: u32) -> u64 {
        debug_assert!((index as u64) < Self::slots(addr));
        unsafe { read_word(addr, Self::index_disp(index)) }
    }

    pub fn slot_addr(addr: u64, index: u32) -> *mut u64 {
        (addr + Self::index_disp(index)) as *mut u64
    }
}

// ---------------------------------------------------------------------------
// Number
// ---------------------------------------------------------------------------

pub struct HNumber;

impl HNumber {
    pub const VALUE_OFFSET: u64 = 8;

    /// Integers stay unboxed; no heap traffic.
    pub fn new(value: i64) -> u64 {
        tag_int(value)
    }

    /// Doubles are boxed.
    pub fn new_double(heap: &mut Heap, tenure: Tenure, value: f64) -> u64 {
        let addr = heap.allocate_tagged(HeapTag::Number, tenure, 8);
        unsafe { write_word(addr, Self::VALUE_OFFSET, value.to_bits()) };
        addr
    }

    /// Integral view: the untagged integer for unboxed words, the floor of
    /// the stored double for boxed ones.
    pub fn integral_value(word: u64) -> i64 {
        if is_unboxed(word) {
            untag_int(word)
        } else {
            Self::double_value(word).floor() as i64
        }
    }

    /// Double view. For an unboxed word this converts the integer; it never
    /// reinterprets the payload bits.
    pub fn double_value(word: u64) -> f64 {
        if is_unboxed(word) {
            untag_int(word) as f64
        } else {
            f64::from_bits(unsafe { read_word(word, Self::VALUE_OFFSET) })
        }
    }

    pub fn is_boxed_double(word: u64) -> bool {
        is_heap_ref(word) && HValue::tag_of(word) == HeapTag::Number
    }
}

// ---------------------------------------------------------------------------
// Boolean
// ---------------------------------------------------------------------------

pub struct HBoolean;

impl HBoolean {
    pub const VALUE_OFFSET: u64 = 8;

    pub fn new(heap: &mut Heap, tenure: Tenure, value: bool) -> u64 {
        let addr = heap.allocate_tagged(HeapTag::Boolean, tenure, 8);
        unsafe { *((addr + Self::VALUE_OFFSET) as *mut u8) = value as u8 };
        addr
    }

    pub fn value(addr: u64) -> bool {
        unsafe { *((addr + Self::VALUE_OFFSET) as *const u8) != 0 }
    }
}

// ---------------------------------------------------------------------------
// String
// ---------------------------------------------------------------------------

pub struct HString;

impl HString {
    pub const HASH_OFFSET: u64 = 8;
    pub const LENGTH_OFFSET: u64 = 16;
    pub const VALUE_OFFSET: u64 = 24;

    pub fn new(heap: &mut Heap, tenure: Tenure, bytes: &[u8]) -> u64 {
        let addr = heap.allocate_tagged(HeapTag::String, tenure, 16 + bytes.len() as u32);
        unsafe {
            write_word(addr, Self::HASH_OFFSET, 0);
            write_word(addr, Self::LENGTH_OFFSET, bytes.len() as u64);
            std::ptr::copy_nonoverlapping(
                bytes.as_ptr(),
                (addr + Self::VALUE_OFFSET) as *mut u8,
                bytes.len(),
            );
        }
        addr
    }

    pub fn length(addr: u64) -> u64 {
        unsafe { read_word(addr, Self::LENGTH_OFFSET) }
    }

    pub fn bytes<'a>(addr: u64) -> &'a [u8] {
        unsafe {
            std::slice::from_raw_parts(
                (addr + Self::VALUE_OFFSET) as *const u8,
                Self::length(addr) as usize,
            )
        }
    }

    /// Lazily computed hash, cached in the header field. A zero field means
    /// "not computed yet"; the rare string that genuinely hashes to zero is
    /// recomputed on each call, which is only a cost, not a correctness
    /// issue.
    pub fn hash(addr: u64) -> u32 {
        let field = (addr + Self::HASH_OFFSET) as *mut u32;
        let cached = unsafe { *field };
        if cached != 0 {
            return cached;
        }
        let hash = utils::hash_bytes(Self::bytes(addr));
        unsafe { *field = hash };
        hash
    }

    pub fn equals(a: u64, b: u64) -> bool {
        a == b || (Self::length(a) == Self::length(b) && Self::bytes(a) == Self::bytes(b))
    }
}

// ---------------------------------------------------------------------------
// Object and Array
// ---------------------------------------------------------------------------

pub struct HObject;

impl HObject {
    pub const MASK_OFFSET: u64 = 8;
    pub const MAP_OFFSET: u64 = 16;

    pub const DEFAULT_CAPACITY: u32 = 16;

    pub fn new_empty(heap: &mut Heap) -> u64 {
        Self::with_capacity(heap, Self::DEFAULT_CAPACITY)
    }

    pub fn with_capacity(heap: &mut Heap, capacity: u32) -> u64 {
        debug_assert!(capacity.is_power_of_two());
        let obj = heap.allocate_tagged(HeapTag::Object, Tenure::New, 16);
        let map = HMap::new_empty(heap, capacity);
        unsafe {
            write_word(obj, Self::MASK_OFFSET, ((capacity - 1) << 3) as u64);
            write_word(obj, Self::MAP_OFFSET, map);
        }
        obj
    }

    pub fn mask(addr: u64) -> u64 {
        unsafe { read_word(addr, Self::MASK_OFFSET) }
    }

    pub fn map(addr: u64) -> u64 {
        unsafe { read_word(addr, Self::MAP_OFFSET) }
    }

    fn set_map(addr: u64, map: u64, capacity: u32) {
        unsafe {
            write_word(addr, Self::MASK_OFFSET, ((capacity - 1) << 3) as u64);
            write_word(addr, Self::MAP_OFFSET, map);
        }
    }

    /// The hash-probe behind member access. Returns the byte offset of the
    /// value slot relative to the map header, or 0 ("nil offset") on a miss
    /// without insert. With `insert`, claims an empty key slot, growing the
    /// map by replacement when it is full (`heap` is only needed for that
    /// growth; read-only probes may pass `None`).
    pub fn lookup_property(
        mut heap: Option<&mut Heap>,
        obj: u64,
        key: u64,
        insert: bool,
    ) -> u64 {
        let obj_tag = HValue::tag_of(obj);
        if obj_tag != HeapTag::Object && obj_tag != HeapTag::Array {
            return 0;
        }
        let key = match NormalizedKey::from_word(key) {
            Some(k) => k,
            None => return 0,
        };

        loop {
            let map = Self::map(obj);
            let capacity = HMap::size(map) as u64;
            let mask = Self::mask(obj);
            debug_assert_eq!(mask, (capacity - 1) << 3);

            let mut probe = (key.hash() as u64) & mask;
            for _ in 0..capacity {
                let slot = (map + HMap::SPACE_OFFSET + probe) as *mut u64;
                let word = unsafe { *slot };
                if word == NIL {
                    if !insert {
                        return 0;
                    }
                    unsafe { *slot = key.word() };
                    if obj_tag == HeapTag::Array {
                        key.maybe_extend_array(obj);
                    }
                    return HMap::SPACE_OFFSET + probe + capacity * 8;
                }
                if key.matches(word) {
                    if insert && obj_tag == HeapTag::Array {
                        key.maybe_extend_array(obj);
                    }
                    return HMap::SPACE_OFFSET + probe + capacity * 8;
                }
                probe = (probe + 8) & mask;
            }

            // Map is full: replace it with one twice the size and retry.
            if !insert {
                return 0;
            }
            match heap {
                Some(ref mut heap) => Self::grow(heap, obj, (capacity as u32) * 2),
                None => return 0,
            }
        }
    }

    fn grow(heap: &mut Heap, obj: u64, new_capacity: u32) {
        let old_map = Self::map(obj);
        let old_capacity = HMap::size(old_map) as u32;
        let new_map = HMap::new_empty(heap, new_capacity);
        let new_mask = ((new_capacity - 1) << 3) as u64;

        for i in 0..old_capacity {
            let key = HMap::get_key(old_map, i);
            if key == NIL {
                continue;
            }
            let value = HMap::get_value(old_map, old_capacity, i);
            let hash = match NormalizedKey::from_word(key) {
                Some(k) => k.hash(),
                None => continue,
            };
            let mut probe = (hash as u64) & new_mask;
            loop {
                let slot = (new_map + HMap::SPACE_OFFSET + probe) as *mut u64;
                if unsafe { *slot } == NIL {
                    unsafe {
                        *slot = key;
                        *((new_map + HMap::SPACE_OFFSET + probe + new_capacity as u64 * 8)
                            as *mut u64) = value;
                    }
                    break;
                }
                probe = (probe + 8) & new_mask;
            }
        }

        // The old map becomes unreachable and is reclaimed on the next cycle.
        Self::set_map(obj, new_map, new_capacity);
    }
}

/// Keys as the probe compares them: strings by content hash, numbers as
/// tagged integers, everything else by identity word.
enum NormalizedKey {
    Int(u64),
    Str(u64),
    Ident(u64),
}

impl NormalizedKey {
    fn from_word(key: u64) -> Option<NormalizedKey> {
        if key == NIL {
            return None;
        }
        if is_unboxed(key) {
            return Some(NormalizedKey::Int(key));
        }
        Some(match HValue::tag_of(key) {
            HeapTag::String => NormalizedKey::Str(key),
            HeapTag::Number => NormalizedKey::Int(tag_int(HNumber::integral_value(key))),
            HeapTag::Boolean => NormalizedKey::Int(tag_int(HBoolean::value(key) as i64)),
            _ => NormalizedKey::Ident(key),
        })
    }

    fn hash(&self) -> u32 {
        match *self {
            NormalizedKey::Int(w) => utils::hash_int(untag_int(w)),
            NormalizedKey::Str(s) => HString::hash(s),
            NormalizedKey::Ident(w) => utils::hash_int(w as i64),
        }
    }

    fn word(&self) -> u64 {
        match *self {
            NormalizedKey::Int(w) | NormalizedKey::Str(w) | NormalizedKey::Ident(w) => w,
        }
    }

    fn matches(&self, stored: u64) -> bool {
        match *self {
            NormalizedKey::Int(w) | NormalizedKey::Ident(w) => stored == w,
            NormalizedKey::Str(s) => {
                stored == s
                    || (is_heap_ref(stored)
                        && HValue::tag_of(stored) == HeapTag::String
                        && HString::equals(stored, s))
            }
        }
    }

    fn maybe_extend_array(&self, obj: u64) {
        if let NormalizedKey::Int(w) = *self {
            let index = untag_int(w);
            if index >= 0 && index >= HArray::raw_length(obj) {
                HArray::set_length(obj, index + 1);
            }
        }
    }
}

pub struct HArray;

impl HArray {
    pub const LENGTH_OFFSET: u64 = 24;

    pub fn with_capacity(heap: &mut Heap, capacity: u32) -> u64 {
        debug_assert!(capacity.is_power_of_two());
        let obj = heap.allocate_tagged(HeapTag::Array, Tenure::New, 24);
        let map = HMap::new_empty(heap, capacity);
        unsafe {
            write_word(obj, HObject::MASK_OFFSET, ((capacity - 1) << 3) as u64);
            write_word(obj, HObject::MAP_OFFSET, map);
            write_word(obj, Self::LENGTH_OFFSET, tag_int(0));
        }
        obj
    }

    fn raw_length(obj: u64) -> i64 {
        untag_int(unsafe { read_word(obj, Self::LENGTH_OFFSET) })
    }

    pub fn set_length(obj: u64, length: i64) {
        unsafe { write_word(obj, Self::LENGTH_OFFSET, tag_int(length)) };
    }

    /// Array length; with `shrink`, walk back over trailing nil slots and
    /// update the stored length first.
    pub fn length(obj: u64, shrink: bool) -> i64 {
        let mut result = Self::raw_length(obj);
        if shrink {
            let mut shrunk = result;
            while shrunk > 0 {
                let offset = HObject::lookup_property(None, obj, tag_int(shrunk - 1), false);
                let value = if offset == 0 {
                    NIL
                } else {
                    unsafe { read_word(HObject::map(obj), offset) }
                };
                if value != NIL {
                    break;
                }
                shrunk -= 1;
            }
            if shrunk != result {
                result = shrunk;
                Self::set_length(obj, result);
            }
        }
        result
    }
}

// ---------------------------------------------------------------------------
// Map
// ---------------------------------------------------------------------------

pub struct HMap;

impl HMap {
    pub const SIZE_OFFSET: u64 = 8;
    pub const SPACE_OFFSET: u64 = 16;

    pub fn new_empty(heap: &mut Heap, capacity: u32) -> u64 {
        let addr = heap.allocate_tagged(HeapTag::Map, Tenure::New, 8 + capacity * 16);
        unsafe {
            write_word(addr, Self::SIZE_OFFSET, capacity as u64);
            // Key and value halves both start as nil words.
            std::ptr::write_bytes(
                (addr + Self::SPACE_OFFSET) as *mut u8,
                0,
                capacity as usize * 16,
            );
        }
        addr
    }

    pub fn size(addr: u64) -> u64 {
        unsafe { read_word(addr, Self::SIZE_OFFSET) }
    }

    pub fn get_key(map: u64, index: u32) -> u64 {
        unsafe { read_word(map, Self::SPACE_OFFSET + 8 * index as u64) }
    }

    pub fn get_value(map: u64, capacity: u32, index: u32) -> u64 {
        unsafe { read_word(map, Self::SPACE_OFFSET + 8 * (capacity + index) as u64) }
    }

    pub fn key_slot_addr(map: u64, index: u32) -> *mut u64 {
        (map + Self::SPACE_OFFSET + 8 * index as u64) as *mut u64
    }

    pub fn value_slot_addr(map: u64, capacity: u32, index: u32) -> *mut u64 {
        (map + Self::SPACE_OFFSET + 8 * (capacity + index) as u64) as *mut u64
    }
}

// ---------------------------------------------------------------------------
// Function
// ---------------------------------------------------------------------------

pub struct HFunction;

impl HFunction {
    pub const PARENT_OFFSET: u64 = 8;
    pub const CODE_OFFSET: u64 = 16;
    pub const ROOT_OFFSET: u64 = 24;

    pub fn new(heap: &mut Heap, parent: u64, code: u64, root: u64) -> u64 {
        let addr = heap.allocate_tagged(HeapTag::Function, Tenure::Old, 24);
        unsafe {
            write_word(addr, Self::PARENT_OFFSET, parent);
            write_word(addr, Self::CODE_OFFSET, code);
            write_word(addr, Self::ROOT_OFFSET, root);
        }
        addr
    }

    /// A binding is a function whose parent-context word is the reserved
    /// sentinel; its code address is a native function pointer.
    pub fn new_binding(heap: &mut Heap, code: u64, root: u64) -> u64 {
        Self::new(heap, BINDING_CONTEXT_SENTINEL, code, root)
    }

    pub fn parent(addr: u64) -> u64 {
        unsafe { read_word(addr, Self::PARENT_OFFSET) }
    }

    pub fn code(addr: u64) -> u64 {
        unsafe { read_word(addr, Self::CODE_OFFSET) }
    }

    pub fn root(addr: u64) -> u64 {
        unsafe { read_word(addr, Self::ROOT_OFFSET) }
    }

    pub fn is_binding(addr: u64) -> bool {
        Self::parent(addr) == BINDING_CONTEXT_SENTINEL
    }
}

// ---------------------------------------------------------------------------
// CData
// ---------------------------------------------------------------------------

pub struct HCData;

impl HCData {
    pub const SIZE_OFFSET: u64 = 8;
    pub const DATA_OFFSET: u64 = 16;

    pub fn new(heap: &mut Heap, size: u32) -> u64 {
        let addr = heap.allocate_tagged(HeapTag::CData, Tenure::New, 8 + size);
        unsafe { write_word(addr, Self::SIZE_OFFSET, size as u64) };
        addr
    }

    pub fn size(addr: u64) -> u64 {
        unsafe { read_word(addr, Self::SIZE_OFFSET) }
    }

    pub fn data_ptr(addr: u64) -> *mut u8 {
        (addr + Self::DATA_OFFSET) as *mut u8
    }
}

// ---------------------------------------------------------------------------
// Root context layout
// ---------------------------------------------------------------------------

/// Fixed indices into the root context. Slots 3..=11 hold the nine type-name
/// strings in tag order, which is what the typeof helper indexes by.
pub mod root_index {
    pub const GLOBAL: u32 = 0;
    pub const TRUE: u32 = 1;
    pub const FALSE: u32 = 2;
    pub const TYPE_NAMES: u32 = 3;
    pub const TYPE_NAME_COUNT: u32 = 9;
    /// First slot available for interned literals.
    pub const FIRST_LITERAL: u32 = TYPE_NAMES + TYPE_NAME_COUNT;

    pub const TYPE_NAME_STRINGS: [&str; TYPE_NAME_COUNT as usize] = [
        "nil", "function", "context", "number", "string", "boolean", "object", "array", "cdata",
    ];
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::Space;

    fn heap() -> Box<Heap> {
        Heap::new(1 << 16)
    }

    #[test]
    fn number_views() {
        let w = HNumber::new(-7);
        assert!(is_unboxed(w));
        assert_eq!(HNumber::integral_value(w), -7);
        assert_eq!(HNumber::double_value(w), -7.0);

        let mut heap = heap();
        let d = HNumber::new_double(&mut heap, Tenure::New, 2.5);
        assert!(HNumber::is_boxed_double(d));
        assert_eq!(HNumber::double_value(d), 2.5);
        assert_eq!(HNumber::integral_value(d), 2);
    }

    #[test]
    fn string_hash_is_cached() {
        let mut heap = heap();
        let s = HString::new(&mut heap, Tenure::New, b"hello");
        assert_eq!(unsafe { read_word(s, HString::HASH_OFFSET) } as u32, 0);
        let first = HString::hash(s);
        assert_ne!(first, 0);
        assert_eq!(unsafe { read_word(s, HString::HASH_OFFSET) } as u32, first);
        assert_eq!(HString::hash(s), first);
    }

    #[test]
    fn string_equality_by_content() {
        let mut heap = heap();
        let a = HString::new(&mut heap, Tenure::New, b"key");
        let b = HString::new(&mut heap, Tenure::New, b"key");
        let c = HString::new(&mut heap, Tenure::New, b"other");
        assert_ne!(a, b);
        assert!(HString::equals(a, b));
        assert!(!HString::equals(a, c));
    }

    #[test]
    fn object_starts_empty() {
        let mut heap = heap();
        let obj = HObject::new_empty(&mut heap);
        assert_eq!(HValue::tag_of(obj), HeapTag::Object);
        assert_eq!(HObject::mask(obj), (16 - 1) << 3);
        let map = HObject::map(obj);
        assert_eq!(HMap::size(map), 16);
        for i in 0..16 {
            assert_eq!(HMap::get_key(map, i), NIL);
        }
    }

    #[test]
    fn lookup_insert_then_get_same_offset() {
        let mut heap = heap();
        let obj = HObject::new_empty(&mut heap);
        let key = HString::new(&mut heap, Tenure::New, b"name");

        let inserted = HObject::lookup_property(Some(&mut heap), obj, key, true);
        assert_ne!(inserted, 0);
        let found = HObject::lookup_property(Some(&mut heap), obj, key, false);
        assert_eq!(inserted, found);

        // A content-equal but distinct string hits the same slot.
        let key2 = HString::new(&mut heap, Tenure::New, b"name");
        assert_eq!(HObject::lookup_property(None, obj, key2, false), inserted);

        // Missing key without insert is the nil offset token.
        let missing = HString::new(&mut heap, Tenure::New, b"missing");
        assert_eq!(HObject::lookup_property(None, obj, missing, false), 0);
    }

    #[test]
    fn lookup_integer_keys() {
        let mut heap = heap();
        let obj = HObject::new_empty(&mut heap);
        let off = HObject::lookup_property(Some(&mut heap), obj, tag_int(3), true);
        assert_ne!(off, 0);
        unsafe { write_word(HObject::map(obj), off, tag_int(99)) };
        let again = HObject::lookup_property(None, obj, tag_int(3), false);
        assert_eq!(off, again);
        assert_eq!(
            unsafe { read_word(HObject::map(obj), again) },
            tag_int(99)
        );
    }

    #[test]
    fn map_grows_by_replacement() {
        let mut heap = heap();
        let obj = HObject::with_capacity(&mut heap, 4);
        let old_map = HObject::map(obj);
        let mut offsets = Vec::new();
        for i in 0..8 {
            let off = HObject::lookup_property(Some(&mut heap), obj, tag_int(i), true);
            assert_ne!(off, 0, "insert {} failed", i);
            unsafe { write_word(HObject::map(obj), off, tag_int(i * 10)) };
            offsets.push(off);
        }
        assert_ne!(HObject::map(obj), old_map);
        assert!(HMap::size(HObject::map(obj)) > 4);
        for i in 0..8 {
            let off = HObject::lookup_property(None, obj, tag_int(i), false);
            assert_ne!(off, 0);
            assert_eq!(
                unsafe { read_word(HObject::map(obj), off) },
                tag_int(i * 10)
            );
        }
    }

    #[test]
    fn array_length_tracks_inserts_and_shrinks() {
        let mut heap = heap();
        let arr = HArray::with_capacity(&mut heap, 8);
        assert_eq!(HArray::length(arr, false), 0);

        for i in 0..3 {
            let off = HObject::lookup_property(Some(&mut heap), arr, tag_int(i), true);
            unsafe { write_word(HObject::map(arr), off, tag_int(i + 1)) };
        }
        assert_eq!(HArray::length(arr, false), 3);

        // Nil out the last element: shrink walks back over it.
        let off = HObject::lookup_property(Some(&mut heap), arr, tag_int(2), true);
        unsafe { write_word(HObject::map(arr), off, NIL) };
        assert_eq!(HArray::length(arr, true), 2);
        assert_eq!(HArray::length(arr, false), 2);
    }

    #[test]
    fn copy_to_promotes_by_generation() {
        let mut heap = heap();
        let s = HString::new(&mut heap, Tenure::New, b"young");
        // Fresh destination spaces, as the collector would set up.
        let mut new_space = Space::new(1 << 16);
        let mut old_space = Space::new(1 << 16);

        let copied = HValue::copy_to(s, &mut old_space, &mut new_space);
        assert!(new_space.contains(copied));
        assert_eq!(HValue::generation(copied), 1);
        assert_eq!(HString::bytes(copied), b"young");

        // Survive enough cycles and the copy lands in old space.
        let mut addr = copied;
        for _ in 0..MIN_OLD_GENERATION {
            addr = HValue::copy_to(addr, &mut old_space, &mut new_space);
        }
        assert!(old_space.contains(addr));
        assert!(HValue::generation(addr) >= MIN_OLD_GENERATION);
    }

    #[test]
    fn function_binding_sentinel() {
        let mut heap = heap();
        let f = HFunction::new(&mut heap, NIL, 0xBEEF0, 0);
        assert!(!HFunction::is_binding(f));
        let b = HFunction::new_binding(&mut heap, 0xBEEF0, 0);
        assert!(HFunction::is_binding(b));
        assert_eq!(HFunction::code(b), 0xBEEF0);
    }
}
