//! Two-space page heap and the tagged-pointer encoding.
//!
//! Every runtime value is one machine word. Low bit set means an unboxed
//! 63-bit integer; an all-zero word is nil; anything else is a pointer to a
//! heap object whose first header byte is a [`HeapTag`]. Objects live in one
//! of two spaces — `new` for fresh allocations, `old` for tenured data — and
//! each space is an ordered list of bump-allocated pages.

use std::alloc::{alloc_zeroed, dealloc, Layout};

// ---------------------------------------------------------------------------
// Tags and tagged-word helpers
// ---------------------------------------------------------------------------

/// Heap object tags. The numeric values are ABI: generated code compares
/// against them with byte immediates, and embedders may persist them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum HeapTag {
    Nil = 0x00,
    Function = 0x01,
    Context = 0x02,
    Number = 0x03,
    String = 0x04,
    Boolean = 0x05,
    Object = 0x06,
    Map = 0x07,
    Array = 0x08,
    CData = 0x09,
    /// Marks executable pages so a stack scan can ignore return addresses.
    Code = 0x90,
}

impl HeapTag {
    pub fn from_byte(byte: u8) -> Option<HeapTag> {
        Some(match byte {
            0x00 => HeapTag::Nil,
            0x01 => HeapTag::Function,
            0x02 => HeapTag::Context,
            0x03 => HeapTag::Number,
            0x04 => HeapTag::String,
            0x05 => HeapTag::Boolean,
            0x06 => HeapTag::Object,
            0x07 => HeapTag::Map,
            0x08 => HeapTag::Array,
            0x09 => HeapTag::CData,
            0x90 => HeapTag::Code,
            _ => return None,
        })
    }
}

/// The nil word.
pub const NIL: u64 = 0;

/// Parent-context sentinel that marks a function object as a native binding.
pub const BINDING_CONTEXT_SENTINEL: u64 = 0x0DEC_0DEC;

/// GC cycles an object must survive before promotion to old space.
pub const MIN_OLD_GENERATION: u8 = 5;

/// Bits of the needs-GC word.
pub const GC_FLAG_NEW_SPACE: u64 = 1;
pub const GC_FLAG_OLD_SPACE: u64 = 2;

/// Box a small integer into a tagged word.
#[inline]
pub fn tag_int(value: i64) -> u64 {
    (value.wrapping_shl(1) | 1) as u64
}

/// Recover the integer from a tagged word (arithmetic shift keeps the sign).
#[inline]
pub fn untag_int(word: u64) -> i64 {
    (word as i64) >> 1
}

/// Low bit set means unboxed integer.
#[inline]
pub fn is_unboxed(word: u64) -> bool {
    word & 1 == 1
}

/// A non-nil, non-integer word is a heap reference.
#[inline]
pub fn is_heap_ref(word: u64) -> bool {
    word != NIL && !is_unboxed(word)
}

// ---------------------------------------------------------------------------
// Object header
// ---------------------------------------------------------------------------

/// The 8-byte header word at the start of every heap object, as a checkable
/// tagged union. A live header packs the tag in byte 0 and the generation
/// counter in byte 1 and is therefore always below `0x10000`; a forwarded
/// header stores the relocated address with the low bit set, and addresses
/// are always far above `0x10000`. The two invariants back each other up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Header {
    Live { tag: HeapTag, generation: u8 },
    Forwarded(u64),
}

impl Header {
    pub fn pack(self) -> u64 {
        match self {
            Header::Live { tag, generation } => ((generation as u64) << 8) | tag as u64,
            Header::Forwarded(addr) => {
                debug_assert!(addr & 1 == 0 && addr > 0xFFFF);
                addr | 1
            }
        }
    }

    /// Decode a header word. Returns `None` for words that are neither a
    /// valid live header nor a plausible forwarding word; the conservative
    /// stack scan relies on that rejection.
    pub fn unpack(word: u64) -> Option<Header> {
        if word > 0xFFFF {
            if word & 1 == 1 {
                return Some(Header::Forwarded(word & !1));
            }
            return None;
        }
        let tag = HeapTag::from_byte(word as u8)?;
        Some(Header::Live {
            tag,
            generation: (word >> 8) as u8,
        })
    }

    /// Read the header of the object at `addr`.
    ///
    /// # Safety
    /// `addr` must point at a heap object header.
    pub unsafe fn read(addr: u64) -> Option<Header> {
        Header::unpack(*(addr as *const u64))
    }

    /// Overwrite the header of the object at `addr`.
    ///
    /// # Safety
    /// `addr` must point at a heap object header.
    pub unsafe fn write(self, addr: u64) {
        *(addr as *mut u64) = self.pack();
    }
}

// ---------------------------------------------------------------------------
// Pages and spaces
// ---------------------------------------------------------------------------

/// One contiguous allocation buffer with a bump pointer.
pub struct Page {
    data: *mut u8,
    top: *mut u8,
    limit: *mut u8,
    size: u32,
}

impl Page {
    fn new(size: u32) -> Page {
        let layout = Layout::from_size_align(size as usize, 16).expect("page layout");
        // Zero-filled so untouched slots read as nil.
        let data = unsafe { alloc_zeroed(layout) };
        assert!(!data.is_null(), "out of memory allocating heap page");
        Page {
            data,
            top: data,
            limit: unsafe { data.add(size as usize) },
            size,
        }
    }

    fn available(&self) -> usize {
        self.limit as usize - self.top as usize
    }

    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.data as u64 && addr < self.top as u64
    }
}

impl Drop for Page {
    fn drop(&mut self) {
        let layout = Layout::from_size_align(self.size as usize, 16).expect("page layout");
        unsafe { dealloc(self.data, layout) };
    }
}

/// Which space an allocation targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tenure {
    New,
    Old,
}

/// An ordered list of pages with one of them selected for bump allocation.
pub struct Space {
    pages: Vec<Page>,
    current: usize,
    page_size: u32,
    size: u32,
    size_limit: u32,
    pending_gc: bool,
}

impl Space {
    pub fn new(page_size: u32) -> Space {
        let mut space = Space {
            pages: vec![Page::new(page_size)],
            current: 0,
            page_size,
            size: page_size,
            size_limit: 0,
            pending_gc: false,
        };
        space.compute_size_limit();
        space
    }

    fn compute_size_limit(&mut self) {
        self.size_limit = self.size << 1;
    }

    fn add_page(&mut self, at_least: u32) {
        let real_size = crate::utils::round_up(at_least, self.page_size);
        self.pages.push(Page::new(real_size));
        self.current = self.pages.len() - 1;
        self.size += real_size;
    }

    /// Bump-allocate `bytes` (rounded up to an even count so the low bit of
    /// every object address stays clear). Never fails: when no page has a
    /// gap, the space grows and flags that it wants a collection.
    pub fn allocate(&mut self, bytes: u32) -> *mut u8 {
        debug_assert!(bytes != 0);
        let even_bytes = (bytes + (bytes & 1)) as usize;

        if self.pages[self.current].available() < even_bytes {
            // Look for a gap in any page before growing.
            match self.pages.iter().position(|p| p.available() >= even_bytes) {
                Some(index) => self.current = index,
                None => {
                    if self.size > self.size_limit {
                        self.pending_gc = true;
                    }
                    self.add_page(even_bytes as u32);
                }
            }
        }

        let page = &mut self.pages[self.current];
        let result = page.top;
        page.top = unsafe { page.top.add(even_bytes) };
        result
    }

    /// Drop own pages and take all of `other`'s. Used by the collector to
    /// install a freshly copied space.
    pub fn swap(&mut self, other: &mut Space) {
        self.clear();
        self.pages = std::mem::take(&mut other.pages);
        self.size = self.pages.iter().map(|p| p.size).sum();
        other.size = 0;
        if self.pages.is_empty() {
            self.pages.push(Page::new(self.page_size));
            self.size = self.page_size;
        }
        self.current = 0;
        self.compute_size_limit();
    }

    /// Release every page.
    pub fn clear(&mut self) {
        self.pages.clear();
        self.size = 0;
    }

    pub fn contains(&self, addr: u64) -> bool {
        self.pages.iter().any(|p| p.contains(addr))
    }

    /// Allocated extent (bump pointer) of the page holding `addr`, for size
    /// sanity checks during GC.
    pub fn page_top(&self, addr: u64) -> Option<u64> {
        self.pages
            .iter()
            .find(|p| p.contains(addr))
            .map(|p| p.top as u64)
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn page_size(&self) -> u32 {
        self.page_size
    }

    fn take_pending_gc(&mut self) -> bool {
        std::mem::replace(&mut self.pending_gc, false)
    }
}

// ---------------------------------------------------------------------------
// External references
// ---------------------------------------------------------------------------

/// How an external reference participates in collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefKind {
    /// Always a root; the slot is rewritten when the object moves.
    Persistent,
    /// Not a root; nil'd out when the object dies, rewritten when it moves.
    Weak,
    /// A host stack local registered for the duration of a call.
    OnStack,
}

/// An embedder-registered reference: the collector updates `*slot` in place.
pub struct Reference {
    pub kind: RefKind,
    pub slot: *mut u64,
    pub value: u64,
}

/// Callback invoked when a weak-referenced object is collected.
pub type WeakCallback = fn(u64);

pub struct WeakRef {
    pub value: u64,
    pub callback: WeakCallback,
}

// ---------------------------------------------------------------------------
// Heap
// ---------------------------------------------------------------------------

/// The process heap: two spaces plus the state generated code addresses
/// directly (the needs-GC word and the entry-stack watermark).
pub struct Heap {
    new_space: Space,
    old_space: Space,
    needs_gc: u64,
    last_stack: u64,
    pending_exception: u64,
    references: Vec<Reference>,
    weak_refs: Vec<WeakRef>,
}

impl Heap {
    /// The heap is boxed so the addresses baked into generated code stay
    /// valid for its whole life.
    pub fn new(page_size: u32) -> Box<Heap> {
        Box::new(Heap {
            new_space: Space::new(page_size),
            old_space: Space::new(page_size),
            needs_gc: 0,
            last_stack: 0,
            pending_exception: NIL,
            references: Vec::new(),
            weak_refs: Vec::new(),
        })
    }

    pub fn space(&self, tenure: Tenure) -> &Space {
        match tenure {
            Tenure::New => &self.new_space,
            Tenure::Old => &self.old_space,
        }
    }

    pub fn space_mut(&mut self, tenure: Tenure) -> &mut Space {
        match tenure {
            Tenure::New => &mut self.new_space,
            Tenure::Old => &mut self.old_space,
        }
    }

    pub(crate) fn spaces_mut(&mut self) -> (&mut Space, &mut Space) {
        (&mut self.new_space, &mut self.old_space)
    }

    /// Allocate `bytes` of payload plus the 8-byte header and write the
    /// header. Old-tenure objects start at the promotion threshold so the
    /// collector treats them as old immediately.
    pub fn allocate_tagged(&mut self, tag: HeapTag, tenure: Tenure, bytes: u32) -> u64 {
        let addr = self.allocate_raw(tenure, bytes + 8);
        let generation = match tenure {
            Tenure::New => 0,
            Tenure::Old => MIN_OLD_GENERATION,
        };
        unsafe { Header::Live { tag, generation }.write(addr) };
        addr
    }

    /// Allocate `total_bytes` (header included) without writing a header.
    /// The allocate stub uses this and writes the header itself.
    pub fn allocate_raw(&mut self, tenure: Tenure, total_bytes: u32) -> u64 {
        let flag = match tenure {
            Tenure::New => GC_FLAG_NEW_SPACE,
            Tenure::Old => GC_FLAG_OLD_SPACE,
        };
        let space = self.space_mut(tenure);
        let ptr = space.allocate(total_bytes) as u64;
        if self.space_mut(tenure).take_pending_gc() {
            self.needs_gc |= flag;
        }
        debug_assert!(ptr & 1 == 0);
        ptr
    }

    /// True when `addr` lies inside an owned heap page.
    pub fn contains(&self, addr: u64) -> bool {
        self.new_space.contains(addr) || self.old_space.contains(addr)
    }

    /// Allocated extent of the page holding `addr`, across both spaces.
    pub fn page_top(&self, addr: u64) -> Option<u64> {
        self.new_space
            .page_top(addr)
            .or_else(|| self.old_space.page_top(addr))
    }

    // -- state addressable from generated code --

    pub fn needs_gc(&self) -> u64 {
        self.needs_gc
    }

    pub fn set_needs_gc(&mut self, value: u64) {
        self.needs_gc = value;
    }

    pub fn needs_gc_addr(&mut self) -> *mut u64 {
        &mut self.needs_gc
    }

    pub fn last_stack(&self) -> u64 {
        self.last_stack
    }

    pub fn last_stack_addr(&mut self) -> *mut u64 {
        &mut self.last_stack
    }

    pub fn pending_exception(&self) -> u64 {
        self.pending_exception
    }

    pub fn set_pending_exception(&mut self, value: u64) {
        self.pending_exception = value;
    }

    // -- external references --

    /// Register an external reference. The collector reads `*slot` and
    /// rewrites it when the referenced object moves.
    pub fn reference(&mut self, kind: RefKind, slot: *mut u64, value: u64) {
        self.references.push(Reference { kind, slot, value });
    }

    /// Remove the most recently registered reference for `slot`.
    pub fn dereference(&mut self, slot: *mut u64) {
        if let Some(pos) = self.references.iter().rposition(|r| r.slot == slot) {
            self.references.remove(pos);
        }
    }

    pub fn add_weak(&mut self, value: u64, callback: WeakCallback) {
        self.weak_refs.push(WeakRef { value, callback });
    }

    pub fn remove_weak(&mut self, value: u64) {
        self.weak_refs.retain(|w| w.value != value);
    }

    pub(crate) fn references_mut(&mut self) -> &mut Vec<Reference> {
        &mut self.references
    }

    pub(crate) fn weak_refs_mut(&mut self) -> &mut Vec<WeakRef> {
        &mut self.weak_refs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tagging_round_trips() {
        for v in [0i64, 1, -1, 42, -42, (1 << 62) - 1, -(1 << 62)] {
            let w = tag_int(v);
            assert!(is_unboxed(w));
            assert_eq!(untag_int(w), v);
        }
        assert!(!is_unboxed(NIL));
        assert!(!is_heap_ref(NIL));
    }

    #[test]
    fn header_pack_unpack() {
        let live = Header::Live {
            tag: HeapTag::String,
            generation: 3,
        };
        assert_eq!(Header::unpack(live.pack()), Some(live));

        let fwd = Header::Forwarded(0x7f00_1234_5670);
        assert_eq!(Header::unpack(fwd.pack()), Some(fwd));

        // An even word above 64K is neither live nor forwarded.
        assert_eq!(Header::unpack(0x7f00_1234_5670), None);
        // An in-range word with a bogus tag byte is rejected.
        assert_eq!(Header::unpack(0x0042), None);
    }

    #[test]
    fn space_allocates_within_pages() {
        let mut space = Space::new(4096);
        let ptr = space.allocate(24) as u64;
        assert!(space.contains(ptr));
        assert!(ptr & 1 == 0);
        // The bump pointer moved past the allocation.
        let next = space.allocate(8) as u64;
        assert!(next >= ptr + 24);
    }

    #[test]
    fn space_rounds_to_even() {
        let mut space = Space::new(4096);
        let a = space.allocate(9) as u64;
        let b = space.allocate(8) as u64;
        assert_eq!(b - a, 10);
    }

    #[test]
    fn space_grows_and_requests_gc() {
        let mut heap = Heap::new(256);
        // Exhaust well past the size limit (2x initial page).
        for _ in 0..16 {
            heap.allocate_tagged(HeapTag::CData, Tenure::New, 248);
        }
        assert!(heap.needs_gc() & GC_FLAG_NEW_SPACE != 0);
        assert!(heap.needs_gc() & GC_FLAG_OLD_SPACE == 0);
    }

    #[test]
    fn allocate_tagged_writes_header() {
        let mut heap = Heap::new(4096);
        let addr = heap.allocate_tagged(HeapTag::String, Tenure::New, 24);
        match unsafe { Header::read(addr) } {
            Some(Header::Live { tag, generation }) => {
                assert_eq!(tag, HeapTag::String);
                assert_eq!(generation, 0);
            }
            other => panic!("unexpected header {:?}", other),
        }

        let old = heap.allocate_tagged(HeapTag::Context, Tenure::Old, 16);
        match unsafe { Header::read(old) } {
            Some(Header::Live { generation, .. }) => {
                assert!(generation >= MIN_OLD_GENERATION);
            }
            other => panic!("unexpected header {:?}", other),
        }
    }

    #[test]
    fn swap_takes_pages() {
        let mut a = Space::new(4096);
        let mut b = Space::new(4096);
        let ptr = b.allocate(32) as u64;
        a.swap(&mut b);
        assert!(a.contains(ptr));
        assert!(!b.contains(ptr));
    }

    #[test]
    fn references_register_and_remove() {
        let mut heap = Heap::new(4096);
        let mut slot: u64 = 0x1234;
        heap.reference(RefKind::Persistent, &mut slot, slot);
        assert_eq!(heap.references.len(), 1);
        heap.dereference(&mut slot);
        assert!(heap.references.is_empty());
    }
}
