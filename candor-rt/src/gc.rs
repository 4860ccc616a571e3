//! The copying collector.
//!
//! Roots are the external reference table plus a conservative scan of the
//! generated-code stack between the collection entry `rsp` and the
//! `last_stack` watermark recorded by the entry trampoline. Register
//! contents participate because the collect-garbage stub saves every general
//! register into that stack range before calling in and reloads the
//! (possibly rewritten) values afterwards.
//!
//! Live objects are copied into fresh to-spaces — new or old according to
//! their incremented generation — their old headers are overwritten with
//! forwarding words, and interior references are traced with an explicit
//! grey queue. At the end the to-spaces are swapped in wholesale.

use log::debug;

use crate::heap::{is_unboxed, Header, Heap, HeapTag, RefKind, Space, Tenure, NIL};
use crate::value::{HContext, HFunction, HMap, HObject, HValue};

struct Collector {
    to_new: Space,
    to_old: Space,
    grey: Vec<u64>,
}

/// Run a full collection of both spaces. `stack_top` is the lowest address
/// of the generated-code stack range to scan (0 when no generated code is on
/// the stack, e.g. a host-triggered collection).
pub fn collect(heap: &mut Heap, stack_top: u64) {
    let page_size = heap.space(Tenure::New).page_size();
    let before = heap.space(Tenure::New).size() + heap.space(Tenure::Old).size();

    let mut collector = Collector {
        to_new: Space::new(page_size),
        to_old: Space::new(page_size),
        grey: Vec::new(),
    };

    // Detach the reference tables so the heap can be read immutably while
    // slots are rewritten.
    let mut references = std::mem::take(heap.references_mut());
    let mut weak_refs = std::mem::take(heap.weak_refs_mut());

    // Conservative stack roots.
    if stack_top != 0 && heap.last_stack() > stack_top {
        let mut addr = stack_top;
        while addr < heap.last_stack() {
            collector.forward_slot(heap, addr as *mut u64);
            addr += 8;
        }
    }

    // Strong external references.
    for reference in references.iter_mut() {
        if reference.kind != RefKind::Weak {
            collector.forward_slot(heap, reference.slot);
            reference.value = unsafe { *reference.slot };
        }
    }

    collector.process_grey(heap);

    // Weak references: follow moves, invoke callbacks for the dead.
    weak_refs.retain(|weak| {
        if !crate::heap::is_heap_ref(weak.value) {
            return false;
        }
        match unsafe { Header::read(weak.value) } {
            Some(Header::Forwarded(_)) => true,
            _ => {
                (weak.callback)(weak.value);
                false
            }
        }
    });
    for weak in weak_refs.iter_mut() {
        if let Some(Header::Forwarded(new_addr)) = unsafe { Header::read(weak.value) } {
            weak.value = new_addr;
        }
    }
    // Weak-kind slots in the reference table: rewrite or nil out.
    for reference in references.iter_mut() {
        if reference.kind == RefKind::Weak {
            let word = unsafe { *reference.slot };
            if !crate::heap::is_heap_ref(word) {
                continue;
            }
            let new_word = match unsafe { Header::read(word) } {
                Some(Header::Forwarded(new_addr)) => new_addr,
                _ => NIL,
            };
            unsafe { *reference.slot = new_word };
            reference.value = new_word;
        }
    }

    *heap.references_mut() = references;
    *heap.weak_refs_mut() = weak_refs;

    let (new_space, old_space) = heap.spaces_mut();
    new_space.swap(&mut collector.to_new);
    old_space.swap(&mut collector.to_old);
    heap.set_needs_gc(0);

    let after = heap.space(Tenure::New).size() + heap.space(Tenure::Old).size();
    debug!("gc: {} -> {} bytes of pages", before, after);
}

impl Collector {
    /// If `*slot` references a live from-space object, copy it and rewrite
    /// the slot; if it references an already-moved object, just rewrite.
    /// Anything else (nil, unboxed integers, code addresses, non-header
    /// words) is left alone.
    fn forward_slot(&mut self, heap: &Heap, slot: *mut u64) {
        let word = unsafe { *slot };
        if word == NIL || is_unboxed(word) || !heap.contains(word) {
            return;
        }

        match unsafe { Header::read(word) } {
            Some(Header::Forwarded(new_addr)) => {
                // Only trust forwarding words that point into our to-spaces;
                // a conservative scan can hit arbitrary bit patterns.
                if self.to_new.contains(new_addr) || self.to_old.contains(new_addr) {
                    unsafe { *slot = new_addr };
                }
            }
            Some(Header::Live { .. }) => {
                let size = match HValue::size_of(word) {
                    Some(size) => size,
                    None => return,
                };
                // Reject "objects" whose claimed extent escapes the page.
                match heap.page_top(word) {
                    Some(top) if word + size as u64 <= top => {}
                    _ => return,
                }
                let new_addr = HValue::copy_to(word, &mut self.to_old, &mut self.to_new);
                unsafe {
                    Header::Forwarded(new_addr).write(word);
                    *slot = new_addr;
                }
                self.grey.push(new_addr);
            }
            None => {}
        }
    }

    /// Trace the interior reference slots of every copied object.
    fn process_grey(&mut self, heap: &Heap) {
        while let Some(addr) = self.grey.pop() {
            match HValue::tag_of(addr) {
                HeapTag::Context => {
                    self.forward_slot(heap, (addr + HContext::PARENT_OFFSET) as *mut u64);
                    for i in 0..HContext::slots(addr) as u32 {
                        self.forward_slot(heap, HContext::slot_addr(addr, i));
                    }
                }
                HeapTag::Function => {
                    // The binding sentinel and the code address are not heap
                    // references; forward_slot rejects them, and the parent
                    // and root slots are real references.
                    self.forward_slot(heap, (addr + HFunction::PARENT_OFFSET) as *mut u64);
                    self.forward_slot(heap, (addr + HFunction::ROOT_OFFSET) as *mut u64);
                }
                HeapTag::Object | HeapTag::Array => {
                    self.forward_slot(heap, (addr + HObject::MAP_OFFSET) as *mut u64);
                }
                HeapTag::Map => {
                    let capacity = HMap::size(addr) as u32;
                    for i in 0..capacity {
                        self.forward_slot(heap, HMap::key_slot_addr(addr, i));
                        self.forward_slot(heap, HMap::value_slot_addr(addr, capacity, i));
                    }
                }
                _ => {}
            }
        }
    }
}
