//! MacroAssembler: the semantic layer over the raw encoder.
//!
//! Owns the calling-convention roles, the 16-byte stack alignment
//! discipline, spill slots, the allocation helpers that call into the
//! precompiled stubs, inline type tests against the tagged representation,
//! and the call-function dispatch with its binding-sentinel check.

pub mod assembler;

pub use assembler::{Assembler, Cond, Label, Operand, Reg, RelocId, RelocKind, RelocSize};

use candor_rt::heap::{tag_int, BINDING_CONTEXT_SENTINEL, NIL};
use candor_rt::utils::round_up;
use candor_rt::{Heap, HeapTag};

use crate::stubs::Stubs;

/// Register roles of the generated-code calling convention, as data. The
/// generator and stubs refer to roles, never to raw registers.
#[derive(Debug, Clone, Copy)]
pub struct CallConv {
    /// Parent context on entry; current context in the body.
    pub context: Reg,
    /// Tagged argument count on entry.
    pub argc: Reg,
    /// Expression results and return values.
    pub result: Reg,
    /// Root context, live across the whole activation.
    pub root: Reg,
    /// Secondary operand register (callee-saved).
    pub secondary: Reg,
    /// Clobbered freely between calls; never live across one.
    pub scratch: Reg,
}

pub const CONV: CallConv = CallConv {
    context: Reg::Rdi,
    argc: Reg::Rsi,
    result: Reg::Rax,
    root: Reg::R15,
    secondary: Reg::Rbx,
    scratch: Reg::R11,
};

/// A claimed spill slot. Acquire with [`Masm::spill`], release in LIFO
/// order with [`Masm::release`].
pub struct Spill {
    index: u32,
    reg: Reg,
}

/// How the allocation helpers receive the payload size.
pub enum AllocSize {
    /// Known at code-generation time (bytes, header not included).
    Imm(u32),
    /// A register holding a tagged byte count (header not included).
    Reg(Reg),
}

pub struct Masm {
    pub asm: Assembler,
    align: i32,
    spill_index: u32,
    spills: u32,
    spill_offset: u32,
    spill_reloc: Option<RelocId>,
    needs_gc_addr: u64,
    allocate_stub: u64,
    collect_stub: u64,
    call_binding_stub: u64,
}

impl Masm {
    pub fn new(heap: &mut Heap, stubs: &Stubs) -> Masm {
        Masm {
            asm: Assembler::new(),
            align: 0,
            spill_index: 0,
            spills: 0,
            spill_offset: 0,
            spill_reloc: None,
            needs_gc_addr: heap.needs_gc_addr() as u64,
            allocate_stub: stubs.allocate,
            collect_stub: stubs.collect_garbage,
            call_binding_stub: stubs.call_binding,
        }
    }

    pub fn offset(&self) -> u32 {
        self.asm.offset()
    }

    /// Functions start on 16-byte boundaries.
    pub fn align_code(&mut self) {
        self.asm.align_code(16);
    }

    // -- alignment discipline --

    /// Declare `delta` words that surrounding code will push (positive) or
    /// has popped (negative) around the next call.
    pub fn change_align(&mut self, delta: i32) {
        self.align += delta;
    }

    /// Open an alignment scope: pushes one nil filler word when the pending
    /// push count is odd, so the stack is 16-byte aligned at the call
    /// inside. Returns whether a filler was pushed; pass it to
    /// [`Masm::exit_align`].
    pub fn enter_align(&mut self) -> bool {
        if self.align % 2 == 0 {
            return false;
        }
        self.asm.push_imm32(NIL as i32);
        self.align += 1;
        true
    }

    pub fn exit_align(&mut self, pushed: bool) {
        if pushed {
            self.asm.addq_ri(Reg::Rsp, 8);
            self.align -= 1;
        }
    }

    // -- spill slots --

    fn spill_slot(&self, index: u32) -> Operand {
        Operand::new(Reg::Rbp, -((self.spill_offset + 8 * (index + 1)) as i32))
    }

    /// Claim the next spill slot and store `reg` into it.
    pub fn spill(&mut self, reg: Reg) -> Spill {
        let index = self.spill_index;
        self.spill_index += 1;
        if self.spill_index > self.spills {
            self.spills = self.spill_index;
        }
        let slot = self.spill_slot(index);
        self.asm.movq_mr(slot, reg);
        Spill { index, reg }
    }

    pub fn unspill(&mut self, spill: &Spill, dst: Reg) {
        let slot = self.spill_slot(spill.index);
        self.asm.movq_rm(dst, slot);
    }

    pub fn unspill_back(&mut self, spill: &Spill) {
        self.unspill(spill, spill.reg)
    }

    /// Push a spilled value directly from its slot.
    pub fn push_spill(&mut self, spill: &Spill) {
        let slot = self.spill_slot(spill.index);
        self.asm.push_op(slot);
    }

    /// Release the most recently claimed slot.
    pub fn release(&mut self, spill: Spill) {
        debug_assert_eq!(spill.index + 1, self.spill_index, "spill released out of order");
        self.spill_index -= 1;
    }

    /// Reserve the frame: stack slots plus a spill area whose size is
    /// patched by [`Masm::finalize_spills`] once the function's maximum
    /// concurrent spill count is known.
    pub fn allocate_spills(&mut self, stack_slots: u32) {
        self.spill_offset = round_up((stack_slots + 1) * 8, 16);
        self.spills = 0;
        self.spill_index = 0;
        self.asm.subq_ri32(Reg::Rsp, 0);
        let reloc = self
            .asm
            .add_reloc(RelocKind::Value, RelocSize::Long, self.asm.offset() - 4);
        self.spill_reloc = Some(reloc);
    }

    pub fn finalize_spills(&mut self) {
        let reloc = self.spill_reloc.take().expect("no spill area open");
        let total = self.spill_offset + round_up((self.spills + 1) * 8, 16);
        self.asm.set_reloc_target(reloc, total as u64);
    }

    // -- bulk fills --

    /// Store `value` into every word of `[start, end]`. Preserves `start`,
    /// clobbers scratch.
    pub fn fill(&mut self, start: Reg, end: Reg, value: i32) {
        self.asm.push(start);
        self.asm.movq_imm32(CONV.scratch, value);

        let entry = self.asm.label();
        let body = self.asm.label();
        self.asm.jmp(entry);
        self.asm.bind(body);
        self.asm.movq_mr(Operand::new(start, 0), CONV.scratch);
        self.asm.addq_ri(start, 8);
        self.asm.bind(entry);
        self.asm.cmpq_rr(start, end);
        self.asm.jcc(Cond::Le, body);

        self.asm.pop(start);
        self.asm.xorq_rr(CONV.scratch, CONV.scratch);
    }

    /// Nil-fill the whole reserved frame (stack slots and spill area).
    pub fn fill_stack_slots(&mut self) {
        self.asm.movq_rr(Reg::Rax, Reg::Rsp);
        self.asm.movq_rr(Reg::Rbx, Reg::Rbp);
        self.asm.subq_ri(Reg::Rbx, 8);
        self.fill(Reg::Rax, Reg::Rbx, NIL as i32);
        self.asm.xorq_rr(Reg::Rax, Reg::Rax);
        self.asm.xorq_rr(Reg::Rbx, Reg::Rbx);
    }

    // -- GC safepoint --

    /// Load the needs-GC word and call the collector stub when any space
    /// has requested a collection.
    pub fn check_gc(&mut self) {
        self.asm.movq_imm64(CONV.scratch, self.needs_gc_addr);
        self.asm.cmpb_mi(Operand::new(CONV.scratch, 0), 0);
        let done = self.asm.label();
        self.asm.jcc(Cond::Eq, done);
        self.call_addr(self.collect_stub);
        self.asm.bind(done);
    }

    // -- type tests --

    pub fn is_nil(&mut self, reg: Reg, not_nil: Option<Label>, is_nil: Option<Label>) {
        self.asm.cmpq_ri(reg, NIL as i32);
        if let Some(label) = is_nil {
            self.asm.jcc(Cond::Eq, label);
        }
        if let Some(label) = not_nil {
            self.asm.jcc(Cond::Ne, label);
        }
    }

    /// Low bit set means unboxed integer.
    pub fn is_unboxed(&mut self, reg: Reg, not_unboxed: Option<Label>, unboxed: Option<Label>) {
        self.asm.testb_ri(reg, 0x01);
        if let Some(label) = not_unboxed {
            self.asm.jcc(Cond::Eq, label);
        }
        if let Some(label) = unboxed {
            self.asm.jcc(Cond::Ne, label);
        }
    }

    pub fn is_heap_object(
        &mut self,
        tag: HeapTag,
        reg: Reg,
        mismatch: Option<Label>,
        matched: Option<Label>,
    ) {
        self.asm.cmpb_mi(Operand::new(reg, 0), tag as u8);
        if let Some(label) = mismatch {
            self.asm.jcc(Cond::Ne, label);
        }
        if let Some(label) = matched {
            self.asm.jcc(Cond::Eq, label);
        }
    }

    /// `reg` is known to hold a boolean object; branch on its payload.
    pub fn is_true(&mut self, reg: Reg, is_false: Option<Label>, is_true: Option<Label>) {
        self.asm.cmpb_mi(Operand::new(reg, 8), 0);
        if let Some(label) = is_false {
            self.asm.jcc(Cond::Eq, label);
        }
        if let Some(label) = is_true {
            self.asm.jcc(Cond::Ne, label);
        }
    }

    // -- calls --

    /// Call an absolute address through scratch.
    pub fn call_addr(&mut self, addr: u64) {
        self.asm.movq_imm64(CONV.scratch, addr);
        self.asm.callq_r(CONV.scratch);
    }

    /// Call a function object held in `fn_reg` with `argc` stack arguments
    /// already pushed: loads the callee's parent context, tagged argument
    /// count, and root context, then dispatches either to its code address
    /// or — when the parent is the binding sentinel — to the binding
    /// trampoline stub.
    pub fn call_function(&mut self, fn_reg: Reg, argc: u32) {
        debug_assert!(fn_reg != CONV.context && fn_reg != CONV.argc && fn_reg != CONV.root);

        let binding = self.asm.label();
        let done = self.asm.label();

        self.asm.movq_rm(CONV.context, Operand::new(fn_reg, 8));
        self.asm.movq_imm32(CONV.argc, tag_int(argc as i64) as i32);
        self.asm.movq_rm(CONV.root, Operand::new(fn_reg, 24));

        self.asm.cmpq_ri(CONV.context, BINDING_CONTEXT_SENTINEL as i32);
        self.asm.jcc(Cond::Eq, binding);

        self.asm.callq_m(Operand::new(fn_reg, 16));
        self.asm.jmp(done);

        self.asm.bind(binding);
        self.asm.push(CONV.argc);
        self.asm.push(fn_reg);
        self.call_addr(self.call_binding_stub);

        self.asm.bind(done);
    }

    // -- allocation helpers --

    /// Allocate a tagged object through the allocate stub: pushes the total
    /// size and the tag (both tagged) and leaves the new object in
    /// `result`. The stub unwinds the two arguments.
    pub fn allocate(&mut self, tag: HeapTag, size: AllocSize, result: Reg) {
        let rax_s = self.spill(Reg::Rax);

        self.change_align(2);
        let pad = self.enter_align();

        match size {
            AllocSize::Imm(bytes) => {
                self.asm
                    .movq_imm64(Reg::Rax, tag_int(bytes as i64 + 8));
            }
            AllocSize::Reg(reg) => {
                if reg != Reg::Rax {
                    self.asm.movq_rr(Reg::Rax, reg);
                }
                self.asm.sarq_ri(Reg::Rax, 1);
                self.asm.addq_ri(Reg::Rax, 8);
                self.asm.shlq_ri(Reg::Rax, 1);
                self.asm.orq_ri(Reg::Rax, 1);
            }
        }
        self.asm.push(Reg::Rax);
        self.asm.movq_imm32(Reg::Rax, tag_int(tag as i64) as i32);
        self.asm.push(Reg::Rax);

        self.call_addr(self.allocate_stub);

        self.exit_align(pad);
        self.change_align(-2);

        if result != Reg::Rax {
            self.asm.movq_rr(result, Reg::Rax);
            self.unspill_back(&rax_s);
        }
        self.release(rax_s);
    }

    /// Allocate this function's context: parent from the context register,
    /// `slots` nil-filled slots, and swap it in as the current context.
    pub fn allocate_context(&mut self, slots: u32) {
        let rax_s = self.spill(Reg::Rax);

        self.allocate(HeapTag::Context, AllocSize::Imm(8 * (slots + 2)), Reg::Rax);

        self.asm.movq_mr(Operand::new(Reg::Rax, 8), CONV.context);
        self.asm.movq_mi32(Operand::new(Reg::Rax, 16), slots as i32);
        for i in 0..slots {
            self.asm
                .movq_mi32(Operand::new(Reg::Rax, 24 + 8 * i as i32), NIL as i32);
        }

        self.asm.movq_rr(CONV.context, Reg::Rax);
        self.unspill_back(&rax_s);
        self.release(rax_s);

        self.check_gc();
    }

    /// Allocate a function object: parent = current context, code address
    /// from `addr_reg`, root from the root register.
    pub fn allocate_function(&mut self, addr_reg: Reg, result: Reg) {
        self.allocate(HeapTag::Function, AllocSize::Imm(24), result);

        self.asm.movq_mr(Operand::new(result, 8), CONV.context);
        self.asm.movq_mr(Operand::new(result, 16), addr_reg);
        self.asm.movq_mr(Operand::new(result, 24), CONV.root);
        self.asm.xorq_rr(addr_reg, addr_reg);

        self.check_gc();
    }

    /// Allocate an object or array literal: `size_reg` holds the tagged map
    /// capacity (a power of two). Leaves the object in `result` with its
    /// mask set and a nil-filled map installed.
    pub fn allocate_object_literal(&mut self, tag: HeapTag, size_reg: Reg, result: Reg) {
        debug_assert!(tag == HeapTag::Object || tag == HeapTag::Array);
        self.allocate(
            tag,
            AllocSize::Imm(if tag == HeapTag::Array { 24 } else { 16 }),
            result,
        );

        // mask = (capacity - 1) << 3
        self.asm.movq_rr(CONV.scratch, size_reg);
        self.asm.sarq_ri(CONV.scratch, 1);
        self.asm.decq(CONV.scratch);
        self.asm.shlq_ri(CONV.scratch, 3);
        self.asm.movq_mr(Operand::new(result, 8), CONV.scratch);
        self.asm.xorq_rr(CONV.scratch, CONV.scratch);

        // Map payload: size word plus capacity key/value pairs, passed as a
        // tagged byte count.
        let size_s = self.spill(size_reg);
        self.asm.sarq_ri(size_reg, 1);
        self.asm.shlq_ri(size_reg, 4);
        self.asm.addq_ri(size_reg, 8);
        self.asm.shlq_ri(size_reg, 1);
        self.asm.orq_ri(size_reg, 1);

        self.allocate(HeapTag::Map, AllocSize::Reg(size_reg), CONV.scratch);
        self.asm.movq_mr(Operand::new(result, 16), CONV.scratch);

        self.unspill(&size_s, size_reg);
        let result_s = self.spill(result);
        self.asm.movq_rr(result, CONV.scratch);

        // Record the map's capacity, then nil-fill both slot halves.
        self.asm.sarq_ri(size_reg, 1);
        self.asm.movq_mr(Operand::new(result, 8), size_reg);
        self.asm.shlq_ri(size_reg, 4);
        self.asm.addq_ri(result, 16);
        self.asm.addq_rr(size_reg, result);
        self.asm.subq_ri(size_reg, 8);
        self.fill(result, size_reg, NIL as i32);

        self.unspill_back(&result_s);
        self.release(result_s);
        self.unspill(&size_s, size_reg);
        self.release(size_s);

        if tag == HeapTag::Array {
            self.asm
                .movq_mi32(Operand::new(result, 24), tag_int(0) as i32);
        }

        self.check_gc();
    }
}
