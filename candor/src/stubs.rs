//! Precompiled stubs: the bridge between generated code and the runtime.
//!
//! Each stub is a small code fragment with a fixed register contract,
//! generated once at startup into the code space. A stub saves the
//! registers generated code keeps live, aligns the stack, and calls exactly
//! one `extern "C"` helper from `candor-rt` with the heap address baked in
//! as an immediate. The entry trampoline and the binding trampoline are the
//! two special shapes; everything else follows the same save/call/restore
//! pattern.

use candor_rt::runtime::{self, BinaryOp, BINARY_OPS};
use candor_rt::Heap;

use crate::codespace::CodeSpace;
use crate::masm::{Assembler, Operand, Reg};

/// Addresses of every generated stub.
pub struct Stubs {
    pub allocate: u64,
    pub collect_garbage: u64,
    pub lookup_property: u64,
    pub coerce_to_boolean: u64,
    pub call_binding: u64,
    pub type_of: u64,
    pub size_of: u64,
    pub keys_of: u64,
    pub clone_object: u64,
    pub binary: [u64; BINARY_OPS.len()],
    /// Host-to-generated-code trampoline:
    /// `fn(code, parent, tagged_argc, root) -> result`.
    pub entry: u64,
}

/// Caller-visible registers a stub must preserve. The root register and the
/// secondary operand register are callee-saved in the host ABI already.
const SAVED: [Reg; 8] = [
    Reg::Rcx,
    Reg::Rdx,
    Reg::Rsi,
    Reg::Rdi,
    Reg::R8,
    Reg::R9,
    Reg::R10,
    Reg::R11,
];

/// Every general register, for the collector stub: their saved values are
/// inside the scanned stack range, so moved objects are rewritten before
/// the registers are reloaded.
const ALL_GP: [Reg; 14] = [
    Reg::Rax,
    Reg::Rbx,
    Reg::Rcx,
    Reg::Rdx,
    Reg::Rsi,
    Reg::Rdi,
    Reg::R8,
    Reg::R9,
    Reg::R10,
    Reg::R11,
    Reg::R12,
    Reg::R13,
    Reg::R14,
    Reg::R15,
];

impl Stubs {
    pub fn generate(heap: &mut Heap, space: &mut CodeSpace) -> Stubs {
        let heap_addr = heap as *mut Heap as u64;
        let last_stack_addr = heap.last_stack_addr() as u64;

        let mut binary = [0u64; BINARY_OPS.len()];
        for (i, &op) in BINARY_OPS.iter().enumerate() {
            binary[i] = space.add(binary_stub(heap_addr, op));
        }

        Stubs {
            allocate: space.add(allocate_stub(heap_addr)),
            collect_garbage: space.add(collect_stub(heap_addr)),
            lookup_property: space.add(lookup_stub(heap_addr)),
            coerce_to_boolean: space.add(value_with_root_stub(
                heap_addr,
                runtime::rt_coerce_to_boolean as usize as u64,
            )),
            call_binding: space.add(call_binding_stub(heap_addr)),
            type_of: space.add(value_with_root_stub(
                heap_addr,
                runtime::rt_typeof as usize as u64,
            )),
            size_of: space.add(value_stub(heap_addr, runtime::rt_sizeof as usize as u64)),
            keys_of: space.add(value_stub(heap_addr, runtime::rt_keysof as usize as u64)),
            clone_object: space.add(value_stub(
                heap_addr,
                runtime::rt_clone_object as usize as u64,
            )),
            binary,
            entry: space.add(entry_stub(last_stack_addr)),
        }
    }

    pub fn binary_stub(&self, op: BinaryOp) -> u64 {
        let index = BINARY_OPS.iter().position(|&o| o == op).unwrap();
        self.binary[index]
    }

    /// Zeroed addresses for unit tests that only inspect emitted bytes.
    #[cfg(test)]
    pub(crate) fn placeholder() -> Stubs {
        Stubs {
            allocate: 0,
            collect_garbage: 0,
            lookup_property: 0,
            coerce_to_boolean: 0,
            call_binding: 0,
            type_of: 0,
            size_of: 0,
            keys_of: 0,
            clone_object: 0,
            binary: [0; BINARY_OPS.len()],
            entry: 0,
        }
    }
}

/// Save the caller-visible set plus one filler word so the helper call is
/// 16-byte aligned (the stub is entered with `rsp ≡ 8 mod 16`).
fn emit_saves(asm: &mut Assembler) {
    asm.push(Reg::Rax);
    for reg in SAVED {
        asm.push(reg);
    }
}

fn emit_restores(asm: &mut Assembler) {
    for reg in SAVED.iter().rev() {
        asm.pop(*reg);
    }
    asm.addq_ri(Reg::Rsp, 8);
}

/// Byte offset of the `index`-th stack argument (0 = pushed last) after
/// `emit_saves` ran.
fn stack_arg_disp(index: i32) -> i32 {
    // 9 saved words plus the return address.
    (9 + 1 + index) * 8
}

fn call_helper(asm: &mut Assembler, helper: u64) {
    asm.movq_imm64(Reg::Rax, helper);
    asm.callq_r(Reg::Rax);
}

/// Allocate: tag and size (both tagged) on the stack, result in rax. The
/// stub unwinds its two arguments.
fn allocate_stub(heap_addr: u64) -> Assembler {
    let mut asm = Assembler::new();
    emit_saves(&mut asm);
    asm.movq_imm64(Reg::Rdi, heap_addr);
    asm.movq_rm(Reg::Rsi, Operand::new(Reg::Rsp, stack_arg_disp(0))); // tag
    asm.movq_rm(Reg::Rdx, Operand::new(Reg::Rsp, stack_arg_disp(1))); // size
    call_helper(&mut asm, runtime::rt_allocate as usize as u64);
    emit_restores(&mut asm);
    asm.ret_imm16(16);
    asm
}

/// CollectGarbage: saves every general register, hands the collector the
/// stack top covering them, and reloads the possibly-rewritten values.
fn collect_stub(heap_addr: u64) -> Assembler {
    let mut asm = Assembler::new();
    for reg in ALL_GP {
        asm.push(reg);
    }
    asm.push(Reg::Rax); // filler: 15 pushes align the helper call

    asm.movq_imm64(Reg::Rdi, heap_addr);
    asm.movq_rr(Reg::Rsi, Reg::Rsp);
    call_helper(&mut asm, runtime::rt_collect_garbage as usize as u64);

    asm.addq_ri(Reg::Rsp, 8);
    for reg in ALL_GP.iter().rev() {
        asm.pop(*reg);
    }
    asm.ret();
    asm
}

/// LookupProperty: object in rax, key in rbx, insert flag in rcx; the value
/// slot's byte offset (or the nil token) in rax.
fn lookup_stub(heap_addr: u64) -> Assembler {
    let mut asm = Assembler::new();
    emit_saves(&mut asm);
    asm.movq_rr(Reg::Rdx, Reg::Rbx); // key — before rdi/rsi are loaded
    asm.movq_rr(Reg::Rsi, Reg::Rax); // object
    asm.movq_imm64(Reg::Rdi, heap_addr);
    // rcx already holds the insert flag, which is the fourth argument.
    call_helper(&mut asm, runtime::rt_lookup_property as usize as u64);
    emit_restores(&mut asm);
    asm.ret();
    asm
}

/// Shape shared by CoerceToBoolean, Typeof, and the binary operators'
/// single-value cousins: helper(heap, root, value-in-rax).
fn value_with_root_stub(heap_addr: u64, helper: u64) -> Assembler {
    let mut asm = Assembler::new();
    emit_saves(&mut asm);
    asm.movq_rr(Reg::Rdx, Reg::Rax);
    asm.movq_rr(Reg::Rsi, Reg::R15);
    asm.movq_imm64(Reg::Rdi, heap_addr);
    call_helper(&mut asm, helper);
    emit_restores(&mut asm);
    asm.ret();
    asm
}

/// Shape for Sizeof, Keysof, CloneObject: helper(heap, value-in-rax).
fn value_stub(heap_addr: u64, helper: u64) -> Assembler {
    let mut asm = Assembler::new();
    emit_saves(&mut asm);
    asm.movq_rr(Reg::Rsi, Reg::Rax);
    asm.movq_imm64(Reg::Rdi, heap_addr);
    call_helper(&mut asm, helper);
    emit_restores(&mut asm);
    asm.ret();
    asm
}

/// Binary<Op>: lhs in rax, rhs in rbx, result in rax.
fn binary_stub(heap_addr: u64, op: BinaryOp) -> Assembler {
    let mut asm = Assembler::new();
    emit_saves(&mut asm);
    asm.movq_rr(Reg::Rcx, Reg::Rbx); // rhs
    asm.movq_rr(Reg::Rdx, Reg::Rax); // lhs
    asm.movq_rr(Reg::Rsi, Reg::R15); // root
    asm.movq_imm64(Reg::Rdi, heap_addr);
    call_helper(&mut asm, runtime::binary_helper(op));
    emit_restores(&mut asm);
    asm.ret();
    asm
}

/// CallBinding trampoline. Entered from call-function with the function
/// object and tagged argument count pushed on top of the arguments:
/// `[ret] [fn] [argc] [args…]` — so `rbp+32` is where the argument words
/// begin (arguments are pushed right-to-left, so in order from there).
fn call_binding_stub(heap_addr: u64) -> Assembler {
    let mut asm = Assembler::new();
    asm.push(Reg::Rbp);
    asm.movq_rr(Reg::Rbp, Reg::Rsp);
    asm.andq_ri(Reg::Rsp, -16);

    asm.movq_rm(Reg::Rsi, Operand::new(Reg::Rbp, 24)); // tagged argc
    asm.sarq_ri(Reg::Rsi, 1);
    asm.lea(Reg::Rdx, Operand::new(Reg::Rbp, 32)); // argv
    asm.movq_imm64(Reg::Rdi, heap_addr);
    asm.movq_rm(Reg::Rax, Operand::new(Reg::Rbp, 16)); // function object
    asm.movq_rm(Reg::Rax, Operand::new(Reg::Rax, 16)); // native pointer
    asm.callq_r(Reg::Rax);

    asm.movq_rr(Reg::Rsp, Reg::Rbp);
    asm.pop(Reg::Rbp);
    asm.ret_imm16(16);
    asm
}

/// The host-to-JIT entry trampoline: moves the host-ABI arguments into the
/// generated-code convention, records the stack watermark the collector
/// scans up to, and restores it on the way out.
fn entry_stub(last_stack_addr: u64) -> Assembler {
    let mut asm = Assembler::new();
    asm.push(Reg::Rbp);
    asm.movq_rr(Reg::Rbp, Reg::Rsp);
    asm.push(Reg::Rbx);
    asm.push(Reg::R12);
    asm.push(Reg::R13);
    asm.push(Reg::R14);
    asm.push(Reg::R15);
    asm.push(Reg::Rcx); // filler: keeps the call below 16-byte aligned

    asm.movq_rr(Reg::R15, Reg::Rcx); // root
    asm.movq_rr(Reg::Rax, Reg::Rdi); // code address
    asm.movq_rr(Reg::Rdi, Reg::Rsi); // parent context
    asm.movq_rr(Reg::Rsi, Reg::Rdx); // tagged argc

    asm.movq_imm64(Reg::R11, last_stack_addr);
    asm.movq_rm(Reg::Rbx, Operand::new(Reg::R11, 0));
    asm.movq_mr(Operand::new(Reg::R11, 0), Reg::Rsp);

    asm.callq_r(Reg::Rax);

    asm.movq_imm64(Reg::R11, last_stack_addr);
    asm.movq_mr(Operand::new(Reg::R11, 0), Reg::Rbx);

    asm.pop(Reg::Rcx);
    asm.pop(Reg::R15);
    asm.pop(Reg::R14);
    asm.pop(Reg::R13);
    asm.pop(Reg::R12);
    asm.pop(Reg::Rbx);
    asm.pop(Reg::Rbp);
    asm.ret();
    asm
}

#[cfg(all(test, target_arch = "x86_64"))]
mod tests {
    use super::*;
    use candor_rt::heap::{tag_int, Tenure, NIL};
    use candor_rt::value::{root_index, HBoolean, HContext, HObject, HString, HValue};
    use candor_rt::HeapTag;

    fn setup() -> (Box<Heap>, CodeSpace, Stubs) {
        let mut heap = Heap::new(1 << 16);
        let mut space = CodeSpace::new();
        let stubs = Stubs::generate(&mut heap, &mut space);
        (heap, space, stubs)
    }

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

    /// Drive a stub through a tiny caller that fills the contract registers
    /// and returns rax.
    fn drive(
        space: &mut CodeSpace,
        stub: u64,
        rax: u64,
        rbx: u64,
        rcx: u64,
        r15: u64,
    ) -> u64 {
        let mut asm = Assembler::new();
        // Args arrive as rdi=rax, rsi=rbx, rdx=rcx, rcx=r15.
        asm.push(Reg::Rbx);
        asm.push(Reg::R15);
        asm.push(Reg::Rbp);
        asm.movq_rr(Reg::Rbp, Reg::Rsp);
        asm.movq_rr(Reg::Rax, Reg::Rdi);
        asm.movq_rr(Reg::Rbx, Reg::Rsi);
        asm.movq_rr(Reg::R15, Reg::Rcx);
        asm.movq_rr(Reg::Rcx, Reg::Rdx);
        asm.movq_imm64(Reg::R10, stub);
        asm.callq_r(Reg::R10);
        asm.pop(Reg::Rbp);
        asm.pop(Reg::R15);
        asm.pop(Reg::Rbx);
        asm.ret();
        let base = space.add(asm);
        let f: extern "C" fn(u64, u64, u64, u64) -> u64 = unsafe { std::mem::transmute(base) };
        f(rax, rbx, rcx, r15)
    }

    #[test]
    fn binary_add_stub_adds_integers() {
        let (mut heap, mut space, stubs) = setup();
        let root = build_root(&mut heap);
        let result = drive(
            &mut space,
            stubs.binary_stub(BinaryOp::Add),
            tag_int(40),
            tag_int(2),
            0,
            root,
        );
        assert_eq!(result, tag_int(42));
    }

    #[test]
    fn coerce_stub_returns_root_booleans() {
        let (mut heap, mut space, stubs) = setup();
        let root = build_root(&mut heap);
        let t = drive(&mut space, stubs.coerce_to_boolean, tag_int(3), 0, 0, root);
        assert_eq!(t, HContext::get_slot(root, root_index::TRUE));
        let f = drive(&mut space, stubs.coerce_to_boolean, NIL, 0, 0, root);
        assert_eq!(f, HContext::get_slot(root, root_index::FALSE));
    }

    #[test]
    fn lookup_stub_inserts_and_finds() {
        let (mut heap, mut space, stubs) = setup();
        let root = build_root(&mut heap);
        let obj = HObject::new_empty(&mut heap);

        let inserted = drive(
            &mut space,
            stubs.lookup_property,
            obj,
            tag_int(4),
            1,
            root,
        );
        assert_ne!(inserted, 0);
        let found = drive(&mut space, stubs.lookup_property, obj, tag_int(4), 0, root);
        assert_eq!(inserted, found);
    }

    #[test]
    fn allocate_stub_returns_tagged_object() {
        let (mut heap, mut space, stubs) = setup();
        let root = build_root(&mut heap);

        // A driver that pushes size and tag the way Masm::allocate does.
        let mut asm = Assembler::new();
        asm.push(Reg::Rbp);
        asm.movq_rr(Reg::Rbp, Reg::Rsp);
        asm.movq_imm32(Reg::Rax, tag_int(24) as i32); // 16 payload + 8 header
        asm.push(Reg::Rax);
        asm.movq_imm32(Reg::Rax, tag_int(HeapTag::Object as i64) as i32);
        asm.push(Reg::Rax);
        asm.movq_imm64(Reg::R10, stubs.allocate);
        asm.callq_r(Reg::R10);
        asm.pop(Reg::Rbp);
        asm.ret();
        let base = space.add(asm);
        let f: extern "C" fn() -> u64 = unsafe { std::mem::transmute(base) };
        let addr = f();
        assert_eq!(HValue::tag_of(addr), HeapTag::Object);
        assert!(heap.contains(addr));
        let _ = root;
    }
}
