//! Full code generator: a single-pass AST walk emitting x86-64.
//!
//! Two visitor modes drive everything: *value* mode materialises an
//! expression in the result register, *slot* mode materialises a writable
//! base+displacement operand for assignment and compound updates. Function
//! literals queue an `FFunction` whose eventual code offset is patched
//! through an absolute relocation; literals, doubles, and property names
//! are interned into the root context at generation time and loaded
//! root-register-relative.
//!
//! Semantic errors do not stop generation: the offending expression is
//! replaced with a trapping instruction and the error is recorded with its
//! source offset for the embedder to inspect.

use std::collections::{HashMap, VecDeque};

use log::debug;

use candor_rt::heap::{tag_int, NIL};
use candor_rt::runtime::BinaryOp;
use candor_rt::utils::{power_of_two, unescape};
use candor_rt::value::{root_index, HContext, HNumber, HString};
use candor_rt::{Heap, HeapTag, Tenure};

use crate::ast::{Ast, AstKind, NodeId};
use crate::masm::{
    Assembler, Cond, Label, Masm, Operand, Reg, RelocId, RelocKind, RelocSize, Spill, CONV,
};
use crate::scope::SlotStorage;
use crate::stubs::Stubs;

/// Semantic errors the generator can detect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    IncorrectLhs,
    CallWithoutVariable,
    ExpectedLoop,
}

impl ErrorKind {
    pub fn message(self) -> &'static str {
        match self {
            ErrorKind::IncorrectLhs => "Incorrect left-hand side",
            ErrorKind::CallWithoutVariable => "Call without variable",
            ErrorKind::ExpectedLoop => "Expected loop",
        }
    }

    pub fn code(self) -> &'static str {
        match self {
            ErrorKind::IncorrectLhs => "GEN_001",
            ErrorKind::CallWithoutVariable => "GEN_002",
            ErrorKind::ExpectedLoop => "GEN_003",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CodeError {
    pub kind: ErrorKind,
    pub offset: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Value,
    Slot,
}

/// A function awaiting generation; `reloc` patches the `mov` immediate at
/// its use site once the code offset is known.
struct FFunction {
    node: NodeId,
    reloc: Option<RelocId>,
}

/// Operand sources for the synthetic emission paths (object literals,
/// compound updates) that reuse the assignment machinery without
/// fabricating AST nodes.
enum Source<'s> {
    Node(NodeId),
    Spill(&'s Spill),
    TaggedInt(i64),
}

pub struct Fullgen<'a> {
    masm: Masm,
    heap: &'a mut Heap,
    stubs: &'a Stubs,
    ast: &'a Ast,
    source: &'a str,
    /// Values of the root context being assembled; the fixed prefix
    /// (global object, booleans, type strings) is seeded by the caller.
    root_values: Vec<u64>,
    interned: HashMap<Vec<u8>, u32>,
    fns: VecDeque<FFunction>,
    current_fn: Option<NodeId>,
    loop_start: Option<Label>,
    loop_end: Option<Label>,
    /// Slot-mode output: the writable operand of the last slot visit.
    slot: Operand,
    errors: Vec<CodeError>,
    entry_offset: u32,
}

impl<'a> Fullgen<'a> {
    /// `root_prefix` must hold the fixed root-context slots (global object,
    /// true, false, the nine type strings) in index order.
    pub fn new(
        heap: &'a mut Heap,
        stubs: &'a Stubs,
        ast: &'a Ast,
        source: &'a str,
        root_prefix: &[u64],
    ) -> Fullgen<'a> {
        debug_assert_eq!(root_prefix.len() as u32, root_index::FIRST_LITERAL);
        let masm = Masm::new(heap, stubs);
        Fullgen {
            masm,
            heap,
            stubs,
            ast,
            source,
            root_values: root_prefix.to_vec(),
            interned: HashMap::new(),
            fns: VecDeque::new(),
            current_fn: None,
            loop_start: None,
            loop_end: None,
            slot: Operand::new(Reg::Rax, 0),
            errors: Vec::new(),
            entry_offset: 0,
        }
    }

    /// Generate the entry function and every function literal reachable
    /// from it.
    pub fn generate(&mut self, entry: NodeId) {
        self.fns.push_back(FFunction {
            node: entry,
            reloc: None,
        });

        let mut generated = 0u32;
        while let Some(ffn) = self.fns.pop_front() {
            self.masm.align_code();
            let addr = self.masm.offset();
            if let Some(reloc) = ffn.reloc {
                self.masm.asm.set_reloc_target(reloc, addr as u64);
            } else {
                self.entry_offset = addr;
            }

            self.current_fn = Some(ffn.node);
            self.generate_prologue(ffn.node);
            let body = self.ast[ffn.node].children.clone();
            for child in body {
                self.visit(child, Mode::Value);
            }
            // A function without an explicit return yields nil.
            self.masm.asm.movq_imm32(CONV.result, NIL as i32);
            self.generate_epilogue();
            self.masm.finalize_spills();
            generated += 1;
        }
        debug!(
            "fullgen: {} functions, {} bytes, {} root slots",
            generated,
            self.masm.offset(),
            self.root_values.len()
        );
    }

    pub fn errors(&self) -> &[CodeError] {
        &self.errors
    }

    /// Build the root context from the interned values. Call after
    /// generation; the context is old-tenure with a nil parent.
    pub fn allocate_root(&mut self) -> u64 {
        HContext::new(self.heap, &self.root_values)
    }

    /// Hand the finished code buffer and entry offset to the caller.
    pub fn finish(self) -> (Assembler, u32) {
        (self.masm.asm, self.entry_offset)
    }

    // -- prologue / epilogue --

    fn generate_prologue(&mut self, fn_node: NodeId) {
        let stack_slots = self.ast[fn_node].stack_slots;
        let context_slots = self.ast[fn_node].context_slots;

        self.masm.asm.push(Reg::Rbp);
        self.masm.asm.movq_rr(Reg::Rbp, Reg::Rsp);
        self.masm.allocate_spills(stack_slots);
        self.masm.fill_stack_slots();

        if context_slots > 0 {
            self.masm.allocate_context(context_slots);
        }

        // Copy arguments into their slots, guarded by the tagged argument
        // count: missing arguments stay nil. Callers push right-to-left, so
        // argument `i` sits at a fixed offset whatever the passed count.
        let args = self.ast[fn_node].aux.clone();
        let body = self.masm.asm.label();
        for (i, arg) in args.into_iter().enumerate() {
            let i = i as i32;
            self.masm
                .asm
                .cmpq_ri(CONV.argc, tag_int(i as i64 + 1) as i32);
            self.masm.asm.jcc(Cond::Lt, body);

            self.visit(arg, Mode::Slot);
            self.masm
                .asm
                .movq_rm(Reg::Rdx, Operand::new(Reg::Rbp, 8 * (2 + i)));
            self.masm.asm.movq_mr(self.slot, Reg::Rdx);
        }
        self.masm.asm.bind(body);
        self.masm.asm.xorq_rr(Reg::Rdx, Reg::Rdx);
    }

    fn generate_epilogue(&mut self) {
        self.masm.asm.movq_rr(Reg::Rsp, Reg::Rbp);
        self.masm.asm.pop(Reg::Rbp);
        self.masm.asm.ret();
    }

    // -- shared helpers --

    fn throw(&mut self, kind: ErrorKind, node: NodeId) {
        self.errors.push(CodeError {
            kind,
            offset: self.ast[node].span.offset,
        });
        self.masm.asm.int3();
    }

    fn node_text(&self, node: NodeId) -> &'a str {
        self.ast[node].span.text(self.source)
    }

    /// Intern a value into the root context; emits nothing.
    fn place_in_root(&mut self, value: u64) -> u32 {
        self.root_values.push(value);
        (self.root_values.len() - 1) as u32
    }

    /// Intern a string (deduplicated by content) into the root context.
    fn intern_string(&mut self, bytes: &[u8]) -> u32 {
        if let Some(&index) = self.interned.get(bytes) {
            return index;
        }
        let string = HString::new(self.heap, Tenure::Old, bytes);
        let index = self.place_in_root(string);
        self.interned.insert(bytes.to_vec(), index);
        index
    }

    fn root_slot_operand(index: u32) -> Operand {
        Operand::new(CONV.root, HContext::index_disp(index) as i32)
    }

    fn load_root_slot(&mut self, dst: Reg, index: u32) {
        self.masm.asm.movq_rm(dst, Self::root_slot_operand(index));
    }

    /// Materialise a synthetic-or-AST source in the result register.
    fn load_source(&mut self, source: &Source) {
        match source {
            Source::Node(node) => self.visit(*node, Mode::Value),
            Source::Spill(spill) => self.masm.unspill(spill, CONV.result),
            Source::TaggedInt(value) => {
                self.masm.asm.movq_imm64(CONV.result, tag_int(*value));
            }
        }
    }

    // -- visitor --

    fn visit(&mut self, node: NodeId, mode: Mode) {
        match self.ast[node].kind {
            AstKind::Block => {
                let children = self.ast[node].children.clone();
                for child in children {
                    self.visit(child, Mode::Value);
                }
            }
            AstKind::Nop | AstKind::ScopeDecl => {}
            AstKind::Function => {
                if self.ast[node].children.is_empty() {
                    self.visit_call(node, mode);
                } else {
                    self.visit_function(node);
                }
            }
            AstKind::Value => self.visit_value(node, mode),
            AstKind::Member => self.visit_member(node, mode),
            AstKind::Assign => {
                let lhs = self.ast[node].lhs();
                let rhs = self.ast[node].rhs();
                self.emit_assign(lhs, &Source::Node(rhs));
            }
            AstKind::Number => self.visit_number(node, mode),
            AstKind::String | AstKind::Property => self.visit_string(node, mode),
            AstKind::Nil => {
                if mode == Mode::Slot {
                    return self.throw(ErrorKind::IncorrectLhs, node);
                }
                self.masm.asm.movq_imm32(CONV.result, NIL as i32);
            }
            AstKind::True => {
                if mode == Mode::Slot {
                    return self.throw(ErrorKind::IncorrectLhs, node);
                }
                self.load_root_slot(CONV.result, root_index::TRUE);
            }
            AstKind::False => {
                if mode == Mode::Slot {
                    return self.throw(ErrorKind::IncorrectLhs, node);
                }
                self.load_root_slot(CONV.result, root_index::FALSE);
            }
            AstKind::If => self.visit_if(node),
            AstKind::While => self.visit_while(node),
            AstKind::Break => {
                match self.loop_end {
                    Some(label) => self.masm.asm.jmp(label),
                    None => self.throw(ErrorKind::ExpectedLoop, node),
                }
            }
            AstKind::Continue => {
                match self.loop_start {
                    Some(label) => self.masm.asm.jmp(label),
                    None => self.throw(ErrorKind::ExpectedLoop, node),
                }
            }
            AstKind::Return => self.visit_return(node),
            AstKind::ObjectLiteral => self.visit_object_literal(node, mode),
            AstKind::ArrayLiteral => self.visit_array_literal(node, mode),
            AstKind::New => self.visit_stub_unary(node, mode, self.stubs.clone_object),
            AstKind::Typeof => self.visit_stub_unary(node, mode, self.stubs.type_of),
            AstKind::Sizeof => self.visit_stub_unary(node, mode, self.stubs.size_of),
            AstKind::Keysof => self.visit_stub_unary(node, mode, self.stubs.keys_of),
            AstKind::Not => self.visit_not(node, mode),
            AstKind::PreInc | AstKind::PreDec => self.visit_pre_update(node, mode),
            AstKind::PostInc | AstKind::PostDec => self.visit_post_update(node, mode),
            AstKind::Name => {
                // The resolver rewrites every reachable name; anything left
                // is a structural hole.
                debug_assert!(false, "unresolved name reached the generator");
                self.masm.asm.movq_imm32(CONV.result, NIL as i32);
            }
            _ => self.visit_binop(node, mode),
        }
    }

    // -- names --

    fn visit_value(&mut self, node: NodeId, mode: Mode) {
        let slot = self.ast[node].slot.expect("value node without slot");

        match slot.storage {
            SlotStorage::Stack => {
                self.slot = Operand::new(Reg::Rbp, -8 * (slot.index as i32 + 1));
                if mode == Mode::Value {
                    self.masm.asm.movq_rm(CONV.result, self.slot);
                }
            }
            SlotStorage::Root => {
                if mode == Mode::Slot {
                    return self.throw(ErrorKind::IncorrectLhs, node);
                }
                self.load_root_slot(CONV.result, slot.index);
            }
            SlotStorage::Global => {
                if mode == Mode::Slot {
                    return self.throw(ErrorKind::IncorrectLhs, node);
                }
                // Look the name up on the global object.
                let name = self.node_text(node).as_bytes().to_vec();
                let key = self.intern_string(&name);
                self.load_root_slot(CONV.result, root_index::GLOBAL);
                let obj_s = self.masm.spill(CONV.result);
                self.load_root_slot(CONV.secondary, key);
                self.masm.asm.movq_imm32(Reg::Rcx, 0);
                self.masm.call_addr(self.stubs.lookup_property);

                let done = self.masm.asm.label();
                self.masm.is_nil(CONV.result, None, Some(done));
                self.masm.unspill(&obj_s, CONV.secondary);
                self.masm
                    .asm
                    .movq_rm(CONV.secondary, Operand::new(CONV.secondary, 16));
                self.masm.asm.addq_rr(CONV.result, CONV.secondary);
                self.masm
                    .asm
                    .movq_rm(CONV.result, Operand::new(CONV.result, 0));
                self.masm.asm.bind(done);
                self.masm.release(obj_s);
            }
            SlotStorage::Context { depth } => {
                self.masm.asm.movq_rr(CONV.result, CONV.context);
                for _ in 0..depth {
                    self.masm
                        .asm
                        .movq_rm(CONV.result, Operand::new(CONV.result, 8));
                }
                self.slot = Operand::new(
                    CONV.result,
                    HContext::index_disp(slot.index) as i32,
                );
                if mode == Mode::Value {
                    self.masm.asm.movq_rm(CONV.result, self.slot);
                }
            }
        }
    }

    // -- member access --

    fn visit_member(&mut self, node: NodeId, mode: Mode) {
        let lhs = self.ast[node].lhs();
        let rhs = self.ast[node].rhs();
        self.emit_member(&Source::Node(lhs), &Source::Node(rhs), mode);
    }

    /// The member machinery shared by source-level access, object/array
    /// literals, and global lookups: leaves the value slot operand in
    /// `self.slot` (base nil on a miss without insert) and, in value mode,
    /// the loaded value in the result register.
    fn emit_member(&mut self, obj: &Source, key: &Source, mode: Mode) {
        self.load_source(obj);
        let obj_s = self.masm.spill(CONV.result);

        self.load_source(key);
        self.masm.asm.movq_rr(CONV.secondary, CONV.result);
        self.masm.unspill(&obj_s, CONV.result);

        self.masm
            .asm
            .movq_imm32(Reg::Rcx, (mode == Mode::Slot) as i32);
        self.masm.call_addr(self.stubs.lookup_property);

        let done = self.masm.asm.label();
        self.masm.is_nil(CONV.result, None, Some(done));

        self.masm.unspill(&obj_s, CONV.secondary);
        self.masm
            .asm
            .movq_rm(CONV.secondary, Operand::new(CONV.secondary, 16));
        self.masm.asm.addq_rr(CONV.result, CONV.secondary);

        self.slot = Operand::new(CONV.result, 0);
        if mode == Mode::Value {
            self.masm.asm.movq_rm(CONV.result, self.slot);
        }

        self.masm.asm.bind(done);
        self.slot = Operand::new(CONV.result, 0);
        self.masm.release(obj_s);
    }

    // -- assignment --

    /// `lhs = rhs`, graceful no-op when the target slot's base is nil.
    fn emit_assign(&mut self, lhs: NodeId, rhs: &Source) {
        self.load_source(rhs);
        let value_s = self.masm.spill(CONV.result);

        self.visit(lhs, Mode::Slot);

        self.masm.unspill(&value_s, CONV.scratch);
        let done = self.masm.asm.label();
        if self.slot.base != Reg::Rbp {
            self.masm.is_nil(self.slot.base, None, Some(done));
        }
        self.masm.asm.movq_mr(self.slot, CONV.scratch);
        self.masm.asm.bind(done);
        self.masm.asm.movq_rr(CONV.result, CONV.scratch);
        self.masm.release(value_s);
    }

    /// Assignment into a member of an already-materialised object, used by
    /// the literal paths.
    fn emit_member_store(&mut self, obj: &Spill, key: Source, value: NodeId) {
        self.visit(value, Mode::Value);
        let value_s = self.masm.spill(CONV.result);

        self.emit_member(&Source::Spill(obj), &key, Mode::Slot);

        self.masm.unspill(&value_s, CONV.scratch);
        let done = self.masm.asm.label();
        self.masm.is_nil(self.slot.base, None, Some(done));
        self.masm.asm.movq_mr(self.slot, CONV.scratch);
        self.masm.asm.bind(done);
        self.masm.release(value_s);
    }

    // -- function literals and calls --

    fn visit_function(&mut self, node: NodeId) {
        // The function's eventual address arrives through a relocation on
        // this immediate.
        self.masm.asm.movq_imm64(Reg::Rcx, 0);
        let reloc = self.masm.asm.add_reloc(
            RelocKind::Absolute,
            RelocSize::Quad,
            self.masm.offset() - 8,
        );
        self.fns.push_back(FFunction {
            node,
            reloc: Some(reloc),
        });

        match self.ast[node].variable {
            Some(variable) => {
                self.masm.allocate_function(Reg::Rcx, Reg::Rdx);
                let fn_s = self.masm.spill(Reg::Rdx);
                self.emit_assign(variable, &Source::Spill(&fn_s));
                self.masm.release(fn_s);
            }
            None => {
                self.masm.allocate_function(Reg::Rcx, CONV.result);
            }
        }
    }

    fn visit_call(&mut self, node: NodeId, mode: Mode) {
        let variable = match self.ast[node].variable {
            Some(variable) => variable,
            None => return self.throw(ErrorKind::CallWithoutVariable, node),
        };
        if mode == Mode::Slot {
            return self.throw(ErrorKind::IncorrectLhs, node);
        }

        // The compiler intrinsic is recognised by name at the direct call
        // site only.
        if self.ast[variable].is(AstKind::Value) && self.node_text(variable) == "__$gc" {
            let pad = self.masm.enter_align();
            self.masm.call_addr(self.stubs.collect_garbage);
            self.masm.exit_align(pad);
            self.masm.asm.movq_imm32(CONV.result, NIL as i32);
            return;
        }

        self.visit(variable, Mode::Value);
        let callee_s = self.masm.spill(CONV.result);

        let not_function = self.masm.asm.label();
        let done = self.masm.asm.label();
        self.masm.is_nil(CONV.result, None, Some(not_function));
        self.masm.is_unboxed(CONV.result, None, Some(not_function));
        self.masm
            .is_heap_object(HeapTag::Function, CONV.result, Some(not_function), None);

        let argc_s = self.masm.spill(CONV.argc);
        let ctx_s = self.masm.spill(CONV.context);
        let root_s = self.masm.spill(CONV.root);

        let args = self.ast[node].aux.clone();
        let argc = args.len() as i32;

        // Evaluate left-to-right into spills, then push right-to-left so the
        // callee finds argument `i` at `[rbp + 8*(2+i)]` however many were
        // passed.
        let mut arg_spills = Vec::with_capacity(args.len());
        for arg in args {
            self.visit(arg, Mode::Value);
            arg_spills.push(self.masm.spill(CONV.result));
        }

        self.masm.change_align(argc);
        let pad = self.masm.enter_align();
        self.masm.change_align(-argc);

        for spill in arg_spills.iter().rev() {
            self.masm.push_spill(spill);
            self.masm.change_align(1);
        }
        self.masm.change_align(-argc);

        self.masm.unspill(&callee_s, CONV.result);
        self.masm.call_function(CONV.result, argc as u32);

        if argc > 0 {
            self.masm.asm.addq_ri(Reg::Rsp, argc * 8);
        }
        self.masm.exit_align(pad);

        for spill in arg_spills.into_iter().rev() {
            self.masm.release(spill);
        }

        self.masm.unspill_back(&root_s);
        self.masm.unspill_back(&ctx_s);
        self.masm.unspill_back(&argc_s);

        self.masm.asm.jmp(done);
        self.masm.asm.bind(not_function);
        self.masm.asm.movq_imm32(CONV.result, NIL as i32);
        self.masm.asm.bind(done);

        self.masm.release(root_s);
        self.masm.release(ctx_s);
        self.masm.release(argc_s);
        self.masm.release(callee_s);
    }

    // -- literals --

    fn visit_number(&mut self, node: NodeId, mode: Mode) {
        if mode == Mode::Slot {
            return self.throw(ErrorKind::IncorrectLhs, node);
        }
        let text = self.node_text(node);
        if text.is_empty() {
            // The synthesised zero of the unary +/- lowering.
            self.masm.asm.movq_imm32(CONV.result, tag_int(0) as i32);
            return;
        }
        if text.contains('.') {
            let value: f64 = text.parse().unwrap_or(0.0);
            let boxed = HNumber::new_double(self.heap, Tenure::Old, value);
            let index = self.place_in_root(boxed);
            self.load_root_slot(CONV.result, index);
            return;
        }
        match text.parse::<i64>() {
            Ok(value) => {
                self.masm.asm.movq_imm64(CONV.result, tag_int(value));
            }
            Err(_) => {
                // Out of the 63-bit range: fall back to a boxed double.
                let value: f64 = text.parse().unwrap_or(0.0);
                let boxed = HNumber::new_double(self.heap, Tenure::Old, value);
                let index = self.place_in_root(boxed);
                self.load_root_slot(CONV.result, index);
            }
        }
    }

    fn visit_string(&mut self, node: NodeId, mode: Mode) {
        if mode == Mode::Slot {
            return self.throw(ErrorKind::IncorrectLhs, node);
        }
        let bytes = unescape(self.node_text(node));
        let index = self.intern_string(&bytes);
        self.load_root_slot(CONV.result, index);
    }

    fn visit_object_literal(&mut self, node: NodeId, mode: Mode) {
        if mode == Mode::Slot {
            return self.throw(ErrorKind::IncorrectLhs, node);
        }
        let keys = self.ast[node].aux.clone();
        let values = self.ast[node].children.clone();
        debug_assert_eq!(keys.len(), values.len());

        // Capacity keeps the map at most half full.
        let capacity = power_of_two(2 * keys.len() as u32);
        self.masm
            .asm
            .movq_imm32(CONV.secondary, tag_int(capacity as i64) as i32);
        self.masm
            .allocate_object_literal(HeapTag::Object, CONV.secondary, Reg::Rdx);

        let obj_s = self.masm.spill(Reg::Rdx);
        for (key, value) in keys.into_iter().zip(values) {
            self.emit_member_store(&obj_s, Source::Node(key), value);
        }
        self.masm.unspill(&obj_s, CONV.result);
        self.masm.release(obj_s);
    }

    fn visit_array_literal(&mut self, node: NodeId, mode: Mode) {
        if mode == Mode::Slot {
            return self.throw(ErrorKind::IncorrectLhs, node);
        }
        let values = self.ast[node].children.clone();

        let capacity = power_of_two(2 * values.len() as u32);
        self.masm
            .asm
            .movq_imm32(CONV.secondary, tag_int(capacity as i64) as i32);
        self.masm
            .allocate_object_literal(HeapTag::Array, CONV.secondary, Reg::Rdx);

        let obj_s = self.masm.spill(Reg::Rdx);
        for (index, value) in values.into_iter().enumerate() {
            self.emit_member_store(&obj_s, Source::TaggedInt(index as i64), value);
        }
        self.masm.unspill(&obj_s, CONV.result);
        self.masm.release(obj_s);
    }

    // -- control flow --

    fn visit_if(&mut self, node: NodeId) {
        let children = self.ast[node].children.clone();
        let fail = self.masm.asm.label();
        let done = self.masm.asm.label();

        self.visit(children[0], Mode::Value);
        self.masm.call_addr(self.stubs.coerce_to_boolean);
        self.masm.is_true(CONV.result, Some(fail), None);

        self.visit(children[1], Mode::Value);
        self.masm.asm.jmp(done);

        self.masm.asm.bind(fail);
        if let Some(&otherwise) = children.get(2) {
            self.visit(otherwise, Mode::Value);
        }
        self.masm.asm.bind(done);
    }

    fn visit_while(&mut self, node: NodeId) {
        let cond = self.ast[node].lhs();
        let body = self.ast[node].rhs();

        let loop_start = self.masm.asm.label();
        let loop_end = self.masm.asm.label();
        let saved = (self.loop_start, self.loop_end);
        self.loop_start = Some(loop_start);
        self.loop_end = Some(loop_end);

        self.masm.asm.bind(loop_start);
        self.visit(cond, Mode::Value);
        self.masm.call_addr(self.stubs.coerce_to_boolean);
        self.masm.is_true(CONV.result, Some(loop_end), None);

        self.visit(body, Mode::Value);
        self.masm.asm.jmp(loop_start);
        self.masm.asm.bind(loop_end);

        (self.loop_start, self.loop_end) = saved;
    }

    fn visit_return(&mut self, node: NodeId) {
        match self.ast[node].children.first().copied() {
            Some(value) => self.visit(value, Mode::Value),
            None => self.masm.asm.movq_imm32(CONV.result, NIL as i32),
        }
        self.generate_epilogue();
    }

    // -- unary operators --

    /// Typeof / Sizeof / Keysof / New: value-visit the operand and call the
    /// matching stub.
    fn visit_stub_unary(&mut self, node: NodeId, mode: Mode, stub: u64) {
        if mode == Mode::Slot {
            return self.throw(ErrorKind::IncorrectLhs, node);
        }
        let pad = self.masm.enter_align();
        let operand = self.ast[node].lhs();
        self.visit(operand, Mode::Value);
        self.masm.call_addr(stub);
        self.masm.exit_align(pad);
    }

    fn visit_not(&mut self, node: NodeId, mode: Mode) {
        if mode == Mode::Slot {
            return self.throw(ErrorKind::IncorrectLhs, node);
        }
        let operand = self.ast[node].lhs();
        self.visit(operand, Mode::Value);
        self.masm.call_addr(self.stubs.coerce_to_boolean);

        let ret_false = self.masm.asm.label();
        let done = self.masm.asm.label();
        self.masm.is_true(CONV.result, None, Some(ret_false));
        self.load_root_slot(CONV.result, root_index::TRUE);
        self.masm.asm.jmp(done);
        self.masm.asm.bind(ret_false);
        self.load_root_slot(CONV.result, root_index::FALSE);
        self.masm.asm.bind(done);
    }

    /// `++x` / `--x` lower to `x = x ± 1`.
    fn visit_pre_update(&mut self, node: NodeId, mode: Mode) {
        if mode == Mode::Slot {
            return self.throw(ErrorKind::IncorrectLhs, node);
        }
        let target = self.ast[node].lhs();
        let op = if self.ast[node].is(AstKind::PreInc) {
            BinaryOp::Add
        } else {
            BinaryOp::Sub
        };

        self.visit(target, Mode::Value);
        self.emit_add_sub_imm(op, 1);

        let new_s = self.masm.spill(CONV.result);
        self.visit(target, Mode::Slot);
        self.masm.unspill(&new_s, CONV.scratch);
        let done = self.masm.asm.label();
        if self.slot.base != Reg::Rbp {
            self.masm.is_nil(self.slot.base, None, Some(done));
        }
        self.masm.asm.movq_mr(self.slot, CONV.scratch);
        self.masm.asm.bind(done);
        self.masm.asm.movq_rr(CONV.result, CONV.scratch);
        self.masm.release(new_s);
    }

    /// `x++` / `x--`: spill the old value, update through a saved slot
    /// address, and yield the old value (nil short-circuits when the slot
    /// base is nil).
    fn visit_post_update(&mut self, node: NodeId, mode: Mode) {
        if mode == Mode::Slot {
            return self.throw(ErrorKind::IncorrectLhs, node);
        }
        let target = self.ast[node].lhs();
        let op = if self.ast[node].is(AstKind::PostInc) {
            BinaryOp::Add
        } else {
            BinaryOp::Sub
        };

        self.visit(target, Mode::Slot);

        let nil_result = self.masm.asm.label();
        let done = self.masm.asm.label();
        if self.slot.base != Reg::Rbp {
            self.masm.is_nil(self.slot.base, None, Some(nil_result));
        }

        self.masm.asm.movq_rm(CONV.scratch, self.slot);
        let old_s = self.masm.spill(CONV.scratch);
        self.masm.asm.lea(CONV.secondary, self.slot);
        let addr_s = self.masm.spill(CONV.secondary);

        self.masm.asm.movq_rr(CONV.result, CONV.scratch);
        self.emit_add_sub_imm(op, 1);

        self.masm.unspill(&addr_s, CONV.secondary);
        self.masm
            .asm
            .movq_mr(Operand::new(CONV.secondary, 0), CONV.result);
        self.masm.unspill(&old_s, CONV.result);
        self.masm.asm.jmp(done);

        self.masm.asm.bind(nil_result);
        self.masm.asm.movq_imm32(CONV.result, NIL as i32);
        self.masm.asm.bind(done);

        self.masm.release(addr_s);
        self.masm.release(old_s);
    }

    // -- binary operators --

    fn binop_of(kind: AstKind) -> Option<BinaryOp> {
        Some(match kind {
            AstKind::Add => BinaryOp::Add,
            AstKind::Sub => BinaryOp::Sub,
            AstKind::Mul => BinaryOp::Mul,
            AstKind::Div => BinaryOp::Div,
            AstKind::BAnd => BinaryOp::BAnd,
            AstKind::BOr => BinaryOp::BOr,
            AstKind::BXor => BinaryOp::BXor,
            AstKind::Eq => BinaryOp::Eq,
            AstKind::StrictEq => BinaryOp::StrictEq,
            AstKind::Ne => BinaryOp::Ne,
            AstKind::StrictNe => BinaryOp::StrictNe,
            AstKind::Lt => BinaryOp::Lt,
            AstKind::Gt => BinaryOp::Gt,
            AstKind::Le => BinaryOp::Le,
            AstKind::Ge => BinaryOp::Ge,
            AstKind::LOr => BinaryOp::LOr,
            AstKind::LAnd => BinaryOp::LAnd,
            _ => return None,
        })
    }

    fn visit_binop(&mut self, node: NodeId, mode: Mode) {
        let op = match Self::binop_of(self.ast[node].kind) {
            Some(op) => op,
            None => {
                self.masm.asm.int3();
                return;
            }
        };
        if mode == Mode::Slot {
            return self.throw(ErrorKind::IncorrectLhs, node);
        }

        let lhs = self.ast[node].lhs();
        let rhs = self.ast[node].rhs();

        self.visit(lhs, Mode::Value);

        let call_stub = self.masm.asm.label();
        let done = self.masm.asm.label();

        // Fast path: unboxed add/sub with a small integer literal on the
        // right, undone on overflow.
        if op == BinaryOp::Add || op == BinaryOp::Sub {
            if let Some(value) = self.small_int_literal(rhs) {
                let delta = value << 1;
                if i32::try_from(delta).is_ok() {
                    let delta = delta as i32;
                    self.masm.is_unboxed(CONV.result, Some(call_stub), None);
                    if op == BinaryOp::Add {
                        self.masm.asm.addq_ri(CONV.result, delta);
                    } else {
                        self.masm.asm.subq_ri(CONV.result, delta);
                    }
                    self.masm.asm.jcc(Cond::NoOverflow, done);
                    // Restore on overflow and fall through to the stub.
                    if op == BinaryOp::Add {
                        self.masm.asm.subq_ri(CONV.result, delta);
                    } else {
                        self.masm.asm.addq_ri(CONV.result, delta);
                    }
                }
            }
        }

        self.masm.asm.bind(call_stub);
        let lhs_s = self.masm.spill(CONV.result);
        self.visit(rhs, Mode::Value);
        self.masm.asm.movq_rr(CONV.secondary, CONV.result);
        self.masm.unspill(&lhs_s, CONV.result);
        self.masm.call_addr(self.stubs.binary_stub(op));
        self.masm.asm.bind(done);
        self.masm.release(lhs_s);
    }

    /// The integer value of an unboxed number literal node, if that is what
    /// `node` is.
    fn small_int_literal(&self, node: NodeId) -> Option<i64> {
        if !self.ast[node].is(AstKind::Number) {
            return None;
        }
        let text = self.node_text(node);
        if text.is_empty() {
            return Some(0);
        }
        if text.contains('.') {
            return None;
        }
        text.parse::<i64>().ok()
    }

    /// `rax = rax ± value` with the inline unboxed fast path and the stub
    /// fallback, shared by the compound-update forms.
    fn emit_add_sub_imm(&mut self, op: BinaryOp, value: i64) {
        debug_assert!(op == BinaryOp::Add || op == BinaryOp::Sub);
        let call_stub = self.masm.asm.label();
        let done = self.masm.asm.label();

        let delta = (value << 1) as i32;
        self.masm.is_unboxed(CONV.result, Some(call_stub), None);
        if op == BinaryOp::Add {
            self.masm.asm.addq_ri(CONV.result, delta);
        } else {
            self.masm.asm.subq_ri(CONV.result, delta);
        }
        self.masm.asm.jcc(Cond::NoOverflow, done);
        if op == BinaryOp::Add {
            self.masm.asm.subq_ri(CONV.result, delta);
        } else {
            self.masm.asm.addq_ri(CONV.result, delta);
        }

        self.masm.asm.bind(call_stub);
        self.masm.asm.movq_imm64(CONV.secondary, tag_int(value));
        self.masm.call_addr(self.stubs.binary_stub(op));
        self.masm.asm.bind(done);
    }
}
