//! The Candor language compiler and embedding API.
//!
//! A [`Candor`] instance owns a heap, an executable code space, and the
//! precompiled stubs. [`Candor::compile`] turns source text into a
//! [`Script`] whose entry function object is held alive through a
//! persistent heap reference; running it enters generated code through the
//! entry trampoline and hands back a host-side [`Value`] view of the
//! result.

pub mod ast;
pub mod codespace;
pub mod diagnostics;
pub mod fullgen;
pub mod lexer;
pub mod masm;
pub mod parser;
pub mod scope;
pub mod stubs;
pub mod zone;

use std::fmt;

use candor_rt::gc;
use candor_rt::heap::{tag_int, untag_int, RefKind, NIL};
use candor_rt::value::{
    root_index, HArray, HBoolean, HFunction, HNumber, HObject, HString, HValue,
};
use candor_rt::{Heap, HeapTag, Tenure};

pub use candor_rt as rt;
pub use candor_rt::runtime::NativeFn;

use crate::ast::Ast;
use crate::codespace::CodeSpace;
use crate::diagnostics::Diagnostic;
use crate::fullgen::Fullgen;
use crate::stubs::Stubs;

pub const DEFAULT_PAGE_SIZE: u32 = 1 << 20;

/// An opaque reference to a heap object. Valid until the next script run or
/// explicit collection; re-fetch through the owning [`Candor`] after that.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Handle(pub(crate) u64);

impl Handle {
    pub fn raw(self) -> u64 {
        self.0
    }
}

/// Host-side view of a runtime value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Nil,
    Int(i64),
    Double(f64),
    Bool(bool),
    Str(String),
    Object(Handle),
    Array(Handle),
    Function(Handle),
    CData(Handle),
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Nil => write!(f, "nil"),
            Value::Int(v) => write!(f, "{}", v),
            Value::Double(v) => write!(f, "{}", v),
            Value::Bool(v) => write!(f, "{}", v),
            Value::Str(s) => write!(f, "{}", s),
            Value::Object(_) => write!(f, "[object]"),
            Value::Array(_) => write!(f, "[array]"),
            Value::Function(_) => write!(f, "[function]"),
            Value::CData(_) => write!(f, "[cdata]"),
        }
    }
}

/// A compiled program: the entry function object, rooted in its owning
/// [`Candor`] so collections rewrite it in place.
#[derive(Debug)]
pub struct Script {
    root: usize,
}

pub struct Candor {
    heap: Box<Heap>,
    code: CodeSpace,
    stubs: Stubs,
    /// Fixed root-context prefix (global object, booleans, type strings),
    /// each element registered as a persistent reference.
    globals: Box<[u64]>,
    /// Entry function objects of compiled scripts, same treatment.
    script_roots: Vec<Box<u64>>,
}

impl Candor {
    pub fn new(page_size: u32) -> Candor {
        let mut heap = Heap::new(page_size);
        let mut code = CodeSpace::new();
        let stubs = Stubs::generate(&mut heap, &mut code);

        let mut globals = Vec::with_capacity(root_index::FIRST_LITERAL as usize);
        globals.push(HObject::new_empty(&mut heap));
        globals.push(HBoolean::new(&mut heap, Tenure::Old, true));
        globals.push(HBoolean::new(&mut heap, Tenure::Old, false));
        for name in root_index::TYPE_NAME_STRINGS {
            globals.push(HString::new(&mut heap, Tenure::Old, name.as_bytes()));
        }
        let mut globals = globals.into_boxed_slice();
        for slot in globals.iter_mut() {
            let value = *slot;
            heap.reference(RefKind::Persistent, slot as *mut u64, value);
        }

        Candor {
            heap,
            code,
            stubs,
            globals,
            script_roots: Vec::new(),
        }
    }

    /// Compile source into a runnable script. Parse errors and the
    /// generator's semantic errors are surfaced as diagnostics; a program
    /// with semantic errors is fully laid out but refused here, before
    /// anything can reach its trapping sites.
    pub fn compile(&mut self, source: &str) -> Result<Script, Vec<Diagnostic>> {
        self.compile_named(source, "<script>")
    }

    pub fn compile_named(
        &mut self,
        source: &str,
        file: &str,
    ) -> Result<Script, Vec<Diagnostic>> {
        let mut ast = Ast::new();
        let entry = parser::parse(source, &mut ast).map_err(|e| {
            vec![Diagnostic::error(
                "PAR_001",
                file,
                source,
                e.span.offset as usize,
                e.message,
            )]
        })?;
        scope::resolve(&mut ast, source, entry);

        let mut fullgen = Fullgen::new(&mut self.heap, &self.stubs, &ast, source, &self.globals);
        fullgen.generate(entry);

        if !fullgen.errors().is_empty() {
            return Err(fullgen
                .errors()
                .iter()
                .map(|e| {
                    Diagnostic::error(
                        e.kind.code(),
                        file,
                        source,
                        e.offset as usize,
                        e.kind.message().to_string(),
                    )
                })
                .collect());
        }

        let root_context = fullgen.allocate_root();
        let (asm, entry_offset) = fullgen.finish();
        let base = self.code.add(asm);

        let function = HFunction::new(&mut self.heap, NIL, base + entry_offset as u64, root_context);
        let mut slot = Box::new(function);
        self.heap
            .reference(RefKind::Persistent, &mut *slot, function);
        self.script_roots.push(slot);

        Ok(Script {
            root: self.script_roots.len() - 1,
        })
    }

    /// Run a compiled script's entry function with no arguments and a nil
    /// parent context.
    #[cfg(target_arch = "x86_64")]
    pub fn run(&mut self, script: &Script) -> Value {
        let function = *self.script_roots[script.root];
        let code = HFunction::code(function);
        let parent = HFunction::parent(function);
        let root = HFunction::root(function);

        let entry: extern "C" fn(u64, u64, u64, u64) -> u64 =
            unsafe { std::mem::transmute(self.stubs.entry) };
        let result = entry(code, parent, tag_int(0), root);
        self.decode(result)
    }

    /// Install a native binding as a property of the global object.
    pub fn bind(&mut self, name: &str, func: NativeFn) {
        let function = HFunction::new_binding(&mut self.heap, func as usize as u64, NIL);
        let key = HString::new(&mut self.heap, Tenure::Old, name.as_bytes());
        let global = self.globals[root_index::GLOBAL as usize];
        let offset = HObject::lookup_property(Some(&mut self.heap), global, key, true);
        debug_assert_ne!(offset, 0);
        unsafe { *((HObject::map(global) + offset) as *mut u64) = function };
    }

    /// Force a collection from the host (no generated frames on the stack).
    pub fn collect_garbage(&mut self) {
        gc::collect(&mut self.heap, 0);
    }

    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    pub fn heap_mut(&mut self) -> &mut Heap {
        &mut self.heap
    }

    /// The single pending-exception slot, for host inspection.
    pub fn pending_exception(&self) -> Option<Value> {
        let word = self.heap.pending_exception();
        if word == NIL {
            None
        } else {
            Some(self.decode(word))
        }
    }

    // -- value inspection --

    fn decode(&self, word: u64) -> Value {
        if word == NIL {
            return Value::Nil;
        }
        if candor_rt::heap::is_unboxed(word) {
            return Value::Int(untag_int(word));
        }
        match HValue::tag_of(word) {
            HeapTag::Number => Value::Double(HNumber::double_value(word)),
            HeapTag::Boolean => Value::Bool(HBoolean::value(word)),
            HeapTag::String => {
                Value::Str(String::from_utf8_lossy(HString::bytes(word)).into_owned())
            }
            HeapTag::Object => Value::Object(Handle(word)),
            HeapTag::Array => Value::Array(Handle(word)),
            HeapTag::Function => Value::Function(Handle(word)),
            HeapTag::CData => Value::CData(Handle(word)),
            _ => Value::Nil,
        }
    }

    fn object_addr(value: &Value) -> Option<u64> {
        match value {
            Value::Object(h) | Value::Array(h) => Some(h.0),
            _ => None,
        }
    }

    /// Read a named property of an object or array.
    pub fn get_member(&mut self, value: &Value, name: &str) -> Value {
        let addr = match Self::object_addr(value) {
            Some(addr) => addr,
            None => return Value::Nil,
        };
        let key = HString::new(&mut self.heap, Tenure::New, name.as_bytes());
        let offset = HObject::lookup_property(Some(&mut self.heap), addr, key, false);
        if offset == 0 {
            return Value::Nil;
        }
        self.decode(unsafe { *((HObject::map(addr) + offset) as *const u64) })
    }

    /// Read an integer-keyed element of an object or array.
    pub fn get_index(&mut self, value: &Value, index: i64) -> Value {
        let addr = match Self::object_addr(value) {
            Some(addr) => addr,
            None => return Value::Nil,
        };
        let offset = HObject::lookup_property(Some(&mut self.heap), addr, tag_int(index), false);
        if offset == 0 {
            return Value::Nil;
        }
        self.decode(unsafe { *((HObject::map(addr) + offset) as *const u64) })
    }

    /// Array length without shrinking.
    pub fn array_length(&self, value: &Value) -> i64 {
        match value {
            Value::Array(h) => HArray::length(h.0, false),
            _ => 0,
        }
    }

    /// Total bytes of heap pages currently owned, for pressure checks in
    /// tests and embedders.
    pub fn heap_size(&self) -> u32 {
        self.heap.space(Tenure::New).size() + self.heap.space(Tenure::Old).size()
    }
}

impl Default for Candor {
    fn default() -> Self {
        Candor::new(DEFAULT_PAGE_SIZE)
    }
}
