//! Scope analysis: binds every name to a slot descriptor.
//!
//! Each function introduces a scope. Parameters, `scope`-declared names, and
//! bare names first assigned in a scope become stack slots; a name
//! referenced from a strictly nested function is promoted to a context slot
//! of its declaring scope, and every function crossed on the way is forced
//! to carry a context so the parent chain can be walked one link per
//! boundary. Free names fall back to a lookup on the global object, except
//! the builtin identifiers with fixed root-context slots.
//!
//! Resolution is a single linear walk in source order: a name declares
//! itself at its first assignment, and reads earlier in the source than any
//! declaration resolve globally.

use std::collections::HashMap;

use candor_rt::value::root_index;

use crate::ast::{Ast, AstKind, NodeId};

/// Where a resolved name lives. Storage kind is an explicit tag; context
/// slots carry the number of parent links to walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotStorage {
    Stack,
    Context { depth: u32 },
    Root,
    Global,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Slot {
    pub storage: SlotStorage,
    pub index: u32,
}

/// Annotate every name node in the tree rooted at `entry` (a function node)
/// with its slot, and every function node with its stack and context slot
/// counts.
pub fn resolve(ast: &mut Ast, source: &str, entry: NodeId) {
    let mut resolver = Resolver {
        ast,
        source,
        scopes: Vec::new(),
    };
    resolver.visit_function(entry);
}

struct Var {
    promoted: bool,
    index: u32,
}

struct ScopeData {
    fn_node: NodeId,
    vars: Vec<Var>,
    by_name: HashMap<String, usize>,
    /// Set when an inner function reaches through this scope; forces a
    /// context allocation even with no promoted slots of its own.
    force_context: bool,
    /// Uses to finalise once promotion is settled: (node, var, depth).
    pending: Vec<(NodeId, usize, u32)>,
}

struct Resolver<'a> {
    ast: &'a mut Ast,
    source: &'a str,
    scopes: Vec<ScopeData>,
}

impl<'a> Resolver<'a> {
    fn name_text(&self, node: NodeId) -> String {
        self.ast[node].span.text(self.source).to_string()
    }

    fn declare(&mut self, name: &str) -> usize {
        let scope = self.scopes.last_mut().expect("no open scope");
        if let Some(&var) = scope.by_name.get(name) {
            return var;
        }
        let var = scope.vars.len();
        scope.vars.push(Var {
            promoted: false,
            index: 0,
        });
        scope.by_name.insert(name.to_string(), var);
        var
    }

    /// Resolve a name use; `declare_on_miss` is the assignment-LHS rule.
    fn resolve_name(&mut self, node: NodeId, declare_on_miss: bool) {
        let name = self.name_text(node);

        // Innermost scope that declares the name wins.
        let found = self
            .scopes
            .iter()
            .enumerate()
            .rev()
            .find_map(|(level, scope)| scope.by_name.get(&name).map(|&var| (level, var)));

        if let Some((level, var)) = found {
            let depth = (self.scopes.len() - 1 - level) as u32;
            if depth > 0 {
                self.scopes[level].vars[var].promoted = true;
                for crossed in &mut self.scopes[level + 1..] {
                    crossed.force_context = true;
                }
            }
            self.scopes[level].pending.push((node, var, depth));
            return;
        }

        // Builtins with fixed root slots: the global object and the type
        // name strings. Checked before assignment can declare, so they are
        // only shadowable by explicit declarations (`scope`, parameters).
        let builtin = if name == "global" {
            Some(Slot {
                storage: SlotStorage::Root,
                index: root_index::GLOBAL,
            })
        } else {
            root_index::TYPE_NAME_STRINGS
                .iter()
                .position(|&t| t == name)
                .map(|i| Slot {
                    storage: SlotStorage::Root,
                    index: root_index::TYPE_NAMES + i as u32,
                })
        };
        if let Some(slot) = builtin {
            self.ast[node].kind = AstKind::Value;
            self.ast[node].slot = Some(slot);
            return;
        }

        if declare_on_miss {
            let var = self.declare(&name);
            let level = self.scopes.len() - 1;
            self.scopes[level].pending.push((node, var, 0));
            return;
        }

        self.ast[node].kind = AstKind::Value;
        self.ast[node].slot = Some(Slot {
            storage: SlotStorage::Global,
            index: 0,
        });
    }

    fn visit_function(&mut self, node: NodeId) {
        // A function node with no body is a call site.
        if self.ast[node].children.is_empty() {
            if let Some(variable) = self.ast[node].variable {
                self.visit(variable);
            }
            let args = self.ast[node].aux.clone();
            for arg in args {
                self.visit(arg);
            }
            return;
        }

        // A declaration's name behaves like an assignment target in the
        // enclosing scope.
        if let Some(variable) = self.ast[node].variable {
            if !self.scopes.is_empty() {
                self.resolve_name(variable, true);
            }
        }

        self.scopes.push(ScopeData {
            fn_node: node,
            vars: Vec::new(),
            by_name: HashMap::new(),
            force_context: false,
            pending: Vec::new(),
        });

        let params = self.ast[node].aux.clone();
        for param in &params {
            let name = self.name_text(*param);
            self.declare(&name);
        }
        // Parameter nodes resolve like reads so the prologue can store
        // through their slots.
        for param in params {
            self.resolve_name(param, false);
        }

        let body = self.ast[node].children.clone();
        for child in body {
            self.visit(child);
        }

        self.finalize_scope();
    }

    /// Assign final indices and rewrite this scope's pending uses.
    fn finalize_scope(&mut self) {
        let mut scope = self.scopes.pop().expect("no open scope");

        let mut stack_count = 0u32;
        let mut context_count = 0u32;
        for var in &mut scope.vars {
            if var.promoted {
                var.index = context_count;
                context_count += 1;
            } else {
                var.index = stack_count;
                stack_count += 1;
            }
        }
        if scope.force_context && context_count == 0 {
            context_count = 1;
        }

        for (node, var, depth) in scope.pending {
            let var = &scope.vars[var];
            let slot = if var.promoted {
                Slot {
                    storage: SlotStorage::Context { depth },
                    index: var.index,
                }
            } else {
                debug_assert_eq!(depth, 0, "stack slot referenced across a function");
                Slot {
                    storage: SlotStorage::Stack,
                    index: var.index,
                }
            };
            self.ast[node].kind = AstKind::Value;
            self.ast[node].slot = Some(slot);
        }

        self.ast[scope.fn_node].stack_slots = stack_count;
        self.ast[scope.fn_node].context_slots = context_count;
    }

    fn visit(&mut self, node: NodeId) {
        match self.ast[node].kind {
            AstKind::Function => self.visit_function(node),
            AstKind::Name => self.resolve_name(node, false),
            AstKind::Assign => {
                let lhs = self.ast[node].lhs();
                let rhs = self.ast[node].rhs();
                if self.ast[lhs].is(AstKind::Name) {
                    self.resolve_name(lhs, true);
                } else {
                    self.visit(lhs);
                }
                self.visit(rhs);
            }
            AstKind::ScopeDecl => {
                let names = self.ast[node].children.clone();
                for name in names {
                    let text = self.name_text(name);
                    self.declare(&text);
                }
            }
            AstKind::Member => {
                let lhs = self.ast[node].lhs();
                let rhs = self.ast[node].rhs();
                self.visit(lhs);
                if !self.ast[rhs].is(AstKind::Property) {
                    self.visit(rhs);
                }
            }
            AstKind::ObjectLiteral => {
                // Keys are properties or number literals; only values name
                // things.
                let values = self.ast[node].children.clone();
                for value in values {
                    self.visit(value);
                }
            }
            AstKind::Property | AstKind::Number | AstKind::String | AstKind::True
            | AstKind::False | AstKind::Nil | AstKind::Nop => {}
            _ => {
                let children = self.ast[node].children.clone();
                for child in children {
                    self.visit(child);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse;

    fn resolved(src: &str) -> (Ast, NodeId) {
        let mut ast = Ast::new();
        let entry = parse(src, &mut ast).expect("parse failed");
        resolve(&mut ast, src, entry);
        (ast, entry)
    }

    /// Every resolved slot for uses of the name spelled `name`.
    fn find_value_slot(ast: &Ast, source: &str, name: &str) -> Vec<Slot> {
        let mut out = Vec::new();
        for i in 0..ast.len() {
            let node = &ast[ast.id_at(i)];
            if node.kind == AstKind::Value && node.span.text(source) == name {
                out.push(node.slot.expect("unresolved value"));
            }
        }
        out
    }

    fn function_counts(ast: &Ast, source: &str, name: Option<&str>) -> (u32, u32) {
        for i in 0..ast.len() {
            let node = &ast[ast.id_at(i)];
            if node.kind != AstKind::Function || node.children.is_empty() {
                continue;
            }
            let found = match (name, node.variable) {
                (None, None) => true,
                (Some(n), Some(v)) => ast[v].span.text(source) == n,
                _ => false,
            };
            if found {
                return (node.stack_slots, node.context_slots);
            }
        }
        panic!("function not found");
    }

    #[test]
    fn parameters_are_stack_slots() {
        let src = "f(a, b) { return a }";
        let (ast, _) = resolved(src);
        assert_eq!(function_counts(&ast, src, Some("f")), (2, 0));
        let slots = find_value_slot(&ast, src, "a");
        assert!(slots
            .iter()
            .all(|s| s.storage == SlotStorage::Stack));
    }

    #[test]
    fn closure_promotes_to_context() {
        let src = "f() { c = 0 return g() { c = c + 1 return c } }";
        let (ast, _) = resolved(src);

        // c lives in f's context.
        let (_, f_context) = function_counts(&ast, src, Some("f"));
        assert_eq!(f_context, 1);

        // Uses inside g are context slots one boundary away; f's own
        // assignment is depth 0.
        let slots = find_value_slot(&ast, src, "c");
        assert!(slots.contains(&Slot {
            storage: SlotStorage::Context { depth: 1 },
            index: 0
        }));
        assert!(slots.contains(&Slot {
            storage: SlotStorage::Context { depth: 0 },
            index: 0
        }));
    }

    #[test]
    fn depth_counts_every_function_boundary() {
        let src = "f() { c = 0 return g() { return h() { return c } } }";
        let (ast, _) = resolved(src);
        let slots = find_value_slot(&ast, src, "c");
        assert!(slots.contains(&Slot {
            storage: SlotStorage::Context { depth: 2 },
            index: 0
        }));
        // The crossed function g carries a context so the chain is walkable.
        let (_, g_context) = function_counts(&ast, src, Some("g"));
        assert_eq!(g_context, 1);
        let (_, h_context) = function_counts(&ast, src, Some("h"));
        assert_eq!(h_context, 1);
    }

    #[test]
    fn free_names_resolve_globally() {
        let src = "x = undeclared";
        let (ast, _) = resolved(src);
        let slots = find_value_slot(&ast, src, "undeclared");
        assert_eq!(
            slots,
            vec![Slot {
                storage: SlotStorage::Global,
                index: 0
            }]
        );
    }

    #[test]
    fn builtins_resolve_to_root_slots() {
        let src = "g = global t = number";
        let (ast, _) = resolved(src);
        assert_eq!(
            find_value_slot(&ast, src, "global"),
            vec![Slot {
                storage: SlotStorage::Root,
                index: root_index::GLOBAL
            }]
        );
        assert_eq!(
            find_value_slot(&ast, src, "number"),
            vec![Slot {
                storage: SlotStorage::Root,
                index: root_index::TYPE_NAMES + 3
            }]
        );
    }

    #[test]
    fn scope_declaration_shadows_outer() {
        let src = "f() { c = 0 return g() { scope c c = 1 return c } }";
        let (ast, _) = resolved(src);
        // g's c is its own stack slot; f's c stays unpromoted.
        let (_, f_context) = function_counts(&ast, src, Some("f"));
        assert_eq!(f_context, 0);
        let (g_stack, _) = function_counts(&ast, src, Some("g"));
        assert_eq!(g_stack, 1);
    }

    #[test]
    fn assignment_declares_in_current_scope() {
        let src = "a = 1 b = a + 1";
        let (ast, entry) = resolved(src);
        let _ = entry;
        assert_eq!(function_counts(&ast, src, None), (2, 0));
    }
}
