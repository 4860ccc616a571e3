//! AST node representation and the bracketed debug printer.
//!
//! Nodes are generic: a kind tag, a lexeme span into the source, an ordered
//! child list, and the per-kind extras (argument or key lists, the resolved
//! slot descriptor, per-function slot counts). The parser builds them, the
//! resolver rewrites `Name` nodes into `Value` nodes carrying slots, and the
//! code generator walks them.

use crate::scope::Slot;
use crate::zone::{Zone, ZoneId};

pub type NodeId = ZoneId<AstNode>;
pub type Ast = Zone<AstNode>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AstKind {
    // Structural kinds.
    Block,
    ScopeDecl,
    Member,
    Value,
    Property,
    Assign,
    If,
    While,
    Break,
    Continue,
    Return,
    Function,
    ObjectLiteral,
    ArrayLiteral,
    New,
    Typeof,
    Sizeof,
    Keysof,
    PreInc,
    PreDec,
    PostInc,
    PostDec,
    Not,
    // Lexer-derived kinds.
    Name,
    Number,
    String,
    True,
    False,
    Nil,
    Add,
    Sub,
    Div,
    Mul,
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
    Nop,
}

impl AstKind {
    fn print_name(self) -> &'static str {
        match self {
            AstKind::Block => "kBlock",
            AstKind::ScopeDecl => "kScopeDecl",
            AstKind::Member => "kMember",
            AstKind::Value => "kValue",
            AstKind::Property => "kProperty",
            AstKind::Assign => "kAssign",
            AstKind::If => "kIf",
            AstKind::While => "kWhile",
            AstKind::Break => "kBreak",
            AstKind::Continue => "kContinue",
            AstKind::Return => "kReturn",
            AstKind::Function => "kFunction",
            AstKind::ObjectLiteral => "kObjectLiteral",
            AstKind::ArrayLiteral => "kArrayLiteral",
            AstKind::New => "kNew",
            AstKind::Typeof => "kTypeof",
            AstKind::Sizeof => "kSizeof",
            AstKind::Keysof => "kKeysof",
            AstKind::PreInc => "kPreInc",
            AstKind::PreDec => "kPreDec",
            AstKind::PostInc => "kPostInc",
            AstKind::PostDec => "kPostDec",
            AstKind::Not => "kNot",
            AstKind::Name => "kName",
            AstKind::Number => "kNumber",
            AstKind::String => "kString",
            AstKind::True => "kTrue",
            AstKind::False => "kFalse",
            AstKind::Nil => "kNil",
            AstKind::Add => "kAdd",
            AstKind::Sub => "kSub",
            AstKind::Div => "kDiv",
            AstKind::Mul => "kMul",
            AstKind::BAnd => "kBAnd",
            AstKind::BOr => "kBOr",
            AstKind::BXor => "kBXor",
            AstKind::Eq => "kEq",
            AstKind::StrictEq => "kStrictEq",
            AstKind::Ne => "kNe",
            AstKind::StrictNe => "kStrictNe",
            AstKind::Lt => "kLt",
            AstKind::Gt => "kGt",
            AstKind::Le => "kLe",
            AstKind::Ge => "kGe",
            AstKind::LOr => "kLOr",
            AstKind::LAnd => "kLAnd",
            AstKind::Nop => "kNop",
        }
    }

    /// Kinds whose lexeme is part of the printed form.
    fn carries_lexeme(self) -> bool {
        matches!(
            self,
            AstKind::Name | AstKind::Value | AstKind::Number | AstKind::String | AstKind::Property
        )
    }
}

/// A byte range into the source: the node's lexeme for leaf kinds, the
/// covered extent otherwise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Span {
    pub offset: u32,
    pub len: u32,
}

impl Span {
    pub fn new(offset: u32, len: u32) -> Span {
        Span { offset, len }
    }

    pub fn text<'a>(&self, source: &'a str) -> &'a str {
        &source[self.offset as usize..(self.offset + self.len) as usize]
    }
}

pub struct AstNode {
    pub kind: AstKind,
    pub span: Span,
    pub children: Vec<NodeId>,
    /// Function argument names, or object-literal keys.
    pub aux: Vec<NodeId>,
    /// Function name (declarations) or callee expression (calls).
    pub variable: Option<NodeId>,
    /// Filled by the resolver on function nodes.
    pub stack_slots: u32,
    pub context_slots: u32,
    /// Filled by the resolver on `Value` nodes.
    pub slot: Option<Slot>,
}

impl AstNode {
    pub fn new(kind: AstKind, span: Span) -> AstNode {
        AstNode {
            kind,
            span,
            children: Vec::new(),
            aux: Vec::new(),
            variable: None,
            stack_slots: 0,
            context_slots: 0,
            slot: None,
        }
    }

    pub fn is(&self, kind: AstKind) -> bool {
        self.kind == kind
    }

    pub fn lhs(&self) -> NodeId {
        self.children[0]
    }

    pub fn rhs(&self) -> NodeId {
        self.children[1]
    }
}

// ---------------------------------------------------------------------------
// Printer — the canonical testing aid
// ---------------------------------------------------------------------------

/// Render a node in the bracketed S-expression-like form:
/// `[kName foo]`, `[kNumber 42]`, `[kFunction name @[args...] body...]`.
pub fn print_ast(ast: &Ast, source: &str, node: NodeId) -> String {
    let mut out = String::new();
    print_node(ast, source, node, &mut out);
    out
}

fn print_node(ast: &Ast, source: &str, id: NodeId, out: &mut String) {
    let node = &ast[id];
    out.push('[');
    out.push_str(node.kind.print_name());

    if node.kind == AstKind::Function {
        out.push(' ');
        match node.variable {
            Some(v) => print_node(ast, source, v, out),
            None => out.push_str("(anonymous)"),
        }
        out.push_str(" @[");
        print_children(ast, source, &node.aux, out);
        out.push(']');
        if !node.children.is_empty() {
            out.push(' ');
            print_children(ast, source, &node.children, out);
        }
        out.push(']');
        return;
    }

    if node.kind.carries_lexeme() && node.span.len > 0 {
        out.push(' ');
        out.push_str(node.span.text(source));
    }
    if !node.children.is_empty() {
        out.push(' ');
        print_children(ast, source, &node.children, out);
    }
    if node.kind == AstKind::ObjectLiteral && !node.aux.is_empty() {
        // Keys interleave with the value children in source order.
        out.push_str(" @[");
        print_children(ast, source, &node.aux, out);
        out.push(']');
    }
    out.push(']');
}

fn print_children(ast: &Ast, source: &str, children: &[NodeId], out: &mut String) {
    for (i, &child) in children.iter().enumerate() {
        if i > 0 {
            out.push(' ');
        }
        print_node(ast, source, child, out);
    }
}
