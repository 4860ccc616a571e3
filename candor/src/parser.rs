//! Hand-written recursive-descent parser with single-token lookahead.
//!
//! Produces the generic AST of `ast.rs`. The whole program parses into one
//! anonymous function node (the entry function); function literals and calls
//! share the `Function` kind — a parenthesised list followed by a `{` block
//! is a literal, without one it is a call.

use crate::ast::{Ast, AstKind, AstNode, NodeId, Span};
use crate::lexer::{LexError, Lexer, Token, TokenKind};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseError {
    pub message: String,
    pub span: Span,
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} at offset {}", self.message, self.span.offset)
    }
}

impl std::error::Error for ParseError {}

impl From<LexError> for ParseError {
    fn from(err: LexError) -> Self {
        ParseError {
            message: err.message,
            span: err.span,
        }
    }
}

/// Parse a whole program into the entry function node.
pub fn parse(source: &str, ast: &mut Ast) -> Result<NodeId, ParseError> {
    let mut parser = Parser::new(source, ast)?;
    parser.parse_program()
}

struct Parser<'a, 'z> {
    lexer: Lexer<'a>,
    lookahead: Token,
    ast: &'z mut Ast,
}

/// Binary operator levels, loosest first.
const BINARY_LEVELS: &[&[(TokenKind, AstKind)]] = &[
    &[(TokenKind::OrOr, AstKind::LOr)],
    &[(TokenKind::AndAnd, AstKind::LAnd)],
    &[(TokenKind::Pipe, AstKind::BOr)],
    &[(TokenKind::Caret, AstKind::BXor)],
    &[(TokenKind::Amp, AstKind::BAnd)],
    &[
        (TokenKind::EqEq, AstKind::Eq),
        (TokenKind::EqEqEq, AstKind::StrictEq),
        (TokenKind::NotEq, AstKind::Ne),
        (TokenKind::NotEqEq, AstKind::StrictNe),
    ],
    &[
        (TokenKind::Lt, AstKind::Lt),
        (TokenKind::Gt, AstKind::Gt),
        (TokenKind::LtEq, AstKind::Le),
        (TokenKind::GtEq, AstKind::Ge),
    ],
    &[(TokenKind::Plus, AstKind::Add), (TokenKind::Minus, AstKind::Sub)],
    &[(TokenKind::Star, AstKind::Mul), (TokenKind::Slash, AstKind::Div)],
];

impl<'a, 'z> Parser<'a, 'z> {
    fn new(source: &'a str, ast: &'z mut Ast) -> Result<Self, ParseError> {
        let mut lexer = Lexer::new(source);
        let lookahead = lexer.next_token()?;
        Ok(Parser {
            lexer,
            lookahead,
            ast,
        })
    }

    fn at(&self, kind: TokenKind) -> bool {
        self.lookahead.kind == kind
    }

    fn bump(&mut self) -> Result<Token, ParseError> {
        let token = self.lookahead;
        self.lookahead = self.lexer.next_token()?;
        Ok(token)
    }

    fn eat(&mut self, kind: TokenKind) -> Result<bool, ParseError> {
        if self.at(kind) {
            self.bump()?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    fn expect(&mut self, kind: TokenKind, what: &str) -> Result<Token, ParseError> {
        if self.at(kind) {
            self.bump()
        } else {
            Err(self.error(format!("expected {}", what)))
        }
    }

    fn error(&self, message: String) -> ParseError {
        ParseError {
            message,
            span: self.lookahead.span,
        }
    }

    fn node(&mut self, kind: AstKind, span: Span) -> NodeId {
        self.ast.alloc(AstNode::new(kind, span))
    }

    // -- program and statements --

    fn parse_program(&mut self) -> Result<NodeId, ParseError> {
        let mut statements = Vec::new();
        while !self.at(TokenKind::Eof) {
            statements.push(self.parse_statement()?);
        }
        let entry = self.node(AstKind::Function, Span::new(0, 0));
        self.ast[entry].children = statements;
        Ok(entry)
    }

    fn parse_statement(&mut self) -> Result<NodeId, ParseError> {
        let span = self.lookahead.span;
        match self.lookahead.kind {
            TokenKind::KwReturn => {
                self.bump()?;
                let node = self.node(AstKind::Return, span);
                if self.starts_expression() {
                    let value = self.parse_expression()?;
                    self.ast[node].children.push(value);
                }
                Ok(node)
            }
            TokenKind::KwBreak => {
                self.bump()?;
                Ok(self.node(AstKind::Break, span))
            }
            TokenKind::KwContinue => {
                self.bump()?;
                Ok(self.node(AstKind::Continue, span))
            }
            TokenKind::KwIf => self.parse_if(),
            TokenKind::KwWhile => {
                self.bump()?;
                self.expect(TokenKind::LParen, "`(` after `while`")?;
                let cond = self.parse_expression()?;
                self.expect(TokenKind::RParen, "`)` after condition")?;
                let body = self.parse_block()?;
                let node = self.node(AstKind::While, span);
                self.ast[node].children = vec![cond, body];
                Ok(node)
            }
            TokenKind::KwScope => {
                self.bump()?;
                let node = self.node(AstKind::ScopeDecl, span);
                loop {
                    let name = self.expect(TokenKind::Ident, "name in `scope` declaration")?;
                    let name = self.node(AstKind::Name, name.span);
                    self.ast[node].children.push(name);
                    if !self.eat(TokenKind::Comma)? {
                        break;
                    }
                }
                Ok(node)
            }
            _ => self.parse_expression(),
        }
    }

    fn parse_if(&mut self) -> Result<NodeId, ParseError> {
        let span = self.lookahead.span;
        self.bump()?;
        self.expect(TokenKind::LParen, "`(` after `if`")?;
        let cond = self.parse_expression()?;
        self.expect(TokenKind::RParen, "`)` after condition")?;
        let then_block = self.parse_block()?;

        let node = self.node(AstKind::If, span);
        self.ast[node].children = vec![cond, then_block];

        if self.eat(TokenKind::KwElse)? {
            let else_block = if self.at(TokenKind::KwIf) {
                let nested = self.parse_if()?;
                let block = self.node(AstKind::Block, span);
                self.ast[block].children.push(nested);
                block
            } else {
                self.parse_block()?
            };
            self.ast[node].children.push(else_block);
        }
        Ok(node)
    }

    fn parse_block(&mut self) -> Result<NodeId, ParseError> {
        let span = self.lookahead.span;
        self.expect(TokenKind::LBrace, "`{`")?;
        let node = self.node(AstKind::Block, span);
        while !self.at(TokenKind::RBrace) {
            if self.at(TokenKind::Eof) {
                return Err(self.error("unterminated block".into()));
            }
            let stmt = self.parse_statement()?;
            self.ast[node].children.push(stmt);
        }
        self.bump()?;
        Ok(node)
    }

    fn starts_expression(&self) -> bool {
        matches!(
            self.lookahead.kind,
            TokenKind::Ident
                | TokenKind::Number
                | TokenKind::Str
                | TokenKind::KwTrue
                | TokenKind::KwFalse
                | TokenKind::KwNil
                | TokenKind::KwNew
                | TokenKind::KwTypeof
                | TokenKind::KwSizeof
                | TokenKind::KwKeysof
                | TokenKind::Bang
                | TokenKind::Plus
                | TokenKind::Minus
                | TokenKind::PlusPlus
                | TokenKind::MinusMinus
                | TokenKind::LParen
                | TokenKind::LBrace
                | TokenKind::LBracket
        )
    }

    // -- expressions --

    fn parse_expression(&mut self) -> Result<NodeId, ParseError> {
        let lhs = self.parse_binary(0)?;
        if self.at(TokenKind::Assign) {
            let span = self.lookahead.span;
            self.bump()?;
            let rhs = self.parse_expression()?;
            let node = self.node(AstKind::Assign, span);
            self.ast[node].children = vec![lhs, rhs];
            return Ok(node);
        }
        Ok(lhs)
    }

    fn parse_binary(&mut self, level: usize) -> Result<NodeId, ParseError> {
        if level >= BINARY_LEVELS.len() {
            return self.parse_unary();
        }
        let mut lhs = self.parse_binary(level + 1)?;
        'outer: loop {
            for &(token, kind) in BINARY_LEVELS[level] {
                if self.at(token) {
                    let span = self.lookahead.span;
                    self.bump()?;
                    let rhs = self.parse_binary(level + 1)?;
                    let node = self.node(kind, span);
                    self.ast[node].children = vec![lhs, rhs];
                    lhs = node;
                    continue 'outer;
                }
            }
            break;
        }
        Ok(lhs)
    }

    fn parse_unary(&mut self) -> Result<NodeId, ParseError> {
        let span = self.lookahead.span;
        match self.lookahead.kind {
            TokenKind::Bang => {
                self.bump()?;
                let operand = self.parse_unary()?;
                let node = self.node(AstKind::Not, span);
                self.ast[node].children.push(operand);
                Ok(node)
            }
            TokenKind::PlusPlus | TokenKind::MinusMinus => {
                let kind = if self.at(TokenKind::PlusPlus) {
                    AstKind::PreInc
                } else {
                    AstKind::PreDec
                };
                self.bump()?;
                let operand = self.parse_unary()?;
                let node = self.node(kind, span);
                self.ast[node].children.push(operand);
                Ok(node)
            }
            TokenKind::Minus | TokenKind::Plus => {
                let op = self.bump()?;
                // A minus glued to a number literal folds into the literal.
                if op.kind == TokenKind::Minus
                    && self.at(TokenKind::Number)
                    && self.lookahead.span.offset == op.span.offset + 1
                {
                    let number = self.bump()?;
                    let span = Span::new(op.span.offset, 1 + number.span.len);
                    return Ok(self.node(AstKind::Number, span));
                }
                // Otherwise `+x` / `-x` lower to `0 + x` / `0 - x`; the zero
                // is a number node with an empty lexeme.
                let operand = self.parse_unary()?;
                let zero = self.node(AstKind::Number, Span::new(op.span.offset, 0));
                let kind = if op.kind == TokenKind::Plus {
                    AstKind::Add
                } else {
                    AstKind::Sub
                };
                let node = self.node(kind, op.span);
                self.ast[node].children = vec![zero, operand];
                Ok(node)
            }
            TokenKind::KwNew | TokenKind::KwTypeof | TokenKind::KwSizeof | TokenKind::KwKeysof => {
                let kind = match self.lookahead.kind {
                    TokenKind::KwNew => AstKind::New,
                    TokenKind::KwTypeof => AstKind::Typeof,
                    TokenKind::KwSizeof => AstKind::Sizeof,
                    _ => AstKind::Keysof,
                };
                self.bump()?;
                let operand = self.parse_unary()?;
                let node = self.node(kind, span);
                self.ast[node].children.push(operand);
                Ok(node)
            }
            _ => self.parse_postfix(),
        }
    }

    fn parse_postfix(&mut self) -> Result<NodeId, ParseError> {
        let mut lhs = self.parse_primary()?;
        loop {
            match self.lookahead.kind {
                TokenKind::Dot => {
                    self.bump()?;
                    let name = self.expect(TokenKind::Ident, "property name after `.`")?;
                    let property = self.node(AstKind::Property, name.span);
                    let node = self.node(AstKind::Member, name.span);
                    self.ast[node].children = vec![lhs, property];
                    lhs = node;
                }
                TokenKind::LBracket => {
                    self.bump()?;
                    let key = self.parse_expression()?;
                    self.expect(TokenKind::RBracket, "`]`")?;
                    let span = self.ast[lhs].span;
                    let node = self.node(AstKind::Member, span);
                    self.ast[node].children = vec![lhs, key];
                    lhs = node;
                }
                TokenKind::LParen => {
                    let span = self.ast[lhs].span;
                    let args = self.parse_paren_list()?;
                    let node = self.node(AstKind::Function, span);
                    self.ast[node].variable = Some(lhs);
                    self.ast[node].aux = args;
                    if self.at(TokenKind::LBrace) {
                        // A body makes this a function literal; declarations
                        // need a plain name and name-only parameters.
                        self.check_declaration(node)?;
                        let body = self.parse_block()?;
                        let mut body_children = std::mem::take(&mut self.ast[body].children);
                        if body_children.is_empty() {
                            // A literal is told apart from a call by having
                            // children, so an empty body keeps a Nop.
                            body_children.push(self.node(AstKind::Nop, span));
                        }
                        self.ast[node].children = body_children;
                    }
                    lhs = node;
                }
                TokenKind::PlusPlus | TokenKind::MinusMinus => {
                    let kind = if self.at(TokenKind::PlusPlus) {
                        AstKind::PostInc
                    } else {
                        AstKind::PostDec
                    };
                    let span = self.lookahead.span;
                    self.bump()?;
                    let node = self.node(kind, span);
                    self.ast[node].children.push(lhs);
                    lhs = node;
                }
                _ => return Ok(lhs),
            }
        }
    }

    fn check_declaration(&self, function: NodeId) -> Result<(), ParseError> {
        let node = &self.ast[function];
        if let Some(variable) = node.variable {
            if !self.ast[variable].is(AstKind::Name) {
                return Err(ParseError {
                    message: "function name must be a plain identifier".into(),
                    span: self.ast[variable].span,
                });
            }
        }
        for &arg in &node.aux {
            if !self.ast[arg].is(AstKind::Name) {
                return Err(ParseError {
                    message: "function parameters must be identifiers".into(),
                    span: self.ast[arg].span,
                });
            }
        }
        Ok(())
    }

    fn parse_paren_list(&mut self) -> Result<Vec<NodeId>, ParseError> {
        self.expect(TokenKind::LParen, "`(`")?;
        let mut items = Vec::new();
        if !self.at(TokenKind::RParen) {
            loop {
                items.push(self.parse_expression()?);
                if !self.eat(TokenKind::Comma)? {
                    break;
                }
            }
        }
        self.expect(TokenKind::RParen, "`)`")?;
        Ok(items)
    }

    fn parse_primary(&mut self) -> Result<NodeId, ParseError> {
        let span = self.lookahead.span;
        match self.lookahead.kind {
            TokenKind::Ident => {
                self.bump()?;
                Ok(self.node(AstKind::Name, span))
            }
            TokenKind::Number => {
                self.bump()?;
                Ok(self.node(AstKind::Number, span))
            }
            TokenKind::Str => {
                self.bump()?;
                Ok(self.node(AstKind::String, span))
            }
            TokenKind::KwTrue => {
                self.bump()?;
                Ok(self.node(AstKind::True, span))
            }
            TokenKind::KwFalse => {
                self.bump()?;
                Ok(self.node(AstKind::False, span))
            }
            TokenKind::KwNil => {
                self.bump()?;
                Ok(self.node(AstKind::Nil, span))
            }
            TokenKind::LParen => {
                // Grouping, or an anonymous function literal when a block
                // follows the parenthesised list.
                let items = self.parse_paren_list()?;
                if self.at(TokenKind::LBrace) {
                    let node = self.node(AstKind::Function, span);
                    self.ast[node].aux = items;
                    self.check_declaration(node)?;
                    let body = self.parse_block()?;
                    let mut body_children = std::mem::take(&mut self.ast[body].children);
                    if body_children.is_empty() {
                        body_children.push(self.node(AstKind::Nop, span));
                    }
                    self.ast[node].children = body_children;
                    return Ok(node);
                }
                if items.len() == 1 {
                    return Ok(items[0]);
                }
                Err(ParseError {
                    message: "expected a function body after parameter list".into(),
                    span,
                })
            }
            TokenKind::LBrace => self.parse_object_literal(),
            TokenKind::LBracket => {
                self.bump()?;
                let node = self.node(AstKind::ArrayLiteral, span);
                if !self.at(TokenKind::RBracket) {
                    loop {
                        let item = self.parse_expression()?;
                        self.ast[node].children.push(item);
                        if !self.eat(TokenKind::Comma)? {
                            break;
                        }
                    }
                }
                self.expect(TokenKind::RBracket, "`]`")?;
                Ok(node)
            }
            _ => Err(self.error("expected an expression".into())),
        }
    }

    fn parse_object_literal(&mut self) -> Result<NodeId, ParseError> {
        let span = self.lookahead.span;
        self.expect(TokenKind::LBrace, "`{`")?;
        let node = self.node(AstKind::ObjectLiteral, span);
        if !self.at(TokenKind::RBrace) {
            loop {
                let key_token = self.bump()?;
                let key = match key_token.kind {
                    TokenKind::Ident | TokenKind::Str => {
                        self.node(AstKind::Property, key_token.span)
                    }
                    TokenKind::Number => self.node(AstKind::Number, key_token.span),
                    _ => {
                        return Err(ParseError {
                            message: "object keys must be names, strings, or numbers".into(),
                            span: key_token.span,
                        })
                    }
                };
                self.expect(TokenKind::Colon, "`:` after object key")?;
                let value = self.parse_expression()?;
                self.ast[node].aux.push(key);
                self.ast[node].children.push(value);
                if !self.eat(TokenKind::Comma)? {
                    break;
                }
                if self.at(TokenKind::RBrace) {
                    break;
                }
            }
        }
        self.expect(TokenKind::RBrace, "`}`")?;
        Ok(node)
    }
}
