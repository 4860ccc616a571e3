//! Tokenizer for Candor source.
//!
//! Tokens carry byte spans into the source rather than owned text; the AST
//! keeps the same spans as lexemes. String tokens span the body between the
//! quotes with escapes unresolved (the generator unescapes once, at intern
//! time).

use crate::ast::Span;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    Eof,

    Ident,
    Number,
    Str,

    // Keywords.
    KwIf,
    KwElse,
    KwWhile,
    KwBreak,
    KwContinue,
    KwReturn,
    KwNew,
    KwTypeof,
    KwSizeof,
    KwKeysof,
    KwNil,
    KwTrue,
    KwFalse,
    KwScope,

    // Delimiters.
    LParen,
    RParen,
    LBrace,
    RBrace,
    LBracket,
    RBracket,
    Comma,
    Colon,
    Dot,

    // Operators.
    Assign,
    Plus,
    Minus,
    Star,
    Slash,
    Amp,
    Pipe,
    Caret,
    Bang,
    EqEq,
    EqEqEq,
    NotEq,
    NotEqEq,
    Lt,
    Gt,
    LtEq,
    GtEq,
    AndAnd,
    OrOr,
    PlusPlus,
    MinusMinus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Token {
    pub kind: TokenKind,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LexError {
    pub message: String,
    pub span: Span,
}

impl fmt::Display for LexError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} at offset {}", self.message, self.span.offset)
    }
}

impl std::error::Error for LexError {}

pub struct Lexer<'a> {
    src: &'a [u8],
    pos: usize,
}

impl<'a> Lexer<'a> {
    pub fn new(src: &'a str) -> Lexer<'a> {
        Lexer {
            src: src.as_bytes(),
            pos: 0,
        }
    }

    fn peek(&self) -> u8 {
        self.src.get(self.pos).copied().unwrap_or(0)
    }

    fn peek_at(&self, ahead: usize) -> u8 {
        self.src.get(self.pos + ahead).copied().unwrap_or(0)
    }

    fn skip_trivia(&mut self) -> Result<(), LexError> {
        loop {
            match self.peek() {
                b' ' | b'\t' | b'\r' | b'\n' => self.pos += 1,
                b'/' if self.peek_at(1) == b'/' => {
                    while self.pos < self.src.len() && self.peek() != b'\n' {
                        self.pos += 1;
                    }
                }
                b'/' if self.peek_at(1) == b'*' => {
                    let start = self.pos;
                    self.pos += 2;
                    loop {
                        if self.pos >= self.src.len() {
                            return Err(LexError {
                                message: "unterminated block comment".into(),
                                span: Span::new(start as u32, 2),
                            });
                        }
                        if self.peek() == b'*' && self.peek_at(1) == b'/' {
                            self.pos += 2;
                            break;
                        }
                        self.pos += 1;
                    }
                }
                _ => return Ok(()),
            }
        }
    }

    fn token(&self, kind: TokenKind, start: usize) -> Token {
        Token {
            kind,
            span: Span::new(start as u32, (self.pos - start) as u32),
        }
    }

    pub fn next_token(&mut self) -> Result<Token, LexError> {
        self.skip_trivia()?;
        let start = self.pos;

        if self.pos >= self.src.len() {
            return Ok(self.token(TokenKind::Eof, start));
        }

        let c = self.peek();

        if c.is_ascii_alphabetic() || c == b'_' || c == b'$' {
            loop {
                let c = self.peek();
                if !c.is_ascii_alphanumeric() && c != b'_' && c != b'$' {
                    break;
                }
                self.pos += 1;
            }
            let text = &self.src[start..self.pos];
            let kind = match text {
                b"if" => TokenKind::KwIf,
                b"else" => TokenKind::KwElse,
                b"while" => TokenKind::KwWhile,
                b"break" => TokenKind::KwBreak,
                b"continue" => TokenKind::KwContinue,
                b"return" => TokenKind::KwReturn,
                b"new" => TokenKind::KwNew,
                b"typeof" => TokenKind::KwTypeof,
                b"sizeof" => TokenKind::KwSizeof,
                b"keysof" => TokenKind::KwKeysof,
                b"nil" => TokenKind::KwNil,
                b"true" => TokenKind::KwTrue,
                b"false" => TokenKind::KwFalse,
                b"scope" => TokenKind::KwScope,
                _ => TokenKind::Ident,
            };
            return Ok(self.token(kind, start));
        }

        if c.is_ascii_digit() {
            while self.peek().is_ascii_digit() {
                self.pos += 1;
            }
            if self.peek() == b'.' && self.peek_at(1).is_ascii_digit() {
                self.pos += 1;
                while self.peek().is_ascii_digit() {
                    self.pos += 1;
                }
            }
            return Ok(self.token(TokenKind::Number, start));
        }

        if c == b'"' {
            self.pos += 1;
            let body_start = self.pos;
            loop {
                match self.peek() {
                    0 => {
                        return Err(LexError {
                            message: "unterminated string literal".into(),
                            span: Span::new(start as u32, 1),
                        })
                    }
                    b'"' => break,
                    b'\\' => self.pos += 2,
                    _ => self.pos += 1,
                }
            }
            let span = Span::new(body_start as u32, (self.pos - body_start) as u32);
            self.pos += 1;
            return Ok(Token {
                kind: TokenKind::Str,
                span,
            });
        }

        self.pos += 1;
        let kind = match c {
            b'(' => TokenKind::LParen,
            b')' => TokenKind::RParen,
            b'{' => TokenKind::LBrace,
            b'}' => TokenKind::RBrace,
            b'[' => TokenKind::LBracket,
            b']' => TokenKind::RBracket,
            b',' => TokenKind::Comma,
            b':' => TokenKind::Colon,
            b'.' => TokenKind::Dot,
            b'*' => TokenKind::Star,
            b'/' => TokenKind::Slash,
            b'^' => TokenKind::Caret,
            b'+' => {
                if self.peek() == b'+' {
                    self.pos += 1;
                    TokenKind::PlusPlus
                } else {
                    TokenKind::Plus
                }
            }
            b'-' => {
                if self.peek() == b'-' {
                    self.pos += 1;
                    TokenKind::MinusMinus
                } else {
                    TokenKind::Minus
                }
            }
            b'&' => {
                if self.peek() == b'&' {
                    self.pos += 1;
                    TokenKind::AndAnd
                } else {
                    TokenKind::Amp
                }
            }
            b'|' => {
                if self.peek() == b'|' {
                    self.pos += 1;
                    TokenKind::OrOr
                } else {
                    TokenKind::Pipe
                }
            }
            b'=' => {
                if self.peek() == b'=' {
                    self.pos += 1;
                    if self.peek() == b'=' {
                        self.pos += 1;
                        TokenKind::EqEqEq
                    } else {
                        TokenKind::EqEq
                    }
                } else {
                    TokenKind::Assign
                }
            }
            b'!' => {
                if self.peek() == b'=' {
                    self.pos += 1;
                    if self.peek() == b'=' {
                        self.pos += 1;
                        TokenKind::NotEqEq
                    } else {
                        TokenKind::NotEq
                    }
                } else {
                    TokenKind::Bang
                }
            }
            b'<' => {
                if self.peek() == b'=' {
                    self.pos += 1;
                    TokenKind::LtEq
                } else {
                    TokenKind::Lt
                }
            }
            b'>' => {
                if self.peek() == b'=' {
                    self.pos += 1;
                    TokenKind::GtEq
                } else {
                    TokenKind::Gt
                }
            }
            other => {
                return Err(LexError {
                    message: format!("unexpected character `{}`", other as char),
                    span: Span::new(start as u32, 1),
                })
            }
        };
        Ok(self.token(kind, start))
    }
}
