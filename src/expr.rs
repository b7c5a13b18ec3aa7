//! Operator escape hatch: a minimal expression evaluator for per-field
//! custom logic (conditional lengths, checksums, derived cross-field
//! values).
//!
//! A script is a `;`-separated statement list. Expressions support integer
//! and string literals, arithmetic and comparison operators, `cond ? a : b`,
//! local variables, and exactly these primitives:
//!
//! - `Name()` — invoke the descendant node `Name`: performs that subtree's
//!   normal parse/generate through the host and yields its value;
//! - a bare dotted path — read a node's last decoded value, a config
//!   setting (`Name.cfg.length`), or a shared context flag (`ctx.flag`),
//!   optionally rooted at the document root (`root.Frag.Field`);
//! - `set(path, expr)` / `del(path)` — write or clear a config setting or
//!   context flag;
//! - `frag(Name)` — invoke a named fragment;
//! - `len(expr)` — byte length of a bytes/string value.
//!
//! The evaluator is sandboxed to the host primitives; there is no other
//! access. The value of the last statement becomes the node's value.

use crate::codec::CodecError;
use crate::value::Value;
use std::collections::HashMap;

/// Engine services exposed to a script. Implemented separately by the
/// parse and generate engines.
pub trait OpHost {
    /// Runs the named descendant node's normal parse/generate and splices
    /// its result into the current aggregate.
    fn invoke(&mut self, name: &str) -> Result<Value, CodecError>;
    /// Runs a named fragment from the document's fragment table.
    fn invoke_fragment(&mut self, name: &str) -> Result<Value, CodecError>;
    /// Reads a dotted path: node last value, `*.cfg.*`, or `ctx.*`.
    fn get_path(&self, path: &str) -> Option<Value>;
    fn set_path(&mut self, path: &str, v: Value) -> Result<(), CodecError>;
    fn del_path(&mut self, path: &str) -> Result<(), CodecError>;
}

#[derive(Debug, Clone, PartialEq)]
pub enum EvalValue {
    Int(i64),
    Bool(bool),
    Str(String),
    Bytes(Vec<u8>),
    Unit,
}

impl EvalValue {
    pub fn into_value(self) -> Value {
        match self {
            EvalValue::Int(n) if n >= 0 => Value::U64(n as u64),
            EvalValue::Int(n) => Value::I64(n),
            EvalValue::Bool(b) => Value::Bool(b),
            EvalValue::Str(s) => Value::Str(s),
            EvalValue::Bytes(b) => Value::Bytes(b),
            EvalValue::Unit => Value::U64(0),
        }
    }

    fn from_value(v: Value) -> EvalValue {
        match v {
            Value::U64(n) => EvalValue::Int(n as i64),
            Value::I64(n) => EvalValue::Int(n),
            Value::Bool(b) => EvalValue::Bool(b),
            Value::Str(s) => EvalValue::Str(s),
            Value::Bytes(b) => EvalValue::Bytes(b),
            Value::Struct(_) | Value::List(_) => EvalValue::Unit,
        }
    }

    fn as_int(&self) -> Result<i64, CodecError> {
        match self {
            EvalValue::Int(n) => Ok(*n),
            EvalValue::Bool(b) => Ok(i64::from(*b)),
            other => Err(op_err(format!("expected number, got {:?}", other))),
        }
    }

    fn truthy(&self) -> bool {
        match self {
            EvalValue::Int(n) => *n != 0,
            EvalValue::Bool(b) => *b,
            EvalValue::Str(s) => !s.is_empty(),
            EvalValue::Bytes(b) => !b.is_empty(),
            EvalValue::Unit => false,
        }
    }
}

fn op_err(msg: String) -> CodecError {
    CodecError::Operator(msg)
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Int(i64),
    Str(String),
    Dot,
    Comma,
    Semi,
    LParen,
    RParen,
    Assign,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Eq,
    Ne,
    Lt,
    Gt,
    Le,
    Ge,
    Question,
    Colon,
}

fn tokenize(src: &str) -> Result<Vec<Token>, CodecError> {
    let mut out = Vec::new();
    let mut chars = src.chars().peekable();
    while let Some(&c) = chars.peek() {
        match c {
            ' ' | '\t' | '\r' | '\n' => {
                chars.next();
            }
            '0'..='9' => {
                let mut num = String::new();
                while let Some(&d) = chars.peek() {
                    if d.is_ascii_alphanumeric() {
                        num.push(d);
                        chars.next();
                    } else {
                        break;
                    }
                }
                let n = if let Some(hex) = num.strip_prefix("0x").or_else(|| num.strip_prefix("0X")) {
                    i64::from_str_radix(hex, 16)
                } else {
                    num.parse()
                }
                .map_err(|_| op_err(format!("bad number `{}`", num)))?;
                out.push(Token::Int(n));
            }
            'a'..='z' | 'A'..='Z' | '_' => {
                let mut ident = String::new();
                while let Some(&d) = chars.peek() {
                    if d.is_ascii_alphanumeric() || d == '_' {
                        ident.push(d);
                        chars.next();
                    } else {
                        break;
                    }
                }
                out.push(Token::Ident(ident));
            }
            '"' => {
                chars.next();
                let mut s = String::new();
                loop {
                    match chars.next() {
                        Some('"') => break,
                        Some('\\') => match chars.next() {
                            Some('n') => s.push('\n'),
                            Some('t') => s.push('\t'),
                            Some(other) => s.push(other),
                            None => return Err(op_err("unterminated string".to_string())),
                        },
                        Some(other) => s.push(other),
                        None => return Err(op_err("unterminated string".to_string())),
                    }
                }
                out.push(Token::Str(s));
            }
            _ => {
                chars.next();
                let tok = match c {
                    '.' => Token::Dot,
                    ',' => Token::Comma,
                    ';' => Token::Semi,
                    '(' => Token::LParen,
                    ')' => Token::RParen,
                    '+' => Token::Plus,
                    '-' => Token::Minus,
                    '*' => Token::Star,
                    '/' => Token::Slash,
                    '%' => Token::Percent,
                    '?' => Token::Question,
                    ':' => Token::Colon,
                    '=' => {
                        if chars.peek() == Some(&'=') {
                            chars.next();
                            Token::Eq
                        } else {
                            Token::Assign
                        }
                    }
                    '!' => {
                        if chars.peek() == Some(&'=') {
                            chars.next();
                            Token::Ne
                        } else {
                            return Err(op_err("stray `!`".to_string()));
                        }
                    }
                    '<' => {
                        if chars.peek() == Some(&'=') {
                            chars.next();
                            Token::Le
                        } else {
                            Token::Lt
                        }
                    }
                    '>' => {
                        if chars.peek() == Some(&'=') {
                            chars.next();
                            Token::Ge
                        } else {
                            Token::Gt
                        }
                    }
                    other => return Err(op_err(format!("unexpected character `{}`", other))),
                };
                out.push(tok);
            }
        }
    }
    Ok(out)
}

/// Runs a script against a host. Returns the last statement's value.
pub fn evaluate(script: &str, host: &mut dyn OpHost) -> Result<EvalValue, CodecError> {
    let tokens = tokenize(script)?;
    let mut ev = Evaluator { tokens, pos: 0, vars: HashMap::new(), host, live: true };
    ev.program()
}

struct Evaluator<'h> {
    tokens: Vec<Token>,
    pos: usize,
    vars: HashMap<String, EvalValue>,
    host: &'h mut dyn OpHost,
    /// Cleared inside the untaken arm of a ternary: tokens are still
    /// parsed, but host calls and semantic errors are suppressed.
    live: bool,
}

impl<'h> Evaluator<'h> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let t = self.tokens.get(self.pos).cloned();
        if t.is_some() {
            self.pos += 1;
        }
        t
    }

    fn eat(&mut self, t: &Token) -> Result<(), CodecError> {
        match self.next() {
            Some(ref got) if got == t => Ok(()),
            got => Err(op_err(format!("expected {:?}, got {:?}", t, got))),
        }
    }

    fn program(&mut self) -> Result<EvalValue, CodecError> {
        let mut last = EvalValue::Unit;
        loop {
            while self.peek() == Some(&Token::Semi) {
                self.pos += 1;
            }
            if self.peek().is_none() {
                return Ok(last);
            }
            last = self.statement()?;
            match self.peek() {
                None => return Ok(last),
                Some(Token::Semi) => {
                    self.pos += 1;
                }
                Some(other) => return Err(op_err(format!("expected `;`, got {:?}", other))),
            }
        }
    }

    fn statement(&mut self) -> Result<EvalValue, CodecError> {
        // `name = expr` assigns a local variable.
        if let Some(Token::Ident(name)) = self.tokens.get(self.pos).cloned() {
            if self.tokens.get(self.pos + 1) == Some(&Token::Assign) {
                self.pos += 2;
                let v = self.expr()?;
                self.vars.insert(name, v.clone());
                return Ok(v);
            }
        }
        self.expr()
    }

    fn expr(&mut self) -> Result<EvalValue, CodecError> {
        let cond = self.comparison()?;
        if self.peek() == Some(&Token::Question) {
            self.pos += 1;
            // Only the taken arm runs; the other is parsed through without
            // host calls, so `cond ? A() : B()` invokes exactly one child.
            let saved = self.live;
            let take_first = saved && cond.truthy();
            self.live = take_first;
            let a = self.expr()?;
            self.eat(&Token::Colon)?;
            self.live = saved && !take_first;
            let b = self.expr()?;
            self.live = saved;
            return Ok(if take_first { a } else { b });
        }
        Ok(cond)
    }

    fn comparison(&mut self) -> Result<EvalValue, CodecError> {
        let lhs = self.additive()?;
        let op = match self.peek() {
            Some(Token::Eq) => Token::Eq,
            Some(Token::Ne) => Token::Ne,
            Some(Token::Lt) => Token::Lt,
            Some(Token::Gt) => Token::Gt,
            Some(Token::Le) => Token::Le,
            Some(Token::Ge) => Token::Ge,
            _ => return Ok(lhs),
        };
        self.pos += 1;
        let rhs = self.additive()?;
        if !self.live {
            return Ok(EvalValue::Unit);
        }
        let result = match (&lhs, &rhs) {
            (EvalValue::Str(a), EvalValue::Str(b)) => match op {
                Token::Eq => a == b,
                Token::Ne => a != b,
                _ => return Err(op_err("strings only compare with == and !=".to_string())),
            },
            (EvalValue::Bytes(a), EvalValue::Bytes(b)) => match op {
                Token::Eq => a == b,
                Token::Ne => a != b,
                _ => return Err(op_err("bytes only compare with == and !=".to_string())),
            },
            _ => {
                let a = lhs.as_int()?;
                let b = rhs.as_int()?;
                match op {
                    Token::Eq => a == b,
                    Token::Ne => a != b,
                    Token::Lt => a < b,
                    Token::Gt => a > b,
                    Token::Le => a <= b,
                    Token::Ge => a >= b,
                    _ => unreachable!(),
                }
            }
        };
        Ok(EvalValue::Bool(result))
    }

    fn additive(&mut self) -> Result<EvalValue, CodecError> {
        let mut acc = self.multiplicative()?;
        loop {
            let plus = match self.peek() {
                Some(Token::Plus) => true,
                Some(Token::Minus) => false,
                _ => return Ok(acc),
            };
            self.pos += 1;
            let rhs = self.multiplicative()?;
            if !self.live {
                acc = EvalValue::Unit;
                continue;
            }
            acc = match (acc, rhs, plus) {
                (EvalValue::Str(a), EvalValue::Str(b), true) => EvalValue::Str(a + &b),
                (EvalValue::Bytes(mut a), EvalValue::Bytes(b), true) => {
                    a.extend_from_slice(&b);
                    EvalValue::Bytes(a)
                }
                (a, b, true) => EvalValue::Int(a.as_int()?.wrapping_add(b.as_int()?)),
                (a, b, false) => EvalValue::Int(a.as_int()?.wrapping_sub(b.as_int()?)),
            };
        }
    }

    fn multiplicative(&mut self) -> Result<EvalValue, CodecError> {
        let mut acc = self.unary()?;
        loop {
            let op = match self.peek() {
                Some(Token::Star) => Token::Star,
                Some(Token::Slash) => Token::Slash,
                Some(Token::Percent) => Token::Percent,
                _ => return Ok(acc),
            };
            self.pos += 1;
            let rhs = self.unary()?;
            if !self.live {
                acc = EvalValue::Unit;
                continue;
            }
            let a = acc.as_int()?;
            let b = rhs.as_int()?;
            acc = EvalValue::Int(match op {
                Token::Star => a.wrapping_mul(b),
                Token::Slash => {
                    if b == 0 {
                        return Err(op_err("division by zero".to_string()));
                    }
                    a / b
                }
                Token::Percent => {
                    if b == 0 {
                        return Err(op_err("division by zero".to_string()));
                    }
                    a % b
                }
                _ => unreachable!(),
            });
        }
    }

    fn unary(&mut self) -> Result<EvalValue, CodecError> {
        if self.peek() == Some(&Token::Minus) {
            self.pos += 1;
            let v = self.unary()?;
            if !self.live {
                return Ok(EvalValue::Unit);
            }
            return Ok(EvalValue::Int(v.as_int()?.wrapping_neg()));
        }
        self.primary()
    }

    fn primary(&mut self) -> Result<EvalValue, CodecError> {
        match self.next() {
            Some(Token::Int(n)) => Ok(EvalValue::Int(n)),
            Some(Token::Str(s)) => Ok(EvalValue::Str(s)),
            Some(Token::LParen) => {
                let v = self.expr()?;
                self.eat(&Token::RParen)?;
                Ok(v)
            }
            Some(Token::Ident(first)) => self.path_or_call(first),
            other => Err(op_err(format!("unexpected token {:?}", other))),
        }
    }

    /// Parses a dotted path after its first segment.
    fn path_rest(&mut self, first: String) -> Result<String, CodecError> {
        let mut path = first;
        while self.peek() == Some(&Token::Dot) {
            self.pos += 1;
            match self.next() {
                Some(Token::Ident(seg)) => {
                    path.push('.');
                    path.push_str(&seg);
                }
                other => return Err(op_err(format!("expected path segment, got {:?}", other))),
            }
        }
        Ok(path)
    }

    fn path_or_call(&mut self, first: String) -> Result<EvalValue, CodecError> {
        let path = self.path_rest(first)?;
        if self.peek() == Some(&Token::LParen) {
            self.pos += 1;
            return self.call(path);
        }
        if !self.live {
            return Ok(EvalValue::Unit);
        }
        // Bare name: local variable, then host path lookup.
        if !path.contains('.') {
            if let Some(v) = self.vars.get(&path) {
                return Ok(v.clone());
            }
        }
        match self.host.get_path(&path) {
            Some(v) => Ok(EvalValue::from_value(v)),
            None => Err(op_err(format!("unknown name `{}`", path))),
        }
    }

    fn call(&mut self, name: String) -> Result<EvalValue, CodecError> {
        match name.as_str() {
            "set" => {
                let target = match self.next() {
                    Some(Token::Ident(first)) => self.path_rest(first)?,
                    other => return Err(op_err(format!("set: expected path, got {:?}", other))),
                };
                self.eat(&Token::Comma)?;
                let v = self.expr()?;
                self.eat(&Token::RParen)?;
                if self.live {
                    self.host.set_path(&target, v.clone().into_value())?;
                }
                Ok(v)
            }
            "del" => {
                let target = match self.next() {
                    Some(Token::Ident(first)) => self.path_rest(first)?,
                    other => return Err(op_err(format!("del: expected path, got {:?}", other))),
                };
                self.eat(&Token::RParen)?;
                if self.live {
                    self.host.del_path(&target)?;
                }
                Ok(EvalValue::Unit)
            }
            "get" => {
                let target = match self.next() {
                    Some(Token::Ident(first)) => self.path_rest(first)?,
                    other => return Err(op_err(format!("get: expected path, got {:?}", other))),
                };
                self.eat(&Token::RParen)?;
                if !self.live {
                    return Ok(EvalValue::Unit);
                }
                match self.host.get_path(&target) {
                    Some(v) => Ok(EvalValue::from_value(v)),
                    None => Err(op_err(format!("get: unknown path `{}`", target))),
                }
            }
            "frag" => {
                let frag = match self.next() {
                    Some(Token::Ident(f)) => f,
                    other => return Err(op_err(format!("frag: expected name, got {:?}", other))),
                };
                self.eat(&Token::RParen)?;
                if !self.live {
                    return Ok(EvalValue::Unit);
                }
                Ok(EvalValue::from_value(self.host.invoke_fragment(&frag)?))
            }
            "len" => {
                let v = self.expr()?;
                self.eat(&Token::RParen)?;
                if !self.live {
                    return Ok(EvalValue::Unit);
                }
                let n = match &v {
                    EvalValue::Bytes(b) => b.len(),
                    EvalValue::Str(s) => s.len(),
                    other => return Err(op_err(format!("len: expected bytes/string, got {:?}", other))),
                };
                Ok(EvalValue::Int(n as i64))
            }
            _ => {
                if name.contains('.') {
                    return Err(op_err(format!("cannot call path `{}`", name)));
                }
                self.eat(&Token::RParen)?;
                if !self.live {
                    return Ok(EvalValue::Unit);
                }
                Ok(EvalValue::from_value(self.host.invoke(&name)?))
            }
        }
    }
}
