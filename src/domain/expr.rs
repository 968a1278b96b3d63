//! Column expression language
//!
//! Filters and string-expression variables are written as small arithmetic
//! and boolean expressions over named columns:
//!
//! ```text
//! njet >= 2 && abs(lep_eta) < 2.5
//! sqrt(pow(met_x, 2) + pow(met_y, 2))
//! ```
//!
//! Booleans evaluate to `1.0`/`0.0`; any value `> 0` is truthy.
//! Column references keep their source spans so an expression can be
//! re-rendered with physical column names without touching anything else.

use std::fmt;
use std::ops::Range;

use thiserror::Error;

/// Expression could not be parsed.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("invalid expression '{text}': {reason}")]
pub struct ExprError {
    pub text: String,
    pub reason: String,
}

impl ExprError {
    fn new(text: &str, reason: impl Into<String>) -> Self {
        Self {
            text: text.to_string(),
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone)]
enum Ast {
    Const(f64),
    Column(usize),
    Neg(Box<Ast>),
    Not(Box<Ast>),
    Binary(BinaryOp, Box<Ast>, Box<Ast>),
    Call(Func, Vec<Ast>),
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
    And,
    Or,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Func {
    Abs,
    Sqrt,
    Log,
    Exp,
    Pow,
    Min,
    Max,
}

impl Func {
    fn lookup(name: &str) -> Option<Self> {
        match name {
            "abs" => Some(Func::Abs),
            "sqrt" => Some(Func::Sqrt),
            "log" => Some(Func::Log),
            "exp" => Some(Func::Exp),
            "pow" => Some(Func::Pow),
            "min" => Some(Func::Min),
            "max" => Some(Func::Max),
            _ => None,
        }
    }

    fn arity(self) -> usize {
        match self {
            Func::Pow | Func::Min | Func::Max => 2,
            _ => 1,
        }
    }
}

/// A parsed column expression.
#[derive(Debug, Clone)]
pub struct Expression {
    source: String,
    ast: Ast,
    columns: Vec<String>,
    /// Byte span of every column reference and the column slot it binds to
    spans: Vec<(Range<usize>, usize)>,
}

impl Expression {
    pub fn parse(text: &str) -> Result<Self, ExprError> {
        let tokens = tokenize(text)?;
        if tokens.is_empty() {
            return Err(ExprError::new(text, "empty expression"));
        }
        let mut parser = Parser {
            text,
            tokens: &tokens,
            pos: 0,
            columns: Vec::new(),
            spans: Vec::new(),
        };
        let ast = parser.parse_or()?;
        if let Some(token) = parser.peek() {
            return Err(ExprError::new(
                text,
                format!("unexpected trailing {}", token.kind),
            ));
        }
        let Parser { columns, spans, .. } = parser;
        Ok(Self {
            source: text.to_string(),
            ast,
            columns,
            spans,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Referenced columns, in order of first occurrence.
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Re-render the source with every column reference mapped through `rename`.
    ///
    /// Only whole column tokens are replaced; function names, literals and
    /// spacing are kept as written.
    pub fn rewrite<F>(&self, mut rename: F) -> String
    where
        F: FnMut(&str) -> String,
    {
        let mut out = String::with_capacity(self.source.len());
        let mut cursor = 0;
        for (span, slot) in &self.spans {
            out.push_str(&self.source[cursor..span.start]);
            out.push_str(&rename(&self.columns[*slot]));
            cursor = span.end;
        }
        out.push_str(&self.source[cursor..]);
        out
    }

    /// Evaluate with `values[i]` bound to `columns()[i]`.
    pub fn eval(&self, values: &[f64]) -> f64 {
        eval(&self.ast, values)
    }

    pub fn is_truthy(value: f64) -> bool {
        value > 0.0
    }
}

impl fmt::Display for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

fn truth(value: bool) -> f64 {
    if value {
        1.0
    } else {
        0.0
    }
}

fn eval(ast: &Ast, values: &[f64]) -> f64 {
    match ast {
        Ast::Const(v) => *v,
        Ast::Column(slot) => values.get(*slot).copied().unwrap_or(f64::NAN),
        Ast::Neg(inner) => -eval(inner, values),
        Ast::Not(inner) => truth(!Expression::is_truthy(eval(inner, values))),
        Ast::Binary(op, lhs, rhs) => {
            let a = eval(lhs, values);
            // short-circuit like the host language would
            match op {
                BinaryOp::And if !Expression::is_truthy(a) => return 0.0,
                BinaryOp::Or if Expression::is_truthy(a) => return 1.0,
                _ => {}
            }
            let b = eval(rhs, values);
            match op {
                BinaryOp::Add => a + b,
                BinaryOp::Sub => a - b,
                BinaryOp::Mul => a * b,
                BinaryOp::Div => a / b,
                BinaryOp::Lt => truth(a < b),
                BinaryOp::Le => truth(a <= b),
                BinaryOp::Gt => truth(a > b),
                BinaryOp::Ge => truth(a >= b),
                BinaryOp::Eq => truth(a == b),
                BinaryOp::Ne => truth(a != b),
                BinaryOp::And | BinaryOp::Or => truth(Expression::is_truthy(b)),
            }
        }
        Ast::Call(func, args) => {
            let a = eval(&args[0], values);
            match func {
                Func::Abs => a.abs(),
                Func::Sqrt => a.sqrt(),
                Func::Log => a.ln(),
                Func::Exp => a.exp(),
                Func::Pow => a.powf(eval(&args[1], values)),
                Func::Min => a.min(eval(&args[1], values)),
                Func::Max => a.max(eval(&args[1], values)),
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tokenizer

#[derive(Debug, Clone, PartialEq)]
enum TokenKind {
    Number(f64),
    Ident(String),
    Op(&'static str),
    LParen,
    RParen,
    Comma,
}

impl fmt::Display for TokenKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TokenKind::Number(n) => write!(f, "number {n}"),
            TokenKind::Ident(name) => write!(f, "identifier '{name}'"),
            TokenKind::Op(op) => write!(f, "operator '{op}'"),
            TokenKind::LParen => f.write_str("'('"),
            TokenKind::RParen => f.write_str("')'"),
            TokenKind::Comma => f.write_str("','"),
        }
    }
}

#[derive(Debug, Clone)]
struct Token {
    kind: TokenKind,
    span: Range<usize>,
}

const OPERATORS: [&str; 14] = [
    "<=", ">=", "==", "!=", "&&", "||", "<", ">", "+", "-", "*", "/", "!", "=",
];

fn tokenize(text: &str) -> Result<Vec<Token>, ExprError> {
    let bytes = text.as_bytes();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < bytes.len() {
        let c = bytes[i];
        if c.is_ascii_whitespace() {
            i += 1;
            continue;
        }
        let start = i;
        if c.is_ascii_digit() || (c == b'.' && bytes.get(i + 1).is_some_and(u8::is_ascii_digit)) {
            while i < bytes.len() && (bytes[i].is_ascii_digit() || bytes[i] == b'.') {
                i += 1;
            }
            if i < bytes.len() && (bytes[i] == b'e' || bytes[i] == b'E') {
                let mut j = i + 1;
                if j < bytes.len() && (bytes[j] == b'+' || bytes[j] == b'-') {
                    j += 1;
                }
                if j < bytes.len() && bytes[j].is_ascii_digit() {
                    i = j;
                    while i < bytes.len() && bytes[i].is_ascii_digit() {
                        i += 1;
                    }
                }
            }
            let literal = &text[start..i];
            let value = literal
                .parse::<f64>()
                .map_err(|_| ExprError::new(text, format!("bad number literal '{literal}'")))?;
            tokens.push(Token {
                kind: TokenKind::Number(value),
                span: start..i,
            });
            continue;
        }
        if c.is_ascii_alphabetic() || c == b'_' {
            while i < bytes.len() && (bytes[i].is_ascii_alphanumeric() || bytes[i] == b'_') {
                i += 1;
            }
            tokens.push(Token {
                kind: TokenKind::Ident(text[start..i].to_string()),
                span: start..i,
            });
            continue;
        }
        let kind = match c {
            b'(' => Some(TokenKind::LParen),
            b')' => Some(TokenKind::RParen),
            b',' => Some(TokenKind::Comma),
            _ => None,
        };
        if let Some(kind) = kind {
            i += 1;
            tokens.push(Token {
                kind,
                span: start..i,
            });
            continue;
        }
        let op = OPERATORS
            .iter()
            .find(|op| text[i..].starts_with(**op))
            .ok_or_else(|| {
                let found = text[i..].chars().next().unwrap_or('?');
                ExprError::new(text, format!("unexpected character '{found}'"))
            })?;
        if *op == "=" {
            return Err(ExprError::new(text, "use '==' for comparison"));
        }
        i += op.len();
        tokens.push(Token {
            kind: TokenKind::Op(op),
            span: start..i,
        });
    }
    Ok(tokens)
}

// ---------------------------------------------------------------------------
// Parser

struct Parser<'a> {
    text: &'a str,
    tokens: &'a [Token],
    pos: usize,
    columns: Vec<String>,
    spans: Vec<(Range<usize>, usize)>,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<&'a Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<&'a Token> {
        let token = self.tokens.get(self.pos);
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn eat_op(&mut self, ops: &[&'static str]) -> Option<&'static str> {
        match self.peek() {
            Some(Token {
                kind: TokenKind::Op(op),
                ..
            }) if ops.contains(op) => {
                self.pos += 1;
                Some(op)
            }
            _ => None,
        }
    }

    fn expect(&mut self, expected: TokenKind) -> Result<(), ExprError> {
        match self.next() {
            Some(token) if token.kind == expected => Ok(()),
            Some(token) => Err(self.error(format!("expected {expected}, found {}", token.kind))),
            None => Err(self.error(format!("expected {expected}, found end of input"))),
        }
    }

    fn error(&self, reason: String) -> ExprError {
        ExprError::new(self.text, reason)
    }

    fn bind_column(&mut self, name: &str, span: Range<usize>) -> usize {
        let slot = match self.columns.iter().position(|c| c == name) {
            Some(slot) => slot,
            None => {
                self.columns.push(name.to_string());
                self.columns.len() - 1
            }
        };
        self.spans.push((span, slot));
        slot
    }

    fn parse_or(&mut self) -> Result<Ast, ExprError> {
        let mut lhs = self.parse_and()?;
        while self.eat_op(&["||"]).is_some() {
            let rhs = self.parse_and()?;
            lhs = Ast::Binary(BinaryOp::Or, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_and(&mut self) -> Result<Ast, ExprError> {
        let mut lhs = self.parse_cmp()?;
        while self.eat_op(&["&&"]).is_some() {
            let rhs = self.parse_cmp()?;
            lhs = Ast::Binary(BinaryOp::And, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_cmp(&mut self) -> Result<Ast, ExprError> {
        let lhs = self.parse_add()?;
        let op = match self.eat_op(&["<", "<=", ">", ">=", "==", "!="]) {
            Some("<") => BinaryOp::Lt,
            Some("<=") => BinaryOp::Le,
            Some(">") => BinaryOp::Gt,
            Some(">=") => BinaryOp::Ge,
            Some("==") => BinaryOp::Eq,
            Some(_) => BinaryOp::Ne,
            None => return Ok(lhs),
        };
        let rhs = self.parse_add()?;
        Ok(Ast::Binary(op, Box::new(lhs), Box::new(rhs)))
    }

    fn parse_add(&mut self) -> Result<Ast, ExprError> {
        let mut lhs = self.parse_mul()?;
        while let Some(op) = self.eat_op(&["+", "-"]) {
            let rhs = self.parse_mul()?;
            let op = if op == "+" { BinaryOp::Add } else { BinaryOp::Sub };
            lhs = Ast::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_mul(&mut self) -> Result<Ast, ExprError> {
        let mut lhs = self.parse_unary()?;
        while let Some(op) = self.eat_op(&["*", "/"]) {
            let rhs = self.parse_unary()?;
            let op = if op == "*" { BinaryOp::Mul } else { BinaryOp::Div };
            lhs = Ast::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_unary(&mut self) -> Result<Ast, ExprError> {
        match self.eat_op(&["-", "!", "+"]) {
            Some("-") => Ok(Ast::Neg(Box::new(self.parse_unary()?))),
            Some("!") => Ok(Ast::Not(Box::new(self.parse_unary()?))),
            Some(_) => self.parse_unary(),
            None => self.parse_atom(),
        }
    }

    fn parse_atom(&mut self) -> Result<Ast, ExprError> {
        let token = self
            .next()
            .ok_or_else(|| self.error("unexpected end of input".to_string()))?;
        match &token.kind {
            TokenKind::Number(value) => Ok(Ast::Const(*value)),
            TokenKind::LParen => {
                let inner = self.parse_or()?;
                self.expect(TokenKind::RParen)?;
                Ok(inner)
            }
            TokenKind::Ident(name) => {
                let is_call = matches!(
                    self.peek(),
                    Some(Token {
                        kind: TokenKind::LParen,
                        ..
                    })
                );
                if is_call {
                    return self.parse_call(name);
                }
                match name.as_str() {
                    "true" => Ok(Ast::Const(1.0)),
                    "false" => Ok(Ast::Const(0.0)),
                    _ => Ok(Ast::Column(self.bind_column(name, token.span.clone()))),
                }
            }
            other => Err(self.error(format!("unexpected {other}"))),
        }
    }

    fn parse_call(&mut self, name: &str) -> Result<Ast, ExprError> {
        let func =
            Func::lookup(name).ok_or_else(|| self.error(format!("unknown function '{name}'")))?;
        self.expect(TokenKind::LParen)?;
        let mut args = vec![self.parse_or()?];
        while matches!(
            self.peek(),
            Some(Token {
                kind: TokenKind::Comma,
                ..
            })
        ) {
            self.pos += 1;
            args.push(self.parse_or()?);
        }
        self.expect(TokenKind::RParen)?;
        if args.len() != func.arity() {
            return Err(self.error(format!(
                "{name}() takes {} argument(s), got {}",
                func.arity(),
                args.len()
            )));
        }
        Ok(Ast::Call(func, args))
    }
}
