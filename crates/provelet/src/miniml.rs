//! A miniature ML evaluator implementing [`EngineRuntime`].
//!
//! This is the in-crate stand-in for the real prover process: enough of an
//! ML subset to run the code the converter framework generates plus small
//! user expressions — literals, unary constructors declared via
//! `exception`, multi-clause `fn` with nested patterns, juxtaposition
//! application, `*`/`+`/`-`/`^` infixes, `raise`, and the builtins
//! `string_of_int` and `map`. Tests and demos drive a real engine loop with
//! it; it is not, and does not try to be, a theorem prover.
//!
//! Values are immutable and `Send` (Arc-based closures, no interior
//! mutability), as [`EngineRuntime`] requires.

use std::collections::HashMap;
use std::sync::Arc;

use crate::engine::{EngineData, EngineException, EngineRuntime};

// ============================================================================
// Values
// ============================================================================

/// An engine-side value. Stored values are instances of the universal
/// exception carriers, i.e. `Con` applications.
#[derive(Debug, Clone)]
pub enum Value {
    Int(i64),
    Str(String),
    Bool(bool),
    Unit,
    Tuple(Vec<Value>),
    List(Vec<Value>),
    /// A (possibly not yet applied) unary or nullary constructor.
    Con(Arc<str>, Option<Arc<Value>>),
    Closure(Arc<Closure>),
    Builtin(&'static str, Vec<Value>),
}

#[derive(Debug)]
pub struct Closure {
    clauses: Arc<Vec<(Pat, Expr)>>,
    env: Env,
}

#[derive(Debug, Clone)]
enum Env {
    Empty,
    Bind(Arc<Binding>),
}

#[derive(Debug)]
struct Binding {
    name: String,
    value: Value,
    rest: Env,
}

impl Env {
    fn bind(&self, name: &str, value: Value) -> Env {
        Env::Bind(Arc::new(Binding {
            name: name.to_string(),
            value,
            rest: self.clone(),
        }))
    }

    fn lookup(&self, name: &str) -> Option<&Value> {
        let mut current = self;
        loop {
            match current {
                Env::Empty => return None,
                Env::Bind(binding) => {
                    if binding.name == name {
                        return Some(&binding.value);
                    }
                    current = &binding.rest;
                }
            }
        }
    }
}

/// Pretty-print a value the way error messages show it.
fn render(value: &Value) -> String {
    fn is_atomic(value: &Value) -> bool {
        !matches!(value, Value::Con(_, Some(_)) )
    }
    match value {
        Value::Int(i) => i.to_string(),
        Value::Str(s) => format!("{s:?}"),
        Value::Bool(b) => b.to_string(),
        Value::Unit => "()".to_string(),
        Value::Tuple(items) => {
            let parts: Vec<String> = items.iter().map(render).collect();
            format!("({})", parts.join(", "))
        }
        Value::List(items) => {
            let parts: Vec<String> = items.iter().map(render).collect();
            format!("[{}]", parts.join(", "))
        }
        Value::Con(name, None) => name.to_string(),
        Value::Con(name, Some(payload)) => {
            if is_atomic(payload) {
                format!("{name} {}", render(payload))
            } else {
                format!("{name} ({})", render(payload))
            }
        }
        Value::Closure(_) => "fn".to_string(),
        Value::Builtin(name, _) => name.to_string(),
    }
}

// ============================================================================
// Syntax
// ============================================================================

#[derive(Debug, Clone)]
enum Expr {
    Int(i64),
    Str(String),
    Bool(bool),
    Unit,
    Var(String),
    Tuple(Vec<Expr>),
    List(Vec<Expr>),
    App(Box<Expr>, Box<Expr>),
    Fn(Arc<Vec<(Pat, Expr)>>),
    Infix(char, Box<Expr>, Box<Expr>),
    Raise(Box<Expr>),
}

#[derive(Debug, Clone)]
enum Pat {
    Wild,
    Var(String),
    Int(i64),
    Str(String),
    Bool(bool),
    Unit,
    Tuple(Vec<Pat>),
    List(Vec<Pat>),
    Con(String, Option<Box<Pat>>),
}

enum Item {
    Decl { name: String, arity: u8 },
    Expr(Expr),
}

/// Either a parse failure or an uncaught raised value.
#[derive(Debug)]
enum MlError {
    Parse(String),
    Raised(Value),
}

fn to_exception(error: MlError) -> EngineException {
    match error {
        MlError::Parse(message) => EngineException::new(format!("parse error: {message}")),
        MlError::Raised(value) => EngineException::new(render(&value)),
    }
}

fn fail(message: impl Into<String>) -> MlError {
    MlError::Raised(Value::Con(
        Arc::from("Fail"),
        Some(Arc::new(Value::Str(message.into()))),
    ))
}

// ============================================================================
// Lexer
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
enum Tok {
    Ident(String),
    Int(i64),
    Str(String),
    LParen,
    RParen,
    LBracket,
    RBracket,
    Comma,
    Bar,
    Semi,
    Underscore,
    DArrow,
    Arrow,
    Op(char),
    KwFn,
    KwRaise,
    KwException,
    KwOf,
    KwTrue,
    KwFalse,
}

fn lex(source: &str) -> Result<Vec<Tok>, MlError> {
    let mut toks = Vec::new();
    let mut chars = source.chars().peekable();
    while let Some(&c) = chars.peek() {
        match c {
            c if c.is_whitespace() => {
                chars.next();
            }
            '(' => {
                chars.next();
                toks.push(Tok::LParen);
            }
            ')' => {
                chars.next();
                toks.push(Tok::RParen);
            }
            '[' => {
                chars.next();
                toks.push(Tok::LBracket);
            }
            ']' => {
                chars.next();
                toks.push(Tok::RBracket);
            }
            ',' => {
                chars.next();
                toks.push(Tok::Comma);
            }
            '|' => {
                chars.next();
                toks.push(Tok::Bar);
            }
            ';' => {
                chars.next();
                toks.push(Tok::Semi);
            }
            '=' => {
                chars.next();
                match chars.peek() {
                    Some('>') => {
                        chars.next();
                        toks.push(Tok::DArrow);
                    }
                    other => {
                        return Err(MlError::Parse(format!("unexpected '=' before {other:?}")));
                    }
                }
            }
            '-' => {
                chars.next();
                if chars.peek() == Some(&'>') {
                    chars.next();
                    toks.push(Tok::Arrow);
                } else {
                    toks.push(Tok::Op('-'));
                }
            }
            '*' | '+' | '^' => {
                chars.next();
                toks.push(Tok::Op(c));
            }
            '"' => {
                chars.next();
                let mut text = String::new();
                loop {
                    match chars.next() {
                        Some('"') => break,
                        Some('\\') => match chars.next() {
                            Some('"') => text.push('"'),
                            Some('\\') => text.push('\\'),
                            Some('n') => text.push('\n'),
                            other => {
                                return Err(MlError::Parse(format!(
                                    "unsupported escape {other:?}"
                                )));
                            }
                        },
                        Some(other) => text.push(other),
                        None => return Err(MlError::Parse("unterminated string".to_string())),
                    }
                }
                toks.push(Tok::Str(text));
            }
            c if c.is_ascii_digit() => {
                let mut digits = String::new();
                while let Some(&d) = chars.peek() {
                    if d.is_ascii_digit() {
                        digits.push(d);
                        chars.next();
                    } else {
                        break;
                    }
                }
                let value: i64 = digits
                    .parse()
                    .map_err(|_| MlError::Parse(format!("integer literal {digits} overflows")))?;
                toks.push(Tok::Int(value));
            }
            c if c.is_alphabetic() || c == '_' => {
                let mut word = String::new();
                while let Some(&w) = chars.peek() {
                    if w.is_alphanumeric() || w == '_' || w == '\'' {
                        word.push(w);
                        chars.next();
                    } else {
                        break;
                    }
                }
                toks.push(match word.as_str() {
                    "_" => Tok::Underscore,
                    "fn" => Tok::KwFn,
                    "raise" => Tok::KwRaise,
                    "exception" => Tok::KwException,
                    "of" => Tok::KwOf,
                    "true" => Tok::KwTrue,
                    "false" => Tok::KwFalse,
                    _ => Tok::Ident(word),
                });
            }
            other => return Err(MlError::Parse(format!("unexpected character {other:?}"))),
        }
    }
    Ok(toks)
}

// ============================================================================
// Parser
// ============================================================================

struct Parser {
    toks: Vec<Tok>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Tok> {
        self.toks.get(self.pos)
    }

    fn advance(&mut self) -> Option<Tok> {
        let tok = self.toks.get(self.pos).cloned();
        if tok.is_some() {
            self.pos += 1;
        }
        tok
    }

    fn expect(&mut self, expected: &Tok) -> Result<(), MlError> {
        match self.advance() {
            Some(tok) if tok == *expected => Ok(()),
            other => Err(MlError::Parse(format!(
                "expected {expected:?}, found {other:?}"
            ))),
        }
    }

    fn program(&mut self) -> Result<Vec<Item>, MlError> {
        let mut items = Vec::new();
        loop {
            while self.peek() == Some(&Tok::Semi) {
                self.advance();
            }
            if self.peek().is_none() {
                return Ok(items);
            }
            if self.peek() == Some(&Tok::KwException) {
                items.push(self.declaration()?);
            } else {
                items.push(Item::Expr(self.expr()?));
            }
            match self.peek() {
                None | Some(Tok::Semi) => {}
                other => {
                    return Err(MlError::Parse(format!(
                        "expected ';' between items, found {other:?}"
                    )));
                }
            }
        }
    }

    fn declaration(&mut self) -> Result<Item, MlError> {
        self.expect(&Tok::KwException)?;
        let name = match self.advance() {
            Some(Tok::Ident(name)) => name,
            other => {
                return Err(MlError::Parse(format!(
                    "expected exception name, found {other:?}"
                )));
            }
        };
        let arity = if self.peek() == Some(&Tok::KwOf) {
            self.advance();
            // The payload type is not interpreted; skip it.
            while !matches!(self.peek(), None | Some(Tok::Semi)) {
                self.advance();
            }
            1
        } else {
            0
        };
        Ok(Item::Decl { name, arity })
    }

    fn expr(&mut self) -> Result<Expr, MlError> {
        match self.peek() {
            Some(Tok::KwFn) => {
                self.advance();
                let mut clauses = Vec::new();
                loop {
                    let pat = self.pattern()?;
                    self.expect(&Tok::DArrow)?;
                    let body = self.expr()?;
                    clauses.push((pat, body));
                    if self.peek() == Some(&Tok::Bar) {
                        self.advance();
                    } else {
                        break;
                    }
                }
                Ok(Expr::Fn(Arc::new(clauses)))
            }
            Some(Tok::KwRaise) => {
                self.advance();
                Ok(Expr::Raise(Box::new(self.expr()?)))
            }
            _ => self.additive(),
        }
    }

    fn additive(&mut self) -> Result<Expr, MlError> {
        let mut lhs = self.multiplicative()?;
        while let Some(Tok::Op(op @ ('+' | '-' | '^'))) = self.peek() {
            let op = *op;
            self.advance();
            let rhs = self.multiplicative()?;
            lhs = Expr::Infix(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn multiplicative(&mut self) -> Result<Expr, MlError> {
        let mut lhs = self.application()?;
        while let Some(Tok::Op('*')) = self.peek() {
            self.advance();
            let rhs = self.application()?;
            lhs = Expr::Infix('*', Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn application(&mut self) -> Result<Expr, MlError> {
        let mut expr = self.atom()?;
        while self.starts_atom() {
            let arg = self.atom()?;
            expr = Expr::App(Box::new(expr), Box::new(arg));
        }
        Ok(expr)
    }

    fn starts_atom(&self) -> bool {
        matches!(
            self.peek(),
            Some(
                Tok::Ident(_)
                    | Tok::Int(_)
                    | Tok::Str(_)
                    | Tok::KwTrue
                    | Tok::KwFalse
                    | Tok::LParen
                    | Tok::LBracket
            )
        )
    }

    fn atom(&mut self) -> Result<Expr, MlError> {
        match self.advance() {
            Some(Tok::Int(value)) => Ok(Expr::Int(value)),
            Some(Tok::Str(text)) => Ok(Expr::Str(text)),
            Some(Tok::KwTrue) => Ok(Expr::Bool(true)),
            Some(Tok::KwFalse) => Ok(Expr::Bool(false)),
            Some(Tok::Ident(name)) => Ok(Expr::Var(name)),
            Some(Tok::LParen) => {
                if self.peek() == Some(&Tok::RParen) {
                    self.advance();
                    return Ok(Expr::Unit);
                }
                let first = self.expr()?;
                if self.peek() == Some(&Tok::Comma) {
                    let mut items = vec![first];
                    while self.peek() == Some(&Tok::Comma) {
                        self.advance();
                        items.push(self.expr()?);
                    }
                    self.expect(&Tok::RParen)?;
                    Ok(Expr::Tuple(items))
                } else {
                    self.expect(&Tok::RParen)?;
                    Ok(first)
                }
            }
            Some(Tok::LBracket) => {
                if self.peek() == Some(&Tok::RBracket) {
                    self.advance();
                    return Ok(Expr::List(Vec::new()));
                }
                let mut items = vec![self.expr()?];
                while self.peek() == Some(&Tok::Comma) {
                    self.advance();
                    items.push(self.expr()?);
                }
                self.expect(&Tok::RBracket)?;
                Ok(Expr::List(items))
            }
            other => Err(MlError::Parse(format!(
                "expected an expression, found {other:?}"
            ))),
        }
    }

    fn pattern(&mut self) -> Result<Pat, MlError> {
        let first = self.pattern_atom()?;
        if let Pat::Var(name) = &first {
            if self.starts_pattern_atom() {
                let sub = self.pattern_atom()?;
                return Ok(Pat::Con(name.clone(), Some(Box::new(sub))));
            }
        }
        Ok(first)
    }

    fn starts_pattern_atom(&self) -> bool {
        matches!(
            self.peek(),
            Some(
                Tok::Ident(_)
                    | Tok::Int(_)
                    | Tok::Str(_)
                    | Tok::KwTrue
                    | Tok::KwFalse
                    | Tok::Underscore
                    | Tok::LParen
                    | Tok::LBracket
            )
        )
    }

    fn pattern_atom(&mut self) -> Result<Pat, MlError> {
        match self.advance() {
            Some(Tok::Underscore) => Ok(Pat::Wild),
            Some(Tok::Int(value)) => Ok(Pat::Int(value)),
            Some(Tok::Str(text)) => Ok(Pat::Str(text)),
            Some(Tok::KwTrue) => Ok(Pat::Bool(true)),
            Some(Tok::KwFalse) => Ok(Pat::Bool(false)),
            Some(Tok::Ident(name)) => Ok(Pat::Var(name)),
            Some(Tok::LParen) => {
                if self.peek() == Some(&Tok::RParen) {
                    self.advance();
                    return Ok(Pat::Unit);
                }
                let first = self.pattern()?;
                if self.peek() == Some(&Tok::Comma) {
                    let mut items = vec![first];
                    while self.peek() == Some(&Tok::Comma) {
                        self.advance();
                        items.push(self.pattern()?);
                    }
                    self.expect(&Tok::RParen)?;
                    Ok(Pat::Tuple(items))
                } else {
                    self.expect(&Tok::RParen)?;
                    Ok(first)
                }
            }
            Some(Tok::LBracket) => {
                if self.peek() == Some(&Tok::RBracket) {
                    self.advance();
                    return Ok(Pat::List(Vec::new()));
                }
                let mut items = vec![self.pattern()?];
                while self.peek() == Some(&Tok::Comma) {
                    self.advance();
                    items.push(self.pattern()?);
                }
                self.expect(&Tok::RBracket)?;
                Ok(Pat::List(items))
            }
            other => Err(MlError::Parse(format!(
                "expected a pattern, found {other:?}"
            ))),
        }
    }
}

fn parse(source: &str) -> Result<Vec<Item>, MlError> {
    let toks = lex(source)?;
    let mut parser = Parser { toks, pos: 0 };
    parser.program()
}

// ============================================================================
// Evaluator
// ============================================================================

type Ctors = HashMap<String, u8>;

fn eval(ctors: &Ctors, env: &Env, expr: &Expr) -> Result<Value, MlError> {
    match expr {
        Expr::Int(value) => Ok(Value::Int(*value)),
        Expr::Str(text) => Ok(Value::Str(text.clone())),
        Expr::Bool(value) => Ok(Value::Bool(*value)),
        Expr::Unit => Ok(Value::Unit),
        Expr::Var(name) => {
            if let Some(value) = env.lookup(name) {
                Ok(value.clone())
            } else if ctors.contains_key(name) {
                Ok(Value::Con(Arc::from(name.as_str()), None))
            } else {
                Err(fail(format!("unbound identifier: {name}")))
            }
        }
        Expr::Tuple(items) => Ok(Value::Tuple(
            items
                .iter()
                .map(|item| eval(ctors, env, item))
                .collect::<Result<_, _>>()?,
        )),
        Expr::List(items) => Ok(Value::List(
            items
                .iter()
                .map(|item| eval(ctors, env, item))
                .collect::<Result<_, _>>()?,
        )),
        Expr::App(function, argument) => {
            let function = eval(ctors, env, function)?;
            let argument = eval(ctors, env, argument)?;
            apply(ctors, function, argument)
        }
        Expr::Fn(clauses) => Ok(Value::Closure(Arc::new(Closure {
            clauses: Arc::clone(clauses),
            env: env.clone(),
        }))),
        Expr::Infix(op, lhs, rhs) => {
            let lhs = eval(ctors, env, lhs)?;
            let rhs = eval(ctors, env, rhs)?;
            infix(*op, lhs, rhs)
        }
        Expr::Raise(inner) => {
            let value = eval(ctors, env, inner)?;
            Err(MlError::Raised(value))
        }
    }
}

fn infix(op: char, lhs: Value, rhs: Value) -> Result<Value, MlError> {
    match (op, lhs, rhs) {
        ('*', Value::Int(a), Value::Int(b)) => a
            .checked_mul(b)
            .map(Value::Int)
            .ok_or_else(|| fail("integer overflow")),
        ('+', Value::Int(a), Value::Int(b)) => a
            .checked_add(b)
            .map(Value::Int)
            .ok_or_else(|| fail("integer overflow")),
        ('-', Value::Int(a), Value::Int(b)) => a
            .checked_sub(b)
            .map(Value::Int)
            .ok_or_else(|| fail("integer overflow")),
        ('^', Value::Str(a), Value::Str(b)) => Ok(Value::Str(format!("{a}{b}"))),
        (op, lhs, rhs) => Err(fail(format!(
            "type error: {} {op} {}",
            render(&lhs),
            render(&rhs)
        ))),
    }
}

fn builtin_arity(name: &str) -> usize {
    match name {
        "map" => 2,
        _ => 1,
    }
}

fn run_builtin(ctors: &Ctors, name: &'static str, mut args: Vec<Value>) -> Result<Value, MlError> {
    match name {
        "string_of_int" => match args.pop() {
            Some(Value::Int(value)) => Ok(Value::Str(value.to_string())),
            other => Err(fail(format!(
                "string_of_int: not an int: {}",
                other.as_ref().map(render).unwrap_or_default()
            ))),
        },
        "map" => {
            let items = args.pop();
            let function = args.pop();
            match (function, items) {
                (Some(function), Some(Value::List(items))) => Ok(Value::List(
                    items
                        .into_iter()
                        .map(|item| apply(ctors, function.clone(), item))
                        .collect::<Result<_, _>>()?,
                )),
                (_, other) => Err(fail(format!(
                    "map: not a list: {}",
                    other.as_ref().map(render).unwrap_or_default()
                ))),
            }
        }
        other => Err(fail(format!("unknown builtin: {other}"))),
    }
}

fn apply(ctors: &Ctors, function: Value, argument: Value) -> Result<Value, MlError> {
    match function {
        Value::Closure(closure) => {
            for (pat, body) in closure.clauses.iter() {
                if let Some(env) = match_pat(ctors, pat, &argument, closure.env.clone()) {
                    return eval(ctors, &env, body);
                }
            }
            Err(MlError::Raised(Value::Con(Arc::from("Match"), None)))
        }
        Value::Builtin(name, mut args) => {
            args.push(argument);
            if args.len() < builtin_arity(name) {
                Ok(Value::Builtin(name, args))
            } else {
                run_builtin(ctors, name, args)
            }
        }
        Value::Con(name, None) => match ctors.get(name.as_ref()) {
            Some(1) => Ok(Value::Con(name, Some(Arc::new(argument)))),
            _ => Err(fail(format!("cannot apply {name}"))),
        },
        other => Err(fail(format!(
            "cannot apply non-function: {}",
            render(&other)
        ))),
    }
}

fn match_pat(ctors: &Ctors, pat: &Pat, value: &Value, env: Env) -> Option<Env> {
    match (pat, value) {
        (Pat::Wild, _) => Some(env),
        (Pat::Var(name), _) => {
            // A nullary constructor name in pattern position matches the
            // constructor instead of binding.
            if ctors.get(name) == Some(&0) {
                match value {
                    Value::Con(con, None) if con.as_ref() == name.as_str() => Some(env),
                    _ => None,
                }
            } else {
                Some(env.bind(name, value.clone()))
            }
        }
        (Pat::Int(p), Value::Int(v)) if p == v => Some(env),
        (Pat::Str(p), Value::Str(v)) if p == v => Some(env),
        (Pat::Bool(p), Value::Bool(v)) if p == v => Some(env),
        (Pat::Unit, Value::Unit) => Some(env),
        (Pat::Tuple(pats), Value::Tuple(vals)) if pats.len() == vals.len() => {
            let mut env = env;
            for (pat, value) in pats.iter().zip(vals) {
                env = match_pat(ctors, pat, value, env)?;
            }
            Some(env)
        }
        (Pat::List(pats), Value::List(vals)) if pats.len() == vals.len() => {
            let mut env = env;
            for (pat, value) in pats.iter().zip(vals) {
                env = match_pat(ctors, pat, value, env)?;
            }
            Some(env)
        }
        (Pat::Con(name, sub), Value::Con(con, payload)) if con.as_ref() == name.as_str() => {
            match (sub, payload) {
                (None, None) => Some(env),
                (Some(sub), Some(payload)) => match_pat(ctors, sub, payload, env),
                _ => None,
            }
        }
        _ => None,
    }
}

// ============================================================================
// Runtime
// ============================================================================

/// The reference engine runtime. Constructor declarations accumulate across
/// `eval` calls; re-declaring a name is a no-op, which makes the session
/// bootstrap idempotent.
pub struct MiniMl {
    ctors: Ctors,
    base: Env,
}

impl MiniMl {
    pub fn new() -> Self {
        let mut ctors = Ctors::new();
        // The data constructors and the function carrier are part of the
        // engine itself; everything else arrives via the bootstrap.
        for name in ["DInt", "DString", "DList", "DObject", "SOME", "Fail", "E_Function"] {
            ctors.insert(name.to_string(), 1);
        }
        for name in ["NONE", "Match"] {
            ctors.insert(name.to_string(), 0);
        }
        let base = Env::Empty
            .bind("string_of_int", Value::Builtin("string_of_int", Vec::new()))
            .bind("map", Value::Builtin("map", Vec::new()));
        Self { ctors, base }
    }

    /// Run a program: register declarations, evaluate expressions in
    /// order, return the last expression's value if there was one.
    fn run(&mut self, source: &str) -> Result<Option<Value>, MlError> {
        let items = parse(source)?;
        let mut last = None;
        for item in items {
            match item {
                Item::Decl { name, arity } => {
                    self.ctors.entry(name).or_insert(arity);
                }
                Item::Expr(expr) => {
                    last = Some(eval(&self.ctors, &self.base, &expr)?);
                }
            }
        }
        Ok(last)
    }
}

impl Default for MiniMl {
    fn default() -> Self {
        Self::new()
    }
}

fn data_to_value(data: EngineData<Value>) -> Value {
    match data {
        EngineData::Int(value) => Value::Con(Arc::from("DInt"), Some(Arc::new(Value::Int(value)))),
        EngineData::String(text) => {
            Value::Con(Arc::from("DString"), Some(Arc::new(Value::Str(text))))
        }
        EngineData::List(items) => Value::Con(
            Arc::from("DList"),
            Some(Arc::new(Value::List(
                items.into_iter().map(data_to_value).collect(),
            ))),
        ),
        EngineData::Object(value) => Value::Con(Arc::from("DObject"), Some(Arc::new(value))),
    }
}

fn value_to_data(value: Value) -> Result<EngineData<Value>, EngineException> {
    if let Value::Con(name, Some(payload)) = &value {
        match (name.as_ref(), payload.as_ref()) {
            ("DInt", Value::Int(int)) => return Ok(EngineData::Int(*int)),
            ("DString", Value::Str(text)) => return Ok(EngineData::String(text.clone())),
            ("DList", Value::List(items)) => {
                return Ok(EngineData::List(
                    items
                        .iter()
                        .cloned()
                        .map(value_to_data)
                        .collect::<Result<_, _>>()?,
                ));
            }
            ("DObject", inner) => return Ok(EngineData::Object(inner.clone())),
            _ => {}
        }
    }
    Err(EngineException::new(format!(
        "function result is not data: {}",
        render(&value)
    )))
}

impl EngineRuntime for MiniMl {
    type Value = Value;

    fn eval(&mut self, code: &str) -> Result<(), EngineException> {
        self.run(code).map(|_| ()).map_err(to_exception)
    }

    fn eval_value(&mut self, code: &str) -> Result<Value, EngineException> {
        match self.run(code).map_err(to_exception)? {
            Some(value) => Ok(value),
            None => Err(EngineException::new("expression yields no value")),
        }
    }

    fn apply(
        &mut self,
        function: &Value,
        argument: EngineData<Value>,
    ) -> Result<EngineData<Value>, EngineException> {
        let inner = match function {
            Value::Con(name, Some(inner)) if name.as_ref() == "E_Function" => inner,
            other => {
                return Err(EngineException::new(format!(
                    "not a function: {}",
                    render(other)
                )));
            }
        };
        let argument = data_to_value(argument);
        let result = apply(&self.ctors, (**inner).clone(), argument).map_err(to_exception)?;
        value_to_data(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eval_value(runtime: &mut MiniMl, code: &str) -> Value {
        EngineRuntime::eval_value(runtime, code).expect(code)
    }

    fn eval_err(runtime: &mut MiniMl, code: &str) -> String {
        EngineRuntime::eval_value(runtime, code)
            .expect_err(code)
            .to_string()
    }

    #[test]
    fn arithmetic_precedence() {
        let mut runtime = MiniMl::new();
        match eval_value(&mut runtime, "1 + 2 * 3") {
            Value::Int(7) => {}
            other => panic!("expected 7, got {other:?}"),
        }
    }

    #[test]
    fn string_concat_and_string_of_int() {
        let mut runtime = MiniMl::new();
        match eval_value(&mut runtime, r#""n = " ^ string_of_int 12"#) {
            Value::Str(text) => assert_eq!(text, "n = 12"),
            other => panic!("expected string, got {other:?}"),
        }
    }

    #[test]
    fn clauses_match_in_order() {
        let mut runtime = MiniMl::new();
        let code = r#"(fn DInt i => i | _ => raise Fail "t") (DInt 5)"#;
        match eval_value(&mut runtime, code) {
            Value::Int(5) => {}
            other => panic!("expected 5, got {other:?}"),
        }
    }

    #[test]
    fn fallback_arm_raises_with_label() {
        let mut runtime = MiniMl::new();
        let code = r#"(fn DInt i => i | _ => raise Fail "t") (DString "x")"#;
        assert_eq!(eval_err(&mut runtime, code), "Fail \"t\"");
    }

    #[test]
    fn raise_propagates_through_application() {
        let mut runtime = MiniMl::new();
        runtime.run("exception E_Int of int").unwrap();
        let message = eval_err(&mut runtime, r#"(E_Int) (raise Fail "nope")"#);
        assert!(message.contains("nope"), "{message}");
    }

    #[test]
    fn map_applies_elementwise() {
        let mut runtime = MiniMl::new();
        let code = r#"map (fn DInt i => i | _ => raise Fail "m") [DInt 1, DInt 2]"#;
        match eval_value(&mut runtime, code) {
            Value::List(items) => {
                assert_eq!(items.len(), 2);
                assert!(matches!(items[0], Value::Int(1)));
                assert!(matches!(items[1], Value::Int(2)));
            }
            other => panic!("expected list, got {other:?}"),
        }
    }

    #[test]
    fn nested_constructor_patterns() {
        let mut runtime = MiniMl::new();
        runtime
            .run("exception E_Pair of exn * exn; exception E_Int of int")
            .unwrap();
        let code = r#"(fn E_Pair (a, E_Pair (b, c)) => b | _ => raise Fail "p")
                      (E_Pair (E_Int 1, E_Pair (E_Int 2, E_Int 3)))"#;
        match eval_value(&mut runtime, code) {
            Value::Con(name, Some(payload)) => {
                assert_eq!(name.as_ref(), "E_Int");
                assert!(matches!(payload.as_ref(), Value::Int(2)));
            }
            other => panic!("expected E_Int 2, got {other:?}"),
        }
    }

    #[test]
    fn declarations_are_idempotent() {
        let mut runtime = MiniMl::new();
        runtime.run("exception E_Bool of bool").unwrap();
        runtime.run("exception E_Bool of bool").unwrap();
        match eval_value(&mut runtime, "E_Bool true") {
            Value::Con(name, Some(_)) => assert_eq!(name.as_ref(), "E_Bool"),
            other => panic!("expected constructor, got {other:?}"),
        }
    }

    #[test]
    fn nullary_constructors_match_instead_of_binding() {
        let mut runtime = MiniMl::new();
        let code = r#"(fn NONE => 0 | SOME x => x | _ => raise Fail "o") (SOME 9)"#;
        match eval_value(&mut runtime, code) {
            Value::Int(9) => {}
            other => panic!("expected 9, got {other:?}"),
        }
        let code = r#"(fn NONE => 0 | SOME x => x | _ => raise Fail "o") NONE"#;
        match eval_value(&mut runtime, code) {
            Value::Int(0) => {}
            other => panic!("expected 0, got {other:?}"),
        }
    }

    #[test]
    fn unbound_identifier_is_an_error() {
        let mut runtime = MiniMl::new();
        let message = eval_err(&mut runtime, "mystery");
        assert!(message.contains("unbound identifier"), "{message}");
    }

    #[test]
    fn render_names_values_in_errors() {
        let mut runtime = MiniMl::new();
        let message = eval_err(&mut runtime, r#"raise Fail "boom""#);
        assert_eq!(message, "Fail \"boom\"");
    }

    #[test]
    fn renders_nested_constructors_with_parens() {
        let value = Value::Con(
            Arc::from("E_Option"),
            Some(Arc::new(Value::Con(
                Arc::from("SOME"),
                Some(Arc::new(Value::Int(1))),
            ))),
        );
        assert_eq!(render(&value), "E_Option (SOME 1)");
    }

    #[test]
    fn bootstrap_declarations_parse() {
        let mut runtime = MiniMl::new();
        runtime.run(crate::convert::ENGINE_BOOTSTRAP).unwrap();
        assert!(runtime.ctors.contains_key("E_Pair"));
        assert!(runtime.ctors.contains_key("E_Option"));
    }
}
