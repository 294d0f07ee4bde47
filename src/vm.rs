//! Deterministic sandboxed interpreter for contract scripts.
//!
//! Contracts are written in a small brace-and-semicolon language: functions,
//! integers, floats, strings, booleans, lists and maps, arithmetic and
//! comparison, `and`/`or`/`not`, `if`/`else`, `while`, indexing, assignment
//! and `return`. The only mutable global is `state`, a map persisted between
//! calls. The interpreter is closed over pure computation: there is no clock,
//! no randomness, no host namespace, no I/O of any kind, and execution is
//! bounded by a step budget, so the same `(code, method, args, state)` always
//! produces the same result.
//!
//! A token denylist runs before parsing as defense in depth; the interpreter
//! itself is the actual sandbox boundary.

use std::collections::BTreeMap;
use std::fmt;

/// Source tokens rejected before execution
///
/// Substring matching is deliberate: none of these can occur in a legitimate
/// script, and a coarse match cannot be bypassed with creative spelling of a
/// legitimate construct.
pub const FORBIDDEN_TOKENS: &[&str] = &[
    "import", "include", "require", "open", "exec", "eval", "system", "spawn", "process",
    "input", "getenv", "std::", "__",
];

/// Ceiling on interpreter steps per invocation
pub const STEP_BUDGET: u64 = 100_000;

/// Ceiling on nested script-function calls
pub const MAX_CALL_DEPTH: usize = 32;

/// The counter contract shipped with every node, used by tests and demos
pub const EXAMPLE_CONTRACT: &str = r#"# GhostMesh counter contract
# The persistent map is available as the global name 'state'.

fn init() {
    state["counter"] = 0;
    state["owner"] = "GhostNetwork";
    return "initialized";
}

fn increment(amount) {
    state["counter"] = state["counter"] + int(amount);
    return state["counter"];
}

fn get_counter() {
    return state["counter"];
}
"#;

/// Execution failure, split by phase
#[derive(Debug, Clone, PartialEq)]
pub enum VmError {
    /// Source rejected before execution
    Validation(String),
    /// Method raised during execution
    Runtime(String),
}

impl fmt::Display for VmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VmError::Validation(msg) => write!(f, "validation: {}", msg),
            VmError::Runtime(msg) => write!(f, "runtime: {}", msg),
        }
    }
}

impl std::error::Error for VmError {}

/// A runtime value; maps keep sorted keys so results are deterministic
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
}

impl Value {
    /// Convert a caller argument: integers stay integers, everything else is text
    pub fn parse_arg(raw: &str) -> Value {
        match raw.parse::<i64>() {
            Ok(n) => Value::Int(n),
            Err(_) => Value::Str(raw.to_string()),
        }
    }

    pub fn from_json(value: &serde_json::Value) -> Value {
        match value {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(*b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Value::Int(i),
                None => Value::Float(n.as_f64().unwrap_or(0.0)),
            },
            serde_json::Value::String(s) => Value::Str(s.clone()),
            serde_json::Value::Array(items) => {
                Value::List(items.iter().map(Value::from_json).collect())
            }
            serde_json::Value::Object(map) => Value::Map(
                map.iter()
                    .map(|(k, v)| (k.clone(), Value::from_json(v)))
                    .collect(),
            ),
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Int(i) => serde_json::Value::from(*i),
            Value::Float(f) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::Str(s) => serde_json::Value::String(s.clone()),
            Value::List(items) => {
                serde_json::Value::Array(items.iter().map(Value::to_json).collect())
            }
            Value::Map(map) => serde_json::Value::Object(
                map.iter().map(|(k, v)| (k.clone(), v.to_json())).collect(),
            ),
        }
    }

    fn truthy(&self) -> bool {
        match self {
            Value::Null => false,
            Value::Bool(b) => *b,
            Value::Int(i) => *i != 0,
            Value::Float(f) => *f != 0.0,
            Value::Str(s) => !s.is_empty(),
            Value::List(items) => !items.is_empty(),
            Value::Map(map) => !map.is_empty(),
        }
    }

    fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "str",
            Value::List(_) => "list",
            Value::Map(_) => "map",
        }
    }

    fn render(&self) -> String {
        match self {
            Value::Null => "null".to_string(),
            Value::Bool(b) => b.to_string(),
            Value::Int(i) => i.to_string(),
            Value::Float(f) => f.to_string(),
            Value::Str(s) => s.clone(),
            other => other.to_json().to_string(),
        }
    }
}

/// Result of a successful method invocation
#[derive(Debug, Clone, PartialEq)]
pub struct Invocation {
    pub return_value: Value,
    pub state: BTreeMap<String, Value>,
}

/// Reject source text containing a forbidden token
pub fn validate(source: &str) -> Result<(), VmError> {
    for token in FORBIDDEN_TOKENS {
        if source.contains(token) {
            return Err(VmError::Validation(format!(
                "forbidden token '{}' in contract source",
                token
            )));
        }
    }
    Ok(())
}

/// Run one method of a contract against a copy of its state
///
/// # Arguments
/// * `source` - Contract source text
/// * `method` - Function to invoke
/// * `args` - Ordered argument values
/// * `state` - Current persistent state; the caller keeps ownership and
///   decides whether to persist the returned one
///
/// # Returns
/// * `Result<Invocation, VmError>` - Return value and post-state, or the error
pub fn execute(
    source: &str,
    method: &str,
    args: &[Value],
    state: &BTreeMap<String, Value>,
) -> Result<Invocation, VmError> {
    validate(source)?;
    let script = parse(source)?;
    let function = script
        .functions
        .get(method)
        .ok_or_else(|| VmError::Runtime(format!("method '{}' not found", method)))?;
    if function.params.len() != args.len() {
        return Err(VmError::Runtime(format!(
            "method '{}' takes {} arguments, got {}",
            method,
            function.params.len(),
            args.len()
        )));
    }

    let mut interp = Interp {
        script: &script,
        state: state.clone(),
        steps: 0,
    };
    let mut locals: BTreeMap<String, Value> = function
        .params
        .iter()
        .cloned()
        .zip(args.iter().cloned())
        .collect();

    let flow = interp.exec_block(&function.body, &mut locals, 0)?;
    let return_value = match flow {
        Flow::Return(value) => value,
        Flow::Normal => Value::Null,
    };
    Ok(Invocation {
        return_value,
        state: interp.state,
    })
}

// --- lexer ---

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Int(i64),
    Float(f64),
    Str(String),
    Fn,
    If,
    Else,
    While,
    Return,
    True,
    False,
    Null,
    And,
    Or,
    Not,
    LParen,
    RParen,
    LBrace,
    RBrace,
    LBracket,
    RBracket,
    Comma,
    Semicolon,
    Colon,
    Assign,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
}

fn lex(source: &str) -> Result<Vec<Token>, VmError> {
    let mut tokens = Vec::new();
    let mut chars = source.chars().peekable();

    while let Some(&c) = chars.peek() {
        match c {
            ' ' | '\t' | '\r' | '\n' => {
                chars.next();
            }
            '#' => {
                for next in chars.by_ref() {
                    if next == '\n' {
                        break;
                    }
                }
            }
            '"' => {
                chars.next();
                let mut text = String::new();
                loop {
                    match chars.next() {
                        Some('"') => break,
                        Some('\\') => match chars.next() {
                            Some('n') => text.push('\n'),
                            Some('t') => text.push('\t'),
                            Some('"') => text.push('"'),
                            Some('\\') => text.push('\\'),
                            other => {
                                return Err(VmError::Validation(format!(
                                    "bad escape {:?} in string literal",
                                    other
                                )))
                            }
                        },
                        Some(ch) => text.push(ch),
                        None => {
                            return Err(VmError::Validation(
                                "unterminated string literal".to_string(),
                            ))
                        }
                    }
                }
                tokens.push(Token::Str(text));
            }
            '0'..='9' => {
                let mut digits = String::new();
                let mut is_float = false;
                while let Some(&d) = chars.peek() {
                    if d.is_ascii_digit() {
                        digits.push(d);
                        chars.next();
                    } else if d == '.' && !is_float {
                        is_float = true;
                        digits.push(d);
                        chars.next();
                    } else {
                        break;
                    }
                }
                if is_float {
                    let value = digits.parse::<f64>().map_err(|_| {
                        VmError::Validation(format!("bad float literal {}", digits))
                    })?;
                    tokens.push(Token::Float(value));
                } else {
                    let value = digits.parse::<i64>().map_err(|_| {
                        VmError::Validation(format!("integer literal {} out of range", digits))
                    })?;
                    tokens.push(Token::Int(value));
                }
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let mut word = String::new();
                while let Some(&w) = chars.peek() {
                    if w.is_ascii_alphanumeric() || w == '_' {
                        word.push(w);
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push(match word.as_str() {
                    "fn" => Token::Fn,
                    "if" => Token::If,
                    "else" => Token::Else,
                    "while" => Token::While,
                    "return" => Token::Return,
                    "true" => Token::True,
                    "false" => Token::False,
                    "null" => Token::Null,
                    "and" => Token::And,
                    "or" => Token::Or,
                    "not" => Token::Not,
                    _ => Token::Ident(word),
                });
            }
            _ => {
                chars.next();
                let token = match c {
                    '(' => Token::LParen,
                    ')' => Token::RParen,
                    '{' => Token::LBrace,
                    '}' => Token::RBrace,
                    '[' => Token::LBracket,
                    ']' => Token::RBracket,
                    ',' => Token::Comma,
                    ';' => Token::Semicolon,
                    ':' => Token::Colon,
                    '+' => Token::Plus,
                    '-' => Token::Minus,
                    '*' => Token::Star,
                    '/' => Token::Slash,
                    '%' => Token::Percent,
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
                            return Err(VmError::Validation("unexpected '!'".to_string()));
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
                    other => {
                        return Err(VmError::Validation(format!(
                            "unexpected character {:?}",
                            other
                        )))
                    }
                };
                tokens.push(token);
            }
        }
    }
    Ok(tokens)
}

// --- parser ---

#[derive(Debug, Clone, PartialEq)]
enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
}

#[derive(Debug, Clone)]
enum Expr {
    Int(i64),
    Float(f64),
    Str(String),
    Bool(bool),
    Null,
    Var(String),
    Unary(UnOp, Box<Expr>),
    Binary(BinOp, Box<Expr>, Box<Expr>),
    Index(Box<Expr>, Box<Expr>),
    Call(String, Vec<Expr>),
    ListLit(Vec<Expr>),
    MapLit(Vec<(String, Expr)>),
}

#[derive(Debug, Clone, PartialEq)]
enum UnOp {
    Neg,
    Not,
}

#[derive(Debug, Clone)]
enum Stmt {
    Assign { name: String, path: Vec<Expr>, value: Expr },
    Expr(Expr),
    If { cond: Expr, then: Vec<Stmt>, otherwise: Vec<Stmt> },
    While { cond: Expr, body: Vec<Stmt> },
    Return(Option<Expr>),
}

#[derive(Debug, Clone)]
struct Function {
    params: Vec<String>,
    body: Vec<Stmt>,
}

#[derive(Debug, Clone)]
struct Script {
    functions: BTreeMap<String, Function>,
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

fn parse(source: &str) -> Result<Script, VmError> {
    let tokens = lex(source)?;
    let mut parser = Parser { tokens, pos: 0 };
    let mut functions = BTreeMap::new();

    while !parser.at_end() {
        parser.expect(Token::Fn)?;
        let name = parser.ident()?;
        parser.expect(Token::LParen)?;
        let mut params = Vec::new();
        if parser.peek() != Some(&Token::RParen) {
            loop {
                params.push(parser.ident()?);
                if parser.peek() == Some(&Token::Comma) {
                    parser.advance();
                } else {
                    break;
                }
            }
        }
        parser.expect(Token::RParen)?;
        let body = parser.block()?;
        if functions.insert(name.clone(), Function { params, body }).is_some() {
            return Err(VmError::Validation(format!("duplicate function '{}'", name)));
        }
    }

    Ok(Script { functions })
}

impl Parser {
    fn at_end(&self) -> bool {
        self.pos >= self.tokens.len()
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn peek_ahead(&self, offset: usize) -> Option<&Token> {
        self.tokens.get(self.pos + offset)
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn expect(&mut self, expected: Token) -> Result<(), VmError> {
        match self.advance() {
            Some(token) if token == expected => Ok(()),
            other => Err(VmError::Validation(format!(
                "expected {:?}, found {:?}",
                expected, other
            ))),
        }
    }

    fn ident(&mut self) -> Result<String, VmError> {
        match self.advance() {
            Some(Token::Ident(name)) => Ok(name),
            other => Err(VmError::Validation(format!(
                "expected identifier, found {:?}",
                other
            ))),
        }
    }

    fn block(&mut self) -> Result<Vec<Stmt>, VmError> {
        self.expect(Token::LBrace)?;
        let mut statements = Vec::new();
        while self.peek() != Some(&Token::RBrace) {
            if self.at_end() {
                return Err(VmError::Validation("unterminated block".to_string()));
            }
            statements.push(self.statement()?);
        }
        self.advance();
        Ok(statements)
    }

    fn statement(&mut self) -> Result<Stmt, VmError> {
        match self.peek() {
            Some(Token::Return) => {
                self.advance();
                if self.peek() == Some(&Token::Semicolon) {
                    self.advance();
                    return Ok(Stmt::Return(None));
                }
                let value = self.expression()?;
                self.expect(Token::Semicolon)?;
                Ok(Stmt::Return(Some(value)))
            }
            Some(Token::If) => self.if_statement(),
            Some(Token::While) => {
                self.advance();
                self.expect(Token::LParen)?;
                let cond = self.expression()?;
                self.expect(Token::RParen)?;
                let body = self.block()?;
                Ok(Stmt::While { cond, body })
            }
            _ => {
                let expr = self.expression()?;
                if self.peek() == Some(&Token::Assign) {
                    self.advance();
                    let (name, path) = to_target(expr)?;
                    let value = self.expression()?;
                    self.expect(Token::Semicolon)?;
                    Ok(Stmt::Assign { name, path, value })
                } else {
                    self.expect(Token::Semicolon)?;
                    Ok(Stmt::Expr(expr))
                }
            }
        }
    }

    fn if_statement(&mut self) -> Result<Stmt, VmError> {
        self.expect(Token::If)?;
        self.expect(Token::LParen)?;
        let cond = self.expression()?;
        self.expect(Token::RParen)?;
        let then = self.block()?;
        let otherwise = if self.peek() == Some(&Token::Else) {
            self.advance();
            if self.peek() == Some(&Token::If) {
                vec![self.if_statement()?]
            } else {
                self.block()?
            }
        } else {
            Vec::new()
        };
        Ok(Stmt::If { cond, then, otherwise })
    }

    fn expression(&mut self) -> Result<Expr, VmError> {
        self.or_expr()
    }

    fn or_expr(&mut self) -> Result<Expr, VmError> {
        let mut left = self.and_expr()?;
        while self.peek() == Some(&Token::Or) {
            self.advance();
            let right = self.and_expr()?;
            left = Expr::Binary(BinOp::Or, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn and_expr(&mut self) -> Result<Expr, VmError> {
        let mut left = self.comparison()?;
        while self.peek() == Some(&Token::And) {
            self.advance();
            let right = self.comparison()?;
            left = Expr::Binary(BinOp::And, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn comparison(&mut self) -> Result<Expr, VmError> {
        let mut left = self.additive()?;
        loop {
            let op = match self.peek() {
                Some(Token::Eq) => BinOp::Eq,
                Some(Token::Ne) => BinOp::Ne,
                Some(Token::Lt) => BinOp::Lt,
                Some(Token::Le) => BinOp::Le,
                Some(Token::Gt) => BinOp::Gt,
                Some(Token::Ge) => BinOp::Ge,
                _ => break,
            };
            self.advance();
            let right = self.additive()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn additive(&mut self) -> Result<Expr, VmError> {
        let mut left = self.multiplicative()?;
        loop {
            let op = match self.peek() {
                Some(Token::Plus) => BinOp::Add,
                Some(Token::Minus) => BinOp::Sub,
                _ => break,
            };
            self.advance();
            let right = self.multiplicative()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn multiplicative(&mut self) -> Result<Expr, VmError> {
        let mut left = self.unary()?;
        loop {
            let op = match self.peek() {
                Some(Token::Star) => BinOp::Mul,
                Some(Token::Slash) => BinOp::Div,
                Some(Token::Percent) => BinOp::Mod,
                _ => break,
            };
            self.advance();
            let right = self.unary()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn unary(&mut self) -> Result<Expr, VmError> {
        match self.peek() {
            Some(Token::Minus) => {
                self.advance();
                Ok(Expr::Unary(UnOp::Neg, Box::new(self.unary()?)))
            }
            Some(Token::Not) => {
                self.advance();
                Ok(Expr::Unary(UnOp::Not, Box::new(self.unary()?)))
            }
            _ => self.postfix(),
        }
    }

    fn postfix(&mut self) -> Result<Expr, VmError> {
        let mut expr = self.primary()?;
        while self.peek() == Some(&Token::LBracket) {
            self.advance();
            let index = self.expression()?;
            self.expect(Token::RBracket)?;
            expr = Expr::Index(Box::new(expr), Box::new(index));
        }
        Ok(expr)
    }

    fn primary(&mut self) -> Result<Expr, VmError> {
        match self.peek().cloned() {
            Some(Token::Int(value)) => {
                self.advance();
                Ok(Expr::Int(value))
            }
            Some(Token::Float(value)) => {
                self.advance();
                Ok(Expr::Float(value))
            }
            Some(Token::Str(value)) => {
                self.advance();
                Ok(Expr::Str(value))
            }
            Some(Token::True) => {
                self.advance();
                Ok(Expr::Bool(true))
            }
            Some(Token::False) => {
                self.advance();
                Ok(Expr::Bool(false))
            }
            Some(Token::Null) => {
                self.advance();
                Ok(Expr::Null)
            }
            Some(Token::Ident(name)) => {
                if self.peek_ahead(1) == Some(&Token::LParen) {
                    self.advance();
                    self.advance();
                    let mut args = Vec::new();
                    if self.peek() != Some(&Token::RParen) {
                        loop {
                            args.push(self.expression()?);
                            if self.peek() == Some(&Token::Comma) {
                                self.advance();
                            } else {
                                break;
                            }
                        }
                    }
                    self.expect(Token::RParen)?;
                    Ok(Expr::Call(name, args))
                } else {
                    self.advance();
                    Ok(Expr::Var(name))
                }
            }
            Some(Token::LParen) => {
                self.advance();
                let expr = self.expression()?;
                self.expect(Token::RParen)?;
                Ok(expr)
            }
            Some(Token::LBracket) => {
                self.advance();
                let mut items = Vec::new();
                if self.peek() != Some(&Token::RBracket) {
                    loop {
                        items.push(self.expression()?);
                        if self.peek() == Some(&Token::Comma) {
                            self.advance();
                        } else {
                            break;
                        }
                    }
                }
                self.expect(Token::RBracket)?;
                Ok(Expr::ListLit(items))
            }
            Some(Token::LBrace) => {
                self.advance();
                let mut entries = Vec::new();
                if self.peek() != Some(&Token::RBrace) {
                    loop {
                        let key = match self.advance() {
                            Some(Token::Str(key)) => key,
                            other => {
                                return Err(VmError::Validation(format!(
                                    "map keys must be string literals, found {:?}",
                                    other
                                )))
                            }
                        };
                        self.expect(Token::Colon)?;
                        entries.push((key, self.expression()?));
                        if self.peek() == Some(&Token::Comma) {
                            self.advance();
                        } else {
                            break;
                        }
                    }
                }
                self.expect(Token::RBrace)?;
                Ok(Expr::MapLit(entries))
            }
            other => Err(VmError::Validation(format!(
                "unexpected token {:?} in expression",
                other
            ))),
        }
    }
}

/// Turn an expression into an assignment target: a name plus an index path
fn to_target(expr: Expr) -> Result<(String, Vec<Expr>), VmError> {
    match expr {
        Expr::Var(name) => Ok((name, Vec::new())),
        Expr::Index(base, index) => {
            let (name, mut path) = to_target(*base)?;
            path.push(*index);
            Ok((name, path))
        }
        _ => Err(VmError::Validation("invalid assignment target".to_string())),
    }
}

// --- interpreter ---

enum Flow {
    Normal,
    Return(Value),
}

struct Interp<'a> {
    script: &'a Script,
    state: BTreeMap<String, Value>,
    steps: u64,
}

type Locals = BTreeMap<String, Value>;

impl<'a> Interp<'a> {
    fn tick(&mut self) -> Result<(), VmError> {
        self.steps += 1;
        if self.steps > STEP_BUDGET {
            return Err(VmError::Runtime("step budget exceeded".to_string()));
        }
        Ok(())
    }

    fn exec_block(
        &mut self,
        statements: &[Stmt],
        locals: &mut Locals,
        depth: usize,
    ) -> Result<Flow, VmError> {
        for statement in statements {
            self.tick()?;
            match statement {
                Stmt::Return(expr) => {
                    let value = match expr {
                        Some(expr) => self.eval(expr, locals, depth)?,
                        None => Value::Null,
                    };
                    return Ok(Flow::Return(value));
                }
                Stmt::Expr(expr) => {
                    self.eval(expr, locals, depth)?;
                }
                Stmt::Assign { name, path, value } => {
                    let value = self.eval(value, locals, depth)?;
                    let mut path_values = Vec::with_capacity(path.len());
                    for step in path {
                        path_values.push(self.eval(step, locals, depth)?);
                    }
                    self.assign(name, &path_values, value, locals)?;
                }
                Stmt::If { cond, then, otherwise } => {
                    let branch = if self.eval(cond, locals, depth)?.truthy() {
                        then
                    } else {
                        otherwise
                    };
                    if let Flow::Return(value) = self.exec_block(branch, locals, depth)? {
                        return Ok(Flow::Return(value));
                    }
                }
                Stmt::While { cond, body } => {
                    while self.eval(cond, locals, depth)?.truthy() {
                        self.tick()?;
                        if let Flow::Return(value) = self.exec_block(body, locals, depth)? {
                            return Ok(Flow::Return(value));
                        }
                    }
                }
            }
        }
        Ok(Flow::Normal)
    }

    fn assign(
        &mut self,
        name: &str,
        path: &[Value],
        value: Value,
        locals: &mut Locals,
    ) -> Result<(), VmError> {
        if name == "state" {
            if path.is_empty() {
                return match value {
                    Value::Map(map) => {
                        self.state = map;
                        Ok(())
                    }
                    other => Err(VmError::Runtime(format!(
                        "state must remain a map, got {}",
                        other.type_name()
                    ))),
                };
            }
            let mut root = Value::Map(std::mem::take(&mut self.state));
            let result = set_in(&mut root, path, value);
            if let Value::Map(map) = root {
                self.state = map;
            }
            return result;
        }

        if path.is_empty() {
            locals.insert(name.to_string(), value);
            return Ok(());
        }
        match locals.get_mut(name) {
            Some(container) => set_in(container, path, value),
            None => Err(VmError::Runtime(format!("unknown name '{}'", name))),
        }
    }

    fn eval(&mut self, expr: &Expr, locals: &mut Locals, depth: usize) -> Result<Value, VmError> {
        self.tick()?;
        match expr {
            Expr::Int(value) => Ok(Value::Int(*value)),
            Expr::Float(value) => Ok(Value::Float(*value)),
            Expr::Str(value) => Ok(Value::Str(value.clone())),
            Expr::Bool(value) => Ok(Value::Bool(*value)),
            Expr::Null => Ok(Value::Null),
            Expr::Var(name) => {
                if name == "state" {
                    return Ok(Value::Map(self.state.clone()));
                }
                locals
                    .get(name)
                    .cloned()
                    .ok_or_else(|| VmError::Runtime(format!("unknown name '{}'", name)))
            }
            Expr::Unary(op, inner) => {
                let value = self.eval(inner, locals, depth)?;
                match op {
                    UnOp::Not => Ok(Value::Bool(!value.truthy())),
                    UnOp::Neg => match value {
                        Value::Int(i) => Ok(Value::Int(-i)),
                        Value::Float(f) => Ok(Value::Float(-f)),
                        other => Err(VmError::Runtime(format!(
                            "cannot negate {}",
                            other.type_name()
                        ))),
                    },
                }
            }
            Expr::Binary(op, left, right) => {
                if *op == BinOp::And {
                    let left = self.eval(left, locals, depth)?;
                    if !left.truthy() {
                        return Ok(Value::Bool(false));
                    }
                    let right = self.eval(right, locals, depth)?;
                    return Ok(Value::Bool(right.truthy()));
                }
                if *op == BinOp::Or {
                    let left = self.eval(left, locals, depth)?;
                    if left.truthy() {
                        return Ok(Value::Bool(true));
                    }
                    let right = self.eval(right, locals, depth)?;
                    return Ok(Value::Bool(right.truthy()));
                }
                let left = self.eval(left, locals, depth)?;
                let right = self.eval(right, locals, depth)?;
                binary_op(op, left, right)
            }
            Expr::Index(base, index) => {
                let container = self.eval(base, locals, depth)?;
                let index = self.eval(index, locals, depth)?;
                index_value(&container, &index)
            }
            Expr::Call(name, args) => {
                let mut values = Vec::with_capacity(args.len());
                for arg in args {
                    values.push(self.eval(arg, locals, depth)?);
                }
                self.call(name, values, depth)
            }
            Expr::ListLit(items) => {
                let mut values = Vec::with_capacity(items.len());
                for item in items {
                    values.push(self.eval(item, locals, depth)?);
                }
                Ok(Value::List(values))
            }
            Expr::MapLit(entries) => {
                let mut map = BTreeMap::new();
                for (key, value) in entries {
                    map.insert(key.clone(), self.eval(value, locals, depth)?);
                }
                Ok(Value::Map(map))
            }
        }
    }

    fn call(&mut self, name: &str, args: Vec<Value>, depth: usize) -> Result<Value, VmError> {
        if let Some(result) = builtin(name, &args) {
            return result;
        }

        let script = self.script;
        let function = script
            .functions
            .get(name)
            .ok_or_else(|| VmError::Runtime(format!("unknown function '{}'", name)))?;
        if function.params.len() != args.len() {
            return Err(VmError::Runtime(format!(
                "function '{}' takes {} arguments, got {}",
                name,
                function.params.len(),
                args.len()
            )));
        }
        if depth + 1 > MAX_CALL_DEPTH {
            return Err(VmError::Runtime("call depth exceeded".to_string()));
        }

        let mut locals: Locals = function.params.iter().cloned().zip(args).collect();
        match self.exec_block(&function.body, &mut locals, depth + 1)? {
            Flow::Return(value) => Ok(value),
            Flow::Normal => Ok(Value::Null),
        }
    }
}

fn builtin(name: &str, args: &[Value]) -> Option<Result<Value, VmError>> {
    let arity = |expected: usize| -> Option<VmError> {
        if args.len() != expected {
            Some(VmError::Runtime(format!(
                "builtin '{}' takes {} arguments, got {}",
                name,
                expected,
                args.len()
            )))
        } else {
            None
        }
    };

    let result = match name {
        "int" => arity(1).map(Err).unwrap_or_else(|| match &args[0] {
            Value::Int(i) => Ok(Value::Int(*i)),
            Value::Float(f) => Ok(Value::Int(*f as i64)),
            Value::Bool(b) => Ok(Value::Int(*b as i64)),
            Value::Str(s) => s
                .trim()
                .parse::<i64>()
                .map(Value::Int)
                .map_err(|_| VmError::Runtime(format!("cannot convert '{}' to int", s))),
            other => Err(VmError::Runtime(format!(
                "cannot convert {} to int",
                other.type_name()
            ))),
        }),
        "float" => arity(1).map(Err).unwrap_or_else(|| match &args[0] {
            Value::Int(i) => Ok(Value::Float(*i as f64)),
            Value::Float(f) => Ok(Value::Float(*f)),
            Value::Str(s) => s
                .trim()
                .parse::<f64>()
                .map(Value::Float)
                .map_err(|_| VmError::Runtime(format!("cannot convert '{}' to float", s))),
            other => Err(VmError::Runtime(format!(
                "cannot convert {} to float",
                other.type_name()
            ))),
        }),
        "str" => arity(1)
            .map(Err)
            .unwrap_or_else(|| Ok(Value::Str(args[0].render()))),
        "len" => arity(1).map(Err).unwrap_or_else(|| match &args[0] {
            Value::Str(s) => Ok(Value::Int(s.chars().count() as i64)),
            Value::List(items) => Ok(Value::Int(items.len() as i64)),
            Value::Map(map) => Ok(Value::Int(map.len() as i64)),
            other => Err(VmError::Runtime(format!(
                "{} has no length",
                other.type_name()
            ))),
        }),
        "abs" => arity(1).map(Err).unwrap_or_else(|| match &args[0] {
            Value::Int(i) => Ok(Value::Int(i.abs())),
            Value::Float(f) => Ok(Value::Float(f.abs())),
            other => Err(VmError::Runtime(format!(
                "cannot take abs of {}",
                other.type_name()
            ))),
        }),
        "min" | "max" => arity(2).map(Err).unwrap_or_else(|| {
            let pick_left = match (&args[0], &args[1]) {
                (Value::Int(a), Value::Int(b)) => a <= b,
                (a, b) => match (numeric(a), numeric(b)) {
                    (Some(a), Some(b)) => a <= b,
                    _ => {
                        return Err(VmError::Runtime(format!(
                            "'{}' needs numbers, got {} and {}",
                            name,
                            args[0].type_name(),
                            args[1].type_name()
                        )))
                    }
                },
            };
            let wants_min = name == "min";
            if pick_left == wants_min {
                Ok(args[0].clone())
            } else {
                Ok(args[1].clone())
            }
        }),
        "has" => arity(2).map(Err).unwrap_or_else(|| match (&args[0], &args[1]) {
            (Value::Map(map), Value::Str(key)) => Ok(Value::Bool(map.contains_key(key))),
            (a, b) => Err(VmError::Runtime(format!(
                "'has' needs a map and a string key, got {} and {}",
                a.type_name(),
                b.type_name()
            ))),
        }),
        "keys" => arity(1).map(Err).unwrap_or_else(|| match &args[0] {
            Value::Map(map) => Ok(Value::List(
                map.keys().map(|k| Value::Str(k.clone())).collect(),
            )),
            other => Err(VmError::Runtime(format!(
                "'keys' needs a map, got {}",
                other.type_name()
            ))),
        }),
        "push" => arity(2).map(Err).unwrap_or_else(|| match &args[0] {
            Value::List(items) => {
                let mut items = items.clone();
                items.push(args[1].clone());
                Ok(Value::List(items))
            }
            other => Err(VmError::Runtime(format!(
                "'push' needs a list, got {}",
                other.type_name()
            ))),
        }),
        _ => return None,
    };
    Some(result)
}

fn numeric(value: &Value) -> Option<f64> {
    match value {
        Value::Int(i) => Some(*i as f64),
        Value::Float(f) => Some(*f),
        _ => None,
    }
}

fn binary_op(op: &BinOp, left: Value, right: Value) -> Result<Value, VmError> {
    match op {
        BinOp::Add => match (&left, &right) {
            (Value::Int(a), Value::Int(b)) => a
                .checked_add(*b)
                .map(Value::Int)
                .ok_or_else(|| VmError::Runtime("integer overflow".to_string())),
            (Value::Str(a), Value::Str(b)) => Ok(Value::Str(format!("{}{}", a, b))),
            (Value::List(a), Value::List(b)) => {
                let mut items = a.clone();
                items.extend(b.iter().cloned());
                Ok(Value::List(items))
            }
            _ => numeric_pair(&left, &right, "+").map(|(a, b)| Value::Float(a + b)),
        },
        BinOp::Sub => match (&left, &right) {
            (Value::Int(a), Value::Int(b)) => a
                .checked_sub(*b)
                .map(Value::Int)
                .ok_or_else(|| VmError::Runtime("integer overflow".to_string())),
            _ => numeric_pair(&left, &right, "-").map(|(a, b)| Value::Float(a - b)),
        },
        BinOp::Mul => match (&left, &right) {
            (Value::Int(a), Value::Int(b)) => a
                .checked_mul(*b)
                .map(Value::Int)
                .ok_or_else(|| VmError::Runtime("integer overflow".to_string())),
            _ => numeric_pair(&left, &right, "*").map(|(a, b)| Value::Float(a * b)),
        },
        BinOp::Div => match (&left, &right) {
            (Value::Int(a), Value::Int(b)) => {
                if *b == 0 {
                    Err(VmError::Runtime("division by zero".to_string()))
                } else {
                    Ok(Value::Int(a / b))
                }
            }
            _ => {
                let (a, b) = numeric_pair(&left, &right, "/")?;
                if b == 0.0 {
                    Err(VmError::Runtime("division by zero".to_string()))
                } else {
                    Ok(Value::Float(a / b))
                }
            }
        },
        BinOp::Mod => match (&left, &right) {
            (Value::Int(a), Value::Int(b)) => {
                if *b == 0 {
                    Err(VmError::Runtime("division by zero".to_string()))
                } else {
                    Ok(Value::Int(a % b))
                }
            }
            (a, b) => Err(VmError::Runtime(format!(
                "'%' needs integers, got {} and {}",
                a.type_name(),
                b.type_name()
            ))),
        },
        BinOp::Eq => Ok(Value::Bool(values_equal(&left, &right))),
        BinOp::Ne => Ok(Value::Bool(!values_equal(&left, &right))),
        BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge => {
            let ordering = match (&left, &right) {
                (Value::Str(a), Value::Str(b)) => a.cmp(b),
                (a, b) => match (numeric(a), numeric(b)) {
                    (Some(a), Some(b)) => a
                        .partial_cmp(&b)
                        .ok_or_else(|| VmError::Runtime("unordered comparison".to_string()))?,
                    _ => {
                        return Err(VmError::Runtime(format!(
                            "cannot order {} and {}",
                            a.type_name(),
                            b.type_name()
                        )))
                    }
                },
            };
            let holds = match op {
                BinOp::Lt => ordering.is_lt(),
                BinOp::Le => ordering.is_le(),
                BinOp::Gt => ordering.is_gt(),
                _ => ordering.is_ge(),
            };
            Ok(Value::Bool(holds))
        }
        BinOp::And | BinOp::Or => unreachable!("short-circuit ops handled in eval"),
    }
}

fn numeric_pair(left: &Value, right: &Value, op: &str) -> Result<(f64, f64), VmError> {
    match (numeric(left), numeric(right)) {
        (Some(a), Some(b)) => Ok((a, b)),
        _ => Err(VmError::Runtime(format!(
            "'{}' needs numbers, got {} and {}",
            op,
            left.type_name(),
            right.type_name()
        ))),
    }
}

fn values_equal(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Int(a), Value::Float(b)) | (Value::Float(b), Value::Int(a)) => *a as f64 == *b,
        (a, b) => a == b,
    }
}

fn index_value(container: &Value, index: &Value) -> Result<Value, VmError> {
    match (container, index) {
        // Missing map keys read as null, so contracts can probe before init
        (Value::Map(map), Value::Str(key)) => {
            Ok(map.get(key).cloned().unwrap_or(Value::Null))
        }
        (Value::List(items), Value::Int(i)) => {
            let idx = usize::try_from(*i)
                .ok()
                .filter(|idx| *idx < items.len())
                .ok_or_else(|| VmError::Runtime(format!("list index {} out of range", i)))?;
            Ok(items[idx].clone())
        }
        (c, i) => Err(VmError::Runtime(format!(
            "cannot index {} with {}",
            c.type_name(),
            i.type_name()
        ))),
    }
}

fn set_in(container: &mut Value, path: &[Value], value: Value) -> Result<(), VmError> {
    if path.is_empty() {
        *container = value;
        return Ok(());
    }
    match (container, &path[0]) {
        (Value::Map(map), Value::Str(key)) => {
            if path.len() == 1 {
                map.insert(key.clone(), value);
                Ok(())
            } else {
                match map.get_mut(key) {
                    Some(inner) => set_in(inner, &path[1..], value),
                    None => Err(VmError::Runtime(format!("unknown key '{}'", key))),
                }
            }
        }
        (Value::List(items), Value::Int(i)) => {
            let len = items.len();
            let idx = usize::try_from(*i)
                .ok()
                .filter(|idx| *idx < len)
                .ok_or_else(|| VmError::Runtime(format!("list index {} out of range", i)))?;
            set_in(&mut items[idx], &path[1..], value)
        }
        (c, i) => Err(VmError::Runtime(format!(
            "cannot index {} with {}",
            c.type_name(),
            i.type_name()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(source: &str, method: &str, args: &[Value]) -> Result<Invocation, VmError> {
        execute(source, method, args, &BTreeMap::new())
    }

    #[test]
    fn test_counter_contract_flow() {
        let first = run(EXAMPLE_CONTRACT, "init", &[]).unwrap();
        assert_eq!(first.return_value, Value::Str("initialized".to_string()));
        assert_eq!(first.state.get("counter"), Some(&Value::Int(0)));
        assert_eq!(
            first.state.get("owner"),
            Some(&Value::Str("GhostNetwork".to_string()))
        );

        let second = execute(
            EXAMPLE_CONTRACT,
            "increment",
            &[Value::parse_arg("5")],
            &first.state,
        )
        .unwrap();
        assert_eq!(second.return_value, Value::Int(5));

        let third = execute(
            EXAMPLE_CONTRACT,
            "increment",
            &[Value::parse_arg("2")],
            &second.state,
        )
        .unwrap();
        assert_eq!(third.return_value, Value::Int(7));

        let read = execute(EXAMPLE_CONTRACT, "get_counter", &[], &third.state).unwrap();
        assert_eq!(read.return_value, Value::Int(7));
        assert_eq!(read.state, third.state);
    }

    #[test]
    fn test_forbidden_tokens_rejected() {
        for token in FORBIDDEN_TOKENS {
            let source = format!("fn init() {{ x = \"{}\"; }}", token);
            assert!(
                matches!(validate(&source), Err(VmError::Validation(_))),
                "token {} slipped through",
                token
            );
        }
    }

    #[test]
    fn test_unknown_method() {
        let err = run(EXAMPLE_CONTRACT, "destroy", &[]).unwrap_err();
        assert!(matches!(err, VmError::Runtime(_)));
    }

    #[test]
    fn test_arity_mismatch() {
        let err = run(EXAMPLE_CONTRACT, "increment", &[]).unwrap_err();
        assert!(matches!(err, VmError::Runtime(_)));
    }

    #[test]
    fn test_argument_parsing() {
        assert_eq!(Value::parse_arg("42"), Value::Int(42));
        assert_eq!(Value::parse_arg("-7"), Value::Int(-7));
        assert_eq!(Value::parse_arg("4.5"), Value::Str("4.5".to_string()));
        assert_eq!(Value::parse_arg("ghost"), Value::Str("ghost".to_string()));
    }

    #[test]
    fn test_state_survives_only_on_success() {
        let source = r#"
            fn boom() {
                state["x"] = 1;
                y = 1 / 0;
                return y;
            }
        "#;
        let state = BTreeMap::new();
        let err = execute(source, "boom", &[], &state).unwrap_err();
        assert_eq!(err, VmError::Runtime("division by zero".to_string()));
        // The caller's map is untouched; nothing was persisted
        assert!(state.is_empty());
    }

    #[test]
    fn test_while_loop_and_locals() {
        let source = r#"
            fn sum_to(n) {
                total = 0;
                i = 1;
                while (i <= n) {
                    total = total + i;
                    i = i + 1;
                }
                return total;
            }
        "#;
        let result = run(source, "sum_to", &[Value::Int(10)]).unwrap();
        assert_eq!(result.return_value, Value::Int(55));
    }

    #[test]
    fn test_step_budget_stops_infinite_loops() {
        let source = r#"
            fn forever() {
                while (true) {
                    x = 1;
                }
            }
        "#;
        let err = run(source, "forever", &[]).unwrap_err();
        assert_eq!(err, VmError::Runtime("step budget exceeded".to_string()));
    }

    #[test]
    fn test_call_depth_cap() {
        let source = r#"
            fn recurse(n) {
                return recurse(n + 1);
            }
        "#;
        let err = run(source, "recurse", &[Value::Int(0)]).unwrap_err();
        assert_eq!(err, VmError::Runtime("call depth exceeded".to_string()));
    }

    #[test]
    fn test_lists_maps_and_builtins() {
        let source = r#"
            fn collect() {
                items = [1, 2, 3];
                items = push(items, 9);
                record = {"name": "ghost", "tags": items};
                state["record"] = record;
                return len(record["tags"]);
            }
        "#;
        let result = run(source, "collect", &[]).unwrap();
        assert_eq!(result.return_value, Value::Int(4));
        match result.state.get("record") {
            Some(Value::Map(record)) => {
                assert_eq!(record.get("name"), Some(&Value::Str("ghost".to_string())));
            }
            other => panic!("expected a map, got {:?}", other),
        }
    }

    #[test]
    fn test_conditionals_and_comparison() {
        let source = r#"
            fn grade(score) {
                if (score >= 90) {
                    return "a";
                } else if (score >= 50) {
                    return "b";
                } else {
                    return "c";
                }
            }
        "#;
        assert_eq!(
            run(source, "grade", &[Value::Int(95)]).unwrap().return_value,
            Value::Str("a".to_string())
        );
        assert_eq!(
            run(source, "grade", &[Value::Int(60)]).unwrap().return_value,
            Value::Str("b".to_string())
        );
        assert_eq!(
            run(source, "grade", &[Value::Int(10)]).unwrap().return_value,
            Value::Str("c".to_string())
        );
    }

    #[test]
    fn test_missing_state_key_reads_null() {
        let source = r#"
            fn probe() {
                if (state["missing"] == null) {
                    return "absent";
                }
                return "present";
            }
        "#;
        let result = run(source, "probe", &[]).unwrap();
        assert_eq!(result.return_value, Value::Str("absent".to_string()));
    }

    #[test]
    fn test_nested_state_mutation() {
        let source = r#"
            fn setup() {
                state["config"] = {"limit": 10};
                state["config"]["limit"] = 20;
                return state["config"]["limit"];
            }
        "#;
        let result = run(source, "setup", &[]).unwrap();
        assert_eq!(result.return_value, Value::Int(20));
    }

    #[test]
    fn test_determinism() {
        let mut state = BTreeMap::new();
        state.insert("counter".to_string(), Value::Int(3));
        let a = execute(EXAMPLE_CONTRACT, "increment", &[Value::Int(4)], &state).unwrap();
        let b = execute(EXAMPLE_CONTRACT, "increment", &[Value::Int(4)], &state).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_json_round_trip() {
        let mut state = BTreeMap::new();
        state.insert("n".to_string(), Value::Int(1));
        state.insert("f".to_string(), Value::Float(1.5));
        state.insert("s".to_string(), Value::Str("x".to_string()));
        state.insert("l".to_string(), Value::List(vec![Value::Bool(true), Value::Null]));
        let json = serde_json::Value::Object(
            state.iter().map(|(k, v)| (k.clone(), v.to_json())).collect(),
        );
        let back = Value::from_json(&json);
        assert_eq!(back, Value::Map(state));
    }

    #[test]
    fn test_string_concatenation() {
        let source = r#"
            fn hello(name) {
                return "hello " + str(name);
            }
        "#;
        assert_eq!(
            run(source, "hello", &[Value::Str("ghost".to_string())])
                .unwrap()
                .return_value,
            Value::Str("hello ghost".to_string())
        );
    }

    #[test]
    fn test_parse_errors_are_validation() {
        assert!(matches!(
            run("fn broken( {", "broken", &[]),
            Err(VmError::Validation(_))
        ));
        assert!(matches!(
            run("fn f() { x = ; }", "f", &[]),
            Err(VmError::Validation(_))
        ));
    }
}
