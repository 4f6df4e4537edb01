//! Computed field expressions
//!
//! A computed field derives its cell from other fields of the same row with a
//! small formula language:
//!
//! ```text
//! upper(trim(region)) + "-" + substr(code, 0, 3)
//! amount * 1.2
//! coalesce(nickname, first_name, "unknown")
//! ```
//!
//! Literals are numbers, single or double quoted strings and `null`. Bare
//! identifiers reference fields by name; numeric fields arrive as numbers and
//! everything else as text. `+` concatenates when either side is text and adds
//! otherwise, `- * /` always work on numbers. Functions: `upper`, `lower`,
//! `trim`, `len`, `substr(text, start[, len])`, `concat`, `coalesce`.
//!
//! Expressions compile once, when the field is defined, and the compiled form
//! sits behind [`Evaluate`] so the transcoder never sees the language itself.

use std::collections::HashMap;
use std::fmt;

/// Read access to the fields of the row being encoded.
///
/// Implementations decide how a cell is typed: the schema hands numeric
/// fields over as numbers and everything else as text. Empty cells are null.
pub trait FieldLookup {
    fn value_of(&self, field: &str) -> Option<ExprValue>;
}

/// Plain string rows, every non-empty cell is text.
impl FieldLookup for HashMap<String, String> {
    fn value_of(&self, field: &str) -> Option<ExprValue> {
        self.get(field).map(|v| {
            if v.is_empty() {
                ExprValue::Null
            } else {
                ExprValue::Text(v.clone())
            }
        })
    }
}

/// Something that turns a row into a computed value.
pub trait Evaluate: Send + Sync + fmt::Debug {
    fn evaluate(&self, row: &dyn FieldLookup) -> Result<ExprValue, String>;

    /// Field names the expression reads
    fn references(&self) -> &[String];

    /// The text the evaluator was compiled from
    fn source(&self) -> &str;
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExprValue {
    Null,
    Number(f64),
    Text(String),
}

impl ExprValue {
    /// Cell text for the computed value; null renders empty.
    pub fn render(&self) -> String {
        match self {
            ExprValue::Null => String::new(),
            ExprValue::Text(s) => s.clone(),
            ExprValue::Number(n) if n.fract() == 0.0 && n.abs() < 1e15 => format!("{}", *n as i64),
            ExprValue::Number(n) => n.to_string(),
        }
    }

    fn as_text(&self) -> String {
        self.render()
    }

    fn as_number(&self) -> Result<Option<f64>, String> {
        match self {
            ExprValue::Null => Ok(None),
            ExprValue::Number(n) => Ok(Some(*n)),
            ExprValue::Text(s) => s
                .trim()
                .parse::<f64>()
                .map(Some)
                .map_err(|_| format!("cannot use '{s}' as a number")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Func {
    Upper,
    Lower,
    Trim,
    Len,
    Substr,
    Concat,
    Coalesce,
}

impl Func {
    fn lookup(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "upper" => Some(Func::Upper),
            "lower" => Some(Func::Lower),
            "trim" => Some(Func::Trim),
            "len" => Some(Func::Len),
            "substr" => Some(Func::Substr),
            "concat" => Some(Func::Concat),
            "coalesce" => Some(Func::Coalesce),
            _ => None,
        }
    }

    fn arity(&self) -> (usize, usize) {
        match self {
            Func::Upper | Func::Lower | Func::Trim | Func::Len => (1, 1),
            Func::Substr => (2, 3),
            Func::Concat | Func::Coalesce => (1, usize::MAX),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Node {
    Literal(ExprValue),
    Field(String),
    Neg(Box<Node>),
    Binary(BinOp, Box<Node>, Box<Node>),
    Call(Func, Vec<Node>),
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Text(String),
    Ident(String),
    Op(char),
    LParen,
    RParen,
    Comma,
}

fn tokenize(src: &str) -> Result<Vec<Token>, String> {
    let chars: Vec<char> = src.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            c if c.is_whitespace() => i += 1,
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            },
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            },
            ',' => {
                tokens.push(Token::Comma);
                i += 1;
            },
            '+' | '-' | '*' | '/' => {
                tokens.push(Token::Op(c));
                i += 1;
            },
            '"' | '\'' => {
                let quote = c;
                let mut text = String::new();
                let mut j = i + 1;
                loop {
                    match chars.get(j) {
                        None => return Err(format!("unterminated string starting at {i}")),
                        Some(&q) if q == quote => break,
                        Some('\\') => {
                            let escaped = chars
                                .get(j + 1)
                                .ok_or_else(|| format!("dangling escape at {j}"))?;
                            text.push(*escaped);
                            j += 2;
                        },
                        Some(&ch) => {
                            text.push(ch);
                            j += 1;
                        },
                    }
                }
                tokens.push(Token::Text(text));
                i = j + 1;
            },
            c if c.is_ascii_digit() || c == '.' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let literal: String = chars[start..i].iter().collect();
                let value = literal
                    .parse::<f64>()
                    .map_err(|_| format!("malformed number '{literal}'"))?;
                tokens.push(Token::Number(value));
            },
            c if c.is_ascii_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                tokens.push(Token::Ident(chars[start..i].iter().collect()));
            },
            other => return Err(format!("unexpected character '{other}' at {i}")),
        }
    }

    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    references: Vec<String>,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn expect(&mut self, want: Token) -> Result<(), String> {
        match self.next() {
            Some(ref t) if *t == want => Ok(()),
            Some(t) => Err(format!("expected {want:?}, found {t:?}")),
            None => Err(format!("expected {want:?}, found end of expression")),
        }
    }

    // sum := product (('+' | '-') product)*
    fn sum(&mut self) -> Result<Node, String> {
        let mut left = self.product()?;
        while let Some(Token::Op(op @ ('+' | '-'))) = self.peek().cloned() {
            self.pos += 1;
            let right = self.product()?;
            let op = if op == '+' { BinOp::Add } else { BinOp::Sub };
            left = Node::Binary(op, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    // product := unary (('*' | '/') unary)*
    fn product(&mut self) -> Result<Node, String> {
        let mut left = self.unary()?;
        while let Some(Token::Op(op @ ('*' | '/'))) = self.peek().cloned() {
            self.pos += 1;
            let right = self.unary()?;
            let op = if op == '*' { BinOp::Mul } else { BinOp::Div };
            left = Node::Binary(op, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn unary(&mut self) -> Result<Node, String> {
        if let Some(Token::Op('-')) = self.peek() {
            self.pos += 1;
            return Ok(Node::Neg(Box::new(self.unary()?)));
        }
        self.primary()
    }

    fn primary(&mut self) -> Result<Node, String> {
        match self.next() {
            Some(Token::Number(n)) => Ok(Node::Literal(ExprValue::Number(n))),
            Some(Token::Text(s)) => Ok(Node::Literal(ExprValue::Text(s))),
            Some(Token::LParen) => {
                let inner = self.sum()?;
                self.expect(Token::RParen)?;
                Ok(inner)
            },
            Some(Token::Ident(name)) if name.eq_ignore_ascii_case("null") => {
                Ok(Node::Literal(ExprValue::Null))
            },
            Some(Token::Ident(name)) if self.peek() == Some(&Token::LParen) => {
                self.pos += 1;
                let func = Func::lookup(&name).ok_or_else(|| format!("unknown function '{name}'"))?;
                let mut args = Vec::new();
                if self.peek() != Some(&Token::RParen) {
                    loop {
                        args.push(self.sum()?);
                        if self.peek() == Some(&Token::Comma) {
                            self.pos += 1;
                        } else {
                            break;
                        }
                    }
                }
                self.expect(Token::RParen)?;
                let (min, max) = func.arity();
                if args.len() < min || args.len() > max {
                    return Err(format!("{name}() takes {} argument(s), got {}", arity_text(min, max), args.len()));
                }
                Ok(Node::Call(func, args))
            },
            Some(Token::Ident(name)) => {
                if !self.references.contains(&name) {
                    self.references.push(name.clone());
                }
                Ok(Node::Field(name))
            },
            Some(t) => Err(format!("unexpected {t:?}")),
            None => Err("unexpected end of expression".to_string()),
        }
    }
}

fn arity_text(min: usize, max: usize) -> String {
    match (min, max) {
        (a, b) if a == b => a.to_string(),
        (a, usize::MAX) => format!("at least {a}"),
        (a, b) => format!("{a} to {b}"),
    }
}

/// Compiled formula.
#[derive(Debug, Clone)]
pub struct Expression {
    source: String,
    root: Node,
    references: Vec<String>,
}

impl Expression {
    pub fn compile(source: &str) -> Result<Self, String> {
        let tokens = tokenize(source)?;
        if tokens.is_empty() {
            return Err("expression is empty".to_string());
        }
        let mut parser = Parser {
            tokens,
            pos: 0,
            references: Vec::new(),
        };
        let root = parser.sum()?;
        if let Some(extra) = parser.peek() {
            return Err(format!("unexpected trailing {extra:?}"));
        }
        Ok(Self {
            source: source.to_string(),
            root,
            references: parser.references,
        })
    }
}

impl Evaluate for Expression {
    fn evaluate(&self, row: &dyn FieldLookup) -> Result<ExprValue, String> {
        eval(&self.root, row)
    }

    fn references(&self) -> &[String] {
        &self.references
    }

    fn source(&self) -> &str {
        &self.source
    }
}

fn eval(node: &Node, row: &dyn FieldLookup) -> Result<ExprValue, String> {
    match node {
        Node::Literal(v) => Ok(v.clone()),
        Node::Field(name) => Ok(row.value_of(name).unwrap_or(ExprValue::Null)),
        Node::Neg(inner) => Ok(match eval(inner, row)?.as_number()? {
            Some(n) => ExprValue::Number(-n),
            None => ExprValue::Null,
        }),
        Node::Binary(op, l, r) => {
            let left = eval(l, row)?;
            let right = eval(r, row)?;
            binary(*op, left, right)
        },
        Node::Call(func, args) => {
            let values = args
                .iter()
                .map(|a| eval(a, row))
                .collect::<Result<Vec<_>, _>>()?;
            call(*func, values)
        },
    }
}

fn binary(op: BinOp, left: ExprValue, right: ExprValue) -> Result<ExprValue, String> {
    if op == BinOp::Add
        && (matches!(left, ExprValue::Text(_)) || matches!(right, ExprValue::Text(_)))
    {
        return Ok(ExprValue::Text(left.as_text() + &right.as_text()));
    }

    let (Some(a), Some(b)) = (left.as_number()?, right.as_number()?) else {
        return Ok(ExprValue::Null);
    };
    Ok(ExprValue::Number(match op {
        BinOp::Add => a + b,
        BinOp::Sub => a - b,
        BinOp::Mul => a * b,
        BinOp::Div if b == 0.0 => return Err("division by zero".to_string()),
        BinOp::Div => a / b,
    }))
}

fn call(func: Func, args: Vec<ExprValue>) -> Result<ExprValue, String> {
    let mut args = args.into_iter();
    let first = args.next().unwrap_or(ExprValue::Null);
    Ok(match func {
        Func::Upper => map_text(first, |s| s.to_uppercase()),
        Func::Lower => map_text(first, |s| s.to_lowercase()),
        Func::Trim => map_text(first, |s| s.trim().to_string()),
        Func::Len => match first {
            ExprValue::Null => ExprValue::Number(0.0),
            other => ExprValue::Number(other.as_text().chars().count() as f64),
        },
        Func::Substr => {
            let text = first.as_text();
            let start = args.next().map(|v| v.as_number()).transpose()?.flatten().unwrap_or(0.0);
            let len = args.next().map(|v| v.as_number()).transpose()?.flatten();
            let start = start.max(0.0) as usize;
            let taken: String = match len {
                Some(n) => text.chars().skip(start).take(n.max(0.0) as usize).collect(),
                None => text.chars().skip(start).collect(),
            };
            ExprValue::Text(taken)
        },
        Func::Concat => {
            let mut out = first.as_text();
            for arg in args {
                out.push_str(&arg.as_text());
            }
            ExprValue::Text(out)
        },
        Func::Coalesce => std::iter::once(first)
            .chain(args)
            .find(|v| *v != ExprValue::Null)
            .unwrap_or(ExprValue::Null),
    })
}

fn map_text(value: ExprValue, f: impl Fn(&str) -> String) -> ExprValue {
    match value {
        ExprValue::Null => ExprValue::Null,
        other => ExprValue::Text(f(&other.as_text())),
    }
}
