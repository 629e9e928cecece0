//! Arithmetic expressions over named variables.
//!
//! Used by the `expression` transform (`rate`, `val`) and by `generic_calc`
//! (`A` through `E`). Grammar:
//!
//! ```text
//! expr   := term (('+' | '-') term)*
//! term   := unary (('*' | '/' | '%') unary)*
//! unary  := ('-' | '+') unary | power
//! power  := atom (('^' | '**') unary)?
//! atom   := number | ident | ident '(' expr (',' expr)* ')' | '(' expr ')'
//! ```
//!
//! Functions: `abs`, `sqrt`, `exp`, `ln`/`log`, `log10`, `floor`, `ceil`,
//! `round`, `pow`, variadic `min`/`max`, and `in(x, a, b, ...)` (1 when `x`
//! equals one of the rest, else 0).
//!
//! A `math.` prefix on identifiers is accepted and ignored. Evaluation never
//! panics; division by zero yields a non-finite value the caller must check.

use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Num(f64),
    Ident(String),
    Op(char),
    Pow,
    LParen,
    RParen,
    Comma,
}

#[derive(Debug, Clone, PartialEq)]
enum Node {
    Num(f64),
    Var(String),
    Neg(Box<Node>),
    Bin(char, Box<Node>, Box<Node>),
    Call(String, Vec<Node>),
}

/// A parsed expression, reusable across evaluations.
#[derive(Debug, Clone, PartialEq)]
pub struct Expression {
    source: String,
    root: Node,
}

impl Expression {
    /// Parse `source`. Unknown function names are rejected here; unknown
    /// variables are only detected at evaluation time.
    pub fn parse(source: &str) -> Result<Self> {
        let tokens = tokenize(source)?;
        let mut parser = Parser { tokens, pos: 0 };
        let root = parser.expr()?;
        if parser.pos != parser.tokens.len() {
            return Err(Error::Expression(format!(
                "unexpected trailing input in '{source}'"
            )));
        }
        Ok(Self {
            source: source.to_string(),
            root,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Names of all variables referenced by the expression.
    pub fn variables(&self) -> Vec<String> {
        let mut out = Vec::new();
        collect_vars(&self.root, &mut out);
        out
    }

    /// Evaluate with the given variable bindings.
    pub fn eval(&self, vars: &[(&str, f64)]) -> Result<f64> {
        eval_node(&self.root, vars)
    }
}

/// Parse and evaluate in one step.
pub fn evaluate(source: &str, vars: &[(&str, f64)]) -> Result<f64> {
    Expression::parse(source)?.eval(vars)
}

fn collect_vars(node: &Node, out: &mut Vec<String>) {
    match node {
        Node::Num(_) => {}
        Node::Var(name) => {
            if !out.contains(name) {
                out.push(name.clone());
            }
        }
        Node::Neg(inner) => collect_vars(inner, out),
        Node::Bin(_, l, r) => {
            collect_vars(l, out);
            collect_vars(r, out);
        }
        Node::Call(_, args) => args.iter().for_each(|a| collect_vars(a, out)),
    }
}

fn eval_node(node: &Node, vars: &[(&str, f64)]) -> Result<f64> {
    Ok(match node {
        Node::Num(v) => *v,
        Node::Var(name) => match vars.iter().find(|(n, _)| n == name) {
            Some((_, v)) => *v,
            None => match name.as_str() {
                "pi" => std::f64::consts::PI,
                "e" => std::f64::consts::E,
                _ => return Err(Error::Expression(format!("unknown variable '{name}'"))),
            },
        },
        Node::Neg(inner) => -eval_node(inner, vars)?,
        Node::Bin(op, l, r) => {
            let (a, b) = (eval_node(l, vars)?, eval_node(r, vars)?);
            match op {
                '+' => a + b,
                '-' => a - b,
                '*' => a * b,
                '/' => a / b,
                '%' => a % b,
                _ => a.powf(b),
            }
        }
        Node::Call(name, args) => {
            let vals = args
                .iter()
                .map(|a| eval_node(a, vars))
                .collect::<Result<Vec<f64>>>()?;
            call(name, &vals)?
        }
    })
}

const FUNCTIONS: &[(&str, usize)] = &[
    ("abs", 1),
    ("sqrt", 1),
    ("exp", 1),
    ("ln", 1),
    ("log", 1),
    ("log10", 1),
    ("floor", 1),
    ("ceil", 1),
    ("round", 1),
    ("pow", 2),
    ("min", 0),
    ("max", 0),
    ("in", 0),
];

fn call(name: &str, args: &[f64]) -> Result<f64> {
    let arg = |i: usize| args[i];
    Ok(match name {
        "abs" => arg(0).abs(),
        "sqrt" => arg(0).sqrt(),
        "exp" => arg(0).exp(),
        "ln" | "log" => arg(0).ln(),
        "log10" => arg(0).log10(),
        "floor" => arg(0).floor(),
        "ceil" => arg(0).ceil(),
        "round" => arg(0).round(),
        "pow" => arg(0).powf(arg(1)),
        "min" => args.iter().copied().fold(f64::INFINITY, f64::min),
        "max" => args.iter().copied().fold(f64::NEG_INFINITY, f64::max),
        "in" => match args.split_first() {
            Some((x, rest)) if rest.contains(x) => 1.0,
            _ => 0.0,
        },
        _ => return Err(Error::Expression(format!("unknown function '{name}'"))),
    })
}

fn tokenize(s: &str) -> Result<Vec<Token>> {
    let chars: Vec<char> = s.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        match c {
            ' ' | '\t' | '\n' | '\r' => i += 1,
            '0'..='9' | '.' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                if i < chars.len() && (chars[i] == 'e' || chars[i] == 'E') {
                    let mut j = i + 1;
                    if j < chars.len() && (chars[j] == '+' || chars[j] == '-') {
                        j += 1;
                    }
                    if j < chars.len() && chars[j].is_ascii_digit() {
                        i = j;
                        while i < chars.len() && chars[i].is_ascii_digit() {
                            i += 1;
                        }
                    }
                }
                let text: String = chars[start..i].iter().collect();
                let v = text
                    .parse()
                    .map_err(|_| Error::Expression(format!("bad number '{text}'")))?;
                tokens.push(Token::Num(v));
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len()
                    && (chars[i].is_alphanumeric() || chars[i] == '_' || chars[i] == '.')
                {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let name = text.strip_prefix("math.").unwrap_or(&text).to_string();
                tokens.push(Token::Ident(name));
            }
            '*' if chars.get(i + 1) == Some(&'*') => {
                tokens.push(Token::Pow);
                i += 2;
            }
            '^' => {
                tokens.push(Token::Pow);
                i += 1;
            }
            '+' | '-' | '*' | '/' | '%' => {
                tokens.push(Token::Op(c));
                i += 1;
            }
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            ',' => {
                tokens.push(Token::Comma);
                i += 1;
            }
            other => {
                return Err(Error::Expression(format!(
                    "unexpected character '{other}' in '{s}'"
                )));
            }
        }
    }
    if tokens.is_empty() {
        return Err(Error::Expression("empty expression".into()));
    }
    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let t = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        t
    }

    fn expect(&mut self, want: Token) -> Result<()> {
        match self.next() {
            Some(t) if t == want => Ok(()),
            other => Err(Error::Expression(format!(
                "expected {want:?}, found {other:?}"
            ))),
        }
    }

    fn expr(&mut self) -> Result<Node> {
        let mut lhs = self.term()?;
        while let Some(Token::Op(op @ ('+' | '-'))) = self.peek().cloned() {
            self.pos += 1;
            let rhs = self.term()?;
            lhs = Node::Bin(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn term(&mut self) -> Result<Node> {
        let mut lhs = self.unary()?;
        while let Some(Token::Op(op @ ('*' | '/' | '%'))) = self.peek().cloned() {
            self.pos += 1;
            let rhs = self.unary()?;
            lhs = Node::Bin(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn unary(&mut self) -> Result<Node> {
        match self.peek() {
            Some(Token::Op('-')) => {
                self.pos += 1;
                Ok(Node::Neg(Box::new(self.unary()?)))
            }
            Some(Token::Op('+')) => {
                self.pos += 1;
                self.unary()
            }
            _ => self.power(),
        }
    }

    fn power(&mut self) -> Result<Node> {
        let base = self.atom()?;
        if self.peek() == Some(&Token::Pow) {
            self.pos += 1;
            let exp = self.unary()?;
            return Ok(Node::Bin('^', Box::new(base), Box::new(exp)));
        }
        Ok(base)
    }

    fn atom(&mut self) -> Result<Node> {
        match self.next() {
            Some(Token::Num(v)) => Ok(Node::Num(v)),
            Some(Token::LParen) => {
                let inner = self.expr()?;
                self.expect(Token::RParen)?;
                Ok(inner)
            }
            Some(Token::Ident(name)) => {
                if self.peek() != Some(&Token::LParen) {
                    return Ok(Node::Var(name));
                }
                self.pos += 1;
                let mut args = vec![self.expr()?];
                while self.peek() == Some(&Token::Comma) {
                    self.pos += 1;
                    args.push(self.expr()?);
                }
                self.expect(Token::RParen)?;
                check_arity(&name, args.len())?;
                Ok(Node::Call(name, args))
            }
            other => Err(Error::Expression(format!("unexpected token {other:?}"))),
        }
    }
}

fn check_arity(name: &str, n: usize) -> Result<()> {
    match FUNCTIONS.iter().find(|(f, _)| *f == name) {
        None => Err(Error::Expression(format!("unknown function '{name}'"))),
        Some((_, 0)) => Ok(()),
        Some((_, want)) if *want == n => Ok(()),
        Some((_, want)) => Err(Error::Expression(format!(
            "{name}() takes {want} argument(s), got {n}"
        ))),
    }
}
