//! Predicate Expressions - conditional `if`/`when` and loop `until`
//!
//! Parsed once at compile time into an `Expr` tree, evaluated per execution
//! against an `ExprScope`. Grammar (lowest precedence first):
//!
//! ```text
//! or      := and ("or" | "||") and ...
//! and     := not ("and" | "&&") not ...
//! not     := ("not" | "!") not | cmp
//! cmp     := primary (op primary)?
//! op      := == != < <= > >= contains starts_with ends_with matches
//! primary := input | iteration | steps.NAME | 'str' | "str" | NUMBER
//!          | true | false | null | len(expr) | (expr)
//! ```

use std::borrow::Cow;
use std::fmt;

use regex::Regex;
use serde_json::Value;

use crate::store::value_text;

/// Values a predicate can read
pub trait ExprScope {
    /// Current cursor value
    fn input(&self) -> &Value;
    /// 1-based loop iteration, 0 outside loops
    fn iteration(&self) -> u32;
    /// Latest output of a prior step
    fn step_output(&self, name: &str) -> Option<&Value>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Contains,
    StartsWith,
    EndsWith,
    Matches,
}

impl CmpOp {
    fn symbol(self) -> &'static str {
        match self {
            Self::Eq => "==",
            Self::Ne => "!=",
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Gt => ">",
            Self::Ge => ">=",
            Self::Contains => "contains",
            Self::StartsWith => "starts_with",
            Self::EndsWith => "ends_with",
            Self::Matches => "matches",
        }
    }
}

#[derive(Debug, Clone)]
pub enum Expr {
    Input,
    Iteration,
    Step(String),
    Literal(Value),
    Len(Box<Expr>),
    Compare {
        op: CmpOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
        /// Pre-compiled pattern when `matches` has a literal right side
        pattern: Option<Regex>,
    },
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
}

/// A parsed predicate plus its source text
#[derive(Debug, Clone)]
pub struct Predicate {
    source: String,
    expr: Expr,
}

impl Predicate {
    pub fn parse(source: &str) -> Result<Self, String> {
        let tokens = tokenize(source)?;
        if tokens.is_empty() {
            return Err("empty expression".to_string());
        }
        let mut parser = Parser { tokens, pos: 0 };
        let expr = parser.parse_or()?;
        if let Some(tok) = parser.peek() {
            return Err(format!("unexpected trailing token {}", tok));
        }
        Ok(Self {
            source: source.to_string(),
            expr,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn expr(&self) -> &Expr {
        &self.expr
    }

    /// Step names read through `steps.NAME`
    pub fn step_refs(&self) -> Vec<&str> {
        let mut refs = Vec::new();
        collect_refs(&self.expr, &mut refs);
        refs
    }

    pub fn evaluate(&self, scope: &dyn ExprScope) -> Result<bool, String> {
        Ok(truthy(&eval(&self.expr, scope)?))
    }
}

impl fmt::Display for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

fn collect_refs<'a>(expr: &'a Expr, out: &mut Vec<&'a str>) {
    match expr {
        Expr::Step(name) => out.push(name),
        Expr::Len(inner) | Expr::Not(inner) => collect_refs(inner, out),
        Expr::Compare { lhs, rhs, .. } | Expr::And(lhs, rhs) | Expr::Or(lhs, rhs) => {
            collect_refs(lhs, out);
            collect_refs(rhs, out);
        }
        Expr::Input | Expr::Iteration | Expr::Literal(_) => {}
    }
}

// ═══════════════════════════════════════════════════════════════
// Evaluation
// ═══════════════════════════════════════════════════════════════

fn eval(expr: &Expr, scope: &dyn ExprScope) -> Result<Value, String> {
    Ok(match expr {
        Expr::Input => scope.input().clone(),
        Expr::Iteration => Value::from(scope.iteration()),
        Expr::Step(name) => scope
            .step_output(name)
            .cloned()
            .ok_or_else(|| format!("step '{}' has no result yet", name))?,
        Expr::Literal(v) => v.clone(),
        Expr::Len(inner) => Value::from(length(&eval(inner, scope)?)),
        Expr::Not(inner) => Value::Bool(!truthy(&eval(inner, scope)?)),
        Expr::And(lhs, rhs) => {
            Value::Bool(truthy(&eval(lhs, scope)?) && truthy(&eval(rhs, scope)?))
        }
        Expr::Or(lhs, rhs) => Value::Bool(truthy(&eval(lhs, scope)?) || truthy(&eval(rhs, scope)?)),
        Expr::Compare {
            op,
            lhs,
            rhs,
            pattern,
        } => {
            let l = eval(lhs, scope)?;
            let r = eval(rhs, scope)?;
            Value::Bool(compare(*op, &l, &r, pattern.as_ref())?)
        }
    })
}

fn compare(op: CmpOp, l: &Value, r: &Value, pattern: Option<&Regex>) -> Result<bool, String> {
    let numeric = as_number(l).zip(as_number(r));
    Ok(match op {
        CmpOp::Eq => match numeric {
            Some((a, b)) => a == b,
            None => value_text(l) == value_text(r),
        },
        CmpOp::Ne => match numeric {
            Some((a, b)) => a != b,
            None => value_text(l) != value_text(r),
        },
        CmpOp::Lt | CmpOp::Le | CmpOp::Gt | CmpOp::Ge => {
            let ordering = match numeric {
                Some((a, b)) => a.partial_cmp(&b),
                None => Some(value_text(l).cmp(&value_text(r))),
            };
            let Some(ordering) = ordering else {
                return Ok(false);
            };
            match op {
                CmpOp::Lt => ordering.is_lt(),
                CmpOp::Le => ordering.is_le(),
                CmpOp::Gt => ordering.is_gt(),
                _ => ordering.is_ge(),
            }
        }
        CmpOp::Contains => match l {
            Value::Array(items) => items.iter().any(|item| value_text(item) == value_text(r)),
            Value::Object(map) => map.contains_key(value_text(r).as_ref()),
            _ => value_text(l).contains(value_text(r).as_ref()),
        },
        CmpOp::StartsWith => value_text(l).starts_with(value_text(r).as_ref()),
        CmpOp::EndsWith => value_text(l).ends_with(value_text(r).as_ref()),
        CmpOp::Matches => {
            let compiled;
            let re = match pattern {
                Some(re) => re,
                None => {
                    compiled = Regex::new(&value_text(r)).map_err(|e| e.to_string())?;
                    &compiled
                }
            };
            re.is_match(&value_text(l))
        }
    })
}

fn as_number(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

fn length(v: &Value) -> usize {
    match v {
        Value::Null => 0,
        Value::Array(items) => items.len(),
        Value::Object(map) => map.len(),
        Value::String(s) => s.chars().count(),
        other => value_text(other).chars().count(),
    }
}

/// Truthiness: false, null, "", 0 and "false" are false
pub fn truthy(v: &Value) -> bool {
    match v {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => {
            let t = s.trim();
            !t.is_empty() && !t.eq_ignore_ascii_case("false")
        }
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

// ═══════════════════════════════════════════════════════════════
// Tokenizer
// ═══════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Str(String),
    Num(f64),
    Op(&'static str),
    LParen,
    RParen,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Ident(s) => write!(f, "'{}'", s),
            Token::Str(s) => write!(f, "string {:?}", s),
            Token::Num(n) => write!(f, "number {}", n),
            Token::Op(op) => write!(f, "'{}'", op),
            Token::LParen => f.write_str("'('"),
            Token::RParen => f.write_str("')'"),
        }
    }
}

fn is_ident_char(c: char) -> bool {
    c.is_alphanumeric() || matches!(c, '_' | '.' | '-')
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
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '\'' | '"' => {
                let quote = c;
                let mut s = String::new();
                i += 1;
                loop {
                    match chars.get(i) {
                        None => return Err("unterminated string literal".to_string()),
                        Some('\\') => {
                            match chars.get(i + 1) {
                                Some('n') => s.push('\n'),
                                Some('t') => s.push('\t'),
                                Some(&other) => s.push(other),
                                None => return Err("dangling escape".to_string()),
                            }
                            i += 2;
                        }
                        Some(&ch) if ch == quote => {
                            i += 1;
                            break;
                        }
                        Some(&ch) => {
                            s.push(ch);
                            i += 1;
                        }
                    }
                }
                tokens.push(Token::Str(s));
            }
            '=' | '!' | '<' | '>' | '&' | '|' => {
                let next = chars.get(i + 1).copied();
                let (op, width) = match (c, next) {
                    ('=', Some('=')) => ("==", 2),
                    ('!', Some('=')) => ("!=", 2),
                    ('<', Some('=')) => ("<=", 2),
                    ('>', Some('=')) => (">=", 2),
                    ('&', Some('&')) => ("and", 2),
                    ('|', Some('|')) => ("or", 2),
                    ('<', _) => ("<", 1),
                    ('>', _) => (">", 1),
                    ('!', _) => ("not", 1),
                    _ => return Err(format!("unexpected character '{}' at {}", c, i)),
                };
                tokens.push(Token::Op(op));
                i += width;
            }
            c if c.is_ascii_digit()
                || (c == '-' && chars.get(i + 1).is_some_and(|n| n.is_ascii_digit())) =>
            {
                let start = i;
                i += 1;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let n = text
                    .parse::<f64>()
                    .map_err(|_| format!("invalid number '{}'", text))?;
                tokens.push(Token::Num(n));
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && is_ident_char(chars[i]) {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                tokens.push(match word.as_str() {
                    "and" => Token::Op("and"),
                    "or" => Token::Op("or"),
                    "not" => Token::Op("not"),
                    "contains" => Token::Op("contains"),
                    "starts_with" => Token::Op("starts_with"),
                    "ends_with" => Token::Op("ends_with"),
                    "matches" => Token::Op("matches"),
                    _ => Token::Ident(word),
                });
            }
            other => return Err(format!("unexpected character '{}' at {}", other, i)),
        }
    }

    Ok(tokens)
}

// ═══════════════════════════════════════════════════════════════
// Parser (recursive descent)
// ═══════════════════════════════════════════════════════════════

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let tok = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        tok
    }

    fn eat_op(&mut self, op: &str) -> bool {
        if matches!(self.peek(), Some(Token::Op(o)) if *o == op) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn parse_or(&mut self) -> Result<Expr, String> {
        let mut lhs = self.parse_and()?;
        while self.eat_op("or") {
            let rhs = self.parse_and()?;
            lhs = Expr::Or(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_and(&mut self) -> Result<Expr, String> {
        let mut lhs = self.parse_not()?;
        while self.eat_op("and") {
            let rhs = self.parse_not()?;
            lhs = Expr::And(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_not(&mut self) -> Result<Expr, String> {
        if self.eat_op("not") {
            return Ok(Expr::Not(Box::new(self.parse_not()?)));
        }
        self.parse_cmp()
    }

    fn parse_cmp(&mut self) -> Result<Expr, String> {
        let lhs = self.parse_primary()?;
        let op = match self.peek() {
            Some(Token::Op(o)) => match *o {
                "==" => CmpOp::Eq,
                "!=" => CmpOp::Ne,
                "<" => CmpOp::Lt,
                "<=" => CmpOp::Le,
                ">" => CmpOp::Gt,
                ">=" => CmpOp::Ge,
                "contains" => CmpOp::Contains,
                "starts_with" => CmpOp::StartsWith,
                "ends_with" => CmpOp::EndsWith,
                "matches" => CmpOp::Matches,
                _ => return Ok(lhs),
            },
            _ => return Ok(lhs),
        };
        self.pos += 1;
        let rhs = self.parse_primary()?;

        let pattern = match (op, &rhs) {
            (CmpOp::Matches, Expr::Literal(v)) => Some(
                Regex::new(&value_text(v))
                    .map_err(|e| format!("invalid regex for '{}': {}", op.symbol(), e))?,
            ),
            _ => None,
        };

        Ok(Expr::Compare {
            op,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
            pattern,
        })
    }

    fn parse_primary(&mut self) -> Result<Expr, String> {
        match self.next() {
            Some(Token::LParen) => {
                let inner = self.parse_or()?;
                match self.next() {
                    Some(Token::RParen) => Ok(inner),
                    _ => Err("expected ')'".to_string()),
                }
            }
            Some(Token::Str(s)) => Ok(Expr::Literal(Value::String(s))),
            Some(Token::Num(n)) => Ok(Expr::Literal(
                serde_json::Number::from_f64(n)
                    .map(Value::Number)
                    .unwrap_or(Value::Null),
            )),
            Some(Token::Ident(word)) => self.parse_ident(word),
            Some(tok) => Err(format!("unexpected {}", tok)),
            None => Err("unexpected end of expression".to_string()),
        }
    }

    fn parse_ident(&mut self, word: String) -> Result<Expr, String> {
        match word.as_str() {
            "input" => Ok(Expr::Input),
            "iteration" => Ok(Expr::Iteration),
            "true" => Ok(Expr::Literal(Value::Bool(true))),
            "false" => Ok(Expr::Literal(Value::Bool(false))),
            "null" => Ok(Expr::Literal(Value::Null)),
            "len" => {
                if self.next() != Some(Token::LParen) {
                    return Err("expected '(' after len".to_string());
                }
                let inner = self.parse_or()?;
                if self.next() != Some(Token::RParen) {
                    return Err("expected ')' closing len".to_string());
                }
                Ok(Expr::Len(Box::new(inner)))
            }
            _ => match word.strip_prefix("steps.") {
                Some(name) if !name.is_empty() => Ok(Expr::Step(name.to_string())),
                _ => Err(format!(
                    "unknown identifier '{}' (use input, iteration or steps.NAME)",
                    word
                )),
            },
        }
    }
}

/// Render a predicate's source for diagrams (quotes are awkward in Mermaid labels)
pub fn diagram_label(p: &Predicate) -> Cow<'_, str> {
    if p.source().contains('"') {
        Cow::Owned(p.source().replace('"', "'"))
    } else {
        Cow::Borrowed(p.source())
    }
}
