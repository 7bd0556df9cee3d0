//! Condition evaluator for transition guards.
//!
//! A deliberately small language: `or` / `and` / `not` over comparisons
//! (`== != < <= > >=`), parenthesised grouping, dotted field access into the
//! evaluation scope, and string / number / bool / null literals. `&&`, `||`
//! and `!` are accepted as aliases.
//!
//! Field access on a missing key yields [`EvalValue::Undefined`], which is
//! falsy but never equal to `null`. Boolean operators return the deciding
//! operand rather than a coerced bool; callers that need a decision use
//! [`ConditionEvaluator::evaluate_bool`].

use std::cmp::Ordering;
use std::iter::Peekable;
use std::str::CharIndices;

use serde_json::{Number, Value};

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors raised while parsing or evaluating a condition.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ExpressionError {
    #[error("empty expression")]
    Empty,

    #[error("unexpected token '{token}' at position {position}")]
    UnexpectedToken { token: String, position: usize },

    #[error("unexpected end of expression")]
    UnexpectedEof,

    #[error("unmatched parenthesis at position {0}")]
    UnmatchedParen(usize),

    #[error("unterminated string literal starting at position {0}")]
    UnterminatedString(usize),

    #[error("invalid character '{ch}' at position {position}")]
    InvalidCharacter { ch: char, position: usize },

    #[error("invalid number: {0}")]
    InvalidNumber(String),

    #[error("evaluation scope must be a JSON object")]
    InvalidScope,
}

// ---------------------------------------------------------------------------
// Values
// ---------------------------------------------------------------------------

/// Result of evaluating an expression.
#[derive(Debug, Clone, PartialEq)]
pub enum EvalValue {
    /// A path that did not resolve. Distinct from JSON `null`.
    Undefined,
    Json(Value),
}

impl EvalValue {
    /// JavaScript-style truthiness.
    pub fn is_truthy(&self) -> bool {
        match self {
            EvalValue::Undefined => false,
            EvalValue::Json(value) => json_truthy(value),
        }
    }

    pub fn is_undefined(&self) -> bool {
        matches!(self, EvalValue::Undefined)
    }

    /// Convert to JSON, mapping `Undefined` to `None`.
    pub fn into_json(self) -> Option<Value> {
        match self {
            EvalValue::Undefined => None,
            EvalValue::Json(value) => Some(value),
        }
    }
}

/// JavaScript-style truthiness for a JSON value.
pub fn json_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0 && !f.is_nan()),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

// ---------------------------------------------------------------------------
// Tokenizer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CmpOp {
    fn symbol(self) -> &'static str {
        match self {
            CmpOp::Eq => "==",
            CmpOp::Ne => "!=",
            CmpOp::Lt => "<",
            CmpOp::Le => "<=",
            CmpOp::Gt => ">",
            CmpOp::Ge => ">=",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum TokenKind {
    Path(Vec<String>),
    Str(String),
    Number(Number),
    Bool(bool),
    Null,
    Cmp(CmpOp),
    And,
    Or,
    Not,
    LParen,
    RParen,
}

impl TokenKind {
    fn describe(&self) -> String {
        match self {
            TokenKind::Path(segments) => segments.join("."),
            TokenKind::Str(s) => format!("{s:?}"),
            TokenKind::Number(n) => n.to_string(),
            TokenKind::Bool(b) => b.to_string(),
            TokenKind::Null => "null".to_string(),
            TokenKind::Cmp(op) => op.symbol().to_string(),
            TokenKind::And => "and".to_string(),
            TokenKind::Or => "or".to_string(),
            TokenKind::Not => "not".to_string(),
            TokenKind::LParen => "(".to_string(),
            TokenKind::RParen => ")".to_string(),
        }
    }

    /// Whether this token ends an operand (so a following `-` is not a sign).
    fn ends_operand(&self) -> bool {
        matches!(
            self,
            TokenKind::Path(_)
                | TokenKind::Str(_)
                | TokenKind::Number(_)
                | TokenKind::Bool(_)
                | TokenKind::Null
                | TokenKind::RParen
        )
    }
}

#[derive(Debug, Clone)]
struct Token {
    kind: TokenKind,
    position: usize,
}

fn tokenize(input: &str) -> Result<Vec<Token>, ExpressionError> {
    let mut tokens: Vec<Token> = Vec::new();
    let mut chars = input.char_indices().peekable();

    while let Some(&(position, ch)) = chars.peek() {
        if ch.is_whitespace() {
            chars.next();
            continue;
        }

        let kind = match ch {
            '\'' | '"' => read_string(&mut chars, position)?,
            '(' => {
                chars.next();
                TokenKind::LParen
            }
            ')' => {
                chars.next();
                TokenKind::RParen
            }
            '=' | '!' | '<' | '>' => read_operator(&mut chars, position)?,
            '&' | '|' => {
                chars.next();
                match chars.next() {
                    Some((_, next)) if next == ch => {
                        if ch == '&' {
                            TokenKind::And
                        } else {
                            TokenKind::Or
                        }
                    }
                    _ => return Err(ExpressionError::InvalidCharacter { ch, position }),
                }
            }
            '-' => {
                let sign_allowed = tokens.last().is_none_or(|t| !t.kind.ends_operand());
                if !sign_allowed {
                    return Err(ExpressionError::InvalidCharacter { ch, position });
                }
                read_number(&mut chars)?
            }
            c if c.is_ascii_digit() => read_number(&mut chars)?,
            c if is_ident_start(c) => read_word(&mut chars, position)?,
            _ => return Err(ExpressionError::InvalidCharacter { ch, position }),
        };

        tokens.push(Token { kind, position });
    }

    Ok(tokens)
}

fn is_ident_start(ch: char) -> bool {
    ch.is_ascii_alphabetic() || ch == '_' || ch == '$'
}

fn is_ident_char(ch: char) -> bool {
    ch.is_ascii_alphanumeric() || ch == '_' || ch == '$'
}

fn read_string(
    chars: &mut Peekable<CharIndices<'_>>,
    start: usize,
) -> Result<TokenKind, ExpressionError> {
    let Some((_, quote)) = chars.next() else {
        return Err(ExpressionError::UnexpectedEof);
    };
    let mut value = String::new();
    while let Some((_, c)) = chars.next() {
        if c == quote {
            return Ok(TokenKind::Str(value));
        }
        if c == '\\' {
            match chars.next() {
                Some((_, 'n')) => value.push('\n'),
                Some((_, 't')) => value.push('\t'),
                Some((_, escaped)) => value.push(escaped),
                None => break,
            }
            continue;
        }
        value.push(c);
    }
    Err(ExpressionError::UnterminatedString(start))
}

fn read_operator(
    chars: &mut Peekable<CharIndices<'_>>,
    position: usize,
) -> Result<TokenKind, ExpressionError> {
    let Some((_, first)) = chars.next() else {
        return Err(ExpressionError::UnexpectedEof);
    };
    let followed_by_eq = matches!(chars.peek(), Some(&(_, '=')));
    if followed_by_eq {
        chars.next();
    }
    let kind = match (first, followed_by_eq) {
        ('=', true) => TokenKind::Cmp(CmpOp::Eq),
        ('!', true) => TokenKind::Cmp(CmpOp::Ne),
        ('!', false) => TokenKind::Not,
        ('<', true) => TokenKind::Cmp(CmpOp::Le),
        ('<', false) => TokenKind::Cmp(CmpOp::Lt),
        ('>', true) => TokenKind::Cmp(CmpOp::Ge),
        ('>', false) => TokenKind::Cmp(CmpOp::Gt),
        _ => return Err(ExpressionError::InvalidCharacter { ch: first, position }),
    };
    Ok(kind)
}

fn read_number(chars: &mut Peekable<CharIndices<'_>>) -> Result<TokenKind, ExpressionError> {
    let mut text = String::new();
    if let Some(&(_, '-')) = chars.peek() {
        text.push('-');
        chars.next();
    }
    while let Some(&(_, c)) = chars.peek() {
        if c.is_ascii_digit() || c == '.' {
            text.push(c);
            chars.next();
        } else {
            break;
        }
    }

    if !text.contains('.') {
        if let Ok(i) = text.parse::<i64>() {
            return Ok(TokenKind::Number(Number::from(i)));
        }
    }
    text.parse::<f64>()
        .ok()
        .and_then(Number::from_f64)
        .map(TokenKind::Number)
        .ok_or(ExpressionError::InvalidNumber(text))
}

fn read_word(
    chars: &mut Peekable<CharIndices<'_>>,
    position: usize,
) -> Result<TokenKind, ExpressionError> {
    let mut segments = Vec::new();
    let mut current = String::new();

    while let Some(&(pos, c)) = chars.peek() {
        if is_ident_char(c) {
            current.push(c);
            chars.next();
        } else if c == '.' {
            if current.is_empty() {
                return Err(ExpressionError::InvalidCharacter { ch: c, position: pos });
            }
            segments.push(std::mem::take(&mut current));
            chars.next();
        } else {
            break;
        }
    }
    if current.is_empty() {
        return Err(ExpressionError::UnexpectedToken {
            token: format!("{}.", segments.join(".")),
            position,
        });
    }
    segments.push(current);

    if segments.len() == 1 {
        let keyword = match segments[0].as_str() {
            "and" => Some(TokenKind::And),
            "or" => Some(TokenKind::Or),
            "not" => Some(TokenKind::Not),
            "true" => Some(TokenKind::Bool(true)),
            "false" => Some(TokenKind::Bool(false)),
            "null" => Some(TokenKind::Null),
            _ => None,
        };
        if let Some(kind) = keyword {
            return Ok(kind);
        }
    }

    Ok(TokenKind::Path(segments))
}

// ---------------------------------------------------------------------------
// Parser
// ---------------------------------------------------------------------------

/// A parsed condition, ready for repeated evaluation.
#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    source: String,
    root: Expr,
}

impl Condition {
    pub fn source(&self) -> &str {
        &self.source
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Literal(Value),
    Path(Vec<String>),
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Compare(CmpOp, Box<Expr>, Box<Expr>),
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&TokenKind> {
        self.tokens.get(self.pos).map(|t| &t.kind)
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn parse_or(&mut self) -> Result<Expr, ExpressionError> {
        let mut left = self.parse_and()?;
        while matches!(self.peek(), Some(TokenKind::Or)) {
            self.pos += 1;
            let right = self.parse_and()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, ExpressionError> {
        let mut left = self.parse_not()?;
        while matches!(self.peek(), Some(TokenKind::And)) {
            self.pos += 1;
            let right = self.parse_not()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_not(&mut self) -> Result<Expr, ExpressionError> {
        if matches!(self.peek(), Some(TokenKind::Not)) {
            self.pos += 1;
            let inner = self.parse_not()?;
            return Ok(Expr::Not(Box::new(inner)));
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> Result<Expr, ExpressionError> {
        let left = self.parse_primary()?;
        if let Some(TokenKind::Cmp(op)) = self.peek() {
            let op = *op;
            self.pos += 1;
            let right = self.parse_primary()?;
            return Ok(Expr::Compare(op, Box::new(left), Box::new(right)));
        }
        Ok(left)
    }

    fn parse_primary(&mut self) -> Result<Expr, ExpressionError> {
        let token = self.advance().ok_or(ExpressionError::UnexpectedEof)?;
        match token.kind {
            TokenKind::LParen => {
                let inner = self.parse_or()?;
                match self.advance() {
                    Some(Token {
                        kind: TokenKind::RParen,
                        ..
                    }) => Ok(inner),
                    Some(other) => Err(ExpressionError::UnexpectedToken {
                        token: other.kind.describe(),
                        position: other.position,
                    }),
                    None => Err(ExpressionError::UnmatchedParen(token.position)),
                }
            }
            TokenKind::Path(segments) => Ok(Expr::Path(segments)),
            TokenKind::Str(s) => Ok(Expr::Literal(Value::String(s))),
            TokenKind::Number(n) => Ok(Expr::Literal(Value::Number(n))),
            TokenKind::Bool(b) => Ok(Expr::Literal(Value::Bool(b))),
            TokenKind::Null => Ok(Expr::Literal(Value::Null)),
            TokenKind::RParen => Err(ExpressionError::UnmatchedParen(token.position)),
            other => Err(ExpressionError::UnexpectedToken {
                token: other.describe(),
                position: token.position,
            }),
        }
    }
}

/// Parse a condition expression.
pub fn parse_condition(expression: &str) -> Result<Condition, ExpressionError> {
    if expression.trim().is_empty() {
        return Err(ExpressionError::Empty);
    }

    let tokens = tokenize(expression)?;
    let mut parser = Parser { tokens, pos: 0 };
    let root = parser.parse_or()?;

    if let Some(token) = parser.advance() {
        return Err(match token.kind {
            TokenKind::RParen => ExpressionError::UnmatchedParen(token.position),
            other => ExpressionError::UnexpectedToken {
                token: other.describe(),
                position: token.position,
            },
        });
    }

    Ok(Condition {
        source: expression.to_string(),
        root,
    })
}

// ---------------------------------------------------------------------------
// Evaluation
// ---------------------------------------------------------------------------

fn eval(expr: &Expr, scope: &Value) -> EvalValue {
    match expr {
        Expr::Literal(value) => EvalValue::Json(value.clone()),
        Expr::Path(segments) => resolve_path(scope, segments),
        Expr::Not(inner) => EvalValue::Json(Value::Bool(!eval(inner, scope).is_truthy())),
        Expr::And(left, right) => {
            let lhs = eval(left, scope);
            if lhs.is_truthy() { eval(right, scope) } else { lhs }
        }
        Expr::Or(left, right) => {
            let lhs = eval(left, scope);
            if lhs.is_truthy() { lhs } else { eval(right, scope) }
        }
        Expr::Compare(op, left, right) => {
            let lhs = eval(left, scope);
            let rhs = eval(right, scope);
            EvalValue::Json(Value::Bool(compare(*op, &lhs, &rhs)))
        }
    }
}

fn resolve_path(scope: &Value, segments: &[String]) -> EvalValue {
    let mut current = scope;
    for segment in segments {
        let next = match current {
            Value::Object(map) => map.get(segment),
            Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        };
        match next {
            Some(value) => current = value,
            None => return EvalValue::Undefined,
        }
    }
    EvalValue::Json(current.clone())
}

fn compare(op: CmpOp, lhs: &EvalValue, rhs: &EvalValue) -> bool {
    match op {
        CmpOp::Eq => strict_equals(lhs, rhs),
        CmpOp::Ne => !strict_equals(lhs, rhs),
        CmpOp::Lt => ordering(lhs, rhs) == Some(Ordering::Less),
        CmpOp::Le => matches!(ordering(lhs, rhs), Some(Ordering::Less | Ordering::Equal)),
        CmpOp::Gt => ordering(lhs, rhs) == Some(Ordering::Greater),
        CmpOp::Ge => matches!(ordering(lhs, rhs), Some(Ordering::Greater | Ordering::Equal)),
    }
}

fn strict_equals(lhs: &EvalValue, rhs: &EvalValue) -> bool {
    match (lhs, rhs) {
        (EvalValue::Undefined, EvalValue::Undefined) => true,
        (EvalValue::Json(Value::Number(a)), EvalValue::Json(Value::Number(b))) => {
            a.as_f64() == b.as_f64()
        }
        (EvalValue::Json(a), EvalValue::Json(b)) => a == b,
        _ => false,
    }
}

fn ordering(lhs: &EvalValue, rhs: &EvalValue) -> Option<Ordering> {
    match (lhs, rhs) {
        (EvalValue::Json(Value::Number(a)), EvalValue::Json(Value::Number(b))) => {
            a.as_f64()?.partial_cmp(&b.as_f64()?)
        }
        (EvalValue::Json(Value::String(a)), EvalValue::Json(Value::String(b))) => Some(a.cmp(b)),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// ConditionEvaluator
// ---------------------------------------------------------------------------

/// Evaluates transition guards against a `{ context, input, output }` scope.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConditionEvaluator;

impl ConditionEvaluator {
    pub fn new() -> Self {
        Self
    }

    /// Parse and evaluate an expression, returning the raw value.
    pub fn evaluate(&self, expression: &str, scope: &Value) -> Result<EvalValue, ExpressionError> {
        let condition = parse_condition(expression)?;
        self.evaluate_parsed(&condition, scope)
    }

    /// Evaluate an already-parsed condition.
    pub fn evaluate_parsed(
        &self,
        condition: &Condition,
        scope: &Value,
    ) -> Result<EvalValue, ExpressionError> {
        if !scope.is_object() {
            return Err(ExpressionError::InvalidScope);
        }
        Ok(eval(&condition.root, scope))
    }

    /// Evaluate an expression and coerce the result with JS truthiness.
    pub fn evaluate_bool(&self, expression: &str, scope: &Value) -> Result<bool, ExpressionError> {
        self.evaluate(expression, scope).map(|v| v.is_truthy())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
