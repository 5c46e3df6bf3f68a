//! SQL-92 style message selectors.
//!
//! ```text
//! or      := and ( OR and )*
//! and     := not ( AND not )*
//! not     := NOT not | predicate
//! predicate := sum [ cmp sum
//!                  | IS [NOT] NULL
//!                  | [NOT] IN ( literal, ... )
//!                  | [NOT] LIKE 'pattern' [ESCAPE 'c']
//!                  | [NOT] BETWEEN sum AND sum ]
//! sum     := product ( (+|-) product )*
//! product := unary ( (*|/) unary )*
//! unary   := - unary | primary
//! primary := literal | identifier | ( or )
//! ```
//!
//! Evaluation uses three-valued logic: a missing property is NULL, any
//! comparison against NULL is UNKNOWN, and only TRUE selects a message.

use std::cmp::Ordering;
use std::fmt;

use crate::message::{Message, PropertyValue};
use crate::{Error, Result};

pub const HDR_PRIORITY: &str = "MsgPriority";
pub const HDR_ID: &str = "MsgID";
pub const HDR_TIMESTAMP: &str = "MsgTimestamp";
pub const HDR_DURABLE: &str = "MsgDurable";
pub const HDR_EXPIRATION: &str = "MsgExpiration";

#[derive(Debug, Clone, PartialEq)]
enum Value {
    Null,
    Bool(bool),
    Long(i64),
    Double(f64),
    Str(String),
}

impl Value {
    fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Long(v) => Some(*v as f64),
            Value::Double(v) => Some(*v),
            _ => None,
        }
    }

    fn truth(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    fn from_truth(value: Option<bool>) -> Value {
        value.map(Value::Bool).unwrap_or(Value::Null)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
}

#[derive(Debug, Clone)]
enum Expr {
    Literal(Value),
    Ident(String),
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Compare(CmpOp, Box<Expr>, Box<Expr>),
    Arith(ArithOp, Box<Expr>, Box<Expr>),
    Neg(Box<Expr>),
    IsNull(Box<Expr>, bool),
    In(Box<Expr>, Vec<Value>, bool),
    Like(Box<Expr>, Vec<LikeToken>, bool),
    Between(Box<Expr>, Box<Expr>, Box<Expr>, bool),
}

#[derive(Debug, Clone, PartialEq)]
enum LikeToken {
    Char(char),
    AnyOne,
    AnyMany,
}

/// A compiled selector.
#[derive(Clone)]
pub struct Filter {
    expression: String,
    root: Expr,
}

impl fmt::Debug for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Filter").field(&self.expression).finish()
    }
}

impl PartialEq for Filter {
    fn eq(&self, other: &Self) -> bool {
        self.expression == other.expression
    }
}

impl Filter {
    /// Compile `expression`.
    ///
    /// # Errors
    ///
    /// - `Error::InvalidFilter`: the expression does not parse
    pub fn parse(expression: &str) -> Result<Self> {
        let invalid = |reason: String| Error::InvalidFilter {
            expression: expression.to_string(),
            reason,
        };
        let tokens = lex(expression).map_err(invalid)?;
        let mut parser = Parser { tokens, pos: 0 };
        let root = parser.parse_or().map_err(invalid)?;
        if parser.pos != parser.tokens.len() {
            return Err(invalid(format!(
                "unexpected token {:?}",
                parser.tokens[parser.pos]
            )));
        }
        Ok(Self {
            expression: expression.to_string(),
            root,
        })
    }

    /// `None` and blank expressions mean "match everything".
    pub fn parse_optional(expression: Option<&str>) -> Result<Option<Self>> {
        match expression.map(str::trim) {
            None | Some("") => Ok(None),
            Some(expr) => Self::parse(expr).map(Some),
        }
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }

    pub fn matches(&self, message: &Message) -> bool {
        eval(&self.root, message) == Value::Bool(true)
    }
}

fn resolve(name: &str, message: &Message) -> Value {
    match name {
        HDR_PRIORITY => Value::Long(i64::from(message.get_priority())),
        HDR_ID => Value::Long(message.id() as i64),
        HDR_TIMESTAMP => Value::Long(message.get_timestamp() as i64),
        HDR_EXPIRATION => Value::Long(message.get_expiration() as i64),
        HDR_DURABLE => Value::Str(
            if message.is_durable() {
                "DURABLE"
            } else {
                "NON_DURABLE"
            }
            .to_string(),
        ),
        _ => match message.properties().get(name) {
            Some(PropertyValue::Bool(v)) => Value::Bool(*v),
            Some(PropertyValue::Float(v)) => Value::Double(f64::from(*v)),
            Some(PropertyValue::Double(v)) => Value::Double(*v),
            Some(PropertyValue::String(v)) => Value::Str(v.clone()),
            Some(other) => other.as_i64().map(Value::Long).unwrap_or(Value::Null),
            None => Value::Null,
        },
    }
}

fn eval(expr: &Expr, message: &Message) -> Value {
    match expr {
        Expr::Literal(v) => v.clone(),
        Expr::Ident(name) => resolve(name, message),
        Expr::Not(inner) => Value::from_truth(eval(inner, message).truth().map(|b| !b)),
        Expr::And(a, b) => {
            let left = eval(a, message).truth();
            if left == Some(false) {
                return Value::Bool(false);
            }
            let right = eval(b, message).truth();
            match (left, right) {
                (_, Some(false)) => Value::Bool(false),
                (Some(true), Some(true)) => Value::Bool(true),
                _ => Value::Null,
            }
        }
        Expr::Or(a, b) => {
            let left = eval(a, message).truth();
            if left == Some(true) {
                return Value::Bool(true);
            }
            let right = eval(b, message).truth();
            match (left, right) {
                (_, Some(true)) => Value::Bool(true),
                (Some(false), Some(false)) => Value::Bool(false),
                _ => Value::Null,
            }
        }
        Expr::Compare(op, a, b) => {
            Value::from_truth(compare(*op, &eval(a, message), &eval(b, message)))
        }
        Expr::Arith(op, a, b) => arith(*op, &eval(a, message), &eval(b, message)),
        Expr::Neg(inner) => match eval(inner, message) {
            Value::Long(v) => Value::Long(-v),
            Value::Double(v) => Value::Double(-v),
            _ => Value::Null,
        },
        Expr::IsNull(inner, negated) => {
            let is_null = eval(inner, message) == Value::Null;
            Value::Bool(is_null != *negated)
        }
        Expr::In(inner, list, negated) => {
            let value = eval(inner, message);
            if value == Value::Null {
                return Value::Null;
            }
            let found = list
                .iter()
                .any(|item| compare(CmpOp::Eq, &value, item) == Some(true));
            Value::Bool(found != *negated)
        }
        Expr::Like(inner, pattern, negated) => match eval(inner, message) {
            Value::Str(s) => {
                let chars: Vec<char> = s.chars().collect();
                Value::Bool(like_match(&chars, pattern) != *negated)
            }
            _ => Value::Null,
        },
        Expr::Between(inner, low, high, negated) => {
            let value = eval(inner, message);
            let ge = compare(CmpOp::Ge, &value, &eval(low, message));
            let le = compare(CmpOp::Le, &value, &eval(high, message));
            match (ge, le) {
                (Some(a), Some(b)) => Value::Bool((a && b) != *negated),
                _ => Value::Null,
            }
        }
    }
}

fn compare(op: CmpOp, a: &Value, b: &Value) -> Option<bool> {
    let ordering = match (a, b) {
        (Value::Null, _) | (_, Value::Null) => return None,
        (Value::Long(x), Value::Long(y)) => x.cmp(y),
        (Value::Str(x), Value::Str(y)) => {
            return match op {
                CmpOp::Eq => Some(x == y),
                CmpOp::Ne => Some(x != y),
                _ => None,
            }
        }
        (Value::Bool(x), Value::Bool(y)) => {
            return match op {
                CmpOp::Eq => Some(x == y),
                CmpOp::Ne => Some(x != y),
                _ => None,
            }
        }
        _ => match (a.as_f64(), b.as_f64()) {
            (Some(x), Some(y)) => x.partial_cmp(&y)?,
            _ => return None,
        },
    };
    Some(match op {
        CmpOp::Eq => ordering == Ordering::Equal,
        CmpOp::Ne => ordering != Ordering::Equal,
        CmpOp::Lt => ordering == Ordering::Less,
        CmpOp::Le => ordering != Ordering::Greater,
        CmpOp::Gt => ordering == Ordering::Greater,
        CmpOp::Ge => ordering != Ordering::Less,
    })
}

fn arith(op: ArithOp, a: &Value, b: &Value) -> Value {
    if let (Value::Long(x), Value::Long(y)) = (a, b) {
        return match op {
            ArithOp::Add => x.checked_add(*y).map(Value::Long),
            ArithOp::Sub => x.checked_sub(*y).map(Value::Long),
            ArithOp::Mul => x.checked_mul(*y).map(Value::Long),
            ArithOp::Div => x.checked_div(*y).map(Value::Long),
        }
        .unwrap_or(Value::Null);
    }
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => Value::Double(match op {
            ArithOp::Add => x + y,
            ArithOp::Sub => x - y,
            ArithOp::Mul => x * y,
            ArithOp::Div => x / y,
        }),
        _ => Value::Null,
    }
}

fn like_match(text: &[char], pattern: &[LikeToken]) -> bool {
    // dp[j]: pattern[..i] matches text[..j]
    let mut dp = vec![false; text.len() + 1];
    dp[0] = true;
    for token in pattern {
        let mut next = vec![false; text.len() + 1];
        match token {
            LikeToken::AnyMany => {
                let mut seen = false;
                for j in 0..=text.len() {
                    seen |= dp[j];
                    next[j] = seen;
                }
            }
            LikeToken::AnyOne => {
                for j in 1..=text.len() {
                    next[j] = dp[j - 1];
                }
            }
            LikeToken::Char(c) => {
                for j in 1..=text.len() {
                    next[j] = dp[j - 1] && text[j - 1] == *c;
                }
            }
        }
        dp = next;
    }
    dp[text.len()]
}

fn compile_like(pattern: &str, escape: Option<char>) -> std::result::Result<Vec<LikeToken>, String> {
    let mut tokens = Vec::new();
    let mut chars = pattern.chars();
    while let Some(c) = chars.next() {
        if Some(c) == escape {
            match chars.next() {
                Some(escaped) => tokens.push(LikeToken::Char(escaped)),
                None => return Err("LIKE pattern ends with escape character".into()),
            }
        } else if c == '%' {
            tokens.push(LikeToken::AnyMany);
        } else if c == '_' {
            tokens.push(LikeToken::AnyOne);
        } else {
            tokens.push(LikeToken::Char(c));
        }
    }
    Ok(tokens)
}

// ============================================================================
// Lexer
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Str(String),
    Long(i64),
    Double(f64),
    Op(&'static str),
    LParen,
    RParen,
    Comma,
    Keyword(Keyword),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Keyword {
    And,
    Or,
    Not,
    Is,
    Null,
    In,
    Like,
    Escape,
    Between,
    True,
    False,
}

fn keyword(word: &str) -> Option<Keyword> {
    Some(match word.to_ascii_uppercase().as_str() {
        "AND" => Keyword::And,
        "OR" => Keyword::Or,
        "NOT" => Keyword::Not,
        "IS" => Keyword::Is,
        "NULL" => Keyword::Null,
        "IN" => Keyword::In,
        "LIKE" => Keyword::Like,
        "ESCAPE" => Keyword::Escape,
        "BETWEEN" => Keyword::Between,
        "TRUE" => Keyword::True,
        "FALSE" => Keyword::False,
        _ => return None,
    })
}

fn lex(input: &str) -> std::result::Result<Vec<Token>, String> {
    let chars: Vec<char> = input.chars().collect();
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
            ',' => {
                tokens.push(Token::Comma);
                i += 1;
            }
            '=' | '+' | '-' | '*' | '/' => {
                tokens.push(Token::Op(match c {
                    '=' => "=",
                    '+' => "+",
                    '-' => "-",
                    '*' => "*",
                    _ => "/",
                }));
                i += 1;
            }
            '<' => {
                match chars.get(i + 1) {
                    Some('=') => {
                        tokens.push(Token::Op("<="));
                        i += 2;
                    }
                    Some('>') => {
                        tokens.push(Token::Op("<>"));
                        i += 2;
                    }
                    _ => {
                        tokens.push(Token::Op("<"));
                        i += 1;
                    }
                }
            }
            '>' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Op(">="));
                    i += 2;
                } else {
                    tokens.push(Token::Op(">"));
                    i += 1;
                }
            }
            '\'' => {
                let mut value = String::new();
                i += 1;
                loop {
                    match chars.get(i) {
                        None => return Err("unterminated string literal".into()),
                        Some('\'') if chars.get(i + 1) == Some(&'\'') => {
                            value.push('\'');
                            i += 2;
                        }
                        Some('\'') => {
                            i += 1;
                            break;
                        }
                        Some(ch) => {
                            value.push(*ch);
                            i += 1;
                        }
                    }
                }
                tokens.push(Token::Str(value));
            }
            c if c.is_ascii_digit() || (c == '.' && chars.get(i + 1).is_some_and(char::is_ascii_digit)) => {
                let start = i;
                let mut is_float = false;
                while i < chars.len() {
                    let ch = chars[i];
                    if ch.is_ascii_digit() {
                        i += 1;
                    } else if ch == '.' && !is_float {
                        is_float = true;
                        i += 1;
                    } else if (ch == 'e' || ch == 'E')
                        && chars
                            .get(i + 1)
                            .is_some_and(|n| n.is_ascii_digit() || *n == '-' || *n == '+')
                    {
                        is_float = true;
                        i += 2;
                    } else {
                        break;
                    }
                }
                let text: String = chars[start..i].iter().collect();
                if is_float {
                    let v = text
                        .parse::<f64>()
                        .map_err(|_| format!("bad number {text}"))?;
                    tokens.push(Token::Double(v));
                } else {
                    let v = text
                        .parse::<i64>()
                        .map_err(|_| format!("bad number {text}"))?;
                    tokens.push(Token::Long(v));
                }
            }
            c if c.is_alphabetic() || c == '_' || c == '$' => {
                let start = i;
                while i < chars.len()
                    && (chars[i].is_alphanumeric()
                        || chars[i] == '_'
                        || chars[i] == '$'
                        || chars[i] == '.')
                {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                match keyword(&word) {
                    Some(kw) => tokens.push(Token::Keyword(kw)),
                    None => tokens.push(Token::Ident(word)),
                }
            }
            other => return Err(format!("unexpected character '{other}'")),
        }
    }
    Ok(tokens)
}

// ============================================================================
// Parser
// ============================================================================

type ParseResult<T> = std::result::Result<T, String>;

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
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

    fn eat_keyword(&mut self, kw: Keyword) -> bool {
        if self.peek() == Some(&Token::Keyword(kw)) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect_keyword(&mut self, kw: Keyword) -> ParseResult<()> {
        if self.eat_keyword(kw) {
            Ok(())
        } else {
            Err(format!("expected {kw:?}"))
        }
    }

    fn parse_or(&mut self) -> ParseResult<Expr> {
        let mut left = self.parse_and()?;
        while self.eat_keyword(Keyword::Or) {
            let right = self.parse_and()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> ParseResult<Expr> {
        let mut left = self.parse_not()?;
        while self.eat_keyword(Keyword::And) {
            let right = self.parse_not()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_not(&mut self) -> ParseResult<Expr> {
        if self.eat_keyword(Keyword::Not) {
            return Ok(Expr::Not(Box::new(self.parse_not()?)));
        }
        self.parse_predicate()
    }

    fn parse_predicate(&mut self) -> ParseResult<Expr> {
        let left = self.parse_sum()?;
        if let Some(Token::Op(op)) = self.peek().cloned() {
            let cmp = match op {
                "=" => Some(CmpOp::Eq),
                "<>" => Some(CmpOp::Ne),
                "<" => Some(CmpOp::Lt),
                "<=" => Some(CmpOp::Le),
                ">" => Some(CmpOp::Gt),
                ">=" => Some(CmpOp::Ge),
                _ => None,
            };
            if let Some(cmp) = cmp {
                self.pos += 1;
                let right = self.parse_sum()?;
                return Ok(Expr::Compare(cmp, Box::new(left), Box::new(right)));
            }
        }
        if self.eat_keyword(Keyword::Is) {
            let negated = self.eat_keyword(Keyword::Not);
            self.expect_keyword(Keyword::Null)?;
            return Ok(Expr::IsNull(Box::new(left), negated));
        }
        let negated = self.eat_keyword(Keyword::Not);
        if self.eat_keyword(Keyword::In) {
            if self.next() != Some(Token::LParen) {
                return Err("expected ( after IN".into());
            }
            let mut list = Vec::new();
            loop {
                list.push(self.parse_literal()?);
                match self.next() {
                    Some(Token::Comma) => continue,
                    Some(Token::RParen) => break,
                    _ => return Err("expected , or ) in IN list".into()),
                }
            }
            return Ok(Expr::In(Box::new(left), list, negated));
        }
        if self.eat_keyword(Keyword::Like) {
            let pattern = match self.next() {
                Some(Token::Str(s)) => s,
                _ => return Err("expected string after LIKE".into()),
            };
            let escape = if self.eat_keyword(Keyword::Escape) {
                match self.next() {
                    Some(Token::Str(s)) if s.chars().count() == 1 => s.chars().next(),
                    _ => return Err("ESCAPE takes a single character".into()),
                }
            } else {
                None
            };
            let tokens = compile_like(&pattern, escape)?;
            return Ok(Expr::Like(Box::new(left), tokens, negated));
        }
        if self.eat_keyword(Keyword::Between) {
            let low = self.parse_sum()?;
            self.expect_keyword(Keyword::And)?;
            let high = self.parse_sum()?;
            return Ok(Expr::Between(
                Box::new(left),
                Box::new(low),
                Box::new(high),
                negated,
            ));
        }
        if negated {
            return Err("NOT must be followed by IN, LIKE or BETWEEN here".into());
        }
        Ok(left)
    }

    fn parse_sum(&mut self) -> ParseResult<Expr> {
        let mut left = self.parse_product()?;
        loop {
            let op = match self.peek() {
                Some(Token::Op("+")) => ArithOp::Add,
                Some(Token::Op("-")) => ArithOp::Sub,
                _ => return Ok(left),
            };
            self.pos += 1;
            let right = self.parse_product()?;
            left = Expr::Arith(op, Box::new(left), Box::new(right));
        }
    }

    fn parse_product(&mut self) -> ParseResult<Expr> {
        let mut left = self.parse_unary()?;
        loop {
            let op = match self.peek() {
                Some(Token::Op("*")) => ArithOp::Mul,
                Some(Token::Op("/")) => ArithOp::Div,
                _ => return Ok(left),
            };
            self.pos += 1;
            let right = self.parse_unary()?;
            left = Expr::Arith(op, Box::new(left), Box::new(right));
        }
    }

    fn parse_unary(&mut self) -> ParseResult<Expr> {
        if self.peek() == Some(&Token::Op("-")) {
            self.pos += 1;
            return Ok(Expr::Neg(Box::new(self.parse_unary()?)));
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> ParseResult<Expr> {
        match self.next() {
            Some(Token::LParen) => {
                let inner = self.parse_or()?;
                if self.next() != Some(Token::RParen) {
                    return Err("expected )".into());
                }
                Ok(inner)
            }
            Some(Token::Ident(name)) => Ok(Expr::Ident(name)),
            Some(_) => {
                self.pos -= 1;
                Ok(Expr::Literal(self.parse_literal()?))
            }
            None => Err("unexpected end of expression".into()),
        }
    }

    fn parse_literal(&mut self) -> ParseResult<Value> {
        match self.next() {
            Some(Token::Str(s)) => Ok(Value::Str(s)),
            Some(Token::Long(v)) => Ok(Value::Long(v)),
            Some(Token::Double(v)) => Ok(Value::Double(v)),
            Some(Token::Keyword(Keyword::True)) => Ok(Value::Bool(true)),
            Some(Token::Keyword(Keyword::False)) => Ok(Value::Bool(false)),
            Some(Token::Keyword(Keyword::Null)) => Ok(Value::Null),
            Some(Token::Op("-")) => match self.next() {
                Some(Token::Long(v)) => Ok(Value::Long(-v)),
                Some(Token::Double(v)) => Ok(Value::Double(-v)),
                _ => Err("expected number after -".into()),
            },
            other => Err(format!("expected literal, found {other:?}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg() -> Message {
        let mut m = Message::new("orders", b"x".to_vec())
            .priority(6)
            .durable(true)
            .property("color", "red")
            .property("qty", 10i32)
            .property("price", 2.5f64)
            .property("vip", true);
        m.set_id(42);
        m
    }

    fn check(expr: &str) -> bool {
        Filter::parse(expr).unwrap().matches(&msg())
    }

    #[test]
    fn comparisons_and_logic() {
        assert!(check("color = 'red'"));
        assert!(!check("color <> 'red'"));
        assert!(check("qty > 5 AND price < 3"));
        assert!(check("qty > 50 OR vip = TRUE"));
        assert!(check("NOT (qty < 5)"));
        assert!(check("qty * 2 + 1 = 21"));
        assert!(check("price >= 2.5"));
    }

    #[test]
    fn header_identifiers() {
        assert!(check("MsgPriority > 5"));
        assert!(check("MsgDurable = 'DURABLE'"));
        assert!(check("MsgID = 42"));
    }

    #[test]
    fn null_is_unknown() {
        assert!(!check("missing = 1"));
        assert!(!check("NOT (missing = 1)"));
        assert!(check("missing IS NULL"));
        assert!(check("color IS NOT NULL"));
        assert!(check("missing = 1 OR qty = 10"));
        assert!(!check("missing = 1 AND qty = 10"));
    }

    #[test]
    fn in_like_between() {
        assert!(check("color IN ('blue', 'red')"));
        assert!(check("color NOT IN ('blue')"));
        assert!(check("color LIKE 'r_d'"));
        assert!(check("color LIKE 're%'"));
        assert!(!check("color NOT LIKE '%e%'"));
        assert!(check("qty BETWEEN 5 AND 10"));
        assert!(!check("qty NOT BETWEEN 5 AND 10"));
    }

    #[test]
    fn like_escape() {
        let m = Message::new("a", Vec::new()).property("code", "50%_off");
        let f = Filter::parse("code LIKE '50!%!_%' ESCAPE '!'").unwrap();
        assert!(f.matches(&m));
    }

    #[test]
    fn invalid_expressions_are_rejected() {
        for bad in ["color =", "(qty > 1", "qty IN 1", "color = 'open", "qty ! 3"] {
            assert!(
                matches!(Filter::parse(bad), Err(Error::InvalidFilter { .. })),
                "{bad} should not parse"
            );
        }
    }

    #[test]
    fn blank_filter_is_none() {
        assert!(Filter::parse_optional(None).unwrap().is_none());
        assert!(Filter::parse_optional(Some("  ")).unwrap().is_none());
        assert!(Filter::parse_optional(Some("qty = 1")).unwrap().is_some());
    }
}
