//! Expression language used inside templates, `if` gates and assertions.
//!
//! Grammar, lowest precedence first:
//!
//! ```text
//! or         := and ( "||" and )*
//! and        := equality ( "&&" equality )*
//! equality   := comparison ( ( "==" | "!=" ) comparison )*
//! comparison := unary ( ( ">" | "<" | ">=" | "<=" ) unary )*
//! unary      := "!" unary | postfix
//! postfix    := primary ( "." ident | "[" or "]" | ".includes(" or ")" )*
//! primary    := literal | "ctx" | "env" | "(" or ")"
//! ```
//!
//! `||` and `&&` yield the deciding operand, so `env.LIMIT || 10` works as a default.

use std::borrow::Cow;

use serde_json::{Map, Number, Value};

use crate::error::TemplateError;

/// Parsed expression tree.
#[derive(Debug, Clone, PartialEq)]
pub enum Expression {
    Literal(Value),
    Array(Vec<Expression>),
    Object(Vec<(String, Expression)>),
    Root(Root),
    Field(Box<Expression>, String),
    Index(Box<Expression>, Box<Expression>),
    Includes(Box<Expression>, Box<Expression>),
    Not(Box<Expression>),
    Binary(Box<Expression>, BinaryOperator, Box<Expression>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Root {
    Ctx,
    Env,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOperator {
    Or,
    And,
    Equal,
    NotEqual,
    Greater,
    Less,
    GreaterOrEqual,
    LessOrEqual,
}

/// Parses `source` into an [`Expression`].
pub fn parse_expression(source: &str) -> Result<Expression, TemplateError> {
    let tokens = tokenize(source)?;
    let mut parser = Parser {
        source,
        tokens,
        position: 0,
    };
    let expression = parser.parse_or()?;
    if let Some(token) = parser.peek() {
        return Err(parser.malformed(format!("unexpected {token:?} after end of expression")));
    }
    Ok(expression)
}

/// Parses and evaluates `source` against the serialized public context.
pub fn evaluate_expression(source: &str, scope: &Value) -> Result<Value, TemplateError> {
    Ok(parse_expression(source)?.evaluate(scope))
}

impl Expression {
    /// Evaluates the tree. `scope` is the serialized public context.
    pub fn evaluate(&self, scope: &Value) -> Value {
        match self {
            Expression::Literal(value) => value.clone(),
            Expression::Array(items) => Value::Array(items.iter().map(|item| item.evaluate(scope)).collect()),
            Expression::Object(entries) => {
                let mut map = Map::new();
                for (key, expression) in entries {
                    map.insert(key.clone(), expression.evaluate(scope));
                }
                Value::Object(map)
            }
            Expression::Root(_) | Expression::Field(..) | Expression::Index(..) => self.evaluate_path(scope).into_owned(),
            Expression::Includes(target, needle) => Value::Bool(includes(&target.evaluate(scope), &needle.evaluate(scope))),
            Expression::Not(inner) => Value::Bool(!is_truthy(&inner.evaluate(scope))),
            Expression::Binary(left, BinaryOperator::Or, right) => {
                let left = left.evaluate(scope);
                if is_truthy(&left) { left } else { right.evaluate(scope) }
            }
            Expression::Binary(left, BinaryOperator::And, right) => {
                let left = left.evaluate(scope);
                if is_truthy(&left) { right.evaluate(scope) } else { left }
            }
            Expression::Binary(left, operator, right) => {
                let left = left.evaluate(scope);
                let right = right.evaluate(scope);
                Value::Bool(compare(&left, *operator, &right))
            }
        }
    }

    /// Walks path expressions by reference so only the selected leaf is cloned.
    fn evaluate_path<'v>(&self, scope: &'v Value) -> Cow<'v, Value> {
        match self {
            Expression::Root(Root::Ctx) => Cow::Borrowed(scope),
            Expression::Root(Root::Env) => scope.get("env").map_or(Cow::Owned(Value::Null), Cow::Borrowed),
            Expression::Field(target, field) => match target.evaluate_path(scope) {
                Cow::Borrowed(value) => borrow_field(value, field),
                Cow::Owned(value) => Cow::Owned(lookup_field(&value, field)),
            },
            Expression::Index(target, index) => {
                let Some(key) = index_key(&index.evaluate(scope)) else {
                    return Cow::Owned(Value::Null);
                };
                match target.evaluate_path(scope) {
                    Cow::Borrowed(value) => borrow_field(value, &key),
                    Cow::Owned(value) => Cow::Owned(lookup_field(&value, &key)),
                }
            }
            other => Cow::Owned(other.evaluate(scope)),
        }
    }
}

fn borrow_field<'v>(target: &'v Value, field: &str) -> Cow<'v, Value> {
    let borrowed = match target {
        Value::Object(map) => map.get(field),
        Value::Array(values) if field != "length" => field.parse::<usize>().ok().and_then(|index| values.get(index)),
        _ => return Cow::Owned(lookup_field(target, field)),
    };
    borrowed.map_or(Cow::Owned(Value::Null), Cow::Borrowed)
}

fn index_key(index: &Value) -> Option<String> {
    match index {
        Value::String(text) => Some(text.clone()),
        Value::Number(number) => Some(number.to_string()),
        Value::Bool(flag) => Some(flag.to_string()),
        _ => None,
    }
}

/// JavaScript-style truthiness: `null`, `false`, `0` and `""` are falsy.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(flag) => *flag,
        Value::Number(number) => number.as_f64().is_some_and(|n| n != 0.0 && !n.is_nan()),
        Value::String(text) => !text.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

/// Loose equality: numbers compare numerically, numeric strings match numbers.
pub fn loosely_equal(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Number(_), Value::Number(_)) => as_number(left) == as_number(right),
        (Value::Number(_), Value::String(_)) | (Value::String(_), Value::Number(_)) => {
            matches!((as_number(left), as_number(right)), (Some(a), Some(b)) if a == b)
        }
        _ => left == right,
    }
}

fn compare(left: &Value, operator: BinaryOperator, right: &Value) -> bool {
    match operator {
        BinaryOperator::Equal => loosely_equal(left, right),
        BinaryOperator::NotEqual => !loosely_equal(left, right),
        _ => {
            let ordering = match (left, right) {
                (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
                _ => match (as_number(left), as_number(right)) {
                    (Some(a), Some(b)) => a.partial_cmp(&b),
                    _ => None,
                },
            };
            let Some(ordering) = ordering else {
                return false;
            };
            match operator {
                BinaryOperator::Greater => ordering.is_gt(),
                BinaryOperator::Less => ordering.is_lt(),
                BinaryOperator::GreaterOrEqual => ordering.is_ge(),
                BinaryOperator::LessOrEqual => ordering.is_le(),
                _ => false,
            }
        }
    }
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(number) => number.as_f64(),
        Value::String(text) => text.trim().parse::<f64>().ok(),
        Value::Bool(flag) => Some(if *flag { 1.0 } else { 0.0 }),
        Value::Null => Some(0.0),
        _ => None,
    }
}

fn includes(haystack: &Value, needle: &Value) -> bool {
    match haystack {
        Value::Array(values) => values.iter().any(|value| loosely_equal(value, needle)),
        Value::String(text) => match needle {
            Value::String(fragment) => text.contains(fragment.as_str()),
            Value::Null => false,
            other => text.contains(&other.to_string()),
        },
        _ => false,
    }
}

/// Field access; `length` on arrays and strings yields their size.
fn lookup_field(target: &Value, field: &str) -> Value {
    match target {
        Value::Object(map) => map.get(field).cloned().unwrap_or(Value::Null),
        Value::Array(values) if field == "length" => Value::from(values.len()),
        Value::Array(values) => field
            .parse::<usize>()
            .ok()
            .and_then(|index| values.get(index).cloned())
            .unwrap_or(Value::Null),
        Value::String(text) if field == "length" => Value::from(text.chars().count()),
        _ => Value::Null,
    }
}


#[derive(Debug, Clone, PartialEq)]
enum Token {
    Identifier(String),
    Number(Number),
    Text(String),
    Dot,
    Comma,
    Colon,
    OpenParen,
    CloseParen,
    OpenBracket,
    CloseBracket,
    OpenBrace,
    CloseBrace,
    Not,
    Operator(BinaryOperator),
}

fn tokenize(source: &str) -> Result<Vec<Token>, TemplateError> {
    let malformed = |reason: String| TemplateError::Malformed {
        expression: source.to_string(),
        reason,
    };
    let chars: Vec<char> = source.chars().collect();
    let mut tokens = Vec::new();
    let mut index = 0usize;

    while index < chars.len() {
        let character = chars[index];
        let next = chars.get(index + 1).copied();
        match character {
            c if c.is_whitespace() => index += 1,
            '.' => {
                tokens.push(Token::Dot);
                index += 1;
            }
            ',' => {
                tokens.push(Token::Comma);
                index += 1;
            }
            ':' => {
                tokens.push(Token::Colon);
                index += 1;
            }
            '(' => {
                tokens.push(Token::OpenParen);
                index += 1;
            }
            ')' => {
                tokens.push(Token::CloseParen);
                index += 1;
            }
            '[' => {
                tokens.push(Token::OpenBracket);
                index += 1;
            }
            ']' => {
                tokens.push(Token::CloseBracket);
                index += 1;
            }
            '{' => {
                tokens.push(Token::OpenBrace);
                index += 1;
            }
            '}' => {
                tokens.push(Token::CloseBrace);
                index += 1;
            }
            '|' if next == Some('|') => {
                tokens.push(Token::Operator(BinaryOperator::Or));
                index += 2;
            }
            '&' if next == Some('&') => {
                tokens.push(Token::Operator(BinaryOperator::And));
                index += 2;
            }
            '=' if next == Some('=') => {
                tokens.push(Token::Operator(BinaryOperator::Equal));
                index += if chars.get(index + 2) == Some(&'=') { 3 } else { 2 };
            }
            '!' if next == Some('=') => {
                tokens.push(Token::Operator(BinaryOperator::NotEqual));
                index += if chars.get(index + 2) == Some(&'=') { 3 } else { 2 };
            }
            '!' => {
                tokens.push(Token::Not);
                index += 1;
            }
            '>' if next == Some('=') => {
                tokens.push(Token::Operator(BinaryOperator::GreaterOrEqual));
                index += 2;
            }
            '<' if next == Some('=') => {
                tokens.push(Token::Operator(BinaryOperator::LessOrEqual));
                index += 2;
            }
            '>' => {
                tokens.push(Token::Operator(BinaryOperator::Greater));
                index += 1;
            }
            '<' => {
                tokens.push(Token::Operator(BinaryOperator::Less));
                index += 1;
            }
            '"' | '\'' => {
                let (text, consumed) = read_string(&chars[index..]).ok_or_else(|| malformed("unterminated string literal".into()))?;
                tokens.push(Token::Text(text));
                index += consumed;
            }
            c if c.is_ascii_digit() || (c == '-' && next.is_some_and(|n| n.is_ascii_digit())) => {
                let start = index;
                index += 1;
                while index < chars.len() && (chars[index].is_ascii_digit() || matches!(chars[index], '.' | 'e' | 'E' | '+' | '-')) {
                    // A dot not followed by a digit ends the number (`items.0.name` never reaches here).
                    if chars[index] == '.' && !chars.get(index + 1).is_some_and(|n| n.is_ascii_digit()) {
                        break;
                    }
                    if matches!(chars[index], '+' | '-') && !matches!(chars[index - 1], 'e' | 'E') {
                        break;
                    }
                    index += 1;
                }
                let literal: String = chars[start..index].iter().collect();
                match serde_json::from_str::<Value>(&literal) {
                    Ok(Value::Number(number)) => tokens.push(Token::Number(number)),
                    _ => return Err(malformed(format!("invalid number literal '{literal}'"))),
                }
            }
            c if is_identifier_start(c) => {
                let start = index;
                index += 1;
                while index < chars.len() && is_identifier_character(chars[index]) {
                    index += 1;
                }
                tokens.push(Token::Identifier(chars[start..index].iter().collect()));
            }
            other => return Err(malformed(format!("unexpected character '{other}'"))),
        }
    }
    Ok(tokens)
}

fn is_identifier_start(character: char) -> bool {
    character.is_alphabetic() || matches!(character, '_' | '$' | '@')
}

fn is_identifier_character(character: char) -> bool {
    character.is_alphanumeric() || matches!(character, '_' | '$' | '@' | '-')
}

/// Reads a quoted string starting at `chars[0]`. Returns the unescaped text and
/// the number of characters consumed.
fn read_string(chars: &[char]) -> Option<(String, usize)> {
    let quote = *chars.first()?;
    let mut text = String::new();
    let mut index = 1usize;
    while index < chars.len() {
        let character = chars[index];
        if character == quote {
            return Some((text, index + 1));
        }
        if character == '\\' {
            let escaped = *chars.get(index + 1)?;
            match escaped {
                'n' => text.push('\n'),
                't' => text.push('\t'),
                'r' => text.push('\r'),
                'u' => {
                    let hex: String = chars.get(index + 2..index + 6)?.iter().collect();
                    let code = u32::from_str_radix(&hex, 16).ok()?;
                    text.push(char::from_u32(code)?);
                    index += 6;
                    continue;
                }
                other => text.push(other),
            }
            index += 2;
            continue;
        }
        text.push(character);
        index += 1;
    }
    None
}

struct Parser<'a> {
    source: &'a str,
    tokens: Vec<Token>,
    position: usize,
}

impl Parser<'_> {
    fn malformed(&self, reason: String) -> TemplateError {
        TemplateError::Malformed {
            expression: self.source.to_string(),
            reason,
        }
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.position)
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.position).cloned();
        self.position += 1;
        token
    }

    fn expect(&mut self, expected: Token) -> Result<(), TemplateError> {
        match self.advance() {
            Some(token) if token == expected => Ok(()),
            Some(token) => Err(self.malformed(format!("expected {expected:?}, found {token:?}"))),
            None => Err(self.malformed(format!("expected {expected:?}, found end of expression"))),
        }
    }

    fn parse_or(&mut self) -> Result<Expression, TemplateError> {
        self.parse_binary_level(&[BinaryOperator::Or], Self::parse_and)
    }

    fn parse_and(&mut self) -> Result<Expression, TemplateError> {
        self.parse_binary_level(&[BinaryOperator::And], Self::parse_equality)
    }

    fn parse_equality(&mut self) -> Result<Expression, TemplateError> {
        self.parse_binary_level(&[BinaryOperator::Equal, BinaryOperator::NotEqual], Self::parse_comparison)
    }

    fn parse_comparison(&mut self) -> Result<Expression, TemplateError> {
        self.parse_binary_level(
            &[
                BinaryOperator::Greater,
                BinaryOperator::Less,
                BinaryOperator::GreaterOrEqual,
                BinaryOperator::LessOrEqual,
            ],
            Self::parse_unary,
        )
    }

    fn parse_binary_level(
        &mut self,
        operators: &[BinaryOperator],
        next: fn(&mut Self) -> Result<Expression, TemplateError>,
    ) -> Result<Expression, TemplateError> {
        let mut left = next(self)?;
        while let Some(Token::Operator(operator)) = self.peek() {
            let operator = *operator;
            if !operators.contains(&operator) {
                break;
            }
            self.position += 1;
            let right = next(self)?;
            left = Expression::Binary(Box::new(left), operator, Box::new(right));
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expression, TemplateError> {
        if self.peek() == Some(&Token::Not) {
            self.position += 1;
            return Ok(Expression::Not(Box::new(self.parse_unary()?)));
        }
        self.parse_postfix()
    }

    fn parse_postfix(&mut self) -> Result<Expression, TemplateError> {
        let mut expression = self.parse_primary()?;
        loop {
            match self.peek() {
                Some(Token::Dot) => {
                    self.position += 1;
                    let field = match self.advance() {
                        Some(Token::Identifier(name)) => name,
                        Some(Token::Number(number)) => number.to_string(),
                        other => return Err(self.malformed(format!("expected a field name after '.', found {other:?}"))),
                    };
                    if field == "includes" && self.peek() == Some(&Token::OpenParen) {
                        self.position += 1;
                        let needle = self.parse_or()?;
                        self.expect(Token::CloseParen)?;
                        expression = Expression::Includes(Box::new(expression), Box::new(needle));
                    } else {
                        expression = Expression::Field(Box::new(expression), field);
                    }
                }
                Some(Token::OpenBracket) => {
                    self.position += 1;
                    let index = self.parse_or()?;
                    self.expect(Token::CloseBracket)?;
                    expression = Expression::Index(Box::new(expression), Box::new(index));
                }
                _ => return Ok(expression),
            }
        }
    }

    fn parse_primary(&mut self) -> Result<Expression, TemplateError> {
        match self.advance() {
            Some(Token::Number(number)) => Ok(Expression::Literal(Value::Number(number))),
            Some(Token::Text(text)) => Ok(Expression::Literal(Value::String(text))),
            Some(Token::Identifier(name)) => match name.as_str() {
                "true" => Ok(Expression::Literal(Value::Bool(true))),
                "false" => Ok(Expression::Literal(Value::Bool(false))),
                "null" => Ok(Expression::Literal(Value::Null)),
                "ctx" => Ok(Expression::Root(Root::Ctx)),
                "env" => Ok(Expression::Root(Root::Env)),
                _ => Err(TemplateError::UnknownRoot {
                    root: name,
                    expression: self.source.to_string(),
                }),
            },
            Some(Token::OpenParen) => {
                let inner = self.parse_or()?;
                self.expect(Token::CloseParen)?;
                Ok(inner)
            }
            Some(Token::OpenBracket) => {
                let mut items = Vec::new();
                if self.peek() == Some(&Token::CloseBracket) {
                    self.position += 1;
                    return Ok(Expression::Array(items));
                }
                loop {
                    items.push(self.parse_or()?);
                    match self.advance() {
                        Some(Token::Comma) => continue,
                        Some(Token::CloseBracket) => return Ok(Expression::Array(items)),
                        other => return Err(self.malformed(format!("expected ',' or ']' in array literal, found {other:?}"))),
                    }
                }
            }
            Some(Token::OpenBrace) => {
                let mut entries = Vec::new();
                if self.peek() == Some(&Token::CloseBrace) {
                    self.position += 1;
                    return Ok(Expression::Object(entries));
                }
                loop {
                    let key = match self.advance() {
                        Some(Token::Text(key)) | Some(Token::Identifier(key)) => key,
                        other => return Err(self.malformed(format!("expected an object key, found {other:?}"))),
                    };
                    self.expect(Token::Colon)?;
                    entries.push((key, self.parse_or()?));
                    match self.advance() {
                        Some(Token::Comma) => continue,
                        Some(Token::CloseBrace) => return Ok(Expression::Object(entries)),
                        other => return Err(self.malformed(format!("expected ',' or '}}' in object literal, found {other:?}"))),
                    }
                }
            }
            Some(token) => Err(self.malformed(format!("unexpected {token:?}"))),
            None => Err(self.malformed("unexpected end of expression".into())),
        }
    }
}
