//! Tolerant parser for JavaScript object literals as models write them in chart
//! answers: unquoted keys, single-quoted strings, trailing commas, comments.
//! Function values and `new X(...)` expressions are skipped and read as `null`.
//! Nothing is ever evaluated.

use serde_json::{Map, Number, Value};
use thiserror::Error;

const MAX_DEPTH: usize = 128;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message} at offset {offset}")]
pub struct ParseError {
    pub message: String,
    pub offset: usize,
}

pub fn parse(input: &str) -> Result<Value, ParseError> {
    let mut parser = Parser::new(input);
    parser.skip_trivia()?;
    let value = parser.parse_value()?;
    parser.skip_trivia()?;
    if parser.eat(';') {
        parser.skip_trivia()?;
    }
    if !parser.at_end() {
        return Err(parser.error("unexpected trailing input"));
    }
    Ok(value)
}

struct Parser {
    chars: Vec<char>,
    pos: usize,
    depth: usize,
}

impl Parser {
    fn new(input: &str) -> Self {
        Parser {
            chars: input.chars().collect(),
            pos: 0,
            depth: 0,
        }
    }

    fn error(&self, message: impl Into<String>) -> ParseError {
        ParseError {
            message: message.into(),
            offset: self.pos,
        }
    }

    fn at_end(&self) -> bool {
        self.pos >= self.chars.len()
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<char> {
        self.chars.get(self.pos + offset).copied()
    }

    fn bump(&mut self) -> Option<char> {
        let ch = self.peek()?;
        self.pos += 1;
        Some(ch)
    }

    fn eat(&mut self, expected: char) -> bool {
        if self.peek() == Some(expected) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, expected: char) -> Result<(), ParseError> {
        if self.eat(expected) {
            Ok(())
        } else {
            Err(self.error(format!("expected `{expected}`")))
        }
    }

    fn skip_trivia(&mut self) -> Result<(), ParseError> {
        loop {
            match (self.peek(), self.peek_at(1)) {
                (Some(ch), _) if ch.is_whitespace() => self.pos += 1,
                (Some('/'), Some('/')) => {
                    while let Some(ch) = self.bump() {
                        if ch == '\n' {
                            break;
                        }
                    }
                }
                (Some('/'), Some('*')) => {
                    self.pos += 2;
                    loop {
                        match (self.peek(), self.peek_at(1)) {
                            (Some('*'), Some('/')) => {
                                self.pos += 2;
                                break;
                            }
                            (Some(_), _) => self.pos += 1,
                            (None, _) => return Err(self.error("unterminated comment")),
                        }
                    }
                }
                _ => return Ok(()),
            }
        }
    }

    fn parse_value(&mut self) -> Result<Value, ParseError> {
        match self.peek() {
            Some('{') => self.nested(Self::parse_object),
            Some('[') => self.nested(Self::parse_array),
            Some(quote @ ('"' | '\'' | '`')) => self.parse_string(quote).map(Value::String),
            Some('(') => {
                self.skip_arrow_function()?;
                Ok(Value::Null)
            }
            Some(ch) if ch.is_ascii_digit() || matches!(ch, '-' | '+' | '.') => {
                self.parse_number()
            }
            Some(ch) if is_ident_start(ch) => self.parse_keyword(),
            Some(ch) => Err(self.error(format!("unexpected character `{ch}`"))),
            None => Err(self.error("unexpected end of input")),
        }
    }

    fn nested(
        &mut self,
        parse: fn(&mut Self) -> Result<Value, ParseError>,
    ) -> Result<Value, ParseError> {
        if self.depth >= MAX_DEPTH {
            return Err(self.error("nesting too deep"));
        }
        self.depth += 1;
        let value = parse(self);
        self.depth -= 1;
        value
    }

    fn parse_object(&mut self) -> Result<Value, ParseError> {
        self.expect('{')?;
        let mut map = Map::new();
        loop {
            self.skip_trivia()?;
            if self.eat('}') {
                return Ok(Value::Object(map));
            }
            let key = self.parse_key()?;
            self.skip_trivia()?;
            self.expect(':')?;
            self.skip_trivia()?;
            let value = self.parse_value()?;
            map.insert(key, value);
            self.skip_trivia()?;
            if self.eat(',') {
                continue;
            }
            self.skip_trivia()?;
            self.expect('}')?;
            return Ok(Value::Object(map));
        }
    }

    fn parse_key(&mut self) -> Result<String, ParseError> {
        match self.peek() {
            Some(quote @ ('"' | '\'')) => self.parse_string(quote),
            Some(ch) if is_ident_start(ch) => Ok(self.parse_identifier()),
            Some(ch) if ch.is_ascii_digit() => {
                let start = self.pos;
                while self.peek().is_some_and(|c| c.is_ascii_alphanumeric() || c == '.') {
                    self.pos += 1;
                }
                Ok(self.chars[start..self.pos].iter().collect())
            }
            _ => Err(self.error("expected object key")),
        }
    }

    fn parse_array(&mut self) -> Result<Value, ParseError> {
        self.expect('[')?;
        let mut items = Vec::new();
        loop {
            self.skip_trivia()?;
            if self.eat(']') {
                return Ok(Value::Array(items));
            }
            items.push(self.parse_value()?);
            self.skip_trivia()?;
            if self.eat(',') {
                continue;
            }
            self.expect(']')?;
            return Ok(Value::Array(items));
        }
    }

    fn parse_string(&mut self, quote: char) -> Result<String, ParseError> {
        self.expect(quote)?;
        let mut out = String::new();
        loop {
            let ch = self.bump().ok_or_else(|| self.error("unterminated string"))?;
            if ch == quote {
                return Ok(out);
            }
            if quote == '`' && ch == '$' && self.peek() == Some('{') {
                return Err(self.error("template interpolation is not supported"));
            }
            if ch != '\\' {
                if ch == '\n' && quote != '`' {
                    return Err(self.error("newline in string"));
                }
                out.push(ch);
                continue;
            }
            let escaped = self.bump().ok_or_else(|| self.error("unterminated escape"))?;
            match escaped {
                'n' => out.push('\n'),
                't' => out.push('\t'),
                'r' => out.push('\r'),
                'b' => out.push('\u{8}'),
                'f' => out.push('\u{c}'),
                'v' => out.push('\u{b}'),
                '0' => out.push('\0'),
                'u' => out.push(self.parse_hex_escape(4)?),
                'x' => out.push(self.parse_hex_escape(2)?),
                '\n' => {}
                other => out.push(other),
            }
        }
    }

    fn skip_string(&mut self, quote: char) -> Result<(), ParseError> {
        self.expect(quote)?;
        while let Some(ch) = self.bump() {
            if ch == '\\' {
                self.bump();
            } else if ch == quote {
                return Ok(());
            }
        }
        Err(self.error("unterminated string"))
    }

    fn parse_hex_escape(&mut self, digits: usize) -> Result<char, ParseError> {
        let mut code = 0u32;
        for _ in 0..digits {
            let digit = self
                .bump()
                .and_then(|c| c.to_digit(16))
                .ok_or_else(|| self.error("invalid hex escape"))?;
            code = code * 16 + digit;
        }
        Ok(char::from_u32(code).unwrap_or('\u{fffd}'))
    }

    fn parse_number(&mut self) -> Result<Value, ParseError> {
        let start = self.pos;
        let negative = match self.peek() {
            Some('-') => {
                self.pos += 1;
                true
            }
            Some('+') => {
                self.pos += 1;
                false
            }
            _ => false,
        };
        if self.peek().is_some_and(is_ident_start) {
            let word = self.parse_identifier();
            return if word == "Infinity" {
                Ok(Value::Null)
            } else {
                Err(self.error(format!("unexpected identifier `{word}` after sign")))
            };
        }
        if self.peek() == Some('0') && matches!(self.peek_at(1), Some('x' | 'X')) {
            self.pos += 2;
            let digits_start = self.pos;
            while self.peek().is_some_and(|c| c.is_ascii_hexdigit()) {
                self.pos += 1;
            }
            let digits: String = self.chars[digits_start..self.pos].iter().collect();
            let value = i64::from_str_radix(&digits, 16)
                .map_err(|_| self.error("invalid hex number"))?;
            return Ok(Value::Number(Number::from(if negative { -value } else { value })));
        }
        let mut is_float = false;
        while let Some(ch) = self.peek() {
            match ch {
                '0'..='9' => self.pos += 1,
                '.' | 'e' | 'E' => {
                    is_float = true;
                    self.pos += 1;
                }
                '+' | '-' if matches!(self.chars.get(self.pos - 1), Some('e' | 'E')) => {
                    self.pos += 1
                }
                _ => break,
            }
        }
        let literal: String = self.chars[start..self.pos]
            .iter()
            .filter(|c| **c != '+')
            .collect();
        if !is_float && let Ok(int) = literal.parse::<i64>() {
            return Ok(Value::Number(Number::from(int)));
        }
        let float = literal
            .parse::<f64>()
            .map_err(|_| self.error(format!("invalid number `{literal}`")))?;
        Ok(Number::from_f64(float).map(Value::Number).unwrap_or(Value::Null))
    }

    fn parse_identifier(&mut self) -> String {
        let start = self.pos;
        while self.peek().is_some_and(is_ident_continue) {
            self.pos += 1;
        }
        self.chars[start..self.pos].iter().collect()
    }

    fn parse_keyword(&mut self) -> Result<Value, ParseError> {
        let start = self.pos;
        let word = self.parse_identifier();
        match word.as_str() {
            "true" => Ok(Value::Bool(true)),
            "false" => Ok(Value::Bool(false)),
            "null" | "undefined" | "NaN" | "Infinity" => Ok(Value::Null),
            "function" => {
                self.skip_trivia()?;
                if self.peek().is_some_and(is_ident_start) {
                    self.parse_identifier();
                    self.skip_trivia()?;
                }
                self.skip_balanced('(', ')')?;
                self.skip_trivia()?;
                self.skip_balanced('{', '}')?;
                Ok(Value::Null)
            }
            "new" => {
                self.skip_trivia()?;
                self.skip_dotted_path();
                self.skip_trivia()?;
                if self.peek() == Some('(') {
                    self.skip_balanced('(', ')')?;
                }
                Ok(Value::Null)
            }
            _ => {
                self.skip_trivia()?;
                if self.peek() == Some('=') && self.peek_at(1) == Some('>') {
                    self.pos += 2;
                    self.skip_arrow_body()?;
                    return Ok(Value::Null);
                }
                self.pos = start;
                Err(self.error(format!("unsupported identifier `{word}`")))
            }
        }
    }

    fn skip_dotted_path(&mut self) {
        loop {
            self.parse_identifier();
            if self.peek() == Some('.') && self.peek_at(1).is_some_and(is_ident_start) {
                self.pos += 1;
            } else {
                break;
            }
        }
    }

    fn skip_arrow_function(&mut self) -> Result<(), ParseError> {
        self.skip_balanced('(', ')')?;
        self.skip_trivia()?;
        if !(self.eat('=') && self.eat('>')) {
            return Err(self.error("expected arrow function"));
        }
        self.skip_arrow_body()
    }

    fn skip_arrow_body(&mut self) -> Result<(), ParseError> {
        self.skip_trivia()?;
        if self.peek() == Some('{') {
            return self.skip_balanced('{', '}');
        }
        // Expression body: runs until a separator at depth zero.
        let mut depth = 0usize;
        while let Some(ch) = self.peek() {
            match ch {
                '"' | '\'' | '`' => {
                    self.skip_string(ch)?;
                    continue;
                }
                '(' | '[' | '{' => depth += 1,
                ')' | ']' | '}' if depth == 0 => return Ok(()),
                ')' | ']' | '}' => depth -= 1,
                ',' if depth == 0 => return Ok(()),
                _ => {}
            }
            self.pos += 1;
        }
        Ok(())
    }

    fn skip_balanced(&mut self, open: char, close: char) -> Result<(), ParseError> {
        self.expect(open)?;
        let mut depth = 1usize;
        while depth > 0 {
            let ch = self
                .peek()
                .ok_or_else(|| self.error(format!("unbalanced `{open}`")))?;
            match ch {
                '"' | '\'' | '`' => {
                    self.skip_string(ch)?;
                    continue;
                }
                '/' if matches!(self.peek_at(1), Some('/' | '*')) => {
                    self.skip_trivia()?;
                    continue;
                }
                c if c == open => depth += 1,
                c if c == close => depth -= 1,
                _ => {}
            }
            self.pos += 1;
        }
        Ok(())
    }
}

fn is_ident_start(ch: char) -> bool {
    ch.is_alphabetic() || ch == '_' || ch == '$'
}

fn is_ident_continue(ch: char) -> bool {
    ch.is_alphanumeric() || ch == '_' || ch == '$'
}
